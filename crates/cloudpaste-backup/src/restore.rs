use std::collections::BTreeMap;

use serde::Serialize;
use sqlx::{Row as _, SqlitePool};
use time::OffsetDateTime;
use tracing::{info, warn};

use cloudpaste_core::AppError;

use crate::checksum::backup_checksum;
use crate::modules::{ALL_TABLES, dependency_order};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    Overwrite,
    Merge,
}

impl std::str::FromStr for RestoreMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "overwrite" => Ok(RestoreMode::Overwrite),
            "merge" => Ok(RestoreMode::Merge),
            other => Err(AppError::validation(format!("unknown restore mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub mode: RestoreMode,
    /// Rewrite owner columns to this admin. Api keys and admin tokens are
    /// never remapped.
    pub current_admin_id: Option<String>,
    pub skip_integrity_check: bool,
    pub preserve_timestamps: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableOutcome {
    pub success: u64,
    pub ignored: u64,
    pub failed: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct RestoreOutcome {
    pub tables: BTreeMap<String, TableOutcome>,
    /// Referential issues found before the batch (warn-only).
    pub issues: Vec<String>,
}

/// Owner columns rewritten by the admin-id remap. `tagged` columns carry
/// the `"<kind>:<id>"` format.
const REMAP_COLUMNS: &[(&str, &str, bool)] = &[
    ("storage_configs", "admin_id", false),
    ("storage_mounts", "created_by", true),
    ("files", "created_by", true),
    ("pastes", "created_by", true),
];

/// FK columns verified by the pre-restore integrity check.
const INTEGRITY_CHECKS: &[(&str, &str, &str, &str)] = &[
    ("storage_mounts", "storage_config_id", "storage_configs", "id"),
    ("file_passwords", "file_id", "files", "id"),
    ("paste_passwords", "paste_id", "pastes", "id"),
];

fn remap_admin(data: &mut serde_json::Value, admin_id: &str) {
    for (table, column, tagged) in REMAP_COLUMNS {
        let Some(rows) = data.get_mut(*table).and_then(|v| v.as_array_mut()) else {
            continue;
        };
        for row in rows {
            let Some(object) = row.as_object_mut() else {
                continue;
            };
            if object.get(*column).map(|v| v.is_null()).unwrap_or(true) {
                continue;
            }
            let value = if *tagged {
                format!("admin:{admin_id}")
            } else {
                admin_id.to_string()
            };
            object.insert((*column).to_string(), serde_json::Value::String(value));
        }
    }
}

async fn integrity_issues(
    db: &SqlitePool,
    data: &serde_json::Value,
) -> Result<Vec<String>, anyhow::Error> {
    let mut issues = Vec::new();
    for (child, fk_column, parent, parent_column) in INTEGRITY_CHECKS {
        let Some(rows) = data.get(*child).and_then(|v| v.as_array()) else {
            continue;
        };
        for row in rows {
            let Some(fk) = row.get(*fk_column).and_then(|v| v.as_str()) else {
                continue;
            };

            let in_backup = data
                .get(*parent)
                .and_then(|v| v.as_array())
                .map(|rows| {
                    rows.iter()
                        .any(|r| r.get(*parent_column).and_then(|v| v.as_str()) == Some(fk))
                })
                .unwrap_or(false);
            if in_backup {
                continue;
            }

            let in_live = sqlx::query(&format!(
                "SELECT 1 AS present FROM {parent} WHERE {parent_column} = ? LIMIT 1"
            ))
            .bind(fk)
            .fetch_optional(db)
            .await?
            .is_some();
            if !in_live {
                issues.push(format!(
                    "{child}.{fk_column} references missing {parent}.{parent_column} = {fk}"
                ));
            }
        }
    }
    Ok(issues)
}

async fn live_columns(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    table: &str,
) -> Result<Vec<String>, anyhow::Error> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(&mut **tx)
        .await?;
    Ok(rows
        .iter()
        .map(|row| row.get::<String, _>("name"))
        .collect())
}

fn bind_json_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &'q serde_json::Value,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        serde_json::Value::Null => query.bind(Option::<String>::None),
        serde_json::Value::Bool(b) => query.bind(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

/// Restore a backup envelope. The whole batch is one transaction with
/// deferred foreign keys; a catastrophic failure rolls everything back,
/// while per-row statement errors are recorded and the batch continues.
pub async fn restore_backup(
    db: &SqlitePool,
    envelope: &serde_json::Value,
    opts: &RestoreOptions,
) -> Result<RestoreOutcome, AppError> {
    let metadata = envelope
        .get("metadata")
        .and_then(|v| v.as_object())
        .ok_or_else(|| AppError::validation("backup envelope has no metadata"))?;
    let data = envelope
        .get("data")
        .filter(|v| v.is_object())
        .ok_or_else(|| AppError::validation("backup envelope has no data"))?;

    let expected = metadata
        .get("checksum")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::validation("backup metadata has no checksum"))?;
    let actual = backup_checksum(data);
    if expected != actual {
        return Err(AppError::validation(format!(
            "backup checksum mismatch: expected {expected}, computed {actual}"
        )));
    }

    let mut data = data.clone();
    if let Some(admin_id) = &opts.current_admin_id {
        remap_admin(&mut data, admin_id);
    }

    let mut outcome = RestoreOutcome::default();
    if !opts.skip_integrity_check {
        outcome.issues = integrity_issues(db, &data)
            .await
            .map_err(AppError::Internal)?;
        for issue in &outcome.issues {
            warn!(issue = %issue, "backup integrity issue");
        }
    }

    // Only known tables restore, in FK dependency order.
    let tables: Vec<String> = data
        .as_object()
        .map(|map| {
            map.keys()
                .filter(|t| ALL_TABLES.contains(&t.as_str()))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    let ordered = dependency_order(&tables);

    let now = OffsetDateTime::now_utc().unix_timestamp();
    let mut tx = db.begin().await.map_err(|e| AppError::Internal(e.into()))?;
    sqlx::query("PRAGMA defer_foreign_keys = ON")
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

    if opts.mode == RestoreMode::Overwrite {
        for table in ordered.iter().rev() {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::Internal(e.into()))?;
        }
    }

    for table in &ordered {
        let columns = live_columns(&mut tx, table)
            .await
            .map_err(AppError::Internal)?;
        let rows = data.get(table).and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let table_outcome = outcome.tables.entry(table.clone()).or_default();

        for mut row in rows {
            let Some(object) = row.as_object_mut() else {
                table_outcome.failed += 1;
                continue;
            };
            if opts.mode == RestoreMode::Merge
                && !opts.preserve_timestamps
                && object.contains_key("updated_at")
            {
                object.insert("updated_at".to_string(), serde_json::Value::from(now));
            }

            let present: Vec<&String> =
                columns.iter().filter(|c| object.contains_key(*c)).collect();
            if present.is_empty() {
                table_outcome.failed += 1;
                continue;
            }

            let placeholders = vec!["?"; present.len()].join(", ");
            let column_list = present
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let verb = match opts.mode {
                RestoreMode::Overwrite => "INSERT",
                RestoreMode::Merge => "INSERT OR IGNORE",
            };
            let sql = format!("{verb} INTO {table} ({column_list}) VALUES ({placeholders})");

            let mut query = sqlx::query(&sql);
            for column in &present {
                query = bind_json_value(query, &object[*column]);
            }

            match query.execute(&mut *tx).await {
                Ok(result) if result.rows_affected() > 0 => table_outcome.success += 1,
                // INSERT OR IGNORE hit an existing row.
                Ok(_) => table_outcome.ignored += 1,
                Err(error) => {
                    warn!(table = %table, error = %error, "restore row failed");
                    table_outcome.failed += 1;
                }
            }
        }
    }

    // Deferred FK violations surface here and roll the whole batch back.
    tx.commit()
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("restore batch aborted: {e}")))?;

    info!(
        tables = ordered.len(),
        issues = outcome.issues.len(),
        "restore batch committed"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use sqlx::Row as _;

    use cloudpaste_storage::db;
    use cloudpaste_storage::mounts_repo::{self, NewMount, WebdavPolicy};
    use cloudpaste_storage::shares_repo::{self, NewFileShare};
    use cloudpaste_storage::storage_configs_repo::{self, NewStorageConfig};

    use super::*;
    use crate::export::{BackupOptions, BackupType, create_backup};

    async fn seed(pool: &SqlitePool) {
        let admin = cloudpaste_storage::admins_repo::create_admin(pool, "root", "hash")
            .await
            .unwrap();
        let config = storage_configs_repo::create_config(
            pool,
            NewStorageConfig {
                name: "media",
                driver_kind: "S3",
                config: serde_json::json!({"bucket": "media"}),
                is_public: false,
                is_default: true,
                quota_bytes: Some(1 << 30),
                admin_id: Some(&admin.id),
            },
        )
        .await
        .unwrap();
        mounts_repo::create_mount(
            pool,
            NewMount {
                name: "media",
                storage_config_id: &config.id,
                mount_path: "/media",
                web_proxy: false,
                enable_sign: true,
                sign_expires: Some(3600),
                webdav_policy: WebdavPolicy::NativeProxy,
                sort_order: 1,
                cache_ttl: Some(60),
                created_by: Some(&format!("admin:{}", admin.id)),
            },
        )
        .await
        .unwrap();
        for slug in ["one", "two"] {
            shares_repo::create_file_share(
                pool,
                NewFileShare {
                    slug,
                    filename: &format!("{slug}.bin"),
                    mimetype: Some("application/octet-stream"),
                    size: Some(10),
                    remark: None,
                    storage_config_id: Some(&config.id),
                    storage_path: Some(&format!("/media/{slug}.bin")),
                    use_proxy: false,
                    expires_at: None,
                    max_views: None,
                    created_by: Some(&format!("admin:{}", admin.id)),
                },
            )
            .await
            .unwrap();
        }
    }

    async fn dump(pool: &SqlitePool, table: &str) -> Vec<serde_json::Value> {
        let rows = sqlx::query(&format!("SELECT * FROM {table} ORDER BY rowid"))
            .fetch_all(pool)
            .await
            .unwrap();
        rows.iter()
            .map(|r| crate::export::row_to_json(r).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn full_backup_round_trips_into_empty_db() {
        let source = db::init_in_memory().await.unwrap();
        seed(&source).await;

        let envelope = create_backup(
            &source,
            &BackupOptions {
                backup_type: BackupType::Full,
                selected_modules: Vec::new(),
            },
        )
        .await
        .unwrap();

        let checksum = envelope["metadata"]["checksum"].as_str().unwrap().to_string();
        assert_eq!(backup_checksum(&envelope["data"]), checksum);
        assert_eq!(envelope["metadata"]["tables"]["files"], 2);

        let target = db::init_in_memory().await.unwrap();
        let outcome = restore_backup(
            &target,
            &envelope,
            &RestoreOptions {
                mode: RestoreMode::Overwrite,
                current_admin_id: None,
                skip_integrity_check: false,
                preserve_timestamps: true,
            },
        )
        .await
        .unwrap();

        assert!(outcome.issues.is_empty());
        assert_eq!(outcome.tables["files"].success, 2);
        assert_eq!(outcome.tables["files"].failed, 0);

        for table in ["admins", "storage_configs", "storage_mounts", "files"] {
            assert_eq!(
                dump(&source, table).await,
                dump(&target, table).await,
                "{table} must round-trip"
            );
        }

        // Checksum of the restored data matches the original envelope.
        let re_export = create_backup(
            &target,
            &BackupOptions {
                backup_type: BackupType::Full,
                selected_modules: Vec::new(),
            },
        )
        .await
        .unwrap();
        assert_eq!(re_export["metadata"]["checksum"].as_str().unwrap(), checksum);
    }

    #[tokio::test]
    async fn checksum_mismatch_rejects_restore() {
        let source = db::init_in_memory().await.unwrap();
        seed(&source).await;
        let mut envelope = create_backup(
            &source,
            &BackupOptions {
                backup_type: BackupType::Full,
                selected_modules: Vec::new(),
            },
        )
        .await
        .unwrap();

        envelope["data"]["files"][0]["filename"] = serde_json::json!("tampered.bin");

        let target = db::init_in_memory().await.unwrap();
        let err = restore_backup(
            &target,
            &envelope,
            &RestoreOptions {
                mode: RestoreMode::Overwrite,
                current_admin_id: None,
                skip_integrity_check: true,
                preserve_timestamps: true,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[tokio::test]
    async fn merge_mode_ignores_existing_rows_and_remaps_admin() {
        let source = db::init_in_memory().await.unwrap();
        seed(&source).await;
        let envelope = create_backup(
            &source,
            &BackupOptions {
                backup_type: BackupType::Full,
                selected_modules: Vec::new(),
            },
        )
        .await
        .unwrap();

        // Restore twice into the same DB: second pass is all ignores.
        let target = db::init_in_memory().await.unwrap();
        let opts = RestoreOptions {
            mode: RestoreMode::Merge,
            current_admin_id: Some("new-admin".to_string()),
            skip_integrity_check: false,
            preserve_timestamps: false,
        };
        let first = restore_backup(&target, &envelope, &opts).await.unwrap();
        assert_eq!(first.tables["files"].success, 2);
        let second = restore_backup(&target, &envelope, &opts).await.unwrap();
        assert_eq!(second.tables["files"].ignored, 2);
        assert_eq!(second.tables["files"].success, 0);

        let row = sqlx::query("SELECT admin_id FROM storage_configs LIMIT 1")
            .fetch_one(&target)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("admin_id"), "new-admin");
        let row = sqlx::query("SELECT created_by FROM files LIMIT 1")
            .fetch_one(&target)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("created_by"), "admin:new-admin");

        // Api keys are never remapped; the admins table kept its own id.
        let row = sqlx::query("SELECT id FROM admins LIMIT 1")
            .fetch_one(&target)
            .await
            .unwrap();
        assert_ne!(row.get::<String, _>("id"), "new-admin");
    }

    #[tokio::test]
    async fn modules_backup_expands_dependencies() {
        let source = db::init_in_memory().await.unwrap();
        seed(&source).await;

        let envelope = create_backup(
            &source,
            &BackupOptions {
                backup_type: BackupType::Modules,
                selected_modules: vec!["mount_management".to_string()],
            },
        )
        .await
        .unwrap();

        let metadata = &envelope["metadata"];
        assert_eq!(metadata["backup_type"], "modules");
        assert_eq!(
            metadata["auto_included_dependencies"],
            serde_json::json!(["storage_config"])
        );
        assert!(envelope["data"].get("storage_mounts").is_some());
        assert!(envelope["data"].get("storage_configs").is_some());
        assert!(envelope["data"].get("files").is_none());
    }
}
