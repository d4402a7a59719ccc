use sqlx::{Row, SqlitePool};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub id: String,
    pub name: String,
    pub driver_kind: String,
    /// Driver-private config blob; secret fields are sealed at rest.
    pub config: serde_json::Value,
    pub is_public: bool,
    pub is_default: bool,
    pub quota_bytes: Option<i64>,
    pub admin_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

fn row_to_config(row: &sqlx::sqlite::SqliteRow) -> Result<StorageConfig, anyhow::Error> {
    let config_json = row.get::<String, _>("config_json");
    Ok(StorageConfig {
        id: row.get::<String, _>("id"),
        name: row.get::<String, _>("name"),
        driver_kind: row.get::<String, _>("driver_kind"),
        config: serde_json::from_str(&config_json)?,
        is_public: row.get::<i64, _>("is_public") != 0,
        is_default: row.get::<i64, _>("is_default") != 0,
        quota_bytes: row.get::<Option<i64>, _>("quota_bytes"),
        admin_id: row.get::<Option<String>, _>("admin_id"),
        created_at: row.get::<i64, _>("created_at"),
        updated_at: row.get::<i64, _>("updated_at"),
    })
}

const COLUMNS: &str = "id, name, driver_kind, config_json, is_public, is_default, quota_bytes, admin_id, created_at, updated_at";

pub struct NewStorageConfig<'a> {
    pub name: &'a str,
    pub driver_kind: &'a str,
    pub config: serde_json::Value,
    pub is_public: bool,
    pub is_default: bool,
    pub quota_bytes: Option<i64>,
    pub admin_id: Option<&'a str>,
}

pub async fn create_config(
    db: &SqlitePool,
    new: NewStorageConfig<'_>,
) -> Result<StorageConfig, anyhow::Error> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let id = Uuid::new_v4().to_string();
    let config_json = serde_json::to_string(&new.config)?;

    if new.is_default {
        // The partial unique index enforces one default per owner; demote
        // the previous default instead of surfacing a constraint error.
        sqlx::query("UPDATE storage_configs SET is_default = 0, updated_at = ? WHERE admin_id IS ? AND is_default = 1")
            .bind(now)
            .bind(new.admin_id)
            .execute(db)
            .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO storage_configs (id, name, driver_kind, config_json, is_public, is_default, quota_bytes, admin_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(new.name)
    .bind(new.driver_kind)
    .bind(&config_json)
    .bind(new.is_public as i64)
    .bind(new.is_default as i64)
    .bind(new.quota_bytes)
    .bind(new.admin_id)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    Ok(StorageConfig {
        id,
        name: new.name.to_string(),
        driver_kind: new.driver_kind.to_string(),
        config: new.config,
        is_public: new.is_public,
        is_default: new.is_default,
        quota_bytes: new.quota_bytes,
        admin_id: new.admin_id.map(|s| s.to_string()),
        created_at: now,
        updated_at: now,
    })
}

pub async fn get_config(
    db: &SqlitePool,
    config_id: &str,
) -> Result<Option<StorageConfig>, anyhow::Error> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM storage_configs WHERE id = ? LIMIT 1"
    ))
    .bind(config_id)
    .fetch_optional(db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(row_to_config(&row)?))
}

pub async fn list_configs(db: &SqlitePool) -> Result<Vec<StorageConfig>, anyhow::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM storage_configs ORDER BY created_at ASC"
    ))
    .fetch_all(db)
    .await?;

    let mut configs = Vec::with_capacity(rows.len());
    for row in rows {
        configs.push(row_to_config(&row)?);
    }
    Ok(configs)
}

pub async fn update_config_blob(
    db: &SqlitePool,
    config_id: &str,
    config: &serde_json::Value,
) -> Result<bool, anyhow::Error> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let config_json = serde_json::to_string(config)?;
    let result = sqlx::query("UPDATE storage_configs SET config_json = ?, updated_at = ? WHERE id = ?")
        .bind(&config_json)
        .bind(now)
        .bind(config_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Deleting a config orphans its mounts; callers deactivate mounts first.
pub async fn delete_config(db: &SqlitePool, config_id: &str) -> Result<bool, anyhow::Error> {
    let result = sqlx::query("DELETE FROM storage_configs WHERE id = ?")
        .bind(config_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn default_flag_is_exclusive_per_owner() {
        let pool = db::init_in_memory().await.unwrap();
        crate::admins_repo::create_admin(&pool, "root", "hash").await.unwrap();
        let admin = crate::admins_repo::get_admin_by_username(&pool, "root")
            .await
            .unwrap()
            .unwrap();

        let first = create_config(
            &pool,
            NewStorageConfig {
                name: "a",
                driver_kind: "LOCAL",
                config: serde_json::json!({"root": "/tmp/a"}),
                is_public: false,
                is_default: true,
                quota_bytes: None,
                admin_id: Some(&admin.id),
            },
        )
        .await
        .unwrap();

        let second = create_config(
            &pool,
            NewStorageConfig {
                name: "b",
                driver_kind: "LOCAL",
                config: serde_json::json!({"root": "/tmp/b"}),
                is_public: false,
                is_default: true,
                quota_bytes: None,
                admin_id: Some(&admin.id),
            },
        )
        .await
        .unwrap();

        let first_again = get_config(&pool, &first.id).await.unwrap().unwrap();
        assert!(!first_again.is_default);
        let second_again = get_config(&pool, &second.id).await.unwrap().unwrap();
        assert!(second_again.is_default);
    }
}
