use sqlx::{Row, SqlitePool};
use time::OffsetDateTime;
use uuid::Uuid;

use cloudpaste_core::path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebdavPolicy {
    Redirect302,
    UseProxyUrl,
    NativeProxy,
}

impl WebdavPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebdavPolicy::Redirect302 => "302_redirect",
            WebdavPolicy::UseProxyUrl => "use_proxy_url",
            WebdavPolicy::NativeProxy => "native_proxy",
        }
    }
}

impl std::str::FromStr for WebdavPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "302_redirect" => Ok(WebdavPolicy::Redirect302),
            "use_proxy_url" => Ok(WebdavPolicy::UseProxyUrl),
            "native_proxy" => Ok(WebdavPolicy::NativeProxy),
            other => Err(anyhow::anyhow!("unknown webdav policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageMount {
    pub id: String,
    pub name: String,
    pub storage_config_id: String,
    pub mount_path: String,
    pub is_active: bool,
    pub web_proxy: bool,
    pub enable_sign: bool,
    pub sign_expires: Option<i64>,
    pub webdav_policy: WebdavPolicy,
    pub sort_order: i64,
    /// Directory-cache TTL override in seconds.
    pub cache_ttl: Option<i64>,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

const COLUMNS: &str = "id, name, storage_config_id, mount_path, is_active, web_proxy, enable_sign, sign_expires, webdav_policy, sort_order, cache_ttl, created_by, created_at, updated_at";

fn row_to_mount(row: &sqlx::sqlite::SqliteRow) -> Result<StorageMount, anyhow::Error> {
    Ok(StorageMount {
        id: row.get::<String, _>("id"),
        name: row.get::<String, _>("name"),
        storage_config_id: row.get::<String, _>("storage_config_id"),
        mount_path: row.get::<String, _>("mount_path"),
        is_active: row.get::<i64, _>("is_active") != 0,
        web_proxy: row.get::<i64, _>("web_proxy") != 0,
        enable_sign: row.get::<i64, _>("enable_sign") != 0,
        sign_expires: row.get::<Option<i64>, _>("sign_expires"),
        webdav_policy: row.get::<String, _>("webdav_policy").parse()?,
        sort_order: row.get::<i64, _>("sort_order"),
        cache_ttl: row.get::<Option<i64>, _>("cache_ttl"),
        created_by: row.get::<Option<String>, _>("created_by"),
        created_at: row.get::<i64, _>("created_at"),
        updated_at: row.get::<i64, _>("updated_at"),
    })
}

pub struct NewMount<'a> {
    pub name: &'a str,
    pub storage_config_id: &'a str,
    pub mount_path: &'a str,
    pub web_proxy: bool,
    pub enable_sign: bool,
    pub sign_expires: Option<i64>,
    pub webdav_policy: WebdavPolicy,
    pub sort_order: i64,
    pub cache_ttl: Option<i64>,
    pub created_by: Option<&'a str>,
}

/// Reject mount paths that duplicate or nest inside an active mount (in
/// either direction); resolution over nested active mounts is undefined.
async fn ensure_no_nesting(
    db: &SqlitePool,
    mount_path: &str,
    exclude_id: Option<&str>,
) -> Result<(), anyhow::Error> {
    let active = list_active_mounts(db).await?;
    for other in active {
        if exclude_id == Some(other.id.as_str()) {
            continue;
        }
        if path::is_ancestor_or_equal(&other.mount_path, mount_path)
            || path::is_ancestor_or_equal(mount_path, &other.mount_path)
        {
            return Err(anyhow::anyhow!(
                "mount path {mount_path} conflicts with active mount {}",
                other.mount_path
            ));
        }
    }
    Ok(())
}

pub async fn create_mount(
    db: &SqlitePool,
    new: NewMount<'_>,
) -> Result<StorageMount, anyhow::Error> {
    let mount_path = path::normalize(new.mount_path)?;
    let mount_path = mount_path.trim_end_matches('/');
    let mount_path = if mount_path.is_empty() { "/" } else { mount_path };
    ensure_no_nesting(db, mount_path, None).await?;

    let now = OffsetDateTime::now_utc().unix_timestamp();
    let id = Uuid::new_v4().to_string();

    sqlx::query(
        r#"
        INSERT INTO storage_mounts (id, name, storage_config_id, mount_path, is_active, web_proxy, enable_sign, sign_expires, webdav_policy, sort_order, cache_ttl, created_by, created_at, updated_at)
        VALUES (?, ?, ?, ?, 1, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(new.name)
    .bind(new.storage_config_id)
    .bind(mount_path)
    .bind(new.web_proxy as i64)
    .bind(new.enable_sign as i64)
    .bind(new.sign_expires)
    .bind(new.webdav_policy.as_str())
    .bind(new.sort_order)
    .bind(new.cache_ttl)
    .bind(new.created_by)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    Ok(StorageMount {
        id,
        name: new.name.to_string(),
        storage_config_id: new.storage_config_id.to_string(),
        mount_path: mount_path.to_string(),
        is_active: true,
        web_proxy: new.web_proxy,
        enable_sign: new.enable_sign,
        sign_expires: new.sign_expires,
        webdav_policy: new.webdav_policy,
        sort_order: new.sort_order,
        cache_ttl: new.cache_ttl,
        created_by: new.created_by.map(|s| s.to_string()),
        created_at: now,
        updated_at: now,
    })
}

pub async fn get_mount(db: &SqlitePool, mount_id: &str) -> Result<Option<StorageMount>, anyhow::Error> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM storage_mounts WHERE id = ? LIMIT 1"
    ))
    .bind(mount_id)
    .fetch_optional(db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(row_to_mount(&row)?))
}

/// Active mounts ordered for longest-prefix resolution tie-breaking:
/// longer paths first, then lower sort_order, then earlier created_at.
pub async fn list_active_mounts(db: &SqlitePool) -> Result<Vec<StorageMount>, anyhow::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM storage_mounts WHERE is_active = 1 ORDER BY length(mount_path) DESC, sort_order ASC, created_at ASC"
    ))
    .fetch_all(db)
    .await?;

    let mut mounts = Vec::with_capacity(rows.len());
    for row in rows {
        mounts.push(row_to_mount(&row)?);
    }
    Ok(mounts)
}

pub async fn list_mounts_for_config(
    db: &SqlitePool,
    storage_config_id: &str,
) -> Result<Vec<StorageMount>, anyhow::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM storage_mounts WHERE storage_config_id = ? ORDER BY created_at ASC"
    ))
    .bind(storage_config_id)
    .fetch_all(db)
    .await?;

    let mut mounts = Vec::with_capacity(rows.len());
    for row in rows {
        mounts.push(row_to_mount(&row)?);
    }
    Ok(mounts)
}

pub async fn set_mount_active(
    db: &SqlitePool,
    mount_id: &str,
    active: bool,
) -> Result<bool, anyhow::Error> {
    if active {
        let Some(mount) = get_mount(db, mount_id).await? else {
            return Ok(false);
        };
        ensure_no_nesting(db, &mount.mount_path, Some(mount_id)).await?;
    }
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let result = sqlx::query("UPDATE storage_mounts SET is_active = ?, updated_at = ? WHERE id = ?")
        .bind(active as i64)
        .bind(now)
        .bind(mount_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_mount(db: &SqlitePool, mount_id: &str) -> Result<bool, anyhow::Error> {
    let result = sqlx::query("DELETE FROM storage_mounts WHERE id = ?")
        .bind(mount_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::storage_configs_repo::{self, NewStorageConfig};

    async fn seed_config(pool: &SqlitePool) -> String {
        storage_configs_repo::create_config(
            pool,
            NewStorageConfig {
                name: "local",
                driver_kind: "LOCAL",
                config: serde_json::json!({"root": "/tmp"}),
                is_public: true,
                is_default: false,
                quota_bytes: None,
                admin_id: None,
            },
        )
        .await
        .unwrap()
        .id
    }

    fn new_mount<'a>(config_id: &'a str, mount_path: &'a str) -> NewMount<'a> {
        NewMount {
            name: "m",
            storage_config_id: config_id,
            mount_path,
            web_proxy: false,
            enable_sign: false,
            sign_expires: None,
            webdav_policy: WebdavPolicy::Redirect302,
            sort_order: 0,
            cache_ttl: None,
            created_by: None,
        }
    }

    #[tokio::test]
    async fn nested_active_mounts_rejected() {
        let pool = db::init_in_memory().await.unwrap();
        let config_id = seed_config(&pool).await;

        create_mount(&pool, new_mount(&config_id, "/data")).await.unwrap();
        assert!(create_mount(&pool, new_mount(&config_id, "/data/sub")).await.is_err());
        assert!(create_mount(&pool, new_mount(&config_id, "/data")).await.is_err());
        // Siblings are fine.
        create_mount(&pool, new_mount(&config_id, "/other")).await.unwrap();
    }

    #[tokio::test]
    async fn deactivated_mount_frees_its_path() {
        let pool = db::init_in_memory().await.unwrap();
        let config_id = seed_config(&pool).await;

        let first = create_mount(&pool, new_mount(&config_id, "/data")).await.unwrap();
        set_mount_active(&pool, &first.id, false).await.unwrap();
        create_mount(&pool, new_mount(&config_id, "/data/sub")).await.unwrap();
        // Reactivating now nests inside /data/sub.
        assert!(set_mount_active(&pool, &first.id, true).await.is_err());
    }
}
