use base64::Engine as _;
use rand::Rng;
use sqlx::{Row, SqlitePool};
use time::OffsetDateTime;
use uuid::Uuid;

use cloudpaste_core::Role;
use cloudpaste_core::permission::Permissions;

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    pub secret: String,
    pub permissions: Permissions,
    pub role: Role,
    pub basic_path: String,
    pub is_enable: bool,
    pub expires_at: Option<i64>,
    pub last_used: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

const COLUMNS: &str = "id, name, secret, permissions, role, basic_path, is_enable, expires_at, last_used, created_at, updated_at";

fn row_to_key(row: &sqlx::sqlite::SqliteRow) -> Result<ApiKey, anyhow::Error> {
    Ok(ApiKey {
        id: row.get::<String, _>("id"),
        name: row.get::<String, _>("name"),
        secret: row.get::<String, _>("secret"),
        permissions: row.get::<i64, _>("permissions") as Permissions,
        role: row.get::<String, _>("role").parse()?,
        basic_path: row.get::<String, _>("basic_path"),
        is_enable: row.get::<i64, _>("is_enable") != 0,
        expires_at: row.get::<Option<i64>, _>("expires_at"),
        last_used: row.get::<Option<i64>, _>("last_used"),
        created_at: row.get::<i64, _>("created_at"),
        updated_at: row.get::<i64, _>("updated_at"),
    })
}

pub async fn create_key(
    db: &SqlitePool,
    name: &str,
    role: Role,
    permissions: Permissions,
    basic_path: &str,
    expires_at: Option<i64>,
) -> Result<ApiKey, anyhow::Error> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let id = Uuid::new_v4().to_string();

    let mut bytes = [0_u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    let secret = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);

    sqlx::query(
        r#"
        INSERT INTO api_keys (id, name, secret, permissions, role, basic_path, is_enable, expires_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(name)
    .bind(&secret)
    .bind(permissions as i64)
    .bind(role.as_str())
    .bind(basic_path)
    .bind(expires_at)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    Ok(ApiKey {
        id,
        name: name.to_string(),
        secret,
        permissions,
        role,
        basic_path: basic_path.to_string(),
        is_enable: true,
        expires_at,
        last_used: None,
        created_at: now,
        updated_at: now,
    })
}

/// Authenticate by opaque secret. Disabled and expired keys do not resolve;
/// a successful lookup touches `last_used`.
pub async fn authenticate(db: &SqlitePool, secret: &str) -> Result<Option<ApiKey>, anyhow::Error> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM api_keys WHERE secret = ? AND is_enable = 1 AND (expires_at IS NULL OR expires_at > ?) LIMIT 1"
    ))
    .bind(secret)
    .bind(now)
    .fetch_optional(db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let key = row_to_key(&row)?;

    sqlx::query("UPDATE api_keys SET last_used = ? WHERE id = ?")
        .bind(now)
        .bind(&key.id)
        .execute(db)
        .await?;

    Ok(Some(key))
}

pub async fn get_key(db: &SqlitePool, key_id: &str) -> Result<Option<ApiKey>, anyhow::Error> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM api_keys WHERE id = ? LIMIT 1"))
        .bind(key_id)
        .fetch_optional(db)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(row_to_key(&row)?))
}

pub async fn list_keys(db: &SqlitePool) -> Result<Vec<ApiKey>, anyhow::Error> {
    let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM api_keys ORDER BY created_at ASC"))
        .fetch_all(db)
        .await?;

    let mut keys = Vec::with_capacity(rows.len());
    for row in rows {
        keys.push(row_to_key(&row)?);
    }
    Ok(keys)
}

pub async fn set_key_enabled(
    db: &SqlitePool,
    key_id: &str,
    enabled: bool,
) -> Result<bool, anyhow::Error> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let result = sqlx::query("UPDATE api_keys SET is_enable = ?, updated_at = ? WHERE id = ?")
        .bind(enabled as i64)
        .bind(now)
        .bind(key_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_key(db: &SqlitePool, key_id: &str) -> Result<bool, anyhow::Error> {
    let result = sqlx::query("DELETE FROM api_keys WHERE id = ?")
        .bind(key_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use cloudpaste_core::permission;

    #[tokio::test]
    async fn authenticate_touches_last_used_and_respects_enable() {
        let pool = db::init_in_memory().await.unwrap();
        let key = create_key(
            &pool,
            "ci",
            Role::General,
            permission::MOUNT_VIEW,
            "/team",
            None,
        )
        .await
        .unwrap();
        assert!(key.last_used.is_none());

        let found = authenticate(&pool, &key.secret).await.unwrap().unwrap();
        assert_eq!(found.id, key.id);
        let reread = get_key(&pool, &key.id).await.unwrap().unwrap();
        assert!(reread.last_used.is_some());

        set_key_enabled(&pool, &key.id, false).await.unwrap();
        assert!(authenticate(&pool, &key.secret).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_keys_do_not_authenticate() {
        let pool = db::init_in_memory().await.unwrap();
        let past = OffsetDateTime::now_utc().unix_timestamp() - 10;
        let key = create_key(&pool, "old", Role::Guest, 0, "/", Some(past))
            .await
            .unwrap();
        assert!(authenticate(&pool, &key.secret).await.unwrap().is_none());
    }
}
