use sqlx::SqlitePool;
use time::OffsetDateTime;

/// Admit an api key to a private storage config.
pub async fn grant(
    db: &SqlitePool,
    api_key_id: &str,
    storage_config_id: &str,
) -> Result<(), anyhow::Error> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    sqlx::query(
        "INSERT OR IGNORE INTO principal_storage_acl (api_key_id, storage_config_id, created_at) VALUES (?, ?, ?)",
    )
    .bind(api_key_id)
    .bind(storage_config_id)
    .bind(now)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn revoke(
    db: &SqlitePool,
    api_key_id: &str,
    storage_config_id: &str,
) -> Result<bool, anyhow::Error> {
    let result = sqlx::query(
        "DELETE FROM principal_storage_acl WHERE api_key_id = ? AND storage_config_id = ?",
    )
    .bind(api_key_id)
    .bind(storage_config_id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn is_admitted(
    db: &SqlitePool,
    api_key_id: &str,
    storage_config_id: &str,
) -> Result<bool, anyhow::Error> {
    let row = sqlx::query(
        "SELECT 1 AS present FROM principal_storage_acl WHERE api_key_id = ? AND storage_config_id = ? LIMIT 1",
    )
    .bind(api_key_id)
    .bind(storage_config_id)
    .fetch_optional(db)
    .await?;
    Ok(row.is_some())
}
