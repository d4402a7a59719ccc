use sqlx::{Row, SqlitePool};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Completed,
    Aborted,
    Expired,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
            SessionStatus::Expired => "expired",
            SessionStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "aborted" => Ok(SessionStatus::Aborted),
            "expired" => Ok(SessionStatus::Expired),
            "error" => Ok(SessionStatus::Error),
            other => Err(anyhow::anyhow!("unknown upload session status: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: String,
    pub user_id: Option<String>,
    pub user_type: Option<String>,
    pub mount_id: Option<String>,
    pub fs_path: String,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub fingerprint_algo: Option<String>,
    pub fingerprint_value: Option<String>,
    /// `per_part_url` or `single_session`.
    pub strategy: String,
    pub part_size: Option<i64>,
    pub total_parts: Option<i64>,
    pub parts_uploaded: i64,
    pub bytes_uploaded: i64,
    pub provider_upload_id: Option<String>,
    pub provider_url: Option<String>,
    pub provider_meta: Option<serde_json::Value>,
    pub status: SessionStatus,
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

const COLUMNS: &str = "id, user_id, user_type, mount_id, fs_path, file_size, mime_type, fingerprint_algo, fingerprint_value, strategy, part_size, total_parts, parts_uploaded, bytes_uploaded, provider_upload_id, provider_url, provider_meta, status, expires_at, created_at, updated_at";

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<UploadSession, anyhow::Error> {
    let provider_meta = match row.get::<Option<String>, _>("provider_meta") {
        Some(s) => Some(serde_json::from_str(&s)?),
        None => None,
    };
    Ok(UploadSession {
        id: row.get::<String, _>("id"),
        user_id: row.get::<Option<String>, _>("user_id"),
        user_type: row.get::<Option<String>, _>("user_type"),
        mount_id: row.get::<Option<String>, _>("mount_id"),
        fs_path: row.get::<String, _>("fs_path"),
        file_size: row.get::<Option<i64>, _>("file_size"),
        mime_type: row.get::<Option<String>, _>("mime_type"),
        fingerprint_algo: row.get::<Option<String>, _>("fingerprint_algo"),
        fingerprint_value: row.get::<Option<String>, _>("fingerprint_value"),
        strategy: row.get::<String, _>("strategy"),
        part_size: row.get::<Option<i64>, _>("part_size"),
        total_parts: row.get::<Option<i64>, _>("total_parts"),
        parts_uploaded: row.get::<i64, _>("parts_uploaded"),
        bytes_uploaded: row.get::<i64, _>("bytes_uploaded"),
        provider_upload_id: row.get::<Option<String>, _>("provider_upload_id"),
        provider_url: row.get::<Option<String>, _>("provider_url"),
        provider_meta,
        status: row.get::<String, _>("status").parse()?,
        expires_at: row.get::<Option<i64>, _>("expires_at"),
        created_at: row.get::<i64, _>("created_at"),
        updated_at: row.get::<i64, _>("updated_at"),
    })
}

pub struct NewUploadSession<'a> {
    pub user_id: Option<&'a str>,
    pub user_type: Option<&'a str>,
    pub mount_id: Option<&'a str>,
    pub fs_path: &'a str,
    pub file_size: Option<i64>,
    pub mime_type: Option<&'a str>,
    pub fingerprint_algo: Option<&'a str>,
    pub fingerprint_value: Option<&'a str>,
    pub strategy: &'a str,
    pub part_size: Option<i64>,
    pub total_parts: Option<i64>,
    pub provider_upload_id: Option<&'a str>,
    pub provider_url: Option<&'a str>,
    pub provider_meta: Option<&'a serde_json::Value>,
    pub expires_at: Option<i64>,
}

pub async fn create_session(
    db: &SqlitePool,
    new: NewUploadSession<'_>,
) -> Result<String, anyhow::Error> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let id = Uuid::new_v4().to_string();
    let provider_meta_json = match new.provider_meta {
        Some(v) => Some(serde_json::to_string(v)?),
        None => None,
    };

    sqlx::query(
        r#"
        INSERT INTO upload_sessions (id, user_id, user_type, mount_id, fs_path, file_size, mime_type, fingerprint_algo, fingerprint_value, strategy, part_size, total_parts, provider_upload_id, provider_url, provider_meta, status, expires_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(new.user_id)
    .bind(new.user_type)
    .bind(new.mount_id)
    .bind(new.fs_path)
    .bind(new.file_size)
    .bind(new.mime_type)
    .bind(new.fingerprint_algo)
    .bind(new.fingerprint_value)
    .bind(new.strategy)
    .bind(new.part_size)
    .bind(new.total_parts)
    .bind(new.provider_upload_id)
    .bind(new.provider_url)
    .bind(provider_meta_json)
    .bind(new.expires_at)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    Ok(id)
}

pub async fn get_session(
    db: &SqlitePool,
    session_id: &str,
) -> Result<Option<UploadSession>, anyhow::Error> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM upload_sessions WHERE id = ? LIMIT 1"
    ))
    .bind(session_id)
    .fetch_optional(db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(row_to_session(&row)?))
}

pub async fn record_part_progress(
    db: &SqlitePool,
    session_id: &str,
    parts_uploaded: i64,
    bytes_uploaded: i64,
) -> Result<(), anyhow::Error> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    sqlx::query(
        "UPDATE upload_sessions SET parts_uploaded = ?, bytes_uploaded = ?, updated_at = ? WHERE id = ? AND status = 'active'",
    )
    .bind(parts_uploaded)
    .bind(bytes_uploaded)
    .bind(now)
    .bind(session_id)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn transition_session(
    db: &SqlitePool,
    session_id: &str,
    status: SessionStatus,
) -> Result<bool, anyhow::Error> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let result = sqlx::query(
        "UPDATE upload_sessions SET status = ?, updated_at = ? WHERE id = ? AND status = 'active'",
    )
    .bind(status.as_str())
    .bind(now)
    .bind(session_id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Startup sweep: active sessions past their expiry flip to `expired`.
pub async fn expire_stale_sessions(db: &SqlitePool) -> Result<u64, anyhow::Error> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let result = sqlx::query(
        "UPDATE upload_sessions SET status = 'expired', updated_at = ? WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= ?",
    )
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;
    Ok(result.rows_affected())
}
