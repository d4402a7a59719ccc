use sqlx::{Row, SqlitePool};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct FileShare {
    pub id: String,
    pub slug: String,
    pub filename: String,
    pub mimetype: Option<String>,
    pub size: Option<i64>,
    pub remark: Option<String>,
    pub storage_config_id: Option<String>,
    pub storage_path: Option<String>,
    pub use_proxy: bool,
    pub expires_at: Option<i64>,
    pub max_views: Option<i64>,
    pub views: i64,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

const FILE_COLUMNS: &str = "id, slug, filename, mimetype, size, remark, storage_config_id, storage_path, use_proxy, expires_at, max_views, views, created_by, created_at, updated_at";

fn row_to_file(row: &sqlx::sqlite::SqliteRow) -> FileShare {
    FileShare {
        id: row.get::<String, _>("id"),
        slug: row.get::<String, _>("slug"),
        filename: row.get::<String, _>("filename"),
        mimetype: row.get::<Option<String>, _>("mimetype"),
        size: row.get::<Option<i64>, _>("size"),
        remark: row.get::<Option<String>, _>("remark"),
        storage_config_id: row.get::<Option<String>, _>("storage_config_id"),
        storage_path: row.get::<Option<String>, _>("storage_path"),
        use_proxy: row.get::<i64, _>("use_proxy") != 0,
        expires_at: row.get::<Option<i64>, _>("expires_at"),
        max_views: row.get::<Option<i64>, _>("max_views"),
        views: row.get::<i64, _>("views"),
        created_by: row.get::<Option<String>, _>("created_by"),
        created_at: row.get::<i64, _>("created_at"),
        updated_at: row.get::<i64, _>("updated_at"),
    }
}

pub struct NewFileShare<'a> {
    pub slug: &'a str,
    pub filename: &'a str,
    pub mimetype: Option<&'a str>,
    pub size: Option<i64>,
    pub remark: Option<&'a str>,
    pub storage_config_id: Option<&'a str>,
    pub storage_path: Option<&'a str>,
    pub use_proxy: bool,
    pub expires_at: Option<i64>,
    pub max_views: Option<i64>,
    pub created_by: Option<&'a str>,
}

pub async fn create_file_share(
    db: &SqlitePool,
    new: NewFileShare<'_>,
) -> Result<FileShare, anyhow::Error> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let id = Uuid::new_v4().to_string();

    sqlx::query(
        r#"
        INSERT INTO files (id, slug, filename, mimetype, size, remark, storage_config_id, storage_path, use_proxy, expires_at, max_views, created_by, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(new.slug)
    .bind(new.filename)
    .bind(new.mimetype)
    .bind(new.size)
    .bind(new.remark)
    .bind(new.storage_config_id)
    .bind(new.storage_path)
    .bind(new.use_proxy as i64)
    .bind(new.expires_at)
    .bind(new.max_views)
    .bind(new.created_by)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    Ok(FileShare {
        id,
        slug: new.slug.to_string(),
        filename: new.filename.to_string(),
        mimetype: new.mimetype.map(|s| s.to_string()),
        size: new.size,
        remark: new.remark.map(|s| s.to_string()),
        storage_config_id: new.storage_config_id.map(|s| s.to_string()),
        storage_path: new.storage_path.map(|s| s.to_string()),
        use_proxy: new.use_proxy,
        expires_at: new.expires_at,
        max_views: new.max_views,
        views: 0,
        created_by: new.created_by.map(|s| s.to_string()),
        created_at: now,
        updated_at: now,
    })
}

pub async fn slug_exists(db: &SqlitePool, slug: &str) -> Result<bool, anyhow::Error> {
    let row = sqlx::query("SELECT 1 AS present FROM files WHERE slug = ? UNION SELECT 1 FROM pastes WHERE slug = ? LIMIT 1")
        .bind(slug)
        .bind(slug)
        .fetch_optional(db)
        .await?;
    Ok(row.is_some())
}

pub async fn get_file_by_slug(
    db: &SqlitePool,
    slug: &str,
) -> Result<Option<FileShare>, anyhow::Error> {
    let row = sqlx::query(&format!("SELECT {FILE_COLUMNS} FROM files WHERE slug = ? LIMIT 1"))
        .bind(slug)
        .fetch_optional(db)
        .await?;
    Ok(row.map(|r| row_to_file(&r)))
}

/// Count a view. Returns the updated share, or None once the share is gone,
/// expired or over its view cap.
pub async fn register_view(db: &SqlitePool, slug: &str) -> Result<Option<FileShare>, anyhow::Error> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let result = sqlx::query(
        r#"
        UPDATE files SET views = views + 1, updated_at = ?
        WHERE slug = ?
          AND (expires_at IS NULL OR expires_at > ?)
          AND (max_views IS NULL OR views < max_views)
        "#,
    )
    .bind(now)
    .bind(slug)
    .bind(now)
    .execute(db)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    get_file_by_slug(db, slug).await
}

/// Store the share password: salted hash for verification plus the
/// plaintext copy shown back to the creator.
pub async fn set_file_password(
    db: &SqlitePool,
    file_id: &str,
    password_hash: &str,
    plain_password: &str,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        "INSERT INTO file_passwords (file_id, password_hash, plain_password) VALUES (?, ?, ?)
         ON CONFLICT(file_id) DO UPDATE SET password_hash = excluded.password_hash, plain_password = excluded.plain_password",
    )
    .bind(file_id)
    .bind(password_hash)
    .bind(plain_password)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn get_file_password_hash(
    db: &SqlitePool,
    file_id: &str,
) -> Result<Option<String>, anyhow::Error> {
    let row = sqlx::query("SELECT password_hash FROM file_passwords WHERE file_id = ? LIMIT 1")
        .bind(file_id)
        .fetch_optional(db)
        .await?;
    Ok(row.map(|r| r.get::<String, _>("password_hash")))
}

pub async fn delete_file_share(db: &SqlitePool, file_id: &str) -> Result<bool, anyhow::Error> {
    let result = sqlx::query("DELETE FROM files WHERE id = ?")
        .bind(file_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn share<'a>(slug: &'a str) -> NewFileShare<'a> {
        NewFileShare {
            slug,
            filename: "report.pdf",
            mimetype: Some("application/pdf"),
            size: Some(1024),
            remark: None,
            storage_config_id: None,
            storage_path: Some("/uploads/report.pdf"),
            use_proxy: false,
            expires_at: None,
            max_views: Some(2),
            created_by: Some("admin:a1"),
        }
    }

    #[tokio::test]
    async fn view_cap_exhausts_share() {
        let pool = db::init_in_memory().await.unwrap();
        create_file_share(&pool, share("abc123")).await.unwrap();

        assert!(register_view(&pool, "abc123").await.unwrap().is_some());
        let second = register_view(&pool, "abc123").await.unwrap().unwrap();
        assert_eq!(second.views, 2);
        assert!(register_view(&pool, "abc123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn slug_collision_detected() {
        let pool = db::init_in_memory().await.unwrap();
        create_file_share(&pool, share("abc123")).await.unwrap();
        assert!(slug_exists(&pool, "abc123").await.unwrap());
        assert!(!slug_exists(&pool, "other").await.unwrap());
        assert!(create_file_share(&pool, share("abc123")).await.is_err());
    }
}
