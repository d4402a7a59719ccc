use base64::Engine as _;
use rand::Rng;
use sqlx::{Row, SqlitePool};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Admin {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct AdminToken {
    pub token: String,
    pub admin_id: String,
    pub created_at: i64,
    pub expires_at: i64,
}

const TOKEN_TTL_DAYS: i64 = 7;

pub async fn create_admin(
    db: &SqlitePool,
    username: &str,
    password_hash: &str,
) -> Result<Admin, anyhow::Error> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let id = Uuid::new_v4().to_string();

    sqlx::query(
        "INSERT INTO admins (id, username, password_hash, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(username)
    .bind(password_hash)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    Ok(Admin {
        id,
        username: username.to_string(),
        password_hash: password_hash.to_string(),
        created_at: now,
        updated_at: now,
    })
}

pub async fn get_admin_by_username(
    db: &SqlitePool,
    username: &str,
) -> Result<Option<Admin>, anyhow::Error> {
    let row = sqlx::query(
        "SELECT id, username, password_hash, created_at, updated_at FROM admins WHERE username = ? LIMIT 1",
    )
    .bind(username)
    .fetch_optional(db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(Admin {
        id: row.get::<String, _>("id"),
        username: row.get::<String, _>("username"),
        password_hash: row.get::<String, _>("password_hash"),
        created_at: row.get::<i64, _>("created_at"),
        updated_at: row.get::<i64, _>("updated_at"),
    }))
}

pub async fn issue_token(db: &SqlitePool, admin_id: &str) -> Result<AdminToken, anyhow::Error> {
    let now = OffsetDateTime::now_utc();
    let created_at = now.unix_timestamp();
    let expires_at = (now + Duration::days(TOKEN_TTL_DAYS)).unix_timestamp();
    let token = random_token_b64_urlsafe(32);

    sqlx::query(
        "INSERT INTO admin_tokens (token, admin_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&token)
    .bind(admin_id)
    .bind(created_at)
    .bind(expires_at)
    .execute(db)
    .await?;

    Ok(AdminToken {
        token,
        admin_id: admin_id.to_string(),
        created_at,
        expires_at,
    })
}

/// Resolve a bearer token to its admin, skipping expired tokens.
pub async fn get_admin_by_token(
    db: &SqlitePool,
    token: &str,
) -> Result<Option<Admin>, anyhow::Error> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let row = sqlx::query(
        r#"
        SELECT a.id, a.username, a.password_hash, a.created_at, a.updated_at
        FROM admin_tokens t JOIN admins a ON a.id = t.admin_id
        WHERE t.token = ? AND t.expires_at > ?
        LIMIT 1
        "#,
    )
    .bind(token)
    .bind(now)
    .fetch_optional(db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(Admin {
        id: row.get::<String, _>("id"),
        username: row.get::<String, _>("username"),
        password_hash: row.get::<String, _>("password_hash"),
        created_at: row.get::<i64, _>("created_at"),
        updated_at: row.get::<i64, _>("updated_at"),
    }))
}

pub async fn revoke_token(db: &SqlitePool, token: &str) -> Result<(), anyhow::Error> {
    sqlx::query("DELETE FROM admin_tokens WHERE token = ?")
        .bind(token)
        .execute(db)
        .await?;
    Ok(())
}

fn random_token_b64_urlsafe(size: usize) -> String {
    let mut bytes = vec![0_u8; size];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn token_round_trip_and_revoke() {
        let pool = db::init_in_memory().await.unwrap();
        let admin = create_admin(&pool, "root", "hash").await.unwrap();

        let token = issue_token(&pool, &admin.id).await.unwrap();
        let found = get_admin_by_token(&pool, &token.token).await.unwrap().unwrap();
        assert_eq!(found.id, admin.id);

        revoke_token(&pool, &token.token).await.unwrap();
        assert!(get_admin_by_token(&pool, &token.token).await.unwrap().is_none());
    }
}
