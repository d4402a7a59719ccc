use sqlx::{Row, SqlitePool};
use time::OffsetDateTime;

use cloudpaste_core::path;

/// Presentation metadata attached to a virtual directory: header/footer
/// markdown, hide patterns and an optional password gate. Inherited by
/// descendants via nearest-ancestor lookup when `inherit_to_children` set.
#[derive(Debug, Clone, PartialEq)]
pub struct FsMeta {
    pub path: String,
    pub header_md: Option<String>,
    pub footer_md: Option<String>,
    pub hide_patterns: Vec<String>,
    pub inherit_to_children: bool,
    pub password_hash: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

fn row_to_meta(row: &sqlx::sqlite::SqliteRow) -> Result<FsMeta, anyhow::Error> {
    let hide_json = row.get::<Option<String>, _>("hide_patterns");
    let hide_patterns = match hide_json {
        Some(s) => serde_json::from_str(&s)?,
        None => Vec::new(),
    };
    Ok(FsMeta {
        path: row.get::<String, _>("path"),
        header_md: row.get::<Option<String>, _>("header_md"),
        footer_md: row.get::<Option<String>, _>("footer_md"),
        hide_patterns,
        inherit_to_children: row.get::<i64, _>("inherit_to_children") != 0,
        password_hash: row.get::<Option<String>, _>("password_hash"),
        created_at: row.get::<i64, _>("created_at"),
        updated_at: row.get::<i64, _>("updated_at"),
    })
}

const COLUMNS: &str =
    "path, header_md, footer_md, hide_patterns, inherit_to_children, password_hash, created_at, updated_at";

pub async fn upsert_meta(
    db: &SqlitePool,
    meta_path: &str,
    header_md: Option<&str>,
    footer_md: Option<&str>,
    hide_patterns: &[String],
    inherit_to_children: bool,
    password_hash: Option<&str>,
) -> Result<(), anyhow::Error> {
    let normalized = path::normalize(meta_path)?;
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let hide_json = serde_json::to_string(hide_patterns)?;

    sqlx::query(
        r#"
        INSERT INTO fs_meta (path, header_md, footer_md, hide_patterns, inherit_to_children, password_hash, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(path) DO UPDATE SET
          header_md = excluded.header_md,
          footer_md = excluded.footer_md,
          hide_patterns = excluded.hide_patterns,
          inherit_to_children = excluded.inherit_to_children,
          password_hash = excluded.password_hash,
          updated_at = excluded.updated_at
        "#,
    )
    .bind(normalized.trim_end_matches('/'))
    .bind(header_md)
    .bind(footer_md)
    .bind(&hide_json)
    .bind(inherit_to_children as i64)
    .bind(password_hash)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn get_meta(db: &SqlitePool, meta_path: &str) -> Result<Option<FsMeta>, anyhow::Error> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM fs_meta WHERE path = ? LIMIT 1"))
        .bind(meta_path.trim_end_matches('/'))
        .fetch_optional(db)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(row_to_meta(&row)?))
}

/// Nearest-ancestor resolution: the meta at the path itself always applies;
/// an ancestor's meta applies only when it inherits to children.
pub async fn resolve_effective_meta(
    db: &SqlitePool,
    dir_path: &str,
) -> Result<Option<FsMeta>, anyhow::Error> {
    for (depth, ancestor) in path::ancestor_chain(dir_path).into_iter().enumerate() {
        if let Some(meta) = get_meta(db, &ancestor).await?
            && (depth == 0 || meta.inherit_to_children)
        {
            return Ok(Some(meta));
        }
    }
    Ok(None)
}

pub async fn delete_meta(db: &SqlitePool, meta_path: &str) -> Result<bool, anyhow::Error> {
    let result = sqlx::query("DELETE FROM fs_meta WHERE path = ?")
        .bind(meta_path.trim_end_matches('/'))
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn nearest_ancestor_wins_and_inheritance_gates() {
        let pool = db::init_in_memory().await.unwrap();
        upsert_meta(&pool, "/", None, None, &[], true, None).await.unwrap();
        upsert_meta(
            &pool,
            "/docs",
            Some("# Docs"),
            None,
            &["^\\.".to_string()],
            false,
            None,
        )
        .await
        .unwrap();

        // Exact hit applies even without inheritance.
        let direct = resolve_effective_meta(&pool, "/docs").await.unwrap().unwrap();
        assert_eq!(direct.path, "/docs");

        // /docs does not inherit to children, so the root meta applies.
        let child = resolve_effective_meta(&pool, "/docs/sub").await.unwrap().unwrap();
        assert_eq!(child.path, "/");

        // No meta anywhere on the chain.
        delete_meta(&pool, "/").await.unwrap();
        assert!(resolve_effective_meta(&pool, "/elsewhere").await.unwrap().is_none());
    }
}
