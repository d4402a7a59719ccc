use base64::Engine as _;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column as _, Row as _, SqlitePool, TypeInfo as _, ValueRef as _};
use time::OffsetDateTime;
use tracing::info;

use cloudpaste_core::AppError;

use crate::checksum::backup_checksum;
use crate::modules::{ALL_MODULES, ALL_TABLES, expand_modules, module_tables};

pub const BACKUP_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupType {
    Full,
    Modules,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Modules => "modules",
        }
    }
}

impl std::str::FromStr for BackupType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupType::Full),
            "modules" => Ok(BackupType::Modules),
            other => Err(AppError::validation(format!("unknown backup type: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub backup_type: BackupType,
    pub selected_modules: Vec<String>,
}

/// Decode a row into a JSON object using the column's SQLite storage class.
/// Blobs become base64 strings.
pub(crate) fn row_to_json(row: &SqliteRow) -> Result<serde_json::Value, anyhow::Error> {
    let mut object = serde_json::Map::new();
    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index)?;
        let type_name = raw.type_info().name().to_uppercase();

        let value = if raw.is_null() {
            serde_json::Value::Null
        } else {
            match type_name.as_str() {
                "INTEGER" => serde_json::Value::from(row.try_get::<i64, _>(index)?),
                "REAL" => serde_json::Value::from(row.try_get::<f64, _>(index)?),
                "BLOB" => serde_json::Value::String(
                    base64::engine::general_purpose::STANDARD
                        .encode(row.try_get::<Vec<u8>, _>(index)?),
                ),
                _ => serde_json::Value::String(row.try_get::<String, _>(index)?),
            }
        };
        object.insert(column.name().to_string(), value);
    }
    Ok(serde_json::Value::Object(object))
}

async fn export_table(
    db: &SqlitePool,
    table: &str,
) -> Result<Vec<serde_json::Value>, anyhow::Error> {
    // Table names come from the fixed allowlist, never from user input.
    let rows = sqlx::query(&format!("SELECT * FROM {table} ORDER BY rowid"))
        .fetch_all(db)
        .await?;
    rows.iter().map(row_to_json).collect()
}

/// Produce the `{metadata, data}` backup envelope.
pub async fn create_backup(
    db: &SqlitePool,
    opts: &BackupOptions,
) -> Result<serde_json::Value, AppError> {
    let (tables, included_modules, auto_included) = match opts.backup_type {
        BackupType::Full => (
            ALL_TABLES.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
            ALL_MODULES.iter().map(|m| m.to_string()).collect::<Vec<_>>(),
            Vec::new(),
        ),
        BackupType::Modules => {
            if opts.selected_modules.is_empty() {
                return Err(AppError::validation("no backup modules selected"));
            }
            for module in &opts.selected_modules {
                if module_tables(module).is_none() {
                    return Err(AppError::validation(format!("unknown module: {module}")));
                }
            }
            let (included, auto) = expand_modules(&opts.selected_modules);
            let mut tables = Vec::new();
            for module in &included {
                for table in module_tables(module).unwrap_or(&[]) {
                    if !tables.iter().any(|t: &String| t == table) {
                        tables.push((*table).to_string());
                    }
                }
            }
            // Keep the canonical export order of ALL_TABLES.
            tables.sort_by_key(|t| ALL_TABLES.iter().position(|x| x == t));
            (tables, included, auto)
        }
    };

    let mut data = serde_json::Map::new();
    let mut table_counts = serde_json::Map::new();
    let mut total_records = 0_u64;
    for table in &tables {
        let rows = export_table(db, table).await.map_err(AppError::Internal)?;
        total_records += rows.len() as u64;
        table_counts.insert(table.clone(), serde_json::Value::from(rows.len() as u64));
        data.insert(table.clone(), serde_json::Value::Array(rows));
    }

    let data = serde_json::Value::Object(data);
    let checksum = backup_checksum(&data);
    info!(
        backup_type = opts.backup_type.as_str(),
        tables = tables.len(),
        total_records,
        checksum = %checksum,
        "created backup envelope"
    );

    Ok(serde_json::json!({
        "metadata": {
            "version": BACKUP_VERSION,
            "timestamp": OffsetDateTime::now_utc().unix_timestamp(),
            "backup_type": opts.backup_type.as_str(),
            "selected_modules": opts.selected_modules,
            "included_modules": included_modules,
            "auto_included_dependencies": auto_included,
            "tables": table_counts,
            "total_records": total_records,
            "checksum": checksum,
        },
        "data": data,
    }))
}
