use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "cloudpaste", about = "Self-hosted file and paste sharing service")]
pub struct Cli {
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 8787)]
    pub port: u16,

    /// Directory for the database and local state.
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Override the embedded database path (defaults to
    /// `<data_dir>/cloudpaste.db`).
    #[arg(long, env = "TASK_DATABASE_PATH")]
    pub task_database_path: Option<PathBuf>,

    /// Key for encrypting per-driver secret fields in config JSON.
    #[arg(long, env = "ENCRYPTION_SECRET")]
    pub encryption_secret: String,

    /// Task worker pool size (1-10).
    #[arg(long, env = "TASK_WORKER_POOL_SIZE", default_value_t = 2)]
    pub task_worker_pool_size: usize,

    /// Bootstrap admin credentials as `username:password`; only applied
    /// when no admin account exists yet.
    #[arg(long, env = "INITIAL_ADMIN")]
    pub initial_admin: Option<String>,
}

impl Cli {
    pub fn database_path(&self) -> PathBuf {
        self.task_database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("cloudpaste.db"))
    }
}
