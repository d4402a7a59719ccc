mod config;
mod logging;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cloudpaste_cache::{CacheBus, DirectoryCache};
use cloudpaste_engine::TaskOrchestrator;
use cloudpaste_fs::{FsService, MountResolver};
use cloudpaste_http::AppState;
use cloudpaste_storage::secrets::SecretsCipher;
use cloudpaste_storage::{admins_repo, db, password, upload_sessions_repo};

use crate::config::Cli;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    logging::init();

    tokio::fs::create_dir_all(&cli.data_dir).await?;
    let pool = db::init(&cli.database_path()).await?;
    info!(db = %cli.database_path().display(), "database ready");

    let cipher = SecretsCipher::from_secret(&cli.encryption_secret)?;
    let cache = Arc::new(DirectoryCache::default());
    let bus = Arc::new(CacheBus::new());
    let resolver = MountResolver::new(pool.clone(), cipher);
    let fs = FsService::new(pool.clone(), resolver.clone(), cache.clone(), bus.clone());
    let orchestrator = TaskOrchestrator::new(pool.clone(), fs.clone());

    bootstrap_admin(&pool, cli.initial_admin.as_deref()).await?;

    // Startup sweeps: requeue interrupted jobs, expire stale upload
    // sessions.
    let recovered = orchestrator.recover().await?;
    if recovered > 0 {
        info!(recovered, "requeued interrupted tasks");
    }
    let expired = upload_sessions_repo::expire_stale_sessions(&pool).await?;
    if expired > 0 {
        info!(expired, "expired stale upload sessions");
    }

    let shutdown = CancellationToken::new();
    let workers = orchestrator.spawn_workers(cli.task_worker_pool_size, shutdown.clone());

    let listener_task = tokio::spawn(
        resolver
            .clone()
            .run_bus_listener(bus.clone(), cache.clone()),
    );

    let state = AppState {
        db: pool.clone(),
        fs,
        orchestrator,
        cache,
        bus,
    };
    let app = cloudpaste_http::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await?;

    info!("shutting down");
    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    listener_task.abort();
    pool.close().await;
    Ok(())
}

/// Create the first admin account from `--initial-admin user:pass` when the
/// admins table is empty.
async fn bootstrap_admin(
    pool: &sqlx::SqlitePool,
    initial_admin: Option<&str>,
) -> Result<(), anyhow::Error> {
    let Some(spec) = initial_admin else {
        return Ok(());
    };
    let Some((username, pass)) = spec.split_once(':') else {
        anyhow::bail!("--initial-admin must be username:password");
    };

    if admins_repo::get_admin_by_username(pool, username)
        .await?
        .is_some()
    {
        warn!(username, "initial admin already exists; skipping bootstrap");
        return Ok(());
    }

    let hash = password::hash_password(pass)?;
    admins_repo::create_admin(pool, username, &hash).await?;
    info!(username, "bootstrapped initial admin account");
    Ok(())
}
