//! Mount resolution: virtual path → (driver, mount, sub-path).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sqlx::SqlitePool;
use tracing::{debug, warn};

use cloudpaste_cache::{CacheBus, DirectoryCache, InvalidateEvent};
use cloudpaste_core::{AppError, DenyReason, Principal, PrincipalKind};
use cloudpaste_core::path as vpath;
use cloudpaste_driver_api::{DirListing, DriverKind, FileInfo, StorageDriver};
use cloudpaste_storage::mounts_repo::{self, StorageMount};
use cloudpaste_storage::secrets::SecretsCipher;
use cloudpaste_storage::storage_configs_repo::{self, StorageConfig};
use cloudpaste_storage::{acl_repo, fs_meta_repo};

pub struct ResolvedPath {
    pub driver: Arc<dyn StorageDriver>,
    pub mount: StorageMount,
    pub config: StorageConfig,
    /// Path inside the mount; always starts with `/`.
    pub sub_path: String,
}

pub struct MountResolver {
    db: SqlitePool,
    cipher: SecretsCipher,
    /// Driver instances memoized by storage config id. Copy-on-insert; a
    /// cache-bus event for the config clears the memo.
    drivers: Mutex<HashMap<String, Arc<dyn StorageDriver>>>,
}

impl MountResolver {
    pub fn new(db: SqlitePool, cipher: SecretsCipher) -> Arc<Self> {
        Arc::new(Self {
            db,
            cipher,
            drivers: Mutex::new(HashMap::new()),
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    fn memo(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn StorageDriver>>> {
        self.drivers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Find the active mount with the longest mount_path that covers `path`.
    /// `list_active_mounts` orders by length desc, sort_order, created_at,
    /// so the first covering entry wins the tie-breaks.
    pub async fn find_mount(&self, path: &str) -> Result<Option<StorageMount>, AppError> {
        let mounts = mounts_repo::list_active_mounts(&self.db)
            .await
            .map_err(AppError::Internal)?;
        Ok(mounts
            .into_iter()
            .find(|m| vpath::is_ancestor_or_equal(&m.mount_path, path)))
    }

    /// Admission gate: private configs require the api key to be on the
    /// config ACL; guests never see private configs. Admins always pass.
    async fn check_config_access(
        &self,
        config: &StorageConfig,
        principal: &Principal,
    ) -> Result<(), AppError> {
        if config.is_public || principal.is_admin() {
            return Ok(());
        }
        match principal.kind {
            PrincipalKind::ApiKey => {
                let key_id = principal.id.as_deref().unwrap_or_default();
                let admitted = acl_repo::is_admitted(&self.db, key_id, &config.id)
                    .await
                    .map_err(AppError::Internal)?;
                if admitted {
                    Ok(())
                } else {
                    Err(AppError::forbidden(
                        DenyReason::CustomCheck,
                        "storage config is private",
                    ))
                }
            }
            PrincipalKind::Guest => Err(AppError::forbidden(
                DenyReason::CustomCheck,
                "storage config is private",
            )),
            PrincipalKind::Admin => Ok(()),
        }
    }

    async fn driver_for_config(
        &self,
        config: &StorageConfig,
    ) -> Result<Arc<dyn StorageDriver>, AppError> {
        if let Some(driver) = self.memo().get(&config.id).cloned() {
            return Ok(driver);
        }

        let kind: DriverKind = config
            .driver_kind
            .parse()
            .map_err(AppError::Internal)?;
        let mut blob = config.config.clone();
        self.cipher
            .decrypt_config(&config.id, &mut blob)
            .map_err(AppError::Internal)?;

        let driver = cloudpaste_drivers::build_driver(kind, &blob)?;
        driver.initialize().await?;
        debug!(config_id = %config.id, kind = kind.as_str(), "materialized storage driver");

        self.memo().insert(config.id.clone(), driver.clone());
        Ok(driver)
    }

    pub async fn resolve(
        &self,
        path: &str,
        principal: &Principal,
    ) -> Result<ResolvedPath, AppError> {
        let path = vpath::normalize(path).map_err(AppError::Internal)?;
        let Some(mount) = self.find_mount(&path).await? else {
            return Err(AppError::not_found(format!("no mount covers {path}")));
        };

        let config = storage_configs_repo::get_config(&self.db, &mount.storage_config_id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| {
                AppError::not_found(format!("storage config {} missing", mount.storage_config_id))
            })?;

        self.check_config_access(&config, principal).await?;
        let driver = self.driver_for_config(&config).await?;

        let sub_path = vpath::strip_mount_prefix(&mount.mount_path, &path)
            .ok_or_else(|| AppError::not_found(format!("no mount covers {path}")))?;

        Ok(ResolvedPath {
            driver,
            mount,
            config,
            sub_path,
        })
    }

    /// Synthesize a virtual directory for ancestors of mount points: the
    /// items are the next path segment of each active mount below `path`.
    pub async fn virtual_listing(&self, path: &str) -> Result<Option<DirListing>, AppError> {
        let dir = vpath::normalize(path).map_err(AppError::Internal)?;
        let dir = dir.trim_end_matches('/');
        let dir = if dir.is_empty() { "/" } else { dir };

        let mounts = mounts_repo::list_active_mounts(&self.db)
            .await
            .map_err(AppError::Internal)?;

        let mut names: Vec<String> = Vec::new();
        for mount in &mounts {
            if !vpath::is_strict_ancestor(dir, &mount.mount_path) {
                continue;
            }
            let rest = vpath::strip_mount_prefix(dir, &mount.mount_path)
                .unwrap_or_default();
            if let Some(first) = rest.trim_start_matches('/').split('/').next()
                && !first.is_empty()
                && !names.iter().any(|n| n == first)
            {
                names.push(first.to_string());
            }
        }

        if names.is_empty() && dir != "/" {
            return Ok(None);
        }

        names.sort();
        let items = names
            .into_iter()
            .map(|name| FileInfo {
                path: vpath::join(dir, &name),
                name,
                is_directory: true,
                size: None,
                modified: None,
                mimetype: None,
            })
            .collect();
        Ok(Some(DirListing::virtual_dir(dir, items)))
    }

    /// Materialize the driver for a storage config directly, without a
    /// mount. Direct-upload shares store against a config, not a mount.
    pub async fn driver_for_config_id(
        &self,
        config_id: &str,
        principal: &Principal,
    ) -> Result<(Arc<dyn StorageDriver>, StorageConfig), AppError> {
        let config = storage_configs_repo::get_config(&self.db, config_id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::not_found(format!("storage config {config_id} missing")))?;
        self.check_config_access(&config, principal).await?;
        let driver = self.driver_for_config(&config).await?;
        Ok((driver, config))
    }

    /// Seat a pre-built driver instance for a config, bypassing the factory.
    /// Used to embed wrapped or scripted drivers; a cache-bus event for the
    /// config id evicts it like any factory-built instance.
    pub fn prime_driver(&self, config_id: &str, driver: Arc<dyn StorageDriver>) {
        self.memo().insert(config_id.to_string(), driver);
    }

    pub fn invalidate_config(&self, config_id: &str) {
        self.memo().remove(config_id);
    }

    pub fn invalidate_all_drivers(&self) {
        self.memo().clear();
    }

    /// Cache-bus listener: applies config-scoped invalidations (which need
    /// SQL to resolve mounts) and clears driver memos. Listener failures are
    /// logged and swallowed; a faulty event never kills the loop.
    pub async fn run_bus_listener(
        self: Arc<Self>,
        bus: Arc<CacheBus>,
        cache: Arc<DirectoryCache>,
    ) -> Result<(), anyhow::Error> {
        let mut rx = bus.subscribe()?;
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    // Dropped events are a correctness hazard for a cache;
                    // fall back to clearing everything.
                    warn!(skipped, "cache bus listener lagged; clearing directory cache");
                    cache.invalidate_all();
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            };

            if let Err(error) = self.apply_event(&event, &cache).await {
                warn!(error = %error, reason = %event.reason, "cache invalidation listener failed");
            }
        }
    }

    async fn apply_event(
        &self,
        event: &InvalidateEvent,
        cache: &DirectoryCache,
    ) -> Result<(), anyhow::Error> {
        if event.invalidate_all {
            cache.invalidate_all();
            self.invalidate_all_drivers();
            return Ok(());
        }

        if let Some(mount_id) = &event.mount_id {
            apply_mount_paths(cache, mount_id, &event.paths);
        }

        if let Some(config_id) = &event.storage_config_id {
            self.invalidate_config(config_id);
            let mounts = mounts_repo::list_mounts_for_config(&self.db, config_id).await?;
            for mount in mounts {
                apply_mount_paths(cache, &mount.id, &event.paths);
            }
        }

        Ok(())
    }
}

fn apply_mount_paths(cache: &DirectoryCache, mount_id: &str, paths: &[String]) {
    if paths.is_empty() {
        cache.invalidate_mount(mount_id);
    } else {
        for path in paths {
            cache.invalidate_path_and_ancestors(mount_id, path);
        }
    }
}

/// Effective directory-cache TTL for a mount.
pub fn mount_cache_ttl(mount: &StorageMount) -> std::time::Duration {
    mount
        .cache_ttl
        .and_then(|s| u64::try_from(s).ok())
        .map(std::time::Duration::from_secs)
        .unwrap_or(std::time::Duration::from_secs(300))
}

/// Re-exported for facade use.
pub use fs_meta_repo::resolve_effective_meta;

#[cfg(test)]
mod tests {
    use super::*;
    use cloudpaste_storage::db;
    use cloudpaste_storage::mounts_repo::{NewMount, WebdavPolicy};
    use cloudpaste_storage::storage_configs_repo::NewStorageConfig;

    async fn seed(pool: &SqlitePool, mount_path: &str, is_public: bool) -> (String, String) {
        let tmp = std::env::temp_dir().join(format!(
            "cloudpaste-resolver-test-{}",
            cloudpaste_core::ids::epoch_ms()
        ));
        let config = storage_configs_repo::create_config(
            pool,
            NewStorageConfig {
                name: "local",
                driver_kind: "LOCAL",
                config: serde_json::json!({"root": tmp.to_string_lossy()}),
                is_public,
                is_default: false,
                quota_bytes: None,
                admin_id: None,
            },
        )
        .await
        .unwrap();
        let mount = mounts_repo::create_mount(
            pool,
            NewMount {
                name: "m",
                storage_config_id: &config.id,
                mount_path,
                web_proxy: false,
                enable_sign: false,
                sign_expires: None,
                webdav_policy: WebdavPolicy::Redirect302,
                sort_order: 0,
                cache_ttl: None,
                created_by: None,
            },
        )
        .await
        .unwrap();
        (config.id, mount.id)
    }

    #[tokio::test]
    async fn longest_prefix_wins() {
        let pool = db::init_in_memory().await.unwrap();
        let cipher = SecretsCipher::from_secret("test").unwrap();
        seed(&pool, "/data", true).await;
        seed(&pool, "/archive", true).await;
        let resolver = MountResolver::new(pool, cipher);

        let resolved = resolver
            .resolve("/data/sub/file.txt", &Principal::guest())
            .await
            .unwrap();
        assert_eq!(resolved.mount.mount_path, "/data");
        assert_eq!(resolved.sub_path, "/sub/file.txt");

        let err = match resolver.resolve("/elsewhere/x", &Principal::guest()).await {
            Err(e) => e,
            Ok(_) => panic!("expected resolve to fail"),
        };
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn private_config_requires_acl() {
        let pool = db::init_in_memory().await.unwrap();
        let cipher = SecretsCipher::from_secret("test").unwrap();
        let (config_id, _) = seed(&pool, "/vault", false).await;

        let key = cloudpaste_storage::api_keys_repo::create_key(
            &pool,
            "k",
            cloudpaste_core::Role::General,
            cloudpaste_core::permission::MOUNT_VIEW,
            "/",
            None,
        )
        .await
        .unwrap();

        let resolver = MountResolver::new(pool.clone(), cipher);
        let principal = Principal::api_key(
            key.id.clone(),
            "k",
            cloudpaste_core::Role::General,
            key.permissions,
            "/",
        );

        let err = match resolver.resolve("/vault/x", &principal).await {
            Err(e) => e,
            Ok(_) => panic!("expected resolve to fail"),
        };
        assert!(matches!(
            err,
            AppError::Forbidden {
                reason: DenyReason::CustomCheck,
                ..
            }
        ));

        acl_repo::grant(&pool, &key.id, &config_id).await.unwrap();
        assert!(resolver.resolve("/vault/x", &principal).await.is_ok());

        // Admins bypass the ACL.
        assert!(
            resolver
                .resolve("/vault/x", &Principal::admin("a1", "root"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn virtual_listing_synthesizes_mount_ancestors() {
        let pool = db::init_in_memory().await.unwrap();
        let cipher = SecretsCipher::from_secret("test").unwrap();
        seed(&pool, "/team/docs", true).await;
        seed(&pool, "/team/media", true).await;
        let resolver = MountResolver::new(pool, cipher);

        let root = resolver.virtual_listing("/").await.unwrap().unwrap();
        assert!(root.is_virtual);
        assert_eq!(root.items.len(), 1);
        assert_eq!(root.items[0].name, "team");

        let team = resolver.virtual_listing("/team").await.unwrap().unwrap();
        let names: Vec<&str> = team.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "media"]);

        assert!(resolver.virtual_listing("/nope").await.unwrap().is_none());
    }
}
