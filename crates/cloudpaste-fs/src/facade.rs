//! Filesystem facade: authorization, mount resolution, driver dispatch,
//! fs_meta overlay and cache invalidation composed behind one service.

use std::sync::Arc;

use futures_util::StreamExt as _;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::warn;

use cloudpaste_cache::{CacheBus, DirectoryCache, InvalidateEvent};
use cloudpaste_core::authorize::authorize;
use cloudpaste_core::policy::{self, AuthzContext};
use cloudpaste_core::{AppError, Principal};
use cloudpaste_core::path as vpath;
use cloudpaste_driver_api::{
    BatchRemoveResult, ByteStream, Capability, CopyOptions, CopyOutcome, CopyStatus,
    CrossStoragePlan, FileInfo, ListOptions, ProgressFn, StreamDescriptor, UploadOptions,
    UploadSource, require_capability,
};
use cloudpaste_storage::fs_meta_repo;

use crate::resolver::{MountResolver, ResolvedPath, mount_cache_ttl};
use crate::streaming::{RangeReader, StreamRequest, open_range_reader};

/// Directory listing merged with its fs_meta overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryPage {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub is_root: bool,
    pub is_virtual: bool,
    pub items: Vec<FileInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_md: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer_md: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyItemSpec {
    pub source_path: String,
    pub target_path: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCopyResult {
    /// Items completed inline (same-storage copies).
    pub outcomes: Vec<CopyOutcome>,
    /// Cross-storage items: the transfer is performed by the task
    /// orchestrator's copy handler against these plans.
    pub cross_storage_results: Vec<CrossStoragePlan>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkInfo {
    pub url: String,
    /// `direct`, `proxy` or `url_proxy`.
    pub link_type: &'static str,
}

pub struct FsService {
    db: SqlitePool,
    resolver: Arc<MountResolver>,
    cache: Arc<DirectoryCache>,
    bus: Arc<CacheBus>,
}

impl FsService {
    pub fn new(
        db: SqlitePool,
        resolver: Arc<MountResolver>,
        cache: Arc<DirectoryCache>,
        bus: Arc<CacheBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            resolver,
            cache,
            bus,
        })
    }

    pub fn resolver(&self) -> &Arc<MountResolver> {
        &self.resolver
    }

    fn check(
        &self,
        principal: &Principal,
        policy_id: &str,
        method: &str,
        paths: &[&str],
    ) -> Result<(), AppError> {
        let policy = policy::lookup(policy_id)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown policy {policy_id}")))?;
        let ctx = AuthzContext::new(method, paths.iter().map(|p| p.to_string()).collect());
        authorize(principal, &policy, &ctx)
    }

    /// Invalidate the ancestor chains synchronously (a mutation
    /// happens-before its effect on subsequent listers) and broadcast for
    /// the other caches.
    fn publish_invalidation(&self, mount_id: &str, paths: Vec<String>, reason: &str) {
        for path in &paths {
            self.cache.invalidate_path_and_ancestors(mount_id, path);
        }
        self.bus
            .publish(InvalidateEvent::fs_paths(mount_id, paths, reason));
    }

    async fn apply_meta_overlay(
        &self,
        page: &mut DirectoryPage,
    ) -> Result<(), AppError> {
        let meta = fs_meta_repo::resolve_effective_meta(&self.db, &page.path)
            .await
            .map_err(AppError::Internal)?;
        let Some(meta) = meta else {
            return Ok(());
        };

        let mut hide = Vec::new();
        for pattern in &meta.hide_patterns {
            match regex::Regex::new(pattern) {
                Ok(re) => hide.push(re),
                Err(error) => {
                    warn!(pattern, error = %error, "ignoring invalid hide pattern")
                }
            }
        }
        if !hide.is_empty() {
            page.items
                .retain(|item| !hide.iter().any(|re| re.is_match(&item.name)));
        }
        page.header_md = meta.header_md;
        page.footer_md = meta.footer_md;
        Ok(())
    }

    pub async fn list_directory(
        &self,
        principal: &Principal,
        path: &str,
        no_cache: bool,
    ) -> Result<DirectoryPage, AppError> {
        self.check(principal, "fs.read", "LIST", &[path])?;

        let resolved = match self.resolver.resolve(path, principal).await {
            Ok(resolved) => resolved,
            Err(AppError::NotFound(_)) => {
                // Ancestors of mount points are synthesized virtual dirs.
                let listing = self
                    .resolver
                    .virtual_listing(path)
                    .await?
                    .ok_or_else(|| AppError::not_found(format!("no mount covers {path}")))?;
                let mut page = DirectoryPage {
                    path: listing.path,
                    kind: "directory".to_string(),
                    is_root: listing.is_root,
                    is_virtual: true,
                    items: listing.items,
                    header_md: None,
                    footer_md: None,
                };
                self.apply_meta_overlay(&mut page).await?;
                return Ok(page);
            }
            Err(error) => return Err(error),
        };

        require_capability(resolved.driver.as_ref(), Capability::Reader)?;

        if !no_cache
            && let Some(cached) = self.cache.get(&resolved.mount.id, path)
        {
            return serde_json::from_value(cached).map_err(|e| AppError::Internal(e.into()));
        }

        let listing = resolved
            .driver
            .list_directory(&resolved.sub_path, &ListOptions { no_cache })
            .await?;

        let dir_path = vpath::normalize(path).map_err(AppError::Internal)?;
        let dir_path = if dir_path.len() > 1 {
            dir_path.trim_end_matches('/').to_string()
        } else {
            dir_path
        };
        let items = listing
            .items
            .into_iter()
            .map(|mut item| {
                item.path = vpath::join(&dir_path, &item.name);
                item
            })
            .collect();

        let mut page = DirectoryPage {
            is_root: dir_path == "/",
            path: dir_path,
            kind: "directory".to_string(),
            is_virtual: false,
            items,
            header_md: None,
            footer_md: None,
        };
        self.apply_meta_overlay(&mut page).await?;

        let ttl = mount_cache_ttl(&resolved.mount);
        let value = serde_json::to_value(&page).map_err(|e| AppError::Internal(e.into()))?;
        self.cache.set(&resolved.mount.id, &page.path, value, Some(ttl));

        Ok(page)
    }

    pub async fn get_file_info(
        &self,
        principal: &Principal,
        path: &str,
    ) -> Result<FileInfo, AppError> {
        self.check(principal, "fs.read", "STAT", &[path])?;
        let resolved = self.resolver.resolve(path, principal).await?;
        require_capability(resolved.driver.as_ref(), Capability::Reader)?;
        let mut info = resolved.driver.get_file_info(&resolved.sub_path).await?;
        info.path = path.to_string();
        Ok(info)
    }

    /// Download via the streaming access layer; the caller assembles the
    /// HTTP response from the returned `RangeReader`.
    pub async fn open_download(
        &self,
        principal: &Principal,
        path: &str,
        request: &StreamRequest<'_>,
    ) -> Result<RangeReader, AppError> {
        self.check(principal, "fs.read", "GET", &[path])?;
        let resolved = self.resolver.resolve(path, principal).await?;
        require_capability(resolved.driver.as_ref(), Capability::Reader)?;
        let descriptor = resolved.driver.download_file(&resolved.sub_path).await?;
        open_range_reader(descriptor.as_ref(), request).await
    }

    pub async fn download_descriptor(
        &self,
        principal: &Principal,
        path: &str,
    ) -> Result<Box<dyn StreamDescriptor>, AppError> {
        self.check(principal, "fs.read", "GET", &[path])?;
        let resolved = self.resolver.resolve(path, principal).await?;
        require_capability(resolved.driver.as_ref(), Capability::Reader)?;
        Ok(resolved.driver.download_file(&resolved.sub_path).await?)
    }

    pub async fn upload_file(
        &self,
        principal: &Principal,
        path: &str,
        source: UploadSource,
        opts: &UploadOptions,
    ) -> Result<FileInfo, AppError> {
        self.check(principal, "fs.upload", "PUT", &[path])?;
        let resolved = self.resolver.resolve(path, principal).await?;
        require_capability(resolved.driver.as_ref(), Capability::Writer)?;

        let mut info = resolved
            .driver
            .upload_file(&resolved.sub_path, source, opts)
            .await?;
        info.path = path.to_string();

        let parent = vpath::parent(path).unwrap_or_else(|| "/".to_string());
        self.publish_invalidation(&resolved.mount.id, vec![parent], "upload");
        Ok(info)
    }

    pub async fn create_directory(
        &self,
        principal: &Principal,
        path: &str,
    ) -> Result<(), AppError> {
        self.check(principal, "fs.upload", "MKDIR", &[path])?;
        let resolved = self.resolver.resolve(path, principal).await?;
        require_capability(resolved.driver.as_ref(), Capability::Writer)?;
        resolved.driver.create_directory(&resolved.sub_path).await?;

        let parent = vpath::parent(path).unwrap_or_else(|| "/".to_string());
        self.publish_invalidation(&resolved.mount.id, vec![parent], "mkdir");
        Ok(())
    }

    pub async fn rename_item(
        &self,
        principal: &Principal,
        old_path: &str,
        new_path: &str,
    ) -> Result<(), AppError> {
        self.check(principal, "fs.rename", "MOVE", &[old_path, new_path])?;
        let source = self.resolver.resolve(old_path, principal).await?;
        let target = self.resolver.resolve(new_path, principal).await?;
        if source.mount.id != target.mount.id {
            return Err(AppError::validation(
                "rename across storages is not supported; copy then delete",
            ));
        }
        require_capability(source.driver.as_ref(), Capability::Atomic)?;

        source
            .driver
            .rename_item(&source.sub_path, &target.sub_path)
            .await?;

        let old_parent = vpath::parent(old_path).unwrap_or_else(|| "/".to_string());
        let new_parent = vpath::parent(new_path).unwrap_or_else(|| "/".to_string());
        self.publish_invalidation(&source.mount.id, vec![old_parent, new_parent], "rename");
        Ok(())
    }

    /// Copy one item. Same-storage copies go through the driver's atomic
    /// path; cross-storage copies stream source bytes into the target
    /// driver, reporting progress through `opts.on_progress`.
    pub async fn copy_item(
        &self,
        principal: &Principal,
        source_path: &str,
        target_path: &str,
        opts: &CopyOptions,
    ) -> Result<CopyOutcome, AppError> {
        self.check(principal, "fs.copy", "COPY", &[source_path, target_path])?;
        let source = self.resolver.resolve(source_path, principal).await?;
        let target = self.resolver.resolve(target_path, principal).await?;

        let outcome = if source.mount.id == target.mount.id {
            require_capability(source.driver.as_ref(), Capability::Atomic)?;
            let mut outcome = source
                .driver
                .copy_item(&source.sub_path, &target.sub_path, opts)
                .await?;
            outcome.source_path = source_path.to_string();
            outcome.target_path = target_path.to_string();
            outcome
        } else {
            require_capability(source.driver.as_ref(), Capability::Reader)?;
            require_capability(target.driver.as_ref(), Capability::Writer)?;
            self.copy_across(&source, &target, source_path, target_path, opts)
                .await?
        };

        let target_parent = vpath::parent(target_path).unwrap_or_else(|| "/".to_string());
        self.publish_invalidation(&target.mount.id, vec![target_parent], "copy");
        Ok(outcome)
    }

    async fn copy_across(
        &self,
        source: &ResolvedPath,
        target: &ResolvedPath,
        source_path: &str,
        target_path: &str,
        opts: &CopyOptions,
    ) -> Result<CopyOutcome, AppError> {
        let info = source.driver.get_file_info(&source.sub_path).await?;

        // Directories transfer as a breadth-first walk; files stream direct.
        let mut pending: Vec<(String, String, bool)> =
            vec![(source.sub_path.clone(), target.sub_path.clone(), info.is_directory)];
        let mut transferred = 0_u64;
        let mut any_copied = false;

        while let Some((src_sub, tgt_sub, is_dir)) = pending.pop() {
            if is_dir {
                target.driver.create_directory(&tgt_sub).await?;
                let listing = source
                    .driver
                    .list_directory(&src_sub, &ListOptions::default())
                    .await?;
                for child in listing.items {
                    pending.push((
                        vpath::join(&src_sub, &child.name),
                        vpath::join(&tgt_sub, &child.name),
                        child.is_directory,
                    ));
                }
                continue;
            }

            let child_info = source.driver.get_file_info(&src_sub).await?;
            if opts.skip_existing
                && let Ok(existing) = target.driver.get_file_info(&tgt_sub).await
                && existing.size == child_info.size
            {
                continue;
            }

            let descriptor = source.driver.download_file(&src_sub).await?;
            let handle = descriptor.open().await?;
            let base = transferred;
            let stream = match &opts.on_progress {
                Some(on_progress) => {
                    progress_stream(handle.stream, base, on_progress.clone())
                }
                None => handle.stream,
            };

            target
                .driver
                .upload_file(
                    &tgt_sub,
                    UploadSource::Stream {
                        stream,
                        size: child_info.size,
                    },
                    &UploadOptions {
                        content_type: child_info.mimetype.clone(),
                        overwrite: true,
                    },
                )
                .await?;
            transferred += child_info.size.unwrap_or(0);
            any_copied = true;
        }

        Ok(CopyOutcome {
            status: if any_copied || info.is_directory {
                CopyStatus::Success
            } else {
                CopyStatus::Skipped
            },
            source_path: source_path.to_string(),
            target_path: target_path.to_string(),
            content_length: Some(transferred),
            error: None,
        })
    }

    pub async fn batch_remove_items(
        &self,
        principal: &Principal,
        paths: &[String],
    ) -> Result<BatchRemoveResult, AppError> {
        let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
        self.check(principal, "fs.delete", "DELETE", &refs)?;

        let mut result = BatchRemoveResult::default();
        // Group by mount so each driver sees one batch.
        let mut by_mount: Vec<(String, Vec<String>, Vec<String>)> = Vec::new();
        for path in paths {
            match self.resolver.resolve(path, principal).await {
                Ok(resolved) => {
                    match by_mount.iter_mut().find(|(id, _, _)| *id == resolved.mount.id) {
                        Some((_, subs, fulls)) => {
                            subs.push(resolved.sub_path);
                            fulls.push(path.clone());
                        }
                        None => by_mount.push((
                            resolved.mount.id.clone(),
                            vec![resolved.sub_path],
                            vec![path.clone()],
                        )),
                    }
                }
                Err(error) => result.failed.push(cloudpaste_driver_api::RemoveFailure {
                    path: path.clone(),
                    error: error.to_string(),
                }),
            }
        }

        for (mount_id, subs, fulls) in by_mount {
            let resolved = self.resolver.resolve(&fulls[0], principal).await?;
            require_capability(resolved.driver.as_ref(), Capability::Writer)?;
            let batch = resolved.driver.batch_remove_items(&subs).await?;
            result.success += batch.success;
            // Map driver sub-path failures back onto virtual paths.
            for failure in batch.failed {
                let full = subs
                    .iter()
                    .position(|s| *s == failure.path)
                    .map(|i| fulls[i].clone())
                    .unwrap_or(failure.path);
                result.failed.push(cloudpaste_driver_api::RemoveFailure {
                    path: full,
                    error: failure.error,
                });
            }

            let parents: Vec<String> = fulls
                .iter()
                .map(|p| vpath::parent(p).unwrap_or_else(|| "/".to_string()))
                .collect();
            self.publish_invalidation(&mount_id, parents, "delete");
        }

        Ok(result)
    }

    /// Batch copy. Same-storage items run inline; cross-storage items come
    /// back as plans for the task orchestrator.
    pub async fn batch_copy_items(
        &self,
        principal: &Principal,
        items: &[CopyItemSpec],
        opts: &CopyOptions,
    ) -> Result<BatchCopyResult, AppError> {
        let all_paths: Vec<&str> = items
            .iter()
            .flat_map(|i| [i.source_path.as_str(), i.target_path.as_str()])
            .collect();
        self.check(principal, "fs.copy", "COPY", &all_paths)?;

        let mut result = BatchCopyResult::default();

        for item in items {
            let source = self.resolver.resolve(&item.source_path, principal).await?;
            let target_path = {
                // Directory sources need a trailing slash on the target.
                let info = source.driver.get_file_info(&source.sub_path).await;
                let is_dir = item.source_path.ends_with('/')
                    || info.map(|i| i.is_directory).unwrap_or(false);
                if is_dir && !item.target_path.ends_with('/') {
                    format!("{}/", item.target_path)
                } else {
                    item.target_path.clone()
                }
            };
            let target = self.resolver.resolve(&target_path, principal).await?;

            if source.mount.id == target.mount.id {
                let outcome = self
                    .copy_item(principal, &item.source_path, &target_path, opts)
                    .await?;
                result.outcomes.push(outcome);
            } else {
                let mut plan = source
                    .driver
                    .prepare_cross_storage_copy(&source.sub_path, &target.sub_path)
                    .await?;
                plan.source_path = item.source_path.clone();
                plan.target_path = target_path;
                result.cross_storage_results.push(plan);
            }
        }

        Ok(result)
    }

    /// Best link for a stored object: presigned direct link when the driver
    /// signs, proxy when it proxies, web-proxy fallback otherwise.
    pub async fn resolve_link(
        &self,
        principal: &Principal,
        path: &str,
        expires_in: u64,
        prefer_proxy: bool,
    ) -> Result<LinkInfo, AppError> {
        self.check(principal, "fs.read", "LINK", &[path])?;
        let resolved = self.resolver.resolve(path, principal).await?;

        if !prefer_proxy
            && resolved
                .driver
                .capabilities()
                .contains(Capability::DirectLink)
        {
            let link = resolved
                .driver
                .generate_download_url(&resolved.sub_path, expires_in)
                .await?;
            return Ok(LinkInfo {
                url: link.url,
                link_type: "direct",
            });
        }

        if resolved.driver.supports_proxy_mode() {
            let link = resolved.driver.generate_proxy_url(&resolved.sub_path)?;
            return Ok(LinkInfo {
                url: link.url,
                link_type: "proxy",
            });
        }

        Ok(LinkInfo {
            url: format!("/api/raw{path}"),
            link_type: "url_proxy",
        })
    }
}

fn progress_stream(inner: ByteStream, base: u64, on_progress: ProgressFn) -> ByteStream {
    let mut total = base;
    Box::pin(inner.inspect(move |chunk| {
        if let Ok(chunk) = chunk {
            total += chunk.len() as u64;
            on_progress(total);
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use cloudpaste_cache::DirectoryCacheConfig;
    use cloudpaste_storage::db;
    use cloudpaste_storage::mounts_repo::{self, NewMount, WebdavPolicy};
    use cloudpaste_storage::secrets::SecretsCipher;
    use cloudpaste_storage::storage_configs_repo::{self, NewStorageConfig};

    use super::*;

    async fn seed_mount(pool: &SqlitePool, mount_path: &str, root: &std::path::Path) -> String {
        let config = storage_configs_repo::create_config(
            pool,
            NewStorageConfig {
                name: mount_path,
                driver_kind: "LOCAL",
                config: serde_json::json!({"root": root.to_string_lossy()}),
                is_public: true,
                is_default: false,
                quota_bytes: None,
                admin_id: None,
            },
        )
        .await
        .unwrap();
        mounts_repo::create_mount(
            pool,
            NewMount {
                name: mount_path,
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
        .unwrap()
        .id
    }

    async fn service(pool: &SqlitePool) -> Arc<FsService> {
        let cipher = SecretsCipher::from_secret("test").unwrap();
        let resolver = MountResolver::new(pool.clone(), cipher);
        let cache = Arc::new(DirectoryCache::new(DirectoryCacheConfig::default()));
        let bus = Arc::new(CacheBus::new());
        FsService::new(pool.clone(), resolver, cache, bus)
    }

    fn admin() -> Principal {
        Principal::admin("a1", "root")
    }

    #[tokio::test]
    async fn rename_invalidates_ancestor_chain_only() {
        let pool = db::init_in_memory().await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let mount_id = seed_mount(&pool, "/", tmp.path()).await;
        let fs = service(&pool).await;

        fs.create_directory(&admin(), "/a/b/c").await.unwrap();
        fs.upload_file(
            &admin(),
            "/a/b/c/d",
            UploadSource::Bytes(bytes::Bytes::from_static(b"payload")),
            &UploadOptions {
                overwrite: true,
                ..UploadOptions::default()
            },
        )
        .await
        .unwrap();
        fs.create_directory(&admin(), "/x").await.unwrap();

        // Warm cache entries along the chain plus an unrelated one.
        for p in ["/a", "/a/b", "/a/b/c", "/x"] {
            fs.list_directory(&admin(), p, false).await.unwrap();
        }
        for p in ["/a", "/a/b", "/a/b/c", "/x"] {
            assert!(fs.cache.get(&mount_id, p).is_some(), "{p} should be cached");
        }

        fs.rename_item(&admin(), "/a/b/c/d", "/a/b/c/e").await.unwrap();

        for p in ["/a", "/a/b", "/a/b/c", "/"] {
            assert!(fs.cache.get(&mount_id, p).is_none(), "{p} should be invalidated");
        }
        assert!(fs.cache.get(&mount_id, "/x").is_some(), "/x must survive");

        let listing = fs.list_directory(&admin(), "/a/b/c", false).await.unwrap();
        let names: Vec<&str> = listing.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["e"]);
    }

    #[tokio::test]
    async fn listing_is_cached_until_mutation() {
        let pool = db::init_in_memory().await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let mount_id = seed_mount(&pool, "/", tmp.path()).await;
        let fs = service(&pool).await;

        fs.upload_file(
            &admin(),
            "/one.txt",
            UploadSource::Bytes(bytes::Bytes::from_static(b"1")),
            &UploadOptions {
                overwrite: true,
                ..UploadOptions::default()
            },
        )
        .await
        .unwrap();

        let first = fs.list_directory(&admin(), "/", false).await.unwrap();
        assert_eq!(first.items.len(), 1);
        let stats_before = fs.cache.stats();
        let second = fs.list_directory(&admin(), "/", false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fs.cache.stats().hits, stats_before.hits + 1);

        // Upload under / clears the chain; next list re-reads the driver.
        fs.upload_file(
            &admin(),
            "/two.txt",
            UploadSource::Bytes(bytes::Bytes::from_static(b"2")),
            &UploadOptions {
                overwrite: true,
                ..UploadOptions::default()
            },
        )
        .await
        .unwrap();
        assert!(fs.cache.get(&mount_id, "/").is_none());
        let third = fs.list_directory(&admin(), "/", false).await.unwrap();
        assert_eq!(third.items.len(), 2);
    }

    #[tokio::test]
    async fn cross_storage_copy_streams_with_progress() {
        let pool = db::init_in_memory().await.unwrap();
        let tmp_a = tempfile::tempdir().unwrap();
        let tmp_b = tempfile::tempdir().unwrap();
        seed_mount(&pool, "/a", tmp_a.path()).await;
        seed_mount(&pool, "/b", tmp_b.path()).await;
        let fs = service(&pool).await;

        let payload = vec![9_u8; 300 * 1024];
        fs.upload_file(
            &admin(),
            "/a/data.bin",
            UploadSource::Bytes(bytes::Bytes::from(payload.clone())),
            &UploadOptions {
                overwrite: true,
                ..UploadOptions::default()
            },
        )
        .await
        .unwrap();

        let progressed = Arc::new(AtomicU64::new(0));
        let progressed_cb = progressed.clone();
        let outcome = fs
            .copy_item(
                &admin(),
                "/a/data.bin",
                "/b/data.bin",
                &CopyOptions {
                    skip_existing: false,
                    on_progress: Some(Arc::new(move |bytes| {
                        progressed_cb.store(bytes, Ordering::Relaxed);
                    })),
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, CopyStatus::Success);
        assert_eq!(outcome.content_length, Some(payload.len() as u64));
        assert_eq!(progressed.load(Ordering::Relaxed), payload.len() as u64);

        let info = fs.get_file_info(&admin(), "/b/data.bin").await.unwrap();
        assert_eq!(info.size, Some(payload.len() as u64));
    }

    #[tokio::test]
    async fn batch_copy_splits_inline_and_cross_storage() {
        let pool = db::init_in_memory().await.unwrap();
        let tmp_a = tempfile::tempdir().unwrap();
        let tmp_b = tempfile::tempdir().unwrap();
        seed_mount(&pool, "/a", tmp_a.path()).await;
        seed_mount(&pool, "/b", tmp_b.path()).await;
        let fs = service(&pool).await;

        fs.create_directory(&admin(), "/a/dir").await.unwrap();
        fs.upload_file(
            &admin(),
            "/a/f.txt",
            UploadSource::Bytes(bytes::Bytes::from_static(b"f")),
            &UploadOptions {
                overwrite: true,
                ..UploadOptions::default()
            },
        )
        .await
        .unwrap();

        let result = fs
            .batch_copy_items(
                &admin(),
                &[
                    CopyItemSpec {
                        source_path: "/a/f.txt".to_string(),
                        target_path: "/a/g.txt".to_string(),
                    },
                    CopyItemSpec {
                        source_path: "/a/dir/".to_string(),
                        target_path: "/b/dir".to_string(),
                    },
                ],
                &CopyOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(result.outcomes[0].status, CopyStatus::Success);
        assert_eq!(result.cross_storage_results.len(), 1);
        // The facade auto-appends the directory slash on the target.
        assert_eq!(result.cross_storage_results[0].target_path, "/b/dir/");
    }

    #[tokio::test]
    async fn scoped_key_cannot_write_outside_basic_path() {
        let pool = db::init_in_memory().await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        seed_mount(&pool, "/", tmp.path()).await;
        let fs = service(&pool).await;

        let key = Principal::api_key(
            "k1",
            "scoped",
            cloudpaste_core::Role::General,
            cloudpaste_core::permission::MOUNT_VIEW | cloudpaste_core::permission::MOUNT_UPLOAD,
            "/team",
        );

        let err = fs
            .upload_file(
                &key,
                "/other/file.txt",
                UploadSource::Bytes(bytes::Bytes::from_static(b"x")),
                &UploadOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);

        fs.upload_file(
            &key,
            "/team/file.txt",
            UploadSource::Bytes(bytes::Bytes::from_static(b"x")),
            &UploadOptions {
                overwrite: true,
                ..UploadOptions::default()
            },
        )
        .await
        .unwrap();
    }
}
