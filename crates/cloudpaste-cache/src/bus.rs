use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;
const MAX_SUBSCRIBERS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidateTarget {
    Fs,
    Preview,
}

/// Invalidation message broadcast on the `cache.invalidate` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateEvent {
    pub target: InvalidateTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_config_id: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub invalidate_all: bool,
    #[serde(default)]
    pub bump_mounts_version: bool,
}

impl InvalidateEvent {
    pub fn fs_paths(
        mount_id: impl Into<String>,
        paths: Vec<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            target: InvalidateTarget::Fs,
            mount_id: Some(mount_id.into()),
            paths,
            storage_config_id: None,
            reason: reason.into(),
            invalidate_all: false,
            bump_mounts_version: false,
        }
    }

    pub fn fs_mount(mount_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::fs_paths(mount_id, Vec::new(), reason)
    }

    pub fn storage_config(config_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target: InvalidateTarget::Fs,
            mount_id: None,
            paths: Vec::new(),
            storage_config_id: Some(config_id.into()),
            reason: reason.into(),
            invalidate_all: false,
            bump_mounts_version: true,
        }
    }

    pub fn all(reason: impl Into<String>) -> Self {
        Self {
            target: InvalidateTarget::Fs,
            mount_id: None,
            paths: Vec::new(),
            storage_config_id: None,
            reason: reason.into(),
            invalidate_all: true,
            bump_mounts_version: true,
        }
    }
}

/// Process-wide invalidation pub/sub.
///
/// Delivery is at-least-once to every live in-process subscriber, in issue
/// order per producer. Listener failures must be swallowed by the listener
/// loop itself so one faulty subscriber never blocks its peers.
#[derive(Debug)]
pub struct CacheBus {
    tx: broadcast::Sender<InvalidateEvent>,
    mounts_version: AtomicU64,
}

impl Default for CacheBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            mounts_version: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> Result<broadcast::Receiver<InvalidateEvent>, anyhow::Error> {
        if self.tx.receiver_count() >= MAX_SUBSCRIBERS {
            return Err(anyhow::anyhow!(
                "cache bus subscriber limit ({MAX_SUBSCRIBERS}) reached"
            ));
        }
        Ok(self.tx.subscribe())
    }

    pub fn publish(&self, event: InvalidateEvent) {
        if event.bump_mounts_version {
            self.mounts_version.fetch_add(1, Ordering::Relaxed);
        }
        // No subscribers is fine; the event is simply dropped.
        let _ = self.tx.send(event);
    }

    /// Monotonic epoch bumped on mount-topology changes; dependent caches
    /// compare this against their snapshot version.
    pub fn mounts_version(&self) -> u64 {
        self.mounts_version.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_delivered_in_issue_order() {
        let bus = CacheBus::new();
        let mut rx = bus.subscribe().unwrap();

        bus.publish(InvalidateEvent::fs_paths("m1", vec!["/a".into()], "upload"));
        bus.publish(InvalidateEvent::fs_mount("m1", "delete"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.paths, vec!["/a".to_string()]);
        let second = rx.recv().await.unwrap();
        assert!(second.paths.is_empty());
        assert_eq!(second.reason, "delete");
    }

    #[tokio::test]
    async fn mounts_version_bumps_only_when_flagged() {
        let bus = CacheBus::new();
        assert_eq!(bus.mounts_version(), 0);
        bus.publish(InvalidateEvent::fs_mount("m1", "upload"));
        assert_eq!(bus.mounts_version(), 0);
        bus.publish(InvalidateEvent::storage_config("cfg1", "config updated"));
        assert_eq!(bus.mounts_version(), 1);
        bus.publish(InvalidateEvent::all("restore"));
        assert_eq!(bus.mounts_version(), 2);
    }

    #[tokio::test]
    async fn subscriber_cap_enforced() {
        let bus = CacheBus::new();
        let mut receivers = Vec::new();
        for _ in 0..50 {
            receivers.push(bus.subscribe().unwrap());
        }
        assert!(bus.subscribe().is_err());
        drop(receivers);
        assert!(bus.subscribe().is_ok());
    }
}
