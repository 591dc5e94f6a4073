//! Shared configuration snapshots with change notification.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;

use crate::config::schema::AppConfig;

/// Holds the current configuration and tells subscribers when it changes.
///
/// Readers take cheap `Arc` snapshots; writers swap the whole snapshot
/// atomically. There is no partial mutation.
pub struct ConfigStore {
    current: ArcSwap<AppConfig>,
    changed: broadcast::Sender<Arc<AppConfig>>,
}

impl ConfigStore {
    pub fn new(initial: AppConfig) -> Self {
        let (changed, _) = broadcast::channel(16);
        Self {
            current: ArcSwap::from_pointee(initial),
            changed,
        }
    }

    /// The current configuration snapshot.
    pub fn snapshot(&self) -> Arc<AppConfig> {
        self.current.load_full()
    }

    /// Replace the configuration and notify subscribers.
    pub fn update(&self, config: AppConfig) {
        let snapshot = Arc::new(config);
        self.current.store(Arc::clone(&snapshot));
        // Nobody listening yet is fine.
        let _ = self.changed.send(snapshot);
    }

    /// Subscribe to configuration-changed notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AppConfig>> {
        self.changed.subscribe()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_swaps_snapshot_and_notifies() {
        let store = ConfigStore::default();
        let mut updates = store.subscribe();

        let mut config = AppConfig::default();
        config.upnp.external_port = 9090;
        store.update(config);

        assert_eq!(store.snapshot().upnp.external_port, 9090);
        let received = updates.recv().await.unwrap();
        assert_eq!(received.upnp.external_port, 9090);
    }

    #[test]
    fn update_without_subscribers_does_not_panic() {
        let store = ConfigStore::default();
        store.update(AppConfig::default());
    }
}
