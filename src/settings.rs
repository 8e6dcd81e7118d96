//! Bridge from external settings changes into live dispatch state.
//!
//! The settings collaborator reports three values, each of which may change at
//! any time: the maximum socket count, the proxy URL, and whether the proxy is
//! enabled. [`ConfigBridge`] applies each change to the shared
//! [`ConcurrencyProvider`] or the [`ProxyController`] without touching
//! in-flight requests. A bad value is logged and skipped.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::ConcurrencyProvider;
use crate::proxy::ProxyController;

/// One settings change notification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "setting", content = "value", rename_all = "camelCase")]
pub enum SettingsChange {
    /// New maximum connection count. Values below 1 are clamped to 1.
    MaxSockets(i64),
    /// New proxy URL; empty clears it.
    HttpProxy(String),
    /// Proxy switched on or off.
    HttpProxyEnabled(bool),
}

/// Applies settings changes to the concurrency cap and the proxy controller.
#[derive(Debug, Clone)]
pub struct ConfigBridge {
    concurrency: ConcurrencyProvider,
    proxy: Arc<ProxyController>,
}

impl ConfigBridge {
    /// Creates a bridge writing into the given cap and controller.
    #[must_use]
    pub fn new(concurrency: ConcurrencyProvider, proxy: Arc<ProxyController>) -> Self {
        Self { concurrency, proxy }
    }

    /// Applies one change. Never fails; rejected values are logged.
    pub fn apply(&self, change: SettingsChange) {
        debug!(?change, "applying settings change");
        match change {
            SettingsChange::MaxSockets(max_sockets) => {
                let cap = usize::try_from(max_sockets).unwrap_or(0).max(1);
                self.concurrency.set(cap);
                info!(max_sockets, cap, "concurrency cap changed");
            }
            SettingsChange::HttpProxy(url) => {
                if let Err(e) = self.proxy.set_proxy(&url) {
                    warn!(value = %url, error = %e, "ignoring invalid proxy setting");
                }
            }
            SettingsChange::HttpProxyEnabled(enabled) => {
                self.proxy.set_proxy_enabled(enabled);
                info!(enabled, "proxy enabled setting changed");
            }
        }
    }

    /// Applies changes from `changes` in arrival order until the sender side
    /// is dropped.
    pub fn spawn(self, mut changes: mpsc::UnboundedReceiver<SettingsChange>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                self.apply(change);
            }
            debug!("settings stream closed");
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn bridge() -> (ConfigBridge, ConcurrencyProvider, Arc<ProxyController>) {
        let provider = ConcurrencyProvider::default();
        let proxy = Arc::new(ProxyController::new());
        (
            ConfigBridge::new(provider.clone(), Arc::clone(&proxy)),
            provider,
            proxy,
        )
    }

    #[test]
    fn test_max_sockets_updates_cap() {
        let (bridge, provider, _) = bridge();
        bridge.apply(SettingsChange::MaxSockets(8));
        assert_eq!(provider.get(), 8);
        assert_eq!(provider.range_concurrency(), 4);
    }

    #[test]
    fn test_non_positive_max_sockets_clamped_to_one() {
        let (bridge, provider, _) = bridge();
        bridge.apply(SettingsChange::MaxSockets(0));
        assert_eq!(provider.get(), 1);
        bridge.apply(SettingsChange::MaxSockets(-5));
        assert_eq!(provider.get(), 1);
    }

    #[test]
    fn test_invalid_proxy_does_not_abort_other_changes() {
        let (bridge, provider, proxy) = bridge();
        bridge.apply(SettingsChange::HttpProxy("http://good.test:3128".to_string()));
        bridge.apply(SettingsChange::HttpProxyEnabled(true));

        bridge.apply(SettingsChange::HttpProxy("::not a url::".to_string()));
        bridge.apply(SettingsChange::MaxSockets(16));

        assert_eq!(provider.get(), 16);
        assert_eq!(
            proxy.effective_proxy().unwrap().host_str(),
            Some("good.test")
        );
    }

    #[test]
    fn test_settings_change_deserializes() {
        let change: SettingsChange =
            serde_json::from_str(r#"{"setting":"maxSockets","value":32}"#).unwrap();
        assert_eq!(change, SettingsChange::MaxSockets(32));
        let change: SettingsChange =
            serde_json::from_str(r#"{"setting":"httpProxyEnabled","value":true}"#).unwrap();
        assert_eq!(change, SettingsChange::HttpProxyEnabled(true));
    }

    #[tokio::test]
    async fn test_spawned_bridge_applies_in_order() {
        let (bridge, provider, proxy) = bridge();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = bridge.spawn(rx);

        tx.send(SettingsChange::MaxSockets(10)).unwrap();
        tx.send(SettingsChange::HttpProxy("http://a.test:1".to_string()))
            .unwrap();
        tx.send(SettingsChange::HttpProxy("http://b.test:2".to_string()))
            .unwrap();
        tx.send(SettingsChange::HttpProxyEnabled(true)).unwrap();
        tx.send(SettingsChange::MaxSockets(2)).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(provider.get(), 2);
        assert_eq!(proxy.effective_proxy().unwrap().host_str(), Some("b.test"));
    }
}
