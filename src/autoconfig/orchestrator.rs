//! Binds the web server to live configuration.
//!
//! # Responsibilities
//! - Apply the configuration snapshot to the server, now and on every change
//! - Push external-IP updates into the server as they arrive
//! - Drive the one-shot external-IP probe off the heartbeat

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::autoconfig::external_ip::ExternalIpService;
use crate::autoconfig::heartbeat::Heartbeat;
use crate::clock::Clock;
use crate::config::schema::AppConfig;
use crate::config::store::ConfigStore;
use crate::listener::server::WebServer;

/// How long a failed external-IP lookup suppresses further attempts.
const LOOKUP_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Default)]
struct ProbeState {
    succeeded: bool,
    last_failure: Option<Instant>,
}

/// Keeps one web server's properties synchronized with configuration and
/// the external-IP service.
pub struct AutoConfig {
    /// Handle to ourselves for the reaction tasks. They hold it weakly so a
    /// dropped orchestrator winds down instead of living on in its tasks.
    me: Weak<AutoConfig>,
    server: Arc<WebServer>,
    store: Arc<ConfigStore>,
    external_ip: Arc<ExternalIpService>,
    heartbeat: Arc<Heartbeat>,
    clock: Arc<dyn Clock>,
    /// Installer-level override; a non-zero value beats the configured port.
    port_override: Option<u16>,
    probe: Mutex<ProbeState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    initialised: AtomicBool,
}

impl AutoConfig {
    pub fn new(
        server: Arc<WebServer>,
        store: Arc<ConfigStore>,
        external_ip: Arc<ExternalIpService>,
        heartbeat: Arc<Heartbeat>,
        clock: Arc<dyn Clock>,
        port_override: Option<u16>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            server,
            store,
            external_ip,
            heartbeat,
            clock,
            port_override,
            probe: Mutex::new(ProbeState::default()),
            tasks: Mutex::new(Vec::new()),
            initialised: AtomicBool::new(false),
        })
    }

    /// Apply the current configuration and start reacting to changes.
    pub fn initialise(&self) {
        if self.initialised.swap(true, Ordering::SeqCst) {
            return;
        }

        self.apply_config(&self.store.snapshot());

        let mut tasks = Vec::new();

        let this = self.me.clone();
        let mut config_changes = self.store.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                let config = match config_changes.recv().await {
                    Ok(config) => Some(config),
                    Err(RecvError::Lagged(_)) => None,
                    Err(RecvError::Closed) => break,
                };
                let Some(this) = this.upgrade() else { break };
                match config {
                    Some(config) => this.apply_config(&config),
                    // Catch up from the snapshot rather than replaying.
                    None => this.apply_config(&this.store.snapshot()),
                }
            }
        }));

        let server = Arc::clone(&self.server);
        let mut ip_updates = self.external_ip.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match ip_updates.recv().await {
                    Ok(address) => server.set_external_ip(Some(address)),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        let this = self.me.clone();
        let mut ticks = self.heartbeat.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match ticks.recv().await {
                    Ok(()) => {
                        let Some(this) = this.upgrade() else { break };
                        this.on_heartbeat().await;
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        *self.tasks.lock().unwrap() = tasks;
        self.heartbeat.tick_now();
        tracing::info!("Auto-configuration initialised");
    }

    /// Stop reacting and take the owned listener offline. Safe to call
    /// without a prior `initialise`.
    pub async fn shutdown(&self) {
        if !self.initialised.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let mut tasks = self.tasks.lock().unwrap();
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        let server = Arc::clone(&self.server);
        if let Err(error) = server.set_online(false).await {
            tracing::warn!(%error, "Failed to stop listener during shutdown");
        }
        tracing::info!("Auto-configuration shut down");
    }

    fn apply_config(&self, config: &AppConfig) {
        let port = match self.port_override {
            Some(port) if port != 0 => port,
            _ => config.listener.port,
        };

        self.server.set_port(port);
        self.server.set_root(&config.listener.root);
        self.server.set_scheme(config.listener.scheme);
        self.server
            .set_cache_credentials(config.listener.cache_credentials);
        self.server
            .set_compression_enabled(config.listener.compression_enabled);
        self.server.set_external_port(config.upnp.external_port);
        self.server.set_external_ip(self.external_ip.current());

        tracing::debug!(
            port,
            root = %config.listener.root,
            external_port = config.upnp.external_port,
            "Configuration applied to listener"
        );
    }

    /// Probe for the external address until one lookup succeeds. After a
    /// failure the next attempt waits out the cooldown.
    async fn on_heartbeat(&self) {
        {
            let probe = self.probe.lock().unwrap();
            if probe.succeeded {
                return;
            }
            if let Some(failed_at) = probe.last_failure {
                if self.clock.now().saturating_duration_since(failed_at) < LOOKUP_COOLDOWN {
                    return;
                }
            }
        }

        match self.external_ip.refresh().await {
            Ok(address) => {
                self.probe.lock().unwrap().succeeded = true;
                tracing::info!(%address, "External address resolved");
            }
            Err(error) => {
                self.probe.lock().unwrap().last_failure = Some(self.clock.now());
                tracing::warn!(%error, "External address lookup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoconfig::external_ip::{ExternalIpError, ExternalIpProvider};
    use crate::clock::{ManualClock, SystemClock};
    use crate::listener::testing::{wait_until, FakeProvider};
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` lookups, then succeeds.
    struct FlakyProvider {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyProvider {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExternalIpProvider for FlakyProvider {
        async fn lookup(&self) -> Result<IpAddr, ExternalIpError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ExternalIpError::Parse("unavailable".to_string()))
            } else {
                Ok("86.1.2.3".parse().unwrap())
            }
        }
    }

    fn harness(
        lookup_failures: u32,
        port_override: Option<u16>,
    ) -> (Arc<AutoConfig>, Arc<WebServer>, Arc<FlakyProvider>, Arc<ManualClock>) {
        let provider = FakeProvider::new();
        let server = WebServer::new(provider, Arc::new(SystemClock));
        let store = Arc::new(ConfigStore::default());
        let flaky = FlakyProvider::new(lookup_failures);
        let external_ip = Arc::new(ExternalIpService::new(
            Arc::clone(&flaky) as Arc<dyn ExternalIpProvider>
        ));
        let heartbeat = Arc::new(Heartbeat::new(Duration::from_secs(3600)));
        let clock = Arc::new(ManualClock::new());
        let autoconfig = AutoConfig::new(
            Arc::clone(&server),
            store,
            external_ip,
            heartbeat,
            Arc::clone(&clock) as Arc<dyn Clock>,
            port_override,
        );
        (autoconfig, server, flaky, clock)
    }

    #[tokio::test]
    async fn failed_lookup_waits_out_the_cooldown() {
        let (autoconfig, _server, flaky, clock) = harness(u32::MAX, None);

        autoconfig.on_heartbeat().await;
        assert_eq!(flaky.calls(), 1);

        // Four minutes later: still cooling down.
        clock.advance(Duration::from_secs(4 * 60));
        autoconfig.on_heartbeat().await;
        assert_eq!(flaky.calls(), 1);

        // Five minutes after the failure: retry.
        clock.advance(Duration::from_secs(60));
        autoconfig.on_heartbeat().await;
        assert_eq!(flaky.calls(), 2);
    }

    #[tokio::test]
    async fn probe_is_one_shot_after_success() {
        let (autoconfig, _server, flaky, _clock) = harness(0, None);

        autoconfig.on_heartbeat().await;
        autoconfig.on_heartbeat().await;
        autoconfig.on_heartbeat().await;
        assert_eq!(flaky.calls(), 1);
    }

    #[tokio::test]
    async fn initialise_applies_config_and_probes_once() {
        let (autoconfig, server, flaky, _clock) = harness(0, None);

        let store = Arc::clone(&autoconfig.store);
        let mut config = AppConfig::default();
        config.listener.port = 9000;
        config.listener.root = "Radar".to_string();
        config.upnp.external_port = 18080;
        store.update(config);

        autoconfig.initialise();

        assert_eq!(server.port(), 9000);
        assert_eq!(server.root(), "/Radar");
        assert_eq!(server.external_port(), 18080);

        // The immediate tick resolves the address, and the update event
        // carries it into the server.
        assert!(wait_until(|| server.external_ip().is_some()).await);
        assert_eq!(flaky.calls(), 1);

        autoconfig.shutdown().await;
    }

    #[tokio::test]
    async fn nonzero_override_beats_the_configured_port() {
        let (autoconfig, server, _flaky, _clock) = harness(0, Some(16000));
        autoconfig.apply_config(&AppConfig::default());
        assert_eq!(server.port(), 16000);

        let (autoconfig, server, _flaky, _clock) = harness(0, Some(0));
        autoconfig.apply_config(&AppConfig::default());
        assert_eq!(server.port(), 8080);
    }

    #[tokio::test]
    async fn config_changes_reapply_until_shutdown() {
        let (autoconfig, server, _flaky, _clock) = harness(0, None);
        autoconfig.initialise();

        let mut config = AppConfig::default();
        config.upnp.external_port = 19000;
        autoconfig.store.update(config);
        assert!(wait_until(|| server.external_port() == 19000).await);

        autoconfig.shutdown().await;

        let mut config = AppConfig::default();
        config.upnp.external_port = 20000;
        autoconfig.store.update(config);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.external_port(), 19000);
    }

    #[tokio::test]
    async fn shutdown_without_initialise_is_a_no_op() {
        let (autoconfig, _server, _flaky, _clock) = harness(0, None);
        autoconfig.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_takes_the_listener_offline() {
        let (autoconfig, server, _flaky, _clock) = harness(0, None);
        autoconfig.initialise();
        server.set_online(true).await.unwrap();
        assert!(server.is_online());

        autoconfig.shutdown().await;
        assert!(!server.is_online());
    }
}
