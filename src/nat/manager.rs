//! Reconciles one router port mapping with the listener's configuration.
//!
//! # Responsibilities
//! - Discover the router and sweep stale mappings left by earlier runs
//! - Put the server onto the Internet (add the mapping) and take it off
//! - React to configuration changes: move the mapping when the UPnP port
//!   changes, tear it down when UPnP is disabled
//!
//! # Design Decisions
//! - Router failures never propagate; they degrade the presence flags and
//!   are logged for the operator
//! - `state_changed` fires only when a presence flag actually flips, except
//!   at the end of `initialise`, which always announces the outcome

use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::schema::AppConfig;
use crate::config::store::ConfigStore;
use crate::events::EventHandlers;
use crate::listener::server::WebServer;
use crate::nat::provider::{PortMapping, Protocol, RouterError, RouterProvider};

/// Marks mappings owned by this application on the router.
pub const MAPPING_DESCRIPTION: &str = "portside-web";

/// Error type for NAT manager misuse.
#[derive(Debug, Error)]
pub enum NatError {
    #[error("the NAT manager has not been initialised")]
    NotInitialised,

    #[error("the NAT manager is already initialised")]
    AlreadyInitialised,
}

/// Router and mapping presence, as last reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NatStatus {
    pub router_present: bool,
    pub mapping_present: bool,
}

#[derive(Default)]
struct NatState {
    initialised: bool,
    router_present: bool,
    mapping_present: bool,
    /// External port the current mapping was created with; removal always
    /// targets this, not whatever the config says now.
    applied_external_port: u16,
}

impl NatState {
    fn status(&self) -> NatStatus {
        NatStatus {
            router_present: self.router_present,
            mapping_present: self.mapping_present,
        }
    }
}

/// Keeps the router's forwarding rule in step with the listener.
pub struct NatManager {
    router: Arc<dyn RouterProvider>,
    server: Arc<WebServer>,
    store: Arc<ConfigStore>,
    state: Mutex<NatState>,
    pub state_changed: EventHandlers<NatStatus>,
}

impl NatManager {
    pub fn new(
        router: Arc<dyn RouterProvider>,
        server: Arc<WebServer>,
        store: Arc<ConfigStore>,
    ) -> Self {
        Self {
            router,
            server,
            store,
            state: Mutex::new(NatState::default()),
            state_changed: EventHandlers::new(),
        }
    }

    pub async fn status(&self) -> NatStatus {
        self.state.lock().await.status()
    }

    /// Discover the router and clean up mappings left behind by previous
    /// runs. Announces the outcome exactly once, success or not.
    pub async fn initialise(&self) -> Result<(), NatError> {
        if self.state.lock().await.initialised {
            return Err(NatError::AlreadyInitialised);
        }

        let config = self.store.snapshot();
        let router_present = match self.router.discover().await {
            Ok(()) => match self.sweep_stale_mappings(&config).await {
                Ok(()) => true,
                Err(error) => {
                    tracing::warn!(%error, "Failed to sweep stale mappings");
                    false
                }
            },
            Err(error) => {
                tracing::info!(%error, "No UPnP router found");
                false
            }
        };

        let status = {
            let mut state = self.state.lock().await;
            state.initialised = true;
            state.router_present = router_present;
            state.applied_external_port = config.upnp.external_port;
            state.status()
        };
        self.raise_state_changed(status);
        Ok(())
    }

    /// Make sure the router forwards the configured external port to the
    /// listener. No-op when UPnP is off or no router answered discovery.
    pub async fn put_server_onto_internet(&self) -> Result<(), NatError> {
        let config = self.store.snapshot();
        {
            let state = self.state.lock().await;
            if !state.initialised {
                return Err(NatError::NotInitialised);
            }
            if !config.upnp.enabled || !state.router_present {
                return Ok(());
            }
        }

        if let Some(status) = self.establish_mapping(&config).await {
            self.raise_state_changed(status);
        }
        Ok(())
    }

    /// Remove the mapping, dropping open connections first when this server
    /// is the only one using the router's rule.
    pub async fn take_server_off_internet(&self) -> Result<(), NatError> {
        if !self.state.lock().await.initialised {
            return Err(NatError::NotInitialised);
        }
        if let Some(status) = self.remove_with_cycle().await {
            self.raise_state_changed(status);
        }
        Ok(())
    }

    /// React to a configuration change. Without an established mapping this
    /// only records the new port.
    pub async fn on_config_changed(&self) {
        let (initialised, mapping_present, old_port) = {
            let state = self.state.lock().await;
            (
                state.initialised,
                state.mapping_present,
                state.applied_external_port,
            )
        };
        if !initialised {
            return;
        }

        let config = self.store.snapshot();

        if mapping_present && !config.upnp.enabled {
            // Disabling UPnP tears the rule down rather than orphaning it.
            if let Some(status) = self.remove_with_cycle().await {
                self.raise_state_changed(status);
            }
            self.state.lock().await.applied_external_port = config.upnp.external_port;
            return;
        }

        if mapping_present && config.upnp.external_port != old_port {
            self.move_mapping(&config, old_port).await;
            return;
        }

        self.state.lock().await.applied_external_port = config.upnp.external_port;
    }

    /// Best-effort removal on shutdown.
    pub async fn shutdown(&self) {
        let (initialised, mapping_present, old_port) = {
            let state = self.state.lock().await;
            (
                state.initialised,
                state.mapping_present,
                state.applied_external_port,
            )
        };
        if !initialised || !mapping_present {
            return;
        }
        if let Some(status) = self.remove_now(old_port).await {
            self.raise_state_changed(status);
        }
    }

    // ---- reconciliation internals ---------------------------------------

    /// Remove the old rule and add one for the new port as a pair, cycling
    /// the listener around the pair when the configuration demands it.
    async fn move_mapping(&self, config: &AppConfig, old_port: u16) {
        tracing::info!(
            old_port,
            new_port = config.upnp.external_port,
            "UPnP port changed, moving mapping"
        );

        let cycle = config.upnp.is_only_server_on_lan && self.server.is_online();
        if cycle {
            self.set_listener_online(false).await;
        }

        let removed = self.remove_now(old_port).await;
        let established = self.establish_mapping(config).await;

        if cycle {
            self.set_listener_online(true).await;
        }

        if let Some(status) = removed {
            self.raise_state_changed(status);
        }
        if let Some(status) = established {
            self.raise_state_changed(status);
        }
    }

    /// Add the configured mapping unless an identical one already exists.
    /// Returns the new status when `mapping_present` flipped.
    async fn establish_mapping(&self, config: &AppConfig) -> Option<NatStatus> {
        let internal_port = self.server.port();
        let present = match self.server.network_address() {
            None => {
                tracing::warn!("LAN address unknown, cannot map port");
                false
            }
            Some(internal_client) => {
                match self
                    .try_establish(config, internal_client, internal_port)
                    .await
                {
                    Ok(()) => true,
                    Err(error) => {
                        tracing::warn!(%error, "Failed to establish port mapping");
                        false
                    }
                }
            }
        };

        let mut state = self.state.lock().await;
        let flipped = state.mapping_present != present;
        state.mapping_present = present;
        state.applied_external_port = config.upnp.external_port;
        flipped.then(|| state.status())
    }

    async fn try_establish(
        &self,
        config: &AppConfig,
        internal_client: IpAddr,
        internal_port: u16,
    ) -> Result<(), RouterError> {
        let desired = PortMapping {
            description: MAPPING_DESCRIPTION.to_string(),
            external_port: config.upnp.external_port,
            internal_client,
            internal_port,
            protocol: Protocol::Tcp,
        };

        let mappings = self.router.port_mappings().await?;
        if mappings.contains(&desired) {
            return Ok(());
        }

        tracing::info!(
            external_port = desired.external_port,
            internal_port,
            %internal_client,
            "Adding port mapping"
        );
        self.router
            .add_mapping(
                desired.external_port,
                Protocol::Tcp,
                internal_port,
                internal_client,
                true,
                MAPPING_DESCRIPTION,
            )
            .await
    }

    /// Remove the established mapping, cycling the listener when this is
    /// the only server on the LAN. Returns the new status on a flip.
    async fn remove_with_cycle(&self) -> Option<NatStatus> {
        let (mapping_present, old_port) = {
            let state = self.state.lock().await;
            (state.mapping_present, state.applied_external_port)
        };
        if !mapping_present {
            return None;
        }

        let config = self.store.snapshot();
        let cycle = config.upnp.is_only_server_on_lan && self.server.is_online();
        if cycle {
            self.set_listener_online(false).await;
        }
        let status = self.remove_now(old_port).await;
        if cycle {
            self.set_listener_online(true).await;
        }
        status
    }

    /// Provider-level removal. A failure leaves `mapping_present` as it was.
    async fn remove_now(&self, external_port: u16) -> Option<NatStatus> {
        match self.router.remove_mapping(external_port, Protocol::Tcp).await {
            Ok(()) => {
                tracing::info!(external_port, "Port mapping removed");
                let mut state = self.state.lock().await;
                let flipped = state.mapping_present;
                state.mapping_present = false;
                flipped.then(|| state.status())
            }
            Err(error) => {
                tracing::warn!(%error, external_port, "Failed to remove port mapping");
                None
            }
        }
    }

    async fn sweep_stale_mappings(&self, config: &AppConfig) -> Result<(), RouterError> {
        let internal_client = self.server.network_address();
        let internal_port = self.server.port();

        for mapping in self.router.port_mappings().await? {
            if mapping.description != MAPPING_DESCRIPTION {
                continue;
            }
            let current = mapping.external_port == config.upnp.external_port
                && mapping.internal_port == internal_port
                && mapping.protocol == Protocol::Tcp
                && internal_client
                    .map(|client| mapping.internal_client == client)
                    .unwrap_or(true);
            if !current {
                tracing::info!(
                    external_port = mapping.external_port,
                    internal_port = mapping.internal_port,
                    "Removing stale port mapping"
                );
                self.router
                    .remove_mapping(mapping.external_port, mapping.protocol)
                    .await?;
            }
        }
        Ok(())
    }

    async fn set_listener_online(&self, online: bool) {
        if let Err(error) = self.server.set_online(online).await {
            tracing::warn!(%error, online, "Failed to cycle listener");
        }
    }

    fn raise_state_changed(&self, mut status: NatStatus) {
        tracing::debug!(
            router_present = status.router_present,
            mapping_present = status.mapping_present,
            "NAT state changed"
        );
        self.state_changed.raise(&mut status);
    }
}
