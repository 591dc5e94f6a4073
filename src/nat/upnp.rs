//! UPnP router provider backed by igd-next.

use std::net::SocketAddr;

use async_trait::async_trait;
use igd_next::aio::tokio::Tokio;
use igd_next::aio::Gateway;
use igd_next::{GetGenericPortMappingEntryError, PortMappingProtocol, SearchOptions};

use crate::nat::provider::{PortMapping, Protocol, RouterError, RouterProvider};

impl From<Protocol> for PortMappingProtocol {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => PortMappingProtocol::TCP,
            Protocol::Udp => PortMappingProtocol::UDP,
        }
    }
}

/// Talks UPnP IGD to whatever gateway answers the SSDP search.
pub struct IgdRouter {
    gateway: tokio::sync::Mutex<Option<Gateway<Tokio>>>,
}

impl IgdRouter {
    pub fn new() -> Self {
        Self {
            gateway: tokio::sync::Mutex::new(None),
        }
    }
}

impl Default for IgdRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouterProvider for IgdRouter {
    async fn discover(&self) -> Result<(), RouterError> {
        let gateway = igd_next::aio::tokio::search_gateway(SearchOptions::default())
            .await
            .map_err(|error| RouterError::Discovery(error.to_string()))?;
        tracing::info!(gateway = %gateway.addr, "UPnP gateway found");
        *self.gateway.lock().await = Some(gateway);
        Ok(())
    }

    async fn port_mappings(&self) -> Result<Vec<PortMapping>, RouterError> {
        let guard = self.gateway.lock().await;
        let gateway = guard.as_ref().ok_or(RouterError::NotConnected)?;

        let mut mappings = Vec::new();
        for index in 0u32.. {
            match gateway.get_generic_port_mapping_entry(index).await {
                Ok(entry) => {
                    let Ok(internal_client) = entry.internal_client.parse() else {
                        continue;
                    };
                    mappings.push(PortMapping {
                        description: entry.port_mapping_description,
                        external_port: entry.external_port,
                        internal_client,
                        internal_port: entry.internal_port,
                        protocol: match entry.protocol {
                            PortMappingProtocol::TCP => Protocol::Tcp,
                            PortMappingProtocol::UDP => Protocol::Udp,
                        },
                    });
                }
                Err(GetGenericPortMappingEntryError::SpecifiedArrayIndexInvalid) => break,
                Err(error) => return Err(RouterError::List(error.to_string())),
            }
        }
        Ok(mappings)
    }

    async fn add_mapping(
        &self,
        external_port: u16,
        protocol: Protocol,
        internal_port: u16,
        internal_client: std::net::IpAddr,
        enabled: bool,
        description: &str,
    ) -> Result<(), RouterError> {
        // IGD rules are always added enabled; a disabled rule is not added.
        if !enabled {
            return Ok(());
        }

        let guard = self.gateway.lock().await;
        let gateway = guard.as_ref().ok_or(RouterError::NotConnected)?;
        gateway
            .add_port(
                protocol.into(),
                external_port,
                SocketAddr::new(internal_client, internal_port),
                0, // permanent lease
                description,
            )
            .await
            .map_err(|error| RouterError::Add(error.to_string()))
    }

    async fn remove_mapping(
        &self,
        external_port: u16,
        protocol: Protocol,
    ) -> Result<(), RouterError> {
        let guard = self.gateway.lock().await;
        let gateway = guard.as_ref().ok_or(RouterError::NotConnected)?;
        gateway
            .remove_port(protocol.into(), external_port)
            .await
            .map_err(|error| RouterError::Remove(error.to_string()))
    }
}
