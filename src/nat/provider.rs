//! Router abstraction for port-mapping operations.

use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        })
    }
}

/// One forwarding rule on the router, compared by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub description: String,
    pub external_port: u16,
    pub internal_client: IpAddr,
    pub internal_port: u16,
    pub protocol: Protocol,
}

/// Error type for router operations.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("router discovery failed: {0}")]
    Discovery(String),

    #[error("could not list port mappings: {0}")]
    List(String),

    #[error("could not add port mapping: {0}")]
    Add(String),

    #[error("could not remove port mapping: {0}")]
    Remove(String),

    #[error("no router has been discovered")]
    NotConnected,
}

/// The narrow surface consumed from a UPnP-capable router.
#[async_trait]
pub trait RouterProvider: Send + Sync {
    /// Find the router. Must succeed before any other call is meaningful.
    async fn discover(&self) -> Result<(), RouterError>;

    /// Every forwarding rule currently on the router.
    async fn port_mappings(&self) -> Result<Vec<PortMapping>, RouterError>;

    async fn add_mapping(
        &self,
        external_port: u16,
        protocol: Protocol,
        internal_port: u16,
        internal_client: IpAddr,
        enabled: bool,
        description: &str,
    ) -> Result<(), RouterError>;

    async fn remove_mapping(&self, external_port: u16, protocol: Protocol)
        -> Result<(), RouterError>;
}

/// Best guess at this machine's LAN address.
///
/// Opens a UDP socket towards a public address; no packet is sent, the OS
/// just picks the outbound interface.
pub fn detect_lan_address() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
