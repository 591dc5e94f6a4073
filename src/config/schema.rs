//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the embedded
//! server. All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::listener::AuthenticationScheme;

/// Root configuration for the embedded web server.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Listener configuration (port, site root, authentication).
    pub listener: ListenerSettings,

    /// UPnP port-forwarding settings.
    pub upnp: UpnpSettings,

    /// External IP discovery settings.
    pub external_ip: ExternalIpSettings,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerSettings {
    /// Port the listener binds on the local machine.
    pub port: u16,

    /// Site root every served path hangs off (e.g. "/Radar").
    pub root: String,

    /// Authentication scheme requests must satisfy.
    pub scheme: AuthenticationScheme,

    /// Remember validated Basic credentials per client address.
    pub cache_credentials: bool,

    /// Allow handlers to opt responses into gzip compression.
    pub compression_enabled: bool,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            root: "/".to_string(),
            scheme: AuthenticationScheme::Anonymous,
            cache_credentials: false,
            compression_enabled: true,
        }
    }
}

/// UPnP port-forwarding settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct UpnpSettings {
    /// Ask the router to forward a port to this machine.
    pub enabled: bool,

    /// Port the router should expose to the Internet.
    pub external_port: u16,

    /// This is the only server on the LAN using the router's mapping; open
    /// connections are dropped before the mapping is torn down.
    pub is_only_server_on_lan: bool,
}

impl Default for UpnpSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            external_port: 8080,
            is_only_server_on_lan: false,
        }
    }
}

/// External IP discovery settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ExternalIpSettings {
    /// IP-echo endpoint returning the caller's public address as plain text.
    pub endpoint: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ExternalIpSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.ipify.org".to_string(),
            timeout_secs: 10,
        }
    }
}
