//! Transport abstraction for the web listener.

use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;

use crate::listener::context::RequestContext;

/// Error type for listener start/configuration operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("listener prefix {0:?} is not valid")]
    InvalidPrefix(String),

    #[error("listener prefix has not been configured")]
    PrefixNotSet,
}

/// Why an accept attempt produced no request.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The listener stopped while the accept was outstanding. The accept
    /// loop retries while the provider still reports itself listening and
    /// stops silently otherwise.
    #[error("listener closed while accepting")]
    ListenerClosed,

    /// The listener itself is gone; the accept loop stops silently.
    #[error("listener is gone")]
    ListenerGone,

    /// Anything else. Surfaced through the exception event; the accept loop
    /// stops.
    #[error("accept failed: {0}")]
    Fatal(#[source] std::io::Error),
}

/// The transport under the web server.
///
/// Implementations own the socket, parse inbound requests and send buffered
/// responses when a context's response sink is closed.
#[async_trait]
pub trait ListenerProvider: Send + Sync + 'static {
    /// Configure the listener prefix, e.g. `http://*:8080/Radar/`. Applied
    /// on the next `start`.
    fn set_prefix(&self, prefix: &str) -> Result<(), ListenerError>;

    /// Bind and begin receiving connections.
    async fn start(&self) -> Result<(), ListenerError>;

    /// Stop receiving connections. Outstanding `accept` calls complete with
    /// [`AcceptError::ListenerClosed`].
    fn stop(&self);

    fn is_listening(&self) -> bool;

    /// The address the socket is actually bound to, once started.
    fn bound_addr(&self) -> Option<SocketAddr>;

    /// Server-level switch allowing responses to be compressed at all.
    fn set_compression_enabled(&self, enabled: bool);

    /// Wait for the next inbound request. At most one call is outstanding
    /// at a time.
    async fn accept(&self) -> Result<RequestContext, AcceptError>;
}
