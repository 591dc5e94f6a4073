//! Embedded web listener subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming HTTP request
//!     → provider (accept loop transport, one outstanding accept)
//!     → server.rs (authentication, ordered request events)
//!     → application handlers fill the response
//!     → provider sends the response, telemetry event fires
//! ```
//!
//! # Design Decisions
//! - The transport sits behind `ListenerProvider` so the request pipeline is
//!   testable without sockets and the HTTP engine is swappable
//! - One accept is outstanding at a time; handling a request never blocks
//!   accepting the next one
//! - Stopping the listener abandons the in-flight accept silently

pub mod auth;
pub mod context;
pub mod http1;
pub mod provider;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::AuthenticationArgs;
pub use auth::AuthenticationScheme;
pub use context::{ContentClassification, HttpRequest, HttpResponse, RequestContext};
pub use http1::Http1Provider;
pub use provider::{AcceptError, ListenerError, ListenerProvider};
pub use server::{ResponseSentArgs, ServerError, WebServer};
