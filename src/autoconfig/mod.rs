//! Auto-configuration subsystem.
//!
//! # Data Flow
//! ```text
//! config store (snapshots, changed event)  ─┐
//! external-IP service (lookup, updates)    ─┼─▶ orchestrator.rs ─▶ WebServer properties
//! heartbeat (periodic tick, tick-now)      ─┘
//! ```
//!
//! # Design Decisions
//! - The orchestrator owns no policy of its own: it re-applies whatever the
//!   latest config snapshot says, on every change
//! - The external-IP probe runs until it succeeds once, then goes quiet;
//!   failures back off for a fixed cooldown instead of hammering the endpoint

pub mod external_ip;
pub mod heartbeat;
pub mod orchestrator;

pub use external_ip::{ExternalIpError, ExternalIpProvider, ExternalIpService, HttpExternalIp};
pub use heartbeat::Heartbeat;
pub use orchestrator::AutoConfig;
