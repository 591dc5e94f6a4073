//! Self-hosted web server with automatic Internet reachability.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌────────────────────────────────────────────────┐
//!                    │                   PORTSIDE                      │
//!                    │                                                 │
//!   HTTP request     │  ┌──────────┐    ┌──────────┐                  │
//!   ─────────────────┼─▶│ listener │───▶│ request  │──▶ app handlers  │
//!                    │  │ (accept) │    │ pipeline │    + response/   │
//!                    │  └──────────┘    └──────────┘                  │
//!                    │        ▲                                        │
//!                    │        │ port / root / external address         │
//!                    │  ┌─────┴──────┐         ┌──────────────┐       │
//!                    │  │ autoconfig │◀────────│ config store │       │
//!                    │  └────────────┘         └──────┬───────┘       │
//!                    │        │ external IP probe     │ UPnP settings │
//!                    │        ▼                       ▼               │
//!                    │  ┌────────────┐         ┌──────────────┐       │
//!                    │  │ heartbeat/ │         │ NAT manager  │──▶ router
//!                    │  │ ip service │         │ (port map)   │       │
//!                    │  └────────────┘         └──────────────┘       │
//!                    └────────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod config;
pub mod listener;
pub mod response;

// Reachability
pub mod autoconfig;
pub mod nat;

// Cross-cutting concerns
pub mod clock;
pub mod events;
pub mod observability;

pub use config::AppConfig;
pub use listener::{Http1Provider, WebServer};
pub use nat::{IgdRouter, NatManager};
