//! NAT traversal subsystem.
//!
//! # Data Flow
//! ```text
//! config store (UPnP settings)  ─┐
//! listener (port, LAN address)  ─┼─▶ manager.rs ─▶ router provider (UPnP)
//! listener lifecycle            ─┘
//! ```
//!
//! # Design Decisions
//! - The router sits behind `RouterProvider`; discovery and SOAP details
//!   never leak into the reconciliation logic
//! - Provider failures degrade the presence flags and get logged; nothing
//!   here ever takes the application down

pub mod manager;
pub mod provider;
pub mod upnp;

pub use manager::{NatError, NatManager, NatStatus, MAPPING_DESCRIPTION};
pub use provider::{detect_lan_address, PortMapping, Protocol, RouterError, RouterProvider};
pub use upnp::IgdRouter;
