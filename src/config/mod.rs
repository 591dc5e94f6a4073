//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → AppConfig (validated, immutable)
//!     → store.rs (atomic snapshot swap + changed event)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → store.rs swaps the snapshot and notifies subscribers
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; consumers hold `Arc<AppConfig>` snapshots
//! - All fields have defaults to allow minimal configs
//! - A failed reload keeps the current configuration in place

pub mod loader;
pub mod schema;
pub mod store;
pub mod validation;
pub mod watcher;

pub use schema::AppConfig;
pub use schema::ExternalIpSettings;
pub use schema::ListenerSettings;
pub use schema::UpnpSettings;
pub use store::ConfigStore;
