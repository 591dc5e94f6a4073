//! Observability subsystem.
//!
//! Structured logging only: every subsystem emits `tracing` events with
//! key-value fields, and the binary installs one subscriber at startup.
//! The library itself never installs a subscriber; embedders keep control
//! of their own logging stack.

pub mod logging;
