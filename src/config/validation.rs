//! Configuration validation.
//!
//! Semantic checks on top of what serde already enforces syntactically.
//! Returns every violation, not just the first.

use thiserror::Error;

use crate::config::schema::AppConfig;

/// A single semantic violation found in a configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("listener.port must not be zero")]
    ListenerPortZero,

    #[error("listener.root must not contain whitespace: {0:?}")]
    RootContainsWhitespace(String),

    #[error("upnp.external_port must not be zero when upnp is enabled")]
    ExternalPortZero,

    #[error("external_ip.endpoint must not be empty")]
    ExternalIpEndpointEmpty,

    #[error("external_ip.timeout_secs must not be zero")]
    ExternalIpTimeoutZero,
}

/// Validate a parsed configuration.
pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.port == 0 {
        errors.push(ValidationError::ListenerPortZero);
    }
    if config.listener.root.chars().any(char::is_whitespace) {
        errors.push(ValidationError::RootContainsWhitespace(
            config.listener.root.clone(),
        ));
    }
    if config.upnp.enabled && config.upnp.external_port == 0 {
        errors.push(ValidationError::ExternalPortZero);
    }
    if config.external_ip.endpoint.trim().is_empty() {
        errors.push(ValidationError::ExternalIpEndpointEmpty);
    }
    if config.external_ip.timeout_secs == 0 {
        errors.push(ValidationError::ExternalIpTimeoutZero);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
