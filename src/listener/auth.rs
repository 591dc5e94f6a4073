//! Request authentication and credential caching.
//!
//! # Responsibilities
//! - Parse Basic credentials out of the Authorization header
//! - Remember validated (address, user, password) triples while credential
//!   caching is switched on
//! - Model the schemes the listener accepts

use std::net::IpAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dashmap::DashMap;
use http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Authentication scheme requests must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationScheme {
    /// No authentication is performed.
    None,
    /// Explicitly anonymous; requests are admitted without a challenge.
    #[default]
    Anonymous,
    /// RFC 7617 Basic challenge/response.
    Basic,
    /// Accepted in configuration but not implemented by the listener;
    /// requests are rejected before the pipeline runs.
    Digest,
}

impl std::fmt::Display for AuthenticationScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuthenticationScheme::None => "none",
            AuthenticationScheme::Anonymous => "anonymous",
            AuthenticationScheme::Basic => "basic",
            AuthenticationScheme::Digest => "digest",
        };
        f.write_str(name)
    }
}

/// Raised when a Basic request needs validating. Handlers set
/// `is_authenticated`; it defaults to false.
#[derive(Debug, Clone)]
pub struct AuthenticationArgs {
    pub address: IpAddr,
    pub user: String,
    pub password: String,
    pub is_authenticated: bool,
}

/// Key for one remembered credential triple.
pub type CredentialKey = (IpAddr, String, String);

/// Short-lived memo of already-validated Basic credentials.
///
/// Entries exist only while credential caching is enabled; the owner clears
/// the cache wholesale when the flag turns off or on explicit reset.
#[derive(Default)]
pub struct CredentialCache {
    entries: DashMap<CredentialKey, bool>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when this triple has already been validated.
    pub fn is_valid(&self, key: &CredentialKey) -> bool {
        self.entries.get(key).map(|entry| *entry).unwrap_or(false)
    }

    pub fn remember(&self, key: CredentialKey) {
        self.entries.insert(key, true);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Extract Basic credentials from an Authorization header.
///
/// Returns `(user, password)` when the header carries a well-formed Basic
/// token, `None` otherwise.
pub fn parse_basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use http::header::AUTHORIZATION;

    fn basic_header(user: &str, password: &str) -> HeaderMap {
        let token = BASE64.encode(format!("{user}:{password}"));
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            format!("Basic {token}").parse().unwrap(),
        );
        headers
    }

    #[test]
    fn parses_well_formed_basic_header() {
        let headers = basic_header("deborah", "s3cret");
        assert_eq!(
            parse_basic_credentials(&headers),
            Some(("deborah".to_string(), "s3cret".to_string()))
        );
    }

    #[test]
    fn password_may_contain_colons() {
        let headers = basic_header("deborah", "a:b:c");
        assert_eq!(
            parse_basic_credentials(&headers),
            Some(("deborah".to_string(), "a:b:c".to_string()))
        );
    }

    #[test]
    fn rejects_missing_or_malformed_headers() {
        assert_eq!(parse_basic_credentials(&HeaderMap::new()), None);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abcdef".parse().unwrap());
        assert_eq!(parse_basic_credentials(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Basic !!notbase64!!".parse().unwrap());
        assert_eq!(parse_basic_credentials(&headers), None);
    }

    #[test]
    fn cache_remembers_and_clears() {
        let cache = CredentialCache::new();
        let key = (
            "192.0.2.1".parse().unwrap(),
            "user".to_string(),
            "pass".to_string(),
        );

        assert!(!cache.is_valid(&key));
        cache.remember(key.clone());
        assert!(cache.is_valid(&key));

        cache.clear();
        assert!(!cache.is_valid(&key));
        assert!(cache.is_empty());
    }

    #[test]
    fn scheme_parses_from_config_names() {
        let scheme: AuthenticationScheme = serde_json::from_str("\"basic\"").unwrap();
        assert_eq!(scheme, AuthenticationScheme::Basic);
        let scheme: AuthenticationScheme = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(scheme, AuthenticationScheme::None);
    }
}
