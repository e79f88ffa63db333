use std::{collections::HashSet, time::Duration};

use keyward_clock::DurationSecs;

use crate::jwa::KeyType;

/// Where Apple publishes the keys that sign its identity tokens
pub const APPLE_KEYS_URL: &str = "https://appleid.apple.com/auth/keys";

/// The issuer of Apple identity tokens
pub const APPLE_ISSUER: &str = "https://appleid.apple.com";

/// How long a fetched key set is trusted before it is refreshed
pub const DEFAULT_TTL: DurationSecs = DurationSecs::DAY;

/// How long a single key-set fetch may take
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a [`KeyCache`][crate::KeyCache]
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub struct KeyCacheConfig {
    ttl: DurationSecs,
    fetch_timeout: Duration,
    endpoint: String,
    accepted_key_types: HashSet<KeyType>,
}

impl Default for KeyCacheConfig {
    /// Default cache configuration
    ///
    /// Trusts Apple's RSA signing keys for a day, allowing ten seconds for
    /// each fetch.
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            endpoint: APPLE_KEYS_URL.to_owned(),
            accepted_key_types: std::iter::once(KeyType::Rsa).collect(),
        }
    }
}

impl KeyCacheConfig {
    /// Sets how long a fetched key set is trusted
    pub fn with_ttl(self, ttl: DurationSecs) -> Self {
        Self { ttl, ..self }
    }

    /// Sets the bound on a single fetch
    pub fn with_fetch_timeout(self, fetch_timeout: Duration) -> Self {
        Self {
            fetch_timeout,
            ..self
        }
    }

    /// Sets the URL the key set is fetched from
    pub fn with_endpoint(self, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..self
        }
    }

    /// Replaces the set of key types retained from fetched key sets
    pub fn with_accepted_key_types<I: IntoIterator<Item = KeyType>>(self, types: I) -> Self {
        Self {
            accepted_key_types: types.into_iter().collect(),
            ..self
        }
    }

    /// Adds a key type to those retained from fetched key sets
    pub fn accept_key_type(mut self, kty: KeyType) -> Self {
        self.accepted_key_types.insert(kty);
        self
    }

    /// How long a fetched key set is trusted
    #[must_use]
    pub fn ttl(&self) -> DurationSecs {
        self.ttl
    }

    /// The bound on a single fetch
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// The URL the key set is fetched from
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The key types retained from fetched key sets
    #[must_use]
    pub fn accepted_key_types(&self) -> &HashSet<KeyType> {
        &self.accepted_key_types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_apple() {
        let config = KeyCacheConfig::default();

        assert_eq!(config.ttl(), DurationSecs::from_hours(24));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(10));
        assert_eq!(config.endpoint(), "https://appleid.apple.com/auth/keys");
        assert_eq!(config.accepted_key_types().len(), 1);
        assert!(config.accepted_key_types().contains(&KeyType::Rsa));
    }

    #[test]
    fn setters_override_defaults() {
        let config = KeyCacheConfig::default()
            .with_ttl(DurationSecs::HOUR)
            .with_fetch_timeout(Duration::from_secs(2))
            .with_endpoint("http://localhost/keys")
            .accept_key_type(KeyType::OctetKeyPair);

        assert_eq!(config.ttl(), DurationSecs(3600));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(2));
        assert_eq!(config.endpoint(), "http://localhost/keys");
        assert!(config.accepted_key_types().contains(&KeyType::OctetKeyPair));

        let ec_only = config.with_accepted_key_types(vec![KeyType::EllipticCurve]);
        assert!(!ec_only.accepted_key_types().contains(&KeyType::Rsa));
    }
}
