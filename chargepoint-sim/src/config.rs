//! Configuration for a simulated charge point

use std::time::Duration;

use thiserror::Error;

use crate::ocpp::correlation::DEFAULT_RESPONSE_TIMEOUT;

/// Environment variable overriding the response timeout, in milliseconds
pub const RESPONSE_TIMEOUT_ENV: &str = "RESPONSE_TIMEOUT";

/// Default bound on the WebSocket opening handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid central system URL: {0}")]
    InvalidUrl(String),

    #[error("Charge point identity is empty")]
    MissingIdentity,

    #[error("Invalid {name} value {value:?}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Charge point configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargePointConfig {
    /// Central system WebSocket URL, including the identity path segment
    pub url: String,

    /// Charge point identity; keys the keystore and tags every log line
    pub identity: String,

    /// How long an outbound call may wait for its reply once transmitted
    pub response_timeout: Duration,

    /// How long `connect` waits for TCP, TLS and the WebSocket upgrade
    pub connect_timeout: Duration,

    pub max_message_size: usize,
    pub max_frame_size: usize,
}

impl Default for ChargePointConfig {
    fn default() -> Self {
        Self::new("ws://localhost:8180/steve/websocket/CentralSystemService/CP-1")
    }
}

impl ChargePointConfig {
    /// Create config for a URL; the identity is its last path segment
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            identity: identity_from_url(&url),
            url,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_message_size: 1 << 20,
            max_frame_size: 1 << 18,
        }
    }

    /// Override the identity derived from the URL
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Apply `RESPONSE_TIMEOUT` from the process environment
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_vars<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(RESPONSE_TIMEOUT_ENV) {
            let millis: u64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidValue {
                    name: RESPONSE_TIMEOUT_ENV,
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?;
            self.response_timeout = Duration::from_millis(millis);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let scheme_ok = self.url.starts_with("ws://") || self.url.starts_with("wss://");
        if !scheme_ok {
            return Err(ConfigError::InvalidUrl(self.url.clone()));
        }
        if self.identity.is_empty() {
            return Err(ConfigError::MissingIdentity);
        }
        if self.response_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "response timeout",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "connect timeout",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn is_secure(&self) -> bool {
        self.url.starts_with("wss://")
    }
}

/// Last non-empty path segment of a URL
pub fn identity_from_url(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ChargePointConfig::new("ws://localhost:8100/ocpp/CP-42")
            .with_response_timeout(Duration::from_millis(500))
            .with_max_frame_size(4096);

        assert_eq!(config.identity, "CP-42");
        assert_eq!(config.response_timeout, Duration::from_millis(500));
        assert_eq!(config.max_frame_size, 4096);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(!config.is_secure());
        assert!(config.validate().is_ok());

        let config = config.with_identity("other");
        assert_eq!(config.identity, "other");
    }

    #[test]
    fn test_identity_from_url() {
        assert_eq!(identity_from_url("wss://cs.example.com/ocpp/CP-1"), "CP-1");
        assert_eq!(identity_from_url("ws://localhost:8100/CP-2/"), "CP-2");
    }

    #[test]
    fn test_default_timeout() {
        assert_eq!(
            ChargePointConfig::default().response_timeout,
            Duration::from_millis(15_000)
        );
    }

    #[test]
    fn test_response_timeout_override() {
        let config = ChargePointConfig::default()
            .apply_vars(|name| (name == RESPONSE_TIMEOUT_ENV).then(|| "2500".to_string()))
            .unwrap();
        assert_eq!(config.response_timeout, Duration::from_millis(2500));

        let err = ChargePointConfig::default()
            .apply_vars(|_| Some("soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: RESPONSE_TIMEOUT_ENV, .. }));

        let unchanged = ChargePointConfig::default().apply_vars(|_| None).unwrap();
        assert_eq!(unchanged, ChargePointConfig::default());
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            ChargePointConfig::new("http://localhost/CP-1").validate(),
            Err(ConfigError::InvalidUrl("http://localhost/CP-1".to_string()))
        );
        assert_eq!(
            ChargePointConfig::new("ws://localhost/CP-1")
                .with_identity("")
                .validate(),
            Err(ConfigError::MissingIdentity)
        );
        assert!(ChargePointConfig::new("ws://localhost/CP-1")
            .with_response_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(matches!(
            ChargePointConfig::new("ws://localhost/CP-1")
                .with_connect_timeout(Duration::ZERO)
                .validate(),
            Err(ConfigError::InvalidValue { name: "connect timeout", .. })
        ));
    }
}
