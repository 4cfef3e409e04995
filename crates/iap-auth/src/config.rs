//! Assertion validation configuration.
//!
//! Configuration is loaded from environment variables. Every value has a
//! default suitable for an App Engine / Compute Engine deployment behind IAP.

use common::jwt::{DEFAULT_CLOCK_SKEW, MAX_CLOCK_SKEW};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Well-known IAP public key endpoint (PEM map format).
pub const DEFAULT_PUBLIC_KEY_URL: &str = "https://www.gstatic.com/iap/verify/public_key";

/// Project metadata directory on the local metadata server.
pub const DEFAULT_METADATA_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/project/";

/// Default timeout for each outbound request in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECONDS: u64 = 5;

/// Upper bound for the outbound request timeout in seconds.
pub const MAX_HTTP_TIMEOUT_SECONDS: u64 = 60;

/// Upper bound for the minimum key refresh interval in seconds.
pub const MAX_KEY_REFRESH_MIN_INTERVAL_SECONDS: u64 = 3600;

/// Request header that carries the assertion, set by the gateway.
pub const ASSERTION_HEADER: &str = "x-goog-iap-jwt-assertion";

/// Assertion validation configuration.
#[derive(Clone)]
pub struct Config {
    /// URL of the identity provider's public key set.
    pub public_key_url: String,

    /// Base URL of the project metadata directory.
    pub metadata_url: String,

    /// Audience to expect instead of resolving it from metadata.
    pub expected_audience: Option<String>,

    /// Issuer to require in the `iss` claim. Not checked when unset.
    pub expected_issuer: Option<String>,

    /// Timeout applied to every outbound request.
    pub http_timeout: Duration,

    /// Leeway applied to `exp`, `nbf` and `iat`.
    pub clock_skew: Duration,

    /// Minimum age of the cached key set before an unknown key id may force
    /// a refresh. Zero refreshes on every miss.
    pub key_refresh_min_interval: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("public_key_url", &self.public_key_url)
            .field("metadata_url", &self.metadata_url)
            .field("expected_audience", &self.expected_audience)
            .field("expected_issuer", &self.expected_issuer)
            .field("http_timeout_seconds", &self.http_timeout.as_secs())
            .field("clock_skew_seconds", &self.clock_skew.as_secs())
            .field(
                "key_refresh_min_interval_seconds",
                &self.key_refresh_min_interval.as_secs(),
            )
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            public_key_url: DEFAULT_PUBLIC_KEY_URL.to_string(),
            metadata_url: DEFAULT_METADATA_URL.to_string(),
            expected_audience: None,
            expected_issuer: None,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECONDS),
            clock_skew: DEFAULT_CLOCK_SKEW,
            key_refresh_min_interval: Duration::ZERO,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid URL configuration: {0}")]
    InvalidUrl(String),

    #[error("Invalid expected audience: {0}")]
    InvalidAudience(String),

    #[error("Invalid expected issuer: {0}")]
    InvalidIssuer(String),

    #[error("Invalid HTTP timeout configuration: {0}")]
    InvalidHttpTimeout(String),

    #[error("Invalid JWT clock skew configuration: {0}")]
    InvalidJwtClockSkew(String),

    #[error("Invalid key refresh interval configuration: {0}")]
    InvalidKeyRefreshInterval(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let public_key_url = non_empty_url(vars, "IAP_PUBLIC_KEY_URL", DEFAULT_PUBLIC_KEY_URL)?;
        let metadata_url = non_empty_url(vars, "IAP_METADATA_URL", DEFAULT_METADATA_URL)?;

        let expected_audience = match vars.get("IAP_EXPECTED_AUDIENCE") {
            Some(value) if !value.starts_with("/projects/") => {
                return Err(ConfigError::InvalidAudience(format!(
                    "IAP_EXPECTED_AUDIENCE must start with '/projects/', got '{}'",
                    value
                )));
            }
            other => other.cloned(),
        };

        let expected_issuer = match vars.get("IAP_EXPECTED_ISSUER") {
            Some(value) if value.trim().is_empty() => {
                return Err(ConfigError::InvalidIssuer(
                    "IAP_EXPECTED_ISSUER must not be empty when set".to_string(),
                ));
            }
            other => other.cloned(),
        };

        let http_timeout = if let Some(value_str) = vars.get("IAP_HTTP_TIMEOUT_SECONDS") {
            let value: u64 = value_str.parse().map_err(|e| {
                ConfigError::InvalidHttpTimeout(format!(
                    "IAP_HTTP_TIMEOUT_SECONDS must be a valid positive integer, got '{}': {}",
                    value_str, e
                ))
            })?;

            if value == 0 || value > MAX_HTTP_TIMEOUT_SECONDS {
                return Err(ConfigError::InvalidHttpTimeout(format!(
                    "IAP_HTTP_TIMEOUT_SECONDS must be between 1 and {}, got {}",
                    MAX_HTTP_TIMEOUT_SECONDS, value
                )));
            }

            Duration::from_secs(value)
        } else {
            Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECONDS)
        };

        let clock_skew = if let Some(value_str) = vars.get("JWT_CLOCK_SKEW_SECONDS") {
            let value: u64 = value_str.parse().map_err(|e| {
                ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must be a valid positive integer, got '{}': {}",
                    value_str, e
                ))
            })?;

            if value == 0 {
                return Err(ConfigError::InvalidJwtClockSkew(
                    "JWT_CLOCK_SKEW_SECONDS must be positive, got 0".to_string(),
                ));
            }

            if value > MAX_CLOCK_SKEW.as_secs() {
                return Err(ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must not exceed {} seconds, got {}",
                    MAX_CLOCK_SKEW.as_secs(),
                    value
                )));
            }

            Duration::from_secs(value)
        } else {
            DEFAULT_CLOCK_SKEW
        };

        let key_refresh_min_interval =
            if let Some(value_str) = vars.get("IAP_KEY_REFRESH_MIN_INTERVAL_SECONDS") {
                let value: u64 = value_str.parse().map_err(|e| {
                    ConfigError::InvalidKeyRefreshInterval(format!(
                        "IAP_KEY_REFRESH_MIN_INTERVAL_SECONDS must be a non-negative integer, got '{}': {}",
                        value_str, e
                    ))
                })?;

                if value > MAX_KEY_REFRESH_MIN_INTERVAL_SECONDS {
                    return Err(ConfigError::InvalidKeyRefreshInterval(format!(
                        "IAP_KEY_REFRESH_MIN_INTERVAL_SECONDS must not exceed {} seconds, got {}",
                        MAX_KEY_REFRESH_MIN_INTERVAL_SECONDS, value
                    )));
                }

                Duration::from_secs(value)
            } else {
                Duration::ZERO
            };

        Ok(Config {
            public_key_url,
            metadata_url,
            expected_audience,
            expected_issuer,
            http_timeout,
            clock_skew,
            key_refresh_min_interval,
        })
    }
}

fn non_empty_url(
    vars: &HashMap<String, String>,
    name: &str,
    default: &str,
) -> Result<String, ConfigError> {
    match vars.get(name) {
        None => Ok(default.to_string()),
        Some(value) if value.starts_with("http://") || value.starts_with("https://") => {
            Ok(value.clone())
        }
        Some(value) => Err(ConfigError::InvalidUrl(format!(
            "{} must be an http(s) URL, got '{}'",
            name, value
        ))),
    }
}
