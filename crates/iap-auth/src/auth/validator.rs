//! Assertion validation.
//!
//! Authenticates one request by verifying its IAP assertion against the
//! cached key set and the resolved audience.
//!
//! # Security
//!
//! - Assertions are size-checked BEFORE parsing (DoS prevention)
//! - Only ES256 is accepted
//! - `aud` must equal the resolved audience exactly
//! - `exp`/`nbf` are checked with the configured leeway, `iat` may not be in
//!   the future beyond the same leeway
//! - Every failure carries the same generic message; the cause is logged

use crate::auth::audience::{AudienceIdentifier, AudienceResolver};
use crate::auth::identity::{AssertionClaims, Identity};
use crate::auth::keys::{KeyAuthority, VerificationKeySet};
use crate::config::Config;
use crate::errors::ValidationError;
use crate::observability::metrics;
use common::jwt::{decode_header_unverified, validate_iat};
use jsonwebtoken::{decode, Algorithm, Validation};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

/// Assertion validator backed by a key authority and an audience resolver.
pub struct AssertionValidator {
    keys: Arc<KeyAuthority>,
    audience: Arc<AudienceResolver>,
    clock_skew: Duration,
    expected_issuer: Option<String>,
}

impl AssertionValidator {
    /// Create a validator from already constructed components.
    ///
    /// # Arguments
    ///
    /// * `keys` - Source of verification keys
    /// * `audience` - Source of the expected audience
    /// * `clock_skew` - Leeway for `exp`, `nbf` and `iat`
    pub fn new(
        keys: Arc<KeyAuthority>,
        audience: Arc<AudienceResolver>,
        clock_skew: Duration,
    ) -> Self {
        Self {
            keys,
            audience,
            clock_skew,
            expected_issuer: None,
        }
    }

    /// Require `iss` to equal `issuer`.
    #[must_use]
    pub fn with_expected_issuer(mut self, issuer: String) -> Self {
        self.expected_issuer = Some(issuer);
        self
    }

    /// Build the key authority, audience resolver and validator described by `config`.
    pub fn from_config(config: &Config) -> Self {
        let keys = Arc::new(
            KeyAuthority::new(config.public_key_url.clone(), config.http_timeout)
                .with_min_refresh_interval(config.key_refresh_min_interval),
        );
        let audience = Arc::new(match &config.expected_audience {
            Some(audience) => AudienceResolver::fixed(audience.clone()),
            None => AudienceResolver::from_metadata(config.metadata_url.clone(), config.http_timeout),
        });

        let validator = Self::new(keys, audience, config.clock_skew);
        match &config.expected_issuer {
            Some(issuer) => validator.with_expected_issuer(issuer.clone()),
            None => validator,
        }
    }

    pub fn key_authority(&self) -> &Arc<KeyAuthority> {
        &self.keys
    }

    pub fn audience_resolver(&self) -> &Arc<AudienceResolver> {
        &self.audience
    }

    /// Validate an assertion and return the caller's identity.
    ///
    /// # Security Checks
    ///
    /// 1. Size and header check (ES256, non-empty `kid`)
    /// 2. Resolve the expected audience
    /// 3. Look up `kid`; on a miss, refresh the key set once and look again
    /// 4. Verify the ES256 signature
    /// 5. Validate `aud`, `exp`, `nbf` (and `iss` when configured)
    /// 6. Validate `iat` with clock skew tolerance
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError`. Its `Display` text does not reveal the
    /// cause; use [`ValidationError::reason`] for that.
    #[instrument(skip_all)]
    pub async fn validate(&self, assertion: &str) -> Result<Identity, ValidationError> {
        let start = Instant::now();
        let result = self.validate_with_rotation(assertion).await;

        match &result {
            Ok(identity) => {
                metrics::record_assertion_validation("success", None, start.elapsed());
                tracing::debug!(target: "iap.auth.validator", email = %identity.email, "Assertion validated");
            }
            Err(e) => {
                metrics::record_assertion_validation("error", Some(e.reason()), start.elapsed());
                tracing::warn!(
                    target: "iap.auth.validator",
                    reason = e.reason(),
                    detail = ?e,
                    "Failed to validate assertion"
                );
            }
        }

        result
    }

    async fn validate_with_rotation(&self, assertion: &str) -> Result<Identity, ValidationError> {
        let header = decode_header_unverified(assertion)?;
        let audience = self.audience.get_audience().await?;
        let keys = self.keys.get_keys().await?;

        match self.verify(assertion, &header.kid, &keys, &audience) {
            Err(ValidationError::UnknownKeyId(reported_kid)) => {
                tracing::info!(
                    target: "iap.auth.validator",
                    kid = %reported_kid,
                    epoch = keys.epoch(),
                    "Key id not in cached key set, refreshing"
                );
                self.keys.invalidate_if_current(&keys).await;
                let refreshed = self.keys.get_keys().await?;
                self.verify(assertion, &header.kid, &refreshed, &audience)
            }
            other => other,
        }
    }

    /// Verify an assertion against one key set. Pure; no I/O.
    fn verify(
        &self,
        assertion: &str,
        kid: &str,
        keys: &VerificationKeySet,
        audience: &AudienceIdentifier,
    ) -> Result<Identity, ValidationError> {
        let key = keys
            .get(kid)
            .ok_or_else(|| ValidationError::unknown_key_id(kid))?;

        let mut validation = Validation::new(Algorithm::ES256);
        validation.leeway = self.clock_skew.as_secs();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_audience(&[audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "aud", "sub"]);
        if let Some(issuer) = &self.expected_issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }

        let claims = decode::<AssertionClaims>(assertion, key, &validation)?.claims;

        if claims.aud != audience.as_str() {
            return Err(ValidationError::AudienceMismatch);
        }

        if let Some(iat) = claims.iat {
            validate_iat(iat, self.clock_skew)?;
        }

        Identity::from_claims(claims).ok_or_else(|| {
            ValidationError::MalformedAssertion("assertion lacks email or subject".to_string())
        })
    }
}
