//! Error types for the assertion validation subsystem.
//!
//! Fetch errors carry enough detail for logs. `ValidationError` is what the
//! request-handling layer sees: its `Display` text is deliberately the same
//! for every token failure so that an unauthenticated caller learns nothing
//! about why it was rejected. The precise cause is available through
//! [`ValidationError::reason`] and the `Debug` representation.

use common::jwt::AssertionFormatError;
use std::time::Duration;
use thiserror::Error;

/// Failure fetching or parsing the verification key set.
#[derive(Debug, Clone, Error)]
pub enum KeyFetchError {
    /// Transport-level failure (DNS, connect, TLS, body read).
    #[error("public key request failed: {0}")]
    Request(String),

    /// The request did not complete within the configured timeout.
    #[error("public key request timed out after {0:?}")]
    Timeout(Duration),

    /// The endpoint answered with a non-2xx status.
    #[error("public key endpoint returned status {0}")]
    Status(u16),

    /// The body was not a usable key set.
    #[error("invalid public key set: {0}")]
    InvalidKeySet(String),
}

/// Failure resolving the expected audience from instance metadata.
#[derive(Debug, Clone, Error)]
pub enum MetadataError {
    /// Transport-level failure talking to the metadata server.
    #[error("metadata request for {item} failed: {message}")]
    Request { item: &'static str, message: String },

    /// The lookup did not complete within the configured timeout.
    #[error("metadata request for {item} timed out after {timeout:?}")]
    Timeout {
        item: &'static str,
        timeout: Duration,
    },

    /// The metadata server answered with a non-2xx status.
    #[error("metadata request for {item} returned status {status}")]
    Status { item: &'static str, status: u16 },

    /// The value could not be used to build an audience.
    #[error("metadata value for {item} is invalid: {message}")]
    InvalidValue { item: &'static str, message: String },
}

/// Why an assertion was rejected.
///
/// Every token-related variant displays the same generic message. The two
/// infrastructure variants display a different generic message so that a
/// request layer may answer 503 instead of 401 (see [`Self::is_unavailable`]).
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Not a well-formed ES256 compact JWS, or required claims are missing.
    #[error("The assertion is invalid or expired")]
    MalformedAssertion(String),

    /// The `kid` is not in the key set, even after one forced refresh.
    #[error("The assertion is invalid or expired")]
    UnknownKeyId(String),

    /// The signature does not verify against the selected key.
    #[error("The assertion is invalid or expired")]
    SignatureInvalid,

    /// The `aud` claim differs from the resolved audience.
    #[error("The assertion is invalid or expired")]
    AudienceMismatch,

    /// The `iss` claim differs from the configured issuer.
    #[error("The assertion is invalid or expired")]
    IssuerMismatch,

    /// `exp`, `nbf` or `iat` put the assertion outside its validity window.
    #[error("The assertion is invalid or expired")]
    ExpiredOrNotYetValid,

    /// Verification keys could not be fetched.
    #[error("Authentication service unavailable")]
    KeysUnavailable(#[source] KeyFetchError),

    /// The expected audience could not be resolved.
    #[error("Authentication service unavailable")]
    AudienceUnavailable(#[source] MetadataError),
}

/// Longest key id prefix kept in [`ValidationError::UnknownKeyId`].
pub const MAX_REPORTED_KID_CHARS: usize = 64;

impl ValidationError {
    /// `UnknownKeyId` for an untrusted `kid`, truncated to
    /// [`MAX_REPORTED_KID_CHARS`] characters for logging.
    pub fn unknown_key_id(kid: &str) -> Self {
        let mut reported: String = kid.chars().take(MAX_REPORTED_KID_CHARS).collect();
        if reported.len() < kid.len() {
            reported.push_str("...");
        }
        ValidationError::UnknownKeyId(reported)
    }

    /// Bounded label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::MalformedAssertion(_) => "malformed_assertion",
            ValidationError::UnknownKeyId(_) => "unknown_key_id",
            ValidationError::SignatureInvalid => "signature_invalid",
            ValidationError::AudienceMismatch => "audience_mismatch",
            ValidationError::IssuerMismatch => "issuer_mismatch",
            ValidationError::ExpiredOrNotYetValid => "expired_or_not_yet_valid",
            ValidationError::KeysUnavailable(_) => "keys_unavailable",
            ValidationError::AudienceUnavailable(_) => "audience_unavailable",
        }
    }

    /// True when the failure was caused by infrastructure, not by the assertion.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ValidationError::KeysUnavailable(_) | ValidationError::AudienceUnavailable(_)
        )
    }
}

impl From<KeyFetchError> for ValidationError {
    fn from(err: KeyFetchError) -> Self {
        ValidationError::KeysUnavailable(err)
    }
}

impl From<MetadataError> for ValidationError {
    fn from(err: MetadataError) -> Self {
        ValidationError::AudienceUnavailable(err)
    }
}

impl From<AssertionFormatError> for ValidationError {
    fn from(err: AssertionFormatError) -> Self {
        match err {
            AssertionFormatError::IatTooFarInFuture => ValidationError::ExpiredOrNotYetValid,
            other => ValidationError::MalformedAssertion(other.to_string()),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for ValidationError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidSignature
            | ErrorKind::InvalidEcdsaKey
            | ErrorKind::InvalidKeyFormat
            | ErrorKind::Crypto(_) => ValidationError::SignatureInvalid,
            ErrorKind::InvalidAudience => ValidationError::AudienceMismatch,
            ErrorKind::InvalidIssuer => ValidationError::IssuerMismatch,
            ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => {
                ValidationError::ExpiredOrNotYetValid
            }
            _ => ValidationError::MalformedAssertion(err.to_string()),
        }
    }
}
