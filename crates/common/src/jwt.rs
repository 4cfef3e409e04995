//! JWT utilities shared by the assertion validator and its test fixtures.
//!
//! This module provides the pieces of assertion handling that do not depend
//! on key material:
//! - Size limits for DoS prevention
//! - Clock skew constants
//! - Unverified header decoding (`kid`, `alg`)
//! - iat validation logic
//!
//! # Security
//!
//! - Assertions are size-checked BEFORE parsing (DoS prevention)
//! - Only ES256 (ECDSA P-256 with SHA-256) is accepted
//! - Header decoding does NOT verify anything; the signature must still be
//!   checked against a trusted key afterwards
//!
//! # Usage
//!
//! ```rust,ignore
//! use common::jwt::{decode_header_unverified, validate_iat, DEFAULT_CLOCK_SKEW};
//!
//! let header = decode_header_unverified(assertion)?;
//! let key = key_set.get(&header.kid);
//!
//! // After signature verification
//! validate_iat(claims.iat, DEFAULT_CLOCK_SKEW)?;
//! ```

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed assertion size in bytes (8KB).
///
/// IAP assertions are well under 1KB (ES256 signature, a handful of claims).
/// Anything larger is rejected before base64 decoding or signature checks.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// The only signing algorithm accepted for assertions.
pub const EXPECTED_ALGORITHM: &str = "ES256";

/// Default clock skew tolerance (60 seconds).
///
/// Matches the default leeway `jsonwebtoken` applies to `exp` and `nbf`.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Maximum allowed clock skew tolerance (10 minutes).
///
/// Guards against configuration that would keep expired assertions alive.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

// =============================================================================
// Error Types
// =============================================================================

/// Errors produced while inspecting an assertion before verification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssertionFormatError {
    /// Assertion size exceeds [`MAX_JWT_SIZE_BYTES`].
    #[error("assertion exceeds {MAX_JWT_SIZE_BYTES} bytes")]
    TooLarge,

    /// Not three dot-separated segments, or the header is not base64url JSON.
    #[error("assertion is not a compact JWS")]
    Malformed,

    /// Header has no usable `kid`.
    #[error("assertion header has no key id")]
    MissingKid,

    /// Header `alg` is absent or not ES256.
    #[error("assertion algorithm {0:?} is not ES256")]
    UnsupportedAlgorithm(Option<String>),

    /// `iat` lies beyond the allowed clock skew.
    #[error("assertion issued-at is too far in the future")]
    IatTooFarInFuture,
}

// =============================================================================
// Header
// =============================================================================

/// The header fields needed to pick a verification key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionHeader {
    /// Key identifier used to look up the public key.
    pub kid: String,

    /// Signing algorithm tag (always [`EXPECTED_ALGORITHM`] once decoded).
    pub alg: String,
}

#[derive(Deserialize)]
struct RawHeader {
    #[serde(default)]
    kid: Option<serde_json::Value>,
    #[serde(default)]
    alg: Option<serde_json::Value>,
}

/// Decode the assertion header without verifying the signature.
///
/// # Errors
///
/// - `TooLarge` if the assertion exceeds [`MAX_JWT_SIZE_BYTES`]
/// - `Malformed` if it is not three segments or the header is not base64url JSON
/// - `UnsupportedAlgorithm` if `alg` is missing or anything other than ES256
/// - `MissingKid` if `kid` is missing, empty or not a string
pub fn decode_header_unverified(token: &str) -> Result<AssertionHeader, AssertionFormatError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Assertion rejected: size exceeds maximum allowed"
        );
        return Err(AssertionFormatError::TooLarge);
    }

    let mut segments = token.split('.');
    let (Some(header_part), Some(_), Some(_), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        tracing::debug!(target: "common.jwt", "Assertion rejected: not three segments");
        return Err(AssertionFormatError::Malformed);
    };

    let header_bytes = URL_SAFE_NO_PAD.decode(header_part).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to decode assertion header base64");
        AssertionFormatError::Malformed
    })?;

    let raw: RawHeader = serde_json::from_slice(&header_bytes).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to parse assertion header JSON");
        AssertionFormatError::Malformed
    })?;

    let alg = raw.alg.as_ref().and_then(serde_json::Value::as_str);
    if alg != Some(EXPECTED_ALGORITHM) {
        return Err(AssertionFormatError::UnsupportedAlgorithm(
            alg.map(ToString::to_string),
        ));
    }

    let kid = raw
        .kid
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or(AssertionFormatError::MissingKid)?;

    Ok(AssertionHeader {
        kid,
        alg: EXPECTED_ALGORITHM.to_string(),
    })
}

// =============================================================================
// Claim checks
// =============================================================================

/// Reject an `iat` more than `clock_skew` in the future.
///
/// # Errors
///
/// Returns `AssertionFormatError::IatTooFarInFuture` when `iat > now + clock_skew`.
pub fn validate_iat(iat: i64, clock_skew: Duration) -> Result<(), AssertionFormatError> {
    validate_iat_at(iat, clock_skew, chrono::Utc::now().timestamp())
}

/// Deterministic `iat` check against an explicit `now`.
///
/// # Errors
///
/// Same as [`validate_iat`].
pub fn validate_iat_at(
    iat: i64,
    clock_skew: Duration,
    now: i64,
) -> Result<(), AssertionFormatError> {
    let skew_secs = i64::try_from(clock_skew.as_secs()).unwrap_or(i64::MAX);
    let max_iat = now.saturating_add(skew_secs);

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat,
            now,
            max_allowed = max_iat,
            "Assertion rejected: iat too far in the future"
        );
        return Err(AssertionFormatError::IatTooFarInFuture);
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn token_with_header(header: &str) -> String {
        format!("{}.payload.signature", URL_SAFE_NO_PAD.encode(header))
    }

    #[test]
    fn test_decode_header_valid() {
        let token = token_with_header(r#"{"alg":"ES256","typ":"JWT","kid":"kid-1"}"#);

        let header = decode_header_unverified(&token).unwrap();
        assert_eq!(header.kid, "kid-1");
        assert_eq!(header.alg, "ES256");
    }

    #[test]
    fn test_decode_header_rejects_other_algorithms() {
        for alg in ["RS256", "HS256", "none", "EdDSA"] {
            let token = token_with_header(&format!(r#"{{"alg":"{alg}","kid":"kid-1"}}"#));
            assert_eq!(
                decode_header_unverified(&token),
                Err(AssertionFormatError::UnsupportedAlgorithm(Some(
                    alg.to_string()
                ))),
                "alg {alg} must be rejected"
            );
        }
    }

    #[test]
    fn test_decode_header_missing_alg() {
        let token = token_with_header(r#"{"kid":"kid-1"}"#);
        assert_eq!(
            decode_header_unverified(&token),
            Err(AssertionFormatError::UnsupportedAlgorithm(None))
        );
    }

    #[test]
    fn test_decode_header_missing_or_unusable_kid() {
        for header in [
            r#"{"alg":"ES256"}"#,
            r#"{"alg":"ES256","kid":""}"#,
            r#"{"alg":"ES256","kid":42}"#,
            r#"{"alg":"ES256","kid":null}"#,
        ] {
            let token = token_with_header(header);
            assert_eq!(
                decode_header_unverified(&token),
                Err(AssertionFormatError::MissingKid),
                "header {header}"
            );
        }
    }

    #[test]
    fn test_decode_header_wrong_segment_count() {
        for token in ["", "single", "only.two", "a.b.c.d"] {
            assert_eq!(
                decode_header_unverified(token),
                Err(AssertionFormatError::Malformed),
                "token {token:?}"
            );
        }
    }

    #[test]
    fn test_decode_header_bad_base64_and_json() {
        assert_eq!(
            decode_header_unverified("!!!.payload.signature"),
            Err(AssertionFormatError::Malformed)
        );
        assert_eq!(
            decode_header_unverified(&token_with_header("not json")),
            Err(AssertionFormatError::Malformed)
        );
    }

    #[test]
    fn test_decode_header_size_limit() {
        let oversized = "a".repeat(MAX_JWT_SIZE_BYTES + 1);
        assert_eq!(
            decode_header_unverified(&oversized),
            Err(AssertionFormatError::TooLarge)
        );

        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"ES256","kid":"k"}"#);
        let filler = MAX_JWT_SIZE_BYTES - header.len() - 2;
        let token = format!("{header}.{}.", "a".repeat(filler));
        assert_eq!(token.len(), MAX_JWT_SIZE_BYTES);
        assert!(decode_header_unverified(&token).is_ok());
    }

    #[test]
    fn test_validate_iat_boundaries() {
        let now = 1_700_000_000_i64;

        assert!(validate_iat_at(now - 3600, DEFAULT_CLOCK_SKEW, now).is_ok());
        assert!(validate_iat_at(now + 60, DEFAULT_CLOCK_SKEW, now).is_ok());
        assert_eq!(
            validate_iat_at(now + 61, DEFAULT_CLOCK_SKEW, now),
            Err(AssertionFormatError::IatTooFarInFuture)
        );
    }

    #[test]
    fn test_validate_iat_wall_clock() {
        let now = chrono::Utc::now().timestamp();
        assert!(validate_iat(now, DEFAULT_CLOCK_SKEW).is_ok());
        assert!(validate_iat(now + 86_400, DEFAULT_CLOCK_SKEW).is_err());
    }

    #[test]
    fn test_clock_skew_constants() {
        assert_eq!(DEFAULT_CLOCK_SKEW, Duration::from_secs(60));
        assert!(DEFAULT_CLOCK_SKEW <= MAX_CLOCK_SKEW);
    }
}
