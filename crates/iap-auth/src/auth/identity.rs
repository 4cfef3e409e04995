//! Assertion claims and the caller identity extracted from them.
//!
//! The subject id is a persistent user identifier and is redacted in `Debug`
//! output so it cannot end up in logs by accident.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Claims read from a verified IAP assertion.
#[derive(Clone, Deserialize)]
pub struct AssertionClaims {
    /// Caller's email address.
    pub email: String,

    /// Persistent user identifier - redacted in Debug output.
    pub sub: String,

    /// Intended audience.
    pub aud: String,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Issued-at timestamp (Unix epoch seconds).
    #[serde(default)]
    pub iat: Option<i64>,

    /// Not-before timestamp (Unix epoch seconds).
    #[serde(default)]
    pub nbf: Option<i64>,

    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,

    /// Google Workspace hosted domain, when the caller has one.
    #[serde(default)]
    pub hd: Option<String>,
}

impl fmt::Debug for AssertionClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssertionClaims")
            .field("email", &self.email)
            .field("sub", &"[REDACTED]")
            .field("aud", &self.aud)
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .field("nbf", &self.nbf)
            .field("iss", &self.iss)
            .field("hd", &self.hd)
            .finish()
    }
}

/// An authenticated caller.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub email: String,
    pub subject_id: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("email", &self.email)
            .field("subject_id", &"[REDACTED]")
            .finish()
    }
}

impl Identity {
    /// Build an identity from verified claims.
    ///
    /// Returns `None` when either field is empty, so a partially populated
    /// identity can never be produced.
    pub fn from_claims(claims: AssertionClaims) -> Option<Self> {
        if claims.email.is_empty() || claims.sub.is_empty() {
            return None;
        }

        Some(Self {
            email: claims.email,
            subject_id: claims.sub,
        })
    }
}
