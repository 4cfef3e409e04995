//! Builder patterns for test assertions
//!
//! Provides a fluent API for IAP-shaped claims signed with a test key.

use crate::crypto_fixtures::TestSigningKey;
use chrono::{Duration, Utc};
use serde_json::json;

/// Audience used by default in test assertions.
pub const TEST_AUDIENCE: &str = "/projects/123/apps/proj-x";

/// Builder for test assertion claims
///
/// # Example
/// ```rust,ignore
/// let token = TestAssertionBuilder::new()
///     .email("alice@example.com")
///     .subject("u-42")
///     .audience("/projects/123/apps/proj-x")
///     .expires_in(600)
///     .sign(&key);
/// ```
pub struct TestAssertionBuilder {
    email: String,
    sub: String,
    aud: String,
    exp: i64,
    iat: i64,
    nbf: Option<i64>,
    iss: Option<String>,
}

impl TestAssertionBuilder {
    /// Create a builder valid for the next ten minutes
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            email: "alice@example.com".to_string(),
            sub: "u-42".to_string(),
            aud: TEST_AUDIENCE.to_string(),
            exp: (now + Duration::seconds(600)).timestamp(),
            iat: now.timestamp(),
            nbf: None,
            iss: Some("https://cloud.google.com/iap".to_string()),
        }
    }

    pub fn email(mut self, email: &str) -> Self {
        self.email = email.to_string();
        self
    }

    pub fn subject(mut self, sub: &str) -> Self {
        self.sub = sub.to_string();
        self
    }

    pub fn audience(mut self, aud: &str) -> Self {
        self.aud = aud.to_string();
        self
    }

    pub fn issuer(mut self, iss: &str) -> Self {
        self.iss = Some(iss.to_string());
        self
    }

    /// Set expiration in seconds from now (negative for the past)
    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.exp = (Utc::now() + Duration::seconds(seconds)).timestamp();
        self
    }

    /// Set issued-at relative to now
    pub fn issued_at_offset(mut self, seconds: i64) -> Self {
        self.iat = (Utc::now() + Duration::seconds(seconds)).timestamp();
        self
    }

    /// Set not-before relative to now
    pub fn not_before_offset(mut self, seconds: i64) -> Self {
        self.nbf = Some((Utc::now() + Duration::seconds(seconds)).timestamp());
        self
    }

    /// Build the claims as a JSON value
    pub fn build(&self) -> serde_json::Value {
        let mut claims = json!({
            "email": self.email,
            "sub": self.sub,
            "aud": self.aud,
            "exp": self.exp,
            "iat": self.iat,
        });
        if let Some(nbf) = self.nbf {
            claims["nbf"] = json!(nbf);
        }
        if let Some(iss) = &self.iss {
            claims["iss"] = json!(iss);
        }
        claims
    }

    /// Build and sign with `key`
    pub fn sign(&self, key: &TestSigningKey) -> String {
        key.sign(&self.build())
    }
}

impl Default for TestAssertionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
