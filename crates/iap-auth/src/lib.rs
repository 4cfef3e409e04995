//! IAP assertion validation library.
//!
//! Authenticates requests that arrive through Google Cloud Identity-Aware
//! Proxy by verifying the signed assertion the proxy attaches to each one.
//!
//! # Architecture
//!
//! ```text
//! AssertionValidator -> KeyAuthority     (public key set, cached, invalidated on key rotation)
//!                    -> AudienceResolver (expected `aud`, resolved once from metadata)
//! ```
//!
//! The request-handling layer extracts the [`config::ASSERTION_HEADER`] value
//! and passes it to [`auth::AssertionValidator::validate`]; authorization and
//! response formatting stay with the caller.
//!
//! # Modules
//!
//! - `auth` - key authority, audience resolver and validator
//! - `config` - configuration from environment
//! - `errors` - fetch and validation error types
//! - `observability` - metrics

pub mod auth;
pub mod config;
pub mod errors;
pub mod observability;
