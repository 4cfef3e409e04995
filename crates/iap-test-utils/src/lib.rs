//! # IAP Test Utilities
//!
//! Shared test utilities for the assertion validation crates.
//!
//! This crate provides:
//! - ES256 signing key fixtures and key set documents (PEM map and JWK Set)
//! - Test assertion builder (TestAssertionBuilder)
//! - Mock identity provider and metadata server (wiremock based)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use iap_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let key = TestSigningKey::generate("kid-1");
//!     let idp = MockIdentityProvider::start().await;
//!     idp.serve_keys(&[&key]).await;
//!
//!     let token = TestAssertionBuilder::new()
//!         .email("alice@example.com")
//!         .audience("/projects/123/apps/proj-x")
//!         .sign(&key);
//! }
//! ```

pub mod crypto_fixtures;
pub mod server_harness;
pub mod token_builders;

// Re-export commonly used items
pub use crypto_fixtures::*;
pub use server_harness::*;
pub use token_builders::*;
