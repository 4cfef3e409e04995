//! Authentication of IAP assertions.
//!
//! # Components
//!
//! - `keys` - key authority fetching and caching the IAP public keys
//! - `audience` - audience resolver backed by the metadata server
//! - `identity` - assertion claims and the resulting caller identity
//! - `validator` - assertion validation combining the two caches

pub mod audience;
pub mod identity;
pub mod keys;
pub mod validator;

pub use audience::{AudienceIdentifier, AudienceResolver};
pub use identity::{AssertionClaims, Identity};
pub use keys::{KeyAuthority, VerificationKeySet};
pub use validator::AssertionValidator;
