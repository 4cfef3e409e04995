//! Common utilities shared across the IAP authentication crates.

#![warn(clippy::pedantic)]

/// Module for JWT utilities (size limits, header decoding, iat validation)
pub mod jwt;
