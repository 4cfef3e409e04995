//! Observability for the assertion validation subsystem.
//!
//! Provides metrics definitions and recording helpers.

pub mod metrics;
