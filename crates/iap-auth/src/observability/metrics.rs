//! Metrics for the assertion validation subsystem.
//!
//! All metrics follow Prometheus naming conventions:
//! - `iap_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `status`: "success", "error"
//! - `item`: "numeric-project-id", "project-id"
//! - `reason`: bounded by `ValidationError::reason`

use metrics::{counter, histogram};
use std::time::Duration;

// ============================================================================
// Key Authority Metrics
// ============================================================================

/// Record a public key set fetch.
///
/// Metric: `iap_key_fetch_duration_seconds`, `iap_key_fetch_total`
/// Labels: `status`
pub fn record_key_fetch(status: &str, duration: Duration) {
    histogram!("iap_key_fetch_duration_seconds").record(duration.as_secs_f64());

    counter!("iap_key_fetch_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a forced invalidation of the cached key set.
///
/// Metric: `iap_key_invalidations_total`
pub fn record_key_invalidation() {
    counter!("iap_key_invalidations_total").increment(1);
}

// ============================================================================
// Audience Resolver Metrics
// ============================================================================

/// Record one metadata lookup.
///
/// Metric: `iap_metadata_lookup_duration_seconds`, `iap_metadata_lookup_total`
/// Labels: `item`, `status`
pub fn record_metadata_lookup(item: &'static str, status: &str, duration: Duration) {
    histogram!("iap_metadata_lookup_duration_seconds",
        "item" => item
    )
    .record(duration.as_secs_f64());

    counter!("iap_metadata_lookup_total",
        "item" => item,
        "status" => status.to_string()
    )
    .increment(1);
}

// ============================================================================
// Validator Metrics
// ============================================================================

/// Record the outcome of one `validate` call.
///
/// Metric: `iap_assertion_validation_duration_seconds`,
/// `iap_assertion_validations_total`, `iap_assertion_validation_failures_total`
/// Labels: `status`, `reason`
pub fn record_assertion_validation(status: &str, reason: Option<&'static str>, duration: Duration) {
    histogram!("iap_assertion_validation_duration_seconds").record(duration.as_secs_f64());

    counter!("iap_assertion_validations_total",
        "status" => status.to_string()
    )
    .increment(1);

    if let Some(reason) = reason {
        counter!("iap_assertion_validation_failures_total",
            "reason" => reason
        )
        .increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_metrics_are_recorded_with_bounded_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_key_fetch("success", Duration::from_millis(20));
            record_key_invalidation();
            record_metadata_lookup("project-id", "success", Duration::from_millis(3));
            record_assertion_validation("success", None, Duration::from_millis(1));
            record_assertion_validation(
                "error",
                Some("audience_mismatch"),
                Duration::from_millis(1),
            );
        });

        let metrics = snapshotter.snapshot().into_vec();
        let names: Vec<String> = metrics
            .iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();

        for expected in [
            "iap_key_fetch_total",
            "iap_key_fetch_duration_seconds",
            "iap_key_invalidations_total",
            "iap_metadata_lookup_total",
            "iap_assertion_validations_total",
            "iap_assertion_validation_failures_total",
        ] {
            assert!(
                names.iter().any(|n| n == expected),
                "missing metric {expected}, got {names:?}"
            );
        }

        let failures = metrics
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "iap_assertion_validation_failures_total")
            .expect("failure counter recorded");
        assert!(failures
            .0
            .key()
            .labels()
            .any(|l| l.key() == "reason" && l.value() == "audience_mismatch"));
        assert!(matches!(failures.3, DebugValue::Counter(1)));
    }
}
