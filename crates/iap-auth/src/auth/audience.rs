//! Audience resolver: the `aud` value valid assertions must carry.
//!
//! For an App Engine app behind IAP the audience is
//! `/projects/{numeric_project_id}/apps/{project_id}`. Both values come from
//! the local metadata server and never change for the life of a deployment,
//! so the audience is resolved once and cached. A failed resolution caches
//! nothing; the next call tries again. Callers already waiting on a failed
//! resolution receive its error rather than starting their own.

use crate::errors::MetadataError;
use crate::observability::metrics;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell};
use tracing::instrument;

/// Metadata item holding the numeric project id.
pub const NUMERIC_PROJECT_ID_ITEM: &str = "numeric-project-id";

/// Metadata item holding the project id.
pub const PROJECT_ID_ITEM: &str = "project-id";

/// Header the metadata server requires on every request.
pub const METADATA_FLAVOR_HEADER: (&str, &str) = ("Metadata-Flavor", "Google");

/// The audience identifier expected in valid assertions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AudienceIdentifier(String);

impl AudienceIdentifier {
    /// Build the App Engine audience from the two project identifiers.
    pub fn for_app(numeric_project_id: &str, project_id: &str) -> Self {
        Self(format!(
            "/projects/{}/apps/{}",
            numeric_project_id, project_id
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AudienceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

enum AudienceSource {
    Metadata {
        base_url: String,
        http_client: reqwest::Client,
        timeout: Duration,
    },
    Fixed(AudienceIdentifier),
}

/// Cached, lazily computed audience identifier.
pub struct AudienceResolver {
    source: AudienceSource,
    cache: OnceCell<AudienceIdentifier>,

    /// Serializes resolutions. Holds the error of the last one if it failed.
    fill_lock: Mutex<Option<MetadataError>>,

    /// Number of completed resolutions, successful or not.
    fills: AtomicU64,
}

impl AudienceResolver {
    /// Resolve the audience from the metadata directory at `base_url`.
    ///
    /// `base_url` is the project directory, e.g.
    /// `http://metadata.google.internal/computeMetadata/v1/project/`.
    pub fn from_metadata(base_url: String, timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(target: "iap.auth.audience", error = %e, "Failed to build HTTP client with custom config, using defaults");
                reqwest::Client::new()
            });

        Self {
            source: AudienceSource::Metadata {
                base_url,
                http_client,
                timeout,
            },
            cache: OnceCell::new(),
            fill_lock: Mutex::new(None),
            fills: AtomicU64::new(0),
        }
    }

    /// Use a configured audience; no metadata lookups are made.
    pub fn fixed(audience: String) -> Self {
        let audience = AudienceIdentifier(audience);
        Self {
            cache: OnceCell::new_with(Some(audience.clone())),
            source: AudienceSource::Fixed(audience),
            fill_lock: Mutex::new(None),
            fills: AtomicU64::new(0),
        }
    }

    /// Return the audience, resolving it on first use.
    ///
    /// Concurrent first callers share one resolution, whatever its outcome.
    ///
    /// # Errors
    ///
    /// Returns `MetadataError` if either lookup fails or yields an unusable
    /// value, or if a resolution this call waited on failed. Nothing is
    /// cached in that case.
    #[instrument(skip_all)]
    pub async fn get_audience(&self) -> Result<AudienceIdentifier, MetadataError> {
        if let Some(audience) = self.cache.get() {
            return Ok(audience.clone());
        }

        let observed_fills = self.fills.load(Ordering::Acquire);
        let mut last_failure = self.fill_lock.lock().await;

        if let Some(audience) = self.cache.get() {
            return Ok(audience.clone());
        }

        if self.fills.load(Ordering::Acquire) != observed_fills {
            if let Some(err) = last_failure.as_ref() {
                tracing::debug!(target: "iap.auth.audience", error = %err, "Concurrent audience resolution failed");
                return Err(err.clone());
            }
        }

        let result = self.resolve().await;
        match &result {
            Ok(audience) => {
                // Only set under the fill lock, so the cell is still empty
                let _ = self.cache.set(audience.clone());
                *last_failure = None;
            }
            Err(e) => *last_failure = Some(e.clone()),
        }
        self.fills.fetch_add(1, Ordering::Release);
        result
    }

    /// The cached audience, if resolved.
    pub fn cached(&self) -> Option<&AudienceIdentifier> {
        self.cache.get()
    }

    async fn resolve(&self) -> Result<AudienceIdentifier, MetadataError> {
        let (base_url, http_client, timeout) = match &self.source {
            AudienceSource::Fixed(audience) => return Ok(audience.clone()),
            AudienceSource::Metadata {
                base_url,
                http_client,
                timeout,
            } => (base_url, http_client, *timeout),
        };

        let (numeric_project_id, project_id) = tokio::try_join!(
            lookup(http_client, base_url, NUMERIC_PROJECT_ID_ITEM, timeout),
            lookup(http_client, base_url, PROJECT_ID_ITEM, timeout),
        )?;

        if !numeric_project_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MetadataError::InvalidValue {
                item: NUMERIC_PROJECT_ID_ITEM,
                message: "expected a decimal project number".to_string(),
            });
        }

        let audience = AudienceIdentifier::for_app(&numeric_project_id, &project_id);
        tracing::info!(target: "iap.auth.audience", audience = %audience, "Audience resolved from metadata");
        Ok(audience)
    }
}

/// Fetch one project metadata item as trimmed text.
async fn lookup(
    http_client: &reqwest::Client,
    base_url: &str,
    item: &'static str,
    timeout: Duration,
) -> Result<String, MetadataError> {
    let url = format!("{}/{}", base_url.trim_end_matches('/'), item);
    let start = Instant::now();

    let result = match tokio::time::timeout(timeout, fetch_text(http_client, &url, item, timeout))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(MetadataError::Timeout { item, timeout }),
    };

    let result = result.and_then(|value| {
        let value = value.trim();
        if value.is_empty() {
            Err(MetadataError::InvalidValue {
                item,
                message: "empty value".to_string(),
            })
        } else {
            Ok(value.to_string())
        }
    });

    match &result {
        Ok(_) => metrics::record_metadata_lookup(item, "success", start.elapsed()),
        Err(e) => {
            metrics::record_metadata_lookup(item, "error", start.elapsed());
            tracing::error!(target: "iap.auth.audience", item, error = %e, "Metadata lookup failed");
        }
    }

    result
}

async fn fetch_text(
    http_client: &reqwest::Client,
    url: &str,
    item: &'static str,
    timeout: Duration,
) -> Result<String, MetadataError> {
    let classify = |e: reqwest::Error| {
        if e.is_timeout() {
            MetadataError::Timeout { item, timeout }
        } else {
            MetadataError::Request {
                item,
                message: e.to_string(),
            }
        }
    };

    let (name, value) = METADATA_FLAVOR_HEADER;
    let response = http_client
        .get(url)
        .header(name, value)
        .send()
        .await
        .map_err(classify)?;

    if !response.status().is_success() {
        return Err(MetadataError::Status {
            item,
            status: response.status().as_u16(),
        });
    }

    response.text().await.map_err(classify)
}
