//! Key authority: fetches and caches the identity provider's public keys.
//!
//! The key set is fetched from the IAP public key endpoint on first use and
//! kept until it is explicitly invalidated. There is no TTL: IAP rotates keys
//! rarely, and the validator invalidates the cache when it meets a key id the
//! cached set does not know.
//!
//! Two response formats are accepted:
//!
//! - `public_key`: a JSON object mapping key id to a PEM `PUBLIC KEY`
//! - `public_key-jwk`: a JWK Set whose entries are P-256 EC keys
//!
//! # Concurrency
//!
//! The cache is an `RwLock<Option<Arc<VerificationKeySet>>>`. Fills are
//! serialized by a separate fill lock, so concurrent callers that find the
//! cache empty wait for the first caller's fetch instead of issuing their own.
//! That holds for failures too: callers that were waiting when a fill fails
//! receive its error, and only a later call fetches again. The set is swapped
//! as a whole; readers never see a partially built set.

use crate::errors::KeyFetchError;
use crate::observability::metrics;
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk};
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

/// An immutable snapshot of the identity provider's verification keys.
#[derive(Clone)]
pub struct VerificationKeySet {
    keys: HashMap<String, DecodingKey>,
    epoch: u64,
    fetched_at: Instant,
}

impl VerificationKeySet {
    pub(crate) fn from_keys(keys: HashMap<String, DecodingKey>, epoch: u64) -> Self {
        Self {
            keys,
            epoch,
            fetched_at: Instant::now(),
        }
    }

    /// Look up the key for `kid`.
    pub fn get(&self, kid: &str) -> Option<&DecodingKey> {
        self.keys.get(kid)
    }

    pub fn contains(&self, kid: &str) -> bool {
        self.keys.contains_key(kid)
    }

    /// Key ids in this set, sorted.
    pub fn kids(&self) -> Vec<&str> {
        let mut kids: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        kids.sort_unstable();
        kids
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Fetch generation this set belongs to. Starts at 1 and grows by one per
    /// successful fetch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Time since this set was fetched.
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

impl fmt::Debug for VerificationKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKeySet")
            .field("kids", &self.kids())
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Raw key endpoint body: either a JWK Set or a `kid -> PEM` map.
///
/// JWK entries stay raw JSON so that one entry `Jwk` cannot represent does
/// not reject the whole document.
#[derive(Deserialize)]
#[serde(untagged)]
enum KeySetDocument {
    Jwks { keys: Vec<serde_json::Value> },
    Pem(HashMap<String, String>),
}

/// Parse a key endpoint body into decoding keys.
///
/// Entries that cannot be turned into an ES256 key are skipped with a warning.
/// A body with no usable entries is an error.
fn parse_key_set(body: &[u8]) -> Result<HashMap<String, DecodingKey>, KeyFetchError> {
    let document: KeySetDocument = serde_json::from_slice(body).map_err(|e| {
        KeyFetchError::InvalidKeySet(format!("response is not a key set: {}", e))
    })?;

    let mut keys = HashMap::new();
    match document {
        KeySetDocument::Pem(entries) => {
            for (kid, pem) in entries {
                match DecodingKey::from_ec_pem(pem.as_bytes()) {
                    Ok(key) => {
                        keys.insert(kid, key);
                    }
                    Err(e) => {
                        tracing::warn!(target: "iap.auth.keys", kid = %kid, error = %e, "Skipping unparseable PEM key");
                    }
                }
            }
        }
        KeySetDocument::Jwks { keys: entries } => {
            for entry in entries {
                let jwk: Jwk = match serde_json::from_value(entry) {
                    Ok(jwk) => jwk,
                    Err(e) => {
                        tracing::warn!(target: "iap.auth.keys", error = %e, "Skipping unsupported JWK");
                        continue;
                    }
                };
                let Some(kid) = jwk.common.key_id.clone().filter(|k| !k.is_empty()) else {
                    tracing::warn!(target: "iap.auth.keys", "Skipping JWK without kid");
                    continue;
                };
                let is_p256 = matches!(
                    &jwk.algorithm,
                    AlgorithmParameters::EllipticCurve(params) if params.curve == EllipticCurve::P256
                );
                if !is_p256 {
                    tracing::warn!(target: "iap.auth.keys", kid = %kid, "Skipping non-P-256 JWK");
                    continue;
                }
                match DecodingKey::from_jwk(&jwk) {
                    Ok(key) => {
                        keys.insert(kid, key);
                    }
                    Err(e) => {
                        tracing::warn!(target: "iap.auth.keys", kid = %kid, error = %e, "Skipping unparseable JWK");
                    }
                }
            }
        }
    }

    if keys.is_empty() {
        return Err(KeyFetchError::InvalidKeySet(
            "response contains no usable ES256 keys".to_string(),
        ));
    }

    Ok(keys)
}

/// Cached, renewable source of verification keys.
///
/// Thread-safe; share it behind an `Arc`.
pub struct KeyAuthority {
    /// URL of the public key endpoint.
    url: String,

    /// HTTP client for fetching keys.
    http_client: reqwest::Client,

    /// Bound on each fetch.
    timeout: Duration,

    /// Current key set, `None` while unset.
    cache: RwLock<Option<Arc<VerificationKeySet>>>,

    /// Serializes cache fills. Holds the error of the last fill if it failed.
    fill_lock: Mutex<Option<KeyFetchError>>,

    /// Number of completed fills, successful or not.
    fills: AtomicU64,

    /// Epoch handed to the next fetched set.
    next_epoch: AtomicU64,

    /// Sets younger than this are not dropped by `invalidate_if_current`.
    min_refresh_interval: Duration,
}

impl KeyAuthority {
    /// Create a key authority for `url`, bounding each fetch by `timeout`.
    pub fn new(url: String, timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(target: "iap.auth.keys", error = %e, "Failed to build HTTP client with custom config, using defaults");
                reqwest::Client::new()
            });

        Self {
            url,
            http_client,
            timeout,
            cache: RwLock::new(None),
            fill_lock: Mutex::new(None),
            fills: AtomicU64::new(0),
            next_epoch: AtomicU64::new(1),
            min_refresh_interval: Duration::ZERO,
        }
    }

    /// Keep each fetched set for at least `interval` before an unknown key id
    /// may force a refresh. Zero (the default) allows a refresh at any time.
    #[must_use]
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Return the cached key set, fetching it if the cache is unset.
    ///
    /// # Errors
    ///
    /// Returns `KeyFetchError` if the fetch fails, or if a fill this call
    /// waited on failed. The cache stays unset so the next call retries.
    #[instrument(skip_all)]
    pub async fn get_keys(&self) -> Result<Arc<VerificationKeySet>, KeyFetchError> {
        if let Some(keys) = self.cached().await {
            return Ok(keys);
        }

        let observed_fills = self.fills.load(Ordering::Acquire);
        let mut last_failure = self.fill_lock.lock().await;

        // Another caller may have filled the cache while we waited
        if let Some(keys) = self.cached().await {
            tracing::debug!(target: "iap.auth.keys", epoch = keys.epoch(), "Key set filled by concurrent fetch");
            return Ok(keys);
        }

        // ...or tried and failed, in which case its error is ours too
        if self.fills.load(Ordering::Acquire) != observed_fills {
            if let Some(err) = last_failure.as_ref() {
                tracing::debug!(target: "iap.auth.keys", error = %err, "Concurrent key fetch failed");
                return Err(err.clone());
            }
        }

        let result = self.fetch().await.map(Arc::new);
        match &result {
            Ok(keys) => {
                *self.cache.write().await = Some(Arc::clone(keys));
                *last_failure = None;
            }
            Err(e) => *last_failure = Some(e.clone()),
        }
        self.fills.fetch_add(1, Ordering::Release);
        result
    }

    /// Clear the cache so the next `get_keys` refetches.
    pub async fn invalidate(&self) {
        let previous = self.cache.write().await.take();
        if let Some(previous) = previous {
            metrics::record_key_invalidation();
            tracing::info!(target: "iap.auth.keys", epoch = previous.epoch(), "Key set invalidated");
        }
    }

    /// Clear the cache only if it still holds `stale`.
    ///
    /// Returns `true` if the cache was cleared. When several validations miss
    /// the same key id at once, only the first clears the set; the others find
    /// a newer epoch (or an empty cache) and leave it alone. A set younger
    /// than the minimum refresh interval is kept.
    pub async fn invalidate_if_current(&self, stale: &VerificationKeySet) -> bool {
        let mut cache = self.cache.write().await;
        match cache.as_ref() {
            Some(current) if current.epoch() == stale.epoch() => {
                let age = current.age();
                if age < self.min_refresh_interval {
                    tracing::debug!(
                        target: "iap.auth.keys",
                        epoch = current.epoch(),
                        age_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                        "Key set too recent to invalidate"
                    );
                    return false;
                }
                *cache = None;
                metrics::record_key_invalidation();
                tracing::info!(
                    target: "iap.auth.keys",
                    epoch = stale.epoch(),
                    age_seconds = age.as_secs(),
                    "Key set invalidated"
                );
                true
            }
            _ => false,
        }
    }

    /// Whether a key set is currently cached.
    pub async fn is_populated(&self) -> bool {
        self.cache.read().await.is_some()
    }

    async fn cached(&self) -> Option<Arc<VerificationKeySet>> {
        self.cache.read().await.as_ref().map(Arc::clone)
    }

    async fn fetch(&self) -> Result<VerificationKeySet, KeyFetchError> {
        tracing::debug!(target: "iap.auth.keys", url = %self.url, "Fetching public keys");
        let start = Instant::now();

        let result = match tokio::time::timeout(self.timeout, self.fetch_body()).await {
            Ok(result) => result.and_then(|body| parse_key_set(&body)),
            Err(_) => Err(KeyFetchError::Timeout(self.timeout)),
        };

        match result {
            Ok(keys) => {
                metrics::record_key_fetch("success", start.elapsed());
                let set = VerificationKeySet::from_keys(
                    keys,
                    self.next_epoch.fetch_add(1, Ordering::Relaxed),
                );
                tracing::info!(
                    target: "iap.auth.keys",
                    key_count = set.len(),
                    epoch = set.epoch(),
                    "Public key cache refreshed"
                );
                Ok(set)
            }
            Err(e) => {
                metrics::record_key_fetch("error", start.elapsed());
                tracing::error!(target: "iap.auth.keys", error = %e, "Failed to fetch public keys");
                Err(e)
            }
        }
    }

    async fn fetch_body(&self) -> Result<Vec<u8>, KeyFetchError> {
        let response = self
            .http_client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, self.timeout))?;

        if !response.status().is_success() {
            return Err(KeyFetchError::Status(response.status().as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(e, self.timeout))?;
        Ok(body.to_vec())
    }
}

fn classify_reqwest_error(err: reqwest::Error, timeout: Duration) -> KeyFetchError {
    if err.is_timeout() {
        KeyFetchError::Timeout(timeout)
    } else {
        KeyFetchError::Request(err.to_string())
    }
}
