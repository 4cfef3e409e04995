//! Key authority integration tests.
//!
//! Exercises fetching, caching, invalidation and single-flight filling of the
//! public key set against a mocked identity provider.

// Test code is allowed to use expect/unwrap for assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

use iap_auth::auth::KeyAuthority;
use iap_auth::errors::KeyFetchError;
use iap_test_utils::{MockIdentityProvider, TestSigningKey};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_get_keys_fetches_once_and_returns_same_set() {
    let k1 = TestSigningKey::generate("kid-1");
    let idp = MockIdentityProvider::start().await;
    idp.serve_keys_expecting(&[&k1], 1).await;

    let authority = KeyAuthority::new(idp.public_key_url(), TIMEOUT);

    let first = authority.get_keys().await.unwrap();
    for _ in 0..5 {
        let again = authority.get_keys().await.unwrap();
        assert!(Arc::ptr_eq(&first, &again), "cached set must be reused");
    }

    assert_eq!(first.kids(), vec!["kid-1"]);
    assert_eq!(first.epoch(), 1);
    assert!(authority.is_populated().await);
}

#[tokio::test]
async fn test_jwk_format_is_accepted() {
    let k1 = TestSigningKey::generate("kid-1");
    let k2 = TestSigningKey::generate("kid-2");
    let idp = MockIdentityProvider::start().await;
    idp.serve_jwk_keys(&[&k1, &k2]).await;

    let authority = KeyAuthority::new(idp.public_key_url(), TIMEOUT);
    let keys = authority.get_keys().await.unwrap();

    assert_eq!(keys.kids(), vec!["kid-1", "kid-2"]);
}

#[tokio::test]
async fn test_error_status_is_not_cached() {
    let k1 = TestSigningKey::generate("kid-1");
    let idp = MockIdentityProvider::start().await;
    idp.fail_times(503, 1).await;
    idp.serve_keys_expecting(&[&k1], 1).await;

    let authority = KeyAuthority::new(idp.public_key_url(), TIMEOUT);

    let err = authority.get_keys().await.unwrap_err();
    assert!(matches!(err, KeyFetchError::Status(503)), "got {err:?}");
    assert!(!authority.is_populated().await);

    // Next call retries and succeeds
    let keys = authority.get_keys().await.unwrap();
    assert!(keys.contains("kid-1"));
}

#[tokio::test]
async fn test_unparseable_body_is_rejected() {
    let idp = MockIdentityProvider::start().await;
    idp.fail_with(200, "<html>not json</html>").await;

    let authority = KeyAuthority::new(idp.public_key_url(), TIMEOUT);

    let err = authority.get_keys().await.unwrap_err();
    assert!(matches!(err, KeyFetchError::InvalidKeySet(_)), "got {err:?}");
    assert!(!authority.is_populated().await);
}

#[tokio::test]
async fn test_slow_endpoint_times_out() {
    let k1 = TestSigningKey::generate("kid-1");
    let idp = MockIdentityProvider::start().await;
    idp.serve_keys_slowly(&[&k1], Duration::from_secs(3), 1).await;

    let authority = KeyAuthority::new(idp.public_key_url(), Duration::from_millis(200));

    let err = authority.get_keys().await.unwrap_err();
    assert!(matches!(err, KeyFetchError::Timeout(_)), "got {err:?}");
    assert!(!authority.is_populated().await);
}

#[tokio::test]
async fn test_invalidate_forces_refetch() {
    let k1 = TestSigningKey::generate("kid-1");
    let idp = MockIdentityProvider::start().await;
    idp.serve_keys_expecting(&[&k1], 2).await;

    let authority = KeyAuthority::new(idp.public_key_url(), TIMEOUT);

    let first = authority.get_keys().await.unwrap();
    authority.invalidate().await;
    assert!(!authority.is_populated().await);

    let second = authority.get_keys().await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.epoch(), first.epoch() + 1);
}

#[tokio::test]
async fn test_invalidate_if_current_ignores_stale_sets() {
    let k1 = TestSigningKey::generate("kid-1");
    let idp = MockIdentityProvider::start().await;
    idp.serve_keys_expecting(&[&k1], 2).await;

    let authority = KeyAuthority::new(idp.public_key_url(), TIMEOUT);

    let first = authority.get_keys().await.unwrap();
    assert!(authority.invalidate_if_current(&first).await);
    let second = authority.get_keys().await.unwrap();

    // A caller still holding the first set must not evict the second
    assert!(!authority.invalidate_if_current(&first).await);
    assert!(authority.is_populated().await);
    let third = authority.get_keys().await.unwrap();
    assert!(Arc::ptr_eq(&second, &third));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_calls_share_one_fetch() {
    let k1 = TestSigningKey::generate("kid-1");
    let idp = MockIdentityProvider::start().await;
    idp.serve_keys_slowly(&[&k1], Duration::from_millis(200), 1)
        .await;

    let authority = Arc::new(KeyAuthority::new(idp.public_key_url(), TIMEOUT));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let authority = Arc::clone(&authority);
            tokio::spawn(async move { authority.get_keys().await })
        })
        .collect();

    let sets: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let first = sets.first().unwrap();
    for set in &sets {
        assert!(Arc::ptr_eq(first, set));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_timed_out_fetch() {
    let k1 = TestSigningKey::generate("kid-1");
    let idp = MockIdentityProvider::start().await;
    idp.serve_keys_slowly(&[&k1], Duration::from_secs(3), 1).await;

    let timeout = Duration::from_millis(300);
    let authority = Arc::new(KeyAuthority::new(idp.public_key_url(), timeout));

    let start = Instant::now();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let authority = Arc::clone(&authority);
            tokio::spawn(async move { authority.get_keys().await })
        })
        .collect();

    for joined in futures::future::join_all(handles).await {
        let err = joined.unwrap().unwrap_err();
        assert!(matches!(err, KeyFetchError::Timeout(_)), "got {err:?}");
    }

    // One timeout for everyone, not one per waiter
    let elapsed = start.elapsed();
    assert!(elapsed < timeout * 3, "callers failed after {elapsed:?}");
    assert!(!authority.is_populated().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_fill_is_shared_then_next_call_retries() {
    let k1 = TestSigningKey::generate("kid-1");
    let idp = MockIdentityProvider::start().await;
    idp.fail_slowly(503, Duration::from_millis(300), 1).await;
    idp.serve_keys_expecting(&[&k1], 1).await;

    let authority = Arc::new(KeyAuthority::new(idp.public_key_url(), TIMEOUT));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let authority = Arc::clone(&authority);
            tokio::spawn(async move { authority.get_keys().await })
        })
        .collect();

    for joined in futures::future::join_all(handles).await {
        let err = joined.unwrap().unwrap_err();
        assert!(matches!(err, KeyFetchError::Status(503)), "got {err:?}");
    }

    // A call made after the failure fetches again
    let keys = authority.get_keys().await.unwrap();
    assert!(keys.contains("kid-1"));
}

#[tokio::test]
async fn test_min_refresh_interval_keeps_young_set() {
    let k1 = TestSigningKey::generate("kid-1");
    let idp = MockIdentityProvider::start().await;
    idp.serve_keys_expecting(&[&k1], 1).await;

    let authority = KeyAuthority::new(idp.public_key_url(), TIMEOUT)
        .with_min_refresh_interval(Duration::from_secs(60));

    let first = authority.get_keys().await.unwrap();
    assert!(first.age() < Duration::from_secs(60));

    assert!(!authority.invalidate_if_current(&first).await);
    assert!(authority.is_populated().await);
    assert!(Arc::ptr_eq(&first, &authority.get_keys().await.unwrap()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalidate_concurrent_with_get_keys_stays_consistent() {
    let k1 = TestSigningKey::generate("kid-1");
    let idp = MockIdentityProvider::start().await;
    idp.serve_keys(&[&k1]).await;

    let authority = Arc::new(KeyAuthority::new(idp.public_key_url(), TIMEOUT));

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let authority = Arc::clone(&authority);
            tokio::spawn(async move {
                if i % 4 == 0 {
                    authority.invalidate().await;
                    None
                } else {
                    Some(authority.get_keys().await)
                }
            })
        })
        .collect();

    for joined in futures::future::join_all(handles).await {
        if let Some(result) = joined.unwrap() {
            let keys = result.unwrap();
            assert_eq!(keys.kids(), vec!["kid-1"], "every observed set is complete");
        }
    }

    // Whatever the interleaving, the cache ends either unset or holding a full set
    let keys = authority.get_keys().await.unwrap();
    assert_eq!(keys.kids(), vec!["kid-1"]);
}
