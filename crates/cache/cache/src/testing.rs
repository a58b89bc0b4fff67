use std::time::Duration;

use futures::StreamExt;

use crate::backend::{Keyspace, LockBackend, PubSubBackend};
use crate::error::CacheError;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the lock primitive conformance suite.
///
/// `prefix` namespaces every key the suite touches so it can run against a
/// shared server.
///
/// # Errors
///
/// Returns an error if the backend fails an operation.
pub async fn run_lock_backend_conformance_tests(
    backend: &dyn LockBackend,
    prefix: &str,
) -> Result<(), CacheError> {
    test_set_if_absent(backend, prefix).await?;
    test_compare_and_delete(backend, prefix).await?;
    test_compare_and_extend(backend, prefix).await?;
    test_expiry(backend, prefix).await?;
    Ok(())
}

async fn test_set_if_absent(backend: &dyn LockBackend, prefix: &str) -> Result<(), CacheError> {
    let key = format!("{prefix}:set-if-absent");
    let ttl = Duration::from_secs(30);

    assert!(backend.set_if_absent(&key, "owner-a", ttl).await?);
    assert!(
        !backend.set_if_absent(&key, "owner-b", ttl).await?,
        "second set_if_absent must not overwrite"
    );
    assert_eq!(backend.get(&key).await?.as_deref(), Some("owner-a"));

    backend.compare_and_delete(&key, "owner-a").await?;
    Ok(())
}

async fn test_compare_and_delete(
    backend: &dyn LockBackend,
    prefix: &str,
) -> Result<(), CacheError> {
    let key = format!("{prefix}:compare-and-delete");
    backend
        .set_if_absent(&key, "owner-a", Duration::from_secs(30))
        .await?;

    assert!(
        !backend.compare_and_delete(&key, "owner-b").await?,
        "delete with the wrong token must fail"
    );
    assert_eq!(backend.get(&key).await?.as_deref(), Some("owner-a"));

    assert!(backend.compare_and_delete(&key, "owner-a").await?);
    assert!(backend.get(&key).await?.is_none());
    assert!(
        !backend.compare_and_delete(&key, "owner-a").await?,
        "delete of a missing key must report false"
    );
    Ok(())
}

async fn test_compare_and_extend(
    backend: &dyn LockBackend,
    prefix: &str,
) -> Result<(), CacheError> {
    let key = format!("{prefix}:compare-and-extend");
    backend
        .set_if_absent(&key, "owner-a", Duration::from_secs(30))
        .await?;

    assert!(
        backend
            .compare_and_extend(&key, "owner-a", Duration::from_secs(60))
            .await?
    );
    assert!(
        !backend
            .compare_and_extend(&key, "owner-b", Duration::from_secs(60))
            .await?,
        "extend with the wrong token must fail"
    );
    assert!(
        !backend
            .compare_and_extend(&format!("{prefix}:never-set"), "owner-a", Duration::from_secs(60))
            .await?
    );

    backend.compare_and_delete(&key, "owner-a").await?;
    Ok(())
}

async fn test_expiry(backend: &dyn LockBackend, prefix: &str) -> Result<(), CacheError> {
    let key = format!("{prefix}:expiry");
    assert!(
        backend
            .set_if_absent(&key, "owner-a", Duration::from_millis(100))
            .await?
    );

    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(backend.get(&key).await?.is_none(), "lease should expire");
    assert!(
        backend
            .set_if_absent(&key, "owner-b", Duration::from_secs(30))
            .await?,
        "expired lease must be re-acquirable"
    );
    backend.compare_and_delete(&key, "owner-b").await?;
    Ok(())
}

/// Run the publish/subscribe conformance suite.
///
/// # Errors
///
/// Returns an error if the backend fails an operation.
pub async fn run_pubsub_conformance_tests(
    backend: &dyn PubSubBackend,
    prefix: &str,
) -> Result<(), CacheError> {
    test_channel_delivery(backend, prefix).await?;
    test_pattern_delivery(backend, prefix).await?;
    test_no_cross_delivery(backend, prefix).await?;
    Ok(())
}

async fn test_channel_delivery(
    backend: &dyn PubSubBackend,
    prefix: &str,
) -> Result<(), CacheError> {
    let channel = format!("{prefix}:events");
    let mut stream = backend.subscribe(std::slice::from_ref(&channel)).await?;

    let receivers = backend.publish(&channel, b"hello").await?;
    assert_eq!(receivers, 1, "exactly one subscription should receive");

    let msg = tokio::time::timeout(DELIVERY_TIMEOUT, stream.next())
        .await
        .map_err(|_| CacheError::Timeout(DELIVERY_TIMEOUT))?
        .ok_or_else(|| CacheError::Backend("subscription stream ended".into()))?;
    assert_eq!(msg.channel, channel);
    assert_eq!(msg.pattern, None);
    assert_eq!(msg.payload, b"hello");
    Ok(())
}

async fn test_pattern_delivery(
    backend: &dyn PubSubBackend,
    prefix: &str,
) -> Result<(), CacheError> {
    let pattern = format!("{prefix}:workflow:*");
    let channel = format!("{prefix}:workflow:42");
    let mut stream = backend.psubscribe(std::slice::from_ref(&pattern)).await?;

    backend.publish(&channel, b"{\"n\":1}").await?;

    let msg = tokio::time::timeout(DELIVERY_TIMEOUT, stream.next())
        .await
        .map_err(|_| CacheError::Timeout(DELIVERY_TIMEOUT))?
        .ok_or_else(|| CacheError::Backend("subscription stream ended".into()))?;
    assert_eq!(msg.channel, channel);
    assert_eq!(msg.pattern.as_deref(), Some(pattern.as_str()));
    assert_eq!(msg.payload, b"{\"n\":1}");
    Ok(())
}

async fn test_no_cross_delivery(
    backend: &dyn PubSubBackend,
    prefix: &str,
) -> Result<(), CacheError> {
    let mut stream = backend
        .subscribe(&[format!("{prefix}:only-this")])
        .await?;

    let receivers = backend.publish(&format!("{prefix}:other"), b"x").await?;
    assert_eq!(receivers, 0);

    let got = tokio::time::timeout(Duration::from_millis(200), stream.next()).await;
    assert!(got.is_err(), "unrelated channel must not be delivered");
    Ok(())
}

/// Run the keyspace conformance suite used by snapshot and restore.
///
/// # Errors
///
/// Returns an error if the backend fails an operation.
pub async fn run_keyspace_conformance_tests(
    keyspace: &dyn Keyspace,
    prefix: &str,
) -> Result<(), CacheError> {
    let missing = format!("{prefix}:missing");
    assert!(keyspace.get_value(&missing).await?.is_none());

    let a = format!("{prefix}:a");
    let b = format!("{prefix}:b");
    keyspace.set_value(&a, b"alpha").await?;
    keyspace.set_value(&b, b"beta").await?;
    keyspace.set_value(&b, b"beta-2").await?;

    assert_eq!(keyspace.get_value(&a).await?.as_deref(), Some(&b"alpha"[..]));
    assert_eq!(keyspace.get_value(&b).await?.as_deref(), Some(&b"beta-2"[..]));

    let keys = keyspace.keys().await?;
    assert!(keys.contains(&a), "keys() should list {a}");
    assert!(keys.contains(&b), "keys() should list {b}");
    assert!(!keys.contains(&missing));
    Ok(())
}
