//! Top-level configuration and the DID-resolution caching layer a
//! running [`crate::dispatcher::Dwn`] wraps around whatever resolver its
//! embedder supplies.
//!
//! Grounded in the teacher's `common/cache.rs` (`Cache`, `DEFAULT_CACHE_TTL`,
//! an expiry-checked `get`/`set` pair) and its plain-constructor-with-
//! `Option<T>`-overrides idiom (`Cache::new_cache`), generalized from a
//! byte-oriented key/value cache to an in-memory `kid -> VerifyingKey`
//! cache, since resolution here never touches the underlying store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::jws::{DidResolver, Error as JwsError, VerifyingKey};
use crate::store::data_store::INLINE_THRESHOLD;

/// Number of rows a `RecordsQuery`/`MessagesQuery`/`EventsGet` reply
/// carries when its caller has no tighter bound of its own in mind.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Matches the teacher's own `DEFAULT_CACHE_TTL` (900000ms), expressed
/// here in the `Duration` the async resolver cache actually keys its
/// expiry off of.
const DEFAULT_RESOLVER_CACHE_TTL: Duration = Duration::from_secs(900);

/// Tunables for a [`crate::dispatcher::Dwn`] instance. Every field has a
/// sensible default; callers only need to name the ones they're
/// overriding, the same way `Cache::new_cache(location, ttl: Option<u64>)`
/// only asks for what isn't already sensible.
#[derive(Clone, Copy, Debug)]
pub struct DwnConfig {
    /// Data at or under this size is inlined into its own `RecordsWrite`
    /// descriptor as `encodedData` instead of written to the data store;
    /// mirrors [`crate::store::data_store::INLINE_THRESHOLD`], which
    /// `RecordsWriteMessage::create` consults directly. Exposed here so
    /// an embedder authoring messages against a non-default-configured
    /// instance can match its threshold.
    pub data_inline_threshold: u64,
    /// Default page size for `RecordsQuery`/`MessagesQuery`/`EventsGet`
    /// when an embedder has no tighter limit of its own.
    pub default_query_limit: usize,
    /// How long a resolved `kid -> VerifyingKey` lookup stays valid
    /// before `CachingResolver` asks the underlying resolver again.
    pub did_resolver_cache_ttl: Duration,
}

impl DwnConfig {
    pub fn new(
        data_inline_threshold: Option<u64>,
        default_query_limit: Option<usize>,
        did_resolver_cache_ttl: Option<Duration>,
    ) -> Self {
        DwnConfig {
            data_inline_threshold: data_inline_threshold.unwrap_or(INLINE_THRESHOLD),
            default_query_limit: default_query_limit.unwrap_or(DEFAULT_QUERY_LIMIT),
            did_resolver_cache_ttl: did_resolver_cache_ttl.unwrap_or(DEFAULT_RESOLVER_CACHE_TTL),
        }
    }
}

impl Default for DwnConfig {
    fn default() -> Self {
        DwnConfig::new(None, None, None)
    }
}

struct CacheEntry {
    key: VerifyingKey,
    expires_at: Instant,
}

/// Wraps an embedder-supplied [`DidResolver`] with an in-memory TTL
/// cache keyed by `kid`, so a busy tenant's pipeline doesn't re-resolve
/// the same signer's DID document on every message it authenticates.
/// Every [`crate::dispatcher::Dwn`] wraps its resolver in one of these;
/// an embedder never constructs one directly.
#[derive(Clone)]
pub struct CachingResolver {
    inner: Box<dyn DidResolver>,
    ttl: Duration,
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl CachingResolver {
    pub fn new(inner: Box<dyn DidResolver>, ttl: Duration) -> Self {
        CachingResolver { inner, ttl, entries: Arc::new(RwLock::new(HashMap::new())) }
    }
}

impl std::fmt::Debug for CachingResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingResolver").field("ttl", &self.ttl).finish()
    }
}

#[async_trait]
impl DidResolver for CachingResolver {
    async fn resolve_key(&self, kid: &str) -> Result<VerifyingKey, JwsError> {
        if let Some(entry) = self.entries.read().await.get(kid) {
            if entry.expires_at > Instant::now() {
                return Ok(entry.key.clone());
            }
        }
        let key = self.inner.resolve_key(kid).await?;
        self.entries.write().await.insert(kid.to_string(), CacheEntry { key: key.clone(), expires_at: Instant::now() + self.ttl });
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone, Debug)]
    struct CountingResolver {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl DidResolver for CountingResolver {
        async fn resolve_key(&self, _kid: &str) -> Result<VerifyingKey, JwsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let signing = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
            Ok(VerifyingKey::Ed25519(Box::new(signing.verifying_key())))
        }
    }

    #[tokio::test]
    async fn caches_within_ttl() {
        let calls = Arc::new(AtomicU32::new(0));
        let inner = CountingResolver { calls: calls.clone() };
        let resolver = CachingResolver::new(Box::new(inner), Duration::from_secs(60));

        resolver.resolve_key("did:example:alice#key-1").await.unwrap();
        resolver.resolve_key("did:example:alice#key-1").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn re_resolves_after_expiry() {
        let calls = Arc::new(AtomicU32::new(0));
        let inner = CountingResolver { calls: calls.clone() };
        let resolver = CachingResolver::new(Box::new(inner), Duration::from_millis(0));

        resolver.resolve_key("did:example:bob#key-1").await.unwrap();
        resolver.resolve_key("did:example:bob#key-1").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn config_defaults_match_documented_constants() {
        let config = DwnConfig::default();
        assert_eq!(config.data_inline_threshold, INLINE_THRESHOLD);
        assert_eq!(config.default_query_limit, DEFAULT_QUERY_LIMIT);
        assert_eq!(config.did_resolver_cache_ttl, DEFAULT_RESOLVER_CACHE_TTL);
    }
}
