use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use keyward_clock::{Clock, DurationSecs, System, UnixTime};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "reqwest")]
use crate::source::HttpKeySource;
use crate::{
    config::KeyCacheConfig,
    error::{FetchError, ResolveError},
    jwa::KeyType,
    jwk::{Jwk, KeyId, KeyIdRef},
    jwks::{KeySet, SkipCounts},
    source::KeySource,
};

/// The keys of one successful refresh, published as a unit
#[derive(Debug, Default)]
struct Snapshot {
    keys: HashMap<KeyId, Arc<Jwk>>,
    fetched_at: Option<UnixTime>,
}

impl Snapshot {
    fn is_fresh(&self, now: UnixTime, ttl: DurationSecs) -> bool {
        match self.fetched_at {
            Some(at) => now.saturating_duration_since(at) < ttl,
            None => false,
        }
    }
}

/// Held while a refresh is in flight
///
/// Remembers how the last completed attempt failed so that callers that
/// queued behind it can share its outcome.
#[derive(Debug, Default)]
struct RefreshGate {
    last_failure: Option<ResolveError>,
}

#[derive(Debug)]
struct Inner<S, C> {
    snapshot: ArcSwap<Snapshot>,
    gate: Mutex<RefreshGate>,
    completed_attempts: AtomicU64,
    source: S,
    clock: C,
    ttl: DurationSecs,
    fetch_timeout: Duration,
    accepted_key_types: HashSet<KeyType>,
}

/// The outcome of a successful refresh
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshReport {
    keys: usize,
    skipped: SkipCounts,
    fetched_at: UnixTime,
}

impl RefreshReport {
    /// The number of keys now held by the cache
    #[must_use]
    pub fn keys(&self) -> usize {
        self.keys
    }

    /// The records of the fetched key set that were not accepted
    #[must_use]
    pub fn skipped(&self) -> SkipCounts {
        self.skipped
    }

    /// When the key set was installed
    #[must_use]
    pub fn fetched_at(&self) -> UnixTime {
        self.fetched_at
    }
}

/// A time-bounded cache of published verification keys
///
/// Lookups read an immutable snapshot without locking. When the snapshot is
/// older than the TTL, a single refresh is performed on behalf of all callers
/// that need it, and the whole key set is replaced at once.
///
/// Cloning a cache yields another handle to the same keys.
#[derive(Debug)]
pub struct KeyCache<S, C = System> {
    inner: Arc<Inner<S, C>>,
}

impl<S, C> Clone for KeyCache<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(feature = "reqwest")]
impl KeyCache<HttpKeySource> {
    /// Constructs a cache that fetches from the configured endpoint over HTTP
    #[cfg_attr(docsrs, doc(cfg(feature = "reqwest")))]
    pub fn from_config(config: KeyCacheConfig) -> Result<Self, FetchError> {
        let source = HttpKeySource::new(config.endpoint(), config.fetch_timeout())?;
        Ok(Self::new(source, config))
    }

    /// Constructs a cache of Apple's identity token signing keys
    #[cfg_attr(docsrs, doc(cfg(feature = "reqwest")))]
    pub fn apple() -> Result<Self, FetchError> {
        Self::from_config(KeyCacheConfig::default())
    }
}

impl<S> KeyCache<S, System>
where
    S: KeySource,
{
    /// Constructs an empty cache over `source`
    pub fn new(source: S, config: KeyCacheConfig) -> Self {
        Self::with_clock(source, config, System)
    }
}

impl<S, C> KeyCache<S, C>
where
    S: KeySource,
    C: Clock + Send + Sync,
{
    /// Constructs an empty cache over `source` that tells time with `clock`
    pub fn with_clock(source: S, config: KeyCacheConfig, clock: C) -> Self {
        Self {
            inner: Arc::new(Inner {
                snapshot: ArcSwap::from_pointee(Snapshot::default()),
                gate: Mutex::new(RefreshGate::default()),
                completed_attempts: AtomicU64::new(0),
                source,
                clock,
                ttl: config.ttl(),
                fetch_timeout: config.fetch_timeout(),
                accepted_key_types: config.accepted_key_types().clone(),
            }),
        }
    }

    /// Looks up the key with identifier `kid`, refreshing the key set if stale
    ///
    /// # Errors
    ///
    /// * `InvalidArgument` if `kid` is empty
    /// * `FetchFailed` or `DecodeFailed` if a needed refresh fails
    /// * `NoUsableKeys` if a needed refresh yields no usable keys
    /// * `KeyNotFound` if the current key set has no such key
    pub async fn resolve(&self, kid: &KeyIdRef) -> Result<Arc<Jwk>, ResolveError> {
        self.resolve_with_cancellation(kid, &CancellationToken::new())
            .await
    }

    /// Looks up the key with identifier `kid`, giving up if `cancel` fires
    ///
    /// Cancellation only interrupts waiting for or performing a refresh. A
    /// lookup answered from a fresh key set never observes it.
    ///
    /// A caller queued behind a refresh waits for that attempt to finish,
    /// which takes at most the fetch timeout. If that attempt is cancelled
    /// instead, nothing is recorded and the queued caller makes its own
    /// attempt, so its total wait can approach twice the fetch timeout. Pass
    /// a `cancel` token to bound the wait more tightly.
    ///
    /// # Errors
    ///
    /// As [`resolve()`][Self::resolve], and `Cancelled` if `cancel` fires
    /// first.
    pub async fn resolve_with_cancellation(
        &self,
        kid: &KeyIdRef,
        cancel: &CancellationToken,
    ) -> Result<Arc<Jwk>, ResolveError> {
        if kid.as_str().is_empty() {
            return Err(ResolveError::InvalidArgument {
                reason: "key identifier is empty",
            });
        }

        {
            let snapshot = self.inner.snapshot.load();
            if snapshot.is_fresh(self.inner.clock.now(), self.inner.ttl) {
                return lookup(&snapshot, kid);
            }
        }

        tracing::debug!(jwk.kid = %kid, "key set stale; waiting for refresh");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(jwk.kid = %kid, "key resolution cancelled");
                return Err(ResolveError::Cancelled);
            }
            result = self.refresh_if_stale() => result?,
        }

        lookup(&self.inner.snapshot.load(), kid)
    }

    /// Fetches the key set and replaces the cached keys, regardless of age
    ///
    /// On failure, the previously cached keys are left in place.
    ///
    /// # Errors
    ///
    /// * `FetchFailed` if the key set cannot be fetched in time
    /// * `DecodeFailed` if the key set is not a key-set document
    /// * `NoUsableKeys` if no record of the key set is usable
    pub async fn refresh(&self) -> Result<RefreshReport, ResolveError> {
        let mut gate = self.inner.gate.lock().await;
        self.refresh_under_gate(&mut gate).await
    }

    /// Marks the cached keys as stale, so that the next lookup refreshes them
    pub fn invalidate(&self) {
        self.inner.snapshot.rcu(|current| Snapshot {
            keys: current.keys.clone(),
            fetched_at: None,
        });
        tracing::debug!("key set invalidated");
    }

    /// The number of keys currently cached
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.snapshot.load().keys.len()
    }

    /// Whether no keys are cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.snapshot.load().keys.is_empty()
    }

    /// Whether a key with identifier `kid` is cached, fresh or not
    #[must_use]
    pub fn contains(&self, kid: &KeyIdRef) -> bool {
        self.inner.snapshot.load().keys.contains_key(kid)
    }

    /// When the cached keys were fetched
    ///
    /// `None` before the first refresh and after [`invalidate()`][Self::invalidate].
    #[must_use]
    pub fn fetched_at(&self) -> Option<UnixTime> {
        self.inner.snapshot.load().fetched_at
    }

    /// How long a fetched key set is trusted
    #[must_use]
    pub fn ttl(&self) -> DurationSecs {
        self.inner.ttl
    }

    /// Whether keys of type `kty` are retained from fetched key sets
    #[must_use]
    pub fn accepts(&self, kty: KeyType) -> bool {
        self.inner.accepted_key_types.contains(&kty)
    }

    /// The clock the cache tells time with
    pub fn clock(&self) -> &C {
        &self.inner.clock
    }

    async fn refresh_if_stale(&self) -> Result<(), ResolveError> {
        let observed = self.inner.completed_attempts.load(Ordering::Acquire);
        let mut gate = self.inner.gate.lock().await;

        if self
            .inner
            .snapshot
            .load()
            .is_fresh(self.inner.clock.now(), self.inner.ttl)
        {
            tracing::debug!("key set refreshed while waiting");
            return Ok(());
        }

        if self.inner.completed_attempts.load(Ordering::Acquire) != observed {
            if let Some(err) = &gate.last_failure {
                tracing::debug!("sharing failure of refresh completed while waiting");
                return Err(err.clone());
            }
        }

        self.refresh_under_gate(&mut gate).await.map(|_| ())
    }

    /// Performs one attempt and records its outcome
    ///
    /// If the future is dropped mid-attempt, nothing is recorded and the next
    /// caller through the gate tries again.
    #[tracing::instrument(skip(self, gate))]
    async fn refresh_under_gate(
        &self,
        gate: &mut RefreshGate,
    ) -> Result<RefreshReport, ResolveError> {
        let result = self.fetch_and_install().await;

        match &result {
            Ok(report) => {
                tracing::info!(
                    jwks.keys = report.keys,
                    jwks.skipped = report.skipped.total(),
                    "key set refreshed"
                );
            }
            Err(err) => {
                let error: &dyn std::error::Error = err;
                tracing::warn!(error, "key set refresh failed");
            }
        }

        gate.last_failure = result.as_ref().err().cloned();
        self.inner.completed_attempts.fetch_add(1, Ordering::Release);

        result
    }

    async fn fetch_and_install(&self) -> Result<RefreshReport, ResolveError> {
        let timeout = self.inner.fetch_timeout;
        let body = tokio::time::timeout(timeout, self.inner.source.fetch_key_set())
            .await
            .map_err(|_| FetchError::TimedOut { timeout })??;

        let key_set =
            KeySet::from_slice(&body).map_err(|err| ResolveError::DecodeFailed(Arc::new(err)))?;

        let (keys, skipped) = key_set
            .extract(&self.inner.accepted_key_types)
            .into_parts();

        if keys.is_empty() {
            return Err(ResolveError::NoUsableKeys { skipped });
        }

        let fetched_at = self.inner.clock.now();
        let report = RefreshReport {
            keys: keys.len(),
            skipped,
            fetched_at,
        };

        self.inner.snapshot.store(Arc::new(Snapshot {
            keys,
            fetched_at: Some(fetched_at),
        }));

        Ok(report)
    }
}

impl<S, C> KeyCache<S, C>
where
    S: KeySource + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Refreshes the key set every `interval` until `cancel` fires
    ///
    /// The first refresh happens after one interval. Failures are logged and
    /// retried at the next interval; the cached keys are left in place.
    pub fn spawn_refresh(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        // Failures are already logged
                        let _ = this.refresh().await;
                    }
                }
            }

            tracing::debug!("background key set refresh stopped");
        })
    }
}

fn lookup(snapshot: &Snapshot, kid: &KeyIdRef) -> Result<Arc<Jwk>, ResolveError> {
    match snapshot.keys.get(kid) {
        Some(jwk) => Ok(Arc::clone(jwk)),
        None => {
            tracing::debug!(jwk.kid = %kid, "no key with this kid in the key set");
            Err(ResolveError::KeyNotFound {
                kid: kid.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use keyward_clock::TestClock;
    use serde_json::json;
    use tokio::time::Instant;
    use tracing_test::traced_test;

    use super::*;
    use crate::test::{self, FakeKeySource};

    const START: UnixTime = UnixTime(1_700_000_000);

    fn kid(raw: &'static str) -> KeyId {
        KeyId::from_static(raw)
    }

    type TestCache = KeyCache<Arc<FakeKeySource>, TestClock>;

    fn cache_over(source: &Arc<FakeKeySource>) -> (TestCache, TestClock) {
        let clock = TestClock::new(START);
        let cache = KeyCache::with_clock(
            Arc::clone(source),
            KeyCacheConfig::default(),
            clock.clone(),
        );
        (cache, clock)
    }

    #[tokio::test]
    async fn repeated_hits_fetch_once() -> Result<()> {
        let source = FakeKeySource::serving(test::key_set(vec![test::rsa_jwk_value()]));
        let (cache, _) = cache_over(&source);

        let first = cache.resolve(&kid(test::RSA_KID)).await?;
        let second = cache.resolve(&kid(test::RSA_KID)).await?;
        let third = cache.resolve(&kid(test::RSA_KID)).await?;

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(source.fetches(), 1);
        assert_eq!(cache.fetched_at(), Some(START));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_triggers_one_refetch_for_concurrent_callers() -> Result<()> {
        let source = FakeKeySource::serving(test::key_set(vec![test::rsa_jwk_value()]));
        let (cache, clock) = cache_over(&source);

        cache.resolve(&kid(test::RSA_KID)).await?;
        assert_eq!(source.fetches(), 1);

        clock.advance(DurationSecs::DAY);
        source.set_delay(Duration::from_millis(250));

        let callers: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.resolve(&kid(test::RSA_KID)).await })
            })
            .collect();

        for caller in callers {
            caller.await??;
        }

        assert_eq!(source.fetches(), 2);
        assert_eq!(cache.fetched_at(), Some(START + DurationSecs::DAY));
        Ok(())
    }

    #[tokio::test]
    async fn still_fresh_just_before_ttl() -> Result<()> {
        let source = FakeKeySource::serving(test::key_set(vec![test::rsa_jwk_value()]));
        let (cache, clock) = cache_over(&source);

        cache.resolve(&kid(test::RSA_KID)).await?;
        clock.advance(DurationSecs(DurationSecs::DAY.0 - 1));
        cache.resolve(&kid(test::RSA_KID)).await?;

        assert_eq!(source.fetches(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn empty_kid_is_rejected_without_fetching() {
        let source = FakeKeySource::serving(test::key_set(vec![test::rsa_jwk_value()]));
        let (cache, _) = cache_over(&source);

        let err = cache.resolve(KeyIdRef::from_str("")).await.unwrap_err();

        assert!(matches!(err, ResolveError::InvalidArgument { .. }));
        assert_eq!(source.fetches(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn malformed_record_is_skipped() -> Result<()> {
        let source = FakeKeySource::serving(test::key_set(vec![
            test::rsa_jwk_value(),
            json!({ "kid": "broken", "kty": "RSA", "n": "%%%", "e": "AQAB" }),
        ]));
        let (cache, _) = cache_over(&source);

        cache.resolve(&kid(test::RSA_KID)).await?;
        assert_eq!(cache.len(), 1);

        let err = cache.resolve(&kid("broken")).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(err, ResolveError::KeyNotFound { ref kid } if kid.as_str() == "broken"));
        assert_eq!(source.fetches(), 1);
        assert!(logs_contain("ignoring JWK with unusable key material"));
        Ok(())
    }

    #[tokio::test]
    async fn unusable_key_set_leaves_cache_unchanged() -> Result<()> {
        let source = FakeKeySource::serving(test::key_set(vec![test::rsa_jwk_value()]));
        let (cache, clock) = cache_over(&source);

        cache.resolve(&kid(test::RSA_KID)).await?;

        let ed = test::ed25519_key_pair();
        source.serve(test::key_set(vec![test::ed25519_jwk_value("ed", &ed)]));
        clock.advance(DurationSecs::DAY);

        let err = cache.resolve(&kid(test::RSA_KID)).await.unwrap_err();
        match err {
            ResolveError::NoUsableKeys { skipped } => assert_eq!(skipped.unsupported_type, 1),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(cache.contains(&kid(test::RSA_KID)));
        assert_eq!(cache.fetched_at(), Some(START));

        let err = cache.refresh().await.unwrap_err();
        assert!(err.is_not_found());
        assert!(cache.contains(&kid(test::RSA_KID)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_endpoint_times_out() {
        let source = FakeKeySource::serving(test::key_set(vec![test::rsa_jwk_value()]));
        source.set_hang(true);
        let (cache, _) = cache_over(&source);

        let started = Instant::now();
        let err = cache.resolve(&kid(test::RSA_KID)).await.unwrap_err();

        assert!(matches!(
            err,
            ResolveError::FetchFailed(FetchError::TimedOut { timeout }) if timeout == Duration::from_secs(10)
        ));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_over_fetch() -> Result<()> {
        let source = FakeKeySource::serving(test::key_set(vec![test::rsa_jwk_value()]));
        source.set_hang(true);
        let (cache, _) = cache_over(&source);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = cache
            .resolve_with_cancellation(&kid(test::RSA_KID), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ResolveError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));

        source.set_hang(false);
        cache.resolve(&kid(test::RSA_KID)).await?;
        assert_eq!(source.fetches(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn queued_callers_share_a_failure() {
        let source = FakeKeySource::failing(FetchError::UnexpectedStatus { status: 503 });
        source.set_delay(Duration::from_millis(250));
        let (cache, _) = cache_over(&source);

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.resolve(&kid(test::RSA_KID)).await })
            })
            .collect();

        for caller in callers {
            let err = caller.await.unwrap().unwrap_err();
            assert!(matches!(
                err,
                ResolveError::FetchFailed(FetchError::UnexpectedStatus { status: 503 })
            ));
        }

        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_caller_refetches_after_leader_is_cancelled() -> Result<()> {
        let source = FakeKeySource::serving(test::key_set(vec![test::rsa_jwk_value()]));
        source.set_delay(Duration::from_secs(5));
        let (cache, _) = cache_over(&source);

        let cancel = CancellationToken::new();
        let leader = {
            let cache = cache.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cache
                    .resolve_with_cancellation(&kid(test::RSA_KID), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = Instant::now();
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.resolve(&kid(test::RSA_KID)).await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();

        assert!(matches!(leader.await?, Err(ResolveError::Cancelled)));
        waiter.await??;

        // Queued for two seconds, then a full fetch of its own
        assert_eq!(source.fetches(), 2);
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert!(started.elapsed() < Duration::from_secs(8));
        Ok(())
    }

    #[tokio::test]
    async fn failure_is_retried_by_later_callers() -> Result<()> {
        let source = FakeKeySource::failing(FetchError::UnexpectedStatus { status: 500 });
        let (cache, _) = cache_over(&source);

        let err = cache.resolve(&kid(test::RSA_KID)).await.unwrap_err();
        assert!(err.is_unavailable());

        source.serve(test::key_set(vec![test::rsa_jwk_value()]));
        cache.resolve(&kid(test::RSA_KID)).await?;

        assert_eq!(source.fetches(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_document_is_reported() {
        let source = FakeKeySource::serving(b"<html>busy</html>".to_vec());
        let (cache, _) = cache_over(&source);

        let err = cache.resolve(&kid(test::RSA_KID)).await.unwrap_err();

        assert!(matches!(err, ResolveError::DecodeFailed(_)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn fresh_cache_answers_unknown_kid_without_fetching() -> Result<()> {
        let source = FakeKeySource::serving(test::key_set(vec![test::rsa_jwk_value()]));
        let (cache, _) = cache_over(&source);

        cache.resolve(&kid(test::RSA_KID)).await?;
        let err = cache.resolve(&kid("rotated")).await.unwrap_err();

        assert!(matches!(err, ResolveError::KeyNotFound { .. }));
        assert_eq!(source.fetches(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn refresh_reports_skips() -> Result<()> {
        let source = FakeKeySource::serving(test::key_set(vec![
            test::rsa_jwk_value(),
            json!({ "kty": "RSA" }),
            json!({ "kid": "ec", "kty": "EC" }),
        ]));
        let (cache, _) = cache_over(&source);

        let report = cache.refresh().await?;

        assert_eq!(report.keys(), 1);
        assert_eq!(report.skipped().missing_kid, 1);
        assert_eq!(report.skipped().unsupported_type, 1);
        assert_eq!(report.fetched_at(), START);
        Ok(())
    }

    #[tokio::test]
    async fn invalidate_forces_refetch_but_keeps_keys() -> Result<()> {
        let source = FakeKeySource::serving(test::key_set(vec![test::rsa_jwk_value()]));
        let (cache, _) = cache_over(&source);

        cache.resolve(&kid(test::RSA_KID)).await?;
        cache.invalidate();

        assert!(cache.contains(&kid(test::RSA_KID)));
        assert_eq!(cache.fetched_at(), None);

        cache.resolve(&kid(test::RSA_KID)).await?;
        assert_eq!(source.fetches(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn background_refresh_runs_until_cancelled() {
        let source = FakeKeySource::serving(test::key_set(vec![test::rsa_jwk_value()]));
        let (cache, _) = cache_over(&source);

        let cancel = CancellationToken::new();
        let handle = cache.spawn_refresh(Duration::from_secs(60), cancel.clone());

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(source.fetches(), 2);
        assert!(cache.contains(&kid(test::RSA_KID)));

        cancel.cancel();
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.fetches(), 2);
    }
}
