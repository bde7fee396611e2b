// weatherdash - Dashboard backend for a personal weather station
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Keyed cache with per-entry expiry and single-flight computation.
//!
//! The first caller to miss on a key becomes its leader: it registers an in-flight
//! token (a `watch` channel), runs the computation outside of any lock, stores the
//! result and then publishes it to everyone that attached to the token in the
//! meantime. Failures are published the same way but never stored.

use crate::metrics::CacheMetrics;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Source of the current time, replaceable in tests.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        ManualClock { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComputeError {
    #[error("computation failed: {0}")]
    Failed(String),
    #[error("computation was cancelled")]
    Cancelled,
}

type Outcome<V> = Option<Result<V, ComputeError>>;

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expiry: DateTime<Utc>,
}

#[derive(Debug)]
struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    in_flight: HashMap<K, watch::Receiver<Outcome<V>>>,
}

impl<K, V> CacheState<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn fresh(&self, key: &K, now: DateTime<Utc>) -> Option<V> {
        self.entries
            .get(key)
            .filter(|e| now < e.expiry)
            .map(|e| e.value.clone())
    }
}

enum Role<V> {
    Leader(watch::Sender<Outcome<V>>),
    Waiter(watch::Receiver<Outcome<V>>),
}

pub struct ComputeCache<K, V> {
    state: Mutex<CacheState<K, V>>,
    clock: Arc<dyn Clock>,
    metrics: CacheMetrics,
}

impl<K, V> fmt::Debug for ComputeCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeCache").field("metrics", &self.metrics).finish()
    }
}

impl<K, V> ComputeCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new(clock: Arc<dyn Clock>, metrics: CacheMetrics) -> Self {
        ComputeCache {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
            }),
            clock,
            metrics,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn state(&self) -> MutexGuard<'_, CacheState<K, V>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the cached value for `key` if it hasn't expired.
    pub fn get(&self, key: &K) -> Option<V> {
        self.state().fresh(key, self.clock.now())
    }

    /// Return the value for `key`, computing it if there is no valid entry.
    ///
    /// Concurrent callers for the same key share a single run of `compute` and all
    /// receive its result or its error. A successful result is stored until the
    /// instant returned by `expiry`.
    pub async fn get_or_compute<F, Fut, E>(&self, key: K, compute: F, expiry: E) -> Result<V, ComputeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ComputeError>>,
        E: FnOnce(&K) -> DateTime<Utc>,
    {
        self.get_or_generate(key, false, compute, expiry).await
    }

    /// Like `get_or_compute` but `force` skips any cached entry and recomputes. A forced
    /// call still joins a computation that is already running for the key.
    pub async fn get_or_generate<F, Fut, E>(
        &self,
        key: K,
        force: bool,
        compute: F,
        expiry: E,
    ) -> Result<V, ComputeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ComputeError>>,
        E: FnOnce(&K) -> DateTime<Utc>,
    {
        let mut missed = false;

        loop {
            let role = {
                let mut state = self.state();
                if !force {
                    if let Some(v) = state.fresh(&key, self.clock.now()) {
                        self.metrics.hits.inc();
                        return Ok(v);
                    }
                }

                if !missed {
                    missed = true;
                    self.metrics.misses.inc();
                }

                match state.in_flight.get(&key).cloned() {
                    Some(rx) => Role::Waiter(rx),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        state.in_flight.insert(key.clone(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    let guard = InFlight {
                        cache: self,
                        key,
                        tx,
                        armed: true,
                    };
                    return guard.run(force, compute, expiry).await;
                }
                Role::Waiter(mut rx) => {
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(outcome) => outcome.clone(),
                        Err(_) => None,
                    };

                    if let Some(res) = outcome {
                        return res;
                    }

                    // Leader was dropped before finishing. Its token is gone so the next
                    // pass either finds a new leader or becomes one.
                    tracing::debug!(message = "computation abandoned, retrying", key = ?key);
                }
            }
        }
    }

    /// Remove entries that have expired. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state();
        let before = state.entries.len();
        state.entries.retain(|_, e| now < e.expiry);
        before - state.entries.len()
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ownership of the in-flight token for one key. If the leader is dropped before it
/// publishes a result (the request was cancelled, the computation panicked) the token
/// is removed, which wakes every waiter with an error so one of them can take over.
struct InFlight<'a, K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    cache: &'a ComputeCache<K, V>,
    key: K,
    tx: watch::Sender<Outcome<V>>,
    armed: bool,
}

impl<'a, K, V> InFlight<'a, K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    async fn run<F, Fut, E>(mut self, force: bool, compute: F, expiry: E) -> Result<V, ComputeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ComputeError>>,
        E: FnOnce(&K) -> DateTime<Utc>,
    {
        let cache = self.cache;

        // Someone may have stored a value between our miss and taking the token
        if !force {
            if let Some(v) = cache.get(&self.key) {
                self.publish(Ok(v.clone()), None);
                return Ok(v);
            }
        }

        cache.metrics.computations.inc();
        let res = compute().await;
        match &res {
            Ok(_) => {
                let expires = expiry(&self.key);
                self.publish(res.clone(), Some(expires));
            }
            Err(e) => {
                cache.metrics.failures.inc();
                tracing::warn!(message = "computation failed", key = ?self.key, error = %e);
                self.publish(res.clone(), None);
            }
        }

        res
    }

    /// Store (when `expiry` is set) and release the token in one critical section so no
    /// caller can see neither an entry nor a token, then wake the waiters.
    fn publish(&mut self, res: Result<V, ComputeError>, expiry: Option<DateTime<Utc>>) {
        {
            let mut state = self.cache.state();
            state.in_flight.remove(&self.key);
            if let (Ok(value), Some(expiry)) = (&res, expiry) {
                state.entries.insert(
                    self.key.clone(),
                    CacheEntry {
                        value: value.clone(),
                        expiry,
                    },
                );
            }
        }

        self.armed = false;
        self.tx.send_replace(Some(res));
    }
}

impl<'a, K, V> Drop for InFlight<'a, K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    fn drop(&mut self) {
        if self.armed {
            self.cache.state().in_flight.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Clock, ComputeCache, ComputeError, ManualClock, SystemClock};
    use crate::metrics::CacheMetrics;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn far_future(_: &String) -> DateTime<Utc> {
        Utc::now() + ChronoDuration::days(1)
    }

    fn system_cache() -> (Arc<ComputeCache<String, u64>>, CacheMetrics) {
        let metrics = CacheMetrics::default();
        let cache = Arc::new(ComputeCache::new(Arc::new(SystemClock), metrics.clone()));
        (cache, metrics)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_computation() {
        let (cache, metrics) = system_cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..50 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(
                        "2024-06-01|America/Phoenix".to_owned(),
                        || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(42)
                        },
                        far_future,
                    )
                    .await
            }));
        }

        for h in handles {
            assert_eq!(Ok(42), h.await.unwrap());
        }

        assert_eq!(1, calls.load(Ordering::SeqCst));
        assert_eq!(1, metrics.computations.get());
        assert_eq!(1, cache.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_error() {
        let (cache, metrics) = system_cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..20 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(
                        "bad".to_owned(),
                        || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Err(ComputeError::Failed("upstream unavailable".to_owned()))
                        },
                        far_future,
                    )
                    .await
            }));
        }

        for h in handles {
            assert_eq!(
                Err(ComputeError::Failed("upstream unavailable".to_owned())),
                h.await.unwrap()
            );
        }

        assert_eq!(1, calls.load(Ordering::SeqCst));
        assert_eq!(1, metrics.failures.get());
        assert!(cache.is_empty());

        // Failures aren't cached, the next caller computes again
        let res = cache.get_or_compute("bad".to_owned(), || async { Ok(7) }, far_future).await;
        assert_eq!(Ok(7), res);
        assert_eq!(2, metrics.computations.get());
    }

    #[tokio::test]
    async fn test_expired_entry_is_recomputed() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let cache: ComputeCache<String, u64> = ComputeCache::new(clock.clone(), CacheMetrics::default());
        let expiry = |_: &String| Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap();

        let first = cache.get_or_compute("k".to_owned(), || async { Ok(1) }, expiry).await;
        assert_eq!(Ok(1), first);

        clock.advance(ChronoDuration::hours(11) + ChronoDuration::minutes(59));
        let cached = cache.get_or_compute("k".to_owned(), || async { Ok(2) }, expiry).await;
        assert_eq!(Ok(1), cached);

        clock.set(Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap());
        assert_eq!(None, cache.get(&"k".to_owned()));
        let recomputed = cache.get_or_compute("k".to_owned(), || async { Ok(3) }, expiry).await;
        assert_eq!(Ok(3), recomputed);
    }

    #[tokio::test]
    async fn test_force_recomputes_valid_entry() {
        let (cache, metrics) = system_cache();

        let res = cache.get_or_generate("k".to_owned(), false, || async { Ok(1) }, far_future).await;
        assert_eq!(Ok(1), res);

        let res = cache.get_or_generate("k".to_owned(), false, || async { Ok(2) }, far_future).await;
        assert_eq!(Ok(1), res);

        let res = cache.get_or_generate("k".to_owned(), true, || async { Ok(3) }, far_future).await;
        assert_eq!(Ok(3), res);
        assert_eq!(Some(3), cache.get(&"k".to_owned()));
        assert_eq!(2, metrics.computations.get());
        assert_eq!(1, metrics.hits.get());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_cached_entry() {
        let (cache, metrics) = system_cache();

        let res = cache.get_or_generate("k".to_owned(), false, || async { Ok(1) }, far_future).await;
        assert_eq!(Ok(1), res);

        let res = cache
            .get_or_generate(
                "k".to_owned(),
                true,
                || async { Err(ComputeError::Failed("upstream unavailable".to_owned())) },
                far_future,
            )
            .await;
        assert_eq!(Err(ComputeError::Failed("upstream unavailable".to_owned())), res);
        assert_eq!(Some(1), cache.get(&"k".to_owned()));

        let res = cache.get_or_compute("k".to_owned(), || async { Ok(2) }, far_future).await;
        assert_eq!(Ok(1), res);
        assert_eq!(2, metrics.computations.get());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_different_keys_compute_independently() {
        let (cache, _) = system_cache();
        let (tx, rx) = oneshot::channel::<()>();

        // Computing "a" can only finish after "b" has run, which would deadlock if
        // computations for unrelated keys were serialized.
        let a = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute(
                        "a".to_owned(),
                        || async move {
                            if rx.await.is_err() {
                                return Err(ComputeError::Cancelled);
                            }
                            Ok(1)
                        },
                        far_future,
                    )
                    .await
            })
        };

        tokio::task::yield_now().await;
        let b = cache
            .get_or_compute(
                "b".to_owned(),
                || async move {
                    let _ = tx.send(());
                    Ok(2)
                },
                far_future,
            )
            .await;

        assert_eq!(Ok(2), b);
        let a = tokio::time::timeout(Duration::from_secs(5), a).await.unwrap().unwrap();
        assert_eq!(Ok(1), a);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_entry_not_visible_while_computing() {
        let (cache, _) = system_cache();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (finish_tx, finish_rx) = oneshot::channel::<()>();

        let leader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute(
                        "k".to_owned(),
                        || async move {
                            let _ = started_tx.send(());
                            let _ = finish_rx.await;
                            Ok(5)
                        },
                        far_future,
                    )
                    .await
            })
        };

        started_rx.await.unwrap();
        assert_eq!(None, cache.get(&"k".to_owned()));
        assert!(cache.is_empty());

        finish_tx.send(()).unwrap();
        assert_eq!(Ok(5), leader.await.unwrap());
        assert_eq!(Some(5), cache.get(&"k".to_owned()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiter_takes_over_when_leader_cancelled() {
        let (cache, metrics) = system_cache();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let leader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute(
                        "k".to_owned(),
                        || async move {
                            let _ = started_tx.send(());
                            std::future::pending::<()>().await;
                            Ok(1)
                        },
                        far_future,
                    )
                    .await
            })
        };

        started_rx.await.unwrap();
        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute("k".to_owned(), || async { Ok(2) }, far_future)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();

        let res = tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(Ok(2), res);
        assert_eq!(2, metrics.computations.get());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let cache: ComputeCache<String, u64> = ComputeCache::new(clock.clone(), CacheMetrics::default());

        let short = |_: &String| start + ChronoDuration::hours(1);
        let long = |_: &String| start + ChronoDuration::hours(48);
        cache.get_or_compute("short".to_owned(), || async { Ok(1) }, short).await.unwrap();
        cache.get_or_compute("long".to_owned(), || async { Ok(2) }, long).await.unwrap();

        clock.advance(ChronoDuration::hours(2));
        assert_eq!(clock.now(), start + ChronoDuration::hours(2));
        assert_eq!(1, cache.purge_expired());
        assert_eq!(1, cache.len());
        assert_eq!(Some(2), cache.get(&"long".to_owned()));
    }
}
