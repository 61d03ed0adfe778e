//! A TTL cache of definitions that coalesces concurrent fetches.
//!
//! Both facades go through the same [`CacheStore`]: a lookup either returns a fresh value or
//! hands back a [`PendingFetch`] attached to the single in-flight fetch for that key. The caller
//! then waits on it with the discipline it needs ([`PendingFetch::wait_blocking`] or
//! [`PendingFetch::wait`]).
//!
//! Fetches run as tasks on the transport runtime. A caller that stops waiting detaches from the
//! fetch without cancelling it; the result still lands in the cache for everyone else.
use std::{
    collections::HashMap,
    future::Future,
    pin::pin,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tokio::{runtime::Handle, sync::Notify};

use crate::error::FetchError;

type FetchResult<T> = Result<Arc<T>, FetchError>;

/// A cached value together with the time it was fetched.
#[derive(Debug)]
pub(crate) struct CacheEntry<T> {
    pub value: Arc<T>,
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl<T> CacheEntry<T> {
    /// Valid while `now - fetched_at < ttl`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < self.ttl
    }
}

/// Cache and in-flight maps live under one lock, so a key is never both missing from the cache
/// and missing from the in-flight map while a fetch for it is running.
struct State<T> {
    entries: HashMap<String, CacheEntry<T>>,
    in_flight: HashMap<String, Arc<InFlightFetch<T>>>,
}

/// TTL-keyed store of definitions of type `T`.
pub(crate) struct CacheStore<T> {
    ttl: Duration,
    state: Mutex<State<T>>,
}

/// Result of [`CacheStore::get_or_fetch`].
pub(crate) enum Lookup<T> {
    /// The cached value is within its TTL.
    Fresh(Arc<T>),
    /// A fetch is in flight (possibly started by this lookup).
    Pending(PendingFetch<T>),
}

impl<T: Send + Sync + 'static> CacheStore<T> {
    pub fn new(ttl: Duration) -> CacheStore<T> {
        CacheStore {
            ttl,
            state: Mutex::new(State {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
            }),
        }
    }

    /// Look `key` up, starting a fetch on `runtime` if the value is missing or expired and no
    /// fetch for `key` is already running.
    ///
    /// `fetcher` is called at most once, and only by the caller that starts the fetch.
    pub fn get_or_fetch<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        runtime: &Handle,
        fetcher: F,
    ) -> Lookup<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        self.get_or_fetch_at(key, Instant::now(), runtime, fetcher)
    }

    fn get_or_fetch_at<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        now: Instant,
        runtime: &Handle,
        fetcher: F,
    ) -> Lookup<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let fetch = {
            let mut state = self.state();

            let stale = match state.entries.get(key) {
                Some(entry) if entry.is_fresh(now) => {
                    log::trace!(target: "feature_flags", key; "cache hit");
                    return Lookup::Fresh(entry.value.clone());
                }
                Some(entry) => Some(entry.value.clone()),
                None => None,
            };

            if let Some(fetch) = state.in_flight.get(key) {
                log::trace!(target: "feature_flags", key; "joining in-flight fetch");
                return Lookup::Pending(PendingFetch {
                    key: key.to_owned(),
                    fetch: fetch.clone(),
                    stale,
                });
            }

            let fetch = Arc::new(InFlightFetch::new());
            state.in_flight.insert(key.to_owned(), fetch.clone());
            PendingFetch {
                key: key.to_owned(),
                fetch,
                stale,
            }
        };

        log::debug!(target: "feature_flags",
                    key,
                    stale = fetch.stale.is_some();
                    "cache miss, starting fetch");

        // Created before calling `fetcher` so that waiters are released even if it panics.
        let guard = CompletionGuard {
            store: self.clone(),
            key: key.to_owned(),
            fetch: fetch.fetch.clone(),
            completed: false,
        };
        let future = fetcher();
        runtime.spawn(async move {
            let result = future.await;
            guard.complete(result);
        });

        Lookup::Pending(fetch)
    }

    /// Record the outcome of a fetch and release its waiters.
    fn complete(&self, key: &str, fetch: &Arc<InFlightFetch<T>>, result: Result<T, FetchError>) {
        let result = result.map(Arc::new);
        {
            let mut state = self.state();
            if let Ok(value) = &result {
                state.entries.insert(
                    key.to_owned(),
                    CacheEntry {
                        value: value.clone(),
                        fetched_at: Instant::now(),
                        ttl: self.ttl,
                    },
                );
            }
            if state
                .in_flight
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, fetch))
            {
                state.in_flight.remove(key);
            }
        }
        fetch.resolve(result);
    }

    /// Return the cached value for `key`, fresh or stale, without fetching.
    pub fn peek(&self, key: &str) -> Option<Arc<T>> {
        self.state().entries.get(key).map(|entry| entry.value.clone())
    }

    /// Drop the cached value for `key`. An in-flight fetch is not affected.
    pub fn invalidate(&self, key: &str) -> bool {
        self.state().entries.remove(key).is_some()
    }

    /// Drop every cached value.
    pub fn clear(&self) {
        self.state().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    #[cfg(test)]
    fn insert_at(&self, key: &str, value: T, fetched_at: Instant) {
        self.state().entries.insert(
            key.to_owned(),
            CacheEntry {
                value: Arc::new(value),
                fetched_at,
                ttl: self.ttl,
            },
        );
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        // Every critical section is a single map operation, so the maps stay consistent even if
        // a holder panicked.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to a fetch in progress. Waiters either block on the condition variable or await
/// the notification; both observe the same result.
pub(crate) struct InFlightFetch<T> {
    result: Mutex<Option<FetchResult<T>>>,
    condvar: Condvar,
    notify: Notify,
}

impl<T> InFlightFetch<T> {
    fn new() -> InFlightFetch<T> {
        InFlightFetch {
            result: Mutex::new(None),
            condvar: Condvar::new(),
            notify: Notify::new(),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<FetchResult<T>>> {
        self.result.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store the result (first one wins) and wake all waiters.
    fn resolve(&self, result: FetchResult<T>) {
        {
            let mut slot = self.slot();
            if slot.is_none() {
                *slot = Some(result);
            }
        }
        self.condvar.notify_all();
        self.notify.notify_waiters();
    }

    fn try_result(&self) -> Option<FetchResult<T>> {
        self.slot().clone()
    }

    fn wait_blocking(&self, timeout: Duration) -> Option<FetchResult<T>> {
        let slot = self.slot();
        let (slot, _timeout) = self
            .condvar
            .wait_timeout_while(slot, timeout, |result| result.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.clone()
    }

    async fn wait(&self) -> FetchResult<T> {
        loop {
            // Register interest before checking the slot, so a `resolve()` in between is not
            // missed.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if let Some(result) = self.try_result() {
                return result;
            }
            notified.await;
        }
    }
}

/// A caller's attachment to an in-flight fetch.
pub(crate) struct PendingFetch<T> {
    key: String,
    fetch: Arc<InFlightFetch<T>>,
    /// Expired cache value, served if the fetch fails.
    stale: Option<Arc<T>>,
}

impl<T> PendingFetch<T> {
    /// Block the current thread until the fetch completes or `timeout` elapses.
    pub fn wait_blocking(self, timeout: Duration) -> FetchResult<T> {
        let result = self
            .fetch
            .wait_blocking(timeout)
            .unwrap_or(Err(FetchError::Timeout));
        self.settle(result)
    }

    /// Suspend until the fetch completes or `timeout` elapses. Must be polled inside a tokio
    /// runtime with the time driver enabled.
    pub async fn wait(self, timeout: Duration) -> FetchResult<T> {
        let result = tokio::time::timeout(timeout, self.fetch.wait())
            .await
            .unwrap_or(Err(FetchError::Timeout));
        self.settle(result)
    }

    fn settle(self, result: FetchResult<T>) -> FetchResult<T> {
        match (result, self.stale) {
            (Ok(value), _) => Ok(value),
            (Err(err), Some(stale)) => {
                log::warn!(target: "feature_flags",
                           key = self.key.as_str(),
                           error:display = err;
                           "refresh failed, serving stale value");
                Ok(stale)
            }
            (Err(err), None) => Err(err),
        }
    }
}

/// Completes the fetch when the fetch task finishes, or with an error when the task is dropped
/// before finishing (e.g., the runtime was shut down).
struct CompletionGuard<T: Send + Sync + 'static> {
    store: Arc<CacheStore<T>>,
    key: String,
    fetch: Arc<InFlightFetch<T>>,
    completed: bool,
}

impl<T: Send + Sync + 'static> CompletionGuard<T> {
    fn complete(mut self, result: Result<T, FetchError>) {
        self.completed = true;
        self.store.complete(&self.key, &self.fetch, result);
    }
}

impl<T: Send + Sync + 'static> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        if !self.completed {
            log::debug!(target: "feature_flags", key = self.key.as_str(); "fetch aborted");
            self.store.complete(
                &self.key,
                &self.fetch,
                Err(FetchError::network(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "fetch was aborted before completion",
                ))),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier,
        },
        time::{Duration, Instant},
    };

    use tokio_test::{assert_pending, assert_ready, task};

    use super::{CacheStore, InFlightFetch, Lookup};
    use crate::{error::FetchError, FailureKind};

    const TTL: Duration = Duration::from_secs(60);
    const WAIT: Duration = Duration::from_secs(5);

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn blocking_get(
        store: &Arc<CacheStore<String>>,
        runtime: &tokio::runtime::Runtime,
        key: &str,
        fetches: &Arc<AtomicUsize>,
        outcome: Result<&'static str, FetchError>,
    ) -> Result<Arc<String>, FetchError> {
        let fetches = fetches.clone();
        let lookup = store.get_or_fetch(key, runtime.handle(), move || {
            fetches.fetch_add(1, Ordering::SeqCst);
            async move { outcome.map(str::to_owned) }
        });
        match lookup {
            Lookup::Fresh(value) => Ok(value),
            Lookup::Pending(pending) => pending.wait_blocking(WAIT),
        }
    }

    #[test]
    fn fresh_value_is_served_without_fetching() {
        let runtime = runtime();
        let store = Arc::new(CacheStore::new(TTL));
        let fetches = Arc::new(AtomicUsize::new(0));

        let first = blocking_get(&store, &runtime, "new-ui", &fetches, Ok("v1")).unwrap();
        let second = blocking_get(&store, &runtime, "new-ui", &fetches, Ok("v2")).unwrap();

        assert_eq!(*first, "v1");
        assert_eq!(*second, "v1");
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn entry_is_fresh_strictly_before_ttl() {
        let runtime = runtime();
        let store = Arc::new(CacheStore::new(TTL));
        let t0 = Instant::now();
        store.insert_at("new-ui", "cached".to_owned(), t0);

        let lookup = store.get_or_fetch_at(
            "new-ui",
            t0 + TTL - Duration::from_millis(1),
            runtime.handle(),
            || async { Ok("fetched".to_owned()) },
        );
        assert!(matches!(lookup, Lookup::Fresh(value) if *value == "cached"));

        let lookup = store.get_or_fetch_at(
            "new-ui",
            t0 + TTL + Duration::from_millis(1),
            runtime.handle(),
            || async { Ok("fetched".to_owned()) },
        );
        let Lookup::Pending(pending) = lookup else {
            panic!("expired entry must trigger a fetch");
        };
        assert_eq!(*pending.wait_blocking(WAIT).unwrap(), "fetched");
        assert_eq!(*store.peek("new-ui").unwrap(), "fetched");
    }

    #[test]
    fn concurrent_misses_share_one_fetch() {
        let runtime = runtime();
        let store = Arc::new(CacheStore::<String>::new(TTL));
        let fetches = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(16));

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let fetches = fetches.clone();
                let barrier = barrier.clone();
                let handle = runtime.handle().clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let lookup = store.get_or_fetch("checkout-flow", &handle, || {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        async {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok("definition".to_owned())
                        }
                    });
                    match lookup {
                        Lookup::Fresh(value) => value,
                        Lookup::Pending(pending) => pending.wait_blocking(WAIT).unwrap(),
                    }
                })
            })
            .collect();

        for thread in threads {
            assert_eq!(*thread.join().unwrap(), "definition");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_async_misses_share_one_fetch() {
        let runtime = runtime();
        let store = Arc::new(CacheStore::<String>::new(TTL));
        let fetches = Arc::new(AtomicUsize::new(0));

        let results = runtime.block_on(async {
            let tasks: Vec<_> = (0..16)
                .map(|_| {
                    let store = store.clone();
                    let fetches = fetches.clone();
                    tokio::spawn(async move {
                        let runtime = tokio::runtime::Handle::current();
                        let lookup = store.get_or_fetch("checkout-flow", &runtime, || {
                            fetches.fetch_add(1, Ordering::SeqCst);
                            async {
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                Ok("definition".to_owned())
                            }
                        });
                        match lookup {
                            Lookup::Fresh(value) => Ok(value),
                            Lookup::Pending(pending) => pending.wait(WAIT).await,
                        }
                    })
                })
                .collect();

            let mut results = Vec::new();
            for task in tasks {
                results.push(task.await.unwrap());
            }
            results
        });

        assert!(results.iter().all(|r| matches!(r, Ok(v) if **v == "definition")));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_refresh_serves_stale_value() {
        let runtime = runtime();
        // A zero TTL makes every entry stale as soon as it is stored.
        let store = Arc::new(CacheStore::new(Duration::ZERO));
        let fetches = Arc::new(AtomicUsize::new(0));
        store.insert_at("pricing-test", "stale".to_owned(), Instant::now());

        let value = blocking_get(
            &store,
            &runtime,
            "pricing-test",
            &fetches,
            Err(FetchError::Timeout),
        )
        .unwrap();

        assert_eq!(*value, "stale");
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_without_cached_value_propagates() {
        let runtime = runtime();
        let store = Arc::new(CacheStore::<String>::new(TTL));
        let fetches = Arc::new(AtomicUsize::new(0));

        let err = blocking_get(&store, &runtime, "risky", &fetches, Err(FetchError::UnknownKey))
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::UnknownKey);
        assert_eq!(store.len(), 0);

        // Failures are not cached: the next call fetches again.
        let _ = blocking_get(&store, &runtime, "risky", &fetches, Err(FetchError::UnknownKey));
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn timed_out_waiter_does_not_cancel_fetch() {
        let runtime = runtime();
        let store = Arc::new(CacheStore::<String>::new(TTL));

        let lookup = store.get_or_fetch("slow", runtime.handle(), || async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("eventually".to_owned())
        });
        let Lookup::Pending(impatient) = lookup else {
            panic!("expected a fetch to start");
        };
        let err = impatient.wait_blocking(Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Timeout);

        let lookup = store.get_or_fetch("slow", runtime.handle(), || async {
            Err(FetchError::BadResponse("second fetch started".to_owned()))
        });
        let Lookup::Pending(patient) = lookup else {
            panic!("expected to join the in-flight fetch");
        };
        assert_eq!(*patient.wait_blocking(WAIT).unwrap(), "eventually");
        assert_eq!(*store.peek("slow").unwrap(), "eventually");
    }

    #[test]
    fn aborted_fetch_releases_waiters() {
        let runtime = runtime();
        let store = Arc::new(CacheStore::<String>::new(TTL));

        let lookup = store.get_or_fetch("never", runtime.handle(), || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("unreachable".to_owned())
        });
        let Lookup::Pending(pending) = lookup else {
            panic!("expected a fetch to start");
        };

        runtime.shutdown_background();

        let err = pending.wait_blocking(WAIT).unwrap_err();
        assert_eq!(err.kind(), FailureKind::NetworkFailure);
    }

    #[test]
    fn invalidate_and_clear() {
        let store = CacheStore::<String>::new(TTL);
        store.insert_at("a", "1".to_owned(), Instant::now());
        store.insert_at("b", "2".to_owned(), Instant::now());

        assert!(store.invalidate("a"));
        assert!(!store.invalidate("a"));
        assert_eq!(store.len(), 1);

        store.clear();
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn async_waiter_is_woken_on_resolve() {
        let fetch = InFlightFetch::<u32>::new();
        let mut waiter = task::spawn(fetch.wait());
        assert_pending!(waiter.poll());

        fetch.resolve(Ok(Arc::new(7)));
        assert!(waiter.is_woken());
        let result = assert_ready!(waiter.poll());
        assert_eq!(*result.unwrap(), 7);
    }

    #[test]
    fn first_result_wins() {
        let fetch = InFlightFetch::<u32>::new();
        fetch.resolve(Ok(Arc::new(1)));
        fetch.resolve(Err(FetchError::Timeout));

        let mut waiter = task::spawn(fetch.wait());
        let result = assert_ready!(waiter.poll());
        assert_eq!(*result.unwrap(), 1);
    }
}
