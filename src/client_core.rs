//! The shared client core and the process-wide client slot.
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio::runtime::{Handle, Runtime};

use crate::{
    cache_store::{CacheStore, Lookup},
    definitions::{ExperimentDefinition, FlagDefinition},
    error::FetchError,
    transport::{with_retries, HttpTransport, Transport},
    AsyncClient, ClientConfig, Error, Result, SyncClient,
};

/// State shared by [`SyncClient`] and [`AsyncClient`]: configuration, the definition caches, and
/// the transport together with the runtime that drives it.
///
/// Both facades evaluate against the same caches, so a fetch started by a blocking caller is
/// joined by async callers and the other way around.
///
/// Most applications use the process-wide core created by [`initialize()`]. Standalone cores can
/// be created with [`ClientCore::new()`] or, with a custom transport, with
/// [`ClientCore::with_transport()`].
///
/// # Cleanup
///
/// [`ClientCore::cleanup()`] shuts down the transport. Afterwards, every evaluation through this
/// core fails with [`Error::Closed`] (strict calls) or returns the caller's default.
pub struct ClientCore {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    flags: Arc<CacheStore<FlagDefinition>>,
    experiments: Arc<CacheStore<ExperimentDefinition>>,
    /// Runtime driving transport I/O. Taken on cleanup.
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    closed: AtomicBool,
}

impl ClientCore {
    /// Create a standalone core talking HTTP to `config.base_url`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUrl`] if the base URL cannot be parsed.
    /// - [`Error::Io`] if the transport runtime failed to start.
    pub fn new(config: ClientConfig) -> Result<Arc<ClientCore>> {
        let transport = HttpTransport::new(&config)?;
        ClientCore::with_transport(config, Arc::new(transport))
    }

    /// Create a standalone core using a custom [`Transport`].
    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<ClientCore>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("feature-flags-transport")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        log::debug!(target: "feature_flags",
                    base_url = config.base_url.as_str(),
                    cache_ttl_ms = config.cache_ttl.as_millis() as u64,
                    retry_count = config.retry_count;
                    "feature flag client created");

        Ok(Arc::new(ClientCore {
            flags: Arc::new(CacheStore::new(config.cache_ttl)),
            experiments: Arc::new(CacheStore::new(config.cache_ttl)),
            config,
            transport,
            runtime: Mutex::new(Some(runtime)),
            handle,
            closed: AtomicBool::new(false),
        }))
    }

    /// Configuration this core was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Blocking facade over this core.
    pub fn sync_client(self: &Arc<Self>) -> SyncClient {
        SyncClient::new(self.clone())
    }

    /// Async facade over this core.
    pub fn async_client(self: &Arc<Self>) -> AsyncClient {
        AsyncClient::new(self.clone())
    }

    /// Returns `true` once [`ClientCore::cleanup()`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shut down the transport and drop cached definitions.
    ///
    /// In-flight fetches are aborted and their waiters are released with a network failure.
    /// Calling `cleanup()` more than once is a no-op.
    pub fn cleanup(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(runtime) = self.runtime().take() {
            // Does not block, so cleanup is safe to call from async code.
            runtime.shutdown_background();
        }
        self.flags.clear();
        self.experiments.clear();

        log::debug!(target: "feature_flags", "feature flag client cleaned up");
    }

    /// Drop the cached definition of flag `key`, so the next evaluation fetches it again.
    pub fn invalidate_flag(&self, key: &str) -> bool {
        self.flags.invalidate(key)
    }

    /// Drop the cached definition of experiment `key`, so the next evaluation fetches it again.
    pub fn invalidate_experiment(&self, key: &str) -> bool {
        self.experiments.invalidate(key)
    }

    /// Return the cached definition of flag `key`, fresh or stale, without fetching.
    pub fn cached_flag(&self, key: &str) -> Option<Arc<FlagDefinition>> {
        self.flags.peek(key)
    }

    /// Return the cached definition of experiment `key`, fresh or stale, without fetching.
    pub fn cached_experiment(&self, key: &str) -> Option<Arc<ExperimentDefinition>> {
        self.experiments.peek(key)
    }

    /// Number of cached flag and experiment definitions.
    pub fn cached_len(&self) -> usize {
        self.flags.len() + self.experiments.len()
    }

    /// Get definition `key`, blocking the current thread for at most `timeout`.
    pub(crate) fn get_blocking<D: Definition>(
        &self,
        key: &str,
        subject_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Arc<D>> {
        match self.lookup::<D>(key, subject_id)? {
            Lookup::Fresh(definition) => Ok(definition),
            Lookup::Pending(pending) => pending
                .wait_blocking(timeout)
                .map_err(|err| Error::evaluation(key, err)),
        }
    }

    /// Get definition `key`, suspending at most `timeout` while the fetch is in flight.
    pub(crate) async fn get<D: Definition>(
        &self,
        key: &str,
        subject_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Arc<D>> {
        match self.lookup::<D>(key, subject_id)? {
            Lookup::Fresh(definition) => Ok(definition),
            Lookup::Pending(pending) => pending
                .wait(timeout)
                .await
                .map_err(|err| Error::evaluation(key, err)),
        }
    }

    /// Definitions are cached per key. The subject only travels with the request that fetches
    /// the definition.
    fn lookup<D: Definition>(&self, key: &str, subject_id: Option<&str>) -> Result<Lookup<D>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let transport = self.transport.clone();
        let retry_count = self.config.retry_count;
        let owned_key = key.to_owned();
        let subject_id = subject_id.map(str::to_owned);
        Ok(D::store(self).get_or_fetch(key, &self.handle, move || async move {
            with_retries(&owned_key, retry_count, || {
                D::fetch(&*transport, &owned_key, subject_id.as_deref())
            })
            .await
        }))
    }

    fn runtime(&self) -> MutexGuard<'_, Option<Runtime>> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ClientCore {
    fn drop(&mut self) {
        // Dropping a runtime from async code panics; shutting it down in the background does not.
        if let Some(runtime) = self.runtime().take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for ClientCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCore")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

type DefinitionFuture<'a, D> =
    Pin<Box<dyn Future<Output = std::result::Result<D, FetchError>> + Send + 'a>>;

/// A cacheable definition type: knows its cache and how to fetch itself.
pub(crate) trait Definition: Send + Sync + Sized + 'static {
    fn store(core: &ClientCore) -> &Arc<CacheStore<Self>>;

    fn fetch<'a>(
        transport: &'a dyn Transport,
        key: &'a str,
        subject_id: Option<&'a str>,
    ) -> DefinitionFuture<'a, Self>;
}

impl Definition for FlagDefinition {
    fn store(core: &ClientCore) -> &Arc<CacheStore<Self>> {
        &core.flags
    }

    fn fetch<'a>(
        transport: &'a dyn Transport,
        key: &'a str,
        subject_id: Option<&'a str>,
    ) -> DefinitionFuture<'a, Self> {
        transport.fetch_flag(key, subject_id)
    }
}

impl Definition for ExperimentDefinition {
    fn store(core: &ClientCore) -> &Arc<CacheStore<Self>> {
        &core.experiments
    }

    fn fetch<'a>(
        transport: &'a dyn Transport,
        key: &'a str,
        subject_id: Option<&'a str>,
    ) -> DefinitionFuture<'a, Self> {
        transport.fetch_experiment(key, subject_id)
    }
}

/// Fast-path flag for [`client()`]. Only written while holding `GLOBAL`.
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static GLOBAL: Mutex<Option<Arc<ClientCore>>> = Mutex::new(None);

fn global() -> MutexGuard<'static, Option<Arc<ClientCore>>> {
    GLOBAL.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Initialize the process-wide client.
///
/// Idempotent: if the client is already initialized, the existing core is returned and `config`
/// is ignored. Concurrent first calls construct exactly one core.
///
/// # Errors
///
/// - [`Error::InvalidBaseUrl`] if the base URL cannot be parsed.
/// - [`Error::Io`] if the transport runtime failed to start.
///
/// # Examples
///
/// ```no_run
/// # fn main() -> feature_flags::Result<()> {
/// use feature_flags::ClientConfig;
///
/// let core = feature_flags::initialize(ClientConfig::new("http://localhost:8080"))?;
/// let client = core.sync_client();
/// if client.is_enabled("new-ui", false) {
///     println!("new UI is enabled");
/// }
/// feature_flags::cleanup();
/// # Ok(())
/// # }
/// ```
pub fn initialize(config: ClientConfig) -> Result<Arc<ClientCore>> {
    let mut slot = global();
    if let Some(core) = slot.as_ref() {
        log::debug!(target: "feature_flags",
                    "client already initialized, ignoring new configuration");
        return Ok(core.clone());
    }

    let core = ClientCore::new(config)?;
    *slot = Some(core.clone());
    INITIALIZED.store(true, Ordering::Release);
    Ok(core)
}

/// Initialize the process-wide client from `FEATURE_FLAG_*` environment variables.
///
/// See [`ClientConfig::from_env()`].
pub fn initialize_from_env() -> Result<Arc<ClientCore>> {
    if let Ok(core) = client() {
        return Ok(core);
    }
    initialize(ClientConfig::from_env()?)
}

/// Resolve the process-wide client.
///
/// # Errors
///
/// - [`Error::NotInitialized`] if [`initialize()`] has not been called or the client was cleaned
///   up.
pub fn client() -> Result<Arc<ClientCore>> {
    if !INITIALIZED.load(Ordering::Acquire) {
        return Err(Error::NotInitialized);
    }
    global().clone().ok_or(Error::NotInitialized)
}

/// Clean up the process-wide client, releasing its network resources.
///
/// Handles obtained earlier keep referring to the closed core. A later [`initialize()`] creates a
/// fresh core. Calling `cleanup()` when nothing is initialized is a no-op.
pub fn cleanup() {
    let core = {
        let mut slot = global();
        INITIALIZED.store(false, Ordering::Release);
        slot.take()
    };
    if let Some(core) = core {
        core.cleanup();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;

    use super::ClientCore;
    use crate::{
        definitions::{ExperimentDefinition, FlagDefinition},
        error::FetchError,
        transport::Transport,
        ClientConfig, Error, FailureKind,
    };

    /// In-memory transport recording how often each key was fetched.
    #[derive(Default)]
    pub(crate) struct FakeTransport {
        flags: Mutex<HashMap<String, Result<FlagDefinition, FetchError>>>,
        experiments: Mutex<HashMap<String, Result<ExperimentDefinition, FetchError>>>,
        fetches: Mutex<HashMap<String, usize>>,
        subjects: Mutex<Vec<Option<String>>>,
        total: AtomicUsize,
        delay: Duration,
    }

    impl FakeTransport {
        pub fn new() -> FakeTransport {
            FakeTransport::default()
        }

        pub fn with_delay(delay: Duration) -> FakeTransport {
            FakeTransport {
                delay,
                ..FakeTransport::default()
            }
        }

        pub fn set_flag(&self, flag: FlagDefinition) {
            self.flags.lock().unwrap().insert(flag.key.clone(), Ok(flag));
        }

        pub fn fail_flag(&self, key: &str, err: FetchError) {
            self.flags.lock().unwrap().insert(key.to_owned(), Err(err));
        }

        pub fn set_experiment(&self, experiment: ExperimentDefinition) {
            self.experiments
                .lock()
                .unwrap()
                .insert(experiment.key().to_owned(), Ok(experiment));
        }

        pub fn fail_experiment(&self, key: &str, err: FetchError) {
            self.experiments
                .lock()
                .unwrap()
                .insert(key.to_owned(), Err(err));
        }

        pub fn fetches(&self, key: &str) -> usize {
            self.fetches.lock().unwrap().get(key).copied().unwrap_or(0)
        }

        pub fn total_fetches(&self) -> usize {
            self.total.load(Ordering::SeqCst)
        }

        /// Subjects sent with each fetch, in order.
        pub fn subjects(&self) -> Vec<Option<String>> {
            self.subjects.lock().unwrap().clone()
        }

        async fn record(&self, key: &str, subject_id: Option<&str>) {
            *self.fetches.lock().unwrap().entry(key.to_owned()).or_default() += 1;
            self.subjects
                .lock()
                .unwrap()
                .push(subject_id.map(str::to_owned));
            self.total.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn fetch_flag(
            &self,
            key: &str,
            subject_id: Option<&str>,
        ) -> Result<FlagDefinition, FetchError> {
            self.record(key, subject_id).await;
            self.flags
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .unwrap_or(Err(FetchError::UnknownKey))
        }

        async fn fetch_experiment(
            &self,
            key: &str,
            subject_id: Option<&str>,
        ) -> Result<ExperimentDefinition, FetchError> {
            self.record(key, subject_id).await;
            self.experiments
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .unwrap_or(Err(FetchError::UnknownKey))
        }
    }

    pub(crate) fn test_config() -> ClientConfig {
        ClientConfig::new("http://flags.test")
            .with_retry_count(0)
            .with_evaluation_timeout(Duration::from_secs(5))
    }

    #[test]
    fn fetches_once_and_serves_from_cache() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_flag(FlagDefinition::new("new-ui", false));
        let core = ClientCore::with_transport(test_config(), transport.clone()).unwrap();

        for _ in 0..5 {
            let flag = core
                .get_blocking::<FlagDefinition>("new-ui", None, Duration::from_secs(5))
                .unwrap();
            assert!(!flag.default_enabled);
        }
        assert_eq!(transport.fetches("new-ui"), 1);
        assert!(core.cached_flag("new-ui").is_some());
    }

    #[test]
    fn subject_travels_with_the_fetch_only() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_flag(FlagDefinition::new("beta", false));
        let core = ClientCore::with_transport(test_config(), transport.clone()).unwrap();

        for subject_id in ["user-1", "user-2"] {
            core.get_blocking::<FlagDefinition>("beta", Some(subject_id), Duration::from_secs(5))
                .unwrap();
        }
        assert_eq!(transport.subjects(), vec![Some("user-1".to_owned())]);
    }

    #[test]
    fn invalidated_flag_is_fetched_again() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_flag(FlagDefinition::new("new-ui", false));
        let core = ClientCore::with_transport(test_config(), transport.clone()).unwrap();

        core.get_blocking::<FlagDefinition>("new-ui", None, Duration::from_secs(5))
            .unwrap();
        assert!(core.invalidate_flag("new-ui"));
        core.get_blocking::<FlagDefinition>("new-ui", None, Duration::from_secs(5))
            .unwrap();

        assert_eq!(transport.fetches("new-ui"), 2);
    }

    #[test]
    fn retries_transient_failures() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_flag("flaky", FetchError::Timeout);
        let core =
            ClientCore::with_transport(test_config().with_retry_count(2), transport.clone())
                .unwrap();

        let err = core
            .get_blocking::<FlagDefinition>("flaky", None, Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err.kind(), Some(FailureKind::Timeout));
        assert_eq!(transport.fetches("flaky"), 3);
    }

    #[test]
    fn cleanup_is_idempotent_and_closes_the_core() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_flag(FlagDefinition::new("new-ui", true));
        let core = ClientCore::with_transport(test_config(), transport.clone()).unwrap();
        core.get_blocking::<FlagDefinition>("new-ui", None, Duration::from_secs(5))
            .unwrap();

        core.cleanup();
        core.cleanup();

        assert!(core.is_closed());
        assert_eq!(core.cached_len(), 0);
        assert!(matches!(
            core.get_blocking::<FlagDefinition>("new-ui", None, Duration::from_secs(5)),
            Err(Error::Closed)
        ));
        assert_eq!(transport.fetches("new-ui"), 1);
    }

    #[test]
    fn cleanup_releases_in_flight_waiters() {
        let transport = Arc::new(FakeTransport::with_delay(Duration::from_secs(3600)));
        transport.set_flag(FlagDefinition::new("slow", true));
        let core = ClientCore::with_transport(test_config(), transport).unwrap();

        let waiter = {
            let core = core.clone();
            std::thread::spawn(move || {
                core.get_blocking::<FlagDefinition>("slow", None, Duration::from_secs(10))
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        core.cleanup();

        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), Some(FailureKind::NetworkFailure));
    }

    #[tokio::test]
    async fn dropping_core_inside_async_context_does_not_panic() {
        let core = ClientCore::with_transport(test_config(), Arc::new(FakeTransport::new()))
            .unwrap();
        drop(core);
    }
}
