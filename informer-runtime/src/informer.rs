//! A self-driving local cache of a remote collection
//!
//! See [`Informer`] for the entry point.
use crate::{
    lifecycle::{Lifecycle, LifecycleState, ReflectorHandle},
    reflector::{self, reflector, ObjectRef, Store},
    utils::{ResettableBackoff, WatchStreamExt},
    watcher::{self, watcher, DefaultBackoff},
};
use futures::{
    stream::{self, BoxStream},
    StreamExt,
};
use informer_core::{labels::Selector, ListWatch, Resource};
use parking_lot::Mutex;
use std::{fmt, ops::Deref, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    runtime::{Handle, TryCurrentError},
    sync::oneshot,
    task::JoinError,
};
use tracing::Instrument;

/// How long [`Informer::stop`] waits for the reflector task unless configured otherwise
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors returned by [`Informer`] operations
#[derive(Debug, Error)]
pub enum Error {
    /// The informer was started before, or stopped; it can only run once
    #[error("informer cannot be started, it is already {0}")]
    AlreadyStarted(LifecycleState),

    /// `start` was called outside of a tokio runtime
    #[error("informer must be started from within a tokio runtime: {0}")]
    NoRuntime(#[source] TryCurrentError),

    /// The configuration cannot be used to run an informer
    #[error("invalid informer configuration: {0}")]
    InvalidConfig(String),

    /// The reflector task did not finish in time after being asked to, and was aborted
    #[error("reflector task did not stop within {0:?} and was aborted")]
    ShutdownTimeout(Duration),

    /// The reflector task panicked
    #[error("reflector task failed: {0}")]
    TaskFailed(#[source] JoinError),
}

type EventStream<K> = BoxStream<'static, watcher::Result<watcher::Event<K>>>;

/// The delay repeated by an exhausted backoff that never produced one
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Keeps retrying after the wrapped backoff is exhausted, at its last delay
struct Persistent<B> {
    backoff: B,
    last: Option<Duration>,
}

impl<B> Persistent<B> {
    fn new(backoff: B) -> Self {
        Self { backoff, last: None }
    }
}

impl<B: ResettableBackoff> Iterator for Persistent<B> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        match self.backoff.next() {
            Some(delay) => {
                self.last = Some(delay);
                Some(delay)
            }
            None => {
                let delay = self.last.unwrap_or(MAX_RETRY_DELAY);
                tracing::debug!(?delay, "backoff exhausted, retrying at a fixed delay");
                Some(delay)
            }
        }
    }
}

impl<B: ResettableBackoff> ResettableBackoff for Persistent<B> {
    fn reset(&mut self) {
        self.backoff.reset();
        self.last = None;
    }
}

/// Keeps a local snapshot of a remote collection in sync in the background
///
/// The informer lists the collection, then watches it for changes, folding everything
/// into a local [`Store`]. Every [`relist_period`](watcher::Config::relist_period) the
/// watch is dropped and the collection listed again, so the snapshot converges even if
/// change events are lost. Reads never touch the network.
///
/// An informer runs at most once: [`start`](Self::start) spawns the reflector task on the
/// current tokio runtime, and [`stop`](Self::stop) ends it for good. Dropping a running
/// informer aborts its task.
///
/// ```no_run
/// use informer_runtime::{watcher::Config, Informer};
/// use informer_test::FakeApiServer;
/// use k8s_openapi::api::core::v1::ConfigMap;
/// # async fn wrapper() -> Result<(), informer_runtime::informer::Error> {
/// let api = FakeApiServer::<ConfigMap>::new();
/// let informer = Informer::new(api, Config::default().within("default"))?;
///
/// let scope = informer.enter()?;
/// scope.wait_until_synced().await;
/// for cm in scope.items() {
///     println!("{:?}", cm.metadata.name);
/// }
/// scope.exit().await?;
/// # Ok(())
/// # }
/// ```
pub struct Informer<K> {
    store: Store<K>,
    lifecycle: Lifecycle,
    /// The reflector loop, until it is handed to the spawned task
    events: Mutex<Option<EventStream<K>>>,
    shutdown_timeout: Duration,
}

impl<K> Informer<K>
where
    K: Resource + Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Create an informer over `api`, using the [`DefaultBackoff`] between failed calls
    ///
    /// Fails with [`Error::InvalidConfig`] if the configuration has no relist period,
    /// a zero relist period, or a malformed label selector.
    pub fn new<A>(api: A, config: watcher::Config) -> Result<Self, Error>
    where
        A: ListWatch<K> + 'static,
    {
        Self::with_backoff(api, config, DefaultBackoff::default())
    }

    /// Create an informer over `api`, sleeping according to `backoff` after every failed call
    ///
    /// The informer never gives up: once `backoff` runs out of delays, its last delay
    /// (or [`MAX_RETRY_DELAY`] if it never had one) is repeated until a call succeeds.
    pub fn with_backoff<A, B>(api: A, config: watcher::Config, backoff: B) -> Result<Self, Error>
    where
        A: ListWatch<K> + 'static,
        B: ResettableBackoff + Send + 'static,
    {
        match config.relist_period {
            None => return Err(Error::InvalidConfig("a relist period is required".into())),
            Some(period) if period.is_zero() => {
                return Err(Error::InvalidConfig("relist period must be greater than zero".into()))
            }
            Some(_) => {}
        }
        if let Some(labels) = &config.label_selector {
            labels
                .parse::<Selector>()
                .map_err(|err| Error::InvalidConfig(err.to_string()))?;
        }

        let (store, writer) = reflector::store();
        let events = reflector(writer, watcher(api, config))
            .backoff(Persistent::new(backoff))
            .boxed();
        Ok(Self {
            store,
            lifecycle: Lifecycle::default(),
            events: Mutex::new(Some(events)),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        })
    }

    /// How long [`stop`](Self::stop) waits for the reflector task before aborting it
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Start the reflector loop on the current tokio runtime
    ///
    /// Returns immediately; use [`wait_until_synced`](Self::wait_until_synced) to wait for
    /// the first list. Fails with [`Error::AlreadyStarted`] on any call after the first,
    /// including after [`stop`](Self::stop).
    pub fn start(&self) -> Result<(), Error> {
        let runtime = Handle::try_current().map_err(Error::NoRuntime)?;
        self.lifecycle
            .start_with(|| {
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                let events = self.events.lock().take().unwrap_or_else(|| stream::empty().boxed());
                let kind = K::kind();
                let span = tracing::info_span!("informer", %kind);
                let task = runtime.spawn(run(events, shutdown_rx).instrument(span));
                ReflectorHandle::new(shutdown_tx, task)
            })
            .map_err(Error::AlreadyStarted)
    }

    /// Start the informer for the lifetime of the returned guard
    ///
    /// Call [`InformerGuard::exit`] to stop gracefully. Dropping the guard stops the
    /// informer and aborts its task without waiting.
    pub fn enter(&self) -> Result<InformerGuard<'_, K>, Error> {
        self.start()?;
        Ok(InformerGuard {
            informer: self,
            exited: false,
        })
    }
}

impl<K> Informer<K> {
    /// Stop the reflector loop and wait for it to finish
    ///
    /// The cache is frozen before this returns: it keeps its content but never changes again.
    /// Stopping an informer that was never started, or stopping twice, is not an error.
    ///
    /// If the task has not finished after the [shutdown timeout](Self::shutdown_timeout),
    /// it is aborted and [`Error::ShutdownTimeout`] is returned.
    pub async fn stop(&self) -> Result<(), Error> {
        let task = self.lifecycle.stop().map(ReflectorHandle::signal);
        self.store.freeze();
        let Some(mut task) = task else {
            return Ok(());
        };
        match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) if err.is_cancelled() => Ok(()),
            Ok(Err(err)) => Err(Error::TaskFailed(err)),
            Err(_elapsed) => {
                tracing::warn!(timeout = ?self.shutdown_timeout, "reflector task did not stop in time, aborting");
                task.abort();
                Err(Error::ShutdownTimeout(self.shutdown_timeout))
            }
        }
    }

    /// Stop without waiting: signal, freeze and abort
    fn shutdown_now(&self) {
        if let Some(handle) = self.lifecycle.stop() {
            handle.abort();
        }
        self.store.freeze();
    }

    /// A snapshot of the cached objects
    ///
    /// Never blocks on the network. Empty until the first list has completed.
    #[must_use]
    pub fn items(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    /// The cached object referred to by `key`, if any
    #[must_use]
    pub fn get(&self, key: &ObjectRef) -> Option<Arc<K>> {
        self.store.get(key)
    }

    /// A read handle to the cache that can outlive borrows of the informer
    #[must_use]
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Where the informer is in its lifetime
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Whether the reflector loop has been started and not stopped
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Wait until the first full list has been applied to the cache
    pub async fn wait_until_synced(&self) {
        self.store.wait_until_ready().await;
    }
}

impl<K> fmt::Debug for Informer<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Informer")
            .field("state", &self.state())
            .field("store", &self.store)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

impl<K> Drop for Informer<K> {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

/// Drives the event stream until told to stop
async fn run<K>(mut events: EventStream<K>, mut shutdown: oneshot::Receiver<()>) {
    tracing::info!("informer started");
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            event = events.next() => match event {
                Some(Ok(watcher::Event::Restarted(objs))) => {
                    tracing::debug!(items = objs.len(), "cache resynchronized");
                }
                Some(Ok(_)) => {}
                Some(Err(err)) if err.is_auth_failure() => {
                    tracing::error!(error = %err, "informer is not authorized, retrying");
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "informer error, retrying");
                }
                None => {
                    tracing::error!("event stream ended, the cache will no longer be updated");
                    break;
                }
            }
        }
    }
    tracing::info!("informer stopped");
}

/// A started [`Informer`], stopped when this goes out of scope
///
/// Dereferences to the informer so it can be read through the guard.
#[must_use = "dropping the guard stops the informer immediately"]
pub struct InformerGuard<'a, K> {
    informer: &'a Informer<K>,
    exited: bool,
}

impl<K> InformerGuard<'_, K> {
    /// Stop the informer gracefully, see [`Informer::stop`]
    pub async fn exit(mut self) -> Result<(), Error> {
        self.exited = true;
        self.informer.stop().await
    }
}

impl<K> Deref for InformerGuard<'_, K> {
    type Target = Informer<K>;

    fn deref(&self) -> &Self::Target {
        self.informer
    }
}

impl<K> fmt::Debug for InformerGuard<'_, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InformerGuard").field(self.informer).finish()
    }
}

impl<K> Drop for InformerGuard<'_, K> {
    fn drop(&mut self) {
        if !self.exited {
            self.informer.shutdown_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, Informer, Persistent, MAX_RETRY_DELAY};
    use crate::{
        lifecycle::LifecycleState,
        reflector::ObjectRef,
        utils::{ResettableBackoff, ResettableBackoffWrapper},
        watcher::Config,
    };
    use async_trait::async_trait;
    use backon::ConstantBuilder;
    use futures::{stream::BoxStream, StreamExt};
    use informer_core::{ErrorResponse, ListParams, ListWatch, ObjectList, WatchEvent};
    use informer_test::{fixtures::config_map_in, wait_for, FakeApiServer};
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::{sync::Arc, time::Duration};
    use tokio::sync::Notify;

    fn informer(server: &FakeApiServer<ConfigMap>) -> Informer<ConfigMap> {
        Informer::new(server.clone(), Config::default().within("default")).unwrap()
    }

    #[test]
    fn rejects_unusable_configs() {
        let server = FakeApiServer::<ConfigMap>::new();
        let zero = Informer::new(server.clone(), Config::default().relist_period(Duration::ZERO));
        assert!(matches!(zero, Err(Error::InvalidConfig(_))));
        let never = Informer::new(server.clone(), Config::default().without_relist());
        assert!(matches!(never, Err(Error::InvalidConfig(_))));
        let selector = Informer::new(server, Config::default().labels("app in (web"));
        assert!(matches!(selector, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn start_requires_a_runtime() {
        let informer = informer(&FakeApiServer::new());
        assert!(matches!(informer.start(), Err(Error::NoRuntime(_))));
        // a failed start does not consume the informer
        assert_eq!(informer.state(), LifecycleState::Created);
    }

    #[tokio::test]
    async fn starts_once_and_syncs() {
        let server = FakeApiServer::with_objects([config_map_in("default", "a", "1")]).unwrap();
        let informer = informer(&server);
        assert!(informer.items().is_empty());

        informer.start().unwrap();
        assert!(informer.is_running());
        assert!(matches!(
            informer.start(),
            Err(Error::AlreadyStarted(LifecycleState::Running))
        ));

        informer.wait_until_synced().await;
        assert!(informer.get(&ObjectRef::new("a").within("default")).is_some());
        informer.stop().await.unwrap();
        assert_eq!(informer.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_final() {
        let informer = informer(&FakeApiServer::new());
        informer.stop().await.unwrap();
        informer.stop().await.unwrap();
        assert!(matches!(
            informer.start(),
            Err(Error::AlreadyStarted(LifecycleState::Stopped))
        ));
        assert!(matches!(informer.enter(), Err(Error::AlreadyStarted(_))));
    }

    #[tokio::test]
    async fn guard_drop_stops_the_informer() {
        let server = FakeApiServer::with_objects([config_map_in("default", "a", "1")]).unwrap();
        let informer = informer(&server);
        {
            let scope = informer.enter().unwrap();
            scope.wait_until_synced().await;
            assert!(matches!(informer.enter(), Err(Error::AlreadyStarted(_))));
        }
        assert_eq!(informer.state(), LifecycleState::Stopped);

        // frozen: the cache keeps what it had
        server.create(config_map_in("default", "b", "1")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(informer.items().len(), 1);
    }

    #[tokio::test]
    async fn store_handles_outlive_the_informer() {
        let server = FakeApiServer::with_objects([config_map_in("default", "a", "1")]).unwrap();
        let informer = informer(&server);
        let scope = informer.enter().unwrap();
        scope.wait_until_synced().await;
        let store = scope.store();
        scope.exit().await.unwrap();
        drop(informer);
        assert_eq!(store.len(), 1);
        assert_eq!(server.open_watches(), 0);
    }

    fn limited(max_times: usize) -> ResettableBackoffWrapper<ConstantBuilder> {
        ResettableBackoffWrapper::new(
            ConstantBuilder::default()
                .with_delay(Duration::from_millis(100))
                .with_max_times(max_times),
        )
    }

    #[test]
    fn exhausted_backoff_repeats_its_last_delay() {
        let mut backoff = Persistent::new(limited(2));
        let delays: Vec<_> = backoff.by_ref().take(4).collect();
        assert_eq!(delays, vec![Duration::from_millis(100); 4]);
        backoff.reset();
        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));

        let mut never = Persistent::new(limited(0));
        assert_eq!(never.next(), Some(MAX_RETRY_DELAY));
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_retrying_after_a_finite_backoff_runs_out() {
        let server = FakeApiServer::with_objects([config_map_in("default", "a", "1")]).unwrap();
        let informer = Informer::with_backoff(server.clone(), Config::default().within("default"), limited(2)).unwrap();
        let scope = informer.enter().unwrap();
        scope.wait_until_synced().await;
        wait_for(Duration::from_secs(1), || server.open_watches() == 1)
            .await
            .unwrap();

        server.fail_next_lists(3);
        server.send_watch_error(ErrorResponse::gone("too old resource version"));
        server.create(config_map_in("default", "x", "1")).unwrap();

        wait_for(Duration::from_secs(35), || scope.items().len() == 2)
            .await
            .unwrap();
        assert!(scope.get(&ObjectRef::new("x").within("default")).is_some());
        assert!(scope.is_running());
        assert!(server.list_calls() >= 5);
        scope.exit().await.unwrap();
    }

    /// A backend whose list call blocks its thread
    struct Stuck {
        entered: Arc<Notify>,
    }

    #[async_trait]
    impl ListWatch<ConfigMap> for Stuck {
        async fn list(&self, _lp: &ListParams) -> informer_core::Result<ObjectList<ConfigMap>> {
            self.entered.notify_one();
            std::thread::sleep(Duration::from_millis(500));
            Ok(ObjectList::new(Vec::new(), "1"))
        }

        async fn watch(
            &self,
            _lp: &ListParams,
            _version: &str,
        ) -> informer_core::Result<BoxStream<'static, informer_core::Result<WatchEvent<ConfigMap>>>> {
            Ok(futures::stream::pending().boxed())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_gives_up_on_a_stuck_task() {
        let entered = Arc::new(Notify::new());
        let informer = Informer::new(
            Stuck {
                entered: entered.clone(),
            },
            Config::default(),
        )
        .unwrap()
        .shutdown_timeout(Duration::from_millis(50));

        informer.start().unwrap();
        entered.notified().await;
        assert!(matches!(
            informer.stop().await,
            Err(Error::ShutdownTimeout(timeout)) if timeout == Duration::from_millis(50)
        ));
        assert_eq!(informer.state(), LifecycleState::Stopped);
    }
}
