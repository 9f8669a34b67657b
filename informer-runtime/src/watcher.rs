//! Watches a remote collection for changes, with error recovery
//!
//! See [`watcher`] for the primary entry point.

use crate::utils::{ResetTimerBackoff, ResettableBackoff, ResettableBackoffWrapper};
use backon::ExponentialBuilder;
use educe::Educe;
use futures::{stream::BoxStream, Stream, StreamExt};
use informer_core::{ErrorResponse, ListParams, ListWatch, Resource, ResourceExt, WatchEvent};
use std::{fmt::Debug, time::Duration};
use thiserror::Error;
use tokio::time::{sleep_until, Instant};

/// Errors surfaced by the [`watcher`] stream
///
/// None of these are fatal: the stream recovers on the next poll.
#[derive(Error, Debug)]
pub enum Error {
    /// The list call of a (re)synchronization failed
    #[error("failed to perform initial object list: {0}")]
    InitialListFailed(#[source] informer_core::Error),
    /// Opening a watch session failed
    #[error("failed to start watching object: {0}")]
    WatchStartFailed(#[source] informer_core::Error),
    /// The remote store sent an error event on an open watch
    #[error("error returned by apiserver during watch: {0}")]
    WatchError(#[source] ErrorResponse),
    /// The watch stream broke
    #[error("watch stream failed: {0}")]
    WatchFailed(#[source] informer_core::Error),
}

impl Error {
    /// The error status returned by the remote store, if any
    #[must_use]
    pub fn api_response(&self) -> Option<&ErrorResponse> {
        match self {
            Error::InitialListFailed(err) | Error::WatchStartFailed(err) | Error::WatchFailed(err) => {
                err.api_response()
            }
            Error::WatchError(resp) => Some(resp),
        }
    }

    /// Whether the remote store rejected our credentials or permissions
    ///
    /// These are retried like any other error, but retrying will rarely help.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        self.api_response().is_some_and(ErrorResponse::is_auth_failure)
    }
}

/// Convient alias for `Result<T, watcher::Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Watch events returned from the [`watcher`]
pub enum Event<K> {
    /// An object was added or modified
    Applied(K),
    /// An object was deleted
    ///
    /// NOTE: This should not be used for managing persistent state elsewhere, since
    /// events may be lost if the watcher is unavailable.
    Deleted(K),
    /// The watch stream was restarted, so `Deleted` events may have been missed
    ///
    /// Should be used as a signal to replace the store contents atomically.
    ///
    /// Any objects that were previously [`Applied`](Event::Applied) but are not listed in this event
    /// should be assumed to have been [`Deleted`](Event::Deleted).
    Restarted(Vec<K>),
}

/// The relist period used unless configured otherwise
pub const DEFAULT_RELIST_PERIOD: Duration = Duration::from_secs(300);

/// Accumulates all options that can be used on the watcher invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Restrict the watch to a namespace
    ///
    /// Defaults to everything.
    pub namespace: Option<String>,

    /// A selector to restrict returned objects by their labels.
    ///
    /// Defaults to everything if `None`.
    pub label_selector: Option<String>,

    /// A selector to restrict returned objects by their fields.
    ///
    /// Defaults to everything if `None`.
    pub field_selector: Option<String>,

    /// Timeout for a single watch session, in seconds.
    ///
    /// Passed to the remote store, which ends the watch after this long.
    /// The watcher then transparently resumes from the last seen resource version.
    pub timeout: Option<u32>,

    /// How often to throw away the watch session and start over with a full list
    ///
    /// Bounds the staleness of the cache even when watch events are silently lost.
    /// `None` disables periodic relisting.
    pub relist_period: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: None,
            label_selector: None,
            field_selector: None,
            timeout: None,
            relist_period: Some(DEFAULT_RELIST_PERIOD),
        }
    }
}

/// Builder interface to Config
///
/// Usage:
/// ```
/// use informer_runtime::watcher::Config;
/// use std::time::Duration;
/// let wc = Config::default()
///     .within("default")
///     .labels("app=web")
///     .relist_period(Duration::from_secs(60));
/// assert_eq!(wc.namespace.as_deref(), Some("default"));
/// ```
impl Config {
    /// Restrict the watch to objects in `namespace`
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Configure the timeout for watch sessions
    #[must_use]
    pub fn timeout(mut self, timeout_secs: u32) -> Self {
        self.timeout = Some(timeout_secs);
        self
    }

    /// Configure the selector to restrict the list of returned objects by their fields.
    ///
    /// Defaults to everything.
    /// Supports `=`, `==`, `!=`, and can be comma separated: `metadata.name=foo,metadata.namespace!=bar`.
    #[must_use]
    pub fn fields(mut self, field_selector: &str) -> Self {
        self.field_selector = Some(field_selector.to_string());
        self
    }

    /// Configure the selector to restrict the list of returned objects by their labels.
    ///
    /// Defaults to everything.
    /// Supports `=`, `==`, `!=`, `in`, `notin`, and can be comma separated: `foo=bar,baz in (a,b)`.
    #[must_use]
    pub fn labels(mut self, label_selector: &str) -> Self {
        self.label_selector = Some(label_selector.to_string());
        self
    }

    /// Start over with a full list every `period`
    #[must_use]
    pub fn relist_period(mut self, period: Duration) -> Self {
        self.relist_period = Some(period);
        self
    }

    /// Never relist unless the remote store forces it
    #[must_use]
    pub fn without_relist(mut self) -> Self {
        self.relist_period = None;
        self
    }

    /// The list parameters sent on every list and watch call
    #[must_use]
    pub fn to_list_params(&self) -> ListParams {
        ListParams {
            namespace: self.namespace.clone(),
            label_selector: self.label_selector.clone(),
            field_selector: self.field_selector.clone(),
            timeout: self.timeout,
        }
    }
}

#[derive(Educe)]
#[educe(Debug)]
/// The internal finite state machine driving the [`watcher`]
enum State<K> {
    /// The Watcher is empty, and the next [`poll`](Stream::poll_next) will start the LIST to get all existing objects
    Empty,
    /// The LIST was successful, so we should move on to starting the actual watch.
    ///
    /// Also used to resume from `resource_version` after a watch session ended.
    InitListed {
        resource_version: String,
        relist_at: Option<Instant>,
    },
    /// The watch is in progress, from this point we just return events from the server.
    ///
    /// If the connection is disrupted then we propagate the error but try to restart the watch stream by
    /// returning to the `InitListed` state.
    /// If we fall out of the watch window, or the relist deadline passes, then we fall back to a re-list
    /// with `Empty`.
    Watching {
        resource_version: String,
        relist_at: Option<Instant>,
        #[educe(Debug(ignore))]
        stream: BoxStream<'static, informer_core::Result<WatchEvent<K>>>,
    },
}

fn relist_due(relist_at: Option<Instant>) -> bool {
    relist_at.is_some_and(|deadline| deadline <= Instant::now())
}

/// Progresses the watcher a single step, returning (event, state)
///
/// This function should be trampolined: if event == `None`
/// then the function should be called again until it returns a Some.
async fn step_trampolined<K, A>(
    api: &A,
    params: &ListParams,
    relist_period: Option<Duration>,
    state: State<K>,
) -> (Option<Result<Event<K>>>, State<K>)
where
    K: Resource + Clone + Debug + Send + 'static,
    A: ListWatch<K>,
{
    tracing::trace!(?state, "stepping watcher");
    match state {
        State::Empty => match api.list(params).await {
            Ok(list) => {
                let resource_version = list.metadata.resource_version.unwrap_or_default();
                let relist_at = relist_period.map(|period| Instant::now() + period);
                tracing::debug!(
                    items = list.items.len(),
                    %resource_version,
                    ?relist_period,
                    "list complete, replacing cache"
                );
                (Some(Ok(Event::Restarted(list.items))), State::InitListed {
                    resource_version,
                    relist_at,
                })
            }
            Err(err) => (Some(Err(Error::InitialListFailed(err))), State::Empty),
        },
        State::InitListed {
            resource_version,
            relist_at,
        } => {
            if relist_due(relist_at) {
                tracing::debug!("relist deadline passed while reconnecting, relisting");
                return (None, State::Empty);
            }
            match api.watch(params, &resource_version).await {
                Ok(stream) => {
                    tracing::debug!(%resource_version, "watch started");
                    (None, State::Watching {
                        resource_version,
                        relist_at,
                        stream,
                    })
                }
                Err(err) => {
                    // HTTP GONE, our version is out of the watch window and we need to re-list
                    let new_state = if err.is_gone() {
                        tracing::debug!(%resource_version, "resource version expired, relisting");
                        State::Empty
                    } else {
                        State::InitListed {
                            resource_version,
                            relist_at,
                        }
                    };
                    (Some(Err(Error::WatchStartFailed(err))), new_state)
                }
            }
        }
        State::Watching {
            resource_version,
            relist_at,
            mut stream,
        } => {
            let next = match relist_at {
                Some(deadline) => tokio::select! {
                    biased;
                    () = sleep_until(deadline) => {
                        tracing::debug!(%resource_version, "relist period elapsed, dropping watch");
                        return (None, State::Empty);
                    }
                    next = stream.next() => next,
                },
                None => stream.next().await,
            };
            match next {
                Some(Ok(WatchEvent::Added(obj) | WatchEvent::Modified(obj))) => {
                    let resource_version = obj.resource_version().unwrap_or(resource_version);
                    tracing::trace!(name = %obj.name_any(), %resource_version, "object applied");
                    (Some(Ok(Event::Applied(obj))), State::Watching {
                        resource_version,
                        relist_at,
                        stream,
                    })
                }
                Some(Ok(WatchEvent::Deleted(obj))) => {
                    let resource_version = obj.resource_version().unwrap_or(resource_version);
                    tracing::trace!(name = %obj.name_any(), %resource_version, "object deleted");
                    (Some(Ok(Event::Deleted(obj))), State::Watching {
                        resource_version,
                        relist_at,
                        stream,
                    })
                }
                Some(Ok(WatchEvent::Bookmark(bm))) => {
                    tracing::trace!(resource_version = %bm.metadata.resource_version, "received bookmark");
                    (None, State::Watching {
                        resource_version: bm.metadata.resource_version,
                        relist_at,
                        stream,
                    })
                }
                Some(Ok(WatchEvent::Error(err))) => {
                    // HTTP GONE, means we have desynced and need to start over and re-list :(
                    let new_state = if err.is_gone() {
                        State::Empty
                    } else {
                        State::InitListed {
                            resource_version,
                            relist_at,
                        }
                    };
                    (Some(Err(Error::WatchError(err))), new_state)
                }
                Some(Err(err)) => {
                    let new_state = if err.is_gone() {
                        State::Empty
                    } else {
                        State::InitListed {
                            resource_version,
                            relist_at,
                        }
                    };
                    (Some(Err(Error::WatchFailed(err))), new_state)
                }
                None => {
                    tracing::debug!(%resource_version, "watch ended, reconnecting");
                    (None, State::InitListed {
                        resource_version,
                        relist_at,
                    })
                }
            }
        }
    }
}

/// Trampoline helper for `step_trampolined`
async fn step<K, A>(
    api: &A,
    params: &ListParams,
    relist_period: Option<Duration>,
    mut state: State<K>,
) -> (Result<Event<K>>, State<K>)
where
    K: Resource + Clone + Debug + Send + 'static,
    A: ListWatch<K>,
{
    loop {
        match step_trampolined(api, params, relist_period, state).await {
            (Some(result), new_state) => return (result, new_state),
            (None, new_state) => state = new_state,
        }
    }
}

/// Watches a remote collection for changes continuously
///
/// Compared to [`ListWatch::watch`], this automatically tries to recover the stream upon errors,
/// and periodically starts over with a full list.
///
/// Errors from the underlying watch are propagated, after which the stream will go into recovery mode on the next poll.
/// You can apply your own backoff by not polling the stream for a duration after errors.
/// Keep in mind that some [`TryStream`](futures::TryStream) combinators (such as
/// [`try_for_each`](futures::TryStreamExt::try_for_each) and [`try_concat`](futures::TryStreamExt::try_concat))
/// will terminate eagerly as soon as they receive an [`Err`].
///
/// This is intended to provide a safe and atomic input interface for a state store like a [`reflector`],
/// direct users may want to use [`WatchStreamExt`](crate::WatchStreamExt) for backoff.
///
/// ```no_run
/// use futures::TryStreamExt;
/// use informer_runtime::{watcher, watcher::Config, WatchStreamExt};
/// use informer_test::FakeApiServer;
/// use k8s_openapi::api::core::v1::ConfigMap;
/// # async fn wrapper() -> Result<(), watcher::Error> {
/// let api = FakeApiServer::<ConfigMap>::new();
/// watcher(api, Config::default().labels("app=web"))
///     .default_backoff()
///     .try_for_each(|event| async move {
///         println!("{:?}", event);
///         Ok(())
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
/// [`reflector`]: super::reflector::reflector
///
/// # Recovery
///
/// (The details of recovery are considered an implementation detail and should not be relied on to be stable, but are
/// documented here for posterity.)
///
/// If the watch connection is interrupted then we attempt to restart the watch using the last
/// resource version that we have seen on the stream. If this is successful then the stream is simply resumed
/// from where it left off. If this fails because the resource version is no longer valid then we start over
/// with a new list, emitting an [`Event::Restarted`].
///
/// Independently of the watch health, once [`Config::relist_period`] has elapsed since the last list
/// the watch session is dropped and we start over with a new list.
pub fn watcher<K, A>(api: A, config: Config) -> impl Stream<Item = Result<Event<K>>> + Send
where
    K: Resource + Clone + Debug + Send + 'static,
    A: ListWatch<K> + 'static,
{
    let params = config.to_list_params();
    futures::stream::unfold(
        (api, params, config.relist_period, State::Empty),
        |(api, params, relist_period, state)| async move {
            let (event, state) = step(&api, &params, relist_period, state).await;
            Some((event, (api, params, relist_period, state)))
        },
    )
}

/// Default watcher backoff inspired by Kubernetes' client-go.
///
/// The parameters currently optimize for being kind to struggling apiservers.
/// The exact parameters are taken from
/// [client-go's reflector source](https://github.com/kubernetes/client-go/blob/980663e185ab6fc79163b1c2565034f6d58368db/tools/cache/reflector.go#L177-L181)
/// and should not be considered stable.
///
/// This struct implements [`ResettableBackoff`] and is the default strategy used
/// when calling [`WatchStreamExt::default_backoff`](crate::WatchStreamExt::default_backoff).
pub struct DefaultBackoff(Strategy);
type Strategy = ResetTimerBackoff<ResettableBackoffWrapper<ExponentialBuilder>>;

impl Default for DefaultBackoff {
    fn default() -> Self {
        Self(ResetTimerBackoff::new(
            ResettableBackoffWrapper::new(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(800))
                    .with_max_delay(Duration::from_secs(30))
                    .with_factor(2.0)
                    .with_jitter()
                    .without_max_times(),
            ),
            Duration::from_secs(120),
        ))
    }
}

impl Iterator for DefaultBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl ResettableBackoff for DefaultBackoff {
    fn reset(&mut self) {
        self.0.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::{watcher, Config, DefaultBackoff, Error, Event};
    use futures::{poll, stream::BoxStream, StreamExt};
    use informer_core::ErrorResponse;
    use informer_test::{fixtures::config_map_in, FakeApiServer};
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::time::Duration;

    type Events = BoxStream<'static, super::Result<Event<ConfigMap>>>;

    fn names(objs: &[ConfigMap]) -> Vec<String> {
        let mut names = objs.iter().filter_map(|o| o.metadata.name.clone()).collect::<Vec<_>>();
        names.sort();
        names
    }

    fn expect_restarted(event: Option<super::Result<Event<ConfigMap>>>) -> Vec<String> {
        match event {
            Some(Ok(Event::Restarted(objs))) => names(&objs),
            other => panic!("expected a relist, got {other:?}"),
        }
    }

    fn start(server: &FakeApiServer<ConfigMap>, config: Config) -> Events {
        watcher(server.clone(), config.within("default")).boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn lists_then_streams_changes() {
        let server = FakeApiServer::with_objects([config_map_in("default", "a", "1")]).unwrap();
        let mut events = start(&server, Config::default());
        assert_eq!(expect_restarted(events.next().await), vec!["a"]);
        assert!(poll!(events.next()).is_pending());

        server.create(config_map_in("default", "b", "1")).unwrap();
        assert!(matches!(events.next().await, Some(Ok(Event::Applied(cm))) if cm.metadata.name.as_deref() == Some("b")));
        server.delete(Some("default"), "a").unwrap();
        assert!(matches!(events.next().await, Some(Ok(Event::Deleted(cm))) if cm.metadata.name.as_deref() == Some("a")));
        assert_eq!((server.list_calls(), server.watch_calls()), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn relists_when_the_period_elapses() {
        let server = FakeApiServer::with_objects([config_map_in("default", "a", "1")]).unwrap();
        let mut events = start(&server, Config::default().relist_period(Duration::from_secs(10)));
        assert_eq!(expect_restarted(events.next().await), vec!["a"]);
        assert!(poll!(events.next()).is_pending());

        // the open watch never tells us about these
        server.drop_watch_events(true);
        server.create(config_map_in("default", "b", "1")).unwrap();
        server.delete(Some("default"), "a").unwrap();
        assert!(poll!(events.next()).is_pending());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(expect_restarted(events.next().await), vec!["b"]);
        assert_eq!(server.list_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn without_relist_never_lists_again() {
        let server = FakeApiServer::with_objects([config_map_in("default", "a", "1")]).unwrap();
        let mut events = start(&server, Config::default().without_relist());
        expect_restarted(events.next().await);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(poll!(events.next()).is_pending());
        assert_eq!(server.list_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gone_error_event_triggers_relist() {
        let server = FakeApiServer::with_objects([config_map_in("default", "a", "1")]).unwrap();
        let mut events = start(&server, Config::default());
        expect_restarted(events.next().await);
        assert!(poll!(events.next()).is_pending());

        server.send_watch_error(ErrorResponse::gone("too old resource version"));
        assert!(matches!(events.next().await, Some(Err(Error::WatchError(e))) if e.code == 410));
        assert_eq!(expect_restarted(events.next().await), vec!["a"]);
        assert_eq!(server.list_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn other_error_events_resume_from_last_version() {
        let server = FakeApiServer::with_objects([config_map_in("default", "a", "1")]).unwrap();
        let mut events = start(&server, Config::default());
        expect_restarted(events.next().await);
        assert!(poll!(events.next()).is_pending());

        server.send_watch_error(ErrorResponse::failure(500, "InternalError", "etcd leader changed"));
        assert!(matches!(events.next().await, Some(Err(Error::WatchError(e))) if e.code == 500));
        // changes made while disconnected are replayed by the new session
        server.create(config_map_in("default", "b", "1")).unwrap();
        assert!(matches!(events.next().await, Some(Ok(Event::Applied(_)))));
        assert_eq!((server.list_calls(), server.watch_calls()), (1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn ended_watch_reconnects_silently() {
        let server = FakeApiServer::with_objects([config_map_in("default", "a", "1")]).unwrap();
        let mut events = start(&server, Config::default());
        expect_restarted(events.next().await);
        assert!(poll!(events.next()).is_pending());

        server.disconnect_watchers();
        server.replace(config_map_in("default", "a", "2")).unwrap();
        assert!(matches!(events.next().await, Some(Ok(Event::Applied(_)))));
        assert_eq!((server.list_calls(), server.watch_calls()), (1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_resume_after_the_last_applied_event() {
        let server = FakeApiServer::with_objects([config_map_in("default", "a", "1")]).unwrap();
        let mut events = start(&server, Config::default());
        expect_restarted(events.next().await);
        assert!(poll!(events.next()).is_pending());

        server.create(config_map_in("default", "b", "1")).unwrap();
        assert!(matches!(events.next().await, Some(Ok(Event::Applied(cm))) if cm.metadata.name.as_deref() == Some("b")));

        server.disconnect_watchers();
        server.replace(config_map_in("default", "a", "2")).unwrap();
        // b is not seen again
        match events.next().await {
            Some(Ok(Event::Applied(cm))) => assert_eq!(cm.metadata.name.as_deref(), Some("a")),
            other => panic!("expected a to be applied, got {other:?}"),
        }
        assert!(poll!(events.next()).is_pending());
        assert_eq!((server.list_calls(), server.watch_calls()), (1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_version_on_reconnect_relists() {
        let server = FakeApiServer::with_objects([config_map_in("default", "a", "1")]).unwrap();
        let mut events = start(&server, Config::default());
        expect_restarted(events.next().await);
        assert!(poll!(events.next()).is_pending());

        server.disconnect_watchers();
        server.create(config_map_in("default", "b", "1")).unwrap();
        server.compact();
        assert!(matches!(events.next().await, Some(Err(Error::WatchStartFailed(e))) if e.is_gone()));
        assert_eq!(expect_restarted(events.next().await), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_start_failures_retry_the_watch() {
        let server = FakeApiServer::with_objects([config_map_in("default", "a", "1")]).unwrap();
        server.fail_next_watches(1);
        let mut events = start(&server, Config::default());
        expect_restarted(events.next().await);
        assert!(matches!(events.next().await, Some(Err(Error::WatchStartFailed(_)))));
        assert!(poll!(events.next()).is_pending());
        assert_eq!((server.list_calls(), server.watch_calls()), (1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn list_failures_are_retried() {
        let server = FakeApiServer::with_objects([config_map_in("default", "a", "1")]).unwrap();
        server.fail_next_lists(2);
        let mut events = start(&server, Config::default());
        assert!(matches!(events.next().await, Some(Err(Error::InitialListFailed(_)))));
        assert!(matches!(events.next().await, Some(Err(Error::InitialListFailed(_)))));
        assert_eq!(expect_restarted(events.next().await), vec!["a"]);
    }

    #[tokio::test]
    async fn filters_are_forwarded() {
        let server = FakeApiServer::with_objects([
            config_map_in("default", "a", "1"),
            config_map_in("kube-system", "b", "1"),
        ])
        .unwrap();
        let mut events = start(&server, Config::default().fields("metadata.name!=c"));
        assert_eq!(expect_restarted(events.next().await), vec!["a"]);
    }

    #[test]
    fn auth_failures_are_recognised() {
        let forbidden = Error::InitialListFailed(informer_core::Error::Api(ErrorResponse::failure(
            403,
            "Forbidden",
            "configmaps is forbidden",
        )));
        assert!(forbidden.is_auth_failure());
        assert!(!Error::WatchError(ErrorResponse::gone("expired")).is_auth_failure());
        assert!(!Error::WatchFailed(informer_core::Error::Service("reset".into())).is_auth_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn default_backoff_grows_and_caps() {
        let delays = DefaultBackoff::default().take(10).collect::<Vec<_>>();
        assert_eq!(delays.len(), 10);
        assert!(delays[0] >= Duration::from_millis(800));
        // jitter adds at most one extra delay on top of the cap
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(60)));
    }
}
