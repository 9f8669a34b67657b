use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use futures::{
    channel::mpsc,
    stream::{BoxStream, StreamExt},
};
use informer_core::{
    labels::Selector, Error, ErrorResponse, ListParams, ListWatch, ObjectList, Resource, ResourceExt, Result,
    WatchEvent,
};
use parking_lot::Mutex;

type ObjectKey = (Option<String>, String);

/// An in-memory remote collection implementing [`ListWatch`]
///
/// Every mutation bumps a global revision which becomes the object's `resourceVersion`,
/// and is recorded in an event history that watches are served from. Clones share the same state.
///
/// Faults can be injected to exercise recovery paths:
/// - [`fail_next_lists`](Self::fail_next_lists) / [`fail_next_watches`](Self::fail_next_watches)
/// - [`drop_watch_events`](Self::drop_watch_events) silently stops delivering to open watches
/// - [`compact`](Self::compact) forgets the history, so older versions get `410 Gone`
/// - [`disconnect_watchers`](Self::disconnect_watchers) and [`send_watch_error`](Self::send_watch_error)
pub struct FakeApiServer<K> {
    inner: Arc<Mutex<Inner<K>>>,
}

impl<K> Clone for FakeApiServer<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Subscriber<K> {
    params: ListParams,
    tx: mpsc::UnboundedSender<Result<WatchEvent<K>>>,
}

struct Inner<K> {
    objects: BTreeMap<ObjectKey, K>,
    revision: u64,
    history: VecDeque<(u64, WatchEvent<K>)>,
    /// Watches starting before this revision can no longer be served
    compacted: u64,
    watchers: Vec<Subscriber<K>>,
    drop_events: bool,
    failing_lists: usize,
    failing_watches: usize,
    list_calls: usize,
    watch_calls: usize,
}

impl<K> Default for FakeApiServer<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                objects: BTreeMap::new(),
                revision: 1,
                history: VecDeque::new(),
                compacted: 0,
                watchers: Vec::new(),
                drop_events: false,
                failing_lists: 0,
                failing_watches: 0,
                list_calls: 0,
                watch_calls: 0,
            })),
        }
    }
}

fn key_of<K: Resource>(obj: &K) -> ObjectKey {
    (obj.namespace(), obj.name_any())
}

fn not_found(key: &ObjectKey) -> Error {
    Error::Api(ErrorResponse::failure(404, "NotFound", format!("{:?} not found", key)))
}

/// Whether `obj` belongs to the collection described by `lp`
fn selects<K: Resource>(lp: &ListParams, obj: &K) -> Result<bool> {
    if let Some(ns) = &lp.namespace {
        if obj.meta().namespace.as_ref() != Some(ns) {
            return Ok(false);
        }
    }
    if let Some(labels) = &lp.label_selector {
        let selector = labels
            .parse::<Selector>()
            .map_err(|err| Error::Api(ErrorResponse::failure(400, "BadRequest", err.to_string())))?;
        if !selector.matches(&obj.labels()) {
            return Ok(false);
        }
    }
    if let Some(fields) = &lp.field_selector {
        for requirement in fields.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            let (field, negate, value) = if let Some((f, v)) = requirement.split_once("!=") {
                (f, true, v)
            } else if let Some((f, v)) = requirement.split_once("==").or_else(|| requirement.split_once('=')) {
                (f, false, v)
            } else {
                return Err(Error::Api(ErrorResponse::failure(
                    400,
                    "BadRequest",
                    format!("invalid field selector: {requirement}"),
                )));
            };
            let actual = match field.trim() {
                "metadata.name" => Some(obj.name_any()),
                "metadata.namespace" => obj.namespace(),
                other => {
                    return Err(Error::Api(ErrorResponse::failure(
                        400,
                        "BadRequest",
                        format!("field label not supported: {other}"),
                    )))
                }
            };
            if (actual.as_deref() == Some(value.trim())) == negate {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

impl<K> Inner<K>
where
    K: Resource + Clone,
{
    /// Stamps `obj` with the next revision and records the change
    fn record(&mut self, mut obj: K, make_event: fn(K) -> WatchEvent<K>) -> K {
        self.revision += 1;
        obj.meta_mut().resource_version = Some(self.revision.to_string());
        let event = make_event(obj.clone());
        self.history.push_back((self.revision, event.clone()));
        if self.drop_events {
            tracing::trace!(revision = self.revision, "dropping watch event");
        } else {
            self.broadcast(&obj, &event);
        }
        obj
    }

    fn broadcast(&mut self, obj: &K, event: &WatchEvent<K>) {
        self.watchers.retain(|sub| match selects(&sub.params, obj) {
            Ok(true) => sub.tx.unbounded_send(Ok(event.clone())).is_ok(),
            _ => !sub.tx.is_closed(),
        });
    }
}

impl<K> FakeApiServer<K>
where
    K: Resource + Clone + Send + 'static,
{
    /// An empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// A collection seeded with `objs`
    pub fn with_objects(objs: impl IntoIterator<Item = K>) -> Result<Self> {
        let server = Self::new();
        for obj in objs {
            server.create(obj)?;
        }
        Ok(server)
    }

    /// Adds a new object, failing with `409 AlreadyExists` if the key is taken
    pub fn create(&self, obj: K) -> Result<K> {
        let mut inner = self.inner.lock();
        let key = key_of(&obj);
        if inner.objects.contains_key(&key) {
            return Err(Error::Api(ErrorResponse::failure(
                409,
                "AlreadyExists",
                format!("{:?} already exists", key),
            )));
        }
        let obj = inner.record(obj, WatchEvent::Added);
        inner.objects.insert(key, obj.clone());
        Ok(obj)
    }

    /// Replaces an existing object, failing with `404 NotFound` if it does not exist
    pub fn replace(&self, obj: K) -> Result<K> {
        let mut inner = self.inner.lock();
        let key = key_of(&obj);
        if !inner.objects.contains_key(&key) {
            return Err(not_found(&key));
        }
        let obj = inner.record(obj, WatchEvent::Modified);
        inner.objects.insert(key, obj.clone());
        Ok(obj)
    }

    /// Removes an object, failing with `404 NotFound` if it does not exist
    pub fn delete(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        let mut inner = self.inner.lock();
        let key = (namespace.map(String::from), name.to_string());
        let obj = inner.objects.remove(&key).ok_or_else(|| not_found(&key))?;
        Ok(inner.record(obj, WatchEvent::Deleted))
    }

    /// Removes every object matching `lp`, returning them
    pub fn delete_collection(&self, lp: &ListParams) -> Result<Vec<K>> {
        let mut inner = self.inner.lock();
        let mut keys = Vec::new();
        for (key, obj) in &inner.objects {
            if selects(lp, obj)? {
                keys.push(key.clone());
            }
        }
        let mut deleted = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(obj) = inner.objects.remove(&key) {
                deleted.push(inner.record(obj, WatchEvent::Deleted));
            }
        }
        Ok(deleted)
    }

    /// The current revision of the collection
    pub fn resource_version(&self) -> String {
        self.inner.lock().revision.to_string()
    }

    /// Forgets the event history; watches from any earlier version now get `410 Gone`
    pub fn compact(&self) {
        let mut inner = self.inner.lock();
        inner.history.clear();
        inner.compacted = inner.revision;
    }

    /// The next `n` list calls fail with `500 InternalError`
    pub fn fail_next_lists(&self, n: usize) {
        self.inner.lock().failing_lists = n;
    }

    /// The next `n` watch calls fail to connect
    pub fn fail_next_watches(&self, n: usize) {
        self.inner.lock().failing_watches = n;
    }

    /// While enabled, changes are recorded but never delivered to open watches
    pub fn drop_watch_events(&self, drop: bool) {
        self.inner.lock().drop_events = drop;
    }

    /// Ends every open watch stream
    pub fn disconnect_watchers(&self) {
        self.inner.lock().watchers.clear();
    }

    /// Sends `err` as a [`WatchEvent::Error`] on every open watch, then ends them
    pub fn send_watch_error(&self, err: ErrorResponse) {
        let mut inner = self.inner.lock();
        for sub in inner.watchers.drain(..) {
            let _ = sub.tx.unbounded_send(Ok(WatchEvent::Error(err.clone())));
        }
    }

    /// Number of list calls served so far (including failed ones)
    pub fn list_calls(&self) -> usize {
        self.inner.lock().list_calls
    }

    /// Number of watch calls served so far (including failed ones)
    pub fn watch_calls(&self) -> usize {
        self.inner.lock().watch_calls
    }

    /// Number of watch streams that are still open on the consumer side
    pub fn open_watches(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.watchers.retain(|sub| !sub.tx.is_closed());
        inner.watchers.len()
    }
}

#[async_trait]
impl<K> ListWatch<K> for FakeApiServer<K>
where
    K: Resource + Clone + Send + 'static,
{
    async fn list(&self, lp: &ListParams) -> Result<ObjectList<K>> {
        let mut inner = self.inner.lock();
        inner.list_calls += 1;
        if inner.failing_lists > 0 {
            inner.failing_lists -= 1;
            return Err(Error::Api(ErrorResponse::failure(
                500,
                "InternalError",
                "etcdserver: request timed out",
            )));
        }
        let mut items = Vec::new();
        for obj in inner.objects.values() {
            if selects(lp, obj)? {
                items.push(obj.clone());
            }
        }
        Ok(ObjectList::new(items, inner.revision.to_string()))
    }

    async fn watch(&self, lp: &ListParams, version: &str) -> Result<BoxStream<'static, Result<WatchEvent<K>>>> {
        let mut inner = self.inner.lock();
        inner.watch_calls += 1;
        if inner.failing_watches > 0 {
            inner.failing_watches -= 1;
            return Err(Error::Service("connection refused".into()));
        }
        let from = match version {
            "" | "0" => inner.revision,
            v => v.parse::<u64>().map_err(|_| {
                Error::Api(ErrorResponse::failure(
                    400,
                    "BadRequest",
                    format!("invalid resource version: {v}"),
                ))
            })?,
        };
        if from < inner.compacted {
            return Err(Error::Api(ErrorResponse::gone(format!(
                "too old resource version: {from} ({})",
                inner.compacted
            ))));
        }

        let (tx, rx) = mpsc::unbounded();
        for (revision, event) in &inner.history {
            if *revision <= from {
                continue;
            }
            let selected = match event {
                WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => selects(lp, obj)?,
                _ => false,
            };
            if selected {
                let _ = tx.unbounded_send(Ok(event.clone()));
            }
        }
        inner.watchers.push(Subscriber {
            params: lp.clone(),
            tx,
        });
        Ok(rx.boxed())
    }
}
