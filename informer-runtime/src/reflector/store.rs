use super::ObjectRef;
use crate::watcher;
use ahash::AHashMap;
use informer_core::Resource;
use parking_lot::RwLock;
use std::{fmt, sync::Arc};
use tokio_util::sync::CancellationToken;

struct Cache<K> {
    entries: AHashMap<ObjectRef, Arc<K>>,
    /// Set once the owning informer has stopped; no more writes are accepted
    frozen: bool,
}

type SharedCache<K> = Arc<RwLock<Cache<K>>>;

fn freeze<K>(store: &SharedCache<K>) {
    store.write().frozen = true;
}

/// A writable Store handle
///
/// This is exclusive since it's not safe to share a single `Store` between multiple reflectors.
/// In particular, `Restarted` events will clobber the state of other connected reflectors.
pub struct Writer<K> {
    store: SharedCache<K>,
    ready: CancellationToken,
}

impl<K> Default for Writer<K> {
    fn default() -> Self {
        Self {
            store: Arc::new(RwLock::new(Cache {
                entries: AHashMap::new(),
                frozen: false,
            })),
            ready: CancellationToken::new(),
        }
    }
}

impl<K> fmt::Debug for Writer<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("len", &self.store.read().entries.len())
            .field("ready", &self.ready.is_cancelled())
            .finish()
    }
}

impl<K: Resource + Clone> Writer<K> {
    /// Return a read handle to the store
    ///
    /// Multiple read handles may be obtained, by either calling `as_reader` multiple times,
    /// or by calling `Store::clone()` afterwards.
    #[must_use]
    pub fn as_reader(&self) -> Store<K> {
        Store {
            store: self.store.clone(),
            ready: self.ready.clone(),
        }
    }

    /// Inserts or overwrites the entry for `obj`
    ///
    /// Returns `false` if the store has been frozen.
    pub fn put(&mut self, obj: K) -> bool {
        let key = ObjectRef::from_obj(&obj);
        let mut cache = self.store.write();
        if cache.frozen {
            tracing::trace!(%key, "store is frozen, ignoring put");
            return false;
        }
        cache.entries.insert(key, Arc::new(obj));
        true
    }

    /// Removes the entry for `key`, if any
    ///
    /// Returns `false` if the store has been frozen.
    pub fn delete(&mut self, key: &ObjectRef) -> bool {
        let mut cache = self.store.write();
        if cache.frozen {
            tracing::trace!(%key, "store is frozen, ignoring delete");
            return false;
        }
        cache.entries.remove(key);
        true
    }

    /// Swaps the whole content of the store for exactly `objs`
    ///
    /// Readers observe either the old or the new set, never a mix.
    /// Returns `false` if the store has been frozen.
    pub fn replace(&mut self, objs: impl IntoIterator<Item = K>) -> bool {
        // Build the new map outside the lock
        let entries = objs
            .into_iter()
            .map(|obj| (ObjectRef::from_obj(&obj), Arc::new(obj)))
            .collect::<AHashMap<_, _>>();
        let mut cache = self.store.write();
        if cache.frozen {
            tracing::trace!("store is frozen, ignoring replace");
            return false;
        }
        cache.entries = entries;
        true
    }

    /// Applies a single watcher event to the store
    ///
    /// The first accepted [`Restarted`](watcher::Event::Restarted) marks the store as ready.
    pub fn apply_watcher_event(&mut self, event: &watcher::Event<K>) {
        match event {
            watcher::Event::Applied(obj) => {
                self.put(obj.clone());
            }
            watcher::Event::Deleted(obj) => {
                self.delete(&ObjectRef::from_obj(obj));
            }
            watcher::Event::Restarted(new_objs) => {
                if self.replace(new_objs.iter().cloned()) && !self.ready.is_cancelled() {
                    tracing::debug!(len = new_objs.len(), "store is ready");
                    self.ready.cancel();
                }
            }
        }
    }

    /// Rejects every later write, keeping the current content readable
    pub fn freeze(&self) {
        freeze(&self.store);
    }
}

/// A readable cache of objects of kind `K`
///
/// Cloning will produce a new reference to the same backing store.
///
/// Cannot be constructed directly since one writer handle is required,
/// use `Writer::as_reader()` instead.
pub struct Store<K> {
    store: SharedCache<K>,
    ready: CancellationToken,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ready: self.ready.clone(),
        }
    }
}

impl<K> fmt::Debug for Store<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("len", &self.len())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl<K> Store<K> {
    /// Retrieve the entry referred to by `key`, if it is in the cache.
    ///
    /// `key.namespace` is ignored for cluster-scoped resources.
    ///
    /// Note that this is a cache and may be stale. Deleted objects may still exist in the cache
    /// despite having been deleted remotely, and new objects may not yet exist in the cache.
    #[must_use]
    pub fn get(&self, key: &ObjectRef) -> Option<Arc<K>> {
        let cache = self.store.read();
        cache
            .entries
            .get(key)
            // Try to erase the namespace and try again, in case the object is cluster-scoped
            .or_else(|| {
                cache.entries.get(&{
                    let mut cluster_key = key.clone();
                    cluster_key.namespace = None;
                    cluster_key
                })
            })
            .cloned()
    }

    /// Return a full snapshot of the current values
    ///
    /// The order of the items is unspecified.
    #[must_use]
    pub fn state(&self) -> Vec<Arc<K>> {
        self.store.read().entries.values().cloned().collect()
    }

    /// The number of cached objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().entries.len()
    }

    /// Whether the cache holds no objects
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a full list has been applied at least once
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.is_cancelled()
    }

    /// Wait for the first full list to be applied
    ///
    /// Resolves immediately if the store is already ready. Never resolves if the
    /// store is frozen before the first list completes.
    pub async fn wait_until_ready(&self) {
        self.ready.cancelled().await;
    }

    pub(crate) fn freeze(&self) {
        freeze(&self.store);
    }
}

/// Create a (Reader, Writer) for a `Store<K>` for a typed resource `K`
///
/// The `Writer` should be passed to a [`reflector`](crate::reflector()),
/// and the [`Store`] is a read-only handle.
#[must_use]
pub fn store<K>() -> (Store<K>, Writer<K>)
where
    K: Resource + Clone,
{
    let w = Writer::<K>::default();
    let r = w.as_reader();
    (r, w)
}
