//! Caches objects in memory

mod object_ref;
pub mod store;

pub use self::object_ref::{Extra as ObjectRefExtra, ObjectRef};
use crate::watcher;
use async_stream::stream;
use futures::{Stream, StreamExt};
use informer_core::Resource;
pub use store::{store, Store};

/// Cache objects from a [`watcher()`](crate::watcher()) stream into a local [`Store`]
///
/// Observes the raw `Stream` of [`watcher::Event`] objects, and modifies the cache.
/// It passes the raw stream through unmodified.
///
/// ## Usage
/// Create a [`Store`] through [`store::store()`]. The `writer` part is not-clonable,
/// and must be moved into the reflector. The `reader` part is the [`Store`] interface
/// that you can send to other parts of your program as state.
///
/// The cache contains the last-seen state of objects,
/// which may lag slightly behind the actual state.
///
/// ```no_run
/// use futures::StreamExt;
/// use informer_runtime::{reflector, watcher, watcher::Config, WatchStreamExt};
/// use informer_test::FakeApiServer;
/// use k8s_openapi::api::core::v1::ConfigMap;
/// # async fn wrapper() {
/// let api = FakeApiServer::<ConfigMap>::new();
/// let (reader, writer) = reflector::store();
/// let rf = reflector(writer, watcher(api, Config::default().within("default")));
///
/// // Poll the stream (needed to keep the store up-to-date)
/// rf.default_backoff().for_each(|_| futures::future::ready(())).await;
/// # let _ = reader;
/// # }
/// ```
pub fn reflector<K, W>(mut writer: store::Writer<K>, stream: W) -> impl Stream<Item = W::Item>
where
    K: Resource + Clone,
    W: Stream<Item = watcher::Result<watcher::Event<K>>>,
{
    let mut stream = Box::pin(stream);
    stream! {
        while let Some(event) = stream.next().await {
            match event {
                Ok(ev) => {
                    writer.apply_watcher_event(&ev);
                    yield Ok(ev);
                },
                Err(ev) => yield Err(ev)
            }
        }
    }
}
