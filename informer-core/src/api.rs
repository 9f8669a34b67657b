//! The list/watch capability an informer is built on
use crate::{object::ObjectList, params::ListParams, watch::WatchEvent, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// A remote collection that can be listed and watched
///
/// This is the only way the runtime reaches the remote store, so it is where the wire protocol,
/// authentication and request timeouts live. Implementations are expected to be
/// side-effect free from the caller's point of view: both calls may be repeated at any time.
///
/// ```
/// use futures::{stream::{self, BoxStream}, StreamExt};
/// use informer_core::{ListParams, ListWatch, ObjectList, Result, WatchEvent};
/// use k8s_openapi::api::core::v1::ConfigMap;
///
/// struct Static(Vec<ConfigMap>);
///
/// #[async_trait::async_trait]
/// impl ListWatch<ConfigMap> for Static {
///     async fn list(&self, _lp: &ListParams) -> Result<ObjectList<ConfigMap>> {
///         Ok(ObjectList::new(self.0.clone(), "1"))
///     }
///
///     async fn watch(
///         &self,
///         _lp: &ListParams,
///         _version: &str,
///     ) -> Result<BoxStream<'static, Result<WatchEvent<ConfigMap>>>> {
///         Ok(stream::pending().boxed())
///     }
/// }
/// ```
#[async_trait]
pub trait ListWatch<K>: Send + Sync
where
    K: Clone + Send + 'static,
{
    /// Fetch the full collection matching `lp`, along with the resource version it was served at
    async fn list(&self, lp: &ListParams) -> Result<ObjectList<K>>;

    /// Open a stream of changes to the collection matching `lp` that happened after `version`
    ///
    /// The stream may end at any time (for example when the server side timeout elapses),
    /// after which it is reopened from the last seen resource version.
    /// A version that is older than the retained history must be rejected with a
    /// `410 Gone` [`ErrorResponse`](crate::ErrorResponse), either here or as a
    /// [`WatchEvent::Error`] on the stream.
    async fn watch(&self, lp: &ListParams, version: &str) -> Result<BoxStream<'static, Result<WatchEvent<K>>>>;
}

#[async_trait]
impl<K, T> ListWatch<K> for Arc<T>
where
    K: Clone + Send + 'static,
    T: ListWatch<K> + ?Sized,
{
    async fn list(&self, lp: &ListParams) -> Result<ObjectList<K>> {
        (**self).list(lp).await
    }

    async fn watch(&self, lp: &ListParams, version: &str) -> Result<BoxStream<'static, Result<WatchEvent<K>>>> {
        (**self).watch(lp, version).await
    }
}

#[async_trait]
impl<K, T> ListWatch<K> for Box<T>
where
    K: Clone + Send + 'static,
    T: ListWatch<K> + ?Sized,
{
    async fn list(&self, lp: &ListParams) -> Result<ObjectList<K>> {
        (**self).list(lp).await
    }

    async fn watch(&self, lp: &ListParams, version: &str) -> Result<BoxStream<'static, Result<WatchEvent<K>>>> {
        (**self).watch(lp, version).await
    }
}
