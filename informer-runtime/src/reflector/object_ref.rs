use educe::Educe;
use informer_core::{metadata::ObjectMeta, Resource, ResourceExt};
use std::fmt::Display;

/// A namespaced (if relevant) reference to an object, used as the cache key
///
/// Two objects with the same name in the same namespace are the same entry,
/// whatever their resource version or uid.
///
/// ```
/// use informer_runtime::reflector::ObjectRef;
/// assert_ne!(ObjectRef::new("a"), ObjectRef::new("a").within("default"));
/// assert_eq!(ObjectRef::new("a").within("default").to_string(), "a.default");
/// ```
#[derive(Educe)]
#[educe(Debug, PartialEq, Hash, Clone)]
#[non_exhaustive]
pub struct ObjectRef {
    /// The name of the object
    pub name: String,
    /// The namespace of the object
    ///
    /// May only be `None` if the kind is cluster-scoped (not located in a namespace).
    /// Note that it *is* acceptable for an `ObjectRef` to a cluster-scoped resource to
    /// have a namespace. These are, however, not considered equal:
    ///
    /// ```
    /// # use informer_runtime::reflector::ObjectRef;
    /// assert_ne!(ObjectRef::new("foo"), ObjectRef::new("foo").within("bar"));
    /// ```
    pub namespace: Option<String>,
    /// Extra information about the object being referred to
    ///
    /// This is *not* considered when comparing objects.
    #[educe(Hash(ignore), PartialEq(ignore))]
    pub extra: Extra,
}

impl Eq for ObjectRef {}

/// Non-vital information about an object being referred to
///
/// See [`ObjectRef::extra`].
#[derive(Default, Debug, Clone)]
#[non_exhaustive]
pub struct Extra {
    /// The version of the resource at the time of reference
    pub resource_version: Option<String>,
    /// The uid of the object
    pub uid: Option<String>,
}

impl ObjectRef {
    /// A reference to a cluster-scoped object, or to be scoped with [`ObjectRef::within`]
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            extra: Extra::default(),
        }
    }

    /// Scopes the reference to a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Creates `ObjectRef` from the resource
    #[must_use]
    pub fn from_obj<K: Resource>(obj: &K) -> Self {
        Self {
            name: obj.name_any(),
            namespace: obj.namespace(),
            extra: Extra::from_obj_meta(obj.meta()),
        }
    }
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(namespace) = &self.namespace {
            write!(f, ".{namespace}")?;
        }
        Ok(())
    }
}

impl Extra {
    fn from_obj_meta(obj_meta: &ObjectMeta) -> Self {
        Self {
            resource_version: obj_meta.resource_version.clone(),
            uid: obj_meta.uid.clone(),
        }
    }
}
