pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::{borrow::Cow, collections::BTreeMap};

/// An accessor trait for a kubernetes Resource.
///
/// This is for a subset of Kubernetes type that do not end in `List`.
/// These types, using [`ObjectMeta`], SHOULD all have required properties:
/// - `.metadata`
/// - `.metadata.name`
///
/// And these optional properties:
/// - `.metadata.namespace`
/// - `.metadata.resource_version`
///
/// This avoids a bunch of the unnecessary unwrap mechanics for apps.
pub trait Resource {
    /// Returns kind of this object
    fn kind() -> Cow<'static, str>;

    /// Metadata that all persisted resources must have
    fn meta(&self) -> &ObjectMeta;

    /// Metadata that all persisted resources must have
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

/// Implement accessor trait for any ObjectMeta-using Kubernetes Resource
impl<K> Resource for K
where
    K: k8s_openapi::Metadata<Ty = ObjectMeta>,
{
    fn kind() -> Cow<'static, str> {
        <K as k8s_openapi::Resource>::KIND.into()
    }

    fn meta(&self) -> &ObjectMeta {
        self.metadata()
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        self.metadata_mut()
    }
}

/// Helper methods for resources.
pub trait ResourceExt: Resource {
    /// Returns the name of the resource, falling back to `generate_name`, or an empty string
    fn name_any(&self) -> String;

    /// The namespace the resource is in
    fn namespace(&self) -> Option<String>;

    /// The resource version
    fn resource_version(&self) -> Option<String>;

    /// Unique ID (if you delete resource and then create a new
    /// resource with the same name, it will have different ID)
    fn uid(&self) -> Option<String>;

    /// Returns resource labels, or an empty map
    fn labels(&self) -> Cow<'_, BTreeMap<String, String>>;
}

impl<K: Resource> ResourceExt for K {
    fn name_any(&self) -> String {
        self.meta()
            .name
            .clone()
            .or_else(|| self.meta().generate_name.clone())
            .unwrap_or_default()
    }

    fn namespace(&self) -> Option<String> {
        self.meta().namespace.clone()
    }

    fn resource_version(&self) -> Option<String> {
        self.meta().resource_version.clone()
    }

    fn uid(&self) -> Option<String> {
        self.meta().uid.clone()
    }

    fn labels(&self) -> Cow<'_, BTreeMap<String, String>> {
        match &self.meta().labels {
            Some(labels) => Cow::Borrowed(labels),
            None => Cow::Owned(BTreeMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Resource, ResourceExt};
    use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta};

    #[test]
    fn openapi_types_expose_their_metadata() {
        let mut cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".into()),
                namespace: Some("default".into()),
                resource_version: Some("42".into()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        };
        assert_eq!(ConfigMap::kind(), "ConfigMap");
        assert_eq!(cm.name_any(), "settings");
        assert_eq!(cm.namespace().as_deref(), Some("default"));
        assert_eq!(cm.resource_version().as_deref(), Some("42"));
        assert!(cm.labels().is_empty());

        cm.meta_mut().labels = Some([("app".to_string(), "web".to_string())].into());
        assert_eq!(cm.labels().get("app").map(String::as_str), Some("web"));
    }

    #[test]
    fn name_any_falls_back_to_generate_name() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                generate_name: Some("settings-".into()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        };
        assert_eq!(cm.name_any(), "settings-");
        assert_eq!(ConfigMap::default().name_any(), "");
    }
}
