//! Ready-made objects for tests
use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta};

/// A `ConfigMap` named `name` carrying `value` under the `key` entry
pub fn config_map(name: &str, value: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        data: Some(
            [
                ("key".to_string(), value.to_string()),
                ("config".to_string(), "dummy".to_string()),
            ]
            .into(),
        ),
        ..ConfigMap::default()
    }
}

/// Same as [`config_map`], placed in `namespace`
pub fn config_map_in(namespace: &str, name: &str, value: &str) -> ConfigMap {
    let mut cm = config_map(name, value);
    cm.metadata.namespace = Some(namespace.to_string());
    cm
}

/// Same as [`config_map_in`], with the given labels
pub fn labelled_config_map(namespace: &str, name: &str, labels: &[(&str, &str)]) -> ConfigMap {
    let mut cm = config_map_in(namespace, name, "labelled");
    cm.metadata.labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
    cm
}

/// A short random-enough suffix to keep names unique across a test run
pub fn short_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!("{:012x}", NEXT.fetch_add(1, Ordering::Relaxed).wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 16)
}
