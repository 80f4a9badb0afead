//! Reference watching.
//!
//! A change to a referenced object must re-reconcile every primary whose
//! `nameFieldPath` points at it. The mapping scans the primary cache in the
//! changed object's namespace; reference churn is rare and primary counts
//! bounded, so the linear scan is fine.

use std::sync::Arc;

use kube::core::DynamicObject;

use crate::cache::ObjectCache;
use crate::object;

/// Queue keys of every cached primary whose reference path resolves to the
/// changed object's name.
pub fn matching_primary_keys(
    primaries: &ObjectCache,
    changed: &DynamicObject,
    name_field_path: &str,
) -> Vec<String> {
    let Some(namespace) = changed.metadata.namespace.as_deref() else {
        return Vec::new();
    };
    let Some(changed_name) = changed.metadata.name.as_deref() else {
        return Vec::new();
    };

    let mut keys = Vec::new();
    for primary in primaries.list_namespace(namespace) {
        let Ok(value) = object::to_value(&primary) else {
            continue;
        };
        if object::lookup_string(&value, name_field_path) == Some(changed_name) {
            if let Some(key) = object::queue_key(&value) {
                keys.push(key);
            }
        }
    }
    keys
}

/// Convenience used by the manager when wiring the hook.
pub fn enqueue_matching(
    primaries: &Arc<ObjectCache>,
    queue: &Arc<crate::queue::WorkQueue<String>>,
    changed: &DynamicObject,
    name_field_path: &str,
) {
    for key in matching_primary_keys(primaries, changed, name_field_path) {
        queue.add(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::{FixtureCache, dynamic_object};
    use crate::config::ResourceRef;
    use crate::object::api_resource;
    use serde_json::json;

    #[test]
    fn maps_changed_object_to_referencing_primaries() {
        let hello = api_resource(&ResourceRef {
            group: "example.com".into(),
            version: "v1".into(),
            kind: "Hello".into(),
        });
        let mut primaries = FixtureCache::new(hello.clone());
        primaries.apply(dynamic_object(
            &hello,
            "default",
            "a",
            json!({"spec": {"configRef": {"name": "shared"}}}),
        ));
        primaries.apply(dynamic_object(
            &hello,
            "default",
            "b",
            json!({"spec": {"configRef": {"name": "other"}}}),
        ));
        primaries.apply(dynamic_object(
            &hello,
            "elsewhere",
            "c",
            json!({"spec": {"configRef": {"name": "shared"}}}),
        ));

        let configmap = api_resource(&ResourceRef {
            version: "v1".into(),
            kind: "ConfigMap".into(),
            ..ResourceRef::default()
        });
        let changed = dynamic_object(&configmap, "default", "shared", json!({}));

        let keys = matching_primary_keys(&primaries.cache, &changed, "spec.configRef.name");
        assert_eq!(keys, vec!["default/a".to_string()]);
    }

    #[test]
    fn unresolvable_paths_match_nothing() {
        let hello = api_resource(&ResourceRef {
            group: "example.com".into(),
            version: "v1".into(),
            kind: "Hello".into(),
        });
        let mut primaries = FixtureCache::new(hello.clone());
        primaries.apply(dynamic_object(&hello, "default", "a", json!({"spec": {}})));

        let configmap = api_resource(&ResourceRef {
            version: "v1".into(),
            kind: "ConfigMap".into(),
            ..ResourceRef::default()
        });
        let changed = dynamic_object(&configmap, "default", "shared", json!({}));

        assert!(matching_primary_keys(&primaries.cache, &changed, "spec.configRef.name").is_empty());
    }
}
