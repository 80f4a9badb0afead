//! Helpers for working with schemaless cluster objects.
//!
//! Every cluster object traverses the runtime as a `serde_json::Value` tree;
//! this module provides the dotted-path accessors, the merge used to update
//! dependents, and the owner-reference bookkeeping that ties dependents to
//! their primary resource.

use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde_json::{Map, Value, json};

use crate::config::ResourceRef;
use crate::error::{Error, Result};

/// Look up a dotted path (`spec.configRef.name`) in a JSON tree.
///
/// Path segments index into objects by key and into arrays by decimal
/// position. A missing intermediate yields `None`.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = root;
    for segment in path.split('.') {
        node = match node {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(node)
}

/// Look up a dotted path and return it as a string, if present.
pub fn lookup_string<'a>(root: &'a Value, path: &str) -> Option<&'a str> {
    lookup(root, path).and_then(Value::as_str)
}

/// Merge `desired` over `current`, JSON-merge-patch style.
///
/// Objects merge recursively with desired values overriding; arrays and
/// scalars replace wholesale; an explicit null in `desired` removes the key.
pub fn merge(current: &Value, desired: &Value) -> Value {
    match (current, desired) {
        (Value::Object(cur), Value::Object(des)) => {
            let mut out = cur.clone();
            for (key, value) in des {
                if value.is_null() {
                    out.remove(key);
                } else {
                    let merged = match out.get(key) {
                        Some(existing) => merge(existing, value),
                        None => value.clone(),
                    };
                    out.insert(key.clone(), merged);
                }
            }
            Value::Object(out)
        }
        _ => desired.clone(),
    }
}

/// `metadata.name` accessor.
pub fn name(obj: &Value) -> Option<&str> {
    lookup_string(obj, "metadata.name")
}

/// `metadata.namespace` accessor.
pub fn namespace(obj: &Value) -> Option<&str> {
    lookup_string(obj, "metadata.namespace")
}

/// `metadata.uid` accessor.
pub fn uid(obj: &Value) -> Option<&str> {
    lookup_string(obj, "metadata.uid")
}

/// `kind` accessor.
pub fn kind(obj: &Value) -> Option<&str> {
    lookup_string(obj, "kind")
}

/// Whether `metadata.deletionTimestamp` is set.
pub fn is_deleting(obj: &Value) -> bool {
    lookup(obj, "metadata.deletionTimestamp").is_some_and(|v| !v.is_null())
}

/// `metadata.finalizers` as an owned list of strings.
pub fn finalizers(obj: &Value) -> Vec<String> {
    lookup(obj, "metadata.finalizers")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// The `namespace/name` work-queue key for an object.
pub fn queue_key(obj: &Value) -> Option<String> {
    Some(format!("{}/{}", namespace(obj)?, name(obj)?))
}

/// Whether `obj` carries an owner reference with the given UID and
/// `controller: true`.
pub fn is_controlled_by(obj: &Value, owner_uid: &str) -> bool {
    owner_references(obj).iter().any(|r| {
        r.get("uid").and_then(Value::as_str) == Some(owner_uid)
            && r.get("controller").and_then(Value::as_bool) == Some(true)
    })
}

fn owner_references(obj: &Value) -> Vec<Value> {
    lookup(obj, "metadata.ownerReferences")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// The controller owner reference of an object, if any.
pub fn controller_owner(obj: &Value) -> Option<Value> {
    owner_references(obj)
        .into_iter()
        .find(|r| r.get("controller").and_then(Value::as_bool) == Some(true))
}

/// Replace any owner reference pointing at the primary with exactly one
/// controller reference. Non-matching references from other owners are kept.
pub fn set_controller_reference(dep: &mut Value, primary: &Value, block_owner_deletion: bool) {
    let reference = json!({
        "apiVersion": lookup_string(primary, "apiVersion").unwrap_or_default(),
        "kind": lookup_string(primary, "kind").unwrap_or_default(),
        "name": name(primary).unwrap_or_default(),
        "uid": uid(primary).unwrap_or_default(),
        "controller": true,
        "blockOwnerDeletion": block_owner_deletion,
    });

    let primary_uid = uid(primary).unwrap_or_default();
    let mut refs: Vec<Value> = owner_references(dep)
        .into_iter()
        .filter(|r| r.get("uid").and_then(Value::as_str) != Some(primary_uid))
        .collect();
    refs.push(reference);

    set_metadata_field(dep, "ownerReferences", Value::Array(refs));
}

/// Remove every owner reference pointing at the given UID. Returns true when
/// anything was removed.
pub fn clear_owner_references(obj: &mut Value, owner_uid: &str) -> bool {
    let refs = owner_references(obj);
    let kept: Vec<Value> = refs
        .iter()
        .filter(|r| r.get("uid").and_then(Value::as_str) != Some(owner_uid))
        .cloned()
        .collect();
    let changed = kept.len() != refs.len();
    if changed {
        set_metadata_field(obj, "ownerReferences", Value::Array(kept));
    }
    changed
}

fn set_metadata_field(obj: &mut Value, field: &str, value: Value) {
    let Some(map) = obj.as_object_mut() else {
        return;
    };
    let metadata = map
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(meta) = metadata {
        meta.insert(field.to_string(), value);
    }
}

/// Force `metadata.namespace` to the given value.
pub fn set_namespace(obj: &mut Value, ns: &str) {
    set_metadata_field(obj, "namespace", Value::String(ns.to_string()));
}

/// Map a configured resource to the [`ApiResource`] used for dynamic Apis.
///
/// The config carries no plural, so the naive pluralisation of the kind is
/// used, exactly as the discovery-less dynamic clients in the ecosystem do.
pub fn api_resource(resource: &ResourceRef) -> ApiResource {
    let gvk = GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind);
    ApiResource::from_gvk(&gvk)
}

/// Convert a JSON tree into a [`DynamicObject`] for an API write, filling in
/// `apiVersion`/`kind` from the target resource when the handler omitted them.
pub fn to_dynamic(mut obj: Value, resource: &ApiResource) -> Result<DynamicObject> {
    if let Value::Object(map) = &mut obj {
        map.entry("apiVersion")
            .or_insert_with(|| Value::String(resource.api_version.clone()));
        map.entry("kind")
            .or_insert_with(|| Value::String(resource.kind.clone()));
    }
    serde_json::from_value(obj).map_err(|e| Error::Serialization(e.to_string()))
}

/// Convert a [`DynamicObject`] into the JSON tree the rest of the runtime
/// traffics in.
pub fn to_value(obj: &DynamicObject) -> Result<Value> {
    serde_json::to_value(obj).map_err(|e| Error::Serialization(e.to_string()))
}
