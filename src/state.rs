//! The state document and its assembly.
//!
//! The state document is the handler contract: the observed primary resource
//! plus its dependents and references, as one JSON object. It goes out to
//! the reconcile and finalize handlers and comes back, possibly with a new
//! status, a new finalizers list and a replaced dependents array.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::ObjectCache;
use crate::config::{DependentConfig, ReferenceConfig};
use crate::error::{Error, Result};
use crate::object;

/// Handler input and output for reconcile, finalize and sync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    /// The primary resource.
    #[serde(default)]
    pub object: Value,
    /// Objects owned by the primary.
    #[serde(default)]
    pub dependents: Vec<Value>,
    /// Objects the primary reads; read-only for handlers.
    #[serde(default)]
    pub references: Vec<Value>,
}

impl StateDocument {
    /// Serialize for a handler request.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Parse a handler response. Anything that is not a JSON object with an
    /// object-shaped `object` field is malformed.
    pub fn from_handler_response(bytes: &[u8]) -> Result<StateDocument> {
        let doc: StateDocument = serde_json::from_slice(bytes)
            .map_err(|e| Error::MalformedOutput(format!("response is not a state document: {e}")))?;
        if !doc.object.is_object() {
            return Err(Error::MalformedOutput(
                "response 'object' field is missing or not an object".into(),
            ));
        }
        Ok(doc)
    }
}

/// A dependent kind with its cache, in declaration order.
pub struct DependentSource {
    /// Declared dependent kind and deletion policy.
    pub rule: DependentConfig,
    /// Informer cache for the kind.
    pub cache: Arc<ObjectCache>,
}

/// A reference kind with its cache.
pub struct ReferenceSource {
    /// Declared reference kind and name path.
    pub rule: ReferenceConfig,
    /// Informer cache for the kind.
    pub cache: Arc<ObjectCache>,
}

/// Assemble the state document for a primary resource from informer caches.
///
/// Dependents are the cached objects of each declared kind, in the primary's
/// namespace, owned by the primary (controller owner reference with matching
/// UID); descriptor order first, name order within. References resolve their
/// `nameFieldPath` best-effort: an empty path result or a cache miss skips
/// the entry silently.
pub fn assemble(
    primary: &Value,
    dependents: &[DependentSource],
    references: &[ReferenceSource],
) -> Result<StateDocument> {
    let namespace = object::namespace(primary).ok_or_else(|| {
        Error::Unrecoverable("primary resource has no namespace; only namespaced kinds are supported".into())
    })?;
    let uid = object::uid(primary).unwrap_or_default();

    let mut collected_dependents = Vec::new();
    for source in dependents {
        for obj in source.cache.list_namespace(namespace) {
            let value = object::to_value(&obj)?;
            if object::is_controlled_by(&value, uid) {
                collected_dependents.push(value);
            }
        }
    }

    let mut collected_references = Vec::new();
    for source in references {
        let Some(name) = object::lookup_string(primary, &source.rule.name_field_path) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        if let Some(obj) = source.cache.get(namespace, name) {
            collected_references.push(object::to_value(&obj)?);
        }
    }

    Ok(StateDocument {
        object: primary.clone(),
        dependents: collected_dependents,
        references: collected_references,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::{FixtureCache, dynamic_object};
    use crate::config::ResourceRef;
    use crate::object::api_resource;
    use serde_json::json;

    fn configmap_rule() -> ResourceRef {
        ResourceRef {
            group: String::new(),
            version: "v1".into(),
            kind: "ConfigMap".into(),
        }
    }

    fn primary() -> Value {
        json!({
            "apiVersion": "example.com/v1",
            "kind": "Hello",
            "metadata": {"name": "hello-1", "namespace": "default", "uid": "uid-1"},
            "spec": {"configRef": {"name": "shared"}},
        })
    }

    fn owned_configmap(name: &str) -> kube::core::DynamicObject {
        let ar = api_resource(&configmap_rule());
        let mut obj = dynamic_object(&ar, "default", name, json!({"data": {"k": "v"}}));
        obj.metadata.owner_references = Some(vec![
            k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                api_version: "example.com/v1".into(),
                kind: "Hello".into(),
                name: "hello-1".into(),
                uid: "uid-1".into(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            },
        ]);
        obj
    }

    #[test]
    fn collects_owned_dependents_only() {
        let ar = api_resource(&configmap_rule());
        let mut fixture = FixtureCache::new(ar.clone());
        fixture.apply(owned_configmap("b-cm"));
        fixture.apply(owned_configmap("a-cm"));
        // Not owned: no owner reference.
        fixture.apply(dynamic_object(&ar, "default", "stray", json!({})));

        let sources = vec![DependentSource {
            rule: DependentConfig {
                resource: configmap_rule(),
                orphan: false,
            },
            cache: fixture.cache.clone(),
        }];

        let doc = assemble(&primary(), &sources, &[]).unwrap();
        let names: Vec<&str> = doc
            .dependents
            .iter()
            .map(|d| crate::object::name(d).unwrap())
            .collect();
        assert_eq!(names, vec!["a-cm", "b-cm"]);
    }

    #[test]
    fn resolves_references_best_effort() {
        let ar = api_resource(&configmap_rule());
        let mut fixture = FixtureCache::new(ar.clone());
        fixture.apply(dynamic_object(&ar, "default", "shared", json!({"data": {}})));

        let rule = ReferenceConfig {
            resource: configmap_rule(),
            name_field_path: "spec.configRef.name".into(),
        };
        let sources = vec![ReferenceSource {
            rule: rule.clone(),
            cache: fixture.cache.clone(),
        }];

        let doc = assemble(&primary(), &[], &sources).unwrap();
        assert_eq!(doc.references.len(), 1);
        assert_eq!(crate::object::name(&doc.references[0]), Some("shared"));

        // Missing path: skipped silently.
        let mut pr = primary();
        pr["spec"] = json!({});
        let doc = assemble(&pr, &[], &sources).unwrap();
        assert!(doc.references.is_empty());

        // Cache miss: skipped silently.
        let mut pr = primary();
        pr["spec"]["configRef"]["name"] = json!("absent");
        let doc = assemble(&pr, &[], &sources).unwrap();
        assert!(doc.references.is_empty());
    }

    #[test]
    fn malformed_responses_are_rejected() {
        assert!(StateDocument::from_handler_response(b"not json").is_err());
        assert!(StateDocument::from_handler_response(b"{\"object\": 42}").is_err());
        assert!(StateDocument::from_handler_response(b"{}").is_err());

        let ok = StateDocument::from_handler_response(
            br#"{"object": {"metadata": {"name": "x"}}, "dependents": []}"#,
        )
        .unwrap();
        assert!(ok.references.is_empty());
    }
}
