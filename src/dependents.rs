//! Dependent reconciliation: converge owned objects toward the handler's
//! desired set.
//!
//! Desired and current dependents are keyed by `(kind, name)` and diffed into
//! a plan of deletes, updates and creates, applied in that order so renames
//! and kind replacements free names before recreation.

use std::collections::BTreeMap;

use kube::Client;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::DependentConfig;
use crate::error::{Error, Result, classify_api_error};
use crate::object;

/// One converging API call.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Remove an object the handler no longer wants (or release it, for
    /// orphan kinds).
    Delete {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
    },
    /// Merge the desired object over the live one.
    Update {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
        /// Handler-desired state.
        desired: Value,
    },
    /// Create a new dependent.
    Create {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
        /// Handler-desired state.
        desired: Value,
    },
}

fn key_of(obj: &Value) -> Result<(String, String)> {
    let kind = object::kind(obj)
        .ok_or_else(|| Error::InvalidDependent("dependent has no kind".into()))?;
    let name = object::name(obj).unwrap_or_default();
    if name.is_empty() {
        return Err(Error::InvalidDependent(format!(
            "dependent of kind '{kind}' has no name"
        )));
    }
    Ok((kind.to_string(), name.to_string()))
}

/// Diff desired dependents against current ones into an ordered plan.
///
/// Any invalid desired entry rejects the whole plan, so a bad handler
/// response applies nothing.
pub fn plan(desired: &[Value], current: &[Value]) -> Result<Vec<Op>> {
    let mut desired_by_key = BTreeMap::new();
    for obj in desired {
        let key = key_of(obj)?;
        desired_by_key.insert(key, obj.clone());
    }

    let mut current_keys = BTreeMap::new();
    for obj in current {
        if let Ok(key) = key_of(obj) {
            current_keys.insert(key, ());
        }
    }

    let mut ops = Vec::new();
    for (kind, name) in current_keys.keys() {
        if !desired_by_key.contains_key(&(kind.clone(), name.clone())) {
            ops.push(Op::Delete {
                kind: kind.clone(),
                name: name.clone(),
            });
        }
    }
    for ((kind, name), obj) in &desired_by_key {
        if current_keys.contains_key(&(kind.clone(), name.clone())) {
            ops.push(Op::Update {
                kind: kind.clone(),
                name: name.clone(),
                desired: obj.clone(),
            });
        }
    }
    for ((kind, name), obj) in &desired_by_key {
        if !current_keys.contains_key(&(kind.clone(), name.clone())) {
            ops.push(Op::Create {
                kind: kind.clone(),
                name: name.clone(),
                desired: obj.clone(),
            });
        }
    }
    Ok(ops)
}

/// Applies a plan against the cluster on behalf of one primary resource.
pub struct Applier<'a> {
    client: &'a Client,
    primary: &'a Value,
    rules: &'a [DependentConfig],
}

impl<'a> Applier<'a> {
    /// Create an applier for the given primary and dependent rules.
    pub fn new(client: &'a Client, primary: &'a Value, rules: &'a [DependentConfig]) -> Self {
        Self {
            client,
            primary,
            rules,
        }
    }

    fn namespace(&self) -> Result<&str> {
        object::namespace(self.primary)
            .ok_or_else(|| Error::Unrecoverable("primary resource has no namespace".into()))
    }

    fn rule_for(&self, kind: &str) -> Option<&DependentConfig> {
        self.rules.iter().find(|r| r.resource.kind == kind)
    }

    fn is_orphan(&self, kind: &str) -> bool {
        self.rule_for(kind).is_some_and(|r| r.orphan)
    }

    fn api_for(&self, kind: &str, desired: Option<&Value>) -> Result<Api<DynamicObject>> {
        let resource = self.resource_for(kind, desired)?;
        Ok(Api::namespaced_with(
            self.client.clone(),
            self.namespace()?,
            &resource,
        ))
    }

    fn resource_for(&self, kind: &str, desired: Option<&Value>) -> Result<ApiResource> {
        if let Some(rule) = self.rule_for(kind) {
            return Ok(object::api_resource(&rule.resource));
        }
        // Fall back to the object's own apiVersion for kinds the handler
        // returns beyond the declared descriptors.
        let api_version = desired
            .and_then(|d| object::lookup_string(d, "apiVersion"))
            .ok_or_else(|| {
                Error::InvalidDependent(format!(
                    "dependent kind '{kind}' matches no descriptor and carries no apiVersion"
                ))
            })?;
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        Ok(ApiResource::from_gvk(&GroupVersionKind::gvk(
            group, version, kind,
        )))
    }

    /// Apply every op in plan order. The first failure aborts the rest; a
    /// 409 surfaces as [`Error::Conflict`] so the engine retries the whole
    /// reconcile immediately.
    pub async fn apply(&self, ops: &[Op]) -> Result<()> {
        for op in ops {
            match op {
                Op::Delete { kind, name } => self.delete(kind, name).await?,
                Op::Update {
                    kind,
                    name,
                    desired,
                } => self.update(kind, name, desired).await?,
                Op::Create {
                    kind,
                    name,
                    desired,
                } => self.create(kind, name, desired).await?,
            }
        }
        Ok(())
    }

    async fn create(&self, kind: &str, name: &str, desired: &Value) -> Result<()> {
        let resource = self.resource_for(kind, Some(desired))?;
        let api = self.api_for(kind, Some(desired))?;

        let mut obj = desired.clone();
        object::set_namespace(&mut obj, self.namespace()?);
        object::set_controller_reference(&mut obj, self.primary, !self.is_orphan(kind));

        let dynamic = object::to_dynamic(obj, &resource)?;
        info!(kind = %kind, name = %name, "creating dependent");
        api.create(&PostParams::default(), &dynamic)
            .await
            .map_err(|e| classify_api_error(e, kind, name))?;
        Ok(())
    }

    async fn update(&self, kind: &str, name: &str, desired: &Value) -> Result<()> {
        let resource = self.resource_for(kind, Some(desired))?;
        let api = self.api_for(kind, Some(desired))?;

        let Some(latest) = api
            .get_opt(name)
            .await
            .map_err(|e| classify_api_error(e, kind, name))?
        else {
            // Disappeared since assembly; converge by recreating.
            return self.create(kind, name, desired).await;
        };
        let latest = object::to_value(&latest)?;

        let mut merged = object::merge(&latest, desired);
        object::set_namespace(&mut merged, self.namespace()?);
        object::set_controller_reference(&mut merged, self.primary, !self.is_orphan(kind));
        if let Some(rv) = object::lookup(&latest, "metadata.resourceVersion").cloned() {
            if let Some(meta) = merged.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.insert("resourceVersion".into(), rv);
            }
        }

        if merged == latest {
            debug!(kind = %kind, name = %name, "dependent already converged");
            return Ok(());
        }

        let dynamic = object::to_dynamic(merged, &resource)?;
        info!(kind = %kind, name = %name, "updating dependent");
        api.replace(name, &PostParams::default(), &dynamic)
            .await
            .map_err(|e| classify_api_error(e, kind, name))?;
        Ok(())
    }

    async fn delete(&self, kind: &str, name: &str) -> Result<()> {
        let api = self.api_for(kind, None)?;

        if self.is_orphan(kind) {
            info!(kind = %kind, name = %name, "releasing orphan dependent");
            return self.release(&api, kind, name).await;
        }

        info!(kind = %kind, name = %name, "deleting dependent");
        match api.delete(name, &DeleteParams::foreground()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(classify_api_error(e, kind, name)),
        }
    }

    /// Clear owner references pointing at the primary, leaving the object in
    /// place.
    async fn release(&self, api: &Api<DynamicObject>, kind: &str, name: &str) -> Result<()> {
        let Some(latest) = api
            .get_opt(name)
            .await
            .map_err(|e| classify_api_error(e, kind, name))?
        else {
            return Ok(());
        };

        let mut value = object::to_value(&latest)?;
        let uid = object::uid(self.primary).unwrap_or_default();
        if !object::clear_owner_references(&mut value, uid) {
            return Ok(());
        }

        let refs = object::lookup(&value, "metadata.ownerReferences")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        let patch = json!({"metadata": {"ownerReferences": refs}});
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify_api_error(e, kind, name))?;
        Ok(())
    }

    /// Release every orphan-kind dependent in `current`; used by the
    /// finalize path before the primary is garbage-collected.
    pub async fn release_orphans(&self, current: &[Value]) -> Result<()> {
        for dep in current {
            let Some(kind) = object::kind(dep) else {
                continue;
            };
            if !self.is_orphan(kind) {
                continue;
            }
            let Some(name) = object::name(dep) else {
                continue;
            };
            let api = self.api_for(kind, Some(dep))?;
            self.release(&api, kind, name).await?;
        }
        Ok(())
    }
}
