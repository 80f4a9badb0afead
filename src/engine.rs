//! The reconcile engine.
//!
//! One engine per configured controller. Workers drain the work queue; for
//! each key the engine assembles the state document, invokes the reconcile
//! or finalize handler, and applies the returned document: finalizers first
//! (so a handler can install one on first sight), then dependents, then the
//! status subresource.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::Client;
use kube::api::{Api, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use metrics::{counter, histogram};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ObjectCache;
use crate::config::{DependentConfig, ResourceRef};
use crate::dependents::{self, Applier};
use crate::error::{Error, Result, classify_api_error};
use crate::handler::Handler;
use crate::object;
use crate::queue::WorkQueue;
use crate::state::{self, DependentSource, ReferenceSource, StateDocument};

/// Finalizer key owned by the runtime. Installed whenever a finalizer
/// handler or an orphan dependent is configured, so deletion always waits
/// for the finalize path.
pub const FINALIZER: &str = "whitebox-controller.io/finalizer";

/// Headroom added to the handler timeout to cover assembly and apply.
const RECONCILE_SLACK: Duration = Duration::from_secs(5);

/// Workers per controller. Keys are serialised by the queue regardless.
pub const DEFAULT_WORKERS: usize = 1;

/// Static description of one controller, resolved from configuration.
pub struct ControllerSpec {
    /// Controller name, for logs and metrics.
    pub name: String,
    /// Primary resource kind.
    pub resource: ResourceRef,
    /// Reconcile handler.
    pub reconciler: Arc<dyn Handler>,
    /// Reconcile handler transport timeout, if configured.
    pub reconciler_timeout: Option<Duration>,
    /// Delay before re-enqueueing after a successful reconcile.
    pub requeue_after: Option<Duration>,
    /// Log intended writes instead of performing them.
    pub observe: bool,
    /// Finalize handler.
    pub finalizer: Option<Arc<dyn Handler>>,
    /// Finalize handler transport timeout, if configured.
    pub finalizer_timeout: Option<Duration>,
}

/// What a reconcile decided about the key's future.
enum Outcome {
    /// Nothing more to do; informer events drive re-entry.
    Clean,
    /// Re-enqueue after the configured delay.
    RequeueAfter(Duration),
    /// Not finished (finalizer keys still present); retry with backoff.
    Retry,
}

/// Per-controller reconcile engine.
pub struct Engine {
    spec: ControllerSpec,
    client: Client,
    api_resource: ApiResource,
    primary: Arc<ObjectCache>,
    dependents: Vec<DependentSource>,
    references: Vec<ReferenceSource>,
    rules: Vec<DependentConfig>,
    queue: Arc<WorkQueue<String>>,
}

impl Engine {
    /// Assemble an engine from its wired parts.
    pub fn new(
        client: Client,
        spec: ControllerSpec,
        primary: Arc<ObjectCache>,
        dependents: Vec<DependentSource>,
        references: Vec<ReferenceSource>,
        queue: Arc<WorkQueue<String>>,
    ) -> Arc<Engine> {
        let api_resource = object::api_resource(&spec.resource);
        let rules = dependents.iter().map(|d| d.rule.clone()).collect();
        Arc::new(Engine {
            spec,
            client,
            api_resource,
            primary,
            dependents,
            references,
            rules,
            queue,
        })
    }

    /// The engine's work queue, for informer hooks and the syncer.
    pub fn queue(&self) -> Arc<WorkQueue<String>> {
        self.queue.clone()
    }

    /// Drain the queue until shutdown. Returns an error only for
    /// unrecoverable conditions, which stop the controller.
    pub async fn run_worker(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        while let Some(key) = self.queue.get().await {
            let started = Instant::now();
            let result = tokio::select! {
                _ = shutdown.cancelled() => {
                    // Drop the in-flight attempt; shutdown does not requeue.
                    self.queue.done(&key);
                    break;
                }
                result = self.reconcile_key(&key) => result,
            };
            histogram!("reconcile_duration_seconds", "controller" => self.spec.name.clone())
                .record(started.elapsed().as_secs_f64());

            match result {
                Ok(Outcome::Clean) => {
                    self.queue.forget(&key);
                    self.count("ok");
                }
                Ok(Outcome::RequeueAfter(delay)) => {
                    self.queue.forget(&key);
                    self.queue.add_after(key.clone(), delay);
                    self.count("ok");
                }
                Ok(Outcome::Retry) => {
                    self.queue.add_rate_limited(key.clone());
                    self.count("retry");
                }
                Err(Error::Conflict { kind, name }) => {
                    debug!(
                        controller = %self.spec.name,
                        kind = %kind,
                        name = %name,
                        "conflict, retrying immediately"
                    );
                    self.queue.add(key.clone());
                    self.count("conflict");
                }
                Err(Error::InvalidDependent(msg)) => {
                    // Dropped until the next event for this key.
                    error!(controller = %self.spec.name, key = %key, "invalid dependent: {msg}");
                    self.count("invalid");
                }
                Err(Error::Unrecoverable(msg)) => {
                    error!(controller = %self.spec.name, key = %key, "unrecoverable: {msg}");
                    self.queue.done(&key);
                    return Err(Error::Unrecoverable(msg));
                }
                Err(e) => {
                    warn!(
                        controller = %self.spec.name,
                        key = %key,
                        retries = self.queue.retries(&key),
                        error = %e,
                        "reconcile failed, requeueing with backoff"
                    );
                    self.queue.add_rate_limited(key.clone());
                    self.count("error");
                }
            }
            self.queue.done(&key);
        }
        Ok(())
    }

    fn count(&self, result: &'static str) {
        counter!(
            "reconciles_total",
            "controller" => self.spec.name.clone(),
            "result" => result
        )
        .increment(1);
    }

    async fn reconcile_key(&self, key: &str) -> Result<Outcome> {
        let Some((namespace, name)) = key.split_once('/') else {
            warn!(controller = %self.spec.name, key = %key, "malformed queue key");
            return Ok(Outcome::Clean);
        };

        let Some(cached) = self.primary.get(namespace, name) else {
            debug!(controller = %self.spec.name, key = %key, "no longer in cache, forgetting");
            return Ok(Outcome::Clean);
        };
        let primary = object::to_value(&cached)?;

        let deleting = object::is_deleting(&primary);
        let handler_timeout = if deleting {
            self.spec.finalizer_timeout
        } else {
            self.spec.reconciler_timeout
        };

        let work = async {
            if deleting {
                self.finalize(&primary).await
            } else {
                self.active(&primary).await
            }
        };

        match handler_timeout {
            Some(limit) => {
                let deadline = limit + RECONCILE_SLACK;
                tokio::time::timeout(deadline, work)
                    .await
                    .map_err(|_| Error::HandlerTimeout(deadline))?
            }
            None => work.await,
        }
    }

    async fn active(&self, primary: &Value) -> Result<Outcome> {
        let doc = state::assemble(primary, &self.dependents, &self.references)?;
        let namespace = object::namespace(primary).unwrap_or_default().to_string();
        let name = object::name(primary).unwrap_or_default().to_string();

        debug!(
            controller = %self.spec.name,
            namespace = %namespace,
            name = %name,
            dependents = doc.dependents.len(),
            references = doc.references.len(),
            "reconciling"
        );

        let response_bytes = self.spec.reconciler.invoke(&doc.to_bytes()?).await?;
        let response = StateDocument::from_handler_response(&response_bytes)?;

        // Finalizers before anything else, so a handler can install one
        // before its first side effect.
        if let Some(finalizers) =
            finalizers_patch(primary, &response.object, self.installs_finalizer())
        {
            if self.spec.observe {
                info!(
                    controller = %self.spec.name,
                    name = %name,
                    finalizers = ?finalizers,
                    "observe mode: would patch finalizers"
                );
            } else {
                self.patch_finalizers(&namespace, &name, &finalizers).await?;
            }
        }

        let ops = dependents::plan(&response.dependents, &doc.dependents)?;
        if !ops.is_empty() {
            if self.spec.observe {
                info!(
                    controller = %self.spec.name,
                    name = %name,
                    ops = ops.len(),
                    "observe mode: skipping dependent writes"
                );
                for op in &ops {
                    debug!(controller = %self.spec.name, ?op, "observe mode: planned op");
                }
            } else {
                Applier::new(&self.client, primary, &self.rules)
                    .apply(&ops)
                    .await?;
            }
        }

        if let Some(status) = status_patch(primary, &response.object) {
            if self.spec.observe {
                info!(
                    controller = %self.spec.name,
                    name = %name,
                    "observe mode: would patch status"
                );
            } else {
                self.patch_status(&namespace, &name, &status).await?;
            }
        }

        match self.spec.requeue_after {
            Some(delay) if !delay.is_zero() => Ok(Outcome::RequeueAfter(delay)),
            _ => Ok(Outcome::Clean),
        }
    }

    async fn finalize(&self, primary: &Value) -> Result<Outcome> {
        if self.spec.finalizer.is_none() && !self.has_orphans() {
            return Ok(Outcome::Clean);
        }

        let current = object::finalizers(primary);
        if !current.iter().any(|f| f == FINALIZER) {
            return Ok(Outcome::Clean);
        }

        let namespace = object::namespace(primary).unwrap_or_default().to_string();
        let name = object::name(primary).unwrap_or_default().to_string();

        if self.spec.observe {
            debug!(
                controller = %self.spec.name,
                name = %name,
                "observe mode: skipping finalization"
            );
            return Ok(Outcome::Clean);
        }

        let doc = state::assemble(primary, &self.dependents, &self.references)?;

        let desired = match &self.spec.finalizer {
            Some(handler) => {
                info!(controller = %self.spec.name, name = %name, "finalizing");
                let response_bytes = handler.invoke(&doc.to_bytes()?).await?;
                let response = StateDocument::from_handler_response(&response_bytes)?;
                object::finalizers(&response.object)
            }
            None => current
                .iter()
                .filter(|f| f.as_str() != FINALIZER)
                .cloned()
                .collect(),
        };

        let finished = !desired.iter().any(|f| f == FINALIZER);
        if finished {
            // Release orphans before the key comes off, so the garbage
            // collector never cascades into them.
            Applier::new(&self.client, primary, &self.rules)
                .release_orphans(&doc.dependents)
                .await?;
        }

        if desired != current {
            self.patch_finalizers(&namespace, &name, &desired).await?;
        }

        if finished {
            info!(controller = %self.spec.name, name = %name, "finalized");
            Ok(Outcome::Clean)
        } else {
            debug!(
                controller = %self.spec.name,
                name = %name,
                "finalizer keys still present, retrying"
            );
            Ok(Outcome::Retry)
        }
    }

    fn installs_finalizer(&self) -> bool {
        (self.spec.finalizer.is_some() || self.has_orphans()) && !self.spec.observe
    }

    fn has_orphans(&self) -> bool {
        self.rules.iter().any(|r| r.orphan)
    }

    fn primary_api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.api_resource)
    }

    async fn patch_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()> {
        let patch = json!({"metadata": {"finalizers": finalizers}});
        self.primary_api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify_api_error(e, &self.spec.resource.kind, name))?;
        Ok(())
    }

    async fn patch_status(&self, namespace: &str, name: &str, status: &Value) -> Result<()> {
        let patch = json!({"status": status});
        self.primary_api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify_api_error(e, &self.spec.resource.kind, name))?;
        Ok(())
    }
}

/// The finalizers list to patch, or `None` when the current list already
/// matches. `install` unions the runtime's own key into the desired list.
fn finalizers_patch(current: &Value, response: &Value, install: bool) -> Option<Vec<String>> {
    let current_list = object::finalizers(current);
    let mut desired = object::finalizers(response);
    if install && !desired.iter().any(|f| f == FINALIZER) {
        desired.push(FINALIZER.to_string());
    }
    (desired != current_list).then_some(desired)
}

/// The status value to patch, or `None` when unchanged. A handler that
/// drops the status entirely clears it with an explicit null.
fn status_patch(current: &Value, response: &Value) -> Option<Value> {
    let current_status = object::lookup(current, "status").cloned().unwrap_or(Value::Null);
    let desired_status = object::lookup(response, "status").cloned().unwrap_or(Value::Null);
    (desired_status != current_status).then_some(desired_status)
}

/// The primary's queue key for a dependent event, resolved through the
/// controller owner reference. `None` when the object is not owned by this
/// controller's primary kind.
pub fn owner_key(obj: &DynamicObject, resource: &ResourceRef) -> Option<String> {
    let refs = obj.metadata.owner_references.as_ref()?;
    let owner = refs.iter().find(|r| r.controller == Some(true))?;
    if owner.kind != resource.kind || owner.api_version != resource.api_version() {
        return None;
    }
    let namespace = obj.metadata.namespace.as_deref()?;
    Some(format!("{namespace}/{}", owner.name))
}
