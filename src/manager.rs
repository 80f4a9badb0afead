//! Controller manager.
//!
//! Owns the informer caches, builds one engine (plus reference watchers and
//! syncer) per configured controller and the admission server when present,
//! and wires shutdown: cancel → informers stop → queues close → workers
//! drain within a grace period.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube::core::DynamicObject;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::{EventHook, ObjectCache};
use crate::config::{Config, ControllerConfig};
use crate::engine::{self, ControllerSpec, DEFAULT_WORKERS, Engine};
use crate::error::{Error, Result};
use crate::handler;
use crate::object;
use crate::queue::WorkQueue;
use crate::reference;
use crate::state::{DependentSource, ReferenceSource};
use crate::syncer;
use crate::webhook::AdmissionServer;

/// How long shutdown waits for in-flight workers.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

struct BuiltController {
    name: String,
    engine: Arc<Engine>,
    queue: Arc<WorkQueue<String>>,
    syncer_interval: Option<Duration>,
    primary: Arc<ObjectCache>,
    caches: Vec<Arc<ObjectCache>>,
}

/// Runs every configured controller and the admission server.
pub struct Manager {
    config: Config,
    client: Client,
    shutdown: CancellationToken,
}

impl Manager {
    /// Create a manager for a validated configuration.
    pub fn new(config: Config, client: Client) -> Manager {
        Manager {
            config,
            client,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token observers can use to request or follow shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shutdown or a fatal error.
    pub async fn run(self) -> Result<()> {
        if self.config.controllers.is_empty() && self.config.webhook.is_none() {
            warn!("nothing configured, exiting");
            return Ok(());
        }

        let mut informers: Vec<JoinHandle<()>> = Vec::new();
        let mut workers: JoinSet<(String, Result<()>)> = JoinSet::new();
        let mut queues: Vec<Arc<WorkQueue<String>>> = Vec::new();
        let mut controllers = Vec::new();

        for cfg in &self.config.controllers {
            let built = self.build_controller(cfg, &mut informers)?;
            info!(
                controller = %built.name,
                resource = %cfg.resource,
                "built controller"
            );
            queues.push(built.queue.clone());
            controllers.push(built);
        }

        // Let every informer deliver its initial list before workers start
        // assembling state documents from the caches.
        for built in &controllers {
            for cache in &built.caches {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(()),
                    ready = cache.wait_ready() => ready?,
                }
            }
            info!(controller = %built.name, "informers synced");
        }

        for built in controllers {
            for _ in 0..DEFAULT_WORKERS {
                let engine = built.engine.clone();
                let token = self.shutdown.clone();
                let name = built.name.clone();
                workers.spawn(async move { (name, engine.run_worker(token).await) });
            }
            if let Some(handle) = syncer::spawn(
                built.name.clone(),
                built.syncer_interval,
                built.primary.clone(),
                built.queue.clone(),
                self.shutdown.clone(),
            ) {
                informers.push(handle);
            }
        }

        if let Some(webhook_config) = &self.config.webhook {
            let server = AdmissionServer::from_config(webhook_config)?;
            let token = self.shutdown.clone();
            workers.spawn(async move { ("webhook".to_string(), server.run(token).await) });
        }

        // Supervise until shutdown or the first fatal failure.
        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                joined = workers.join_next() => match joined {
                    None => break Ok(()),
                    Some(Ok((name, Ok(())))) => {
                        info!(task = %name, "task finished");
                    }
                    Some(Ok((name, Err(e)))) => {
                        error!(task = %name, error = %e, "task failed");
                        break Err(e);
                    }
                    Some(Err(join_err)) => {
                        error!(error = %join_err, "task panicked");
                        break Err(Error::Unrecoverable(format!("task panicked: {join_err}")));
                    }
                }
            }
        };

        info!("shutting down");
        self.shutdown.cancel();
        for queue in &queues {
            queue.shut_down();
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        loop {
            tokio::select! {
                joined = workers.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok((name, Err(e)))) => {
                            warn!(task = %name, error = %e, "task stopped with error");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => warn!(error = %e, "task failed during shutdown"),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("shutdown grace period expired, aborting remaining workers");
                    workers.abort_all();
                    break;
                }
            }
        }

        for handle in informers {
            handle.abort();
        }

        result
    }

    fn build_controller(
        &self,
        cfg: &ControllerConfig,
        informers: &mut Vec<JoinHandle<()>>,
    ) -> Result<BuiltController> {
        let reconciler_config = cfg
            .reconciler
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig(format!("{}: reconciler must be specified", cfg.name)))?;

        let queue: Arc<WorkQueue<String>> = Arc::new(WorkQueue::new(cfg.name.clone()));
        let mut caches = Vec::new();

        // Primary informer: every add/update/delete enqueues the key.
        let primary_hook: EventHook = {
            let queue = queue.clone();
            Box::new(move |_event, obj: &DynamicObject| {
                if let (Some(ns), Some(name)) =
                    (obj.metadata.namespace.as_deref(), obj.metadata.name.as_deref())
                {
                    queue.add(format!("{ns}/{name}"));
                }
            })
        };
        let (primary, handle) = ObjectCache::spawn(
            self.client.clone(),
            object::api_resource(&cfg.resource),
            Some(primary_hook),
            self.shutdown.clone(),
        );
        informers.push(handle);
        caches.push(primary.clone());

        // Dependent informers: changed children enqueue their owner.
        let mut dependents = Vec::new();
        for rule in &cfg.dependents {
            let hook: EventHook = {
                let queue = queue.clone();
                let resource = cfg.resource.clone();
                Box::new(move |_event, obj: &DynamicObject| {
                    if let Some(key) = engine::owner_key(obj, &resource) {
                        queue.add(key);
                    }
                })
            };
            let (cache, handle) = ObjectCache::spawn(
                self.client.clone(),
                object::api_resource(&rule.resource),
                Some(hook),
                self.shutdown.clone(),
            );
            informers.push(handle);
            caches.push(cache.clone());
            dependents.push(DependentSource {
                rule: rule.clone(),
                cache,
            });
        }

        // Reference informers: changed references enqueue every primary
        // whose nameFieldPath points at them.
        let mut references = Vec::new();
        for rule in &cfg.references {
            let hook: EventHook = {
                let queue = queue.clone();
                let primaries = primary.clone();
                let path = rule.name_field_path.clone();
                Box::new(move |_event, obj: &DynamicObject| {
                    reference::enqueue_matching(&primaries, &queue, obj, &path);
                })
            };
            let (cache, handle) = ObjectCache::spawn(
                self.client.clone(),
                object::api_resource(&rule.resource),
                Some(hook),
                self.shutdown.clone(),
            );
            informers.push(handle);
            caches.push(cache.clone());
            references.push(ReferenceSource {
                rule: rule.clone(),
                cache,
            });
        }

        let spec = ControllerSpec {
            name: cfg.name.clone(),
            resource: cfg.resource.clone(),
            reconciler: handler::build(&reconciler_config.handler)?,
            reconciler_timeout: reconciler_config.handler.timeout(),
            requeue_after: reconciler_config.requeue_after,
            observe: reconciler_config.observe,
            finalizer: cfg
                .finalizer
                .as_ref()
                .map(handler::build)
                .transpose()?,
            finalizer_timeout: cfg.finalizer.as_ref().and_then(|f| f.timeout()),
        };

        let engine = Engine::new(
            self.client.clone(),
            spec,
            primary.clone(),
            dependents,
            references,
            queue.clone(),
        );

        Ok(BuiltController {
            name: cfg.name.clone(),
            engine,
            queue,
            syncer_interval: cfg.syncer.as_ref().and_then(|s| s.interval),
            primary,
            caches,
        })
    }
}
