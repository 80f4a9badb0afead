//! Informer layer: a watched, cached view of one resource kind.
//!
//! Each [`ObjectCache`] runs a watcher feeding a reflector store and invokes
//! an optional hook per add/update/delete, which is how the engine, the
//! dependent informers and the reference watchers get their enqueue signals.
//! Stores are read by many workers and written only by the watch task.

use std::sync::Arc;

use futures::StreamExt;
use kube::Client;
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, Event, watcher};
use kube::runtime::{WatchStreamExt, reflector};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// What happened to an object in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    /// Object added or updated (including re-list during a resync).
    Applied,
    /// Object deleted.
    Deleted,
}

/// Callback invoked for every watch event, after the store was updated.
pub type EventHook = Box<dyn Fn(CacheEvent, &DynamicObject) + Send + Sync>;

/// A cached, watched view of one resource kind across all namespaces.
pub struct ObjectCache {
    resource: ApiResource,
    store: Store<DynamicObject>,
}

impl ObjectCache {
    /// Start watching the given kind. Returns the cache and the watch task.
    pub fn spawn(
        client: Client,
        resource: ApiResource,
        hook: Option<EventHook>,
        shutdown: CancellationToken,
    ) -> (Arc<ObjectCache>, JoinHandle<()>) {
        let api: Api<DynamicObject> = Api::all_with(client, &resource);
        let writer = Writer::new(resource.clone());
        let store = writer.as_reader();

        let cache = Arc::new(ObjectCache {
            resource: resource.clone(),
            store,
        });

        let kind = resource.kind.clone();
        let handle = tokio::spawn(async move {
            let stream = reflector(writer, watcher(api, watcher::Config::default()).default_backoff());
            futures::pin_mut!(stream);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(kind = %kind, "stopping informer");
                        break;
                    }
                    event = stream.next() => match event {
                        Some(Ok(Event::Apply(obj))) | Some(Ok(Event::InitApply(obj))) => {
                            if let Some(hook) = &hook {
                                hook(CacheEvent::Applied, &obj);
                            }
                        }
                        Some(Ok(Event::Delete(obj))) => {
                            if let Some(hook) = &hook {
                                hook(CacheEvent::Deleted, &obj);
                            }
                        }
                        Some(Ok(Event::Init)) | Some(Ok(Event::InitDone)) => {}
                        Some(Err(e)) => {
                            error!(kind = %kind, error = %e, "watch error");
                        }
                        None => {
                            warn!(kind = %kind, "watch stream ended");
                            break;
                        }
                    }
                }
            }
        });

        (cache, handle)
    }

    /// The resource this cache watches.
    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    /// Block until the initial list has been received.
    pub async fn wait_ready(&self) -> Result<()> {
        self.store
            .wait_until_ready()
            .await
            .map_err(|e| Error::Unrecoverable(format!("informer store failed: {e}")))
    }

    /// Look up one object by namespace and name.
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<DynamicObject>> {
        let key = ObjectRef::<DynamicObject>::new_with(name, self.resource.clone()).within(namespace);
        self.store.get(&key)
    }

    /// Every cached object.
    pub fn state(&self) -> Vec<Arc<DynamicObject>> {
        self.store.state()
    }

    /// Cached objects in one namespace, sorted by name.
    pub fn list_namespace(&self, namespace: &str) -> Vec<Arc<DynamicObject>> {
        let mut objects: Vec<Arc<DynamicObject>> = self
            .store
            .state()
            .into_iter()
            .filter(|obj| obj.metadata.namespace.as_deref() == Some(namespace))
            .collect();
        objects.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        objects
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Store plumbing for tests that need a populated cache without a
    //! cluster: events are applied straight to a reflector writer.

    use super::*;
    use serde_json::Value;

    /// A cache plus the writer feeding it.
    pub struct FixtureCache {
        pub cache: Arc<ObjectCache>,
        writer: Writer<DynamicObject>,
    }

    impl FixtureCache {
        pub fn new(resource: ApiResource) -> Self {
            let mut writer = Writer::new(resource.clone());
            // Mark the store ready so lookups do not block.
            writer.apply_watcher_event(&Event::Init);
            writer.apply_watcher_event(&Event::InitDone);
            let store = writer.as_reader();
            FixtureCache {
                cache: Arc::new(ObjectCache { resource, store }),
                writer,
            }
        }

        pub fn apply(&mut self, obj: DynamicObject) {
            self.writer.apply_watcher_event(&Event::Apply(obj));
        }

        pub fn delete(&mut self, obj: DynamicObject) {
            self.writer.apply_watcher_event(&Event::Delete(obj));
        }
    }

    /// Build a `DynamicObject` from raw JSON for fixtures.
    pub fn dynamic_object(resource: &ApiResource, namespace: &str, name: &str, data: Value) -> DynamicObject {
        let mut obj = DynamicObject::new(name, resource).within(namespace);
        obj.data = data;
        obj
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;

    fn resource() -> ApiResource {
        ApiResource::from_gvk(&kube::core::GroupVersionKind::gvk("example.com", "v1", "Hello"))
    }

    #[test]
    fn list_namespace_filters_and_sorts() {
        let mut fixture = FixtureCache::new(resource());
        fixture.apply(dynamic_object(&resource(), "default", "b", json!({})));
        fixture.apply(dynamic_object(&resource(), "default", "a", json!({})));
        fixture.apply(dynamic_object(&resource(), "other", "c", json!({})));

        let names: Vec<String> = fixture
            .cache
            .list_namespace("default")
            .iter()
            .map(|o| o.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(fixture.cache.get("other", "c").is_some());
        assert!(fixture.cache.get("default", "c").is_none());
    }

    #[test]
    fn delete_removes_from_store() {
        let mut fixture = FixtureCache::new(resource());
        let obj = dynamic_object(&resource(), "default", "a", json!({}));
        fixture.apply(obj.clone());
        assert!(fixture.cache.get("default", "a").is_some());
        fixture.delete(obj);
        assert!(fixture.cache.get("default", "a").is_none());
    }
}
