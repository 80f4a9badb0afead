//! Periodic re-sync.
//!
//! Drift correction: every interval, every cached primary is re-enqueued.
//! The queue deduplicates, so a tick is cheap even with a deep backlog.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::ObjectCache;
use crate::object;
use crate::queue::WorkQueue;

/// Start the syncer task, if an interval is configured. A missing or zero
/// interval disables it.
pub fn spawn(
    controller: String,
    interval: Option<Duration>,
    primaries: Arc<ObjectCache>,
    queue: Arc<WorkQueue<String>>,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    let period = interval.filter(|d| !d.is_zero())?;

    Some(tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(controller = %controller, "stopping syncer");
                    break;
                }
                _ = ticker.tick() => {
                    let mut enqueued = 0usize;
                    for obj in primaries.state() {
                        if let Ok(value) = object::to_value(&obj) {
                            if let Some(key) = object::queue_key(&value) {
                                queue.add(key);
                                enqueued += 1;
                            }
                        }
                    }
                    debug!(controller = %controller, enqueued, "sync tick");
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::{FixtureCache, dynamic_object};
    use crate::config::ResourceRef;
    use crate::object::api_resource;
    use serde_json::json;

    fn hello_cache() -> FixtureCache {
        let ar = api_resource(&ResourceRef {
            group: "example.com".into(),
            version: "v1".into(),
            kind: "Hello".into(),
        });
        let mut fixture = FixtureCache::new(ar.clone());
        fixture.apply(dynamic_object(&ar, "default", "a", json!({})));
        fixture.apply(dynamic_object(&ar, "default", "b", json!({})));
        fixture
    }

    #[tokio::test]
    async fn disabled_without_interval() {
        let fixture = hello_cache();
        let queue = Arc::new(WorkQueue::new("sync-test"));
        let token = CancellationToken::new();

        assert!(spawn("c".into(), None, fixture.cache.clone(), queue.clone(), token.clone()).is_none());
        assert!(spawn(
            "c".into(),
            Some(Duration::ZERO),
            fixture.cache.clone(),
            queue,
            token
        )
        .is_none());
    }

    #[tokio::test]
    async fn ticks_enqueue_every_cached_primary() {
        let fixture = hello_cache();
        let queue: Arc<WorkQueue<String>> = Arc::new(WorkQueue::new("sync-test"));
        let token = CancellationToken::new();

        let handle = spawn(
            "c".into(),
            Some(Duration::from_millis(30)),
            fixture.cache.clone(),
            queue.clone(),
            token.clone(),
        )
        .expect("syncer spawned");

        tokio::time::sleep(Duration::from_millis(120)).await;
        token.cancel();
        handle.await.unwrap();

        // Both keys present; repeated ticks coalesced by the queue.
        assert_eq!(queue.len(), 2);
        let mut keys = vec![queue.get().await.unwrap(), queue.get().await.unwrap()];
        keys.sort();
        assert_eq!(keys, ["default/a", "default/b"]);
    }
}
