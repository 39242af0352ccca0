#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tandem_core::{Backend, BackoffPolicy, Kind, Object, ObjectKey, Shape};
use tandem_kubehub::MemoryBackend;
use tandem_store::{CacheConfig, Change, Phase, ProjectionRegistry};

fn fast() -> CacheConfig {
    CacheConfig { backoff: BackoffPolicy { base_delay_ms: 5, max_delay_ms: 50, factor: 2.0, jitter: 0.0 }, ..CacheConfig::default() }
}

fn secret(name: &str) -> Object {
    Object::new(&Kind::secret(), ObjectKey::namespaced("ns-1", name))
}

async fn seeded() -> Arc<MemoryBackend> {
    let b = Arc::new(MemoryBackend::new());
    b.create(&Kind::namespace(), Object::new(&Kind::namespace(), ObjectKey::cluster("ns-1"))).await.unwrap();
    for name in ["a", "b", "c"] {
        b.create(&Kind::secret(), secret(name)).await.unwrap();
    }
    b
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_watch_relists_to_true_state() {
    let backend = seeded().await;
    let registry = ProjectionRegistry::new(backend.clone(), fast());
    let cache = registry.projection_for(&Kind::secret(), Shape::Full);
    assert_eq!(cache.list().await.unwrap().len(), 3);

    // Deletion of b and creation of d are committed but never delivered.
    backend.pause(Shape::Full);
    backend.delete(&Kind::secret(), &ObjectKey::namespaced("ns-1", "b")).unwrap();
    backend.create(&Kind::secret(), secret("d")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stale = cache.try_snapshot().expect("still watching");
    assert!(stale.get(&ObjectKey::namespaced("ns-1", "b")).is_some());

    let mut notes = cache.subscribe();
    assert_eq!(backend.disconnect_watches(&Kind::secret()), 1);

    let mut deleted = Vec::new();
    let mut applied = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), async {
        while deleted.is_empty() || applied.is_empty() {
            let n = notes.recv().await.unwrap();
            match n.change {
                Change::Deleted => deleted.push(n.key),
                Change::Applied => applied.push(n.key),
            }
        }
    })
    .await
    .expect("relist notifications");
    assert_eq!(deleted, vec![ObjectKey::namespaced("ns-1", "b")]);
    assert_eq!(applied, vec![ObjectKey::namespaced("ns-1", "d")]);

    let rebuilt = cache.snapshot().await.unwrap();
    let mut truth: Vec<_> = backend.objects(&Kind::secret()).into_iter().map(|o| o.key().clone()).collect();
    truth.sort();
    assert_eq!(rebuilt.keys(), truth);
    assert_eq!(cache.stats().relists(), 1);

    backend.resume(Shape::Full);
    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reads_are_not_ready_while_reconnecting() {
    let backend = seeded().await;
    let slow = CacheConfig { backoff: BackoffPolicy { base_delay_ms: 60_000, max_delay_ms: 60_000, factor: 1.0, jitter: 0.0 }, ..CacheConfig::default() };
    let registry = ProjectionRegistry::new(backend.clone(), slow);
    let cache = registry.projection_for(&Kind::secret(), Shape::Metadata);
    cache.wait_ready().await.unwrap();

    backend.disconnect_watches(&Kind::secret());
    tokio::time::timeout(Duration::from_secs(2), async {
        while cache.phase() != Phase::Reconnecting {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("cache should notice the dropped watch");
    assert!(cache.try_snapshot().is_none());
    assert!(tokio::time::timeout(Duration::from_millis(50), cache.get(&ObjectKey::namespaced("ns-1", "a"))).await.is_err(), "reads block while not ready");

    registry.shutdown().await;
    assert_eq!(cache.phase(), Phase::Stopped);
    assert!(cache.wait_ready().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_list_failures_are_retried() {
    let backend = seeded().await;
    backend.fail_next(tandem_kubehub::Op::List, 2);
    let registry = ProjectionRegistry::new(backend.clone(), fast());
    let cache = registry.projection_for(&Kind::secret(), Shape::Full);
    tokio::time::timeout(Duration::from_secs(2), cache.wait_ready()).await.unwrap().unwrap();
    assert_eq!(backend.stats().lists, 3);
    assert_eq!(cache.stats().lists, 1);
    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_watch_open_relists_until_watching() {
    let backend = seeded().await;
    backend.fail_next(tandem_kubehub::Op::Watch, 2);
    let registry = ProjectionRegistry::new(backend.clone(), fast());
    let cache = registry.projection_for(&Kind::secret(), Shape::Metadata);
    tokio::time::timeout(Duration::from_secs(2), async {
        while backend.watcher_count(&Kind::secret()) < 1 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("third watch attempt opens");
    assert_eq!(backend.stats().watches, 3);
    assert_eq!(cache.stats().lists, 3);

    backend.create(&Kind::secret(), secret("d")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while cache.get(&ObjectKey::namespaced("ns-1", "d")).await.unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("events flow once watching");
    registry.shutdown().await;
}
