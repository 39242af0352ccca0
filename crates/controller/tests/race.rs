#![forbid(unsafe_code)]

//! Metadata-triggered annotator reading through the full projection.

use std::sync::Arc;
use std::time::Duration;

use tandem_controller::{poll_until, Annotator, Client, Controller, ControllerConfig, SECRET_FOUND_KEY, SECRET_FOUND_VALUE};
use tandem_core::{Backend, BackoffPolicy, Error, Kind, Object, ObjectKey, Shape};
use tandem_kubehub::MemoryBackend;
use tandem_store::ProjectionRegistry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Harness {
    backend: Arc<MemoryBackend>,
    registry: Arc<ProjectionRegistry>,
    client: Client,
    annotator: Arc<Annotator>,
    shutdown: CancellationToken,
    run: JoinHandle<Result<(), Error>>,
}

fn config() -> ControllerConfig {
    ControllerConfig {
        workers: 2,
        watch_backoff: BackoffPolicy { base_delay_ms: 5, max_delay_ms: 50, factor: 2.0, jitter: 0.0 },
        requeue_backoff: BackoffPolicy { base_delay_ms: 20, max_delay_ms: 200, factor: 2.0, jitter: 0.0 },
        drain_timeout_ms: 2_000,
        ..ControllerConfig::default()
    }
}

fn secret_1() -> ObjectKey { ObjectKey::namespaced("ns-1", "secret-1") }

async fn start(follow_full: bool) -> Harness {
    let backend = Arc::new(MemoryBackend::new());
    backend.create(&Kind::namespace(), Object::new(&Kind::namespace(), ObjectKey::cluster("ns-1"))).await.unwrap();
    let cfg = config();
    let registry = Arc::new(ProjectionRegistry::new(backend.clone(), cfg.cache_config()));
    let client = Client::new(registry.clone());
    let annotator = Arc::new(Annotator::secret_found(client.clone()));
    let mut controller = Controller::new(Kind::secret(), annotator.clone()).watches(Shape::Metadata).with_config(cfg);
    if follow_full {
        controller = controller.follows(Shape::Full);
    }
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(controller.run(registry.clone(), shutdown.clone()));
    registry.wait_for(&Kind::secret(), Shape::Metadata).await.wait_ready().await.unwrap();
    Harness { backend, registry, client, annotator, shutdown, run }
}

impl Harness {
    /// Read of an identity that does not exist, so the full projection is
    /// listing before the secret is created.
    async fn prime(&self) {
        let err = self.client.get(&Kind::secret(), &ObjectKey::namespaced("ns-1", "prime")).await.unwrap_err();
        assert!(err.is_not_found(), "{err}");
    }

    async fn create_secret(&self) {
        self.backend.create(&Kind::secret(), Object::new(&Kind::secret(), secret_1())).await.unwrap();
    }

    fn annotated(&self) -> bool {
        self.backend
            .objects(&Kind::secret())
            .iter()
            .any(|o| o.key() == &secret_1() && o.annotation(SECRET_FOUND_KEY) == Some(SECRET_FOUND_VALUE))
    }

    async fn converge(&self, within: Duration) {
        poll_until(Duration::from_millis(5), within, || async { Ok(self.annotated()) })
            .await
            .unwrap_or_else(|e| panic!("secret-1 never annotated: {e}; stats {:?}", self.annotator.stats()));
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.run).await.unwrap().unwrap().unwrap();
        self.registry.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn without_priming_first_pass_writes() {
    let h = start(true).await;
    h.create_secret().await;
    h.converge(Duration::from_secs(5)).await;

    let stats = h.annotator.stats();
    assert_eq!(stats.not_found, 0, "{stats:?}");
    assert_eq!(stats.writes, 1, "{stats:?}");
    assert!((1..=2).contains(&stats.write_calls), "{stats:?}");
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_race_converges_on_full_projection_add() {
    let h = start(true).await;
    h.prime().await;
    h.backend.pause(Shape::Full);
    h.create_secret().await;

    poll_until(Duration::from_millis(2), Duration::from_secs(5), || async { Ok(h.annotator.stats().not_found >= 1) })
        .await
        .expect("first pass should miss in the full projection");
    assert!(!h.annotated());
    assert_eq!(h.annotator.stats().write_calls, 0);

    h.backend.resume(Shape::Full);
    h.converge(Duration::from_secs(5)).await;

    let stats = h.annotator.stats();
    assert!(stats.passes >= 2, "{stats:?}");
    assert_eq!(stats.writes, 1, "{stats:?}");
    assert!((1..=2).contains(&stats.write_calls), "{stats:?}");
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_full_projection_still_converges() {
    let h = start(true).await;
    h.prime().await;
    h.backend.set_lag(Shape::Full, Duration::from_millis(150));
    h.create_secret().await;
    h.converge(Duration::from_secs(5)).await;

    let stats = h.annotator.stats();
    assert_eq!(stats.writes, 1, "{stats:?}");
    assert!((1..=2).contains(&stats.write_calls), "{stats:?}");
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_race_without_following_never_converges() {
    let h = start(false).await;
    h.prime().await;
    h.backend.pause(Shape::Full);
    h.create_secret().await;

    poll_until(Duration::from_millis(2), Duration::from_secs(5), || async { Ok(h.annotator.stats().not_found >= 1) })
        .await
        .unwrap();
    h.backend.resume(Shape::Full);

    // The full cache catches up, but nothing re-triggers the key.
    let full = h.registry.get(&Kind::secret(), Shape::Full).unwrap();
    poll_until(Duration::from_millis(2), Duration::from_secs(5), || async { Ok(full.get(&secret_1()).await?.is_some()) })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = h.annotator.stats();
    assert!(!h.annotated());
    assert_eq!(stats.passes, 1, "{stats:?}");
    assert_eq!(stats.write_calls, 0, "{stats:?}");
    h.stop().await;
}
