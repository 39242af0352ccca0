use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tandem_controller::{poll_until, Annotator, AnnotatorStats, Client, Controller, ControllerConfig, SECRET_FOUND_KEY, SECRET_FOUND_VALUE};
use tandem_core::{Backend, Kind, Object, ObjectKey, Shape};
use tandem_kubehub::{BackendStats, KubeBackend, MemoryBackend};
use tandem_store::{Change, ProjectionRegistry};
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tandemctl", version, about = "Tandem: dual-projection cache and reconcile loop")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Restrict to one namespace (default: all)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// YAML file with controller settings; TANDEM_* variables override it
    #[arg(long = "config", global = true, env = "TANDEM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ShapeArg { Full, Metadata }

impl From<ShapeArg> for Shape {
    fn from(s: ShapeArg) -> Self {
        match s {
            ShapeArg::Full => Shape::Full,
            ShapeArg::Metadata => Shape::Metadata,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the secret-1 annotation scenario against an in-process backend
    Repro {
        /// Delivery delay for full-projection watch events
        #[arg(long = "full-lag-ms", default_value_t = 0)]
        full_lag_ms: u64,
        /// Delivery delay for metadata-projection watch events
        #[arg(long = "metadata-lag-ms", default_value_t = 0)]
        metadata_lag_ms: u64,
        /// Skip the read that creates the full projection before the secret exists
        #[arg(long = "no-prime", action = ArgAction::SetTrue)]
        no_prime: bool,
        /// Do not re-trigger reconciles from the full projection
        #[arg(long = "no-follow", action = ArgAction::SetTrue)]
        no_follow: bool,
        /// Give up after this long
        #[arg(long = "timeout-secs", default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Annotate every object of a kind on a live cluster until Ctrl-C
    Run {
        /// GVK key, e.g. "v1/Secret" or "cert-manager.io/v1/Certificate"
        #[arg(long = "kind", default_value = "v1/Secret")]
        kind: String,
        #[arg(long = "key", default_value = SECRET_FOUND_KEY)]
        key: String,
        #[arg(long = "value", default_value = SECRET_FOUND_VALUE)]
        value: String,
    },
    /// Watch one projection of a GVK and print +/- lines
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        #[arg(long = "shape", value_enum, default_value_t = ShapeArg::Metadata)]
        shape: ShapeArg,
    },
}

fn init_tracing() {
    let env = std::env::var("TANDEM_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TANDEM_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TANDEM_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ControllerConfig> {
    let mut cfg = match path {
        Some(p) => {
            let text = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?
        }
        None => ControllerConfig::default(),
    };
    cfg.apply_env();
    Ok(cfg)
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; shutting down");
        }
        token.cancel();
    });
}

#[derive(Serialize)]
struct ReproReport {
    converged: bool,
    elapsed_ms: u64,
    primed: bool,
    followed: bool,
    annotator: AnnotatorStats,
    backend: BackendStats,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Repro { full_lag_ms, metadata_lag_ms, no_prime, no_follow, timeout_secs } => {
            info!(full_lag_ms, metadata_lag_ms, prime = !no_prime, follow = !no_follow, "repro invoked");
            let backend = Arc::new(MemoryBackend::new());
            backend.set_lag(Shape::Full, Duration::from_millis(full_lag_ms));
            backend.set_lag(Shape::Metadata, Duration::from_millis(metadata_lag_ms));
            backend.create(&Kind::namespace(), Object::new(&Kind::namespace(), ObjectKey::cluster("ns-1"))).await?;

            let registry = Arc::new(ProjectionRegistry::new(backend.clone(), cfg.cache_config()));
            let client = Client::new(registry.clone());
            let annotator = Arc::new(Annotator::secret_found(client.clone()));
            let mut controller = Controller::new(Kind::secret(), annotator.clone()).watches(Shape::Metadata).with_config(cfg);
            if !no_follow {
                controller = controller.follows(Shape::Full);
            }
            let shutdown = CancellationToken::new();
            let run = tokio::spawn(controller.run(registry.clone(), shutdown.clone()));
            registry.wait_for(&Kind::secret(), Shape::Metadata).await.wait_ready().await?;

            if !no_prime {
                match client.get(&Kind::secret(), &ObjectKey::namespaced("ns-1", "prime")).await {
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                    Ok(_) => warn!("priming read unexpectedly found an object"),
                }
            }

            let started = Instant::now();
            let target = ObjectKey::namespaced("ns-1", "secret-1");
            backend.create(&Kind::secret(), Object::new(&Kind::secret(), target.clone())).await?;
            let converged = poll_until(Duration::from_millis(10), Duration::from_secs(timeout_secs), || async {
                Ok(backend.objects(&Kind::secret()).iter().any(|o| o.key() == &target && o.annotation(SECRET_FOUND_KEY) == Some(SECRET_FOUND_VALUE)))
            })
            .await
            .is_ok();
            let elapsed_ms = started.elapsed().as_millis() as u64;

            shutdown.cancel();
            match run.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "controller failed"),
                Err(e) => error!(error = %e, "controller task panicked"),
            }
            registry.shutdown().await;

            let report = ReproReport { converged, elapsed_ms, primed: !no_prime, followed: !no_follow, annotator: annotator.stats(), backend: backend.stats() };
            match cli.output {
                Output::Human => {
                    let a = &report.annotator;
                    println!("converged:   {}", if converged { "yes" } else { "no" });
                    println!("elapsed:     {}ms", elapsed_ms);
                    println!("passes:      {}", a.passes);
                    println!("not-found:   {}", a.not_found);
                    println!("write calls: {} ({} ok, {} conflicts)", a.write_calls, a.writes, a.conflicts);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            if !converged {
                bail!("{} was not annotated within {}s", target, timeout_secs);
            }
        }
        Commands::Run { kind, key, value } => {
            let kind = Kind::parse(&kind)?;
            info!(gvk = %kind, ns = ?cli.namespace, annotation = %key, "run invoked");
            let backend = Arc::new(KubeBackend::try_default().await?);
            let registry = Arc::new(ProjectionRegistry::new(backend, cfg.cache_config()));
            let annotator = Arc::new(Annotator::new(Client::new(registry.clone()), kind.clone(), &key, &value).in_namespace(cli.namespace.clone()));
            let shutdown = CancellationToken::new();
            cancel_on_ctrl_c(shutdown.clone());

            let res = Controller::new(kind, annotator.clone())
                .watches(Shape::Metadata)
                .follows(Shape::Full)
                .with_config(cfg)
                .run(registry.clone(), shutdown)
                .await;
            registry.shutdown().await;
            let stats = annotator.stats();
            info!(passes = stats.passes, writes = stats.writes, conflicts = stats.conflicts, "controller exited");
            res?;
        }
        Commands::Watch { gvk, shape } => {
            let kind = Kind::parse(&gvk)?;
            let ns = cli.namespace.as_deref();
            info!(gvk = %kind, ns = ?ns, shape = ?shape, "watch invoked");
            let backend = Arc::new(KubeBackend::try_default().await?);
            let registry = ProjectionRegistry::new(backend, cfg.cache_config());
            let cache = registry.projection_for(&kind, shape.into());
            let mut rx = cache.subscribe();
            let shutdown = CancellationToken::new();
            cancel_on_ctrl_c(shutdown.clone());

            let initial = tokio::select! {
                _ = shutdown.cancelled() => None,
                s = cache.snapshot() => Some(s?),
            };
            if let Some(snap) = initial {
                for key in snap.keys().iter().filter(|k| in_scope(k, ns)) {
                    print_change(cli.output, Change::Applied, key, None);
                }
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        n = rx.recv() => match n {
                            Ok(n) => {
                                if in_scope(&n.key, ns) {
                                    print_change(cli.output, n.change, &n.key, n.resource_version.as_ref().map(|rv| rv.as_str()));
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => warn!(missed, "watch output lagged; some changes were not printed"),
                            Err(broadcast::error::RecvError::Closed) => {
                                warn!("projection closed; exiting watch loop");
                                break;
                            }
                        },
                    }
                }
            }
            registry.shutdown().await;
            warn!("watch loop ended (graceful shutdown)");
        }
    }
    Ok(())
}

fn in_scope(key: &ObjectKey, ns: Option<&str>) -> bool {
    match ns {
        Some(want) => key.namespace.as_deref() == Some(want),
        None => true,
    }
}

fn print_change(output: Output, change: Change, key: &ObjectKey, rv: Option<&str>) {
    match output {
        Output::Human => {
            let sign = match change {
                Change::Applied => '+',
                Change::Deleted => '-',
            };
            println!("{} {}", sign, key);
        }
        Output::Json => {
            let line = serde_json::json!({
                "change": change,
                "namespace": key.namespace,
                "name": key.name,
                "resourceVersion": rv,
            });
            println!("{}", line);
        }
    }
}
