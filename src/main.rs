//! ecrestore node
//!
//! Runs the EC restore control plane of one storage node.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          ecrestore node                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ ControlPlane │───▶│ TaskRegistry │───▶│ RestoreEngine│       │
//! │  │              │    │              │    │  (per bucket)│       │
//! │  └──────────────┘    └──────────────┘    └──────┬───────┘       │
//! │         ▲                                       │ fetch         │
//! │         │ response        ┌──────────────┐      ▼               │
//! │         └─────────────────│ loopback peer│◀─────┘               │
//! │                           └──────────────┘                      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Without a cluster transport the node answers its own fetches through a
//! loopback peer that serves deterministic object content.

use std::collections::hash_map::DefaultHasher;
use std::convert::Infallible;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ecrestore::ec::{
    ChannelTransport, InMemoryStore, MountId, Mounts, NodeId, ObjHeader, ObjectRef, RestoreDeps,
    SliceFetch, StaticLocator,
};
use ecrestore::error::{Error, Result};
use ecrestore::xact::BucketRef;
use ecrestore::{metrics, ControlPlane, RegistryConfig, RestoreConfig, RestoreOptions, TaskRegistry};

// =============================================================================
// CLI Arguments
// =============================================================================

/// ecrestore - EC object restore for a storage node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Id of this node
    #[arg(long, env = "ECR_NODE_ID", default_value = "t1")]
    node_id: String,

    /// Local mounts, comma separated
    #[arg(long, env = "ECR_MOUNTS", value_delimiter = ',', default_value = "mp1,mp2")]
    mounts: Vec<String>,

    /// Worker queue capacity per mount
    #[arg(long, env = "ECR_BURST_SIZE", default_value = "128")]
    burst_size: usize,

    /// Idle window of an EC-GET engine in seconds
    #[arg(long, env = "ECR_IDLE_TIMEOUT_SECONDS", default_value = "120")]
    idle_timeout_seconds: u64,

    /// Stats log interval in seconds
    #[arg(long, env = "ECR_STATS_INTERVAL_SECONDS", default_value = "10")]
    stats_interval_seconds: u64,

    /// How long a worker waits for one object's slices, in seconds
    #[arg(long, env = "ECR_SLICE_TIMEOUT_SECONDS", default_value = "300")]
    slice_timeout_seconds: u64,

    /// Response read size in bytes
    #[arg(long, env = "ECR_CHUNK_SIZE", default_value = "32768")]
    chunk_size: usize,

    /// How long finished tasks stay queryable, in seconds
    #[arg(long, env = "ECR_FINISHED_RETENTION_SECONDS", default_value = "600")]
    finished_retention_seconds: u64,

    /// Objects to restore at startup, as bucket/object, comma separated
    #[arg(long, env = "ECR_RESTORE", value_delimiter = ',')]
    restore: Vec<String>,

    /// Size of each loopback-served object in bytes
    #[arg(long, env = "ECR_OBJECT_SIZE", default_value = "1048576")]
    object_size: u64,

    /// Caller-side wait limit for startup restores, in seconds (0 = none)
    #[arg(long, env = "ECR_RESTORE_TIMEOUT_SECONDS", default_value = "0")]
    restore_timeout_seconds: u64,

    /// Metrics server bind address
    #[arg(long, env = "ECR_METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "ECR_HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ECR_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "ECR_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn restore_config(&self) -> RestoreConfig {
        RestoreConfig {
            burst_size: self.burst_size,
            idle_timeout: Duration::from_secs(self.idle_timeout_seconds),
            stats_interval: Duration::from_secs(self.stats_interval_seconds.max(1)),
            slice_timeout: Duration::from_secs(self.slice_timeout_seconds),
            chunk_size: self.chunk_size,
        }
    }

    fn restore_timeout(&self) -> Option<Duration> {
        (self.restore_timeout_seconds > 0).then(|| Duration::from_secs(self.restore_timeout_seconds))
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting ecrestore node {}", args.node_id);
    info!("  Mounts: {:?}", args.mounts);
    info!("  Burst size: {}", args.burst_size);
    info!("  Idle timeout: {}s", args.idle_timeout_seconds);
    info!("  Startup restores: {}", args.restore.len());

    if args.mounts.is_empty() {
        return Err(Error::Config("at least one mount is required".to_string()));
    }

    let mounts = Arc::new(Mounts::with_mounts(args.mounts.clone()));
    let mount_ids = mounts.available();
    let store = Arc::new(InMemoryStore::new());
    let locator = Arc::new(StaticLocator::new());
    let (transport, fetches) = ChannelTransport::new();

    let registry = TaskRegistry::new(RegistryConfig {
        finished_retention: Duration::from_secs(args.finished_retention_seconds),
    });
    let deps = RestoreDeps {
        transport: Arc::new(transport),
        store: store.clone(),
        mounts: mounts.clone(),
    };
    let control = Arc::new(ControlPlane::new(
        registry.clone(),
        args.restore_config(),
        deps,
        locator.clone(),
    ));

    // Loopback peer
    let peer_ctl = control.clone();
    let object_sizes = Arc::new(dashmap::DashMap::new());
    let peer_sizes = object_sizes.clone();
    tokio::spawn(async move {
        run_loopback_peer(peer_ctl, peer_sizes, fetches).await;
    });

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_http_server(&health_addr, "Health", health_route).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_http_server(&metrics_addr, "Metrics", metrics_route).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Evict finished tasks
    let evict_registry = registry.clone();
    let retention = Duration::from_secs(args.finished_retention_seconds.max(1));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(retention);
        loop {
            tick.tick().await;
            evict_registry.evict_finished();
        }
    });

    // Startup restores
    let mut by_bucket: std::collections::BTreeMap<String, Vec<String>> = Default::default();
    for target in &args.restore {
        let Some((bucket, object)) = target.split_once('/') else {
            warn!("Ignoring restore target {:?}: expected bucket/object", target);
            continue;
        };
        let obj = ObjectRef {
            bucket: BucketRef::new(bucket),
            name: object.to_string(),
            mount: pick_mount(&mount_ids, target),
            size: args.object_size,
            source: NodeId::new(format!("{}-peer", args.node_id)),
        };
        object_sizes.insert(obj.cname(), obj.size);
        locator.insert(obj);
        by_bucket
            .entry(bucket.to_string())
            .or_default()
            .push(object.to_string());
    }
    for (bucket, objects) in by_bucket {
        let control = control.clone();
        let options = RestoreOptions {
            timeout: args.restore_timeout(),
            ..Default::default()
        };
        tokio::spawn(async move {
            let ids = match control.start_restore_all(&bucket, &objects, options).await {
                Ok(ids) => ids,
                Err(e) => {
                    error!("Failed to start restores in {}: {}", bucket, e);
                    return;
                }
            };
            match control.wait_all(&ids, None).await {
                Ok(()) => info!("Restored {} objects in {}", ids.len(), bucket),
                Err(e) => error!("Restore in {} failed: {}", bucket, e),
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    let aborted = control.shutdown("node shutting down");
    info!("Aborted {} tasks, shutdown complete", aborted);
    Ok(())
}

fn pick_mount(mounts: &[MountId], key: &str) -> MountId {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let idx = (hasher.finish() % mounts.len().max(1) as u64) as usize;
    mounts
        .get(idx)
        .cloned()
        .unwrap_or_else(|| MountId::new("mp1"))
}

// =============================================================================
// Loopback Peer
// =============================================================================

/// Answer fetches with deterministic content of the registered size.
async fn run_loopback_peer(
    control: Arc<ControlPlane>,
    sizes: Arc<dashmap::DashMap<String, u64>>,
    mut fetches: mpsc::UnboundedReceiver<SliceFetch>,
) {
    while let Some(fetch) = fetches.recv().await {
        let cname = fetch.bucket.cname(&fetch.object);
        let size = sizes.get(&cname).map(|s| *s.value()).unwrap_or(0);
        let control = control.clone();
        tokio::spawn(async move {
            let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let hdr = ObjHeader::slice_data(&fetch.uname(), size);
            let mut body: &[u8] = &data;
            if let Err(e) = control.on_slice_response(&hdr, &mut body).await {
                warn!("Loopback delivery of {} failed: {}", cname, e);
            }
        });
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().expect("static directive"))
        .add_directive("h2=warn".parse().expect("static directive"));

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// HTTP Servers
// =============================================================================

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn health_route(path: &str) -> Response<Full<Bytes>> {
    match path {
        "/healthz" | "/livez" | "/readyz" => respond(StatusCode::OK, "ok"),
        _ => respond(StatusCode::NOT_FOUND, "not found"),
    }
}

fn metrics_route(path: &str) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => match metrics::gather_text() {
            Ok(text) => {
                let mut response = respond(StatusCode::OK, text);
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        _ => respond(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn run_http_server(
    addr: &str,
    name: &'static str,
    route: fn(&str) -> Response<Full<Bytes>>,
) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {} server address: {}", name, e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {} server: {}", name, e)))?;

    info!("{} server listening on {}", name, addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("{} server accept error: {}", name, e)))?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| async move {
                Ok::<_, Infallible>(route(req.uri().path()))
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("{} server connection error: {}", name, e);
            }
        });
    }
}
