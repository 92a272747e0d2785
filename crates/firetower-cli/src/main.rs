//! Firetower gateway CLI
//!
//! Accepts pub/sub clients over TCP, relays their publishes to the topic
//! service and fans the service's messages back out to subscribers.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use firetower_core::config::{GatewayConfig, LoggingConfig, TopicServiceConfig};
use firetower_core::gateway::{GatewayContext, GatewayManager};
use firetower_core::network::GatewayListener;

/// Firetower pub/sub gateway.
#[derive(Parser)]
#[command(name = "firetower-gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file. Without one, defaults apply.
    #[arg(short, long)]
    config: Option<String>,

    /// Override listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Override topic service address (data and management).
    #[arg(long)]
    topic_service: Option<String>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("failed to load config from {path}"))?,
        None => GatewayConfig::new(TopicServiceConfig::new("127.0.0.1:6666", "127.0.0.1:6667")),
    };

    if let Some(listen) = args.listen {
        config.listen.address = listen;
    }
    if let Some(address) = args.topic_service {
        config.topic_service.address.clone_from(&address);
        config.topic_service.grpc_address = address;
    }
    config.validate()?;

    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    setup_tracing(&log_config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen.address,
        topic_service = %config.topic_service.address,
        cluster_id = config.cluster_id,
        hot_topics = config.sharding.hot_topics.len(),
        "starting firetower gateway"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move { run_gateway(config).await })
}

fn setup_tracing(config: &LoggingConfig) {
    let level: Level = config.level.parse().unwrap_or(Level::INFO);
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry.with(fmt::layer().json().with_current_span(false)).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

async fn run_gateway(config: GatewayConfig) -> anyhow::Result<()> {
    let manager = Arc::new(GatewayManager::new(GatewayContext::new(config)));

    let metrics_config = manager.context().config.metrics.clone();
    if metrics_config.enabled {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&metrics_config.address, manager).await {
                error!(error = %e, "metrics server error");
            }
        });
    }

    // Connecting retries with backoff; clients may attach meanwhile and
    // their publishes fail until the link is up.
    let starting = Arc::clone(&manager);
    tokio::spawn(async move {
        match starting.start().await {
            Ok(()) => info!("connected to topic service"),
            Err(e) => error!(error = %e, "gateway manager failed to start"),
        }
    });

    let listener = GatewayListener::new(Arc::clone(&manager));
    let shutdown_handle = listener.shutdown_handle();
    let stopping = Arc::clone(&manager);

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, stopping gateway");
        let _ = shutdown_handle.send(());
        stopping.shutdown();
    });

    let served = listener.run().await;

    manager.shutdown();
    manager.join().await;
    served?;

    info!("gateway shutdown complete");
    Ok(())
}

/// Resolves on ctrl+c, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use signal::unix::SignalKind;

        match signal::unix::signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => error!(error = %e, "failed to listen for SIGTERM"),
        }
    }

    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl+c");
        std::future::pending::<()>().await;
    }
}

/// Serves `/metrics` in the Prometheus text format and `/health`, which
/// reports 503 while the topic service link is down.
async fn start_metrics_server(
    addr: &str,
    manager: Arc<GatewayManager>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use http_body_util::Full;
    use hyper::body::{Bytes, Incoming};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "metrics server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let manager = Arc::clone(&manager);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let manager = Arc::clone(&manager);
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match manager.context().metrics.encode() {
                            Ok(text) => respond(StatusCode::OK, text),
                            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        "/health" => {
                            let state = manager.link_state();
                            let status = if manager.upstream().is_live() {
                                StatusCode::OK
                            } else {
                                StatusCode::SERVICE_UNAVAILABLE
                            };
                            respond(status, format!("{state:?}"))
                        }
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, hyper::Error>(response)
                }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!(peer = %peer, error = %e, "metrics connection error");
            }
        });
    }
}
