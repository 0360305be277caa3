//! MirrorGate - shadow-traffic proxy.
//!
//! Every request is served from the baseline; a sampled fraction is replayed
//! against the candidate in the background, diffed, and fed to the guardrail
//! that halts mirroring when the candidate degrades.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use clap::Parser;
use mirrorgate_core::config::MirrorConfig;
use mirrorgate_core::guardrail::Guardrail;
use mirrorgate_core::telemetry::MirrorMetrics;
use mirrorgate_proxy::control::{self, ControlState};
use mirrorgate_proxy::dispatcher::Dispatcher;
use mirrorgate_proxy::logging_layer::logging_layer;
use mirrorgate_proxy::upstream::UpstreamClient;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Command-line overrides. Everything else comes from the environment.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bind address, overrides LISTEN_ADDR (e.g. ":8080" or "127.0.0.1:9000")
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Non-blocking writer keeps logging off the request path. The guard must
    // live until exit so buffered lines are flushed.
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .json()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = MirrorConfig::from_env();
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    let mut registry = Registry::default();
    let metrics = Arc::new(MirrorMetrics::new(&mut registry));
    let registry = Arc::new(registry);

    let guardrail =
        Arc::new(Guardrail::new(config.guardrail_config()).with_metrics(metrics.clone()));

    let client = UpstreamClient::new()?;
    let dispatcher = Dispatcher::new(&config, client, guardrail.clone(), metrics.clone())
        .unwrap_or_else(|e| {
            error!(error = %e, "Invalid upstream URL, refusing to start");
            std::process::exit(1);
        });

    let app = control::router(
        ControlState {
            guardrail,
            registry,
        },
        dispatcher.clone(),
    )
    .layer(logging_layer());

    let bind_addr = config.bind_addr();
    let listener = TcpListener::bind(bind_addr.as_str()).await.map_err(|e| {
        error!(addr = %bind_addr, error = %e, "Failed to bind listen address");
        e
    })?;
    info!(
        addr = %listener.local_addr()?,
        baseline = %config.baseline_url,
        candidate = %config.candidate_url,
        mirror_fraction = config.mirror_fraction,
        mirror_max_in_flight = config.mirror_max_in_flight,
        "Starting shadow proxy"
    );

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Shutdown signal received, stopping new connections");
        })
        .await?;

    // Drain detached mirror tasks for at most shutdown_timeout.
    let tracker = dispatcher.tracker();
    tracker.close();
    info!(
        in_flight_mirrors = tracker.len(),
        drain_timeout_secs = config.shutdown_timeout.as_secs(),
        "Waiting for mirror tasks to drain"
    );

    match tokio::time::timeout(config.shutdown_timeout, tracker.wait()).await {
        Ok(()) => info!("All mirror tasks drained, shutting down cleanly"),
        Err(_) => warn!(
            remaining = tracker.len(),
            "Drain timeout exceeded, abandoning in-flight mirrors"
        ),
    }

    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_sigint = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                shutdown_sigint.cancel();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        let shutdown_sigterm = shutdown;
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    shutdown_sigterm.cancel();
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });
    }

    #[cfg(not(unix))]
    let _ = shutdown;
}
