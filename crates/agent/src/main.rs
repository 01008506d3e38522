//! Container tail agent
//!
//! Follows the container engine's event feed and every running container's
//! logs and stats, and forwards them as normalized records to a sink.

use agent_lib::{
    health::HealthRegistry, observability::StructuredLogger, FileSink, LogSink, Normalizer,
    Reactor, ResumeMarker, RiemannSink, Sink, UnixEngine,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

use config::{AgentConfig, SinkKind};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = AgentConfig::load()?;
    info!(
        engine = %config.engine_socket.display(),
        sink = ?config.sink,
        hostname = %config.hostname,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register_agent_components().await;

    let sink: Box<dyn Sink> = match config.sink {
        SinkKind::File => Box::new(FileSink::new(config.file_sink())),
        SinkKind::Riemann => Box::new(RiemannSink::new(config.riemann_sink())),
        SinkKind::Log => Box::new(LogSink::new()),
    };

    let engine =
        Arc::new(UnixEngine::new(&config.engine_socket).with_timeout(config.connect_timeout()));
    let marker = ResumeMarker::load(&config.marker_path);
    let mut reactor = Reactor::new(engine, sink, marker, config.reactor())
        .with_normalizer(Normalizer::new(config.record_ttl_secs))
        .with_health(health_registry.clone())
        .with_logger(StructuredLogger::new(&config.hostname));

    if config.api_port != 0 {
        let state = Arc::new(api::AppState::new(health_registry));
        let port = config.api_port;
        tokio::spawn(async move {
            if let Err(e) = api::serve(port, state).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
        let _ = shutdown_tx.send(());
    });

    reactor.run(shutdown_rx).await;
    Ok(())
}
