//! Continuously emits synthetic metrics, traces, and logs that are linked by a shared correlation identifier.
//!
//! Metrics are served in the OpenMetrics format, with exemplars, on `/metrics`. Traces are written to a file or sent to
//! an OTLP collector, and correlated log records are written to standard output, a log file, and optionally Loki.

#![deny(missing_docs)]

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;
use correlated_telemetry::{
    config::EmitterConfig,
    logger::{CorrelatedLogger, JsonLinesSink, LokiSink},
    trace::{FileSpanExporter, OtlpHttpSpanExporter, SpanExporter, TraceBatcher},
    EmissionLoop, MetricsRegistry,
};
use tokio::{
    net::TcpListener,
    select,
    signal::unix::{signal, SignalKind},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod cli;
use self::cli::Cli;

mod logging;
use self::logging::initialize_logging;

mod server;

/// A generic error.
pub type GenericError = anyhow::Error;

#[tokio::main]
async fn main() {
    if let Err(e) = initialize_logging() {
        eprintln!("FATAL: failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => info!("exemplar-emitter stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<(), GenericError> {
    info!("exemplar-emitter starting...");

    let config = cli.emitter_config().context("Invalid configuration.")?;
    let registry = Arc::new(
        MetricsRegistry::from_config(&config)
            .context("Invalid configuration.")?
            .with_build_info(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
    );

    let logger = build_logger(&cli, &config)?;
    let batcher = build_trace_batcher(&cli, &config)?;
    let emission_loop = EmissionLoop::new(config, Arc::clone(&registry), logger, batcher)
        .context("Invalid configuration.")?;

    let cancel = CancellationToken::new();
    spawn_signal_handlers(cancel.clone()).context("Failed to configure signal handlers.")?;

    let listener = TcpListener::bind(cli.listen_address)
        .await
        .with_context(|| format!("Failed to bind to {}.", cli.listen_address))?;

    info!("exemplar-emitter started: listening on {}", cli.listen_address);

    let loop_cancel = cancel.clone();
    let loop_handle = tokio::spawn(async move {
        let result = emission_loop.run(loop_cancel.clone()).await;

        // A failed loop takes the server down with it.
        loop_cancel.cancel();
        result
    });

    let server_result = server::serve(listener, registry, cancel.clone()).await;
    cancel.cancel();

    let loop_result = loop_handle.await.context("Emission loop task failed.")?;
    server_result.context("Metrics server failed.")?;
    loop_result.context("Emission loop failed.")
}

fn build_logger(cli: &Cli, config: &EmitterConfig) -> Result<CorrelatedLogger, GenericError> {
    let local = JsonLinesSink::stdout_and_file(&cli.log_file)
        .with_context(|| format!("Failed to open log file '{}'.", cli.log_file.display()))?;
    let mut logger = CorrelatedLogger::new(config.correlation_label.clone(), config.application.clone(), local)
        .with_failure_policy(config.log_failure_policy);

    if let Some(endpoint) = cli.loki_endpoint() {
        let loki = LokiSink::new(endpoint, cli.remote_settings()).context("Failed to create Loki sink.")?;
        info!(url = loki.url(), "Pushing correlated log records to Loki.");
        logger = logger.with_remote(loki);
    }

    Ok(logger)
}

fn build_trace_batcher(cli: &Cli, config: &EmitterConfig) -> Result<Option<TraceBatcher>, GenericError> {
    if config.trace_shape.is_none() {
        info!("Trace building disabled. Correlation identifiers will be random integers.");
        return Ok(None);
    }

    let exporter: Arc<dyn SpanExporter> = match cli.trace_endpoint() {
        Some(endpoint) => {
            let exporter = OtlpHttpSpanExporter::new(endpoint, &config.application, cli.remote_settings())
                .context("Failed to create OTLP trace exporter.")?;
            info!(url = exporter.url(), "Sending traces to OTLP collector.");
            Arc::new(exporter)
        }
        None => {
            let exporter = FileSpanExporter::create(&cli.trace_file)
                .with_context(|| format!("Failed to create trace file '{}'.", cli.trace_file.display()))?;
            info!(path = %exporter.path().display(), "Writing traces to file.");
            Arc::new(exporter)
        }
    };

    Ok(Some(TraceBatcher::spawn(exporter, cli.batch_config())))
}

fn spawn_signal_handlers(cancel: CancellationToken) -> Result<(), GenericError> {
    let mut sigint_handler = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler.")?;
    let mut sigterm_handler = signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler.")?;

    tokio::spawn(async move {
        select! {
            _ = sigint_handler.recv() => {
                info!("Received SIGINT, shutting down...");
            }
            _ = sigterm_handler.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            _ = cancel.cancelled() => return,
        }

        cancel.cancel();
    });

    Ok(())
}
