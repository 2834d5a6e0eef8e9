use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::{Parser, ValueEnum};
use correlated_telemetry::{
    config::{CorrelationLabel, DistributionConfig, ObservedValue, DEFAULT_METRIC_NAME},
    error::ConfigurationError,
    logger::ExportFailurePolicy,
    trace::{BatchConfig, SpanDelays, TraceShape},
    EmitterConfig, RemoteSettings,
};

/// Continuously emits synthetic metrics, traces, and logs that share a correlation identifier.
#[derive(Clone, Debug, Parser)]
#[command(about)]
pub struct Cli {
    /// Address to serve metrics on.
    ///
    /// A bare `:port` listens on all interfaces.
    #[arg(long = "listen-address", env = "EMITTER_LISTEN_ADDRESS", default_value = ":8080", value_parser = parse_listen_address)]
    pub listen_address: SocketAddr,

    /// Spread of the sampled distribution, used as its standard deviation.
    #[arg(long = "normal.domain", env = "EMITTER_NORMAL_DOMAIN", default_value_t = 5.0)]
    pub normal_domain: f64,

    /// Mean of the sampled distribution.
    #[arg(long = "normal.mean", env = "EMITTER_NORMAL_MEAN", default_value_t = 0.0, allow_negative_numbers = true)]
    pub normal_mean: f64,

    /// File that correlated log records are appended to, in addition to standard output.
    #[arg(long = "log.file", env = "EMITTER_LOG_FILE", default_value = "logs.txt")]
    pub log_file: PathBuf,

    /// File that traces are written to when no trace endpoint is configured.
    #[arg(
        long = "trace.file",
        alias = "trace.logFile",
        env = "EMITTER_TRACE_FILE",
        default_value = "traces.txt"
    )]
    pub trace_file: PathBuf,

    /// OTLP/HTTP collector endpoint to send traces to, such as `localhost:4318`.
    ///
    /// When empty, traces are written to the trace file instead.
    #[arg(long = "trace.endpoint", env = "EMITTER_TRACE_ENDPOINT", default_value = "")]
    pub trace_endpoint: String,

    /// Shape of the trace built each cycle.
    #[arg(long = "trace.shape", env = "EMITTER_TRACE_SHAPE", value_enum, default_value_t = TraceShapeArg::Fibonacci)]
    pub trace_shape: TraceShapeArg,

    /// Delay between emission cycles.
    #[arg(long = "emit.interval", env = "EMITTER_EMIT_INTERVAL", default_value = "500ms", value_parser = parse_duration)]
    pub emit_interval: Duration,

    /// Number of histogram bucket boundaries.
    #[arg(long = "buckets.count", env = "EMITTER_BUCKETS_COUNT", default_value_t = 20)]
    pub buckets_count: usize,

    /// Label carrying the correlation identifier across metrics, traces, and logs.
    #[arg(long = "correlation.label", env = "EMITTER_CORRELATION_LABEL", default_value = "traceId")]
    pub correlation_label: String,

    /// Application name attached to log records and used as the trace service name.
    #[arg(long = "application", env = "EMITTER_APPLICATION", default_value = "exemplar-emitter")]
    pub application: String,

    /// Loki endpoint to push correlated log records to, such as `localhost:3100`.
    #[arg(long = "loki.endpoint", env = "EMITTER_LOKI_ENDPOINT")]
    pub loki_endpoint: Option<String>,

    /// Deadline for each request to a remote collector.
    #[arg(long = "export.timeout", env = "EMITTER_EXPORT_TIMEOUT", default_value = "5s", value_parser = parse_duration)]
    pub export_timeout: Duration,

    /// Number of retries for failed requests to a remote collector.
    #[arg(long = "export.retries", env = "EMITTER_EXPORT_RETRIES", default_value_t = 3)]
    pub export_retries: usize,

    /// How to react when a correlated log record cannot be delivered: `continue` or `fatal`.
    #[arg(long = "export.failure-policy", env = "EMITTER_EXPORT_FAILURE_POLICY", default_value = "continue")]
    pub export_failure_policy: ExportFailurePolicy,

    /// Upper bound for the workload size derived from each sample.
    #[arg(long = "workload.max-size", env = "EMITTER_WORKLOAD_MAX_SIZE", default_value_t = 20)]
    pub workload_max_size: u32,

    /// Which value is recorded into the histogram: `sample` or `duration`.
    #[arg(long = "observe", env = "EMITTER_OBSERVE", default_value = "sample")]
    pub observe: ObservedValue,

    /// Name of the exemplar-linked histogram.
    #[arg(long = "metric.name", env = "EMITTER_METRIC_NAME", default_value = DEFAULT_METRIC_NAME)]
    pub metric_name: String,
}

/// Trace shape selection, including the option of building no trace at all.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum TraceShapeArg {
    /// One span per invocation of a naive recursive fibonacci computation.
    Fibonacci,

    /// A fixed tree of four spans.
    FanOut,

    /// No trace. Correlation identifiers are random integers.
    None,
}

impl TraceShapeArg {
    fn into_trace_shape(self) -> Option<TraceShape> {
        match self {
            Self::Fibonacci => Some(TraceShape::Fibonacci),
            Self::FanOut => Some(TraceShape::FanOut),
            Self::None => None,
        }
    }
}

impl Cli {
    /// Builds the validated emitter configuration.
    pub fn emitter_config(&self) -> Result<EmitterConfig, ConfigurationError> {
        let config = EmitterConfig {
            distribution: DistributionConfig::new(self.normal_mean, self.normal_domain)?,
            bucket_count: self.buckets_count,
            metric_name: self.metric_name.clone(),
            correlation_label: CorrelationLabel::new(self.correlation_label.clone())?,
            application: self.application.clone(),
            trace_shape: self.trace_shape.into_trace_shape(),
            span_delays: SpanDelays::default(),
            max_workload_size: self.workload_max_size,
            observed_value: self.observe,
            emit_interval: self.emit_interval,
            log_failure_policy: self.export_failure_policy,
        };
        config.validate()?;

        Ok(config)
    }

    /// Returns the settings for requests to remote collectors.
    pub fn remote_settings(&self) -> RemoteSettings {
        RemoteSettings {
            timeout: self.export_timeout,
            max_retries: self.export_retries,
            ..Default::default()
        }
    }

    /// Returns the trace batching settings.
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig::default()
    }

    /// Returns the OTLP endpoint, if one is configured.
    pub fn trace_endpoint(&self) -> Option<&str> {
        Some(self.trace_endpoint.trim()).filter(|endpoint| !endpoint.is_empty())
    }

    /// Returns the Loki endpoint, if one is configured.
    pub fn loki_endpoint(&self) -> Option<&str> {
        self.loki_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
    }
}

fn parse_listen_address(s: &str) -> Result<SocketAddr, String> {
    let s = s.trim();
    match s.strip_prefix(':') {
        Some(port) => port
            .parse::<u16>()
            .map(|port| SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
            .map_err(|e| format!("invalid port '{}': {}", port, e)),
        None => s
            .parse::<SocketAddr>()
            .map_err(|e| format!("invalid listen address '{}': {}", s, e)),
    }
}

/// Parses a duration such as `500ms`, `2s`, or `1m`.
///
/// A bare number is interpreted as milliseconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(s.len());
    let (value, unit) = s.split_at(split);

    let value = value
        .parse::<f64>()
        .map_err(|_| format!("invalid duration '{}': expected a number followed by a unit", s))?;
    let seconds = match unit.trim() {
        "ns" => value / 1e9,
        "us" | "µs" => value / 1e6,
        "" | "ms" => value / 1e3,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("invalid duration unit '{}' in '{}'", other, s)),
    };

    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration '{}': {}", s, e))
}
