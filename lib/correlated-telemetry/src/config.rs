//! Emitter configuration.

use std::{fmt, str::FromStr, time::Duration};

use snafu::ensure;

use crate::{
    buckets::BucketPlan,
    error::{
        ConfigurationError, InvalidCorrelationLabel, InvalidDomain, InvalidMean, InvalidMetricName, ZeroBucketCount,
        ZeroInterval,
    },
    logger::{ExportFailurePolicy, RESERVED_KEYS},
    trace::{SpanDelays, TraceShape},
};

/// Default number of histogram buckets.
pub const DEFAULT_BUCKET_COUNT: usize = 20;

/// Default correlation label.
pub const DEFAULT_CORRELATION_LABEL: &str = "traceId";

/// Default interval between emission cycles.
pub const DEFAULT_EMIT_INTERVAL: Duration = Duration::from_millis(500);

/// Default upper bound for the workload size derived from a sample.
pub const DEFAULT_MAX_WORKLOAD_SIZE: u32 = 20;

/// Default histogram metric name.
pub const DEFAULT_METRIC_NAME: &str = "demo_rpc_durations_histogram_seconds";

/// Parameters of the normal distribution that values are sampled from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DistributionConfig {
    /// The mean of the distribution.
    pub mean: f64,

    /// The spread of the distribution, used as its standard deviation.
    pub domain: f64,
}

impl DistributionConfig {
    /// Creates a validated `DistributionConfig`.
    ///
    /// # Errors
    ///
    /// If `domain` is not a finite value greater than zero, or `mean` is not finite, an error is returned.
    pub fn new(mean: f64, domain: f64) -> Result<Self, ConfigurationError> {
        let config = Self { mean, domain };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// If `domain` is not a finite value greater than zero, or `mean` is not finite, an error is returned.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        ensure!(self.mean.is_finite(), InvalidMean { mean: self.mean });
        ensure!(
            self.domain.is_finite() && self.domain > 0.0,
            InvalidDomain { domain: self.domain }
        );
        Ok(())
    }
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self { mean: 0.0, domain: 5.0 }
    }
}

/// The label name used to carry the correlation identifier.
///
/// The same label name is used for the histogram exemplar, the log record field, the root span attribute, and the
/// remote log stream label. Keeping it in one validated value is what lets external tools join across all three
/// signals.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CorrelationLabel(String);

impl CorrelationLabel {
    /// Creates a new `CorrelationLabel`.
    ///
    /// # Errors
    ///
    /// If the label does not match `[a-zA-Z_][a-zA-Z0-9_]*`, or is one of the keys every log record already carries
    /// (`timestamp`, `level`, `msg`, `application`), an error is returned.
    pub fn new<S: Into<String>>(label: S) -> Result<Self, ConfigurationError> {
        let label = label.into();
        ensure!(
            is_valid_label_name(&label) && !RESERVED_KEYS.contains(&label.as_str()),
            InvalidCorrelationLabel { label }
        );
        Ok(Self(label))
    }

    /// Returns the label name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationLabel {
    fn default() -> Self {
        Self(DEFAULT_CORRELATION_LABEL.to_string())
    }
}

impl fmt::Display for CorrelationLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CorrelationLabel {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Which value is recorded into the histogram each cycle.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ObservedValue {
    /// The raw sampled value.
    ///
    /// The bucket plan is derived from the distribution parameters, so this keeps observations inside the planned
    /// range.
    #[default]
    Sample,

    /// The wall-clock duration of the cycle, in seconds.
    Duration,
}

impl FromStr for ObservedValue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sample" => Ok(Self::Sample),
            "duration" => Ok(Self::Duration),
            other => Err(format!("invalid observed value '{}': expected 'sample' or 'duration'", other)),
        }
    }
}

/// Full emitter configuration.
///
/// Built once at start-up. [`EmitterConfig::validate`] must pass before any component is constructed from it.
#[derive(Clone, Debug)]
pub struct EmitterConfig {
    /// Distribution parameters.
    pub distribution: DistributionConfig,

    /// Number of histogram bucket boundaries.
    pub bucket_count: usize,

    /// Name of the exemplar-linked histogram.
    pub metric_name: String,

    /// Label carrying the correlation identifier across metrics, traces, and logs.
    pub correlation_label: CorrelationLabel,

    /// Application name attached to log records and remote log streams.
    pub application: String,

    /// Shape of the trace built each cycle.
    ///
    /// When `None`, no trace is built and each cycle falls back to a random integer correlation identifier.
    pub trace_shape: Option<TraceShape>,

    /// Simulated latencies used when building traces.
    pub span_delays: SpanDelays,

    /// Upper bound for the workload size derived from a sample.
    pub max_workload_size: u32,

    /// Which value is recorded into the histogram.
    pub observed_value: ObservedValue,

    /// Delay between emission cycles.
    pub emit_interval: Duration,

    /// How to react when a correlated log record cannot be delivered.
    pub log_failure_policy: ExportFailurePolicy,
}

impl EmitterConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// If any setting is invalid, an error is returned.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.distribution.validate()?;
        ensure!(self.bucket_count > 0, ZeroBucketCount);
        ensure!(
            is_valid_metric_name(&self.metric_name),
            InvalidMetricName {
                name: self.metric_name.clone()
            }
        );
        ensure!(!self.emit_interval.is_zero(), ZeroInterval);
        BucketPlan::plan(&self.distribution, self.bucket_count)?;
        Ok(())
    }
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            distribution: DistributionConfig::default(),
            bucket_count: DEFAULT_BUCKET_COUNT,
            metric_name: DEFAULT_METRIC_NAME.to_string(),
            correlation_label: CorrelationLabel::default(),
            application: "exemplar-emitter".to_string(),
            trace_shape: Some(TraceShape::default()),
            span_delays: SpanDelays::default(),
            max_workload_size: DEFAULT_MAX_WORKLOAD_SIZE,
            observed_value: ObservedValue::default(),
            emit_interval: DEFAULT_EMIT_INTERVAL,
            log_failure_policy: ExportFailurePolicy::default(),
        }
    }
}

fn is_valid_label_name(name: &str) -> bool {
    // Matches a regular expression of [a-zA-Z_][a-zA-Z0-9_]*.
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

fn is_valid_metric_name(name: &str) -> bool {
    // Matches a regular expression of [a-zA-Z_:][a-zA-Z0-9_:]*.
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_rejects_bad_domain() {
        assert!(matches!(
            DistributionConfig::new(0.0, 0.0),
            Err(ConfigurationError::InvalidDomain { .. })
        ));
        assert!(matches!(
            DistributionConfig::new(0.0, -2.5),
            Err(ConfigurationError::InvalidDomain { .. })
        ));
        assert!(matches!(
            DistributionConfig::new(0.0, f64::NAN),
            Err(ConfigurationError::InvalidDomain { .. })
        ));
        assert!(matches!(
            DistributionConfig::new(f64::INFINITY, 1.0),
            Err(ConfigurationError::InvalidMean { .. })
        ));
        assert!(DistributionConfig::new(100.0, 10.0).is_ok());
    }

    #[test]
    fn correlation_label_validation() {
        assert!(CorrelationLabel::new("traceId").is_ok());
        assert!(CorrelationLabel::new("_request_id2").is_ok());
        assert!(CorrelationLabel::new("").is_err());
        assert!(CorrelationLabel::new("2fast").is_err());
        assert!(CorrelationLabel::new("trace-id").is_err());
        assert!(CorrelationLabel::new("trace.id").is_err());
    }

    #[test]
    fn correlation_label_rejects_record_keys() {
        for key in ["timestamp", "level", "msg", "application"] {
            assert!(matches!(
                CorrelationLabel::new(key),
                Err(ConfigurationError::InvalidCorrelationLabel { label }) if label == key
            ));
        }
        assert!(CorrelationLabel::new("Level").is_ok());
    }

    #[test]
    fn emitter_config_validation() {
        assert!(EmitterConfig::default().validate().is_ok());

        let config = EmitterConfig {
            bucket_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigurationError::ZeroBucketCount)));

        let config = EmitterConfig {
            emit_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigurationError::ZeroInterval)));

        let config = EmitterConfig {
            metric_name: "rpc.durations".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidMetricName { .. })
        ));
    }

    #[test]
    fn observed_value_parse() {
        assert_eq!("sample".parse::<ObservedValue>(), Ok(ObservedValue::Sample));
        assert_eq!("duration".parse::<ObservedValue>(), Ok(ObservedValue::Duration));
        assert!("elapsed".parse::<ObservedValue>().is_err());
    }
}
