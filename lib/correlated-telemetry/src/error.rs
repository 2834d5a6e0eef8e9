//! Error types.

use std::time::Duration;

use snafu::Snafu;

/// A configuration error.
///
/// Configuration errors are only ever raised at start-up, and are always fatal: the process must not begin emitting
/// telemetry with a configuration that produced one.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum ConfigurationError {
    /// The distribution domain (standard deviation) was zero, negative, or not a finite number.
    #[snafu(display("distribution domain must be a finite value greater than zero (got {})", domain))]
    InvalidDomain {
        /// The rejected domain.
        domain: f64,
    },

    /// The distribution mean was not a finite number.
    #[snafu(display("distribution mean must be a finite value (got {})", mean))]
    InvalidMean {
        /// The rejected mean.
        mean: f64,
    },

    /// The bucket count was zero.
    #[snafu(display("bucket count must be greater than zero"))]
    ZeroBucketCount,

    /// The bucket boundaries planned for the distribution are not finite and strictly increasing.
    ///
    /// This happens when the spread is too small to be resolved at the magnitude of the mean, or so large that the
    /// boundaries overflow.
    #[snafu(display(
        "cannot plan {} distinct finite bucket boundaries for mean {} and domain {}",
        count,
        mean,
        domain
    ))]
    DegenerateBucketPlan {
        /// The distribution mean.
        mean: f64,

        /// The distribution domain.
        domain: f64,

        /// The requested bucket count.
        count: usize,
    },

    /// The correlation label is not a valid metric label name, or collides with a reserved log record key.
    #[snafu(display(
        "correlation label '{}' is not a valid label name (must match [a-zA-Z_][a-zA-Z0-9_]* and not be one of \
         timestamp, level, msg, or application)",
        label
    ))]
    InvalidCorrelationLabel {
        /// The rejected label.
        label: String,
    },

    /// The metric name is not a valid metric name.
    #[snafu(display("metric name '{}' is not a valid metric name (must match [a-zA-Z_:][a-zA-Z0-9_:]*)", name))]
    InvalidMetricName {
        /// The rejected name.
        name: String,
    },

    /// The emission interval was zero.
    #[snafu(display("emission interval must be greater than zero"))]
    ZeroInterval,
}

/// An export error.
///
/// Export errors are raised when handing telemetry to a local or remote sink fails. They are scoped to a single
/// emission cycle, or a single trace batch, and never prevent subsequent cycles from running unless the configured
/// [`ExportFailurePolicy`][crate::logger::ExportFailurePolicy] says otherwise.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum ExportError {
    /// Writing to a local sink failed.
    #[snafu(display("failed to write to {}: {}", sink, source))]
    Io {
        /// The sink being written to.
        sink: &'static str,

        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Encoding the JSON payload failed.
    #[snafu(display("failed to encode {} payload: {}", sink, source))]
    Encode {
        /// The sink the payload was destined for.
        sink: &'static str,

        /// The underlying encoding error.
        source: serde_json::Error,
    },

    /// The request to a remote sink could not be completed.
    #[snafu(display("request to {} at '{}' failed: {}", sink, endpoint, source))]
    Transport {
        /// The sink being sent to.
        sink: &'static str,

        /// The remote endpoint.
        endpoint: String,

        /// The underlying transport error.
        source: reqwest::Error,
    },

    /// The remote sink did not respond within the configured deadline.
    #[snafu(display("request to {} at '{}' timed out after {:?}", sink, endpoint, timeout))]
    Timeout {
        /// The sink being sent to.
        sink: &'static str,

        /// The remote endpoint.
        endpoint: String,

        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The remote sink responded with a non-success status.
    #[snafu(display("{} at '{}' rejected payload with status {}", sink, endpoint, status))]
    Rejected {
        /// The sink being sent to.
        sink: &'static str,

        /// The remote endpoint.
        endpoint: String,

        /// The HTTP status returned.
        status: u16,
    },
}

impl ExportError {
    /// Returns `true` if retrying the export could plausibly succeed.
    ///
    /// Client errors (4xx other than 429) and local encoding errors are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Encode { .. } => false,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
            Self::Io { .. } | Self::Transport { .. } | Self::Timeout { .. } => true,
        }
    }
}

/// An emission loop error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum EmissionError {
    /// A correlated log record could not be delivered, and the failure policy is fatal.
    #[snafu(display("failed to deliver correlated log record for '{}': {}", correlation_id, source))]
    LogDelivery {
        /// The correlation identifier of the undelivered record.
        correlation_id: String,

        /// The underlying export error.
        source: ExportError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_retryability() {
        let rejected = |status| ExportError::Rejected {
            sink: "loki",
            endpoint: "http://localhost:3100".to_string(),
            status,
        };

        assert!(rejected(503).is_retryable());
        assert!(rejected(429).is_retryable());
        assert!(!rejected(400).is_retryable());
        assert!(!rejected(404).is_retryable());
    }

    #[test]
    fn configuration_error_display() {
        let err = ConfigurationError::InvalidDomain { domain: -1.0 };
        assert_eq!(
            err.to_string(),
            "distribution domain must be a finite value greater than zero (got -1)"
        );
    }
}
