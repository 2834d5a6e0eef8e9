//! Correlated structured logging.

use std::{fmt, str::FromStr};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{ser::SerializeMap as _, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::warn;

use crate::{config::CorrelationLabel, correlation::CorrelationId, error::ExportError};

mod loki;
pub use self::loki::LokiSink;

mod sink;
pub use self::sink::{JsonLinesSink, LogSink};

/// Keys written by every record, which neither caller fields nor the correlation label may overwrite.
pub(crate) const RESERVED_KEYS: [&str; 4] = ["timestamp", "level", "msg", "application"];

/// Prefix applied to caller fields whose key collides with a reserved key.
const COLLISION_PREFIX: &str = "fields.";

/// How to react when a correlated log record cannot be delivered.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ExportFailurePolicy {
    /// Log a warning and keep going.
    #[default]
    Continue,

    /// Propagate the error, stopping the emission loop.
    Fatal,
}

impl FromStr for ExportFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continue" => Ok(Self::Continue),
            "fatal" => Ok(Self::Fatal),
            other => Err(format!(
                "invalid failure policy '{}': expected 'continue' or 'fatal'",
                other
            )),
        }
    }
}

/// Severity of a log record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Informational.
    Info,

    /// Something unexpected, but recoverable.
    Warn,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warn => "warn",
        })
    }
}

/// A structured log record carrying a correlation identifier.
///
/// Serialized as a single flat JSON object. The correlation identifier is keyed by the correlation label, so the same
/// label name joins the record to the histogram exemplar and the root span.
#[derive(Clone, Debug)]
pub struct LogRecord {
    timestamp: DateTime<Utc>,
    level: LogLevel,
    message: String,
    label: CorrelationLabel,
    correlation_id: CorrelationId,
    application: String,
    fields: Map<String, Value>,
}

impl LogRecord {
    /// Returns the time the record was created.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the record severity.
    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Returns the message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the label the correlation identifier is keyed by.
    pub fn label(&self) -> &CorrelationLabel {
        &self.label
    }

    /// Returns the correlation identifier.
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Returns the application name.
    pub fn application(&self) -> &str {
        &self.application
    }

    /// Returns the caller-provided fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl Serialize for LogRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(
            "timestamp",
            &self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        )?;
        map.serialize_entry("level", &self.level)?;
        map.serialize_entry("msg", &self.message)?;
        map.serialize_entry(self.label.as_str(), &self.correlation_id)?;
        map.serialize_entry("application", &self.application)?;

        for (key, value) in &self.fields {
            if RESERVED_KEYS.contains(&key.as_str()) || key == self.label.as_str() {
                map.serialize_entry(&format!("{}{}", COLLISION_PREFIX, key), value)?;
            } else {
                map.serialize_entry(key, value)?;
            }
        }

        map.end()
    }
}

/// Emits structured log records that carry a correlation identifier.
///
/// Every record is written to the local sink and then, if one is configured, to the remote sink. A failure in either is
/// handled according to the configured [`ExportFailurePolicy`].
pub struct CorrelatedLogger {
    label: CorrelationLabel,
    application: String,
    local: Box<dyn LogSink>,
    remote: Option<Box<dyn LogSink>>,
    failure_policy: ExportFailurePolicy,
}

impl CorrelatedLogger {
    /// Creates a new `CorrelatedLogger` writing to the given local sink.
    pub fn new<S>(label: CorrelationLabel, application: impl Into<String>, local: S) -> Self
    where
        S: LogSink + 'static,
    {
        Self {
            label,
            application: application.into(),
            local: Box::new(local),
            remote: None,
            failure_policy: ExportFailurePolicy::default(),
        }
    }

    /// Sets the remote sink that records are forwarded to after the local sink.
    pub fn with_remote<S>(mut self, remote: S) -> Self
    where
        S: LogSink + 'static,
    {
        self.remote = Some(Box::new(remote));
        self
    }

    /// Sets the policy applied when a record cannot be delivered.
    pub fn with_failure_policy(mut self, failure_policy: ExportFailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// Creates a log record without emitting it.
    pub fn record(
        &self, level: LogLevel, correlation_id: &CorrelationId, fields: Map<String, Value>, message: &str,
    ) -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
            label: self.label.clone(),
            correlation_id: correlation_id.clone(),
            application: self.application.clone(),
            fields,
        }
    }

    /// Emits a record carrying the given correlation identifier.
    ///
    /// # Errors
    ///
    /// If the record could not be delivered and the failure policy is [`ExportFailurePolicy::Fatal`], an error is
    /// returned. Under [`ExportFailurePolicy::Continue`], delivery failures are logged and `Ok(())` is returned.
    pub async fn emit(
        &self, level: LogLevel, correlation_id: &CorrelationId, fields: Map<String, Value>, message: &str,
    ) -> Result<(), ExportError> {
        let record = self.record(level, correlation_id, fields, message);
        self.write(&record).await
    }

    /// Writes an already-built record to every configured sink.
    ///
    /// # Errors
    ///
    /// If the record could not be delivered and the failure policy is [`ExportFailurePolicy::Fatal`], an error is
    /// returned.
    pub async fn write(&self, record: &LogRecord) -> Result<(), ExportError> {
        if let Err(e) = self.local.write(record).await {
            self.handle_failure(self.local.name(), record, e)?;
        }

        if let Some(remote) = &self.remote {
            if let Err(e) = remote.write(record).await {
                self.handle_failure(remote.name(), record, e)?;
            }
        }

        Ok(())
    }

    fn handle_failure(&self, sink: &'static str, record: &LogRecord, error: ExportError) -> Result<(), ExportError> {
        match self.failure_policy {
            ExportFailurePolicy::Continue => {
                warn!(
                    sink,
                    correlation_id = %record.correlation_id,
                    error = %error,
                    "Failed to deliver correlated log record. Continuing."
                );
                Ok(())
            }
            ExportFailurePolicy::Fatal => Err(error),
        }
    }
}
