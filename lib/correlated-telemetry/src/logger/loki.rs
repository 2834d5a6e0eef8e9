use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use snafu::ResultExt as _;

use super::{LogRecord, LogSink};
use crate::{
    error::{Encode, ExportError},
    remote::{endpoint_url, HttpPoster, RemoteSettings},
};

const LOKI_PUSH_PATH: &str = "/loki/api/v1/push";

/// Pushes records to a Loki instance, one stream per correlation identifier.
///
/// Each stream is labelled with the correlation identifier, under the correlation label, and the application name.
pub struct LokiSink {
    poster: HttpPoster,
}

impl LokiSink {
    /// Creates a new `LokiSink`.
    ///
    /// `endpoint` may be a bare `host:port`, in which case plain HTTP is used. The push API path is appended if not
    /// already present.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be constructed, an error is returned.
    pub fn new(endpoint: &str, settings: RemoteSettings) -> Result<Self, ExportError> {
        let poster = HttpPoster::new("Loki", endpoint_url(endpoint, LOKI_PUSH_PATH), settings)?;
        Ok(Self { poster })
    }

    /// Returns the URL records are pushed to.
    pub fn url(&self) -> &str {
        self.poster.url()
    }
}

#[async_trait]
impl LogSink for LokiSink {
    fn name(&self) -> &'static str {
        "Loki"
    }

    async fn write(&self, record: &LogRecord) -> Result<(), ExportError> {
        let request = PushRequest::from_record(record)?;
        self.poster.post_json(&request).await
    }
}

#[derive(Serialize)]
struct PushRequest<'a> {
    streams: Vec<Stream<'a>>,
}

#[derive(Serialize)]
struct Stream<'a> {
    stream: BTreeMap<&'a str, &'a str>,
    values: Vec<[String; 2]>,
}

impl<'a> PushRequest<'a> {
    fn from_record(record: &'a LogRecord) -> Result<Self, ExportError> {
        let line = serde_json::to_string(record).context(Encode { sink: "Loki" })?;
        let timestamp_nanos = record.timestamp().timestamp_nanos_opt().unwrap_or_default();

        let stream = [
            (record.label().as_str(), record.correlation_id().as_str()),
            ("application", record.application()),
        ]
        .into_iter()
        .collect();

        Ok(Self {
            streams: vec![Stream {
                stream,
                values: vec![[timestamp_nanos.to_string(), line]],
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::*;
    use crate::{
        config::CorrelationLabel,
        correlation::CorrelationId,
        logger::{testing::CapturingSink, CorrelatedLogger, LogLevel},
    };

    #[test]
    fn push_payload() {
        let logger = CorrelatedLogger::new(CorrelationLabel::default(), "fibonacci-app", CapturingSink::default());
        let id = CorrelationId::from_trace_id(0xfeed);

        let mut fields = Map::new();
        fields.insert("answer".to_string(), json!(13));
        let record = logger.record(LogLevel::Info, &id, fields, "Completed calculation");

        let payload = serde_json::to_value(PushRequest::from_record(&record).unwrap()).unwrap();
        let stream = &payload["streams"][0];
        assert_eq!(stream["stream"]["traceId"], id.as_str());
        assert_eq!(stream["stream"]["application"], "fibonacci-app");

        let value = &stream["values"][0];
        let expected_ts = record.timestamp().timestamp_nanos_opt().unwrap().to_string();
        assert_eq!(value[0], expected_ts.as_str());

        let line = serde_json::from_str::<Value>(value[1].as_str().unwrap()).unwrap();
        assert_eq!(line["traceId"], id.as_str());
        assert_eq!(line["answer"], 13);
    }

    #[test]
    fn push_url() {
        let sink = LokiSink::new("loki:3100", RemoteSettings::default()).unwrap();
        assert_eq!(sink.url(), "http://loki:3100/loki/api/v1/push");
    }
}
