use std::{
    fs::File,
    io::{self, BufWriter, Write as _},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use opentelemetry_proto::tonic::{
    collector::trace::v1::ExportTraceServiceRequest,
    common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue},
    resource::v1::Resource,
    trace::v1::{span::SpanKind, ResourceSpans, ScopeSpans, Span},
};
use snafu::ResultExt as _;
use tokio::task::spawn_blocking;

use super::{SpanNode, Trace};
use crate::{
    error::{Encode, ExportError, Io},
    remote::{endpoint_url, HttpPoster, RemoteSettings},
};

const OTLP_TRACES_PATH: &str = "/v1/traces";
const SCOPE_NAME: &str = "exemplar-emitter";

/// A destination for completed traces.
#[async_trait]
pub trait SpanExporter: Send + Sync {
    /// Returns a short name for the exporter, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Exports a batch of traces.
    ///
    /// # Errors
    ///
    /// If the batch could not be delivered, an error is returned. The batch is not retained.
    async fn export(&self, batch: &[Trace]) -> Result<(), ExportError>;
}

/// Writes traces to a local file, one pretty-printed JSON document per trace.
pub struct FileSpanExporter {
    path: PathBuf,
    writer: Arc<Mutex<BufWriter<File>>>,
}

impl FileSpanExporter {
    /// Creates a new `FileSpanExporter`, truncating the file at `path` if it already exists.
    ///
    /// # Errors
    ///
    /// If the file cannot be created, an error is returned.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, ExportError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).context(Io { sink: "trace file" })?;

        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    /// Returns the path of the file being written to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SpanExporter for FileSpanExporter {
    fn name(&self) -> &'static str {
        "trace file"
    }

    async fn export(&self, batch: &[Trace]) -> Result<(), ExportError> {
        let mut payload = Vec::new();
        for trace in batch {
            serde_json::to_writer_pretty(&mut payload, trace).context(Encode { sink: "trace file" })?;
            payload.push(b'\n');
        }

        let writer = Arc::clone(&self.writer);
        spawn_blocking(move || {
            let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.write_all(&payload)?;
            writer.flush()
        })
        .await
        .unwrap_or_else(|e| Err(io::Error::other(e)))
        .context(Io { sink: "trace file" })
    }
}

/// Sends traces to an OTLP collector as protobuf over HTTP.
pub struct OtlpHttpSpanExporter {
    poster: HttpPoster,
    service_name: String,
}

impl OtlpHttpSpanExporter {
    /// Creates a new `OtlpHttpSpanExporter`.
    ///
    /// `endpoint` may be a bare `host:port`, in which case plain HTTP is used. The `/v1/traces` path is appended if
    /// not already present.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be constructed, an error is returned.
    pub fn new(endpoint: &str, service_name: &str, settings: RemoteSettings) -> Result<Self, ExportError> {
        let poster = HttpPoster::new("OTLP collector", endpoint_url(endpoint, OTLP_TRACES_PATH), settings)?;

        Ok(Self {
            poster,
            service_name: service_name.to_string(),
        })
    }

    /// Returns the URL traces are sent to.
    pub fn url(&self) -> &str {
        self.poster.url()
    }
}

#[async_trait]
impl SpanExporter for OtlpHttpSpanExporter {
    fn name(&self) -> &'static str {
        "OTLP collector"
    }

    async fn export(&self, batch: &[Trace]) -> Result<(), ExportError> {
        if batch.is_empty() {
            return Ok(());
        }

        let request = export_request(&self.service_name, batch);
        self.poster.post_protobuf(&request).await
    }
}

fn export_request(service_name: &str, batch: &[Trace]) -> ExportTraceServiceRequest {
    let spans = batch
        .iter()
        .flat_map(|trace| trace.spans().iter().map(move |span| otlp_span(trace, span)))
        .collect();

    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Some(Resource {
                attributes: vec![string_attribute("service.name", service_name)],
                ..Default::default()
            }),
            scope_spans: vec![ScopeSpans {
                scope: Some(InstrumentationScope {
                    name: SCOPE_NAME.to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    ..Default::default()
                }),
                spans,
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

fn otlp_span(trace: &Trace, span: &SpanNode) -> Span {
    // The root span has no parent, which OTLP represents as an empty identifier.
    let parent_span_id = span
        .parent()
        .and_then(|idx| trace.span(idx))
        .map(|parent| parent.span_id().to_be_bytes().to_vec())
        .unwrap_or_default();
    let kind = if span.parent().is_none() {
        SpanKind::Server
    } else {
        SpanKind::Internal
    };

    Span {
        trace_id: trace.trace_id().to_be_bytes().to_vec(),
        span_id: span.span_id().to_be_bytes().to_vec(),
        parent_span_id,
        name: span.name().to_string(),
        kind: kind as i32,
        start_time_unix_nano: span.start_unix_nanos(),
        end_time_unix_nano: span.end_unix_nanos(),
        attributes: span
            .attributes()
            .iter()
            .map(|(key, value)| string_attribute(key, value))
            .collect(),
        ..Default::default()
    }
}

fn string_attribute(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::StringValue(value.to_string())),
        }),
    }
}

#[cfg(test)]
mod tests {
    use prost::Message as _;
    use rand::{rngs::StdRng, SeedableRng as _};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        config::CorrelationLabel,
        trace::{SpanDelays, TraceBuilder, TraceShape},
    };

    async fn fan_out_trace(seed: u64) -> Trace {
        let mut rng = StdRng::seed_from_u64(seed);
        let builder = TraceBuilder::new(CorrelationLabel::default(), SpanDelays::none(), "Fibonacci");
        let (trace, _) = builder
            .build(TraceShape::FanOut, 0, &mut rng, &CancellationToken::new())
            .await
            .unwrap();
        trace
    }

    #[tokio::test]
    async fn otlp_request_shape() {
        let trace = fan_out_trace(3).await;
        let batch = [trace.clone()];
        let request = export_request("Fibonacci", &batch);

        // What the collector receives is the encoded request, so check the shape after decoding it.
        let request = ExportTraceServiceRequest::decode(request.encode_to_vec().as_slice()).unwrap();
        assert_eq!(request.resource_spans.len(), 1);

        let resource_spans = &request.resource_spans[0];
        let service_name = &resource_spans.resource.as_ref().unwrap().attributes[0];
        assert_eq!(service_name.key, "service.name");
        assert_eq!(
            service_name.value.as_ref().and_then(|v| v.value.clone()),
            Some(any_value::Value::StringValue("Fibonacci".to_string()))
        );

        let spans = &resource_spans.scope_spans[0].spans;
        assert_eq!(spans.len(), 4);

        let trace_id = trace.trace_id().to_be_bytes();
        assert!(spans.iter().all(|span| span.trace_id == trace_id));

        let root = &spans[0];
        assert_eq!(root.kind(), SpanKind::Server);
        assert!(root.parent_span_id.is_empty());
        assert_eq!(root.span_id.len(), 8);
        assert_eq!(root.span_id, trace.root().span_id().to_be_bytes());

        assert_eq!(spans[1].parent_span_id, root.span_id);
        assert_eq!(spans[1].kind(), SpanKind::Internal);
        assert!(spans.iter().all(|span| span.end_time_unix_nano >= span.start_time_unix_nano));

        let label = trace.root().attribute("traceId").unwrap();
        assert!(root.attributes.iter().any(|kv| kv.key == "traceId"
            && kv.value.as_ref().and_then(|v| v.value.clone())
                == Some(any_value::Value::StringValue(label.to_string()))));
    }

    #[tokio::test]
    async fn file_exporter_writes_every_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traces.txt");
        let exporter = FileSpanExporter::create(&path).unwrap();

        let batch = [fan_out_trace(5).await, fan_out_trace(6).await];
        exporter.export(&batch).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        for trace in &batch {
            assert!(contents.contains(&format!("{:032x}", trace.trace_id())));
        }

        let documents = serde_json::Deserializer::from_str(&contents)
            .into_iter::<serde_json::Value>()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0]["spans"].as_array().unwrap().len(), 4);
    }
}
