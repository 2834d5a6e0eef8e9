//! Trace trees and their export.

use std::collections::BTreeMap;

use serde::Serialize;

mod batcher;
pub use self::batcher::{BatchConfig, TraceBatcher};

mod builder;
pub use self::builder::{BuiltTrace, PendingTrace, SpanDelays, TraceBuilder, TraceShape};

mod export;
pub use self::export::{FileSpanExporter, OtlpHttpSpanExporter, SpanExporter};

/// Index of a span within its trace.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct SpanIndex(usize);

impl SpanIndex {
    /// Index of the root span.
    pub const ROOT: SpanIndex = SpanIndex(0);

    /// Returns the raw index.
    pub fn get(self) -> usize {
        self.0
    }
}

/// A timed unit of work within a trace.
#[derive(Clone, Debug, Serialize)]
pub struct SpanNode {
    name: String,
    span_id: u64,
    parent: Option<SpanIndex>,
    start_unix_nanos: u64,
    end_unix_nanos: u64,
    attributes: BTreeMap<String, String>,
}

impl SpanNode {
    /// Returns the span name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the 64-bit span identifier.
    pub fn span_id(&self) -> u64 {
        self.span_id
    }

    /// Returns the index of the parent span, or `None` for the root span.
    pub fn parent(&self) -> Option<SpanIndex> {
        self.parent
    }

    /// Returns the start time, in nanoseconds since the Unix epoch.
    pub fn start_unix_nanos(&self) -> u64 {
        self.start_unix_nanos
    }

    /// Returns the end time, in nanoseconds since the Unix epoch.
    pub fn end_unix_nanos(&self) -> u64 {
        self.end_unix_nanos
    }

    /// Returns the span attributes.
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Returns the value of the given attribute, if present.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// A tree of spans representing one emission cycle's simulated work.
///
/// Spans are stored in an arena in the order they were started, so the root span is always at index zero and every
/// span's parent appears before it.
#[derive(Clone, Debug, Serialize)]
pub struct Trace {
    #[serde(serialize_with = "serialize_trace_id")]
    trace_id: u128,
    spans: Vec<SpanNode>,
}

impl Trace {
    /// Returns the 128-bit trace identifier.
    pub fn trace_id(&self) -> u128 {
        self.trace_id
    }

    /// Returns the root span.
    pub fn root(&self) -> &SpanNode {
        &self.spans[SpanIndex::ROOT.0]
    }

    /// Returns all spans, in the order they were started.
    pub fn spans(&self) -> &[SpanNode] {
        &self.spans
    }

    /// Returns the span at the given index.
    pub fn span(&self, idx: SpanIndex) -> Option<&SpanNode> {
        self.spans.get(idx.0)
    }

    /// Returns the number of spans in the trace.
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Returns `true` if the trace has no spans.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Returns an iterator over the direct children of the given span.
    pub fn children(&self, parent: SpanIndex) -> impl Iterator<Item = (SpanIndex, &SpanNode)> + '_ {
        self.spans
            .iter()
            .enumerate()
            .filter(move |(_, span)| span.parent == Some(parent))
            .map(|(i, span)| (SpanIndex(i), span))
    }

    /// Checks the structural invariants of the trace.
    ///
    /// Returns `true` if there is exactly one root, every span ends no earlier than it starts, every parent precedes
    /// its children, and every child's interval falls within its parent's interval.
    pub fn validate_nesting(&self) -> bool {
        self.spans.iter().enumerate().all(|(i, span)| {
            if span.end_unix_nanos < span.start_unix_nanos {
                return false;
            }

            match span.parent {
                None => i == 0,
                Some(parent_idx) if parent_idx.0 < i => {
                    let parent = &self.spans[parent_idx.0];
                    parent.start_unix_nanos <= span.start_unix_nanos && span.end_unix_nanos <= parent.end_unix_nanos
                }
                Some(_) => false,
            }
        })
    }
}

fn serialize_trace_id<S>(trace_id: &u128, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&format!("{:032x}", trace_id))
}
