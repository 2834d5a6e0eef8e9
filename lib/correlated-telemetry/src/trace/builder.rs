use std::{collections::BTreeMap, future::Future, pin::Pin, str::FromStr, time::Duration};

use quanta::{Clock, Instant};
use rand::{rngs::StdRng, Rng, SeedableRng as _};
use tokio_util::sync::CancellationToken;

use super::{SpanIndex, SpanNode, Trace};
use crate::{
    cancel::{sleep_unless_cancelled, Cancelled},
    config::CorrelationLabel,
    correlation::CorrelationId,
};

type SpanFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, Cancelled>> + Send + 'a>>;

/// The shape of the trace built each emission cycle.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TraceShape {
    /// One span per invocation of a naive recursive fibonacci computation.
    ///
    /// The recursion depth is the workload size derived from the sampled value, so the number of spans grows
    /// exponentially with it. This generates traces of variable cardinality.
    #[default]
    Fibonacci,

    /// Exactly one root, two children, and one grandchild, each with a fixed delay.
    FanOut,
}

impl FromStr for TraceShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fibonacci" | "recursive" => Ok(Self::Fibonacci),
            "fan-out" | "fanout" | "fan_out" => Ok(Self::FanOut),
            other => Err(format!(
                "invalid trace shape '{}': expected 'fibonacci' or 'fan-out'",
                other
            )),
        }
    }
}

/// Simulated latencies applied while building traces.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpanDelays {
    /// Delay within every fibonacci span.
    pub fibonacci: Duration,

    /// Delay within the fan-out root span, before its children start.
    pub root: Duration,

    /// Delay within the first fan-out child.
    pub first_child: Duration,

    /// Delay within the second fan-out child, before the grandchild starts.
    pub second_child: Duration,

    /// Delay within the fan-out grandchild.
    pub grandchild: Duration,
}

impl SpanDelays {
    /// Returns a set of delays that are all zero.
    pub const fn none() -> Self {
        Self {
            fibonacci: Duration::ZERO,
            root: Duration::ZERO,
            first_child: Duration::ZERO,
            second_child: Duration::ZERO,
            grandchild: Duration::ZERO,
        }
    }
}

impl Default for SpanDelays {
    fn default() -> Self {
        Self {
            fibonacci: Duration::from_millis(10),
            root: Duration::from_millis(50),
            first_child: Duration::from_millis(100),
            second_child: Duration::from_millis(75),
            grandchild: Duration::from_millis(30),
        }
    }
}

/// Builds trace trees that simulate nested work.
///
/// Spans are started and ended in strict LIFO order: a span is only ended once every span started after it has been
/// ended, so a parent's interval always contains its children's intervals.
#[derive(Clone)]
pub struct TraceBuilder {
    clock: Clock,
    delays: SpanDelays,
    label: CorrelationLabel,
    base_attributes: BTreeMap<String, String>,
}

impl TraceBuilder {
    /// Creates a new `TraceBuilder`.
    ///
    /// Every span carries the `environment`, `service.name`, and `job` attributes. The root span additionally carries
    /// the correlation identifier under `label`.
    pub fn new(label: CorrelationLabel, delays: SpanDelays, service_name: &str) -> Self {
        let base_attributes = [
            ("environment", "demo"),
            ("service.name", service_name),
            ("job", "warp-speed-debugging"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            clock: Clock::new(),
            delays,
            label,
            base_attributes,
        }
    }

    /// Sets the clock used to timestamp spans.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Starts a new trace, minting its trace identifier.
    ///
    /// The correlation identifier is available from the returned [`PendingTrace`] before any span work happens.
    pub fn start_trace<R: Rng>(&self, rng: &mut R) -> PendingTrace {
        let trace_id = loop {
            let id: u128 = rng.random();
            if id != 0 {
                break id;
            }
        };

        let anchor_unix_nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .and_then(|nanos| u64::try_from(nanos).ok())
            .unwrap_or_default();

        PendingTrace {
            correlation_id: CorrelationId::from_trace_id(trace_id),
            label: self.label.clone(),
            delays: self.delays,
            base_attributes: self.base_attributes.clone(),
            recorder: SpanRecorder {
                anchor_instant: self.clock.now(),
                clock: self.clock.clone(),
                anchor_unix_nanos,
                rng: StdRng::from_rng(rng),
                trace_id,
                spans: Vec::new(),
                open: Vec::new(),
            },
        }
    }

    /// Builds a complete trace of the given shape.
    ///
    /// `workload_size` is the recursion depth for [`TraceShape::Fibonacci`], and is ignored for
    /// [`TraceShape::FanOut`].
    ///
    /// # Errors
    ///
    /// If cancellation is requested before the trace is complete, the partial trace is discarded and an error is
    /// returned.
    pub async fn build<R: Rng>(
        &self, shape: TraceShape, workload_size: u32, rng: &mut R, cancel: &CancellationToken,
    ) -> Result<(Trace, CorrelationId), Cancelled> {
        let built = self.start_trace(rng).run(shape, workload_size, cancel).await?;
        Ok((built.trace, built.correlation_id))
    }
}

/// A completed trace.
#[derive(Clone, Debug)]
pub struct BuiltTrace {
    /// The trace tree.
    pub trace: Trace,

    /// The correlation identifier carried by the root span.
    pub correlation_id: CorrelationId,

    /// The result of the simulated computation, if the shape computes one.
    pub result: Option<u64>,
}

/// A trace whose identifier has been minted, but whose spans have not yet been built.
pub struct PendingTrace {
    correlation_id: CorrelationId,
    label: CorrelationLabel,
    delays: SpanDelays,
    base_attributes: BTreeMap<String, String>,
    recorder: SpanRecorder,
}

impl PendingTrace {
    /// Returns the correlation identifier that the root span will carry.
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Builds the spans for the given shape.
    ///
    /// # Errors
    ///
    /// If cancellation is requested before the trace is complete, the partial trace is discarded and an error is
    /// returned.
    pub async fn run(
        mut self, shape: TraceShape, workload_size: u32, cancel: &CancellationToken,
    ) -> Result<BuiltTrace, Cancelled> {
        let result = match shape {
            TraceShape::Fibonacci => Some(self.fibonacci(workload_size, cancel).await?),
            TraceShape::FanOut => {
                self.fan_out(cancel).await?;
                None
            }
        };

        Ok(BuiltTrace {
            trace: self.recorder.finish(),
            correlation_id: self.correlation_id,
            result,
        })
    }

    fn span_attributes(&self) -> BTreeMap<String, String> {
        let mut attributes = self.base_attributes.clone();
        if self.recorder.spans.is_empty() {
            attributes.insert(self.label.as_str().to_string(), self.correlation_id.to_string());
        }
        attributes
    }

    fn fibonacci<'a>(&'a mut self, n: u32, cancel: &'a CancellationToken) -> SpanFuture<'a, u64> {
        Box::pin(async move {
            let mut attributes = self.span_attributes();
            attributes.insert("fibonacci".to_string(), n.to_string());

            self.recorder.start_span("Fibonacci", attributes);
            let result = self.fibonacci_work(n, cancel).await;
            self.recorder.end_span();

            result
        })
    }

    async fn fibonacci_work(&mut self, n: u32, cancel: &CancellationToken) -> Result<u64, Cancelled> {
        sleep_unless_cancelled(self.delays.fibonacci, cancel).await?;

        match n {
            0 | 1 => Ok(0),
            2 => Ok(1),
            _ => {
                let a = self.fibonacci(n - 1, cancel).await?;
                let b = self.fibonacci(n - 2, cancel).await?;
                Ok(a.saturating_add(b))
            }
        }
    }

    async fn fan_out(&mut self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let delays = self.delays;

        self.start_span("api-request");
        sleep_unless_cancelled(delays.root, cancel).await?;

        self.start_span("authenticate");
        sleep_unless_cancelled(delays.first_child, cancel).await?;
        self.recorder.end_span();

        self.start_span("query-backend");
        sleep_unless_cancelled(delays.second_child, cancel).await?;

        self.start_span("decode-response");
        sleep_unless_cancelled(delays.grandchild, cancel).await?;
        self.recorder.end_span();

        self.recorder.end_span();
        self.recorder.end_span();

        Ok(())
    }

    fn start_span(&mut self, name: &str) -> SpanIndex {
        let attributes = self.span_attributes();
        self.recorder.start_span(name, attributes)
    }
}

struct SpanRecorder {
    clock: Clock,
    anchor_instant: Instant,
    anchor_unix_nanos: u64,
    rng: StdRng,
    trace_id: u128,
    spans: Vec<SpanNode>,
    open: Vec<SpanIndex>,
}

impl SpanRecorder {
    fn now_unix_nanos(&self) -> u64 {
        let elapsed = self.clock.now().duration_since(self.anchor_instant);
        self.anchor_unix_nanos.saturating_add(elapsed.as_nanos() as u64)
    }

    fn start_span(&mut self, name: &str, attributes: BTreeMap<String, String>) -> SpanIndex {
        let idx = SpanIndex(self.spans.len());
        let now = self.now_unix_nanos();

        self.spans.push(SpanNode {
            name: name.to_string(),
            span_id: self.rng.random_range(1..=u64::MAX),
            parent: self.open.last().copied(),
            start_unix_nanos: now,
            end_unix_nanos: now,
            attributes,
        });
        self.open.push(idx);

        idx
    }

    fn end_span(&mut self) {
        if let Some(idx) = self.open.pop() {
            let now = self.now_unix_nanos();
            self.spans[idx.0].end_unix_nanos = now;
        }
    }

    fn finish(self) -> Trace {
        debug_assert!(self.open.is_empty(), "all spans must be ended before the trace is finished");

        Trace {
            trace_id: self.trace_id,
            spans: self.spans,
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;

    use super::*;

    fn fib_call_count(n: u32) -> usize {
        match n {
            0..=2 => 1,
            _ => fib_call_count(n - 1) + fib_call_count(n - 2) + 1,
        }
    }

    fn builder(delays: SpanDelays) -> TraceBuilder {
        TraceBuilder::new(CorrelationLabel::default(), delays, "Fibonacci")
    }

    #[tokio::test]
    async fn fan_out_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        let cancel = CancellationToken::new();
        let delays = SpanDelays {
            fibonacci: Duration::ZERO,
            root: Duration::from_millis(2),
            first_child: Duration::from_millis(2),
            second_child: Duration::from_millis(2),
            grandchild: Duration::from_millis(2),
        };

        let (trace, correlation_id) = builder(delays)
            .build(TraceShape::FanOut, 0, &mut rng, &cancel)
            .await
            .unwrap();

        assert_eq!(trace.len(), 4);
        assert!(trace.validate_nesting());
        assert_eq!(correlation_id, CorrelationId::from_trace(&trace));
        assert_eq!(trace.root().attribute("traceId"), Some(correlation_id.as_str()));

        let root_children = trace.children(SpanIndex::ROOT).collect::<Vec<_>>();
        assert_eq!(root_children.len(), 2);

        let grandchildren = root_children
            .iter()
            .flat_map(|(idx, _)| trace.children(*idx))
            .collect::<Vec<_>>();
        assert_eq!(grandchildren.len(), 1);
        assert_eq!(grandchildren[0].1.name(), "decode-response");

        // Children run sequentially, not concurrently.
        let (_, first) = root_children[0];
        let (_, second) = root_children[1];
        assert!(first.end_unix_nanos() <= second.start_unix_nanos());

        // Only the root carries the correlation identifier.
        assert!(trace.spans()[1..].iter().all(|span| span.attribute("traceId").is_none()));
    }

    #[tokio::test]
    async fn fibonacci_span_counts() {
        let mut rng = StdRng::seed_from_u64(11);
        let cancel = CancellationToken::new();
        let builder = builder(SpanDelays::none());

        for n in 0..=12 {
            let built = builder
                .start_trace(&mut rng)
                .run(TraceShape::Fibonacci, n, &cancel)
                .await
                .unwrap();

            assert_eq!(built.trace.len(), fib_call_count(n), "wrong span count for n={}", n);
            assert!(built.trace.validate_nesting());
            assert_eq!(built.trace.root().attribute("fibonacci"), Some(n.to_string().as_str()));
        }
    }

    #[tokio::test]
    async fn fibonacci_results() {
        let mut rng = StdRng::seed_from_u64(13);
        let cancel = CancellationToken::new();
        let builder = builder(SpanDelays::none());

        let expected = [0, 0, 1, 1, 2, 3, 5, 8, 13, 21];
        for (n, expected) in expected.into_iter().enumerate() {
            let built = builder
                .start_trace(&mut rng)
                .run(TraceShape::Fibonacci, n as u32, &cancel)
                .await
                .unwrap();
            assert_eq!(built.result, Some(expected));
        }
    }

    #[tokio::test]
    async fn fibonacci_base_cases_have_single_span() {
        let mut rng = StdRng::seed_from_u64(17);
        let cancel = CancellationToken::new();
        let builder = builder(SpanDelays::none());

        for n in 0..=2 {
            let (trace, _) = builder
                .build(TraceShape::Fibonacci, n, &mut rng, &cancel)
                .await
                .unwrap();
            assert_eq!(trace.len(), 1);
            assert_eq!(trace.root().parent(), None);
        }
    }

    #[tokio::test]
    async fn mocked_clock_timestamps() {
        let (clock, _mock) = Clock::mock();
        let mut rng = StdRng::seed_from_u64(19);
        let cancel = CancellationToken::new();

        let (trace, _) = builder(SpanDelays::none())
            .with_clock(clock)
            .build(TraceShape::Fibonacci, 5, &mut rng, &cancel)
            .await
            .unwrap();

        // With a clock that never advances, every span is instantaneous but nesting still holds.
        assert!(trace.validate_nesting());
        assert!(trace
            .spans()
            .iter()
            .all(|span| span.start_unix_nanos() == span.end_unix_nanos()));
    }

    #[tokio::test]
    async fn cancelled_build() {
        let mut rng = StdRng::seed_from_u64(23);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = builder(SpanDelays::default())
            .build(TraceShape::FanOut, 0, &mut rng, &cancel)
            .await;
        assert_eq!(result.err(), Some(Cancelled));
    }
}
