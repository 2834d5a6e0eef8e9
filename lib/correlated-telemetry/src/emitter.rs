//! The emission loop.

use std::{sync::Arc, time::Duration};

use quanta::Clock;
use rand::{rngs::StdRng, SeedableRng as _};
use serde_json::{json, Map, Value};
use snafu::ResultExt as _;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument as _};

use crate::{
    buckets::BucketIndex,
    cancel::sleep_unless_cancelled,
    config::{EmitterConfig, ObservedValue},
    correlation::CorrelationId,
    error::{ConfigurationError, EmissionError, LogDelivery},
    logger::{CorrelatedLogger, LogLevel},
    registry::MetricsRegistry,
    sampler::{DistributionSampler, Sample},
    trace::{TraceBatcher, TraceBuilder, TraceShape},
};

/// The result of a single completed emission cycle.
#[derive(Clone, Debug)]
pub struct CycleOutcome {
    /// The correlation identifier shared by the cycle's observation, trace, and log records.
    pub correlation_id: CorrelationId,

    /// The raw sample drawn for the cycle.
    pub sample: Sample,

    /// The workload size derived from the sample.
    pub workload_size: u32,

    /// The value recorded into the histogram.
    pub observed: f64,

    /// The bucket the observed value fell into.
    pub bucket: BucketIndex,

    /// The number of spans in the cycle's trace, or zero if no trace was built.
    pub span_count: usize,

    /// The result of the simulated computation, if any.
    pub result: Option<u64>,

    /// Wall-clock duration of the cycle's work.
    pub duration: Duration,
}

/// Drives emission cycles until cancelled.
///
/// Each cycle draws a sample, optionally builds a trace, records the observation into the exemplar-linked histogram,
/// and emits correlated log records, all sharing a single correlation identifier.
pub struct EmissionLoop {
    config: EmitterConfig,
    sampler: DistributionSampler,
    trace_builder: Option<(TraceShape, TraceBuilder)>,
    registry: Arc<MetricsRegistry>,
    logger: CorrelatedLogger,
    batcher: Option<TraceBatcher>,
    clock: Clock,
    rng: StdRng,
    cycles: u64,
}

impl EmissionLoop {
    /// Creates a new `EmissionLoop`.
    ///
    /// Completed traces are handed to `batcher`, if one is given, and otherwise dropped.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, an error is returned.
    pub fn new(
        config: EmitterConfig, registry: Arc<MetricsRegistry>, logger: CorrelatedLogger, batcher: Option<TraceBatcher>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;

        let sampler = DistributionSampler::new(config.distribution)?;
        let trace_builder = config.trace_shape.map(|shape| {
            let builder = TraceBuilder::new(
                config.correlation_label.clone(),
                config.span_delays,
                &config.application,
            );
            (shape, builder)
        });

        Ok(Self {
            config,
            sampler,
            trace_builder,
            registry,
            logger,
            batcher,
            clock: Clock::new(),
            rng: StdRng::from_os_rng(),
            cycles: 0,
        })
    }

    /// Sets the random number generator used for sampling and identifier generation.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Sets the clock used to time cycles and spans.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.trace_builder = self
            .trace_builder
            .map(|(shape, builder)| (shape, builder.with_clock(clock.clone())));
        self.clock = clock;
        self
    }

    /// Returns the number of cycles completed so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Runs emission cycles until cancellation is requested.
    ///
    /// Cancellation is checked before every sleep, and a cycle interrupted by cancellation is abandoned without
    /// recording anything. On exit, any queued traces are flushed.
    ///
    /// # Errors
    ///
    /// If a correlated log record cannot be delivered and the logger's failure policy is fatal, the loop stops and an
    /// error is returned.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), EmissionError> {
        info!(
            mean = self.config.distribution.mean,
            domain = self.config.distribution.domain,
            interval = ?self.config.emit_interval,
            trace_shape = ?self.config.trace_shape,
            "Emission loop started."
        );

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            let span = info_span!("emission_cycle", cycle = self.cycles + 1);
            if let Err(e) = self.run_cycle(&cancel).instrument(span).await {
                break Err(e);
            }

            if sleep_unless_cancelled(self.config.emit_interval, &cancel).await.is_err() {
                break Ok(());
            }
        };

        if let Some(batcher) = self.batcher.take() {
            batcher.shutdown().await;
        }

        info!(cycles = self.cycles, "Emission loop stopped.");
        result
    }

    /// Runs a single emission cycle.
    ///
    /// Returns `Ok(None)` if the cycle was interrupted by cancellation before anything was recorded.
    ///
    /// # Errors
    ///
    /// If a correlated log record cannot be delivered and the logger's failure policy is fatal, an error is returned.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> Result<Option<CycleOutcome>, EmissionError> {
        let sample = self.sampler.sample(&mut self.rng);
        let workload_size = sample.workload_size(self.config.max_workload_size);

        let pending = self
            .trace_builder
            .as_ref()
            .map(|(shape, builder)| (*shape, builder.start_trace(&mut self.rng)));
        let correlation_id = match &pending {
            Some((_, pending)) => pending.correlation_id().clone(),
            None => CorrelationId::random(&mut self.rng),
        };

        let mut fields = Map::new();
        fields.insert("fibonacci".to_string(), json!(workload_size));
        let beginning = self
            .emit(LogLevel::Info, &correlation_id, fields.clone(), "Beginning calculation", cancel)
            .await?;
        if !beginning {
            debug!(correlation_id = %correlation_id, "Cycle cancelled while delivering log record.");
            return Ok(None);
        }

        // Timing starts after the first record so that log delivery isn't counted as work.
        let start = self.clock.now();
        let (trace, result) = match pending {
            Some((shape, pending)) => match pending.run(shape, workload_size, cancel).await {
                Ok(built) => (Some(built.trace), built.result),
                Err(_) => {
                    debug!(correlation_id = %correlation_id, "Cycle cancelled while building trace.");
                    return Ok(None);
                }
            },
            None => (None, None),
        };

        let duration = self.clock.now().duration_since(start);
        let observed = match self.config.observed_value {
            ObservedValue::Sample => sample.value,
            ObservedValue::Duration => duration.as_secs_f64(),
        };
        let bucket = self
            .registry
            .histogram()
            .observe_with_exemplar(observed, &correlation_id);

        if let Some(answer) = result {
            fields.insert("answer".to_string(), json!(answer));
        }
        fields.insert("duration".to_string(), json!(duration.as_secs_f64()));
        fields.insert("value".to_string(), observed_json(observed));
        // The observation is already recorded at this point, so an abandoned delivery doesn't abandon the cycle.
        self.emit(LogLevel::Info, &correlation_id, fields, "Completed calculation", cancel).await?;

        let span_count = trace.as_ref().map_or(0, |trace| trace.len());
        if let Some(trace) = trace {
            match &self.batcher {
                Some(batcher) => {
                    if !batcher.submit(trace) {
                        let mut fields = Map::new();
                        fields.insert("spans".to_string(), json!(span_count));
                        self.emit(LogLevel::Warn, &correlation_id, fields, "Trace dropped", cancel).await?;
                    }
                }
                None => debug!(correlation_id = %correlation_id, "No trace exporter configured. Dropping trace."),
            }
        }

        self.cycles += 1;
        debug!(
            correlation_id = %correlation_id,
            observed,
            ?bucket,
            span_count,
            "Completed emission cycle."
        );

        Ok(Some(CycleOutcome {
            correlation_id,
            sample,
            workload_size,
            observed,
            bucket,
            span_count,
            result,
            duration,
        }))
    }

    /// Emits a correlated log record, abandoning delivery if cancellation is requested first.
    ///
    /// Returns `Ok(false)` if delivery was abandoned.
    async fn emit(
        &self, level: LogLevel, correlation_id: &CorrelationId, fields: Map<String, Value>, message: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, EmissionError> {
        select! {
            biased;

            result = self.logger.emit(level, correlation_id, fields, message) => {
                result.context(LogDelivery {
                    correlation_id: correlation_id.as_str(),
                })?;
                Ok(true)
            }
            _ = cancel.cancelled() => Ok(false),
        }
    }
}

fn observed_json(value: f64) -> Value {
    // JSON has no representation for non-finite numbers.
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}
