use std::{sync::Arc, time::Duration};

use tokio::{
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, warn};

use super::{SpanExporter, Trace};

/// Batching settings for trace export.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchConfig {
    /// Number of traces that triggers an immediate flush.
    pub max_batch_size: usize,

    /// Maximum time a trace waits before being flushed.
    pub flush_interval: Duration,

    /// Number of traces that may be queued before new traces are dropped.
    pub queue_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 64,
            flush_interval: Duration::from_secs(5),
            queue_capacity: 1024,
        }
    }
}

/// Exports traces in batches from a background task.
///
/// Submitting a trace never blocks the caller. Export failures are logged and the affected batch is dropped; they
/// never propagate back to the submitter.
pub struct TraceBatcher {
    tx: mpsc::Sender<Trace>,
    handle: JoinHandle<()>,
}

impl TraceBatcher {
    /// Spawns the batching task on the current runtime.
    pub fn spawn(exporter: Arc<dyn SpanExporter>, config: BatchConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = tokio::spawn(run_batcher(exporter, config, rx));

        Self { tx, handle }
    }

    /// Queues a trace for export.
    ///
    /// Returns `false` if the queue is full or the batching task has stopped, in which case the trace is dropped.
    pub fn submit(&self, trace: Trace) -> bool {
        match self.tx.try_send(trace) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Trace export queue full. Dropping trace.");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Flushes all queued traces and waits for the batching task to stop.
    pub async fn shutdown(self) {
        let Self { tx, handle } = self;
        drop(tx);

        if let Err(e) = handle.await {
            warn!(error = %e, "Trace batching task did not shut down cleanly.");
        }
    }
}

async fn run_batcher(exporter: Arc<dyn SpanExporter>, config: BatchConfig, mut rx: mpsc::Receiver<Trace>) {
    let max_batch_size = config.max_batch_size.max(1);
    let mut batch = Vec::with_capacity(max_batch_size);

    let mut flush_tick = interval(config.flush_interval.max(Duration::from_millis(1)));
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    flush_tick.tick().await;

    loop {
        select! {
            maybe_trace = rx.recv() => match maybe_trace {
                Some(trace) => {
                    batch.push(trace);
                    if batch.len() >= max_batch_size {
                        flush(exporter.as_ref(), &mut batch).await;
                    }
                }
                None => break,
            },
            _ = flush_tick.tick() => flush(exporter.as_ref(), &mut batch).await,
        }
    }

    flush(exporter.as_ref(), &mut batch).await;
    debug!(exporter = exporter.name(), "Trace batching task stopped.");
}

async fn flush(exporter: &dyn SpanExporter, batch: &mut Vec<Trace>) {
    if batch.is_empty() {
        return;
    }

    let traces = batch.len();
    match exporter.export(batch.as_slice()).await {
        Ok(()) => debug!(exporter = exporter.name(), traces, "Exported trace batch."),
        Err(e) => warn!(exporter = exporter.name(), traces, error = %e, "Failed to export trace batch. Dropping it."),
    }
    batch.clear();
}
