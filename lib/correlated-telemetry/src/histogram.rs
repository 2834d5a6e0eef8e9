//! Exemplar-linked histogram.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::{
    buckets::{BucketIndex, BucketPlan},
    config::CorrelationLabel,
    correlation::CorrelationId,
};

/// A single observation attached to a histogram bucket, linking it to the trace and log record of the same cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct Exemplar {
    correlation_id: CorrelationId,
    value: f64,
    timestamp: DateTime<Utc>,
}

impl Exemplar {
    /// Returns the correlation identifier of the observation.
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Returns the observed value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Returns the time of the observation.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Clone, Debug)]
struct HistogramState {
    // One slot per bounded bucket, plus a trailing slot for the overflow bucket. Counts are not cumulative.
    counts: Vec<u64>,
    exemplars: Vec<Option<Exemplar>>,
    sum: f64,
    count: u64,
}

impl HistogramState {
    fn new(buckets: usize) -> Self {
        Self {
            counts: vec![0; buckets + 1],
            exemplars: vec![None; buckets + 1],
            sum: 0.0,
            count: 0,
        }
    }
}

/// A consistent point-in-time copy of a histogram.
#[derive(Clone, Debug)]
pub struct HistogramSnapshot {
    boundaries: Vec<f64>,
    state: HistogramState,
}

impl HistogramSnapshot {
    /// Returns the bucket upper boundaries, excluding the implicit `+Inf` boundary.
    pub fn boundaries(&self) -> &[f64] {
        &self.boundaries
    }

    /// Returns the number of observations that fell into the given bucket.
    pub fn bucket_count(&self, bucket: BucketIndex) -> u64 {
        self.state.counts[self.slot(bucket)]
    }

    /// Returns the most recent exemplar recorded for the given bucket.
    pub fn exemplar(&self, bucket: BucketIndex) -> Option<&Exemplar> {
        self.state.exemplars[self.slot(bucket)].as_ref()
    }

    /// Returns an iterator over every bucket, in boundary order, yielding the upper boundary, the cumulative count, and
    /// the bucket's exemplar.
    ///
    /// The final item is the overflow bucket, with an upper boundary of `f64::INFINITY`.
    pub fn cumulative_buckets(&self) -> impl Iterator<Item = (f64, u64, Option<&Exemplar>)> + '_ {
        let upper_bounds = self.boundaries.iter().copied().chain(std::iter::once(f64::INFINITY));
        upper_bounds
            .zip(self.state.counts.iter())
            .zip(self.state.exemplars.iter())
            .scan(0u64, |cumulative, ((upper_bound, count), exemplar)| {
                *cumulative += count;
                Some((upper_bound, *cumulative, exemplar.as_ref()))
            })
    }

    /// Returns the sum of all observed values.
    pub fn sum(&self) -> f64 {
        self.state.sum
    }

    /// Returns the total number of observations.
    pub fn count(&self) -> u64 {
        self.state.count
    }

    fn slot(&self, bucket: BucketIndex) -> usize {
        match bucket {
            BucketIndex::Bounded(idx) => idx.min(self.boundaries.len()),
            BucketIndex::Overflow => self.boundaries.len(),
        }
    }
}

/// A histogram that keeps the most recent exemplar for each bucket.
///
/// Internally synchronized: observations and snapshots may happen concurrently from different tasks, and every
/// snapshot reflects a whole number of observations.
#[derive(Debug)]
pub struct ExemplarHistogram {
    name: String,
    help: String,
    label: CorrelationLabel,
    plan: BucketPlan,
    state: Mutex<HistogramState>,
}

impl ExemplarHistogram {
    /// Creates a new, empty `ExemplarHistogram`.
    ///
    /// Exemplars are labelled with `label`.
    pub fn new<N, H>(name: N, help: H, label: CorrelationLabel, plan: BucketPlan) -> Self
    where
        N: Into<String>,
        H: Into<String>,
    {
        let state = HistogramState::new(plan.len());
        Self {
            name: name.into(),
            help: help.into(),
            label,
            plan,
            state: Mutex::new(state),
        }
    }

    /// Returns the metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the metric help text.
    pub fn help(&self) -> &str {
        &self.help
    }

    /// Returns the label that exemplars carry the correlation identifier under.
    pub fn label(&self) -> &CorrelationLabel {
        &self.label
    }

    /// Records an observation, attaching the correlation identifier as the exemplar of the bucket it falls into.
    ///
    /// The bucket's previous exemplar, if any, is replaced. Returns the bucket the value fell into.
    pub fn observe_with_exemplar(&self, value: f64, correlation_id: &CorrelationId) -> BucketIndex {
        self.observe_with_exemplar_at(value, correlation_id, Utc::now())
    }

    /// Records an observation with an explicit exemplar timestamp.
    pub fn observe_with_exemplar_at(
        &self, value: f64, correlation_id: &CorrelationId, timestamp: DateTime<Utc>,
    ) -> BucketIndex {
        let bucket = self.plan.resolve(value);
        let slot = match bucket {
            BucketIndex::Bounded(idx) => idx,
            BucketIndex::Overflow => self.plan.len(),
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.counts[slot] += 1;
        state.exemplars[slot] = Some(Exemplar {
            correlation_id: correlation_id.clone(),
            value,
            timestamp,
        });
        state.sum += value;
        state.count += 1;

        bucket
    }

    /// Returns a consistent copy of the histogram's current state.
    pub fn snapshot(&self) -> HistogramSnapshot {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner).clone();
        HistogramSnapshot {
            boundaries: self.plan.boundaries().to_vec(),
            state,
        }
    }
}
