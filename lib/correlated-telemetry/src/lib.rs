//! Correlated telemetry emission.
//!
//! This crate continuously generates synthetic telemetry in which a single correlation identifier links three signals:
//! a histogram exemplar, a trace, and a structured log record. Each emission cycle draws a value from a configurable
//! normal distribution, builds a trace tree simulating nested work, records the observation into a histogram whose
//! bucket keeps the cycle's identifier as an exemplar, and emits log records carrying the same identifier.
//!
//! The main entrypoint is [`EmissionLoop`], which is driven by an [`EmitterConfig`] and records into a shared
//! [`MetricsRegistry`].
#![deny(missing_docs)]

pub mod buckets;
mod cancel;
pub mod config;
pub mod correlation;
pub mod emitter;
pub mod error;
pub mod histogram;
pub mod logger;
pub mod registry;
mod remote;
pub mod sampler;
pub mod trace;

pub use self::cancel::Cancelled;
pub use self::config::EmitterConfig;
pub use self::emitter::{CycleOutcome, EmissionLoop};
pub use self::registry::MetricsRegistry;
pub use self::remote::RemoteSettings;
