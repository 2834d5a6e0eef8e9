//! Correlation identifiers.

use std::fmt;

use rand::Rng;
use serde::Serialize;

use crate::trace::Trace;

/// Exclusive upper bound for random integer correlation identifiers.
const RANDOM_ID_UPPER_BOUND: u32 = 1_000_000;

/// An opaque identifier shared by one metric observation, one trace, and one log record.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Creates a correlation identifier from a 128-bit trace identifier, rendered as 32 lowercase hex digits.
    pub fn from_trace_id(trace_id: u128) -> Self {
        Self(format!("{:032x}", trace_id))
    }

    /// Creates a correlation identifier from the identifier of the given trace.
    ///
    /// This is the preferred strategy whenever a trace is built in the same cycle, since the exact same string then
    /// shows up in the exported trace.
    pub fn from_trace(trace: &Trace) -> Self {
        Self::from_trace_id(trace.trace_id())
    }

    /// Creates a correlation identifier from a random integer.
    ///
    /// Used as a stand-in when no trace is built. Collisions are possible and acceptable.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.random_range(0..RANDOM_ID_UPPER_BOUND).to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng as _};

    use super::*;

    #[test]
    fn trace_id_rendering() {
        assert_eq!(
            CorrelationId::from_trace_id(0xabc).as_str(),
            "00000000000000000000000000000abc"
        );
        assert_eq!(
            CorrelationId::from_trace_id(u128::MAX).as_str(),
            "ffffffffffffffffffffffffffffffff"
        );
    }

    #[test]
    fn random_ids_are_small_integers() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let id = CorrelationId::random(&mut rng);
            let value = id.as_str().parse::<u32>().unwrap();
            assert!(value < RANDOM_ID_UPPER_BOUND);
        }
    }
}
