//! Histogram bucket planning.

use snafu::ensure;

use crate::{
    config::DistributionConfig,
    error::{ConfigurationError, DegenerateBucketPlan, ZeroBucketCount},
};

/// Number of standard deviations below the mean at which the first boundary is placed.
const START_SIGMAS: f64 = 5.0;

/// Width of each bucket, in standard deviations.
const STEP_SIGMAS: f64 = 0.5;

/// The bucket a value resolves to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BucketIndex {
    /// A bucket bounded by the boundary at the given index.
    Bounded(usize),

    /// The implicit overflow bucket, for values greater than every boundary.
    Overflow,
}

/// A linear sequence of histogram bucket upper boundaries.
///
/// Boundaries are derived from the distribution parameters so that the histogram resolution scales with the configured
/// spread: the first boundary sits five standard deviations below the mean, and every bucket is half a standard
/// deviation wide.
#[derive(Clone, Debug, PartialEq)]
pub struct BucketPlan {
    boundaries: Vec<f64>,
}

impl BucketPlan {
    /// Plans `count` bucket boundaries for the given distribution.
    ///
    /// # Errors
    ///
    /// If `count` is zero, or the distribution configuration is invalid, an error is returned. If the resulting
    /// boundaries would not be finite and strictly increasing, such as when the domain is too small to register at the
    /// magnitude of the mean, an error is returned.
    pub fn plan(config: &DistributionConfig, count: usize) -> Result<Self, ConfigurationError> {
        config.validate()?;
        ensure!(count > 0, ZeroBucketCount);

        let start = config.mean - START_SIGMAS * config.domain;
        let step = STEP_SIGMAS * config.domain;

        // Each boundary is computed from the start rather than accumulated, so rounding error doesn't build up across
        // the sequence.
        let boundaries = (0..count).map(|i| start + i as f64 * step).collect::<Vec<_>>();

        ensure!(
            boundaries.iter().all(|b| b.is_finite()) && boundaries.windows(2).all(|w| w[0] < w[1]),
            DegenerateBucketPlan {
                mean: config.mean,
                domain: config.domain,
                count,
            }
        );

        Ok(Self { boundaries })
    }

    /// Returns the bucket boundaries.
    pub fn boundaries(&self) -> &[f64] {
        &self.boundaries
    }

    /// Returns the number of bounded buckets, excluding the overflow bucket.
    pub fn len(&self) -> usize {
        self.boundaries.len()
    }

    /// Returns `true` if there are no bounded buckets.
    pub fn is_empty(&self) -> bool {
        self.boundaries.is_empty()
    }

    /// Resolves the bucket that `value` falls into.
    ///
    /// A value falls into the first bucket whose upper boundary is greater than or equal to it. Values above the last
    /// boundary, as well as NaN, fall into the overflow bucket.
    pub fn resolve(&self, value: f64) -> BucketIndex {
        let idx = self.boundaries.partition_point(|upper_bound| *upper_bound < value);
        if idx < self.boundaries.len() && !value.is_nan() {
            BucketIndex::Bounded(idx)
        } else {
            BucketIndex::Overflow
        }
    }
}

#[cfg(test)]
mod tests {
    use float_cmp::approx_eq;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn default_plan() {
        let config = DistributionConfig::new(100.0, 10.0).unwrap();
        let plan = BucketPlan::plan(&config, 20).unwrap();

        assert_eq!(plan.len(), 20);
        assert_eq!(plan.boundaries()[0], 50.0);
        assert_eq!(plan.boundaries()[1], 55.0);
        assert_eq!(plan.boundaries()[19], 145.0);
    }

    #[test]
    fn rejects_invalid_inputs() {
        let config = DistributionConfig::new(0.0, 5.0).unwrap();
        assert!(matches!(
            BucketPlan::plan(&config, 0),
            Err(ConfigurationError::ZeroBucketCount)
        ));

        let config = DistributionConfig { mean: 0.0, domain: -1.0 };
        assert!(matches!(
            BucketPlan::plan(&config, 20),
            Err(ConfigurationError::InvalidDomain { .. })
        ));
    }

    #[test]
    fn rejects_degenerate_boundaries() {
        // A spread this small relative to the mean can't be resolved, so adjacent boundaries collapse.
        let config = DistributionConfig::new(1.0e17, 1.0).unwrap();
        assert!(matches!(
            BucketPlan::plan(&config, 20),
            Err(ConfigurationError::DegenerateBucketPlan { count: 20, .. })
        ));

        // A spread this large overflows to infinity below the mean.
        let config = DistributionConfig::new(0.0, 1.0e308).unwrap();
        assert!(matches!(
            BucketPlan::plan(&config, 20),
            Err(ConfigurationError::DegenerateBucketPlan { .. })
        ));
    }

    #[test]
    fn resolve_values() {
        let config = DistributionConfig::new(0.0, 2.0).unwrap();
        let plan = BucketPlan::plan(&config, 4).unwrap();
        assert_eq!(plan.boundaries(), &[-10.0, -9.0, -8.0, -7.0]);

        assert_eq!(plan.resolve(-100.0), BucketIndex::Bounded(0));
        assert_eq!(plan.resolve(-10.0), BucketIndex::Bounded(0));
        assert_eq!(plan.resolve(-9.5), BucketIndex::Bounded(1));
        assert_eq!(plan.resolve(-9.0), BucketIndex::Bounded(1));
        assert_eq!(plan.resolve(-7.0), BucketIndex::Bounded(3));
        assert_eq!(plan.resolve(-6.99), BucketIndex::Overflow);
        assert_eq!(plan.resolve(f64::NAN), BucketIndex::Overflow);
        assert_eq!(plan.resolve(f64::INFINITY), BucketIndex::Overflow);
    }

    #[test]
    fn plan_is_idempotent() {
        let config = DistributionConfig::new(-3.25, 0.7).unwrap();
        let a = BucketPlan::plan(&config, 33).unwrap();
        let b = BucketPlan::plan(&config, 33).unwrap();

        let a_bits = a.boundaries().iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        let b_bits = b.boundaries().iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(a_bits, b_bits);
    }

    proptest! {
        #[test]
        fn property_test_plan_shape(mean in -1.0e6f64..1.0e6, domain in 1.0e-3f64..1.0e4, count in 1usize..200) {
            // For any valid distribution, the plan has exactly `count` strictly increasing boundaries, starting at five
            // standard deviations below the mean and spaced half a standard deviation apart.
            let config = DistributionConfig::new(mean, domain).unwrap();
            let plan = BucketPlan::plan(&config, count).unwrap();
            let boundaries = plan.boundaries();

            prop_assert_eq!(boundaries.len(), count);
            prop_assert_eq!(boundaries[0], mean - 5.0 * domain);

            // The tolerance is scaled by the magnitude of the values involved, since the spacing is the difference of
            // two potentially large numbers.
            let magnitude = mean.abs() + 5.0 * domain + count as f64 * domain;
            let epsilon = magnitude * 1.0e-12;
            for pair in boundaries.windows(2) {
                prop_assert!(pair[0] < pair[1]);
                prop_assert!(approx_eq!(f64, pair[1] - pair[0], 0.5 * domain, epsilon = epsilon));
            }
        }
    }
}
