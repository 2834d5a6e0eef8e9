//! Distribution sampling.

use rand::Rng;
use rand_distr::{Distribution as _, Normal};

use crate::{
    config::DistributionConfig,
    error::{ConfigurationError, InvalidDomain},
};

/// A single draw from the configured distribution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    /// The raw sampled value.
    pub value: f64,
}

impl Sample {
    /// Converts the sample into a non-negative integer workload size.
    ///
    /// Computes `round(abs(value))` and clamps the result to `max`. Used by call sites which parameterize simulated
    /// work, such as the recursion depth of the fibonacci trace shape; other call sites use the raw value.
    pub fn workload_size(&self, max: u32) -> u32 {
        let size = self.value.abs().round();
        if size >= max as f64 {
            max
        } else {
            size as u32
        }
    }
}

/// Draws samples from a normal distribution.
#[derive(Clone, Debug)]
pub struct DistributionSampler {
    normal: Normal<f64>,
}

impl DistributionSampler {
    /// Creates a new `DistributionSampler` for the given distribution.
    ///
    /// # Errors
    ///
    /// If the distribution configuration is invalid, an error is returned.
    pub fn new(config: DistributionConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let normal = Normal::new(config.mean, config.domain).map_err(|_| {
            InvalidDomain {
                domain: config.domain,
            }
            .build()
        })?;

        Ok(Self { normal })
    }

    /// Draws a sample.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Sample {
        Sample {
            value: self.normal.sample(rng),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng as _};

    use super::*;

    #[test]
    fn workload_size_transform() {
        assert_eq!(Sample { value: 0.2 }.workload_size(20), 0);
        assert_eq!(Sample { value: -3.6 }.workload_size(20), 4);
        assert_eq!(Sample { value: 7.5 }.workload_size(20), 8);
        assert_eq!(Sample { value: -250.0 }.workload_size(20), 20);
        assert_eq!(Sample { value: f64::INFINITY }.workload_size(20), 20);
    }

    #[test]
    fn samples_center_on_mean() {
        // Sampling is probabilistic, so we only check that the empirical mean lands well within a few standard errors
        // of the configured mean.
        let config = DistributionConfig::new(100.0, 10.0).unwrap();
        let sampler = DistributionSampler::new(config).unwrap();
        let mut rng = StdRng::from_os_rng();

        let n = 10_000;
        let mean = (0..n).map(|_| sampler.sample(&mut rng).value).sum::<f64>() / n as f64;

        // Standard error is 10 / sqrt(10_000) = 0.1, so 1.0 is ten standard errors away.
        assert!((mean - 100.0).abs() < 1.0, "empirical mean {} too far from 100", mean);
    }

    #[test]
    fn rejects_invalid_config() {
        let config = DistributionConfig { mean: 0.0, domain: 0.0 };
        assert!(DistributionSampler::new(config).is_err());
    }
}
