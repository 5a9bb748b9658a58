// Online baseline statistics (Welford's algorithm, per feature)

use ndarray::Array1;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum StatsError {
    #[error("At least 2 baseline windows are required, got {count}")]
    NotEnoughSamples { count: u64 },

    #[error("Feature vector has {actual} entries, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

pub type StatsResult<T> = Result<T, StatsError>;

/// Frozen normalization parameters
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationStats {
    pub count: u64,
    pub mean: Array1<f64>,
    pub population_std: Array1<f64>,
    pub sample_std: Array1<f64>,
}

impl NormalizationStats {
    /// z-normalize with the sample std. Features with zero spread are only
    /// centred.
    pub fn normalize(&self, features: &Array1<f64>) -> StatsResult<Array1<f64>> {
        if features.len() != self.mean.len() {
            return Err(StatsError::DimensionMismatch {
                expected: self.mean.len(),
                actual: features.len(),
            });
        }

        let std = self
            .sample_std
            .mapv(|s| if s > 0.0 && s.is_finite() { s } else { 1.0 });
        Ok((features - &self.mean) / &std)
    }
}

/// Running count, mean and sum of squared deviations
#[derive(Debug, Clone, Default)]
pub struct OnlineStatistics {
    count: u64,
    mean: Array1<f64>,
    m2: Array1<f64>,
}

impl OnlineStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn update(&mut self, x: &Array1<f64>) -> StatsResult<()> {
        if self.count == 0 {
            self.mean = Array1::zeros(x.len());
            self.m2 = Array1::zeros(x.len());
        } else if x.len() != self.mean.len() {
            return Err(StatsError::DimensionMismatch {
                expected: self.mean.len(),
                actual: x.len(),
            });
        }

        self.count += 1;
        let delta = x - &self.mean;
        self.mean.scaled_add(1.0 / self.count as f64, &delta);
        let delta2 = x - &self.mean;
        self.m2 += &(&delta * &delta2);
        Ok(())
    }

    /// Mean, population std and sample std of everything seen since the
    /// last reset
    pub fn finalize(&self) -> StatsResult<NormalizationStats> {
        if self.count < 2 {
            return Err(StatsError::NotEnoughSamples { count: self.count });
        }

        let n = self.count as f64;
        Ok(NormalizationStats {
            count: self.count,
            mean: self.mean.clone(),
            population_std: self.m2.mapv(|m| (m / n).sqrt()),
            sample_std: self.m2.mapv(|m| (m / (n - 1.0)).sqrt()),
        })
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2, Axis};

    fn assert_close(a: &Array1<f64>, b: &Array1<f64>) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-9, "{} != {}", x, y);
        }
    }

    #[test]
    fn test_matches_batch_statistics() {
        let rows = Array2::from_shape_fn((50, 4), |(i, j)| {
            ((i * 37 + j * 11) % 17) as f64 * 0.5 - (j as f64) * 3.0 + 1e3
        });

        let mut stats = OnlineStatistics::new();
        for row in rows.rows() {
            stats.update(&row.to_owned()).unwrap();
        }
        let finalized = stats.finalize().unwrap();

        let mean = rows.mean_axis(Axis(0)).unwrap();
        assert_close(&finalized.mean, &mean);
        assert_close(&finalized.population_std, &rows.std_axis(Axis(0), 0.0));
        assert_close(&finalized.sample_std, &rows.std_axis(Axis(0), 1.0));
        assert_eq!(finalized.count, 50);
    }

    #[test]
    fn test_finalize_needs_two_updates() {
        let mut stats = OnlineStatistics::new();
        assert_eq!(
            stats.finalize().unwrap_err(),
            StatsError::NotEnoughSamples { count: 0 }
        );
        stats.update(&array![1.0, 2.0]).unwrap();
        assert_eq!(
            stats.finalize().unwrap_err(),
            StatsError::NotEnoughSamples { count: 1 }
        );
    }

    #[test]
    fn test_reset_then_single_update() {
        let mut stats = OnlineStatistics::new();
        stats.update(&array![5.0, 5.0]).unwrap();
        stats.update(&array![7.0, 1.0]).unwrap();
        stats.reset();
        assert_eq!(stats.count(), 0);

        stats.update(&array![3.0, -2.0]).unwrap();
        assert_eq!(stats.mean(), &array![3.0, -2.0]);
        assert!(stats.finalize().is_err());
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut stats = OnlineStatistics::new();
        stats.update(&array![1.0, 2.0]).unwrap();
        assert_eq!(
            stats.update(&array![1.0]).unwrap_err(),
            StatsError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_normalize_uses_sample_std() {
        let mut stats = OnlineStatistics::new();
        stats.update(&array![0.0, 4.0]).unwrap();
        stats.update(&array![2.0, 4.0]).unwrap();
        let finalized = stats.finalize().unwrap();

        // Feature 0: mean 1, sample std sqrt(2). Feature 1 is flat.
        let z = finalized.normalize(&array![3.0, 6.0]).unwrap();
        assert!((z[0] - 2.0 / 2f64.sqrt()).abs() < 1e-12);
        assert_eq!(z[1], 2.0);
    }
}
