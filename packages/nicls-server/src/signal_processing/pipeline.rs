//! Classification Pipeline
//!
//! Pure functions run on the worker pool:
//! 1. Band-stop filter (line noise)
//! 2. High-pass filter (drift)
//! 3. Morlet wavelet power at log-spaced frequencies
//! 4. Edge trim, log and time average into one feature vector
//! 5. z-normalization and logistic inference
//!
//! Baseline windows stop after step 4.

use super::filters::{BandStopFilter, ButterworthFilter, SosFilter};
use super::wavelet::morlet_power;
use crate::classifier::model::{LogisticModel, ModelError};
use crate::classifier::stats::{NormalizationStats, StatsError};
use crate::config::ExperimentConfig;
use ndarray::{s, Array1, Array2, Axis};
use serde::Serialize;
use tracing::warn;

/// Floor added to wavelet power before the log
pub const POWER_FLOOR: f64 = 1e-16;

/// Order of the drift-removal high-pass
pub const HIGHPASS_ORDER: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Window of {samples} samples cannot absorb {edge} edge samples per side")]
    WindowTooShort { samples: usize, edge: usize },

    #[error("Window has {actual} channels, expected {expected}")]
    ChannelMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Stats(#[from] StatsError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Outcome of one classification
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    pub result: bool,
    pub probability: f64,
}

/// `count` log-spaced values from `low` to `high` inclusive
pub fn log_spaced(low: f64, high: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![low],
        _ => {
            let (a, b) = (low.ln(), high.ln());
            let step = (b - a) / (count - 1) as f64;
            (0..count).map(|i| (a + step * i as f64).exp()).collect()
        }
    }
}

fn filter_rows(window: &mut Array2<f64>, filter: &SosFilter) {
    for mut row in window.rows_mut() {
        let filtered = filter.filtfilt(&row.to_vec());
        row.assign(&Array1::from(filtered));
    }
}

/// Power features of one (channels, samples) window, laid out
/// `features[f * channels + c]`
pub fn compute_features(
    window: &Array2<f64>,
    config: &ExperimentConfig,
) -> PipelineResult<Array1<f64>> {
    let (channels, samples) = window.dim();
    if channels != config.channels {
        return Err(PipelineError::ChannelMismatch {
            expected: config.channels,
            actual: channels,
        });
    }
    let edge = config.edge_samples();
    if samples < edge.saturating_mul(2).saturating_add(1) {
        return Err(PipelineError::WindowTooShort { samples, edge });
    }

    let filter = BandStopFilter::design(
        config.line_noise_low,
        config.line_noise_high,
        config.samplerate,
    )
    .then(ButterworthFilter::highpass(
        config.highpass_cutoff,
        config.samplerate,
        HIGHPASS_ORDER,
    ));
    let mut filtered = window.clone();
    filter_rows(&mut filtered, &filter);

    let frequencies = log_spaced(config.freq_low, config.freq_high, config.freq_count);
    let power = morlet_power(
        filtered.view(),
        &frequencies,
        config.wavelet_width,
        config.samplerate,
    );

    let trimmed = power.slice(s![.., .., edge..samples - edge]);
    let log_power = trimmed.mapv(|p| (p + POWER_FLOOR).ln());
    let mean = log_power
        .mean_axis(Axis(2))
        .unwrap_or_else(|| Array2::zeros((frequencies.len(), channels)));

    Ok(Array1::from_iter(mean.iter().copied()))
}

/// Normalize `features` and run the model. Without baseline statistics
/// features are used as they are.
pub fn classify(
    features: &Array1<f64>,
    stats: Option<&NormalizationStats>,
    model: &LogisticModel,
) -> PipelineResult<Classification> {
    let normalized = match stats {
        Some(stats) => stats.normalize(features)?,
        None => {
            warn!("No baseline statistics yet; classifying without normalization");
            features.clone()
        }
    };

    let probability = model.predict_proba(&normalized)?;
    Ok(Classification {
        result: probability > 0.5,
        probability,
    })
}
