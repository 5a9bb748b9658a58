//! Signal Processing Module
//!
//! Zero-phase IIR filtering, Morlet wavelet power and the feature/inference
//! pipeline executed by classification jobs.

mod filters;
mod pipeline;
mod wavelet;

pub use filters::{BandStopFilter, BiquadCoeffs, ButterworthFilter, SosFilter};
pub use pipeline::{
    classify, compute_features, log_spaced, Classification, PipelineError, PipelineResult,
    HIGHPASS_ORDER, POWER_FLOOR,
};
pub use wavelet::{morlet_power, MorletWavelet};
