//! Complex Morlet wavelet power
//!
//! Each wavelet is a complex exponential at the analysis frequency under a
//! Gaussian envelope with `sigma_t = width / (2 pi f)`, cut at
//! [`WAVELET_SUPPORT_SIGMAS`] standard deviations and scaled to unit energy.
//! Convolution is done in the frequency domain with one FFT size shared by
//! every frequency, so each channel is transformed once.

use crate::config::WAVELET_SUPPORT_SIGMAS;
use ndarray::{Array3, ArrayView2};
use rustfft::{num_complex::Complex, FftPlanner};
use std::cell::RefCell;
use std::f64::consts::PI;

// Thread-local FFT planner, reused by every job on the same worker thread
thread_local! {
    static FFT_PLANNER: RefCell<FftPlanner<f64>> = RefCell::new(FftPlanner::new());
}

#[derive(Debug, Clone)]
pub struct MorletWavelet {
    frequency: f64,
    half_width: usize,
    kernel: Vec<Complex<f64>>,
}

impl MorletWavelet {
    pub fn new(frequency: f64, width: f64, sample_rate: f64) -> Self {
        let sigma_t = width / (2.0 * PI * frequency);
        let half_width = (WAVELET_SUPPORT_SIGMAS * sigma_t * sample_rate).ceil() as usize;

        let mut kernel: Vec<Complex<f64>> = (0..=2 * half_width)
            .map(|i| {
                let t = (i as f64 - half_width as f64) / sample_rate;
                let envelope = (-t * t / (2.0 * sigma_t * sigma_t)).exp();
                Complex::from_polar(envelope, 2.0 * PI * frequency * t)
            })
            .collect();

        let energy = kernel.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
        if energy > 0.0 {
            for c in &mut kernel {
                *c /= energy;
            }
        }

        Self {
            frequency,
            half_width,
            kernel,
        }
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    /// Samples on each side of the centre tap
    pub fn half_width(&self) -> usize {
        self.half_width
    }

    pub fn kernel(&self) -> &[Complex<f64>] {
        &self.kernel
    }
}

/// Wavelet power of every channel at every frequency.
///
/// `signal` is (channels, samples); the result is (frequencies, channels,
/// samples), aligned with the input ("same" convolution).
pub fn morlet_power(
    signal: ArrayView2<f64>,
    frequencies: &[f64],
    width: f64,
    sample_rate: f64,
) -> Array3<f64> {
    let (channels, n) = signal.dim();
    let mut power = Array3::zeros((frequencies.len(), channels, n));
    if n == 0 || channels == 0 || frequencies.is_empty() {
        return power;
    }

    let wavelets: Vec<MorletWavelet> = frequencies
        .iter()
        .map(|&f| MorletWavelet::new(f, width, sample_rate))
        .collect();
    let longest = wavelets.iter().map(|w| w.kernel.len()).max().unwrap_or(1);
    let nfft = (n + longest - 1).next_power_of_two();
    let scale = 1.0 / nfft as f64;

    let (forward, inverse) = FFT_PLANNER.with(|planner| {
        let mut planner = planner.borrow_mut();
        (planner.plan_fft_forward(nfft), planner.plan_fft_inverse(nfft))
    });

    let spectra: Vec<Vec<Complex<f64>>> = signal
        .rows()
        .into_iter()
        .map(|row| {
            let mut buffer = vec![Complex::new(0.0, 0.0); nfft];
            for (slot, &x) in buffer.iter_mut().zip(row.iter()) {
                *slot = Complex::new(x, 0.0);
            }
            forward.process(&mut buffer);
            buffer
        })
        .collect();

    let mut product = vec![Complex::new(0.0, 0.0); nfft];
    for (fi, wavelet) in wavelets.iter().enumerate() {
        let mut kernel = vec![Complex::new(0.0, 0.0); nfft];
        kernel[..wavelet.kernel.len()].copy_from_slice(&wavelet.kernel);
        forward.process(&mut kernel);

        for (ch, spectrum) in spectra.iter().enumerate() {
            for ((out, a), b) in product.iter_mut().zip(spectrum).zip(&kernel) {
                *out = a * b;
            }
            inverse.process(&mut product);

            let aligned = &product[wavelet.half_width..wavelet.half_width + n];
            for (t, c) in aligned.iter().enumerate() {
                power[[fi, ch, t]] = (*c * scale).norm_sqr();
            }
        }
    }

    power
}
