//! Digital Filter Implementations
//!
//! IIR filters built from second-order sections (biquads). Pipeline code runs
//! them forward and backward ([`SosFilter::filtfilt`]) so the result has no
//! phase shift.

use std::f64::consts::PI;

/// Second-order section (biquad) coefficients
/// Transfer function: H(z) = (b0 + b1*z^-1 + b2*z^-2) / (1 + a1*z^-1 + a2*z^-2)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    /// Gain at 0 Hz
    fn dc_gain(&self) -> f64 {
        let den = 1.0 + self.a1 + self.a2;
        if den.abs() < f64::EPSILON {
            return 0.0;
        }
        (self.b0 + self.b1 + self.b2) / den
    }

    /// Largest pole magnitude
    fn pole_radius(&self) -> f64 {
        let disc = self.a1 * self.a1 - 4.0 * self.a2;
        if disc < 0.0 {
            self.a2.sqrt()
        } else {
            let root = disc.sqrt();
            ((-self.a1 + root) / 2.0)
                .abs()
                .max(((-self.a1 - root) / 2.0).abs())
        }
    }
}

/// Single biquad section (Direct Form II Transposed)
#[derive(Debug, Clone)]
struct BiquadFilter {
    coeffs: BiquadCoeffs,
    z1: f64,
    z2: f64,
}

impl BiquadFilter {
    fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            z1: 0.0,
            z2: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, input: f64) -> f64 {
        let c = &self.coeffs;
        let output = c.b0 * input + self.z1;
        self.z1 = c.b1 * input - c.a1 * output + self.z2;
        self.z2 = c.b2 * input - c.a2 * output;
        output
    }

    // Steady state for a constant input; returns the matching output
    fn prime(&mut self, input: f64) -> f64 {
        let c = self.coeffs;
        let output = c.dc_gain() * input;
        self.z1 = output - c.b0 * input;
        self.z2 = c.b2 * input - c.a2 * output;
        output
    }
}

/// Cascaded second-order sections filter
#[derive(Debug, Clone)]
pub struct SosFilter {
    sections: Vec<BiquadFilter>,
}

impl SosFilter {
    pub fn new(sections: Vec<BiquadCoeffs>) -> Self {
        Self {
            sections: sections.into_iter().map(BiquadFilter::new).collect(),
        }
    }

    /// Chain two filters into one cascade
    pub fn then(mut self, other: SosFilter) -> Self {
        self.sections.extend(other.sections);
        self
    }

    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }

    #[inline]
    pub fn process(&mut self, input: f64) -> f64 {
        self.sections
            .iter_mut()
            .fold(input, |x, section| section.process(x))
    }

    /// Set every section's state as if `level` had been the input forever
    pub fn prime(&mut self, level: f64) {
        self.sections
            .iter_mut()
            .fold(level, |x, section| section.prime(x));
    }

    /// Causal filtering of a whole signal
    pub fn filter(&mut self, signal: &[f64]) -> Vec<f64> {
        signal.iter().map(|&s| self.process(s)).collect()
    }

    /// Zero-phase filtering: forward pass, backward pass.
    ///
    /// Both ends are extended by odd reflection about the signal's linear
    /// trend, long enough for the slowest pole to settle, and each pass
    /// starts from the steady state of its leading padding. An offset or a
    /// slow ramp therefore leaves no start-up transient in the result.
    pub fn filtfilt(&self, signal: &[f64]) -> Vec<f64> {
        let n = signal.len();
        if n == 0 {
            return Vec::new();
        }

        let pad = self
            .settling_samples()
            .max(3 * (2 * self.sections.len() + 1))
            .min(n - 1);
        let (intercept, slope) = linear_trend(signal);
        let first = intercept;
        let last = intercept + slope * (n - 1) as f64;

        let mut extended = Vec::with_capacity(n + 2 * pad);
        extended.extend((1..=pad).rev().map(|i| 2.0 * first - signal[i]));
        extended.extend_from_slice(signal);
        extended.extend((1..=pad).map(|i| 2.0 * last - signal[n - 1 - i]));

        let lead = pad.max(1);
        let mut pass = self.clone();
        pass.prime(mean(&extended[..lead]));
        let mut forward = pass.filter(&extended);

        forward.reverse();
        pass.prime(mean(&forward[..lead]));
        let mut backward = pass.filter(&forward);
        backward.reverse();

        backward.drain(..pad);
        backward.truncate(n);
        backward
    }

    // Samples until the slowest pole decays below SETTLE_TOLERANCE
    fn settling_samples(&self) -> usize {
        self.sections
            .iter()
            .map(|section| {
                let radius = section.coeffs.pole_radius();
                if radius <= 0.0 {
                    1
                } else if radius >= 1.0 {
                    usize::MAX
                } else {
                    (SETTLE_TOLERANCE.ln() / radius.ln()).ceil() as usize
                }
            })
            .max()
            .unwrap_or(0)
    }
}

const SETTLE_TOLERANCE: f64 = 1e-3;

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Least-squares line through `signal`, as (value at index 0, slope)
fn linear_trend(signal: &[f64]) -> (f64, f64) {
    let n = signal.len();
    if n < 2 {
        return (signal.first().copied().unwrap_or(0.0), 0.0);
    }
    let mid = (n - 1) as f64 / 2.0;
    let avg = mean(signal);
    let (num, den) = signal
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, &y)| {
            let dx = i as f64 - mid;
            (num + dx * (y - avg), den + dx * dx)
        });
    let slope = num / den;
    (avg - slope * mid, slope)
}

/// Butterworth filter designer
pub struct ButterworthFilter;

impl ButterworthFilter {
    /// Design a Butterworth highpass filter
    pub fn highpass(cutoff: f64, sample_rate: f64, order: usize) -> SosFilter {
        let wn = Self::prewarp(cutoff, sample_rate);
        SosFilter::new(Self::design_highpass(wn, order.max(1)))
    }

    /// Prewarp frequency for bilinear transform
    fn prewarp(freq: f64, sample_rate: f64) -> f64 {
        (PI * freq / sample_rate).tan()
    }

    fn design_highpass(wn: f64, order: usize) -> Vec<BiquadCoeffs> {
        let num_sections = (order + 1) / 2;
        let mut sections = Vec::with_capacity(num_sections);

        for k in 0..num_sections {
            if order % 2 == 1 && k == num_sections - 1 {
                // First-order section: H(s) = s / (s + wn)
                let k_coeff = 1.0 / (1.0 + wn);
                sections.push(BiquadCoeffs {
                    b0: k_coeff,
                    b1: -k_coeff,
                    b2: 0.0,
                    a1: (wn - 1.0) / (wn + 1.0),
                    a2: 0.0,
                });
            } else {
                // Analog pole pair s^2 + 2 sin(theta) s + 1
                let theta = PI * (2.0 * k as f64 + 1.0) / (2.0 * order as f64);
                let damping = 2.0 * theta.sin();
                let wn2 = wn * wn;
                let denom = 1.0 + damping * wn + wn2;

                sections.push(BiquadCoeffs {
                    b0: 1.0 / denom,
                    b1: -2.0 / denom,
                    b2: 1.0 / denom,
                    a1: 2.0 * (wn2 - 1.0) / denom,
                    a2: (1.0 - damping * wn + wn2) / denom,
                });
            }
        }

        sections
    }
}

/// Band-reject filter for line noise
pub struct BandStopFilter;

impl BandStopFilter {
    /// Notch centred on the middle of `low..high`, Q = centre / bandwidth
    pub fn design(low: f64, high: f64, sample_rate: f64) -> SosFilter {
        let center = (low + high) / 2.0;
        let q = center / (high - low);
        let w0 = 2.0 * PI * center / sample_rate;

        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);
        let a0 = 1.0 + alpha;

        SosFilter::new(vec![BiquadCoeffs {
            b0: 1.0 / a0,
            b1: -2.0 * cos_w0 / a0,
            b2: 1.0 / a0,
            a1: -2.0 * cos_w0 / a0,
            a2: (1.0 - alpha) / a0,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, sample_rate: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / sample_rate).sin())
            .collect()
    }

    fn rms(signal: &[f64]) -> f64 {
        (signal.iter().map(|x| x * x).sum::<f64>() / signal.len() as f64).sqrt()
    }

    #[test]
    fn test_highpass_is_stable_and_blocks_dc() {
        let mut filter = ButterworthFilter::highpass(1.0, 500.0, 4);
        let mut out = 0.0;
        for _ in 0..20_000 {
            out = filter.process(1.0);
            assert!(out.is_finite());
        }
        assert!(out.abs() < 1e-6, "DC leaked through: {}", out);
    }

    #[test]
    fn test_highpass_passes_band() {
        let filter = ButterworthFilter::highpass(0.5, 1000.0, 4);
        let signal = sine(40.0, 1000.0, 2000);
        let filtered = filter.filtfilt(&signal);
        assert!((rms(&filtered) / rms(&signal) - 1.0).abs() < 0.02);
    }

    #[test]
    fn test_filtfilt_removes_offset() {
        let filter = ButterworthFilter::highpass(0.5, 1000.0, 4);
        let signal: Vec<f64> = sine(20.0, 1000.0, 2000)
            .into_iter()
            .map(|x| x + 5000.0)
            .collect();
        let filtered = filter.filtfilt(&signal);
        let mean = filtered[500..1500].iter().sum::<f64>() / 1000.0;
        assert!(mean.abs() < 1.0, "offset survived: {}", mean);
    }

    #[test]
    fn test_bandstop_attenuates_line_noise() {
        let filter = BandStopFilter::design(58.0, 62.0, 1000.0);
        let noise = sine(60.0, 1000.0, 4000);
        let filtered = filter.filtfilt(&noise);
        assert!(rms(&filtered[500..3500]) < rms(&noise) * 0.05);

        let alpha = sine(10.0, 1000.0, 4000);
        let kept = filter.filtfilt(&alpha);
        assert!(rms(&kept[500..3500]) > rms(&alpha) * 0.95);
    }

    #[test]
    fn test_filtfilt_has_no_phase_shift() {
        let filter = ButterworthFilter::highpass(0.5, 1000.0, 4).then(BandStopFilter::design(
            58.0, 62.0, 1000.0,
        ));
        assert_eq!(filter.num_sections(), 3);

        let signal = sine(40.0, 1000.0, 2000);
        let filtered = filter.filtfilt(&signal);
        let max_error = signal[500..1500]
            .iter()
            .zip(&filtered[500..1500])
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        assert!(max_error < 0.05, "max error {}", max_error);
    }

    #[test]
    fn test_filtfilt_settles_on_short_window() {
        let filter = ButterworthFilter::highpass(0.5, 1000.0, 4).then(BandStopFilter::design(
            58.0, 62.0, 1000.0,
        ));
        let signal = sine(40.0, 1000.0, 1000);
        let filtered = filter.filtfilt(&signal);
        let max_error = signal[250..750]
            .iter()
            .zip(&filtered[250..750])
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        assert!(max_error < 0.05, "max error {}", max_error);
    }

    #[test]
    fn test_filtfilt_removes_offset_and_ramp() {
        let filter = ButterworthFilter::highpass(0.5, 1000.0, 4);
        let tone = sine(20.0, 1000.0, 2000);
        let drifting: Vec<f64> = tone
            .iter()
            .enumerate()
            .map(|(i, x)| x + 50.0 + 3.0 * i as f64 / 1000.0)
            .collect();
        let filtered = filter.filtfilt(&drifting);
        let max_error = tone[500..1500]
            .iter()
            .zip(&filtered[500..1500])
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        assert!(max_error < 0.05, "max error {}", max_error);
    }

    #[test]
    fn test_filtfilt_short_and_empty() {
        let filter = ButterworthFilter::highpass(1.0, 100.0, 2);
        assert!(filter.filtfilt(&[]).is_empty());
        assert_eq!(filter.filtfilt(&[3.0]).len(), 1);
        assert_eq!(filter.filtfilt(&[1.0, 2.0, 3.0]).len(), 3);
    }
}
