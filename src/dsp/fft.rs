//! Windowed real-FFT magnitude computation shared by the spectral path.
//!
//! Transform workers keep one [`FftEngine`] each; plans and window
//! coefficients are cached per size so the multi-resolution path can hop
//! between five transform sizes without replanning.

use crate::util::audio::DEFAULT_SAMPLE_RATE;
use realfft::{RealFftPlanner, RealToComplex};
use rustc_hash::FxHashMap;
use rustfft::num_complex::Complex32;
use std::sync::Arc;

/// Window selection controlling spectral leakage characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Rectangular,
    Hann,
    Hamming,
    Blackman,
}

impl WindowKind {
    pub(crate) fn coefficients(self, len: usize) -> Vec<f32> {
        match self {
            WindowKind::Rectangular => vec![1.0; len],
            WindowKind::Hann => (0..len)
                .map(|n| {
                    let phase = (n as f32) * core::f32::consts::TAU / (len as f32);
                    0.5 * (1.0 - phase.cos())
                })
                .collect(),
            WindowKind::Hamming => (0..len)
                .map(|n| {
                    let phase = (n as f32) * core::f32::consts::TAU / (len as f32);
                    0.54 - 0.46 * phase.cos()
                })
                .collect(),
            WindowKind::Blackman => {
                let a0 = 0.42;
                let a1 = 0.5;
                let a2 = 0.08;
                (0..len)
                    .map(|n| {
                        let phase = (n as f32) * core::f32::consts::TAU / (len as f32);
                        a0 - a1 * phase.cos() + a2 * (2.0 * phase).cos()
                    })
                    .collect()
            }
        }
    }
}

/// One magnitude spectrum with its frequency axis metadata.
#[derive(Debug, Clone, Default)]
pub struct MagnitudeSpectrum {
    /// Linear magnitudes, `fft_size / 2 + 1` bins.
    pub magnitudes: Vec<f32>,
    /// Hz per bin.
    pub bin_hz: f32,
}

impl MagnitudeSpectrum {
    /// Frequency of bin `index` in Hz.
    #[inline]
    pub fn bin_frequency(&self, index: usize) -> f32 {
        index as f32 * self.bin_hz
    }

    pub fn bin_count(&self) -> usize {
        self.magnitudes.len()
    }
}

struct PlanEntry {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    /// Amplitude normalization: 2 / sum(window), DC and Nyquist use half.
    ac_scale: f32,
    dc_scale: f32,
    real_buffer: Vec<f32>,
    spectrum_buffer: Vec<Complex32>,
    scratch_buffer: Vec<Complex32>,
}

/// Cached real-FFT machinery keyed by transform size.
pub struct FftEngine {
    planner: RealFftPlanner<f32>,
    window: WindowKind,
    sample_rate: f32,
    plans: FxHashMap<usize, PlanEntry>,
}

impl FftEngine {
    pub fn new(window: WindowKind, sample_rate: f32) -> Self {
        let sample_rate = if sample_rate.is_finite() && sample_rate > 0.0 {
            sample_rate
        } else {
            DEFAULT_SAMPLE_RATE
        };
        Self {
            planner: RealFftPlanner::new(),
            window,
            sample_rate,
            plans: FxHashMap::default(),
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn entry(&mut self, fft_size: usize) -> &mut PlanEntry {
        let window = self.window;
        let planner = &mut self.planner;
        self.plans.entry(fft_size).or_insert_with(|| {
            let fft = planner.plan_fft_forward(fft_size);
            let coefficients = window.coefficients(fft_size);
            let window_sum: f32 = coefficients.iter().sum();
            let inv_sum = if window_sum.abs() > f32::EPSILON {
                1.0 / window_sum
            } else {
                1.0 / fft_size.max(1) as f32
            };
            let spectrum_buffer = fft.make_output_vec();
            let scratch_buffer = fft.make_scratch_vec();
            PlanEntry {
                fft,
                window: coefficients,
                ac_scale: 2.0 * inv_sum,
                dc_scale: inv_sum,
                real_buffer: vec![0.0; fft_size],
                spectrum_buffer,
                scratch_buffer,
            }
        })
    }

    /// Window `samples` (length must equal `fft_size`) and return the
    /// linear amplitude spectrum.
    pub fn magnitude_spectrum(&mut self, samples: &[f32], fft_size: usize) -> MagnitudeSpectrum {
        assert_eq!(samples.len(), fft_size, "window length must match FFT size");
        let bin_hz = self.sample_rate / fft_size as f32;
        let entry = self.entry(fft_size);

        entry.real_buffer.copy_from_slice(samples);
        remove_dc(&mut entry.real_buffer);
        for (sample, coeff) in entry.real_buffer.iter_mut().zip(&entry.window) {
            *sample *= *coeff;
        }

        entry
            .fft
            .process_with_scratch(
                &mut entry.real_buffer,
                &mut entry.spectrum_buffer,
                &mut entry.scratch_buffer,
            )
            .expect("real FFT forward transform");

        let bins = fft_size / 2 + 1;
        let mut magnitudes = Vec::with_capacity(bins);
        for (idx, complex) in entry.spectrum_buffer.iter().take(bins).enumerate() {
            let scale = if idx == 0 || idx == bins - 1 {
                entry.dc_scale
            } else {
                entry.ac_scale
            };
            magnitudes.push(complex.norm() * scale);
        }

        MagnitudeSpectrum { magnitudes, bin_hz }
    }
}

impl std::fmt::Debug for FftEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FftEngine")
            .field("window", &self.window)
            .field("sample_rate", &self.sample_rate)
            .field("cached_sizes", &self.plans.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn remove_dc(buffer: &mut [f32]) {
    if buffer.is_empty() {
        return;
    }

    let mean = buffer.iter().sum::<f32>() / buffer.len() as f32;
    if mean.abs() <= f32::EPSILON {
        return;
    }

    for sample in buffer.iter_mut() {
        *sample -= mean;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, amplitude: f32, len: usize, sample_rate: f32) -> Vec<f32> {
        (0..len)
            .map(|n| {
                (core::f32::consts::TAU * freq * n as f32 / sample_rate).sin() * amplitude
            })
            .collect()
    }

    #[test]
    fn sine_peak_lands_on_expected_bin_with_unit_amplitude() {
        let mut engine = FftEngine::new(WindowKind::Hann, 48_000.0);
        let fft_size = 4096;
        // Bin-centred frequency so leakage stays negligible.
        let bin = 100;
        let freq = bin as f32 * 48_000.0 / fft_size as f32;
        let spectrum = engine.magnitude_spectrum(&sine(freq, 0.8, fft_size, 48_000.0), fft_size);

        let (peak_bin, peak_mag) = spectrum
            .magnitudes
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        assert_eq!(peak_bin, bin);
        assert!((peak_mag - 0.8).abs() < 0.02, "peak magnitude {peak_mag}");
        assert!((spectrum.bin_frequency(peak_bin) - freq).abs() < 1.0);
    }

    #[test]
    fn plans_are_cached_per_size() {
        let mut engine = FftEngine::new(WindowKind::Hann, 48_000.0);
        let _ = engine.magnitude_spectrum(&vec![0.0; 1024], 1024);
        let _ = engine.magnitude_spectrum(&vec![0.0; 2048], 2048);
        let _ = engine.magnitude_spectrum(&vec![0.0; 1024], 1024);
        assert_eq!(engine.plans.len(), 2);
    }
}
