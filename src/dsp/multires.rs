//! Multi-resolution spectrum analyzer.
//!
//! Five band-limited magnitude spectra, each computed at a transform size
//! chosen for that band's resolution needs, are merged into the same
//! 512-bar contract as the single-resolution analyzer. Low bands get the
//! bin spacing of an 8192-point transform without paying for one across
//! the whole spectrum.

use super::bars::{BarFrame, BarGrid, BarShaper, DEFAULT_BAR_COUNT, ShaperConfig};
use super::fft::MagnitudeSpectrum;
use crate::dsp::Reconfigurable;
use crate::util::audio::{DEFAULT_SAMPLE_RATE, lerp, power_to_db};
use serde::Serialize;
use std::fmt;

/// One frequency region and the transform size that serves it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResolutionBand {
    pub name: &'static str,
    pub lo_hz: f32,
    pub hi_hz: f32,
    pub fft_size: usize,
}

/// Default band plan: resolution tapers off as bar spacing widens.
pub const DEFAULT_RESOLUTION_BANDS: [ResolutionBand; 5] = [
    ResolutionBand { name: "sub-bass", lo_hz: 20.0, hi_hz: 80.0, fft_size: 8192 },
    ResolutionBand { name: "bass", lo_hz: 80.0, hi_hz: 250.0, fft_size: 4096 },
    ResolutionBand { name: "low-mid", lo_hz: 250.0, hi_hz: 1_500.0, fft_size: 2048 },
    ResolutionBand { name: "mid", lo_hz: 1_500.0, hi_hz: 6_000.0, fft_size: 2048 },
    ResolutionBand { name: "high", lo_hz: 6_000.0, hi_hz: 20_000.0, fft_size: 1024 },
];

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MultiResConfig {
    pub sample_rate: f32,
    pub bar_count: usize,
    pub bands: [ResolutionBand; 5],
    pub shaper: ShaperConfig,
}

impl Default for MultiResConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            bar_count: DEFAULT_BAR_COUNT,
            bands: DEFAULT_RESOLUTION_BANDS,
            shaper: ShaperConfig::default(),
        }
    }
}

impl MultiResConfig {
    pub fn normalize(&mut self) {
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            self.sample_rate = DEFAULT_SAMPLE_RATE;
        }
        self.bar_count = self.bar_count.max(2);
        for band in &mut self.bands {
            band.fft_size = band.fft_size.max(128);
        }
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// Largest transform size in the plan; the engine sizes its history
    /// window from this.
    pub fn max_fft_size(&self) -> usize {
        self.bands.iter().map(|b| b.fft_size).max().unwrap_or(0)
    }
}

/// Merges the five band spectra onto the shared bar grid.
pub struct MultiResSpectrumAnalyzer {
    config: MultiResConfig,
    grid: BarGrid,
    shaper: BarShaper,
    /// Band index serving each bar, resolved once from the band plan.
    bar_band: Vec<usize>,
    raw_db: Vec<f32>,
}

impl MultiResSpectrumAnalyzer {
    pub fn new(config: MultiResConfig) -> Self {
        let config = config.normalized();
        let grid = BarGrid::new(config.bar_count);
        let shaper = BarShaper::new(&grid, config.shaper);
        let bar_band = resolve_bar_bands(&grid, &config.bands);
        Self {
            shaper,
            bar_band,
            raw_db: vec![0.0; config.bar_count],
            grid,
            config,
        }
    }

    pub fn config(&self) -> MultiResConfig {
        self.config
    }

    pub fn grid(&self) -> &BarGrid {
        &self.grid
    }

    pub fn frame(&self) -> &BarFrame {
        self.shaper.frame()
    }

    /// Consume one hop's five band spectra (in band-plan order) and return
    /// the updated bars.
    pub fn process(&mut self, band_spectra: &[MagnitudeSpectrum]) -> &BarFrame {
        if band_spectra.len() != self.config.bands.len() {
            return self.shaper.frame();
        }

        for bar in 0..self.grid.bar_count() {
            let spectrum = &band_spectra[self.bar_band[bar]];
            let amplitude = interpolate_bin(spectrum, self.grid.center_hz(bar));
            self.raw_db[bar] = power_to_db(amplitude * amplitude);
        }

        self.shaper.shape(&mut self.raw_db)
    }

    pub fn reset(&mut self) {
        self.shaper.reset();
    }

    fn rebuild(&mut self) {
        self.config.normalize();
        self.grid = BarGrid::new(self.config.bar_count);
        self.shaper = BarShaper::new(&self.grid, self.config.shaper);
        self.bar_band = resolve_bar_bands(&self.grid, &self.config.bands);
        self.raw_db.resize(self.config.bar_count, 0.0);
    }
}

impl fmt::Debug for MultiResSpectrumAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiResSpectrumAnalyzer")
            .field("config", &self.config)
            .finish()
    }
}

impl Reconfigurable<MultiResConfig> for MultiResSpectrumAnalyzer {
    fn update_config(&mut self, config: MultiResConfig) {
        self.config = config.normalized();
        self.rebuild();
    }
}

fn resolve_bar_bands(grid: &BarGrid, bands: &[ResolutionBand; 5]) -> Vec<usize> {
    (0..grid.bar_count())
        .map(|bar| {
            let center = grid.center_hz(bar);
            bands
                .iter()
                .position(|band| center >= band.lo_hz && center < band.hi_hz)
                .unwrap_or(bands.len() - 1)
        })
        .collect()
}

/// Linear interpolation between the two bins straddling `freq_hz`.
fn interpolate_bin(spectrum: &MagnitudeSpectrum, freq_hz: f32) -> f32 {
    if spectrum.bin_hz <= 0.0 || spectrum.magnitudes.is_empty() {
        return 0.0;
    }

    let position = freq_hz / spectrum.bin_hz;
    let lower = position.floor() as usize;
    let frac = position - position.floor();

    let last = spectrum.magnitudes.len() - 1;
    let a = spectrum.magnitudes[lower.min(last)];
    let b = spectrum.magnitudes[(lower + 1).min(last)];
    lerp(a, b, frac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::fft::{FftEngine, WindowKind};
    use crate::dsp::spectrum::{SpectrumAnalyzer, SpectrumConfig};

    fn band_spectra_for(samples_fn: impl Fn(usize) -> Vec<f32>) -> Vec<MagnitudeSpectrum> {
        let mut engine = FftEngine::new(WindowKind::Hann, 48_000.0);
        DEFAULT_RESOLUTION_BANDS
            .iter()
            .map(|band| engine.magnitude_spectrum(&samples_fn(band.fft_size), band.fft_size))
            .collect()
    }

    fn sine(freq: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|n| (core::f32::consts::TAU * freq * n as f32 / 48_000.0).sin() * amplitude)
            .collect()
    }

    #[test]
    fn every_bar_is_served_by_the_band_containing_it() {
        let analyzer = MultiResSpectrumAnalyzer::new(MultiResConfig::default());
        for bar in 0..analyzer.grid().bar_count() {
            let center = analyzer.grid().center_hz(bar);
            let band = &analyzer.config().bands[analyzer.bar_band[bar]];
            assert!(
                center >= band.lo_hz && center < band.hi_hz,
                "bar {bar} ({center} Hz) mapped to band {}",
                band.name
            );
        }
    }

    #[test]
    fn low_frequency_sine_resolves_in_sub_bass_band() {
        let mut analyzer = MultiResSpectrumAnalyzer::new(MultiResConfig::default());
        let spectra = band_spectra_for(|len| sine(45.0, 0.6, len));
        for _ in 0..20 {
            analyzer.process(&spectra);
        }

        let near = analyzer.grid().bars_in_range(38.0, 55.0);
        let far = analyzer.grid().bars_in_range(150.0, 400.0);
        let frame = analyzer.frame();
        let near_max = near.map(|b| frame.values[b]).fold(0.0f32, f32::max);
        let far_max = far.map(|b| frame.values[b]).fold(0.0f32, f32::max);
        assert!(near_max > 0.25, "near_max={near_max}");
        assert!(near_max > far_max * 2.0, "far_max={far_max}");
    }

    #[test]
    fn matches_single_resolution_analyzer_on_synthetic_flat_input() {
        // Golden cross-check for the shared shaper: a spectrally flat input
        // must produce near-identical bars through both pipelines.
        let amplitude = 0.05f32;
        let flat = |len: usize| MagnitudeSpectrum {
            magnitudes: vec![amplitude; len / 2 + 1],
            bin_hz: 48_000.0 / len as f32,
        };

        let mut multi = MultiResSpectrumAnalyzer::new(MultiResConfig::default());
        let mut single = SpectrumAnalyzer::new(SpectrumConfig::default());

        let band_spectra: Vec<MagnitudeSpectrum> = DEFAULT_RESOLUTION_BANDS
            .iter()
            .map(|band| flat(band.fft_size))
            .collect();
        let single_spectrum = flat(4096);

        for _ in 0..30 {
            multi.process(&band_spectra);
            single.process(&single_spectrum);
        }

        for bar in 0..multi.grid().bar_count() {
            let a = multi.frame().values[bar];
            let b = single.frame().values[bar];
            assert!(
                (a - b).abs() < 0.05,
                "bar {bar}: multi={a} single={b}"
            );
        }
    }

    #[test]
    fn wrong_band_count_is_ignored() {
        let mut analyzer = MultiResSpectrumAnalyzer::new(MultiResConfig::default());
        let before = analyzer.frame().clone();
        analyzer.process(&[]);
        assert_eq!(*analyzer.frame(), before);
    }
}
