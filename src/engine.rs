//! Analysis engine: the single owner of every processor.
//!
//! `ingest` runs synchronously on the capture path: sanitation, level and
//! stereo statistics, loudness and true peak (order-dependent per-sample
//! filters), and the mono history write all happen inline. Transforms are
//! dispatched to the worker pool once per hop; `poll` applies whatever
//! results have come back, in hop order, and publishes the snapshot.

pub mod history;
pub mod worker;

use crate::dsp::bars::BarFrame;
use crate::dsp::beat::{BeatConfig, BeatDetector, BeatSnapshot};
use crate::dsp::fft::WindowKind;
use crate::dsp::loudness::{LoudnessConfig, LoudnessSnapshot, LufsMeter};
use crate::dsp::multires::{MultiResConfig, MultiResSpectrumAnalyzer};
use crate::dsp::spectrum::{SpectrumAnalyzer, SpectrumConfig};
use crate::dsp::true_peak::{TruePeakConfig, TruePeakDetector, TruePeakSnapshot};
use crate::dsp::voice::{VoiceConfig, VoiceDetector, VoiceSnapshot};
use crate::dsp::{AudioBlock, AudioProcessor};
use crate::util::audio::{DEFAULT_SAMPLE_RATE, LEVEL_FLOOR_DB, amplitude_to_db, sanitize_samples};
use anyhow::Result;
use history::SampleHistory;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};
use worker::{
    TransformJob, TransformOutput, TransformResult, TransformWindows, WORKER_COUNT, WorkerPool,
};

/// Samples between transform dispatches (~10.7 ms at 48 kHz).
pub const DEFAULT_HOP_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineConfig {
    pub sample_rate: f32,
    pub channels: usize,
    pub hop_size: usize,
    pub window: WindowKind,
    pub worker_count: usize,
    pub spectrum: SpectrumConfig,
    pub multires: MultiResConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 2,
            hop_size: DEFAULT_HOP_SIZE,
            window: WindowKind::Hann,
            worker_count: WORKER_COUNT,
            spectrum: SpectrumConfig::default(),
            multires: MultiResConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn normalize(&mut self) {
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            self.sample_rate = DEFAULT_SAMPLE_RATE;
        }
        self.channels = self.channels.clamp(1, 2);
        self.hop_size = self.hop_size.max(64);
        self.worker_count = self.worker_count.max(1);
        // One sample rate rules every stage.
        self.spectrum.sample_rate = self.sample_rate;
        self.multires.sample_rate = self.sample_rate;
        self.spectrum.normalize();
        self.multires.normalize();
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// Frames per second the bar-domain detectors are driven at.
    fn hop_rate(&self) -> f32 {
        self.sample_rate / self.hop_size as f32
    }
}

/// Per-channel input levels in dB, floored at -100 for silence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Levels {
    pub rms_left_db: f32,
    pub rms_right_db: f32,
    pub peak_db: f32,
}

impl Default for Levels {
    fn default() -> Self {
        Self {
            rms_left_db: LEVEL_FLOOR_DB,
            rms_right_db: LEVEL_FLOOR_DB,
            peak_db: LEVEL_FLOOR_DB,
        }
    }
}

/// Stereo-field statistics computed directly from each incoming chunk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StereoField {
    /// Pearson correlation of the two channels, [-1, 1].
    pub correlation: f32,
    /// 0 for a mono signal, 1 for fully uncorrelated/anti-phase content.
    pub width: f32,
    /// -1 full left, +1 full right.
    pub balance: f32,
    pub mid_db: f32,
    pub side_db: f32,
}

impl Default for StereoField {
    fn default() -> Self {
        Self {
            correlation: 0.0,
            width: 0.0,
            balance: 0.0,
            mid_db: LEVEL_FLOOR_DB,
            side_db: LEVEL_FLOOR_DB,
        }
    }
}

/// Everything the engine publishes, cloned out as one consistent value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisSnapshot {
    pub standard_bars: BarFrame,
    pub multires_bars: BarFrame,
    pub levels: Levels,
    pub stereo: StereoField,
    pub loudness: LoudnessSnapshot,
    pub true_peak: TruePeakSnapshot,
    pub beat: BeatSnapshot,
    pub voice: VoiceSnapshot,
    /// Hop index of the newest applied transform result.
    pub hop_index: u64,
}

pub struct Engine {
    config: EngineConfig,
    pool: WorkerPool,
    history: SampleHistory,
    /// Sanitized copy of the incoming chunk, reused across calls.
    scratch: Vec<f32>,
    mono: Vec<f32>,
    multires_window: Vec<f32>,
    samples_since_hop: usize,
    hop_index: u64,
    applied_standard: u64,
    applied_multires: u64,
    spectrum: SpectrumAnalyzer,
    multires: MultiResSpectrumAnalyzer,
    loudness: LufsMeter,
    true_peak: TruePeakDetector,
    beat: BeatDetector,
    voice: VoiceDetector,
    levels: Levels,
    stereo: StereoField,
    shared: Arc<RwLock<AnalysisSnapshot>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let config = config.normalized();
        let pool = WorkerPool::spawn(config.worker_count, config.window, config.sample_rate)?;

        let history_len = config
            .multires
            .max_fft_size()
            .max(config.spectrum.fft_size);
        let hop_rate = config.hop_rate();

        Ok(Self {
            pool,
            history: SampleHistory::with_capacity(history_len),
            scratch: Vec::new(),
            mono: Vec::new(),
            multires_window: vec![0.0; config.multires.max_fft_size()],
            samples_since_hop: 0,
            hop_index: 0,
            applied_standard: 0,
            applied_multires: 0,
            spectrum: SpectrumAnalyzer::new(config.spectrum),
            multires: MultiResSpectrumAnalyzer::new(config.multires),
            loudness: LufsMeter::new(LoudnessConfig {
                sample_rate: config.sample_rate,
                channels: config.channels,
            }),
            true_peak: TruePeakDetector::new(TruePeakConfig {
                sample_rate: config.sample_rate,
                channels: config.channels,
                ..TruePeakConfig::default()
            }),
            beat: BeatDetector::new(BeatConfig {
                frame_rate: hop_rate,
                bar_count: config.spectrum.bar_count,
                ..BeatConfig::default()
            }),
            voice: VoiceDetector::new(VoiceConfig {
                frame_rate: hop_rate,
                bar_count: config.spectrum.bar_count,
            }),
            levels: Levels::default(),
            stereo: StereoField::default(),
            shared: Arc::new(RwLock::new(AnalysisSnapshot::default())),
            config,
        })
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    /// Handle callers can keep to read the latest snapshot from another
    /// thread without going through the engine.
    pub fn shared_snapshot(&self) -> Arc<RwLock<AnalysisSnapshot>> {
        Arc::clone(&self.shared)
    }

    pub fn snapshot(&self) -> AnalysisSnapshot {
        self.shared.read().clone()
    }

    /// Feed one chunk of interleaved samples. Runs the inline analyses,
    /// schedules transform work at hop boundaries, and applies any results
    /// that have already come back.
    pub fn ingest(&mut self, samples: &[f32]) {
        let channels = self.config.channels;
        let usable = samples.len() - samples.len() % channels;
        if usable == 0 {
            return;
        }

        self.scratch.clear();
        self.scratch.extend_from_slice(&samples[..usable]);
        let corrected = sanitize_samples(&mut self.scratch);
        if corrected > 0 {
            debug!("sanitized {corrected} non-finite or out-of-range samples");
        }

        self.update_levels_and_stereo();
        self.run_inline_processors();
        self.mix_to_history();

        self.samples_since_hop += usable / channels;
        while self.samples_since_hop >= self.config.hop_size {
            self.samples_since_hop -= self.config.hop_size;
            self.hop_index += 1;
            self.dispatch_transforms();
        }

        // The inline results are fresh even when no transform has landed.
        while let Some(result) = self.pool.try_recv() {
            self.apply_result(result);
        }
        self.publish();
    }

    /// Apply any completed transform results without feeding new input.
    /// Returns how many results were applied.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Some(result) = self.pool.try_recv() {
            if self.apply_result(result) {
                applied += 1;
            }
        }
        if applied > 0 {
            self.publish();
        }
        applied
    }

    /// Clear every processor and history. In-flight transform jobs keep
    /// their old hop indices and are discarded as stale when they land.
    pub fn reset(&mut self) {
        self.history.clear();
        self.samples_since_hop = 0;
        self.applied_standard = self.hop_index;
        self.applied_multires = self.hop_index;
        self.spectrum.reset();
        self.multires.reset();
        self.loudness.reset();
        self.true_peak.reset();
        self.beat.reset();
        self.voice.reset();
        self.levels = Levels::default();
        self.stereo = StereoField::default();
        self.publish();
    }

    fn update_levels_and_stereo(&mut self) {
        let channels = self.config.channels;
        let frames = self.scratch.len() / channels;
        if frames == 0 {
            return;
        }

        let mut sum_l = 0.0f64;
        let mut sum_r = 0.0f64;
        let mut sum_ll = 0.0f64;
        let mut sum_rr = 0.0f64;
        let mut sum_lr = 0.0f64;
        let mut sum_mid = 0.0f64;
        let mut sum_side = 0.0f64;
        let mut peak = 0.0f32;

        for frame in self.scratch.chunks_exact(channels) {
            let l = frame[0];
            let r = frame[channels - 1];
            sum_l += l as f64;
            sum_r += r as f64;
            sum_ll += (l as f64) * (l as f64);
            sum_rr += (r as f64) * (r as f64);
            sum_lr += (l as f64) * (r as f64);
            let mid = 0.5 * (l + r);
            let side = 0.5 * (l - r);
            sum_mid += (mid as f64) * (mid as f64);
            sum_side += (side as f64) * (side as f64);
            peak = peak.max(l.abs()).max(r.abs());
        }

        let n = frames as f64;
        let rms_l = (sum_ll / n).sqrt() as f32;
        let rms_r = (sum_rr / n).sqrt() as f32;
        self.levels = Levels {
            rms_left_db: amplitude_to_db(rms_l, LEVEL_FLOOR_DB),
            rms_right_db: amplitude_to_db(rms_r, LEVEL_FLOOR_DB),
            peak_db: amplitude_to_db(peak, LEVEL_FLOOR_DB),
        };

        // Pearson correlation; degenerate channels report 0.
        let cov = sum_lr / n - (sum_l / n) * (sum_r / n);
        let var_l = sum_ll / n - (sum_l / n).powi(2);
        let var_r = sum_rr / n - (sum_r / n).powi(2);
        let denom = (var_l * var_r).sqrt();
        // Silence or a flat channel has no meaningful correlation or width.
        let degenerate = denom <= f64::EPSILON;
        let correlation = if degenerate {
            0.0
        } else {
            ((cov / denom) as f32).clamp(-1.0, 1.0)
        };

        let energy_l = sum_ll as f32;
        let energy_r = sum_rr as f32;
        let balance = if energy_l + energy_r > f32::EPSILON {
            ((energy_r - energy_l) / (energy_r + energy_l)).clamp(-1.0, 1.0)
        } else {
            0.0
        };

        self.stereo = StereoField {
            correlation,
            width: if degenerate {
                0.0
            } else {
                (1.0 - correlation) * 0.5
            },
            balance,
            mid_db: amplitude_to_db((sum_mid / n).sqrt() as f32, LEVEL_FLOOR_DB),
            side_db: amplitude_to_db((sum_side / n).sqrt() as f32, LEVEL_FLOOR_DB),
        };
    }

    fn run_inline_processors(&mut self) {
        let block = AudioBlock::new(&self.scratch, self.config.channels, self.config.sample_rate);
        // Snapshots are pulled from the processors at publish time; the
        // updates only mark that fresh values exist.
        let _ = self.loudness.process_block(&block);
        let _ = self.true_peak.process_block(&block);
    }

    fn mix_to_history(&mut self) {
        let channels = self.config.channels;
        self.mono.clear();
        self.mono.reserve(self.scratch.len() / channels);
        let scale = 1.0 / channels as f32;
        for frame in self.scratch.chunks_exact(channels) {
            self.mono.push(frame.iter().sum::<f32>() * scale);
        }
        self.history.push_slice(&self.mono);
    }

    fn dispatch_transforms(&mut self) {
        let fft_size = self.spectrum.config().fft_size;
        let mut window = vec![0.0f32; fft_size];
        self.history.copy_latest(&mut window);
        self.pool.submit(TransformJob {
            hop_index: self.hop_index,
            windows: TransformWindows::Standard(window),
        });

        // All band windows end at the same write position; each is a tail
        // slice of the largest extraction.
        self.history.copy_latest(&mut self.multires_window);
        let windows: Vec<Vec<f32>> = self
            .multires
            .config()
            .bands
            .iter()
            .map(|band| {
                let len = band.fft_size.min(self.multires_window.len());
                self.multires_window[self.multires_window.len() - len..].to_vec()
            })
            .collect();
        self.pool.submit(TransformJob {
            hop_index: self.hop_index,
            windows: TransformWindows::MultiRes(windows),
        });
    }

    /// Apply one transform result, discarding anything at or before the
    /// last applied hop for its mode. Returns whether state changed.
    fn apply_result(&mut self, result: TransformResult) -> bool {
        match result.output {
            TransformOutput::Standard(spectrum) => {
                if result.hop_index <= self.applied_standard {
                    trace!("discarding stale standard result for hop {}", result.hop_index);
                    return false;
                }
                self.applied_standard = result.hop_index;
                let frame = self.spectrum.process(&spectrum);
                // Bar-domain detectors run once per applied standard hop.
                self.beat.process(&frame.values);
                self.voice.process(&frame.values);
                true
            }
            TransformOutput::MultiRes(spectra) => {
                if result.hop_index <= self.applied_multires {
                    trace!("discarding stale multires result for hop {}", result.hop_index);
                    return false;
                }
                self.applied_multires = result.hop_index;
                self.multires.process(&spectra);
                true
            }
        }
    }

    fn publish(&mut self) {
        let snapshot = AnalysisSnapshot {
            standard_bars: self.spectrum.frame().clone(),
            multires_bars: self.multires.frame().clone(),
            levels: self.levels,
            stereo: self.stereo,
            loudness: self.loudness.snapshot().clone(),
            true_peak: self.true_peak.snapshot().clone(),
            beat: *self.beat.snapshot(),
            voice: self.voice.snapshot().clone(),
            hop_index: self.applied_standard.max(self.applied_multires),
        };
        *self.shared.write() = snapshot;
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("hop_index", &self.hop_index)
            .field("applied_standard", &self.applied_standard)
            .field("applied_multires", &self.applied_multires)
            .finish()
    }
}
