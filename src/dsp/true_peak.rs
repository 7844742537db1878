//! Inter-sample true peak detection per ITU-R BS.1770-4.
//!
//! Every incoming sample is pushed through a per-channel delay line and
//! evaluated against four polyphase FIR phases of a 4x upsampler; the
//! maximum filtered magnitude is the instantaneous inter-sample estimate.

use super::filters::{OVERSAMPLE_PHASES, OVERSAMPLE_TAPS, interpolation_filter};
use super::{AudioBlock, AudioProcessor, ProcessorUpdate};
use crate::util::audio::{DEFAULT_SAMPLE_RATE, amplitude_to_db};

const PEAK_FLOOR_DB: f32 = -100.0;

#[derive(Debug, Clone, Copy)]
pub struct TruePeakConfig {
    pub sample_rate: f32,
    pub channels: usize,
    /// How long a new maximum is held before release begins.
    pub hold_ms: f32,
    /// Exponential release time constant applied after the hold.
    pub release_ms: f32,
}

impl Default for TruePeakConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 2,
            hold_ms: 1_000.0,
            release_ms: 2_000.0,
        }
    }
}

/// Peak-hold/release ballistics shared by the true and sample peaks.
#[derive(Debug, Clone)]
struct PeakBallistics {
    held: f32,
    hold_remaining: usize,
    hold_samples: usize,
    release_coeff: f32,
}

impl PeakBallistics {
    fn new(sample_rate: f32, hold_ms: f32, release_ms: f32) -> Self {
        let hold_samples = ((hold_ms / 1_000.0) * sample_rate).max(1.0) as usize;
        let release_secs = (release_ms / 1_000.0).max(1e-3);
        Self {
            held: 0.0,
            hold_remaining: 0,
            hold_samples,
            release_coeff: (-1.0 / (release_secs * sample_rate)).exp(),
        }
    }

    /// Rises immediately on a new maximum; decays only after the hold
    /// interval elapses without one.
    #[inline]
    fn update(&mut self, value: f32) {
        if value > self.held {
            self.held = value;
            self.hold_remaining = self.hold_samples;
        } else if self.hold_remaining > 0 {
            self.hold_remaining -= 1;
        } else {
            self.held *= self.release_coeff;
        }
    }

    fn clear(&mut self) {
        self.held = 0.0;
        self.hold_remaining = 0;
    }
}

#[derive(Debug, Clone)]
struct ChannelState {
    delay: [f32; OVERSAMPLE_TAPS],
    write_pos: usize,
    true_peak: PeakBallistics,
    sample_peak: PeakBallistics,
}

impl ChannelState {
    fn new(config: &TruePeakConfig) -> Self {
        Self {
            delay: [0.0; OVERSAMPLE_TAPS],
            write_pos: 0,
            true_peak: PeakBallistics::new(config.sample_rate, config.hold_ms, config.release_ms),
            sample_peak: PeakBallistics::new(config.sample_rate, config.hold_ms, config.release_ms),
        }
    }
}

/// Held true/sample peaks in dBTP / dBFS.
#[derive(Debug, Clone, PartialEq)]
pub struct TruePeakSnapshot {
    pub true_peak_left_dbtp: f32,
    pub true_peak_right_dbtp: f32,
    pub true_peak_max_dbtp: f32,
    pub sample_peak_left_db: f32,
    pub sample_peak_right_db: f32,
}

impl Default for TruePeakSnapshot {
    fn default() -> Self {
        Self {
            true_peak_left_dbtp: PEAK_FLOOR_DB,
            true_peak_right_dbtp: PEAK_FLOOR_DB,
            true_peak_max_dbtp: PEAK_FLOOR_DB,
            sample_peak_left_db: PEAK_FLOOR_DB,
            sample_peak_right_db: PEAK_FLOOR_DB,
        }
    }
}

/// 4x polyphase-oversampled inter-sample peak estimator.
#[derive(Debug, Clone)]
pub struct TruePeakDetector {
    config: TruePeakConfig,
    coeffs: [[f32; OVERSAMPLE_TAPS]; OVERSAMPLE_PHASES],
    channels: Vec<ChannelState>,
    snapshot: TruePeakSnapshot,
}

impl TruePeakDetector {
    pub fn new(config: TruePeakConfig) -> Self {
        assert!(
            config.sample_rate.is_finite() && config.sample_rate > 0.0,
            "true peak detector needs a positive sample rate"
        );
        Self {
            coeffs: interpolation_filter(),
            channels: (0..config.channels.max(1))
                .map(|_| ChannelState::new(&config))
                .collect(),
            snapshot: TruePeakSnapshot::default(),
            config,
        }
    }

    pub fn config(&self) -> TruePeakConfig {
        self.config
    }

    pub fn snapshot(&self) -> &TruePeakSnapshot {
        &self.snapshot
    }

    #[inline]
    fn push_sample(coeffs: &[[f32; OVERSAMPLE_TAPS]; OVERSAMPLE_PHASES], state: &mut ChannelState, sample: f32) {
        state.delay[state.write_pos] = sample;
        state.write_pos = (state.write_pos + 1) % OVERSAMPLE_TAPS;

        let mut inter_sample_peak = 0.0f32;
        for phase in coeffs {
            let mut sum = 0.0f32;
            for (tap, coeff) in phase.iter().enumerate() {
                let idx = (state.write_pos + OVERSAMPLE_TAPS - 1 - tap) % OVERSAMPLE_TAPS;
                sum += coeff * state.delay[idx];
            }
            inter_sample_peak = inter_sample_peak.max(sum.abs());
        }

        state.true_peak.update(inter_sample_peak);
        state.sample_peak.update(sample.abs());
    }

    fn refresh_snapshot(&mut self) {
        let left = self.channels.first();
        let right = self.channels.get(1).or(left);

        let true_left = left.map_or(0.0, |c| c.true_peak.held);
        let true_right = right.map_or(0.0, |c| c.true_peak.held);

        self.snapshot = TruePeakSnapshot {
            true_peak_left_dbtp: amplitude_to_db(true_left, PEAK_FLOOR_DB),
            true_peak_right_dbtp: amplitude_to_db(true_right, PEAK_FLOOR_DB),
            true_peak_max_dbtp: amplitude_to_db(true_left.max(true_right), PEAK_FLOOR_DB),
            sample_peak_left_db: amplitude_to_db(
                left.map_or(0.0, |c| c.sample_peak.held),
                PEAK_FLOOR_DB,
            ),
            sample_peak_right_db: amplitude_to_db(
                right.map_or(0.0, |c| c.sample_peak.held),
                PEAK_FLOOR_DB,
            ),
        };
    }

    /// Clears held peaks while keeping the filter delay lines intact, so
    /// measurement resumes seamlessly mid-stream.
    pub fn reset_peaks(&mut self) {
        for channel in &mut self.channels {
            channel.true_peak.clear();
            channel.sample_peak.clear();
        }
        self.snapshot = TruePeakSnapshot::default();
    }
}

impl AudioProcessor for TruePeakDetector {
    type Output = TruePeakSnapshot;

    fn process_block(&mut self, block: &AudioBlock<'_>) -> ProcessorUpdate<Self::Output> {
        if block.frame_count() == 0 || block.channels == 0 {
            return ProcessorUpdate::None;
        }

        for frame in block.samples.chunks_exact(block.channels) {
            for (state, &sample) in self.channels.iter_mut().zip(frame) {
                Self::push_sample(&self.coeffs, state, sample);
            }
        }

        self.refresh_snapshot();
        ProcessorUpdate::Snapshot(self.snapshot.clone())
    }

    fn reset(&mut self) {
        for channel in &mut self.channels {
            channel.delay = [0.0; OVERSAMPLE_TAPS];
            channel.write_pos = 0;
            channel.true_peak.clear();
            channel.sample_peak.clear();
        }
        self.snapshot = TruePeakSnapshot::default();
    }
}
