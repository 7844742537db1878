//! Beat detection over the 512-bar spectral frames.
//!
//! The detector cycles continuously through onset accumulation, periodic
//! tempo re-estimation, and phase-locked beat prediction. It is driven
//! once per hop and keeps a deterministic clock from its frame counter,
//! so the same frame sequence always yields the same beats.

use super::bars::{BarGrid, DEFAULT_BAR_COUNT};
use crate::dsp::Reconfigurable;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Range;
use tracing::debug;

/// Onset history length in frames (~5.5 s at the default hop rate).
const ONSET_HISTORY_LEN: usize = 512;
/// Bounded tempo-estimate history, median-smoothed.
const TEMPO_HISTORY_LEN: usize = 8;
/// Seconds between tempo re-estimations.
const TEMPO_INTERVAL_SECS: f32 = 0.5;

/// Total band energy below this level counts as silence.
const SILENCE_THRESHOLD: f32 = 0.015;
const SILENCE_RESET_SECS: f32 = 3.0;
/// Tempo assumed when sound resumes after a silence reset.
const RESUME_BPM: f32 = 120.0;

/// Adaptive threshold: fraction of the triggering level retained after an
/// onset, geometric decay per frame, and floor.
const THRESHOLD_RATIO: f32 = 0.7;
const THRESHOLD_DECAY: f32 = 0.995;
const THRESHOLD_FLOOR: f32 = 0.01;

/// Multiplicative bonus for autocorrelation lags in the common-tempo range.
const MID_TEMPO_LO_BPM: f32 = 85.0;
const MID_TEMPO_HI_BPM: f32 = 135.0;
const MID_TEMPO_BONUS: f32 = 1.15;
/// Relative tolerance for treating a candidate as an octave error.
const OCTAVE_TOLERANCE: f32 = 0.08;

/// Fraction of the observed onset offset folded into the next beat
/// reference.
const PHASE_CORRECTION: f32 = 0.3;
/// Phase beyond which a strong onset may confirm the beat early.
const EARLY_BEAT_PHASE: f32 = 0.85;
const EARLY_BEAT_ONSET: f32 = 0.5;
/// Fixed 4/4 assumption: every 4th confirmed beat is a downbeat.
const BEATS_PER_BAR: u64 = 4;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BeatConfig {
    /// Frames per second this detector is driven at (one frame per hop).
    pub frame_rate: f32,
    pub bar_count: usize,
    pub min_bpm: f32,
    pub max_bpm: f32,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            frame_rate: 48_000.0 / 512.0,
            bar_count: DEFAULT_BAR_COUNT,
            min_bpm: 60.0,
            max_bpm: 180.0,
        }
    }
}

impl BeatConfig {
    pub fn normalize(&mut self) {
        if !self.frame_rate.is_finite() || self.frame_rate <= 0.0 {
            self.frame_rate = 48_000.0 / 512.0;
        }
        self.bar_count = self.bar_count.max(2);
        if !(self.min_bpm > 0.0) {
            self.min_bpm = 60.0;
        }
        if self.max_bpm <= self.min_bpm {
            self.max_bpm = self.min_bpm * 3.0;
        }
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }
}

/// Frequency band contributing to onset strength.
#[derive(Debug, Clone)]
struct OnsetBand {
    name: &'static str,
    bars: Range<usize>,
    weight: f32,
    threshold: f32,
    previous_energy: f32,
}

impl OnsetBand {
    fn new(name: &'static str, grid: &BarGrid, lo_hz: f32, hi_hz: f32, weight: f32) -> Self {
        Self {
            name,
            bars: grid.bars_in_range(lo_hz, hi_hz),
            weight,
            threshold: THRESHOLD_FLOOR,
            previous_energy: 0.0,
        }
    }

    fn energy(&self, bars: &[f32]) -> f32 {
        let slice = &bars[self.bars.clone()];
        if slice.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = slice.iter().map(|v| v * v).sum();
        (sum_sq / slice.len() as f32).sqrt()
    }

    /// Returns this band's weighted onset contribution and updates the
    /// adaptive threshold.
    fn onset(&mut self, bars: &[f32]) -> (f32, f32) {
        let energy = self.energy(bars);
        let flux = (energy - self.previous_energy).max(0.0);
        self.previous_energy = energy;

        let energy_over = (energy - self.threshold).max(0.0);
        let flux_over = (flux - self.threshold * 0.5).max(0.0);
        let contribution = self.weight * (energy_over + 2.0 * flux_over);

        if contribution > 0.0 {
            self.threshold = THRESHOLD_RATIO * energy.max(flux);
        } else {
            self.threshold = (self.threshold * THRESHOLD_DECAY).max(THRESHOLD_FLOOR);
        }

        (contribution, energy)
    }

    fn reset(&mut self) {
        self.threshold = THRESHOLD_FLOOR;
        self.previous_energy = 0.0;
    }
}

/// Result of one beat-detection frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatSnapshot {
    /// Median-smoothed tempo, 0 while no confident estimate exists.
    pub bpm: f32,
    pub confidence: f32,
    /// True on the frame a beat fires.
    pub beat: bool,
    /// Position within the current beat interval, [0, 1).
    pub beat_phase: f32,
    /// Onset strength at the moment the last beat fired.
    pub beat_strength: f32,
    pub downbeat: bool,
    pub beat_count: u64,
}

impl Default for BeatSnapshot {
    fn default() -> Self {
        Self {
            bpm: 0.0,
            confidence: 0.0,
            beat: false,
            beat_phase: 0.0,
            beat_strength: 0.0,
            downbeat: false,
            beat_count: 0,
        }
    }
}

/// Multi-band onset detector with autocorrelation tempo tracking.
#[derive(Debug, Clone)]
pub struct BeatDetector {
    config: BeatConfig,
    bands: [OnsetBand; 3],
    onset_history: VecDeque<f32>,
    tempo_history: VecDeque<f32>,
    tempo_interval_frames: u64,
    silence_reset_frames: u64,
    frame: u64,
    last_estimate_frame: u64,
    silence_frames: u64,
    bpm: f32,
    confidence: f32,
    correlation: f32,
    /// Frame index (fractional) of the most recent beat reference.
    beat_ref: f64,
    beat_count: u64,
    beat_strength: f32,
    snapshot: BeatSnapshot,
}

impl BeatDetector {
    pub fn new(config: BeatConfig) -> Self {
        let config = config.normalized();
        let grid = BarGrid::new(config.bar_count);
        let bands = [
            OnsetBand::new("kick", &grid, 60.0, 150.0, 1.5),
            OnsetBand::new("snare", &grid, 150.0, 300.0, 1.0),
            OnsetBand::new("hi-hat", &grid, 3_000.0, 10_000.0, 0.7),
        ];

        Self {
            bands,
            onset_history: VecDeque::with_capacity(ONSET_HISTORY_LEN),
            tempo_history: VecDeque::with_capacity(TEMPO_HISTORY_LEN),
            tempo_interval_frames: (TEMPO_INTERVAL_SECS * config.frame_rate).max(1.0) as u64,
            silence_reset_frames: (SILENCE_RESET_SECS * config.frame_rate).max(1.0) as u64,
            frame: 0,
            last_estimate_frame: 0,
            silence_frames: 0,
            bpm: 0.0,
            confidence: 0.0,
            correlation: 0.0,
            beat_ref: 0.0,
            beat_count: 0,
            beat_strength: 0.0,
            snapshot: BeatSnapshot::default(),
            config,
        }
    }

    pub fn config(&self) -> BeatConfig {
        self.config
    }

    pub fn snapshot(&self) -> &BeatSnapshot {
        &self.snapshot
    }

    /// Consume one frame of bar values (one hop) and update the beat state.
    pub fn process(&mut self, bars: &[f32]) -> BeatSnapshot {
        self.frame += 1;

        let mut onset = 0.0f32;
        let mut total_energy = 0.0f32;
        for band in &mut self.bands {
            let (contribution, energy) = band.onset(bars);
            onset += contribution;
            total_energy += energy;
        }
        let onset = onset.min(1.0);

        if self.handle_silence(total_energy) {
            self.snapshot = BeatSnapshot {
                beat_count: self.beat_count,
                ..BeatSnapshot::default()
            };
            return self.snapshot;
        }

        if self.onset_history.len() == ONSET_HISTORY_LEN {
            self.onset_history.pop_front();
        }
        self.onset_history.push_back(onset);

        if self.frame - self.last_estimate_frame >= self.tempo_interval_frames {
            self.last_estimate_frame = self.frame;
            self.estimate_tempo();
        }

        let (beat, downbeat, phase) = self.track_beat(onset);

        self.snapshot = BeatSnapshot {
            bpm: self.bpm,
            confidence: self.confidence,
            beat,
            beat_phase: phase,
            beat_strength: self.beat_strength,
            downbeat,
            beat_count: self.beat_count,
        };
        self.snapshot
    }

    /// Returns true while the detector sits in the silence-reset state.
    fn handle_silence(&mut self, total_energy: f32) -> bool {
        if total_energy < SILENCE_THRESHOLD {
            self.silence_frames += 1;
            if self.silence_frames >= self.silence_reset_frames && self.bpm != 0.0 {
                debug!("beat detector entering silence reset after {} frames", self.silence_frames);
                self.bpm = 0.0;
                self.confidence = 0.0;
                self.correlation = 0.0;
                self.tempo_history.clear();
                self.onset_history.clear();
                self.beat_ref = self.frame as f64;
            }
            return self.silence_frames >= self.silence_reset_frames;
        }

        if self.silence_frames >= self.silence_reset_frames || self.bpm == 0.0 {
            // Sound resumed; start from a neutral assumption.
            self.bpm = RESUME_BPM;
            self.beat_ref = self.frame as f64;
        }
        self.silence_frames = 0;
        false
    }

    fn estimate_tempo(&mut self) {
        let history: Vec<f32> = self.onset_history.iter().copied().collect();
        let lag_min = (60.0 * self.config.frame_rate / self.config.max_bpm).floor() as usize;
        let lag_max = (60.0 * self.config.frame_rate / self.config.min_bpm).ceil() as usize;
        if history.len() < lag_max * 2 || lag_min < 2 {
            return;
        }

        let mut best_lag = 0usize;
        let mut best_score = 0.0f32;
        let mut best_correlation = 0.0f32;

        for lag in lag_min..=lag_max {
            let correlation = normalized_autocorrelation(&history, lag);
            let bpm = 60.0 * self.config.frame_rate / lag as f32;
            let score = if (MID_TEMPO_LO_BPM..=MID_TEMPO_HI_BPM).contains(&bpm) {
                correlation * MID_TEMPO_BONUS
            } else {
                correlation
            };
            if score > best_score {
                best_score = score;
                best_lag = lag;
                best_correlation = correlation;
            }
        }

        if best_lag == 0 || best_correlation <= 0.0 {
            return;
        }

        let mut candidate = 60.0 * self.config.frame_rate / best_lag as f32;

        // Octave-error correction: snap to the running tempo's octave only
        // when the onset train actually supports that lag too, so a genuine
        // half/double-time track can still pull the estimate away.
        if self.bpm > 0.0 {
            for factor in [2.0f32, 0.5] {
                let alternative = candidate * factor;
                if (alternative - self.bpm).abs() / self.bpm >= OCTAVE_TOLERANCE {
                    continue;
                }
                let alt_lag = (60.0 * self.config.frame_rate / alternative).round() as usize;
                if (lag_min..=lag_max).contains(&alt_lag)
                    && normalized_autocorrelation(&history, alt_lag) >= 0.8 * best_correlation
                {
                    candidate = alternative;
                    break;
                }
            }
        }
        let candidate = candidate.clamp(self.config.min_bpm, self.config.max_bpm);

        if self.tempo_history.len() == TEMPO_HISTORY_LEN {
            self.tempo_history.pop_front();
        }
        self.tempo_history.push_back(candidate);

        let median = median(&mut self.tempo_history.iter().copied().collect::<Vec<f32>>());
        self.bpm = median;
        self.correlation = best_correlation;
        self.confidence = self.estimate_confidence(median);
    }

    /// Confidence from estimate clustering, history fill, and raw
    /// correlation strength.
    fn estimate_confidence(&self, median: f32) -> f32 {
        if median <= 0.0 || self.tempo_history.is_empty() {
            return 0.0;
        }
        let deviation: f32 = self
            .tempo_history
            .iter()
            .map(|bpm| (bpm - median).abs())
            .sum::<f32>()
            / self.tempo_history.len() as f32;
        let cluster_score = (1.0 - deviation / 10.0).max(0.0);
        let fill_score = self.tempo_history.len() as f32 / TEMPO_HISTORY_LEN as f32;
        let correlation_score = self.correlation.clamp(0.0, 1.0);

        (0.5 * cluster_score + 0.2 * fill_score + 0.3 * correlation_score).clamp(0.0, 1.0)
    }

    fn track_beat(&mut self, onset: f32) -> (bool, bool, f32) {
        if self.bpm <= 0.0 {
            return (false, false, 0.0);
        }

        let interval = 60.0 * self.config.frame_rate as f64 / self.bpm as f64;
        let mut phase = ((self.frame as f64 - self.beat_ref) / interval).max(0.0);
        let mut beat = false;

        if phase >= 1.0 {
            // Predicted beat: the phase wrapped on its own.
            while phase >= 1.0 {
                self.beat_ref += interval;
                phase -= 1.0;
            }
            beat = true;
        } else if phase as f32 >= EARLY_BEAT_PHASE && onset >= EARLY_BEAT_ONSET {
            // Strong onset just ahead of the prediction: confirm the beat
            // now and nudge the reference toward the observed onset rather
            // than snapping to it.
            let predicted_next = self.beat_ref + interval;
            let observed = self.frame as f64;
            self.beat_ref =
                predicted_next + (observed - predicted_next) * PHASE_CORRECTION as f64;
            phase = 0.0;
            beat = true;
        }

        let mut downbeat = false;
        if beat {
            self.beat_count += 1;
            self.beat_strength = onset;
            downbeat = self.beat_count % BEATS_PER_BAR == 1;
        }

        (beat, downbeat, phase as f32)
    }

    /// Clear all histories, thresholds, and tracking state without
    /// reallocating.
    pub fn reset(&mut self) {
        for band in &mut self.bands {
            band.reset();
        }
        self.onset_history.clear();
        self.tempo_history.clear();
        self.frame = 0;
        self.last_estimate_frame = 0;
        self.silence_frames = 0;
        self.bpm = 0.0;
        self.confidence = 0.0;
        self.correlation = 0.0;
        self.beat_ref = 0.0;
        self.beat_count = 0;
        self.beat_strength = 0.0;
        self.snapshot = BeatSnapshot::default();
    }

    /// Rebuild derived state for a new configuration. Tempo tracking
    /// restarts: retuning the bounds invalidates the estimate history.
    fn apply_config(&mut self, config: BeatConfig) {
        let config = config.normalized();
        let grid = BarGrid::new(config.bar_count);
        self.bands = [
            OnsetBand::new("kick", &grid, 60.0, 150.0, 1.5),
            OnsetBand::new("snare", &grid, 150.0, 300.0, 1.0),
            OnsetBand::new("hi-hat", &grid, 3_000.0, 10_000.0, 0.7),
        ];
        self.tempo_interval_frames = (TEMPO_INTERVAL_SECS * config.frame_rate).max(1.0) as u64;
        self.silence_reset_frames = (SILENCE_RESET_SECS * config.frame_rate).max(1.0) as u64;
        self.config = config;
        self.reset();
    }

    #[cfg(test)]
    fn band_names(&self) -> [&'static str; 3] {
        [self.bands[0].name, self.bands[1].name, self.bands[2].name]
    }
}

impl Reconfigurable<BeatConfig> for BeatDetector {
    fn update_config(&mut self, config: BeatConfig) {
        self.apply_config(config);
    }
}

/// Normalized cross-correlation of a sequence with itself at `lag`.
fn normalized_autocorrelation(values: &[f32], lag: usize) -> f32 {
    if lag == 0 || values.len() <= lag {
        return 0.0;
    }

    let mut numerator = 0.0f32;
    let mut energy_a = 0.0f32;
    let mut energy_b = 0.0f32;
    for i in lag..values.len() {
        numerator += values[i] * values[i - lag];
        energy_a += values[i] * values[i];
        energy_b += values[i - lag] * values[i - lag];
    }

    let denominator = (energy_a * energy_b).sqrt();
    if denominator <= f32::EPSILON {
        0.0
    } else {
        numerator / denominator
    }
}

fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) * 0.5
    } else {
        values[mid]
    }
}

/// Manual tap-tempo input, averaging recent tap intervals.
#[derive(Debug, Clone, Default)]
pub struct TapTempo {
    taps: Vec<f64>,
}

impl TapTempo {
    const MAX_TAPS: usize = 8;
    /// A gap this long between taps starts a fresh measurement.
    const RESTART_GAP_SECS: f64 = 2.0;

    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tap at `now` seconds and return the running estimate.
    pub fn tap(&mut self, now_secs: f64) -> Option<f32> {
        if let Some(&last) = self.taps.last()
            && now_secs - last > Self::RESTART_GAP_SECS
        {
            self.taps.clear();
        }

        self.taps.push(now_secs);
        if self.taps.len() > Self::MAX_TAPS {
            self.taps.remove(0);
        }
        self.bpm()
    }

    pub fn bpm(&self) -> Option<f32> {
        if self.taps.len() < 2 {
            return None;
        }
        let span = self.taps.last().unwrap() - self.taps.first().unwrap();
        let intervals = (self.taps.len() - 1) as f64;
        let mean_interval = span / intervals;
        if mean_interval <= 0.0 {
            return None;
        }
        Some((60.0 / mean_interval) as f32)
    }

    pub fn reset(&mut self) {
        self.taps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME_RATE: f32 = 48_000.0 / 512.0;

    /// Drive the detector with a synthetic click track for `secs`,
    /// returning the last snapshot.
    fn run_click_track(detector: &mut BeatDetector, bpm: f32, secs: f32) -> BeatSnapshot {
        let frames = (secs * FRAME_RATE) as u64;
        let period = (60.0 / bpm * FRAME_RATE).round() as u64;
        let grid = BarGrid::new(DEFAULT_BAR_COUNT);
        let kick = grid.bars_in_range(60.0, 150.0);

        let mut snapshot = BeatSnapshot::default();
        for frame in 0..frames {
            let mut bars = vec![0.02f32; DEFAULT_BAR_COUNT];
            if frame % period < 2 {
                for bar in kick.clone() {
                    bars[bar] = 0.85;
                }
            }
            snapshot = detector.process(&bars);
        }
        snapshot
    }

    #[test]
    fn bands_cover_kick_snare_hat() {
        let detector = BeatDetector::new(BeatConfig::default());
        assert_eq!(detector.band_names(), ["kick", "snare", "hi-hat"]);
    }

    #[test]
    fn click_track_converges_to_120_bpm() {
        let mut detector = BeatDetector::new(BeatConfig::default());
        let snapshot = run_click_track(&mut detector, 120.0, 8.0);
        assert!(
            (snapshot.bpm - 120.0).abs() <= 2.0,
            "bpm {} after 8 s",
            snapshot.bpm
        );
        assert!(snapshot.confidence > 0.5, "confidence {}", snapshot.confidence);
        assert!(snapshot.beat_count > 0);
    }

    #[test]
    fn sixty_bpm_is_not_octave_doubled() {
        let mut detector = BeatDetector::new(BeatConfig::default());
        let snapshot = run_click_track(&mut detector, 60.0, 10.0);
        assert!(
            (snapshot.bpm - 60.0).abs() <= 3.0,
            "60 BPM track reported as {}",
            snapshot.bpm
        );
    }

    #[test]
    fn downbeat_fires_every_fourth_beat() {
        let mut detector = BeatDetector::new(BeatConfig::default());
        let frames = (8.0 * FRAME_RATE) as u64;
        let period = (60.0 / 120.0 * FRAME_RATE).round() as u64;
        let grid = BarGrid::new(DEFAULT_BAR_COUNT);
        let kick = grid.bars_in_range(60.0, 150.0);

        let mut downbeats = Vec::new();
        for frame in 0..frames {
            let mut bars = vec![0.02f32; DEFAULT_BAR_COUNT];
            if frame % period < 2 {
                for bar in kick.clone() {
                    bars[bar] = 0.85;
                }
            }
            let snapshot = detector.process(&bars);
            if snapshot.downbeat {
                downbeats.push(snapshot.beat_count);
            }
        }

        assert!(!downbeats.is_empty());
        for count in &downbeats {
            assert_eq!(count % BEATS_PER_BAR, 1, "downbeat at beat {count}");
        }
    }

    #[test]
    fn prolonged_silence_resets_then_resumes_at_default() {
        let mut detector = BeatDetector::new(BeatConfig::default());
        run_click_track(&mut detector, 120.0, 6.0);
        assert!(detector.snapshot().bpm > 0.0);

        // 4 s of silence crosses the 3 s reset threshold.
        let quiet = vec![0.0f32; DEFAULT_BAR_COUNT];
        let frames = (4.0 * FRAME_RATE) as u64;
        let mut snapshot = BeatSnapshot::default();
        for _ in 0..frames {
            snapshot = detector.process(&quiet);
        }
        assert_eq!(snapshot.bpm, 0.0);
        assert_eq!(snapshot.confidence, 0.0);

        // First loud frame restores the neutral 120 BPM assumption.
        let grid = BarGrid::new(DEFAULT_BAR_COUNT);
        let mut bars = vec![0.02f32; DEFAULT_BAR_COUNT];
        for bar in grid.bars_in_range(60.0, 150.0) {
            bars[bar] = 0.8;
        }
        let snapshot = detector.process(&bars);
        assert_eq!(snapshot.bpm, RESUME_BPM);
    }

    #[test]
    fn reset_reproduces_fresh_instance() {
        let mut seasoned = BeatDetector::new(BeatConfig::default());
        run_click_track(&mut seasoned, 100.0, 4.0);
        seasoned.reset();

        let mut fresh = BeatDetector::new(BeatConfig::default());
        let a = run_click_track(&mut seasoned, 100.0, 4.0);
        let b = run_click_track(&mut fresh, 100.0, 4.0);
        assert_eq!(a, b);
    }

    #[test]
    fn tap_tempo_averages_intervals() {
        let mut tap = TapTempo::new();
        assert_eq!(tap.tap(0.0), None);
        tap.tap(0.5);
        tap.tap(1.0);
        let bpm = tap.tap(1.5).unwrap();
        assert!((bpm - 120.0).abs() < 0.5, "bpm {bpm}");

        // A long pause restarts the measurement.
        assert_eq!(tap.tap(10.0), None);
    }
}
