//! Voice presence detection and classification over bar frames.
//!
//! Works entirely in the bar domain: band energy ratios, formant peaks,
//! and a coarse pitch estimate come straight from the 512-bar frame, while
//! short rolling histories of pitch and voice-band amplitude drive the
//! vibrato, tremolo, and pitch-stability measurements. Confidence is built
//! from an ordered table of named heuristics so the tie-break order stays
//! testable, then smoothed before the detected/not-detected decision.

use super::bars::{BarGrid, DEFAULT_BAR_COUNT};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Range;

/// Band edges, all in Hz.
const VOICE_LO: f32 = 80.0;
const VOICE_HI: f32 = 5_000.0;
const MID_VOICE_LO: f32 = 200.0;
const MID_VOICE_HI: f32 = 3_000.0;
const BASS_LO: f32 = 20.0;
const BASS_HI: f32 = 80.0;
const FORMANT_LO: f32 = 200.0;
const FORMANT_HI: f32 = 4_000.0;
const PITCH_LO: f32 = 85.0;
const PITCH_HI: f32 = 500.0;
const PITCH_FALLBACK_LO: f32 = 100.0;
const PITCH_FALLBACK_HI: f32 = 350.0;

const MAX_FORMANTS: usize = 4;
/// A formant peak must stand this far above the window mean.
const FORMANT_PROMINENCE: f32 = 1.5;
/// Bars below this level never count as pitch or formant peaks.
const PEAK_FLOOR: f32 = 0.05;

/// Modulation rates accepted as vibrato or tremolo.
const MODULATION_RATE_LO: f32 = 4.5;
const MODULATION_RATE_HI: f32 = 8.5;
/// Minimum peak-to-peak pitch swing for vibrato, in cents.
const VIBRATO_MIN_DEPTH_CENTS: f32 = 15.0;
/// Minimum relative envelope swing for tremolo.
const TREMOLO_MIN_DEPTH: f32 = 0.1;

/// Cents standard deviation that maps to zero pitch stability.
const STABILITY_SPREAD_CENTS: f32 = 50.0;
/// Stability above this reads as a sustained instrument tone.
const HIGH_STABILITY: f32 = 0.8;

/// Rolling histories cover roughly this much time.
const HISTORY_SECS: f32 = 0.5;
/// Confidence smoothing window in frames.
const CONFIDENCE_SMOOTHING: usize = 12;
/// Smoothed confidence (0-100) needed to report detection.
const DETECTION_THRESHOLD: f32 = 40.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Frames per second this detector is driven at (one frame per hop).
    pub frame_rate: f32,
    pub bar_count: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            frame_rate: 48_000.0 / 512.0,
            bar_count: DEFAULT_BAR_COUNT,
        }
    }
}

impl VoiceConfig {
    pub fn normalize(&mut self) {
        if !self.frame_rate.is_finite() || self.frame_rate <= 0.0 {
            self.frame_rate = 48_000.0 / 512.0;
        }
        self.bar_count = self.bar_count.max(2);
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Classification {
    #[default]
    None,
    Instrumental,
    Voice,
    Speech,
    Singing,
}

/// Result of one voice-detection frame.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSnapshot {
    pub detected: bool,
    /// Smoothed confidence, 0-100.
    pub confidence: f32,
    pub classification: Classification,
    /// Estimated fundamental in Hz, 0 when no pitch was found.
    pub pitch_hz: f32,
    /// Up to four formant frequencies, ascending.
    pub formants: Vec<f32>,
    pub vibrato: bool,
    pub vibrato_rate_hz: f32,
    pub vibrato_depth_cents: f32,
    pub tremolo: bool,
    /// 1.0 is a perfectly steady pitch, 0.0 a wildly moving one.
    pub pitch_stability: f32,
    /// Share of total energy inside the voice band.
    pub voice_ratio: f32,
    pub spectral_centroid_hz: f32,
}

impl Default for VoiceSnapshot {
    fn default() -> Self {
        Self {
            detected: false,
            confidence: 0.0,
            classification: Classification::None,
            pitch_hz: 0.0,
            formants: Vec::new(),
            vibrato: false,
            vibrato_rate_hz: 0.0,
            vibrato_depth_cents: 0.0,
            tremolo: false,
            pitch_stability: 0.0,
            voice_ratio: 0.0,
            spectral_centroid_hz: 0.0,
        }
    }
}

/// Per-frame spectral measurements feeding the heuristics and classifier.
#[derive(Debug, Clone, Copy)]
struct FrameMeasurements {
    voice_ratio: f32,
    mid_voice_ratio: f32,
    bass_ratio: f32,
    centroid_hz: f32,
    formant_count: usize,
    /// First two formants in ascending order, 0 when absent.
    formant_f1: f32,
    formant_f2: f32,
}

/// One named confidence heuristic; deltas are on the 0-100 scale.
struct Heuristic {
    name: &'static str,
    delta: f32,
    applies: fn(&FrameMeasurements) -> bool,
}

/// Evaluated top to bottom; every matching entry contributes its delta.
/// The thresholds are empirically tuned and treated as opaque constants.
const HEURISTICS: &[Heuristic] = &[
    Heuristic {
        name: "formant-cluster",
        delta: 35.0,
        applies: |m| {
            m.formant_count >= 2 && m.mid_voice_ratio >= 0.25 && (300.0..=3_500.0).contains(&m.centroid_hz)
        },
    },
    Heuristic {
        name: "formants-over-bass",
        delta: 15.0,
        applies: |m| m.formant_count >= 1 && m.bass_ratio < 0.4,
    },
    Heuristic {
        name: "mid-voice-dominant",
        delta: 20.0,
        applies: |m| m.mid_voice_ratio > 0.5 && m.formant_count >= 1,
    },
    Heuristic {
        name: "vowel-spacing",
        delta: 15.0,
        applies: |m| {
            m.formant_f1 > 0.0
                && m.formant_f2 > 0.0
                && (250.0..=900.0).contains(&m.formant_f1)
                && (800.0..=2_500.0).contains(&m.formant_f2)
                && (400.0..=2_200.0).contains(&(m.formant_f2 - m.formant_f1))
        },
    },
    Heuristic {
        name: "bass-dominant",
        delta: -30.0,
        applies: |m| m.bass_ratio > 0.5,
    },
    Heuristic {
        name: "low-centroid",
        delta: -25.0,
        applies: |m| m.centroid_hz > 0.0 && m.centroid_hz < 200.0,
    },
    Heuristic {
        name: "thin-voice-band",
        delta: -20.0,
        applies: |m| m.voice_ratio < 0.35,
    },
];

/// Modulation measurement from a rolling scalar history.
#[derive(Debug, Clone, Copy, Default)]
struct Modulation {
    rate_hz: f32,
    /// Peak-to-peak swing, in the history's own units.
    depth: f32,
}

#[derive(Debug, Clone)]
pub struct VoiceDetector {
    config: VoiceConfig,
    grid: BarGrid,
    voice_bars: Range<usize>,
    mid_voice_bars: Range<usize>,
    bass_bars: Range<usize>,
    formant_bars: Range<usize>,
    pitch_bars: Range<usize>,
    pitch_fallback_bars: Range<usize>,
    pitch_history: VecDeque<f32>,
    amplitude_history: VecDeque<f32>,
    confidence_history: VecDeque<f32>,
    history_len: usize,
    snapshot: VoiceSnapshot,
}

impl VoiceDetector {
    pub fn new(config: VoiceConfig) -> Self {
        let config = config.normalized();
        let grid = BarGrid::new(config.bar_count);
        let history_len = ((HISTORY_SECS * config.frame_rate).round() as usize).max(4);

        Self {
            voice_bars: grid.bars_in_range(VOICE_LO, VOICE_HI),
            mid_voice_bars: grid.bars_in_range(MID_VOICE_LO, MID_VOICE_HI),
            bass_bars: grid.bars_in_range(BASS_LO, BASS_HI),
            formant_bars: grid.bars_in_range(FORMANT_LO, FORMANT_HI),
            pitch_bars: grid.bars_in_range(PITCH_LO, PITCH_HI),
            pitch_fallback_bars: grid.bars_in_range(PITCH_FALLBACK_LO, PITCH_FALLBACK_HI),
            pitch_history: VecDeque::with_capacity(history_len),
            amplitude_history: VecDeque::with_capacity(history_len),
            confidence_history: VecDeque::with_capacity(CONFIDENCE_SMOOTHING),
            history_len,
            snapshot: VoiceSnapshot::default(),
            grid,
            config,
        }
    }

    pub fn config(&self) -> VoiceConfig {
        self.config
    }

    pub fn snapshot(&self) -> &VoiceSnapshot {
        &self.snapshot
    }

    /// Consume one frame of bar values (one hop) and update the voice state.
    pub fn process(&mut self, bars: &[f32]) -> VoiceSnapshot {
        let formants = self.find_formants(bars);
        let measurements = self.measure(bars, &formants);
        let pitch = self.estimate_pitch(bars);

        if pitch > 0.0 {
            push_bounded(&mut self.pitch_history, pitch, self.history_len);
        }
        let voice_amplitude = band_energy(bars, &self.voice_bars).sqrt();
        push_bounded(&mut self.amplitude_history, voice_amplitude, self.history_len);

        let (pitch_modulation, stability) = self.analyze_pitch_history();
        let vibrato = pitch_modulation.depth >= VIBRATO_MIN_DEPTH_CENTS
            && (MODULATION_RATE_LO..=MODULATION_RATE_HI).contains(&pitch_modulation.rate_hz);

        let envelope = analyze_modulation(&self.amplitude_history, self.config.frame_rate, true);
        let tremolo = envelope.depth >= TREMOLO_MIN_DEPTH
            && (MODULATION_RATE_LO..=MODULATION_RATE_HI).contains(&envelope.rate_hz);

        let raw_confidence: f32 = HEURISTICS
            .iter()
            .filter(|h| (h.applies)(&measurements))
            .map(|h| h.delta)
            .sum();
        push_bounded(
            &mut self.confidence_history,
            raw_confidence.clamp(0.0, 100.0),
            CONFIDENCE_SMOOTHING,
        );
        let confidence = self.confidence_history.iter().sum::<f32>()
            / self.confidence_history.len().max(1) as f32;
        let detected = confidence >= DETECTION_THRESHOLD;

        let classification =
            classify(&measurements, detected, vibrato, stability);

        self.snapshot = VoiceSnapshot {
            detected,
            confidence,
            classification,
            pitch_hz: pitch,
            formants,
            vibrato,
            vibrato_rate_hz: pitch_modulation.rate_hz,
            vibrato_depth_cents: pitch_modulation.depth,
            tremolo,
            pitch_stability: stability,
            voice_ratio: measurements.voice_ratio,
            spectral_centroid_hz: measurements.centroid_hz,
        };
        self.snapshot.clone()
    }

    fn measure(&self, bars: &[f32], formants: &[f32]) -> FrameMeasurements {
        let total = band_energy(bars, &(0..bars.len()));
        let voice = band_energy(bars, &self.voice_bars);
        let mid_voice = band_energy(bars, &self.mid_voice_bars);
        let bass = band_energy(bars, &self.bass_bars);

        let centroid_hz = if voice > f32::EPSILON {
            let weighted: f32 = self.voice_bars
                .clone()
                .map(|bar| self.grid.center_hz(bar) * bars[bar] * bars[bar])
                .sum();
            weighted / voice
        } else {
            0.0
        };

        FrameMeasurements {
            voice_ratio: ratio(voice, total),
            mid_voice_ratio: ratio(mid_voice, total),
            bass_ratio: ratio(bass, total),
            centroid_hz,
            formant_count: formants.len(),
            formant_f1: formants.first().copied().unwrap_or(0.0),
            formant_f2: formants.get(1).copied().unwrap_or(0.0),
        }
    }

    /// Local maxima at least 1.5x the window mean, strongest four, ascending.
    fn find_formants(&self, bars: &[f32]) -> Vec<f32> {
        let window = &bars[self.formant_bars.clone()];
        if window.is_empty() {
            return Vec::new();
        }
        let mean = window.iter().sum::<f32>() / window.len() as f32;
        let floor = (mean * FORMANT_PROMINENCE).max(PEAK_FLOOR);

        let mut peaks: Vec<(f32, f32)> = Vec::new();
        for bar in local_maxima(bars, &self.formant_bars) {
            if bars[bar] >= floor {
                peaks.push((self.grid.center_hz(bar), bars[bar]));
            }
        }
        peaks.sort_by(|a, b| b.1.total_cmp(&a.1));
        peaks.truncate(MAX_FORMANTS);

        let mut formants: Vec<f32> = peaks.into_iter().map(|(hz, _)| hz).collect();
        formants.sort_by(f32::total_cmp);
        formants
    }

    /// Strongest local maximum in the pitch window, with a wider-floor
    /// fallback scan when no clean maximum exists.
    fn estimate_pitch(&self, bars: &[f32]) -> f32 {
        let best = local_maxima(bars, &self.pitch_bars)
            .into_iter()
            .filter(|&bar| bars[bar] >= PEAK_FLOOR)
            .max_by(|&a, &b| bars[a].total_cmp(&bars[b]));
        if let Some(bar) = best {
            return self.grid.center_hz(bar);
        }

        // Fallback: loudest bar in the narrower range, local maximum or not.
        let best = self
            .pitch_fallback_bars
            .clone()
            .filter(|&bar| bars[bar] >= PEAK_FLOOR)
            .max_by(|&a, &b| bars[a].total_cmp(&bars[b]));
        match best {
            Some(bar) => self.grid.center_hz(bar),
            None => 0.0,
        }
    }

    /// Vibrato rate/depth in cents plus pitch stability from the same
    /// cents-deviation series.
    fn analyze_pitch_history(&self) -> (Modulation, f32) {
        if self.pitch_history.len() < 4 {
            return (Modulation::default(), 0.0);
        }

        let mean = self.pitch_history.iter().sum::<f32>() / self.pitch_history.len() as f32;
        if mean <= 0.0 {
            return (Modulation::default(), 0.0);
        }
        let cents: Vec<f32> = self
            .pitch_history
            .iter()
            .map(|&pitch| 1_200.0 * (pitch / mean).log2())
            .collect();

        let modulation = modulation_of(&cents, self.config.frame_rate);
        let variance = cents.iter().map(|c| c * c).sum::<f32>() / cents.len() as f32;
        let stability = (1.0 - variance.sqrt() / STABILITY_SPREAD_CENTS).clamp(0.0, 1.0);

        (modulation, stability)
    }

    /// Drop all rolling state without reallocating.
    pub fn reset(&mut self) {
        self.pitch_history.clear();
        self.amplitude_history.clear();
        self.confidence_history.clear();
        self.snapshot = VoiceSnapshot::default();
    }
}

/// Ordered rule cascade. Earlier rules win: confirmed vibrato is the
/// strongest singing cue, while high pitch stability without vibrato reads
/// as a sustained instrument even when formants are present.
fn classify(
    m: &FrameMeasurements,
    detected: bool,
    vibrato: bool,
    stability: f32,
) -> Classification {
    if vibrato && m.formant_count >= 2 {
        return Classification::Singing;
    }
    if stability > HIGH_STABILITY && !vibrato && m.formant_count >= 1 {
        return Classification::Instrumental;
    }
    if m.formant_count >= 3
        && m.mid_voice_ratio > 0.3
        && (400.0..=3_000.0).contains(&m.centroid_hz)
        && (0.3..=HIGH_STABILITY).contains(&stability)
    {
        return Classification::Singing;
    }
    if m.centroid_hz > 0.0 && m.centroid_hz < 500.0 && stability < 0.4 && m.formant_count >= 1 {
        return Classification::Speech;
    }
    if detected {
        if stability > 0.6 {
            Classification::Instrumental
        } else {
            Classification::Voice
        }
    } else {
        Classification::None
    }
}

fn band_energy(bars: &[f32], range: &Range<usize>) -> f32 {
    bars[range.clone()].iter().map(|v| v * v).sum()
}

fn ratio(part: f32, total: f32) -> f32 {
    if total > f32::EPSILON {
        (part / total).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn local_maxima(bars: &[f32], range: &Range<usize>) -> Vec<usize> {
    let mut maxima = Vec::new();
    for bar in range.clone() {
        if bar == 0 || bar + 1 >= bars.len() {
            continue;
        }
        if bars[bar] > bars[bar - 1] && bars[bar] >= bars[bar + 1] {
            maxima.push(bar);
        }
    }
    maxima
}

fn push_bounded(history: &mut VecDeque<f32>, value: f32, cap: usize) {
    if history.len() == cap {
        history.pop_front();
    }
    history.push_back(value);
}

/// Modulation rate from zero crossings of the mean-removed series and
/// peak-to-peak depth. `relative` scales depth by the mean for envelope
/// histories.
fn analyze_modulation(history: &VecDeque<f32>, frame_rate: f32, relative: bool) -> Modulation {
    if history.len() < 4 {
        return Modulation::default();
    }
    let mean = history.iter().sum::<f32>() / history.len() as f32;
    let deviations: Vec<f32> = history.iter().map(|&v| v - mean).collect();
    let mut modulation = modulation_of(&deviations, frame_rate);
    if relative {
        modulation.depth = if mean > f32::EPSILON {
            modulation.depth / mean
        } else {
            0.0
        };
    }
    modulation
}

/// Rate from sign changes (two per cycle), depth as peak-to-peak swing.
fn modulation_of(deviations: &[f32], frame_rate: f32) -> Modulation {
    let mut sign_changes = 0usize;
    let mut previous = 0.0f32;
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &d in deviations {
        if previous != 0.0 && d != 0.0 && (d > 0.0) != (previous > 0.0) {
            sign_changes += 1;
        }
        if d != 0.0 {
            previous = d;
        }
        min = min.min(d);
        max = max.max(d);
    }

    let window_secs = deviations.len() as f32 / frame_rate;
    let rate_hz = if window_secs > 0.0 {
        sign_changes as f32 / (2.0 * window_secs)
    } else {
        0.0
    };
    Modulation {
        rate_hz,
        depth: (max - min).max(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME_RATE: f32 = 48_000.0 / 512.0;

    fn detector() -> VoiceDetector {
        VoiceDetector::new(VoiceConfig::default())
    }

    /// Index of the first bar whose center is at or above `hz`.
    fn bar_at(grid: &BarGrid, hz: f32) -> usize {
        grid.centers_hz()
            .partition_point(|&f| f < hz)
            .min(DEFAULT_BAR_COUNT - 1)
    }

    /// Bar frame with peaks at the given frequencies and a silent floor.
    fn frame_with_peaks(grid: &BarGrid, peaks: &[(f32, f32)]) -> Vec<f32> {
        let mut bars = vec![0.0f32; DEFAULT_BAR_COUNT];
        for &(hz, level) in peaks {
            bars[bar_at(grid, hz)] = level;
        }
        bars
    }

    #[test]
    fn vibrato_tone_with_formants_reads_as_singing() {
        let mut detector = detector();
        let grid = BarGrid::new(DEFAULT_BAR_COUNT);
        let frames = (3.0 * FRAME_RATE) as usize;

        let mut snapshot = VoiceSnapshot::default();
        for frame in 0..frames {
            // 220 Hz fundamental with +/-30 cents of 6 Hz vibrato, plus two
            // vowel-spaced formants.
            let t = frame as f32 / FRAME_RATE;
            let cents = 30.0 * (std::f32::consts::TAU * 6.0 * t).sin();
            let pitch = 220.0 * (cents / 1_200.0).exp2();
            let bars =
                frame_with_peaks(&grid, &[(pitch, 0.9), (800.0, 0.8), (1_600.0, 0.7)]);
            snapshot = detector.process(&bars);
        }

        assert!(snapshot.vibrato, "vibrato not flagged: {snapshot:?}");
        assert!(
            (snapshot.vibrato_rate_hz - 6.0).abs() <= 1.0,
            "vibrato rate {}",
            snapshot.vibrato_rate_hz
        );
        assert!(snapshot.vibrato_depth_cents >= VIBRATO_MIN_DEPTH_CENTS);
        assert_eq!(snapshot.classification, Classification::Singing);
        assert!(snapshot.detected);
    }

    #[test]
    fn steady_tone_with_formants_reads_as_instrumental() {
        let mut detector = detector();
        let grid = BarGrid::new(DEFAULT_BAR_COUNT);
        let bars = frame_with_peaks(&grid, &[(440.0, 0.9), (1_000.0, 0.6)]);

        let mut snapshot = VoiceSnapshot::default();
        for _ in 0..(FRAME_RATE as usize) {
            snapshot = detector.process(&bars);
        }

        assert!(!snapshot.vibrato);
        assert!(snapshot.pitch_stability > HIGH_STABILITY);
        assert_eq!(snapshot.classification, Classification::Instrumental);
    }

    #[test]
    fn bass_only_spectrum_is_never_vocal() {
        let mut detector = detector();
        let grid = BarGrid::new(DEFAULT_BAR_COUNT);
        let bars = frame_with_peaks(&grid, &[(100.0, 0.9)]);

        for _ in 0..(FRAME_RATE as usize) {
            let snapshot = detector.process(&bars);
            assert_ne!(snapshot.classification, Classification::Singing);
            assert_ne!(snapshot.classification, Classification::Speech);
            assert!(!snapshot.detected, "confidence {}", snapshot.confidence);
        }
    }

    #[test]
    fn formants_report_ascending_and_capped() {
        let detector = detector();
        let grid = BarGrid::new(DEFAULT_BAR_COUNT);
        let bars = frame_with_peaks(
            &grid,
            &[
                (300.0, 0.5),
                (700.0, 0.9),
                (1_200.0, 0.8),
                (2_000.0, 0.7),
                (3_000.0, 0.6),
            ],
        );

        let formants = detector.find_formants(&bars);
        assert_eq!(formants.len(), MAX_FORMANTS);
        assert!(formants.windows(2).all(|w| w[0] < w[1]));
        // The weakest of the five peaks is dropped.
        assert!(formants.iter().all(|&hz| hz > 400.0));
    }

    #[test]
    fn pitch_falls_back_to_narrow_scan() {
        let detector = detector();
        let grid = BarGrid::new(DEFAULT_BAR_COUNT);

        // A ramp rising monotonically through the whole 85-500 Hz window has
        // no local maximum there (it crests beyond 500 Hz), so the primary
        // scan fails and the fallback picks the loudest bar in 100-350 Hz.
        let mut bars = vec![0.0f32; DEFAULT_BAR_COUNT];
        let ramp = grid.bars_in_range(80.0, 600.0);
        for (step, bar) in ramp.enumerate() {
            bars[bar] = 0.1 + 0.01 * step as f32;
        }

        let pitch = detector.estimate_pitch(&bars);
        assert!(
            (100.0..=350.0).contains(&pitch),
            "fallback pitch {pitch}"
        );
    }

    #[test]
    fn heuristics_keep_documented_order() {
        let names: Vec<_> = HEURISTICS.iter().map(|h| h.name).collect();
        assert_eq!(
            names,
            [
                "formant-cluster",
                "formants-over-bass",
                "mid-voice-dominant",
                "vowel-spacing",
                "bass-dominant",
                "low-centroid",
                "thin-voice-band",
            ]
        );
    }

    #[test]
    fn reset_clears_histories() {
        let mut detector = detector();
        let grid = BarGrid::new(DEFAULT_BAR_COUNT);
        let bars = frame_with_peaks(&grid, &[(220.0, 0.9), (800.0, 0.8)]);
        for _ in 0..20 {
            detector.process(&bars);
        }
        detector.reset();
        assert_eq!(detector.snapshot(), &VoiceSnapshot::default());
        assert!(detector.pitch_history.is_empty());
        assert!(detector.confidence_history.is_empty());
    }
}
