//! Logarithmic bar mapping and the shared bar-shaping pipeline.
//!
//! Both spectrum analyzers produce the same 512-bar output contract; the
//! dB compensation, psychoacoustic boost table, normalization, gap fill,
//! fractional-octave smoothing, and attack/decay ballistics live here so
//! the two consumers cannot drift apart.

use crate::util::audio::{DB_FLOOR, power_to_db};

pub const DEFAULT_BAR_COUNT: usize = 512;
pub const MIN_FREQUENCY_HZ: f32 = 20.0;
pub const MAX_FREQUENCY_HZ: f32 = 20_000.0;

/// Display normalization range.
pub const DISPLAY_FLOOR_DB: f32 = -70.0;
pub const DISPLAY_CEIL_DB: f32 = -10.0;

/// Minimum number of bins a bar may draw from; narrower native ranges are
/// widened so low bars still have interpolation material.
const MIN_BINS_PER_BAR: usize = 3;
const MIN_BIN_WEIGHT: f32 = 0.05;

/// Blend between the weighted bin average and the bin peak (transient lift).
const PEAK_BLEND: f32 = 0.25;

/// Tilt correction slopes (dB per octave relative to 1 kHz).
const TILT_LOW_DB_PER_OCT: f32 = 3.2;
const TILT_HIGH_DB_PER_OCT: f32 = 1.8;
const SUBSONIC_EDGE_HZ: f32 = 30.0;
const SUBSONIC_ROLLOFF_DB_PER_OCT: f32 = 18.0;
const AIR_SHELF_HZ: f32 = 14_000.0;
const AIR_SHELF_DB_PER_OCT: f32 = 2.5;
const TOP_EDGE_HZ: f32 = 18_000.0;
const TOP_ROLLOFF_DB_PER_OCT: f32 = 9.0;

/// Gap fill: a bar this far below its neighbour average is treated as a
/// mapping artefact and blended toward the neighbours.
const GAP_RATIO: f32 = 0.4;
const GAP_NEIGHBOR_MIN: f32 = 0.1;
const GAP_BLEND: f32 = 0.6;

/// Fractional-octave smoothing half-width.
const SMOOTHING_HALF_WIDTH_OCT: f32 = 1.0 / 12.0;

/// Named perceptually important band receiving an additive dB boost.
#[derive(Debug, Clone, Copy)]
pub struct PerceptualBand {
    pub name: &'static str,
    pub lo_hz: f32,
    pub hi_hz: f32,
    pub boost_db: f32,
}

/// Boosts applied on top of the tilt correction, by bar center frequency.
pub const PERCEPTUAL_BANDS: &[PerceptualBand] = &[
    PerceptualBand { name: "sub-bass", lo_hz: 20.0, hi_hz: 60.0, boost_db: 2.0 },
    PerceptualBand { name: "kick", lo_hz: 60.0, hi_hz: 120.0, boost_db: 3.0 },
    PerceptualBand { name: "bass-body", lo_hz: 120.0, hi_hz: 250.0, boost_db: 2.0 },
    PerceptualBand { name: "vocal-fundamental", lo_hz: 250.0, hi_hz: 600.0, boost_db: 1.5 },
    PerceptualBand { name: "instrument-body", lo_hz: 600.0, hi_hz: 1_500.0, boost_db: 1.0 },
    PerceptualBand { name: "vocal-clarity", lo_hz: 1_500.0, hi_hz: 3_500.0, boost_db: 2.0 },
    PerceptualBand { name: "presence", lo_hz: 3_500.0, hi_hz: 8_000.0, boost_db: 1.5 },
    PerceptualBand { name: "air", lo_hz: 8_000.0, hi_hz: 16_000.0, boost_db: 1.0 },
];

/// Frequency-dependent tilt correction flattening the natural spectral
/// slope of music so a typical mix reads visually flat.
pub fn compensation_db(freq_hz: f32) -> f32 {
    if freq_hz <= 0.0 {
        return DB_FLOOR;
    }

    let octaves_from_reference = (freq_hz / 1_000.0).log2();
    let mut db = if freq_hz < 1_000.0 {
        TILT_LOW_DB_PER_OCT * octaves_from_reference
    } else {
        TILT_HIGH_DB_PER_OCT * octaves_from_reference
    };

    if freq_hz < SUBSONIC_EDGE_HZ {
        db -= SUBSONIC_ROLLOFF_DB_PER_OCT * (SUBSONIC_EDGE_HZ / freq_hz).log2();
    }
    if freq_hz > AIR_SHELF_HZ {
        db -= AIR_SHELF_DB_PER_OCT * (freq_hz / AIR_SHELF_HZ).log2();
    }
    if freq_hz > TOP_EDGE_HZ {
        db -= TOP_ROLLOFF_DB_PER_OCT * (freq_hz / TOP_EDGE_HZ).log2();
    }

    db
}

/// Sum of perceptual-band boosts covering `freq_hz`.
pub fn perceptual_boost_db(freq_hz: f32) -> f32 {
    PERCEPTUAL_BANDS
        .iter()
        .filter(|band| freq_hz >= band.lo_hz && freq_hz < band.hi_hz)
        .map(|band| band.boost_db)
        .sum()
}

/// Logarithmically spaced bar grid between 20 Hz and 20 kHz.
///
/// Independent of any transform size; beat and voice detection index into
/// the same grid the analyzers render on.
#[derive(Debug, Clone)]
pub struct BarGrid {
    lo_hz: Vec<f32>,
    hi_hz: Vec<f32>,
    centers_hz: Vec<f32>,
}

impl BarGrid {
    pub fn new(bar_count: usize) -> Self {
        assert!(bar_count >= 2, "bar grid needs at least two bars");
        let ratio = MAX_FREQUENCY_HZ / MIN_FREQUENCY_HZ;
        let mut lo_hz = Vec::with_capacity(bar_count);
        let mut hi_hz = Vec::with_capacity(bar_count);
        let mut centers_hz = Vec::with_capacity(bar_count);

        for bar in 0..bar_count {
            let lo = MIN_FREQUENCY_HZ * ratio.powf(bar as f32 / bar_count as f32);
            let hi = MIN_FREQUENCY_HZ * ratio.powf((bar + 1) as f32 / bar_count as f32);
            lo_hz.push(lo);
            hi_hz.push(hi);
            centers_hz.push((lo * hi).sqrt());
        }

        Self {
            lo_hz,
            hi_hz,
            centers_hz,
        }
    }

    pub fn bar_count(&self) -> usize {
        self.centers_hz.len()
    }

    pub fn centers_hz(&self) -> &[f32] {
        &self.centers_hz
    }

    #[inline]
    pub fn center_hz(&self, bar: usize) -> f32 {
        self.centers_hz[bar]
    }

    #[inline]
    pub fn range_hz(&self, bar: usize) -> (f32, f32) {
        (self.lo_hz[bar], self.hi_hz[bar])
    }

    /// Inclusive bar index range whose centers fall inside `[lo_hz, hi_hz)`.
    pub fn bars_in_range(&self, lo_hz: f32, hi_hz: f32) -> std::ops::Range<usize> {
        let start = self.centers_hz.partition_point(|&f| f < lo_hz);
        let end = self.centers_hz.partition_point(|&f| f < hi_hz);
        start..end
    }

    /// Octave spacing between adjacent bar centers (uniform on this grid).
    pub fn bar_spacing_octaves(&self) -> f32 {
        (MAX_FREQUENCY_HZ / MIN_FREQUENCY_HZ).log2() / self.bar_count() as f32
    }
}

/// Contribution of one FFT bin to a bar.
#[derive(Debug, Clone, Copy)]
struct BinWeight {
    bin: usize,
    weight: f32,
}

/// Immutable mapping from the bins of one transform size onto a bar grid.
#[derive(Debug, Clone)]
pub struct BandMap {
    grid: BarGrid,
    fft_size: usize,
    sample_rate: f32,
    /// Per-bar contributing bins with triangular weights.
    assignments: Vec<Vec<BinWeight>>,
}

impl BandMap {
    pub fn new(bar_count: usize, fft_size: usize, sample_rate: f32) -> Self {
        assert!(fft_size >= 2, "FFT size must hold at least one AC bin");
        assert!(
            sample_rate.is_finite() && sample_rate > 0.0,
            "sample rate must be positive"
        );

        let grid = BarGrid::new(bar_count);
        let bin_hz = sample_rate / fft_size as f32;
        let bin_count = fft_size / 2 + 1;
        let mut assignments = Vec::with_capacity(bar_count);

        for bar in 0..bar_count {
            let (lo, hi) = grid.range_hz(bar);
            let center = grid.center_hz(bar);

            let mut first = (lo / bin_hz).floor().max(0.0) as usize;
            let mut last = ((hi / bin_hz).ceil() as usize).min(bin_count.saturating_sub(1));

            // Low bars can span less than one bin; widen symmetrically
            // around the center bin until there is interpolation material.
            while last.saturating_sub(first) + 1 < MIN_BINS_PER_BAR {
                if first > 0 {
                    first -= 1;
                }
                if last + 1 < bin_count {
                    last += 1;
                } else if first == 0 {
                    break;
                }
            }

            let half_width = ((last as f32 * bin_hz - center)
                .abs()
                .max((center - first as f32 * bin_hz).abs()))
            .max(bin_hz);

            let weights: Vec<BinWeight> = (first..=last)
                .map(|bin| {
                    let distance = (bin as f32 * bin_hz - center).abs() / half_width;
                    BinWeight {
                        bin,
                        weight: (1.0 - distance).max(MIN_BIN_WEIGHT),
                    }
                })
                .collect();

            assignments.push(weights);
        }

        Self {
            grid,
            fft_size,
            sample_rate,
            assignments,
        }
    }

    pub fn grid(&self) -> &BarGrid {
        &self.grid
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn matches(&self, bar_count: usize, fft_size: usize, sample_rate: f32) -> bool {
        self.grid.bar_count() == bar_count
            && self.fft_size == fft_size
            && (self.sample_rate - sample_rate).abs() <= f32::EPSILON
    }

    /// Collapse linear bin magnitudes into one raw dB value per bar:
    /// triangular weighted average blended 75/25 with the bin peak.
    pub fn collapse_into(&self, magnitudes: &[f32], raw_db: &mut [f32]) {
        debug_assert_eq!(raw_db.len(), self.grid.bar_count());

        for (bar, weights) in self.assignments.iter().enumerate() {
            let mut weighted_sum = 0.0f32;
            let mut weight_total = 0.0f32;
            let mut peak = 0.0f32;

            for bin_weight in weights {
                let magnitude = magnitudes.get(bin_weight.bin).copied().unwrap_or(0.0);
                weighted_sum += magnitude * bin_weight.weight;
                weight_total += bin_weight.weight;
                peak = peak.max(magnitude);
            }

            let average = if weight_total > 0.0 {
                weighted_sum / weight_total
            } else {
                0.0
            };
            let blended = average * (1.0 - PEAK_BLEND) + peak * PEAK_BLEND;
            raw_db[bar] = power_to_db(blended * blended);
        }
    }
}

/// Configuration for the temporal stages of the bar pipeline.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ShaperConfig {
    /// Frames a bar peak is held before it starts to decay (~1 s at the
    /// 512-sample hop rate).
    pub peak_hold_frames: u32,
    /// Peak decay per frame once the hold expires.
    pub peak_decay_step: f32,
}

impl Default for ShaperConfig {
    fn default() -> Self {
        Self {
            peak_hold_frames: 94,
            peak_decay_step: 0.005,
        }
    }
}

/// Attack/decay coefficients per frequency region. Bass bars snap up and
/// linger; treble bars do the reverse so hi-hats read as motion.
fn ballistics_for(center_hz: f32) -> (f32, f32) {
    if center_hz < 250.0 {
        (0.60, 0.12)
    } else if center_hz <= 4_000.0 {
        (0.45, 0.25)
    } else {
        (0.30, 0.40)
    }
}

/// Smoothed bar values with their peak-hold companions, all in [0, 1].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BarFrame {
    pub values: Vec<f32>,
    pub peaks: Vec<f32>,
}

/// Stateful tail of the bar pipeline: compensation, boosts, normalization,
/// gap fill, 1/6-octave smoothing, attack/decay, peak hold.
///
/// Each analyzer owns its own shaper; the cross-frame memory (previous
/// output and peak holds) must never be shared between the two modes.
#[derive(Debug, Clone)]
pub struct BarShaper {
    config: ShaperConfig,
    /// Per-bar compensation + perceptual boost, precomputed.
    static_offset_db: Vec<f32>,
    attack: Vec<f32>,
    decay: Vec<f32>,
    smoothing_radius: usize,
    smoothing_weights: Vec<f32>,
    frame: BarFrame,
    hold_remaining: Vec<u32>,
    scratch: Vec<f32>,
}

impl BarShaper {
    pub fn new(grid: &BarGrid, config: ShaperConfig) -> Self {
        let bar_count = grid.bar_count();
        let static_offset_db: Vec<f32> = grid
            .centers_hz()
            .iter()
            .map(|&f| compensation_db(f) + perceptual_boost_db(f))
            .collect();

        let (attack, decay): (Vec<f32>, Vec<f32>) = grid
            .centers_hz()
            .iter()
            .map(|&f| ballistics_for(f))
            .unzip();

        let spacing = grid.bar_spacing_octaves();
        let smoothing_radius = (SMOOTHING_HALF_WIDTH_OCT / spacing).floor() as usize;
        let smoothing_weights: Vec<f32> = (0..=smoothing_radius)
            .map(|offset| 1.0 - (offset as f32 * spacing) / SMOOTHING_HALF_WIDTH_OCT)
            .collect();

        Self {
            config,
            static_offset_db,
            attack,
            decay,
            smoothing_radius,
            smoothing_weights,
            frame: BarFrame {
                values: vec![0.0; bar_count],
                peaks: vec![0.0; bar_count],
            },
            hold_remaining: vec![0; bar_count],
            scratch: vec![0.0; bar_count],
        }
    }

    pub fn frame(&self) -> &BarFrame {
        &self.frame
    }

    /// Run the shared pipeline over raw per-bar dB values (stages 3-8 of
    /// the bar contract) and update the retained frame.
    pub fn shape(&mut self, raw_db: &mut [f32]) -> &BarFrame {
        debug_assert_eq!(raw_db.len(), self.frame.values.len());

        // Compensation, boosts, display normalization.
        for (value, offset) in raw_db.iter_mut().zip(&self.static_offset_db) {
            let db = *value + *offset;
            *value = ((db - DISPLAY_FLOOR_DB) / (DISPLAY_CEIL_DB - DISPLAY_FLOOR_DB)).clamp(0.0, 1.0);
        }

        self.fill_gaps(raw_db);
        self.smooth_octave(raw_db);
        self.apply_ballistics(raw_db);
        self.update_peaks();

        &self.frame
    }

    /// A single bar far below both neighbours is a mapping artefact, not
    /// signal; blend it toward the neighbour average.
    fn fill_gaps(&mut self, values: &mut [f32]) {
        self.scratch.copy_from_slice(values);
        for bar in 1..values.len().saturating_sub(1) {
            let left = self.scratch[bar - 1];
            let right = self.scratch[bar + 1];
            let neighbor_avg = (left + right) * 0.5;
            if left > GAP_NEIGHBOR_MIN
                && right > GAP_NEIGHBOR_MIN
                && self.scratch[bar] < neighbor_avg * GAP_RATIO
            {
                values[bar] = self.scratch[bar] + (neighbor_avg - self.scratch[bar]) * GAP_BLEND;
            }
        }
    }

    /// 1/6-octave smoothing: average bars within +-1/12 octave, weighted
    /// triangularly by log-frequency distance.
    fn smooth_octave(&mut self, values: &mut [f32]) {
        if self.smoothing_radius == 0 {
            return;
        }

        self.scratch.copy_from_slice(values);
        let bar_count = values.len();

        for bar in 0..bar_count {
            let mut sum = self.scratch[bar] * self.smoothing_weights[0];
            let mut total = self.smoothing_weights[0];
            for offset in 1..=self.smoothing_radius {
                let weight = self.smoothing_weights[offset];
                if bar >= offset {
                    sum += self.scratch[bar - offset] * weight;
                    total += weight;
                }
                if bar + offset < bar_count {
                    sum += self.scratch[bar + offset] * weight;
                    total += weight;
                }
            }
            values[bar] = sum / total;
        }
    }

    fn apply_ballistics(&mut self, targets: &[f32]) {
        for (bar, &target) in targets.iter().enumerate() {
            let previous = self.frame.values[bar];
            let rate = if target > previous {
                self.attack[bar]
            } else {
                self.decay[bar]
            };
            self.frame.values[bar] = previous + (target - previous) * rate;
        }
    }

    fn update_peaks(&mut self) {
        for bar in 0..self.frame.values.len() {
            let value = self.frame.values[bar];
            if value > self.frame.peaks[bar] {
                self.frame.peaks[bar] = value;
                self.hold_remaining[bar] = self.config.peak_hold_frames;
            } else if self.hold_remaining[bar] > 0 {
                self.hold_remaining[bar] -= 1;
            } else {
                self.frame.peaks[bar] =
                    (self.frame.peaks[bar] - self.config.peak_decay_step).max(value);
            }
        }
    }

    pub fn reset(&mut self) {
        self.frame.values.fill(0.0);
        self.frame.peaks.fill(0.0);
        self.hold_remaining.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_centers_are_monotonic_and_bounded() {
        let grid = BarGrid::new(DEFAULT_BAR_COUNT);
        assert_eq!(grid.bar_count(), DEFAULT_BAR_COUNT);
        assert!(grid.center_hz(0) >= MIN_FREQUENCY_HZ);
        assert!(grid.center_hz(DEFAULT_BAR_COUNT - 1) <= MAX_FREQUENCY_HZ);
        for bar in 1..grid.bar_count() {
            assert!(grid.center_hz(bar) > grid.center_hz(bar - 1));
        }
    }

    #[test]
    fn every_bar_has_interpolation_material() {
        let map = BandMap::new(DEFAULT_BAR_COUNT, 4096, 48_000.0);
        for (bar, weights) in map.assignments.iter().enumerate() {
            assert!(
                weights.len() >= MIN_BINS_PER_BAR,
                "bar {bar} has only {} bins",
                weights.len()
            );
        }
    }

    #[test]
    fn bars_in_range_selects_kick_band() {
        let grid = BarGrid::new(DEFAULT_BAR_COUNT);
        let range = grid.bars_in_range(60.0, 150.0);
        assert!(!range.is_empty());
        for bar in range.clone() {
            let f = grid.center_hz(bar);
            assert!((60.0..150.0).contains(&f));
        }
        assert!(grid.center_hz(range.end) >= 150.0);
    }

    #[test]
    fn compensation_tilts_down_in_bass_and_up_in_treble() {
        assert!(compensation_db(50.0) < 0.0);
        assert!(compensation_db(8_000.0) > 0.0);
        // Extra roll-off below the subsonic edge.
        assert!(compensation_db(25.0) < compensation_db(35.0) - 1.0);
        // And above the top edge.
        assert!(compensation_db(19_500.0) < compensation_db(13_000.0));
    }

    #[test]
    fn perceptual_bands_are_contiguous_and_named() {
        for pair in PERCEPTUAL_BANDS.windows(2) {
            assert!(pair[0].hi_hz <= pair[1].lo_hz + f32::EPSILON);
            assert!(!pair[0].name.is_empty());
        }
        assert!((perceptual_boost_db(80.0) - 3.0).abs() < f32::EPSILON);
        assert_eq!(perceptual_boost_db(17_000.0), 0.0);
    }

    #[test]
    fn ballistics_attack_faster_than_decay_in_bass() {
        let (attack, decay) = ballistics_for(100.0);
        assert!(attack > decay);
        let (attack, decay) = ballistics_for(8_000.0);
        assert!(decay > attack);
    }

    #[test]
    fn shaper_peak_holds_then_decays() {
        let grid = BarGrid::new(16);
        let config = ShaperConfig {
            peak_hold_frames: 3,
            peak_decay_step: 0.01,
        };
        let mut shaper = BarShaper::new(&grid, config);

        let mut loud = vec![DISPLAY_CEIL_DB; 16];
        shaper.shape(&mut loud);
        let held = shaper.frame().peaks[8];
        assert!(held > 0.0);

        let mut quiet = vec![DISPLAY_FLOOR_DB - 20.0; 16];
        for _ in 0..3 {
            shaper.shape(&mut quiet.clone());
        }
        // Hold interval: peak unchanged while values fall.
        assert_eq!(shaper.frame().peaks[8], held);

        shaper.shape(&mut quiet);
        assert!(shaper.frame().peaks[8] < held);
    }

    #[test]
    fn shaper_reset_restores_fresh_output() {
        let grid = BarGrid::new(32);
        let mut shaper = BarShaper::new(&grid, ShaperConfig::default());
        let mut fresh = BarShaper::new(&grid, ShaperConfig::default());

        let mut input = vec![-30.0f32; 32];
        shaper.shape(&mut input.clone());
        shaper.shape(&mut input.clone());
        shaper.reset();

        let first = shaper.shape(&mut input.clone()).clone();
        let second = fresh.shape(&mut input).clone();
        assert_eq!(first, second);
    }
}
