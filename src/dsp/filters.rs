//! Stateful filter primitives: biquads for K-weighting and the polyphase
//! FIR bank used by inter-sample peak detection.

use crate::util::audio::DEFAULT_SAMPLE_RATE;
use std::f64::consts::PI;

const NOMINAL_SAMPLE_RATE: f32 = DEFAULT_SAMPLE_RATE;
const SAMPLE_RATE_TOLERANCE: f32 = 0.1;

// ITU-R BS.1770-4: https://www.itu.int/rec/R-REC-BS.1770
const PRE_B_COEFFS_48K: [f64; 3] = [
    1.535_124_859_586_97,
    -2.691_696_189_406_38,
    1.198_392_810_852_85,
];
const PRE_A_COEFFS_48K: [f64; 3] = [1.0, -1.690_659_293_182_41, 0.732_480_774_215_85];
const HP_B_COEFFS_48K: [f64; 3] = [1.0, -2.0, 1.0];
const HP_A_COEFFS_48K: [f64; 3] = [1.0, -1.990_047_454_833_98, 0.990_072_250_366_21];

/// Direct-form-II-transposed second-order section with f64 state.
#[derive(Debug, Clone)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    pub fn from_coefficients(b: [f64; 3], a: [f64; 3]) -> Self {
        debug_assert!(a[0] != 0.0, "digital biquad a0 must be non-zero");
        let inv_a0 = 1.0 / a[0];

        Self {
            b0: b[0] * inv_a0,
            b1: b[1] * inv_a0,
            b2: b[2] * inv_a0,
            a1: a[1] * inv_a0,
            a2: a[2] * inv_a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    #[inline]
    fn prewarp(freq_hz: f64, sample_rate: f64) -> f64 {
        (PI * freq_hz / sample_rate).tan() * 2.0 * sample_rate
    }

    /// Bilinear transform of an analog second-order section.
    fn from_analog(analog_b: [f64; 3], analog_a: [f64; 3], sample_rate: f32) -> Self {
        let k = 2.0 * sample_rate as f64;
        let k2 = k * k;

        let (a0, a1, a2) = (analog_a[0], analog_a[1], analog_a[2]);
        let (b0, b1, b2) = (analog_b[0], analog_b[1], analog_b[2]);

        let a0d = a0 * k2 + a1 * k + a2;
        let a1d = 2.0 * (a2 - a0 * k2);
        let a2d = a0 * k2 - a1 * k + a2;

        let b0d = b0 * k2 + b1 * k + b2;
        let b1d = 2.0 * (b2 - b0 * k2);
        let b2d = b0 * k2 - b1 * k + b2;

        Self::from_coefficients([b0d, b1d, b2d], [a0d, a1d, a2d])
    }

    /// BS.1770 stage one: high-shelf modelling the acoustic effect of the head.
    pub fn k_weighting_pre(sample_rate: f32) -> Self {
        if (sample_rate - NOMINAL_SAMPLE_RATE).abs() <= SAMPLE_RATE_TOLERANCE {
            return Self::from_coefficients(PRE_B_COEFFS_48K, PRE_A_COEFFS_48K);
        }

        let sr = sample_rate as f64;
        let w0 = Self::prewarp(15.915, sr);
        let w1 = Self::prewarp(4.078, sr);
        Self::from_analog([1.0, w0, w0 * w0], [1.0, w1, w1 * w1], sample_rate)
    }

    /// BS.1770 stage two: the RLB high-pass.
    pub fn k_weighting_high_pass(sample_rate: f32) -> Self {
        if (sample_rate - NOMINAL_SAMPLE_RATE).abs() <= SAMPLE_RATE_TOLERANCE {
            return Self::from_coefficients(HP_B_COEFFS_48K, HP_A_COEFFS_48K);
        }

        let sr = sample_rate as f64;
        let wh = Self::prewarp(38.1358, sr);
        Self::from_analog([1.0, 0.0, 0.0], [1.0, wh, wh * wh], sample_rate)
    }

    #[inline]
    pub fn process(&mut self, sample: f32) -> f32 {
        let x = sample as f64;
        let y = x * self.b0 + self.z1;
        self.z1 = x * self.b1 + self.z2 - self.a1 * y;
        self.z2 = x * self.b2 - self.a2 * y;
        y as f32
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// Two-stage K-weighting cascade per BS.1770 (pre-filter, then RLB).
#[derive(Debug, Clone)]
pub struct KWeightingFilter {
    pre: Biquad,
    high_pass: Biquad,
}

impl KWeightingFilter {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            pre: Biquad::k_weighting_pre(sample_rate),
            high_pass: Biquad::k_weighting_high_pass(sample_rate),
        }
    }

    #[inline]
    pub fn process(&mut self, sample: f32) -> f32 {
        let stage1 = self.pre.process(sample);
        self.high_pass.process(stage1)
    }

    pub fn reset(&mut self) {
        self.pre.reset();
        self.high_pass.reset();
    }
}

/// Number of polyphase decomposition phases (4x oversampling).
pub const OVERSAMPLE_PHASES: usize = 4;

/// Number of FIR taps per polyphase phase.
pub const OVERSAMPLE_TAPS: usize = 12;

const TOTAL_TAPS: usize = OVERSAMPLE_PHASES * OVERSAMPLE_TAPS;
const KAISER_BETA: f64 = 8.0;

/// Design the 4x oversampling polyphase interpolation filter.
///
/// 48-tap windowed sinc (cutoff pi/4, Kaiser beta 8) split into four
/// 12-tap phases, each normalized to unity DC gain so a steady input
/// reproduces its level at every phase.
pub fn interpolation_filter() -> [[f32; OVERSAMPLE_TAPS]; OVERSAMPLE_PHASES] {
    let mut coeffs = [[0.0f32; OVERSAMPLE_TAPS]; OVERSAMPLE_PHASES];
    let center = (TOTAL_TAPS as f64 - 1.0) / 2.0;

    for i in 0..TOTAL_TAPS {
        let n = i as f64 - center;
        let sinc = if n.abs() < 1e-10 {
            1.0
        } else {
            let x = n * PI / OVERSAMPLE_PHASES as f64;
            x.sin() / x
        };
        let window = kaiser(i, TOTAL_TAPS, KAISER_BETA);

        let phase = i % OVERSAMPLE_PHASES;
        let tap = i / OVERSAMPLE_PHASES;
        coeffs[phase][tap] = (sinc * window) as f32;
    }

    for phase in &mut coeffs {
        let sum: f32 = phase.iter().sum();
        if sum.abs() > 1e-10 {
            for tap in phase.iter_mut() {
                *tap /= sum;
            }
        }
    }

    coeffs
}

fn kaiser(n: usize, length: usize, beta: f64) -> f64 {
    let m = (length - 1) as f64;
    let ratio = 2.0 * n as f64 / m - 1.0;
    bessel_i0(beta * (1.0 - ratio * ratio).max(0.0).sqrt()) / bessel_i0(beta)
}

/// Zeroth-order modified Bessel function of the first kind (power series).
fn bessel_i0(x: f64) -> f64 {
    let half = x / 2.0;
    let mut term = 1.0;
    let mut sum = 1.0;
    for k in 1..=24 {
        term *= half / k as f64;
        sum += term * term;
        if term * term < 1e-18 * sum {
            break;
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn k_weighting_48k_uses_reference_coefficients() {
        let filter = Biquad::k_weighting_pre(48_000.0);
        assert!((filter.b0 - PRE_B_COEFFS_48K[0]).abs() < 1e-12);
        assert!((filter.a1 - PRE_A_COEFFS_48K[1]).abs() < 1e-12);
    }

    #[test]
    fn k_weighting_gain_at_1khz_matches_the_lufs_offset() {
        // The cascade has ~+0.69 dB of gain at 1 kHz; the -0.691 term in
        // the LUFS conversion cancels it.
        let mut filter = KWeightingFilter::new(48_000.0);
        let mut power_in = 0.0f64;
        let mut power_out = 0.0f64;
        for n in 0..48_000 {
            let x = (2.0 * std::f64::consts::PI * 1_000.0 * n as f64 / 48_000.0).sin() as f32;
            let y = filter.process(x);
            if n >= 4_800 {
                power_in += (x as f64).powi(2);
                power_out += (y as f64).powi(2);
            }
        }
        let gain_db = 10.0 * (power_out / power_in).log10();
        assert!((gain_db - 0.691).abs() < 0.1, "1 kHz gain was {gain_db} dB");
    }

    #[test]
    fn biquad_reset_clears_state() {
        let mut filter = Biquad::k_weighting_high_pass(48_000.0);
        for _ in 0..64 {
            filter.process(0.7);
        }
        filter.reset();
        let mut fresh = Biquad::k_weighting_high_pass(48_000.0);
        for n in 0..32 {
            let x = (n as f32 * 0.1).sin();
            assert_eq!(filter.process(x), fresh.process(x));
        }
    }

    #[test]
    fn interpolation_phases_have_unity_dc_gain() {
        let coeffs = interpolation_filter();
        for phase in &coeffs {
            let sum: f32 = phase.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }
}
