//! Audio math shared by every DSP module.

/// Default sample rate (Hz) used throughout the analysis pipeline.
pub const DEFAULT_SAMPLE_RATE: f32 = 48_000.0;

/// Floor value (dB) below which magnitudes are clamped.
pub const DB_FLOOR: f32 = -140.0;

/// Floor (dB) reported for silent level meters.
pub const LEVEL_FLOOR_DB: f32 = -100.0;

/// Minimum power value to avoid log(0) in dB conversions.
const POWER_EPSILON: f32 = 1.0e-20;

/// Natural log to decibel conversion factor: 10 / ln(10) ~= 4.342944819.
const LN_TO_DB: f32 = 4.342_944_8;

/// Convert power (magnitude squared) to decibels.
#[inline(always)]
pub fn power_to_db(power: f32) -> f32 {
    if power > POWER_EPSILON {
        (power.ln() * LN_TO_DB).max(DB_FLOOR)
    } else {
        DB_FLOOR
    }
}

/// Convert a linear amplitude to decibels with a configurable floor.
#[inline(always)]
pub fn amplitude_to_db(amplitude: f32, floor: f32) -> f32 {
    if amplitude > f32::EPSILON {
        (20.0 * amplitude.log10()).max(floor)
    } else {
        floor
    }
}

#[inline(always)]
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Replace non-finite samples with silence and clamp the rest to [-1, 1].
///
/// Capture backends occasionally hand over NaN/inf garbage during device
/// renegotiation; the pipeline corrects it in place instead of rejecting
/// the chunk.
pub fn sanitize_samples(samples: &mut [f32]) -> usize {
    let mut corrected = 0;
    for sample in samples.iter_mut() {
        if !sample.is_finite() {
            *sample = 0.0;
            corrected += 1;
        } else if *sample > 1.0 {
            *sample = 1.0;
            corrected += 1;
        } else if *sample < -1.0 {
            *sample = -1.0;
            corrected += 1;
        }
    }
    corrected
}
