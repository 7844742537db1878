//! Utility functions and types shared across the analysis core.

pub mod audio;
pub mod telemetry;

pub use audio::{amplitude_to_db, power_to_db, sanitize_samples};
