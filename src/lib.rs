//! Real-time music analysis core.
//!
//! Feeds interleaved stereo float chunks through a set of independent DSP
//! processors and publishes a single consistent [`AnalysisSnapshot`]:
//! a 512-bar log spectrum (single and multi-resolution), BS.1770/EBU R128
//! loudness, polyphase true peak, beat/tempo tracking, voice
//! classification, and per-chunk level/stereo statistics.
//!
//! ```no_run
//! use tonescope::{Engine, EngineConfig};
//!
//! let mut engine = Engine::new(EngineConfig::default())?;
//! let chunk = vec![0.0f32; 1024]; // interleaved stereo from the capture side
//! engine.ingest(&chunk);
//! let snapshot = engine.snapshot();
//! println!("integrated: {} LUFS", snapshot.loudness.integrated_lufs);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod dsp;
pub mod engine;
pub mod util;

pub use dsp::bars::BarFrame;
pub use dsp::beat::{BeatSnapshot, TapTempo};
pub use dsp::loudness::LoudnessSnapshot;
pub use dsp::true_peak::TruePeakSnapshot;
pub use dsp::voice::{Classification, VoiceSnapshot};
pub use engine::{AnalysisSnapshot, Engine, EngineConfig, Levels, StereoField};
