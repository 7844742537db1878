//! DSP building blocks of the analysis core.
//!
//! Each submodule owns its state exclusively and is driven from a single
//! logical stream of calls; the engine is the only caller in production.

pub mod bars;
pub mod beat;
pub mod fft;
pub mod filters;
pub mod loudness;
pub mod multires;
pub mod spectrum;
pub mod true_peak;
pub mod voice;

/// Borrowed interleaved audio samples handed to sample-domain processors.
#[derive(Debug, Clone, Copy)]
pub struct AudioBlock<'a> {
    /// Interleaved PCM samples, already sanitized to finite [-1, 1] values.
    pub samples: &'a [f32],
    /// Number of channels encoded in `samples`.
    pub channels: usize,
    /// Sample rate of the upstream capture pipeline.
    pub sample_rate: f32,
}

impl<'a> AudioBlock<'a> {
    pub fn new(samples: &'a [f32], channels: usize, sample_rate: f32) -> Self {
        Self {
            samples,
            channels,
            sample_rate,
        }
    }

    /// Returns the length of the block in frames.
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }
}

/// Output emitted by a processor after consuming new input.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorUpdate<T> {
    /// No new result is ready for downstream consumers.
    None,
    /// A fresh snapshot is available.
    Snapshot(T),
}

impl<T> ProcessorUpdate<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            ProcessorUpdate::None => None,
            ProcessorUpdate::Snapshot(value) => Some(value),
        }
    }
}

/// Shared contract implemented by the sample-domain DSP modules.
pub trait AudioProcessor {
    type Output;

    /// Consume a block of audio and optionally output an updated snapshot.
    fn process_block(&mut self, block: &AudioBlock<'_>) -> ProcessorUpdate<Self::Output>;

    /// Reset the processor, clearing any accumulated history without
    /// reallocating fixed-size buffers.
    fn reset(&mut self);
}

/// Optional helper trait for processors that expose lightweight
/// configuration updates.
pub trait Reconfigurable<Cfg> {
    fn update_config(&mut self, config: Cfg);
}
