//! Background transform workers.
//!
//! Transforms are the one expensive operation in the pipeline, so they run
//! on a small pool of named threads fed through bounded channels. Jobs and
//! results carry the hop index that produced them; the engine's result
//! handler uses it to discard anything older than the last applied hop.
//! Overflow on either queue drops work rather than stalling ingest.

use crate::dsp::fft::{FftEngine, MagnitudeSpectrum, WindowKind};
use anyhow::{Context, Result};
use async_channel::{Receiver, Sender, TrySendError};
use std::thread;
use tracing::{debug, warn};

/// Bounded in-flight transform jobs; overflow drops the hop.
pub const JOB_QUEUE_CAPACITY: usize = 8;
/// Bounded completed results awaiting application.
pub const RESULT_QUEUE_CAPACITY: usize = 16;
/// Worker threads in the pool.
pub const WORKER_COUNT: usize = 2;

/// Time-domain windows for one hop's transform work.
#[derive(Debug, Clone)]
pub enum TransformWindows {
    /// One window at the standard transform size.
    Standard(Vec<f32>),
    /// One window per resolution band, largest first.
    MultiRes(Vec<Vec<f32>>),
}

#[derive(Debug, Clone)]
pub struct TransformJob {
    pub hop_index: u64,
    pub windows: TransformWindows,
}

#[derive(Debug, Clone)]
pub enum TransformOutput {
    Standard(MagnitudeSpectrum),
    MultiRes(Vec<MagnitudeSpectrum>),
}

#[derive(Debug, Clone)]
pub struct TransformResult {
    pub hop_index: u64,
    pub output: TransformOutput,
}

/// Fixed pool of transform worker threads with bounded job/result queues.
pub struct WorkerPool {
    jobs: Sender<TransformJob>,
    results: Receiver<TransformResult>,
}

impl WorkerPool {
    pub fn spawn(worker_count: usize, window: WindowKind, sample_rate: f32) -> Result<Self> {
        let (job_tx, job_rx) = async_channel::bounded::<TransformJob>(JOB_QUEUE_CAPACITY);
        let (result_tx, result_rx) = async_channel::bounded::<TransformResult>(RESULT_QUEUE_CAPACITY);

        for index in 0..worker_count.max(1) {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            thread::Builder::new()
                .name(format!("tonescope-fft-{index}"))
                .spawn(move || worker_loop(jobs, results, window, sample_rate))
                .context("failed to spawn transform worker thread")?;
        }

        Ok(Self {
            jobs: job_tx,
            results: result_rx,
        })
    }

    /// Queue a job without blocking. Returns false when the job was dropped
    /// because the queue is full (sustained overload) or the pool is gone.
    pub fn submit(&self, job: TransformJob) -> bool {
        match self.jobs.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!("transform queue full, dropping hop {}", job.hop_index);
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!("transform pool closed, dropping hop {}", job.hop_index);
                false
            }
        }
    }

    /// Take the next completed result, if any.
    pub fn try_recv(&self) -> Option<TransformResult> {
        self.results.try_recv().ok()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the job channel lets the worker loops run down on their
        // own; results still in flight are discarded with the receiver.
        self.jobs.close();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queued_jobs", &self.jobs.len())
            .field("pending_results", &self.results.len())
            .finish()
    }
}

fn worker_loop(
    jobs: Receiver<TransformJob>,
    results: Sender<TransformResult>,
    window: WindowKind,
    sample_rate: f32,
) {
    let mut engine = FftEngine::new(window, sample_rate);

    while let Ok(job) = jobs.recv_blocking() {
        let output = match job.windows {
            TransformWindows::Standard(samples) => {
                let size = samples.len();
                TransformOutput::Standard(engine.magnitude_spectrum(&samples, size))
            }
            TransformWindows::MultiRes(windows) => TransformOutput::MultiRes(
                windows
                    .iter()
                    .map(|samples| engine.magnitude_spectrum(samples, samples.len()))
                    .collect(),
            ),
        };

        let result = TransformResult {
            hop_index: job.hop_index,
            output,
        };
        if let Err(err) = results.try_send(result) {
            debug!("dropping transform result for hop: {err}");
        }
    }
}
