use std::fmt;

/// Fixed-capacity circular buffer of mono samples.
///
/// Always overwrites: the newest `capacity` samples are retained and the
/// write position wraps modulo capacity. Readers copy a contiguous logical
/// window that may wrap physically; unwritten space reads as silence.
#[derive(Clone)]
pub struct SampleHistory {
    samples: Vec<f32>,
    write_pos: usize,
    written: u64,
}

impl SampleHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "SampleHistory capacity must be greater than zero");
        Self {
            samples: vec![0.0; capacity],
            write_pos: 0,
            written: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Total samples ever pushed, monotonic across wraps.
    #[inline]
    pub fn total_written(&self) -> u64 {
        self.written
    }

    pub fn push_slice(&mut self, samples: &[f32]) {
        let capacity = self.capacity();
        self.written = self.written.wrapping_add(samples.len() as u64);

        // Only the tail of an oversized chunk can survive.
        let tail = if samples.len() > capacity {
            &samples[samples.len() - capacity..]
        } else {
            samples
        };

        let first = (capacity - self.write_pos).min(tail.len());
        self.samples[self.write_pos..self.write_pos + first].copy_from_slice(&tail[..first]);
        let rest = &tail[first..];
        self.samples[..rest.len()].copy_from_slice(rest);
        self.write_pos = (self.write_pos + tail.len()) % capacity;
    }

    /// Copy the most recent `out.len()` samples, ending at the write
    /// position, into `out`. The window must fit the buffer.
    pub fn copy_latest(&self, out: &mut [f32]) {
        let capacity = self.capacity();
        assert!(
            out.len() <= capacity,
            "window of {} exceeds history capacity {}",
            out.len(),
            capacity
        );

        let start = (self.write_pos + capacity - out.len()) % capacity;
        let first = (capacity - start).min(out.len());
        let rest = out.len() - first;
        out[..first].copy_from_slice(&self.samples[start..start + first]);
        out[first..].copy_from_slice(&self.samples[..rest]);
    }

    pub fn clear(&mut self) {
        self.samples.fill(0.0);
        self.write_pos = 0;
        self.written = 0;
    }
}

impl fmt::Debug for SampleHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleHistory")
            .field("capacity", &self.capacity())
            .field("write_pos", &self.write_pos)
            .field("written", &self.written)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_space_reads_as_silence() {
        let mut history = SampleHistory::with_capacity(8);
        history.push_slice(&[1.0, 2.0]);

        let mut out = [f32::NAN; 4];
        history.copy_latest(&mut out);
        assert_eq!(out, [0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn window_wraps_across_the_physical_end() {
        let mut history = SampleHistory::with_capacity(4);
        history.push_slice(&[1.0, 2.0, 3.0]);
        history.push_slice(&[4.0, 5.0]);

        let mut out = [0.0; 4];
        history.copy_latest(&mut out);
        assert_eq!(out, [2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn oversized_chunk_keeps_only_the_tail() {
        let mut history = SampleHistory::with_capacity(4);
        let chunk: Vec<f32> = (0..10).map(|i| i as f32).collect();
        history.push_slice(&chunk);

        let mut out = [0.0; 4];
        history.copy_latest(&mut out);
        assert_eq!(out, [6.0, 7.0, 8.0, 9.0]);
        assert_eq!(history.total_written(), 10);
    }

    #[test]
    fn clear_restores_silence() {
        let mut history = SampleHistory::with_capacity(4);
        history.push_slice(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        history.clear();

        let mut out = [1.0; 4];
        history.copy_latest(&mut out);
        assert_eq!(out, [0.0; 4]);
        assert_eq!(history.total_written(), 0);
    }
}
