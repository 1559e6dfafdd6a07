use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default buffering per track: two seconds of 48 kHz mono.
const DEFAULT_CAPACITY: usize = 48_000 * 2;

/// Decoded remote audio (i16 PCM), one bounded queue per track.
///
/// Playout loops push, the platform audio output pulls a mix of every
/// track. When the consumer falls behind the oldest samples of a track
/// are dropped so latency stays bounded.
pub struct PlayoutBuffer {
    sources: Mutex<HashMap<String, VecDeque<i16>>>,
    capacity: usize,
}

impl Default for PlayoutBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayoutBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn push_samples(&self, track_sid: &str, samples: &[i16]) {
        let mut sources = self.lock();
        let queue = sources.entry(track_sid.to_string()).or_default();
        // Only the newest `capacity` samples of a single burst can survive.
        let keep = &samples[samples.len().saturating_sub(self.capacity)..];
        let overflow = (queue.len() + keep.len()).saturating_sub(self.capacity);
        queue.drain(..overflow);
        queue.extend(keep);
    }

    /// Mix the front of every track's queue into `out`, padding with
    /// silence. Returns how many samples carried audio.
    pub fn pull_samples(&self, out: &mut [i16]) -> usize {
        out.fill(0);
        let mut sources = self.lock();
        let mut written = 0;
        for queue in sources.values_mut() {
            let available = queue.len().min(out.len());
            for (slot, sample) in out.iter_mut().zip(queue.drain(..available)) {
                *slot = slot.saturating_add(sample);
            }
            written = written.max(available);
        }
        written
    }

    /// Samples queued for the most backed-up track.
    pub fn buffered(&self) -> usize {
        self.lock().values().map(VecDeque::len).max().unwrap_or(0)
    }

    /// Forget a track whose playout ended.
    pub fn remove_source(&self, track_sid: &str) {
        self.lock().remove(track_sid);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<i16>>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulls_in_order_and_pads_with_silence() {
        let buffer = PlayoutBuffer::new();
        buffer.push_samples("TR_a", &[10, 20, 30, 40]);

        let mut first = [0i16; 3];
        assert_eq!(buffer.pull_samples(&mut first), 3);
        assert_eq!(first, [10, 20, 30]);

        let mut second = [7i16; 3];
        assert_eq!(buffer.pull_samples(&mut second), 1);
        assert_eq!(second, [40, 0, 0]);
        assert_eq!(buffer.buffered(), 0);
    }

    #[test]
    fn concurrent_tracks_are_mixed() {
        let buffer = PlayoutBuffer::new();
        buffer.push_samples("TR_a", &[100, 200, 300]);
        buffer.push_samples("TR_b", &[1, 2]);

        let mut out = [0i16; 3];
        assert_eq!(buffer.pull_samples(&mut out), 3);
        assert_eq!(out, [101, 202, 300]);
    }

    #[test]
    fn mixing_saturates_instead_of_wrapping() {
        let buffer = PlayoutBuffer::new();
        buffer.push_samples("TR_a", &[i16::MAX, i16::MIN]);
        buffer.push_samples("TR_b", &[1000, -1000]);

        let mut out = [0i16; 2];
        buffer.pull_samples(&mut out);
        assert_eq!(out, [i16::MAX, i16::MIN]);
    }

    #[test]
    fn full_buffer_keeps_newest_samples() {
        let buffer = PlayoutBuffer::with_capacity(4);
        buffer.push_samples("TR_a", &[1, 2, 3]);
        buffer.push_samples("TR_a", &[4, 5, 6]);
        assert_eq!(buffer.buffered(), 4);

        let mut out = [0i16; 4];
        buffer.pull_samples(&mut out);
        assert_eq!(out, [3, 4, 5, 6]);
    }

    #[test]
    fn oversized_burst_is_truncated_to_its_tail() {
        let buffer = PlayoutBuffer::with_capacity(2);
        buffer.push_samples("TR_a", &[1, 2, 3, 4, 5]);

        let mut out = [0i16; 3];
        assert_eq!(buffer.pull_samples(&mut out), 2);
        assert_eq!(out, [4, 5, 0]);
    }

    #[test]
    fn removed_and_cleared_tracks_go_silent() {
        let buffer = PlayoutBuffer::new();
        buffer.push_samples("TR_a", &[1, 2, 3]);
        buffer.push_samples("TR_b", &[4]);
        buffer.remove_source("TR_a");
        assert_eq!(buffer.buffered(), 1);

        buffer.clear();
        assert_eq!(buffer.buffered(), 0);
    }
}
