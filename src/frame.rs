//! Frames and the bounded hand-off between ingestion and detection.
//!
//! - `Frame`: packed RGB24 pixels plus capture time. Owned by one stage at a
//!   time; stages clone when they need to keep a copy.
//! - `FrameChannel`: bounded FIFO that never blocks the producer. Pushing into
//!   a full channel evicts the oldest frame, so the consumer always sees the
//!   freshest frames in capture order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

/// Capacity used between the ingestor and the detection worker.
pub const FRAME_CHANNEL_CAPACITY: usize = 2;

/// One decoded video frame.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Per-session sequence number assigned by the source.
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    /// Packed RGB24, `width * height * 3` bytes.
    pixels: Vec<u8>,
    /// Wall-clock capture time (used for filenames and payloads).
    pub captured_at: SystemTime,
    /// Monotonic capture instant (used for ordering).
    pub captured_instant: Instant,
}

impl Frame {
    pub fn new(seq: u64, width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            seq,
            width,
            height,
            pixels,
            captured_at: SystemTime::now(),
            captured_instant: Instant::now(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// True when the pixel buffer matches the declared dimensions.
    pub fn is_well_formed(&self) -> bool {
        self.pixels.len() == (self.width as usize) * (self.height as usize) * 3
    }
}

/// Bounded drop-oldest channel.
pub struct FrameChannel {
    buffer: Mutex<VecDeque<Frame>>,
    ready: Condvar,
    capacity: usize,
    evicted: AtomicU64,
}

impl FrameChannel {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    /// Insert a frame. Returns the evicted frame when the channel was full.
    pub fn push(&self, frame: Frame) -> Option<Frame> {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let evicted = if buffer.len() >= self.capacity {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            buffer.pop_front()
        } else {
            None
        };
        buffer.push_back(frame);
        drop(buffer);
        self.ready.notify_one();
        evicted
    }

    /// Take the oldest buffered frame, waiting up to `timeout` for one.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(frame) = buffer.pop_front() {
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(buffer, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            buffer = guard;
        }
    }

    /// Take a frame if one is buffered.
    pub fn try_recv(&self) -> Option<Frame> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Drop everything buffered (used when the source changes).
    pub fn clear(&self) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total frames evicted since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for FrameChannel {
    fn default() -> Self {
        Self::new(FRAME_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, 2, 2, vec![seq as u8; 12])
    }

    #[test]
    fn full_channel_evicts_oldest() {
        let channel = FrameChannel::new(2);
        assert!(channel.push(frame(1)).is_none());
        assert!(channel.push(frame(2)).is_none());
        let evicted = channel.push(frame(3)).expect("oldest evicted");
        assert_eq!(evicted.seq, 1);

        assert_eq!(channel.len(), 2);
        assert_eq!(channel.try_recv().map(|f| f.seq), Some(2));
        assert_eq!(channel.try_recv().map(|f| f.seq), Some(3));
        assert!(channel.try_recv().is_none());
        assert_eq!(channel.evicted(), 1);
    }

    #[test]
    fn recv_times_out_when_empty() {
        let channel = FrameChannel::new(2);
        let start = Instant::now();
        assert!(channel.recv_timeout(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn recv_wakes_on_push() {
        let channel = Arc::new(FrameChannel::new(2));
        let producer = channel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(frame(7));
        });
        let got = channel.recv_timeout(Duration::from_secs(2));
        handle.join().unwrap();
        assert_eq!(got.map(|f| f.seq), Some(7));
    }

    #[test]
    fn consumer_sees_non_decreasing_sequence() {
        let channel = FrameChannel::new(2);
        for seq in 0..10 {
            channel.push(frame(seq));
        }
        let first = channel.try_recv().unwrap().seq;
        let second = channel.try_recv().unwrap().seq;
        assert!(first < second);
        assert_eq!(second, 9);
    }

    #[test]
    fn well_formed_checks_dimensions() {
        assert!(frame(1).is_well_formed());
        assert!(!Frame::new(1, 4, 4, vec![0; 3]).is_well_formed());
    }
}
