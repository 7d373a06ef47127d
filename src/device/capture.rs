//! # Capture Ring
//!
//! Bounded frame queue between the capture source and the streaming client.
//! The capture side never blocks: when the ring is full (the uplink stalled
//! or the gateway is slow) the oldest frame is dropped and counted. Losing
//! the oldest audio degrades the start of an utterance instead of the most
//! recent words, which is the better trade for speech.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub struct CaptureRing {
    frames: Mutex<VecDeque<Vec<i16>>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl CaptureRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push a captured frame, dropping the oldest one if the ring is full.
    pub fn push(&self, frame: Vec<i16>) {
        let mut frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        if frames.len() >= self.capacity {
            frames.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        frames.push_back(frame);
    }

    /// Take the oldest pending frame.
    pub fn pop(&self) -> Option<Vec<i16>> {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames lost to overflow since creation.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discard everything buffered (e.g. after an aborted talk event).
    pub fn clear(&self) {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let ring = CaptureRing::new(4);
        ring.push(vec![1]);
        ring.push(vec![2]);
        ring.push(vec![3]);

        assert_eq!(ring.pop(), Some(vec![1]));
        assert_eq!(ring.pop(), Some(vec![2]));
        assert_eq!(ring.pop(), Some(vec![3]));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let ring = CaptureRing::new(2);
        ring.push(vec![1]);
        ring.push(vec![2]);
        ring.push(vec![3]);

        assert_eq!(ring.dropped_frames(), 1);
        assert_eq!(ring.len(), 2);
        // Oldest frame is gone; newest survives
        assert_eq!(ring.pop(), Some(vec![2]));
        assert_eq!(ring.pop(), Some(vec![3]));
    }

    #[test]
    fn test_clear() {
        let ring = CaptureRing::new(4);
        ring.push(vec![1]);
        ring.push(vec![2]);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.dropped_frames(), 0);
    }
}
