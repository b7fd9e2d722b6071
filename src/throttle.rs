//! Backpressure gate between the frame source and the pipeline.
//!
//! At most one frame is in flight. Frames offered while a pass is running are
//! dropped, never queued: the pipeline is latency-bound, and a queued frame is
//! only ever staler than the next one the camera will deliver.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::frame::Frame;

#[derive(Debug, Default)]
pub struct FrameThrottler {
    in_flight: AtomicBool,
    admitted: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThrottleStats {
    pub admitted: u64,
    pub dropped: u64,
}

impl FrameThrottler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `frame` if nothing is in flight. Returns false (frame dropped) otherwise.
    pub fn offer(&self, frame: &Frame) -> bool {
        let accepted = self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if accepted {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::trace!("throttler dropped frame {}", frame.seq);
        }
        accepted
    }

    /// The admitted pass finished (or was abandoned). Re-opens the gate.
    pub fn processing_complete(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ThrottleStats {
        ThrottleStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
