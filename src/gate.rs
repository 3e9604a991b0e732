use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::frame::DecodedFrame;

/// Single-slot arming state shared between the frame source and the timer.
#[derive(Debug)]
pub struct SnapshotLatch {
    armed: AtomicBool,
}

impl SnapshotLatch {
    /// A latch that captures the very first frame it sees.
    pub fn armed() -> Self {
        Self {
            armed: AtomicBool::new(true),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    /// Atomically clears the latch. Returns `true` only for the single caller
    /// that observed it armed.
    pub fn try_consume(&self) -> bool {
        self.armed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

impl Default for SnapshotLatch {
    fn default() -> Self {
        Self::armed()
    }
}

/// Receives the frames the gate decided to keep.
pub trait FrameSink: Send + Sync {
    /// Must not retain `frame` past the call. Errors are reported by the sink.
    fn accept(&self, frame: &DecodedFrame<'_>);
}

impl<S: FrameSink + ?Sized> FrameSink for Arc<S> {
    fn accept(&self, frame: &DecodedFrame<'_>) {
        (**self).accept(frame)
    }
}

/// Outcome of offering a frame to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Latch was not armed (or another frame won the arming).
    Skipped,
    /// Latch was armed but the frame was malformed; the latch stays armed.
    Rejected,
    /// Frame was handed to the sink.
    Captured,
}

/// Lets through at most one frame per arming of its latch.
pub struct SnapshotGate<S> {
    latch: Arc<SnapshotLatch>,
    sink: S,
}

impl<S: FrameSink> SnapshotGate<S> {
    pub fn new(sink: S) -> Self {
        Self::with_latch(Arc::new(SnapshotLatch::armed()), sink)
    }

    pub fn with_latch(latch: Arc<SnapshotLatch>, sink: S) -> Self {
        Self { latch, sink }
    }

    pub fn latch(&self) -> &Arc<SnapshotLatch> {
        &self.latch
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn on_frame_delivered(&self, frame: &DecodedFrame<'_>) -> Delivery {
        if !self.latch.is_armed() {
            return Delivery::Skipped;
        }
        if let Err(e) = frame.validate() {
            warn!(error = %e, "dropping malformed frame");
            return Delivery::Rejected;
        }
        // Disarm before the sink runs so a slow write cannot let a second
        // frame through under the same arming.
        if !self.latch.try_consume() {
            return Delivery::Skipped;
        }
        info!(
            width = frame.width,
            height = frame.height,
            format = %frame.format,
            "frame received for snapshot"
        );
        self.sink.accept(frame);
        Delivery::Captured
    }

    pub fn on_timer_tick(&self) {
        self.latch.arm();
    }
}
