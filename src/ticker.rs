use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::gate::SnapshotLatch;

/// Re-arms a [`SnapshotLatch`] once per period until stopped.
///
/// The first re-arm happens one full period after start: the latch is armed at
/// construction, so the first frame is already captured. Ticks missed while the
/// runtime was busy are skipped rather than replayed.
pub struct SnapshotTicker {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SnapshotTicker {
    pub fn start(latch: Arc<SnapshotLatch>, period: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        latch.arm();
                        debug!("snapshot timer reset");
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });
        Self {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "snapshot timer task ended abnormally");
            }
        }
    }
}

impl Drop for SnapshotTicker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
