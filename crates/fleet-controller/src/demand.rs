// Pending job demand and the reconcile trigger. The webhook path only ever
// touches these two things; it never mutates runner records, so webhook-
// driven and poll-driven transitions cannot race.

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Count of queued `workflow_job` events not yet matched to a runner that
/// reached `Idle`/`Busy`. This is what lets the webhook path launch
/// capacity ahead of the polling floor.
#[derive(Debug, Default)]
pub struct DemandTracker {
    pending: Mutex<u32>,
}

impl DemandTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A job was queued; returns the new pending count.
    pub fn record_queued(&self) -> u32 {
        let mut pending = self.pending.lock();
        *pending += 1;
        *pending
    }

    /// A runner came up (first transition into Idle/Busy); one unit of
    /// demand is considered matched. Saturating: a runner appearing with
    /// no recorded demand is just the floor doing its job.
    pub fn satisfy_one(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
    }

    pub fn pending(&self) -> u32 {
        *self.pending.lock()
    }
}

/// Out-of-cycle reconcile signal. Capacity-1 channel: a burst of webhook
/// events within one tick coalesces into at most one extra pass.
#[derive(Debug, Clone)]
pub struct ReconcileTrigger {
    tx: mpsc::Sender<()>,
}

impl ReconcileTrigger {
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Request a pass. A full channel means one is already pending, which
    /// is exactly the coalescing we want.
    pub fn fire(&self) {
        let _ = self.tx.try_send(());
    }
}
