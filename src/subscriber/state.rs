use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Counters shared between the receiving task, the deletion worker and all message handles
#[derive(Debug, Default)]
pub(crate) struct PipelineState {
    in_flight: AtomicUsize,
    stopped: AtomicBool,
}

impl PipelineState {
    /// Number of messages handed out but not yet acknowledged
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn acquire(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release(&self) {
        // Saturates at zero
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            });
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Flips the stopped flag, returns false if it was already set
    pub fn mark_stopped(&self) -> bool {
        self.stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Whether the acknowledgement currently being processed belongs to the last
    /// in-flight message of a stopped subscriber
    pub fn is_draining_last(&self) -> bool {
        self.is_stopped() && self.in_flight() == 1
    }
}
