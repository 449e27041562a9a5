//! Shared run status.
//!
//! Four fixed slots with fixed writers: the driver owns the stop flag and the
//! admitted count, workers own the error and connected counts, the
//! aggregator only reads. A separate run flag tells the aggregator the
//! driver has finished dispatching.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub const SLOT_STOP: usize = 0;
pub const SLOT_ADMITTED: usize = 1;
pub const SLOT_ERRORS: usize = 2;
pub const SLOT_CONNECTED: usize = 3;

#[derive(Debug, Default)]
pub struct StatusVector {
    slots: [AtomicU64; 4],
    running: AtomicBool,
}

impl StatusVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every slot and raise the run flag for a new step.
    pub fn reset(&self) {
        for s in &self.slots {
            s.store(0, Ordering::SeqCst);
        }
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.slots[SLOT_STOP].store(1, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.slots[SLOT_STOP].load(Ordering::SeqCst) == 1
    }

    /// Count one more admitted worker and return the new total.
    pub fn admit(&self) -> u64 {
        self.slots[SLOT_ADMITTED].fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn admitted(&self) -> u64 {
        self.slots[SLOT_ADMITTED].load(Ordering::SeqCst)
    }

    pub fn record_error(&self) {
        self.slots[SLOT_ERRORS].fetch_add(1, Ordering::SeqCst);
    }

    pub fn errors(&self) -> u64 {
        self.slots[SLOT_ERRORS].load(Ordering::SeqCst)
    }

    pub fn mark_connected(&self) {
        self.slots[SLOT_CONNECTED].fetch_add(1, Ordering::SeqCst);
    }

    pub fn connected(&self) -> u64 {
        self.slots[SLOT_CONNECTED].load(Ordering::SeqCst)
    }

    /// Every admitted worker has reported connected.
    pub fn caught_up(&self) -> bool {
        self.connected() >= self.admitted()
    }

    pub fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_and_reset() {
        let s = StatusVector::new();
        s.reset();
        assert!(s.is_running());
        assert_eq!(s.admit(), 1);
        assert!(!s.caught_up());
        s.mark_connected();
        assert!(s.caught_up());
        s.record_error();
        s.stop();
        assert!(s.is_stopped());
        assert_eq!((s.admitted(), s.errors(), s.connected()), (1, 1, 1));
        s.reset();
        assert!(!s.is_stopped());
        assert_eq!((s.admitted(), s.errors(), s.connected()), (0, 0, 0));
        s.finish();
        assert!(!s.is_running());
    }
}
