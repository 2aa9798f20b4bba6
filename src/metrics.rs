//! Hand-rolled atomic counters/gauges (spec.md §6.5). No metrics crate
//! appears anywhere in the retrieval pack, so this follows the pack's own
//! idiom for cheap observability: plain `AtomicU64`/`AtomicI64` counters
//! behind a snapshot struct, the same shape [`crate::identifiers::PoolStats`]
//! already uses for the identifier pool.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub dialogs_created: AtomicU64,
    pub dialogs_terminated: AtomicU64,
    pub dialogs_active: AtomicI64,
    pub transactions_created: AtomicU64,
    pub transactions_timed_out: AtomicU64,
    pub transactions_evicted: AtomicU64,
    pub refers_sent: AtomicU64,
    pub refers_received: AtomicU64,
    pub transfers_completed: AtomicU64,
    pub transfers_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub dialogs_created: u64,
    pub dialogs_terminated: u64,
    pub dialogs_active: i64,
    pub transactions_created: u64,
    pub transactions_timed_out: u64,
    pub transactions_evicted: u64,
    pub refers_sent: u64,
    pub refers_received: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dialog_created(&self) {
        self.dialogs_created.fetch_add(1, Ordering::Relaxed);
        self.dialogs_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dialog_terminated(&self) {
        self.dialogs_terminated.fetch_add(1, Ordering::Relaxed);
        self.dialogs_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn transaction_created(&self) {
        self.transactions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transaction_timed_out(&self) {
        self.transactions_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transaction_evicted(&self) {
        self.transactions_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn refer_sent(&self) {
        self.refers_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn refer_received(&self) {
        self.refers_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_completed(&self) {
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_failed(&self) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dialogs_created: self.dialogs_created.load(Ordering::Relaxed),
            dialogs_terminated: self.dialogs_terminated.load(Ordering::Relaxed),
            dialogs_active: self.dialogs_active.load(Ordering::Relaxed),
            transactions_created: self.transactions_created.load(Ordering::Relaxed),
            transactions_timed_out: self.transactions_timed_out.load(Ordering::Relaxed),
            transactions_evicted: self.transactions_evicted.load(Ordering::Relaxed),
            refers_sent: self.refers_sent.load(Ordering::Relaxed),
            refers_received: self.refers_received.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialog_lifecycle_nets_to_zero_active() {
        let m = Metrics::new();
        m.dialog_created();
        m.dialog_created();
        m.dialog_terminated();
        let snap = m.snapshot();
        assert_eq!(snap.dialogs_created, 2);
        assert_eq!(snap.dialogs_active, 1);
    }
}
