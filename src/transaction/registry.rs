//! Live-transaction table: routes inbound messages to the transaction
//! that owns their branch, and enforces the concurrent-transaction cap
//! from spec.md §4.4 ("overload") with oldest-first eviction so a burst
//! of new transactions can't starve a well-behaved endpoint forever.

use crate::metrics::Metrics;
use crate::transaction::key::TransactionKey;
use crate::transaction::transaction::{TransactionEvent, TransactionEventSender};
use crate::transport::SipConnection;
use rsip::{Request, SipMessage};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tracing::warn;

pub struct TransactionRegistry {
    max_concurrent: usize,
    entries: RwLock<std::collections::HashMap<TransactionKey, TransactionEventSender>>,
    order: RwLock<VecDeque<TransactionKey>>,
    metrics: Arc<Metrics>,
}

impl TransactionRegistry {
    pub fn new(max_concurrent: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            max_concurrent,
            entries: RwLock::new(std::collections::HashMap::new()),
            order: RwLock::new(VecDeque::new()),
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a freshly created transaction. If the table is at
    /// capacity, the oldest still-registered transaction is asked to
    /// terminate (by dropping its sender, which ends its event loop on
    /// the next recv) to make room.
    pub fn attach(&self, key: TransactionKey, sender: TransactionEventSender) {
        let evicted = {
            let mut entries = self.entries.write().unwrap();
            let mut order = self.order.write().unwrap();
            let mut evicted = None;
            while entries.len() >= self.max_concurrent {
                let Some(oldest) = order.pop_front() else { break };
                if entries.remove(&oldest).is_some() {
                    evicted = Some(oldest);
                    break;
                }
            }
            entries.insert(key.clone(), sender);
            order.push_back(key);
            evicted
        };
        if let Some(key) = evicted {
            self.metrics.transaction_evicted();
            warn!(transaction = %key, "evicted oldest transaction to honor max_concurrent cap");
        }
    }

    pub fn detach(&self, key: &TransactionKey, _last_message: Option<SipMessage>) {
        self.entries.write().unwrap().remove(key);
        // `order` is left with the stale key; it is skipped lazily on the
        // next `attach` eviction scan since `entries.remove` there returns
        // `None` for an already-detached key.
    }

    /// Forwards `msg` to the transaction matching `key`. Returns `true` if
    /// a matching transaction was found (and the send attempted).
    pub fn route(&self, key: &TransactionKey, msg: SipMessage, connection: Option<SipConnection>) -> bool {
        let sender = self.entries.read().unwrap().get(key).cloned();
        match sender {
            Some(tx) => {
                let _ = tx.send(TransactionEvent::Incoming(msg, connection));
                true
            }
            None => false,
        }
    }

    /// Hands a TU-built non-2xx ACK to the client INVITE transaction
    /// matching `key` so it can retain and retransmit it. Returns `false`
    /// if that transaction already detached, in which case the caller
    /// falls back to sending the ACK directly.
    pub fn route_ack(&self, key: &TransactionKey, ack: Request) -> bool {
        let sender = self.entries.read().unwrap().get(key).cloned();
        match sender {
            Some(tx) => {
                let _ = tx.send(TransactionEvent::Ack(ack));
                true
            }
            None => false,
        }
    }

    /// Delivers a fired [`crate::transaction::timer::TransactionTimer`] to
    /// the transaction it was armed for. Returns `false` if the
    /// transaction already detached (the timer fired after the fact, a
    /// normal race the caller ignores).
    pub fn route_timer(&self, key: &TransactionKey, timer: crate::transaction::timer::TransactionTimer) -> bool {
        let sender = self.entries.read().unwrap().get(key).cloned();
        match sender {
            Some(tx) => {
                let _ = tx.send(TransactionEvent::Timer(timer));
                true
            }
            None => false,
        }
    }

    pub fn snapshot_keys(&self) -> Vec<TransactionKey> {
        self.entries.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::key::TransactionRole;
    use tokio::sync::mpsc;

    fn key(branch: &str) -> TransactionKey {
        TransactionKey {
            branch: branch.to_string(),
            role: TransactionRole::Client,
        }
    }

    #[test]
    fn attach_detach_roundtrip() {
        let reg = TransactionRegistry::new(10, Arc::new(Metrics::new()));
        let (tx, _rx) = mpsc::unbounded_channel();
        reg.attach(key("a"), tx);
        assert_eq!(reg.len(), 1);
        reg.detach(&key("a"), None);
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn eviction_honors_cap() {
        let metrics = Arc::new(Metrics::new());
        let reg = TransactionRegistry::new(2, metrics.clone());
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let (tx3, _rx3) = mpsc::unbounded_channel();
        reg.attach(key("a"), tx1);
        reg.attach(key("b"), tx2);
        reg.attach(key("c"), tx3);
        assert_eq!(reg.len(), 2);
        assert_eq!(metrics.snapshot().transactions_evicted, 1);
    }
}
