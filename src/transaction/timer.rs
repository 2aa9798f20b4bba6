//! Timer Manager: named, cancellable one-shot timers (RFC 3261 timers
//! A/B/D/E/F/G/H/I/J/K plus dialog-expiry and session-refresh), grounded
//! on the reference implementation's `Timer<T>` — a `BTreeMap` keyed by
//! `(deadline, task_id)` with a side `id -> deadline` index for O(log n)
//! cancellation.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

use crate::transaction::key::TransactionKey;

/// RFC 3261 Timer T1/T2/T4 defaults, overridable via [`TimerOptions`].
pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_millis(4_000);
pub const T4: Duration = Duration::from_millis(5_000);

#[derive(Debug, Clone, Copy)]
pub struct TimerOptions {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    /// 64*T1: Timer B/F/H/J default.
    pub t1x64: Duration,
    /// Dialog-expiry default when no explicit Session-Expires applies.
    pub dialog_expiry: Duration,
    pub cleanup_interval: Duration,
    pub max_cleanup_per_pass: usize,
    pub max_age: Duration,
}

impl Default for TimerOptions {
    fn default() -> Self {
        Self {
            t1: T1,
            t2: T2,
            t4: T4,
            t1x64: T1 * 64,
            dialog_expiry: Duration::from_secs(12 * 3600),
            cleanup_interval: Duration::from_secs(30),
            max_cleanup_per_pass: 1000,
            max_age: Duration::from_secs(3600),
        }
    }
}

/// Named RFC 3261 transaction timers plus the dialog-layer additions.
#[derive(Debug, Clone)]
pub enum TransactionTimer {
    /// INVITE client retransmit (unreliable transports only), doubling.
    TimerA(TransactionKey, Duration),
    /// INVITE client transaction timeout.
    TimerB(TransactionKey),
    /// Wait for response retransmits after an INVITE client terminates.
    TimerD(TransactionKey),
    /// Non-INVITE client retransmit, capped at T2.
    TimerE(TransactionKey, Duration),
    /// Non-INVITE client transaction timeout.
    TimerF(TransactionKey),
    /// INVITE server response retransmit (unreliable transports only).
    TimerG(TransactionKey, Duration),
    /// INVITE server wait-for-ACK timeout.
    TimerH(TransactionKey),
    /// INVITE server wait for ACK retransmits after Confirmed.
    TimerI(TransactionKey),
    /// Non-INVITE server wait before cleanup.
    TimerJ(TransactionKey),
    /// Wait for non-INVITE response retransmits.
    TimerK(TransactionKey),
    /// Dialog expiry (no refresh / no BYE within the dialog's lifetime).
    DialogExpiry(crate::dialog::DialogId),
    /// Session-refresh reminder (RFC 4028); disabled by default per
    /// spec.md open question (c).
    SessionRefresh(crate::dialog::DialogId),
}

impl TransactionTimer {
    /// The transaction key this timer fires against, or `None` for the
    /// dialog-layer timer kinds (`DialogExpiry`/`SessionRefresh`), which the
    /// background dispatcher routes to the dialog layer instead of the
    /// transaction registry.
    pub fn transaction_key(&self) -> Option<&TransactionKey> {
        match self {
            TransactionTimer::TimerA(k, _)
            | TransactionTimer::TimerB(k)
            | TransactionTimer::TimerD(k)
            | TransactionTimer::TimerE(k, _)
            | TransactionTimer::TimerF(k)
            | TransactionTimer::TimerG(k, _)
            | TransactionTimer::TimerH(k)
            | TransactionTimer::TimerI(k)
            | TransactionTimer::TimerJ(k)
            | TransactionTimer::TimerK(k) => Some(k),
            TransactionTimer::DialogExpiry(_) | TransactionTimer::SessionRefresh(_) => None,
        }
    }

    pub fn dialog_id(&self) -> Option<&crate::dialog::DialogId> {
        match self {
            TransactionTimer::DialogExpiry(id) | TransactionTimer::SessionRefresh(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, PartialOrd, PartialEq, Eq, Clone)]
struct TimerKey {
    task_id: u64,
    execute_at: Instant,
}

impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.execute_at.cmp(&other.execute_at)
    }
}

/// Generic deadline-ordered timer wheel. `T` carries whatever payload the
/// caller wants delivered when the timer fires.
pub struct Timer<T> {
    tasks: RwLock<BTreeMap<TimerKey, T>>,
    id_to_tasks: RwLock<HashMap<u64, Instant>>,
    last_task_id: AtomicU64,
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            tasks: RwLock::new(BTreeMap::new()),
            id_to_tasks: RwLock::new(HashMap::new()),
            last_task_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timeout(&self, duration: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + duration, value)
    }

    pub fn timeout_at(&self, execute_at: Instant, value: T) -> u64 {
        let task_id = self.last_task_id.fetch_add(1, Ordering::Relaxed);
        self.tasks.write().unwrap().insert(
            TimerKey {
                task_id,
                execute_at,
            },
            value,
        );
        self.id_to_tasks
            .write()
            .unwrap()
            .insert(task_id, execute_at);
        task_id
    }

    /// Idempotent: cancelling an unknown or already-fired id is a no-op.
    pub fn cancel(&self, task_id: u64) -> Option<T> {
        let position = { self.id_to_tasks.write().unwrap().remove(&task_id) };
        if let Some(execute_at) = position {
            self.tasks.write().unwrap().remove(&TimerKey {
                task_id,
                execute_at,
            })
        } else {
            None
        }
    }

    /// Drains every entry whose deadline is `<= now`, bounded by `limit`
    /// entries so a sweeper pass never blocks under load (spec.md §4.3).
    pub fn poll_bounded(&self, now: Instant, limit: usize) -> Vec<T> {
        let mut result = Vec::new();
        let keys_to_remove = {
            let mut tasks = self.tasks.write().unwrap();
            let keys_to_remove = tasks
                .range(
                    ..=TimerKey {
                        task_id: u64::MAX,
                        execute_at: now,
                    },
                )
                .take(limit)
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();

            if keys_to_remove.is_empty() {
                return result;
            }
            result.reserve(keys_to_remove.len());
            for key in keys_to_remove.iter() {
                if let Some(value) = tasks.remove(key) {
                    result.push(value);
                }
            }
            keys_to_remove
        };
        {
            let mut id_to_tasks = self.id_to_tasks.write().unwrap();
            for key in keys_to_remove {
                id_to_tasks.remove(&key.task_id);
            }
        }
        result
    }

    pub fn poll(&self, now: Instant) -> Vec<T> {
        self.poll_bounded(now, usize::MAX)
    }

    /// Force-cancels every timer older than `max_age`, used by the
    /// background sweeper to bound memory when callers leak timer ids.
    pub fn evict_older_than(&self, now: Instant, max_age: Duration) -> usize {
        let stale: Vec<u64> = self
            .id_to_tasks
            .read()
            .unwrap()
            .iter()
            .filter(|(_, execute_at)| now.saturating_duration_since(**execute_at) > max_age)
            .map(|(id, _)| *id)
            .collect();
        let n = stale.len();
        for id in stale {
            self.cancel(id);
        }
        n
    }
}
