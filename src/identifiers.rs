//! Identifier Pool: Call-ID, From/To tag, and Via branch generation.
//!
//! Grounded on the reference implementation's `transaction::make_tag` /
//! `make_call_id` free functions (random hex strings built from `rand`),
//! generalized into a pool that pre-generates entropy in batches to
//! amortize the cost of the OS RNG under heavy dialog churn, as required
//! by spec.md §4.1.

use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// RFC 3261 requires branch parameters for requests made via the RFC 3261
/// transaction machinery to start with this "magic cookie".
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

const POOL_CAPACITY: usize = 256;
const TAG_BYTES: usize = 8; // 64 bits of entropy
const CALL_ID_BYTES: usize = 16; // 128 bits of entropy
const BRANCH_BYTES: usize = 12;

/// Snapshot of pool health, exposed as the "hit-rate" health metric named
/// in spec.md §4.1.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
}

impl PoolStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            1.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Batch {
    buf: Vec<u8>,
    cursor: usize,
}

impl Batch {
    fn new(entropy_bytes: usize) -> Self {
        let mut buf = vec![0u8; POOL_CAPACITY * entropy_bytes];
        rand::rng().fill_bytes(&mut buf);
        Self { buf, cursor: 0 }
    }

    fn take(&mut self, entropy_bytes: usize) -> Option<&[u8]> {
        if self.cursor + entropy_bytes > self.buf.len() {
            return None;
        }
        let slice = &self.buf[self.cursor..self.cursor + entropy_bytes];
        self.cursor += entropy_bytes;
        Some(slice)
    }
}

/// Pre-generates random bytes for tags, Call-IDs, and branch parameters
/// so steady-state callers rarely touch the OS entropy source directly.
///
/// Uniqueness is guaranteed either by the entropy width (>=64 bits) or,
/// should the RNG ever be exhausted, by mixing a per-process random node
/// id with a monotonic counter (never returns an empty string).
pub struct IdentifierPool {
    node_id: u64,
    counter: AtomicU64,
    tags: Mutex<Batch>,
    call_ids: Mutex<Batch>,
    branches: Mutex<Batch>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for IdentifierPool {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentifierPool {
    pub fn new() -> Self {
        Self {
            node_id: rand::rng().next_u64(),
            counter: AtomicU64::new(0),
            tags: Mutex::new(Batch::new(TAG_BYTES)),
            call_ids: Mutex::new(Batch::new(CALL_ID_BYTES)),
            branches: Mutex::new(Batch::new(BRANCH_BYTES)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn fallback_hex(&self, bytes: usize) -> String {
        self.misses.fetch_add(1, Ordering::Relaxed);
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mixed = self.node_id ^ nanos.rotate_left(17) ^ n.wrapping_mul(0x9E3779B97F4A7C15);
        let mut s = format!("{:016x}{:016x}", mixed, n);
        s.truncate((bytes * 2).max(16));
        s
    }

    fn draw(&self, batch: &Mutex<Batch>, entropy_bytes: usize) -> String {
        let mut guard = batch.lock().unwrap();
        match guard.take(entropy_bytes) {
            Some(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                hex_encode(bytes)
            }
            None => {
                *guard = Batch::new(entropy_bytes);
                match guard.take(entropy_bytes) {
                    Some(bytes) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        hex_encode(bytes)
                    }
                    None => self.fallback_hex(entropy_bytes),
                }
            }
        }
    }

    /// Generates a Call-ID: 128 bits of hex entropy, suffixed with `@host`
    /// when a host is supplied.
    pub fn get_call_id(&self, host: Option<&str>) -> String {
        let id = self.draw(&self.call_ids, CALL_ID_BYTES);
        match host {
            Some(h) if !h.is_empty() => format!("{}@{}", id, h),
            _ => id,
        }
    }

    /// Generates a From/To tag: 64 bits of hex entropy.
    pub fn get_tag(&self) -> String {
        self.draw(&self.tags, TAG_BYTES)
    }

    /// Generates a Via branch parameter, RFC 3261-prefixed.
    pub fn get_branch(&self) -> String {
        format!("{}{}", BRANCH_MAGIC_COOKIE, self.draw(&self.branches, BRANCH_BYTES))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{:02x}", b).ok();
    }
    s
}
