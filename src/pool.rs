//! Egress resource (proxy) rotation with cooldown and failure backoff.
//!
//! The pool is shared between concurrent runs. All state sits behind one
//! mutex so the ring order is never seen half-rebuilt by an acquirer.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

/// Upper bound on the extra rest a failing resource is given.
pub const MAX_FAILURE_BACKOFF: Duration = Duration::from_secs(120);

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub address: String,
    /// `None` until first handed out. May lie in the future after a failure.
    pub last_used: Option<Instant>,
    pub failure_count: u32,
}

impl ResourceRecord {
    fn new(address: String) -> Self {
        Self {
            address,
            last_used: None,
            failure_count: 0,
        }
    }

    fn is_rested(&self, now: Instant, cooldown: Duration) -> bool {
        match self.last_used {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= cooldown,
        }
    }
}

#[derive(Debug, Default)]
struct Ring {
    records: Vec<ResourceRecord>,
    /// Index the next scan starts from.
    cursor: usize,
}

impl Ring {
    fn position(&self, address: &str) -> Option<usize> {
        self.records.iter().position(|r| r.address == address)
    }

    fn rebuild(&mut self) {
        self.cursor = 0;
    }
}

#[derive(Debug)]
pub struct ResourcePool {
    ring: Mutex<Ring>,
    cooldown: Duration,
}

impl ResourcePool {
    pub fn new<I, S>(addresses: I, cooldown: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut records: Vec<ResourceRecord> = Vec::new();
        for address in addresses {
            let address = address.into();
            if !records.iter().any(|r| r.address == address) {
                records.push(ResourceRecord::new(address));
            }
        }

        Self {
            ring: Mutex::new(Ring { records, cursor: 0 }),
            cooldown,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::<String>::new(), DEFAULT_COOLDOWN)
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand out the next rested resource in ring order, or `None` when a
    /// full lap finds nothing eligible.
    pub fn acquire(&self) -> Option<String> {
        self.acquire_at(Instant::now())
    }

    pub fn acquire_at(&self, now: Instant) -> Option<String> {
        let mut ring = self.lock();
        let len = ring.records.len();
        for step in 0..len {
            let index = (ring.cursor + step) % len;
            let record = &mut ring.records[index];
            if record.is_rested(now, self.cooldown) {
                record.last_used = Some(now);
                let address = record.address.clone();
                ring.cursor = (index + 1) % len;
                debug!(proxy = %address, "resource acquired");
                return Some(address);
            }
        }
        None
    }

    /// Push the resource's next eligibility out by
    /// `min(failures * cooldown, MAX_FAILURE_BACKOFF)` beyond the normal rest.
    pub fn report_failure(&self, address: &str) {
        self.report_failure_at(address, Instant::now());
    }

    pub fn report_failure_at(&self, address: &str, now: Instant) {
        let mut ring = self.lock();
        let Some(index) = ring.position(address) else {
            return;
        };
        let record = &mut ring.records[index];
        record.failure_count += 1;
        let backoff = self
            .cooldown
            .saturating_mul(record.failure_count)
            .min(MAX_FAILURE_BACKOFF);
        record.last_used = Some(now + backoff);
        debug!(proxy = %address, failures = record.failure_count, ?backoff, "resource failure");
    }

    pub fn report_success(&self, address: &str) {
        self.report_success_at(address, Instant::now());
    }

    pub fn report_success_at(&self, address: &str, now: Instant) {
        let mut ring = self.lock();
        let Some(index) = ring.position(address) else {
            return;
        };
        let record = &mut ring.records[index];
        record.failure_count = record.failure_count.saturating_sub(1);
        record.last_used = Some(now);
    }

    pub fn add(&self, address: impl Into<String>) {
        let address = address.into();
        let mut ring = self.lock();
        if ring.position(&address).is_none() {
            ring.records.push(ResourceRecord::new(address));
            ring.rebuild();
        }
    }

    pub fn remove(&self, address: &str) {
        let mut ring = self.lock();
        if let Some(index) = ring.position(address) {
            ring.records.remove(index);
            ring.rebuild();
        }
    }

    /// Any resource, rested or not.
    pub fn random_pick(&self) -> Option<String> {
        let ring = self.lock();
        if ring.records.is_empty() {
            return None;
        }
        let len = ring.records.len();
        let index = ((rand::random::<f64>() * len as f64) as usize).min(len - 1);
        Some(ring.records[index].address.clone())
    }

    pub fn snapshot(&self) -> Vec<ResourceRecord> {
        self.lock().records.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().expect("resource pool mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    const C: Duration = Duration::from_secs(10);

    fn pool(n: usize) -> ResourcePool {
        ResourcePool::new((0..n).map(|i| format!("http://proxy-{i}:8080")), C)
    }

    #[test]
    fn hands_out_each_resource_once_per_cooldown() {
        let pool = pool(3);
        let now = Instant::now();

        let got: Vec<_> = (0..3).map(|_| pool.acquire_at(now).unwrap()).collect();
        let distinct: HashSet<_> = got.iter().collect();
        assert_eq!(distinct.len(), 3);
        assert_eq!(pool.acquire_at(now), None);
    }

    #[test]
    fn rotation_follows_ring_order() {
        let pool = pool(3);
        let t0 = Instant::now();
        assert_eq!(pool.acquire_at(t0).unwrap(), "http://proxy-0:8080");
        assert_eq!(pool.acquire_at(t0).unwrap(), "http://proxy-1:8080");

        // After the cooldown everyone is rested; the scan resumes after proxy-1.
        let later = t0 + C;
        assert_eq!(pool.acquire_at(later).unwrap(), "http://proxy-2:8080");
        assert_eq!(pool.acquire_at(later).unwrap(), "http://proxy-0:8080");
    }

    #[test]
    fn failure_backoff_grows_then_caps() {
        let pool = ResourcePool::new(["a"], C);
        let t0 = Instant::now();
        let mut previous_delay = Duration::ZERO;

        for k in 1..=15u32 {
            pool.report_failure_at("a", t0);
            let backoff = (C * k).min(MAX_FAILURE_BACKOFF);
            let ready = t0 + backoff + C;

            assert_eq!(pool.acquire_at(ready - Duration::from_millis(1)), None);
            assert!(backoff >= previous_delay);
            previous_delay = backoff;

            let record = &pool.snapshot()[0];
            assert_eq!(record.failure_count, k);
            assert_eq!(record.last_used, Some(t0 + backoff));
        }

        let capped = t0 + MAX_FAILURE_BACKOFF + C;
        assert_eq!(pool.acquire_at(capped).as_deref(), Some("a"));
    }

    #[test]
    fn success_decrements_failures_and_stamps_use() {
        let pool = ResourcePool::new(["a"], C);
        let t0 = Instant::now();
        pool.report_failure_at("a", t0);
        pool.report_failure_at("a", t0);

        let t1 = t0 + Duration::from_secs(1);
        pool.report_success_at("a", t1);
        let record = &pool.snapshot()[0];
        assert_eq!(record.failure_count, 1);
        assert_eq!(record.last_used, Some(t1));

        pool.report_success_at("a", t1);
        pool.report_success_at("a", t1);
        assert_eq!(pool.snapshot()[0].failure_count, 0);
        assert_eq!(pool.acquire_at(t1), None);
        assert!(pool.acquire_at(t1 + C).is_some());
    }

    #[test]
    fn empty_pool_is_transparent() {
        let pool = ResourcePool::empty();
        for _ in 0..5 {
            assert_eq!(pool.acquire(), None);
            assert_eq!(pool.random_pick(), None);
        }
        pool.report_failure("nowhere");
        pool.report_success("nowhere");
        assert!(pool.is_empty());
    }

    #[test]
    fn mutation_rebuilds_ring() {
        let pool = pool(2);
        let t0 = Instant::now();
        assert_eq!(pool.acquire_at(t0).unwrap(), "http://proxy-0:8080");

        pool.add("http://fresh:3128");
        pool.add("http://fresh:3128");
        assert_eq!(pool.len(), 3);
        // Scan restarts at the head; proxy-0 is still resting.
        assert_eq!(pool.acquire_at(t0).unwrap(), "http://proxy-1:8080");
        assert_eq!(pool.acquire_at(t0).unwrap(), "http://fresh:3128");

        pool.remove("http://proxy-1:8080");
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.acquire_at(t0), None);
        assert_eq!(pool.acquire_at(t0 + C).unwrap(), "http://proxy-0:8080");
    }

    #[test]
    fn random_pick_ignores_cooldown() {
        let pool = pool(2);
        let now = Instant::now();
        pool.acquire_at(now);
        pool.acquire_at(now);
        assert_eq!(pool.acquire_at(now), None);
        let picked = pool.random_pick().unwrap();
        assert!(picked.starts_with("http://proxy-"));
    }

    #[test]
    fn zero_cooldown_reuses_immediately() {
        let pool = ResourcePool::new(["a", "b"], Duration::ZERO);
        let now = Instant::now();
        let got: Vec<_> = (0..4).map(|_| pool.acquire_at(now).unwrap()).collect();
        assert_eq!(got, ["a", "b", "a", "b"]);
    }

    #[test]
    fn concurrent_acquirers_never_share_a_rested_slot() {
        let pool = Arc::new(pool(8));
        let now = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || pool.acquire_at(now))
            })
            .collect();

        let got: HashSet<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        assert_eq!(got.len(), 8);
        assert_eq!(pool.acquire_at(now), None);
    }
}
