//! Strict two-phase lock manager
//!
//! ## Lock strengths
//! Null < Read < Update < Write. A transaction holds exactly one strength per
//! resource. Update only appears while a Read lock is being converted to Write: it
//! keeps new readers out while the converter waits for the existing readers to leave.
//!
//! ## Deadlock handling
//! There is no wait-for graph. A waiter blocks on the resource's release signal for at
//! most `deadlock_timeout_ms`; when the deadline passes the request fails with
//! `DeadlockDetected` (or `ResourceLocked` if a conversion was in flight, in which case
//! the original Read lock is restored). A cycle is therefore always broken after the
//! timeout, at the price of false positives under heavy contention.
//!
//! ## Concurrency
//! One coarse mutex guards find-or-create of resource entries; each entry then has its
//! own mutex and condvar, so unrelated resources never contend. Grants are not FIFO:
//! any waiter may win once compatibility holds.

pub mod mode;

pub use mode::LockMode;

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{BedrockError, Result};
use crate::types::{ResourceKey, TxnId};

/// Lock manager configuration
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long a lock request may wait before it is treated as a deadlock
    pub deadlock_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            deadlock_timeout_ms: 10_000,
        }
    }
}

/// Holders of one resource, bucketed by strength
#[derive(Debug)]
struct ResourceEntry {
    holders: [HashSet<TxnId>; 4],
    strongest: LockMode,
}

impl ResourceEntry {
    fn new() -> Self {
        Self {
            holders: Default::default(),
            strongest: LockMode::Null,
        }
    }

    fn held_by(&self, txn: TxnId) -> Option<LockMode> {
        LockMode::ALL
            .iter()
            .rev()
            .copied()
            .find(|mode| self.holders[mode.index()].contains(&txn))
    }

    /// Register `txn` at `mode`, replacing whatever strength it held before.
    fn grant(&mut self, txn: TxnId, mode: LockMode) {
        for set in self.holders.iter_mut() {
            set.remove(&txn);
        }
        self.holders[mode.index()].insert(txn);
        self.recompute();
    }

    /// Drop `txn` from one strength. Returns true if waiters should be woken.
    fn release(&mut self, txn: TxnId, mode: LockMode) -> bool {
        if !self.holders[mode.index()].remove(&txn) {
            return false;
        }
        let before = self.strongest;
        self.recompute();
        let readers_gone = mode == LockMode::Read
            && self.holders[LockMode::Read.index()].is_empty()
            && !self.holders[LockMode::Update.index()].is_empty();
        self.strongest < before || readers_gone
    }

    fn recompute(&mut self) {
        self.strongest = LockMode::ALL
            .iter()
            .rev()
            .copied()
            .find(|mode| !self.holders[mode.index()].is_empty())
            .unwrap_or(LockMode::Null);
    }

    /// Anyone other than `txn` holding Read, Update or Write?
    fn has_other_holders(&self, txn: TxnId) -> bool {
        [LockMode::Read, LockMode::Update, LockMode::Write]
            .iter()
            .any(|mode| self.holders[mode.index()].iter().any(|t| *t != txn))
    }

    fn is_idle(&self) -> bool {
        self.holders.iter().all(|set| set.is_empty())
    }
}

/// A resource entry plus its reusable release signal
struct ResourceSlot {
    state: Mutex<ResourceEntry>,
    released: Condvar,
}

impl ResourceSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(ResourceEntry::new()),
            released: Condvar::new(),
        }
    }
}

/// The lock manager
///
/// Generic over the lockable key; defaults to [`ResourceKey`].
pub struct LockManager<K = ResourceKey> {
    table: Mutex<HashMap<K, Arc<ResourceSlot>>>,
    deadlock_timeout: Duration,
}

impl<K> LockManager<K>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn new(config: LockConfig) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            deadlock_timeout: Duration::from_millis(config.deadlock_timeout_ms),
        }
    }

    pub fn deadlock_timeout(&self) -> Duration {
        self.deadlock_timeout
    }

    pub fn lock_for_read(&self, txn: TxnId, key: &K) -> Result<()> {
        self.lock(txn, key, LockMode::Read)
    }

    pub fn lock_for_write(&self, txn: TxnId, key: &K) -> Result<()> {
        self.lock(txn, key, LockMode::Write)
    }

    /// Release a Read lock. Returns false if `txn` did not hold one.
    pub fn unlock_read(&self, txn: TxnId, key: &K) -> bool {
        self.unlock(txn, key, LockMode::Read)
    }

    /// Release a Write lock. Returns false if `txn` did not hold one.
    pub fn unlock_write(&self, txn: TxnId, key: &K) -> bool {
        self.unlock(txn, key, LockMode::Write)
    }

    /// Strength currently held by `txn` on `key`, if any
    pub fn held_mode(&self, txn: TxnId, key: &K) -> Option<LockMode> {
        let slot = self.table.lock().unwrap().get(key).cloned()?;
        let entry = slot.state.lock().unwrap();
        entry.held_by(txn)
    }

    /// Does `txn` hold any lock at all?
    pub fn holds_any(&self, txn: TxnId) -> bool {
        let slots: Vec<Arc<ResourceSlot>> =
            self.table.lock().unwrap().values().cloned().collect();
        slots
            .iter()
            .any(|slot| slot.state.lock().unwrap().held_by(txn).is_some())
    }

    /// Number of resources with a live entry in the lock table
    pub fn resource_count(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    fn slot(&self, key: &K) -> Arc<ResourceSlot> {
        let mut table = self.table.lock().unwrap();
        Arc::clone(
            table
                .entry(key.clone())
                .or_insert_with(|| Arc::new(ResourceSlot::new())),
        )
    }

    fn lock(&self, txn: TxnId, key: &K, mode: LockMode) -> Result<()> {
        let slot = self.slot(key);
        let deadline = Instant::now() + self.deadlock_timeout;
        let mut converting = false;
        let mut entry = slot.state.lock().unwrap();

        loop {
            let held = entry.held_by(txn);
            if held == Some(mode) {
                return Ok(());
            }
            // Write subsumes read; never downgrade.
            if mode == LockMode::Read && held == Some(LockMode::Write) {
                return Ok(());
            }

            if held == Some(LockMode::Update) && mode == LockMode::Write {
                if !entry.has_other_holders(txn) {
                    entry.grant(txn, LockMode::Write);
                    if converting {
                        log::debug!("{} converted read lock on {} to write", txn, key);
                    }
                    return Ok(());
                }
            } else if mode.is_compatible_with(entry.strongest) {
                entry.grant(txn, mode);
                return Ok(());
            } else if mode == LockMode::Write && held == Some(LockMode::Read) {
                entry.grant(txn, LockMode::Update);
                converting = true;
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                if converting {
                    entry.grant(txn, LockMode::Read);
                    slot.released.notify_all();
                    return Err(BedrockError::ResourceLocked(format!(
                        "{} could not convert read lock on {} to write within {:?}",
                        txn, key, self.deadlock_timeout
                    )));
                }
                return Err(BedrockError::DeadlockDetected(format!(
                    "{} timed out after {:?} waiting for {} lock on {}",
                    txn, self.deadlock_timeout, mode, key
                )));
            }

            log::debug!("{} waiting for {} lock on {} (held: {})", txn, mode, key, entry.strongest);
            let (guard, _) = slot
                .released
                .wait_timeout(entry, deadline - now)
                .unwrap();
            entry = guard;
        }
    }

    fn unlock(&self, txn: TxnId, key: &K, mode: LockMode) -> bool {
        let slot = match self.table.lock().unwrap().get(key) {
            Some(slot) => Arc::clone(slot),
            None => return false,
        };
        let mut entry = slot.state.lock().unwrap();
        let held = entry.holders[mode.index()].contains(&txn);
        if entry.release(txn, mode) {
            slot.released.notify_all();
        }
        held
    }

    /// Release every strength `txn` holds on every resource.
    ///
    /// Safe to call when `txn` holds nothing, and safe to call twice.
    pub fn unlock_all(&self, txn: TxnId) {
        let slots: Vec<Arc<ResourceSlot>> =
            self.table.lock().unwrap().values().cloned().collect();

        for slot in &slots {
            let mut entry = slot.state.lock().unwrap();
            let mut wake = false;
            for mode in LockMode::ALL {
                wake |= entry.release(txn, mode);
            }
            if wake {
                slot.released.notify_all();
            }
        }
        drop(slots);

        // Forget entries nobody holds or waits on; a waiter keeps its own Arc.
        let mut table = self.table.lock().unwrap();
        table.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || !slot.state.lock().unwrap().is_idle()
        });
    }
}

impl<K> Default for LockManager<K>
where
    K: Eq + Hash + Clone + Display,
{
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn manager(timeout_ms: u64) -> Arc<LockManager> {
        Arc::new(LockManager::new(LockConfig {
            deadlock_timeout_ms: timeout_ms,
        }))
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("flight", name)
    }

    #[test]
    fn test_shared_readers() {
        let locks = manager(100);
        let (t1, t2) = (TxnId::generate(), TxnId::generate());
        locks.lock_for_read(t1, &key("AA1")).unwrap();
        locks.lock_for_read(t2, &key("AA1")).unwrap();
        assert_eq!(locks.held_mode(t1, &key("AA1")), Some(LockMode::Read));
        assert_eq!(locks.held_mode(t2, &key("AA1")), Some(LockMode::Read));
    }

    #[test]
    fn test_relock_is_noop() {
        let locks = manager(100);
        let t1 = TxnId::generate();
        locks.lock_for_write(t1, &key("AA1")).unwrap();
        locks.lock_for_write(t1, &key("AA1")).unwrap();
        // Write subsumes read.
        locks.lock_for_read(t1, &key("AA1")).unwrap();
        assert_eq!(locks.held_mode(t1, &key("AA1")), Some(LockMode::Write));

        // A single unlock releases it; no duplicate bookkeeping.
        assert!(locks.unlock_write(t1, &key("AA1")));
        assert_eq!(locks.held_mode(t1, &key("AA1")), None);
    }

    #[test]
    fn test_write_blocked_by_reader_times_out() {
        let locks = manager(50);
        let (t1, t2) = (TxnId::generate(), TxnId::generate());
        locks.lock_for_read(t1, &key("AA1")).unwrap();
        let err = locks.lock_for_write(t2, &key("AA1")).unwrap_err();
        assert!(matches!(err, BedrockError::DeadlockDetected(_)));
    }

    #[test]
    fn test_sole_reader_upgrades_immediately() {
        let locks = manager(50);
        let t1 = TxnId::generate();
        locks.lock_for_read(t1, &key("AA1")).unwrap();
        locks.lock_for_write(t1, &key("AA1")).unwrap();
        assert_eq!(locks.held_mode(t1, &key("AA1")), Some(LockMode::Write));
    }

    #[test]
    fn test_failed_conversion_restores_read() {
        let locks = manager(50);
        let (t1, t2) = (TxnId::generate(), TxnId::generate());
        locks.lock_for_read(t1, &key("AA1")).unwrap();
        locks.lock_for_read(t2, &key("AA1")).unwrap();

        let err = locks.lock_for_write(t1, &key("AA1")).unwrap_err();
        assert!(matches!(err, BedrockError::ResourceLocked(_)));
        assert_eq!(locks.held_mode(t1, &key("AA1")), Some(LockMode::Read));

        // The pending Update is gone, so readers are admitted again.
        let t3 = TxnId::generate();
        locks.lock_for_read(t3, &key("AA1")).unwrap();
    }

    #[test]
    fn test_conversion_completes_when_other_reader_leaves() {
        let locks = manager(2_000);
        let (t1, t2) = (TxnId::generate(), TxnId::generate());
        locks.lock_for_read(t1, &key("AA1")).unwrap();
        locks.lock_for_read(t2, &key("AA1")).unwrap();

        let upgrader = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.lock_for_write(t1, &key("AA1")))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(locks.unlock_read(t2, &key("AA1")));

        upgrader.join().unwrap().unwrap();
        assert_eq!(locks.held_mode(t1, &key("AA1")), Some(LockMode::Write));
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let locks = manager(2_000);
        let (t1, t2) = (TxnId::generate(), TxnId::generate());
        locks.lock_for_write(t1, &key("AA1")).unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                let start = Instant::now();
                locks.lock_for_read(t2, &key("AA1")).map(|_| start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        locks.unlock_all(t1);

        let waited = waiter.join().unwrap().unwrap();
        assert!(waited < Duration::from_millis(2_000));
    }

    #[test]
    fn test_unlock_all_then_fresh_writer() {
        let locks = manager(50);
        let (t1, t2) = (TxnId::generate(), TxnId::generate());
        locks.lock_for_write(t1, &key("AA1")).unwrap();
        locks.lock_for_read(t1, &key("AA2")).unwrap();
        locks.unlock_all(t1);
        locks.unlock_all(t1);

        locks.lock_for_write(t2, &key("AA1")).unwrap();
        locks.lock_for_write(t2, &key("AA2")).unwrap();
    }

    #[test]
    fn test_unlock_all_prunes_idle_entries() {
        let locks = manager(50);
        let t1 = TxnId::generate();
        locks.lock_for_write(t1, &key("AA1")).unwrap();
        locks.lock_for_write(t1, &key("AA2")).unwrap();
        assert_eq!(locks.resource_count(), 2);
        locks.unlock_all(t1);
        assert_eq!(locks.resource_count(), 0);
    }

    #[test]
    fn test_holds_any() {
        let locks = manager(50);
        let (t1, t2) = (TxnId::generate(), TxnId::generate());
        assert!(!locks.holds_any(t1));
        locks.lock_for_read(t1, &key("AA1")).unwrap();
        assert!(locks.holds_any(t1));
        assert!(!locks.holds_any(t2));
        locks.unlock_all(t1);
        assert!(!locks.holds_any(t1));
    }

    #[test]
    fn test_unrelated_resources_do_not_block() {
        let locks = manager(50);
        let (t1, t2) = (TxnId::generate(), TxnId::generate());
        locks.lock_for_write(t1, &key("AA1")).unwrap();
        locks.lock_for_write(t2, &key("AA2")).unwrap();
    }
}
