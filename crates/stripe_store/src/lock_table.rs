//! Coordinator-side degraded lock table and the persistent key remap index.
//!
//! The lock table serializes reconstruction destinations: per stripe there
//! is at most one active assignment, and every source chunk within it maps
//! to exactly one destination until the coordinator releases the stripe
//! after destination catch-up.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::metadata::{RedirectSet, RemappingRecord};

/// One active lock: the redirect assignment chosen when the stripe first
/// went degraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedLock {
    pub redirect: RedirectSet,
}

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    /// No lock existed; the requested assignment is now active.
    Granted(DegradedLock),
    /// A compatible lock existed (idempotent retry or a second failure in
    /// the same stripe); the returned assignment is the merged, authoritative
    /// one.
    Existing(DegradedLock),
    /// The requested assignment names a different destination for an
    /// already-locked source chunk. Carries the authoritative assignment so
    /// the caller can retry correctly.
    Conflict(DegradedLock),
}

pub struct LockTable {
    active: Mutex<HashMap<(u32, u32), DegradedLock>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self { active: Mutex::new(HashMap::new()) }
    }

    /// Acquire or join the lock for `(list_id, stripe_id)`.
    ///
    /// A repeat request whose pairs agree with the active assignment merges
    /// any new pairs in (`Existing`); a request that maps an already-locked
    /// source chunk to a different destination is rejected with the active
    /// assignment (`Conflict`).
    pub fn acquire(&self, list_id: u32, stripe_id: u32, requested: RedirectSet) -> Acquire {
        let mut active = self.active.lock().expect("lock table poisoned");
        match active.get_mut(&(list_id, stripe_id)) {
            None => {
                let lock = DegradedLock { redirect: requested };
                active.insert((list_id, stripe_id), lock.clone());
                Acquire::Granted(lock)
            }
            Some(existing) => {
                for pair in &requested.pairs {
                    if let Some((dst_list, dst_chunk)) =
                        existing.redirect.destination_of(pair.original_chunk)
                    {
                        if (dst_list, dst_chunk) != (pair.redirected_list, pair.redirected_chunk) {
                            return Acquire::Conflict(existing.clone());
                        }
                    }
                }
                // Compatible: fold in pairs for newly failed chunks.
                for pair in &requested.pairs {
                    if !existing.redirect.is_redirected(pair.original_chunk) {
                        existing.redirect.pairs.push(*pair);
                    }
                }
                Acquire::Existing(existing.clone())
            }
        }
    }

    pub fn find(&self, list_id: u32, stripe_id: u32) -> Option<DegradedLock> {
        self.active.lock().expect("lock table poisoned").get(&(list_id, stripe_id)).cloned()
    }

    /// Swap the whole active table out for release processing. Locks taken
    /// after the swap belong to the next release round.
    pub fn take_all(&self) -> HashMap<(u32, u32), DegradedLock> {
        let mut active = self.active.lock().expect("lock table poisoned");
        std::mem::take(&mut *active)
    }

    pub fn len(&self) -> usize {
        self.active.lock().expect("lock table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Key |-> `(list, chunk)` remap index. A record can only be overwritten by
/// an identical one; conflicting inserts and mismatched erases are refused.
pub struct RemappingRecordMap {
    map: Mutex<HashMap<Vec<u8>, RemappingRecord>>,
}

impl RemappingRecordMap {
    pub fn new() -> Self {
        Self { map: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, key: &[u8], record: RemappingRecord) -> bool {
        let mut map = self.map.lock().expect("remap map poisoned");
        match map.get(key) {
            Some(existing) => *existing == record,
            None => {
                map.insert(key.to_vec(), record);
                true
            }
        }
    }

    pub fn erase(&self, key: &[u8], record: RemappingRecord) -> bool {
        let mut map = self.map.lock().expect("remap map poisoned");
        match map.get(key) {
            Some(existing) if *existing != record => false,
            Some(_) => {
                map.remove(key);
                true
            }
            None => true,
        }
    }

    pub fn find(&self, key: &[u8]) -> Option<RemappingRecord> {
        self.map.lock().expect("remap map poisoned").get(key).copied()
    }
}

impl Default for RemappingRecordMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::RemapPair;

    fn redirect(src: u32, dst: u32) -> RedirectSet {
        RedirectSet {
            pairs: vec![RemapPair {
                original_list: 1,
                original_chunk: src,
                redirected_list: 1,
                redirected_chunk: dst,
            }],
            ongoing_at_chunk: src,
            surviving_chunk_ids: vec![1, 2, 3, 4, 5],
        }
    }

    #[test]
    fn at_most_one_destination_per_source_chunk() {
        let table = LockTable::new();
        let first = table.acquire(1, 9, redirect(0, 5));
        assert!(matches!(first, Acquire::Granted(_)));

        // Second request maps chunk 0 to a different destination: rejected,
        // and the response carries the active assignment (0 -> 5).
        match table.acquire(1, 9, redirect(0, 6)) {
            Acquire::Conflict(lock) => {
                assert_eq!(lock.redirect.destination_of(0), Some((1, 5)));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        // The table still holds exactly the original assignment.
        assert_eq!(table.find(1, 9).unwrap().redirect.destination_of(0), Some((1, 5)));
    }

    #[test]
    fn identical_retry_is_idempotent() {
        let table = LockTable::new();
        table.acquire(1, 9, redirect(0, 5));
        for _ in 0..2 {
            match table.acquire(1, 9, redirect(0, 5)) {
                Acquire::Existing(lock) => {
                    assert_eq!(lock.redirect.pairs.len(), 1);
                }
                other => panic!("expected existing, got {other:?}"),
            }
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn second_failure_in_same_stripe_merges() {
        let table = LockTable::new();
        table.acquire(1, 9, redirect(0, 5));
        match table.acquire(1, 9, redirect(4, 6)) {
            Acquire::Existing(lock) => {
                assert_eq!(lock.redirect.destination_of(0), Some((1, 5)));
                assert_eq!(lock.redirect.destination_of(4), Some((1, 6)));
            }
            other => panic!("expected existing, got {other:?}"),
        }
    }

    #[test]
    fn take_all_resets_the_table() {
        let table = LockTable::new();
        table.acquire(1, 1, redirect(0, 5));
        table.acquire(1, 2, redirect(0, 5));
        let taken = table.take_all();
        assert_eq!(taken.len(), 2);
        assert!(table.is_empty());
        // A lock taken after the swap starts a fresh epoch.
        assert!(matches!(table.acquire(1, 1, redirect(0, 5)), Acquire::Granted(_)));
    }

    #[test]
    fn remap_records_do_not_silently_overwrite() {
        let map = RemappingRecordMap::new();
        let a = RemappingRecord { list_id: 1, chunk_id: 5 };
        let b = RemappingRecord { list_id: 1, chunk_id: 6 };
        assert!(map.insert(b"foo", a));
        assert!(map.insert(b"foo", a));
        assert!(!map.insert(b"foo", b));
        assert!(!map.erase(b"foo", b));
        assert!(map.erase(b"foo", a));
        assert!(map.find(b"foo").is_none());
    }
}
