//! Server-side state for chunks and keys being served in degraded mode:
//! reconstructed-chunk cache, unsealed key-value cache, the removed-chunk
//! set, and the reconstruction-in-progress markers that dedup concurrent
//! requests for the same stripe or key.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::chunk::Chunk;
use crate::metadata::{ChunkPos, KeyMetadata};
use crate::pending::PendingId;

/// A request parked on an in-flight reconstruction. Released exactly once,
/// when the reconstruction completes or permanently fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub id: PendingId,
    pub chunk_id: u32,
}

struct Markers<K> {
    in_progress: HashMap<K, Vec<Waiter>>,
    reconstructed: HashSet<K>,
}

impl<K: std::hash::Hash + Eq> Markers<K> {
    fn new() -> Self {
        Self { in_progress: HashMap::new(), reconstructed: HashSet::new() }
    }
}

/// Outcome of registering interest in a reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Caller is first: it must start the reconstruction.
    Start,
    /// A reconstruction is already in flight; the caller was parked.
    Joined,
    /// The target was already reconstructed; read it from the cache.
    AlreadyDone,
}

pub struct DegradedMap {
    /// Key |-> location inside a cached sealed chunk.
    keys: Mutex<HashMap<Vec<u8>, KeyMetadata>>,
    /// Keys recovered from unsealed chunks, held as whole values.
    values: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    /// Reconstructed or fetched sealed chunks.
    cache: Mutex<HashMap<ChunkPos, Chunk>>,
    /// Chunks that were migrated away after release; serving them again
    /// would resurrect stale data.
    removed: Mutex<HashSet<ChunkPos>>,
    chunk_markers: Mutex<Markers<ChunkPos>>,
    key_markers: Mutex<Markers<Vec<u8>>>,
}

impl DegradedMap {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            values: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            removed: Mutex::new(HashSet::new()),
            chunk_markers: Mutex::new(Markers::new()),
            key_markers: Mutex::new(Markers::new()),
        }
    }

    /// Marker key for a stripe: reconstruction rebuilds the whole stripe at
    /// once, so markers are per `(list, stripe)`, not per chunk slot.
    fn stripe_key(list_id: u32, stripe_id: u32) -> ChunkPos {
        ChunkPos::new(list_id, stripe_id, u32::MAX)
    }

    // ---- lookups ----

    /// Value for a key, from the unsealed cache or a cached sealed chunk.
    pub fn find_value_by_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(value) = self.values.lock().expect("values poisoned").get(key) {
            return Some(value.clone());
        }
        let meta = *self.keys.lock().expect("keys poisoned").get(key)?;
        let cache = self.cache.lock().expect("cache poisoned");
        let chunk = cache.get(&meta.pos)?;
        chunk.record_at(meta.offset).map(|(_, value)| value.to_vec())
    }

    pub fn find_key_metadata(&self, key: &[u8]) -> Option<KeyMetadata> {
        self.keys.lock().expect("keys poisoned").get(key).copied()
    }

    pub fn has_chunk(&self, pos: ChunkPos) -> bool {
        self.cache.lock().expect("cache poisoned").contains_key(&pos)
    }

    pub fn chunk_data(&self, pos: ChunkPos) -> Option<Vec<u8>> {
        self.cache.lock().expect("cache poisoned").get(&pos).map(|c| c.data().to_vec())
    }

    /// Mutate a cached chunk in place (degraded UPDATE/DELETE).
    pub fn with_chunk_mut<R>(&self, pos: ChunkPos, f: impl FnOnce(&mut Chunk) -> R) -> Option<R> {
        let mut cache = self.cache.lock().expect("cache poisoned");
        cache.get_mut(&pos).map(f)
    }

    pub fn is_removed(&self, pos: ChunkPos) -> bool {
        self.removed.lock().expect("removed poisoned").contains(&pos)
    }

    // ---- population ----

    /// Adopt a reconstructed or fetched chunk and index its records. A data
    /// chunk's records become findable by key; parity chunks are cached as
    /// raw bytes only. Re-inserting an already-cached chunk is refused.
    pub fn insert_chunk(&self, chunk: Chunk) -> bool {
        let pos = chunk.pos;
        let records = if chunk.is_parity { Vec::new() } else { chunk.records() };
        {
            let mut cache = self.cache.lock().expect("cache poisoned");
            if cache.contains_key(&pos) {
                return false;
            }
            cache.insert(pos, chunk);
        }
        self.removed.lock().expect("removed poisoned").remove(&pos);
        let mut keys = self.keys.lock().expect("keys poisoned");
        for (key, offset, length) in records {
            keys.insert(key, KeyMetadata { pos, offset, length });
        }
        true
    }

    /// Cache one key-value recovered from an unsealed chunk.
    pub fn insert_value(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        let mut values = self.values.lock().expect("values poisoned");
        if values.contains_key(&key) {
            return false;
        }
        values.insert(key, value);
        true
    }

    /// Drop a cached chunk (it migrated to its destination) and remember
    /// that it left, along with its key index entries.
    pub fn remove_chunk(&self, pos: ChunkPos) -> Option<Chunk> {
        let chunk = self.cache.lock().expect("cache poisoned").remove(&pos)?;
        self.removed.lock().expect("removed poisoned").insert(pos);
        let mut keys = self.keys.lock().expect("keys poisoned");
        keys.retain(|_, meta| meta.pos != pos);
        Some(chunk)
    }

    pub fn delete_key(&self, key: &[u8]) -> Option<KeyMetadata> {
        self.keys.lock().expect("keys poisoned").remove(key)
    }

    pub fn delete_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.values.lock().expect("values poisoned").remove(key)
    }

    /// Overwrite part of a cached unsealed value in place.
    pub fn update_value_in_place(&self, key: &[u8], value_offset: u32, bytes: &[u8]) -> bool {
        let mut values = self.values.lock().expect("values poisoned");
        match values.get_mut(key) {
            Some(value) if value_offset as usize + bytes.len() <= value.len() => {
                value[value_offset as usize..value_offset as usize + bytes.len()]
                    .copy_from_slice(bytes);
                true
            }
            _ => false,
        }
    }

    /// Rewrite key offsets after a chunk compaction: every key in `pos`
    /// whose offset lies beyond `from_offset` shifts left by `shrink`.
    pub fn shift_keys_after(&self, pos: ChunkPos, from_offset: u32, shrink: u32) {
        let mut keys = self.keys.lock().expect("keys poisoned");
        for meta in keys.values_mut() {
            if meta.pos == pos && meta.offset > from_offset {
                meta.offset -= shrink;
            }
        }
    }

    // ---- reconstruction dedup markers ----

    /// Register interest in reconstructing a stripe. The first caller gets
    /// `Start`; concurrent callers are parked as waiters on the same
    /// in-flight round.
    pub fn join_chunk_reconstruction(
        &self,
        list_id: u32,
        stripe_id: u32,
        waiter: Option<Waiter>,
    ) -> JoinOutcome {
        let marker = Self::stripe_key(list_id, stripe_id);
        let mut markers = self.chunk_markers.lock().expect("chunk markers poisoned");
        if let Some(waiters) = markers.in_progress.get_mut(&marker) {
            waiters.extend(waiter);
            return JoinOutcome::Joined;
        }
        if markers.reconstructed.contains(&marker) {
            return JoinOutcome::AlreadyDone;
        }
        markers.in_progress.insert(marker, waiter.into_iter().collect());
        JoinOutcome::Start
    }

    /// Finish a stripe reconstruction: drop the marker and return every
    /// parked waiter, exactly once. On success the stripe joins the
    /// reconstructed set so late requests short-circuit to the cache.
    pub fn complete_chunk_reconstruction(
        &self,
        list_id: u32,
        stripe_id: u32,
        success: bool,
    ) -> Vec<Waiter> {
        let marker = Self::stripe_key(list_id, stripe_id);
        let mut markers = self.chunk_markers.lock().expect("chunk markers poisoned");
        let waiters = markers.in_progress.remove(&marker).unwrap_or_default();
        if success {
            markers.reconstructed.insert(marker);
        }
        waiters
    }

    /// Register interest in recovering one unsealed key.
    pub fn join_key_reconstruction(&self, key: &[u8], waiter: Option<Waiter>) -> JoinOutcome {
        let mut markers = self.key_markers.lock().expect("key markers poisoned");
        if let Some(waiters) = markers.in_progress.get_mut(key) {
            waiters.extend(waiter);
            return JoinOutcome::Joined;
        }
        if markers.reconstructed.contains(key) {
            return JoinOutcome::AlreadyDone;
        }
        markers.in_progress.insert(key.to_vec(), waiter.into_iter().collect());
        JoinOutcome::Start
    }

    pub fn complete_key_reconstruction(&self, key: &[u8], success: bool) -> Vec<Waiter> {
        let mut markers = self.key_markers.lock().expect("key markers poisoned");
        let waiters = markers.in_progress.remove(key).unwrap_or_default();
        if success {
            markers.reconstructed.insert(key.to_vec());
        }
        waiters
    }

    pub fn cached_chunk_count(&self) -> usize {
        self.cache.lock().expect("cache poisoned").len()
    }
}

impl Default for DegradedMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed_chunk(pos: ChunkPos, records: &[(&[u8], &[u8])]) -> Chunk {
        let mut chunk = Chunk::new(256);
        for (k, v) in records {
            chunk.append_record(k, v);
        }
        chunk.pos = pos;
        chunk
    }

    fn waiter(request_id: u32) -> Waiter {
        Waiter { id: PendingId::new(1, request_id, 0), chunk_id: 1 }
    }

    #[test]
    fn inserted_chunk_records_become_findable() {
        let map = DegradedMap::new();
        let pos = ChunkPos::new(3, 7, 1);
        assert!(map.insert_chunk(sealed_chunk(pos, &[(b"foo", b"bar"), (b"baz", b"qux")])));
        assert_eq!(map.find_value_by_key(b"foo").unwrap(), b"bar");
        assert_eq!(map.find_key_metadata(b"baz").unwrap().pos, pos);
        assert!(map.find_value_by_key(b"nope").is_none());
    }

    #[test]
    fn removed_chunk_is_not_resurrected() {
        let map = DegradedMap::new();
        let pos = ChunkPos::new(1, 2, 0);
        map.insert_chunk(sealed_chunk(pos, &[(b"k", b"v")]));
        assert!(map.remove_chunk(pos).is_some());
        assert!(map.is_removed(pos));
        assert!(map.find_value_by_key(b"k").is_none());
        // Re-insert (e.g. by a late reconstruction) clears the removed flag.
        map.insert_chunk(sealed_chunk(pos, &[(b"k", b"v")]));
        assert!(!map.is_removed(pos));
    }

    #[test]
    fn concurrent_joins_share_one_reconstruction() {
        let map = DegradedMap::new();
        assert_eq!(map.join_chunk_reconstruction(3, 7, Some(waiter(1))), JoinOutcome::Start);
        assert_eq!(map.join_chunk_reconstruction(3, 7, Some(waiter(2))), JoinOutcome::Joined);
        assert_eq!(map.join_chunk_reconstruction(3, 7, Some(waiter(3))), JoinOutcome::Joined);

        let released = map.complete_chunk_reconstruction(3, 7, true);
        assert_eq!(released.len(), 3);

        // Completion is exactly-once: a second drain finds nothing.
        assert!(map.complete_chunk_reconstruction(3, 7, true).is_empty());
        // Late request short-circuits.
        assert_eq!(map.join_chunk_reconstruction(3, 7, None), JoinOutcome::AlreadyDone);
    }

    #[test]
    fn failed_reconstruction_allows_retry() {
        let map = DegradedMap::new();
        assert_eq!(map.join_chunk_reconstruction(1, 1, Some(waiter(1))), JoinOutcome::Start);
        let released = map.complete_chunk_reconstruction(1, 1, false);
        assert_eq!(released.len(), 1);
        // Failure does not poison the stripe: the next request restarts.
        assert_eq!(map.join_chunk_reconstruction(1, 1, None), JoinOutcome::Start);
    }

    #[test]
    fn key_markers_mirror_chunk_markers() {
        let map = DegradedMap::new();
        assert_eq!(map.join_key_reconstruction(b"foo", Some(waiter(1))), JoinOutcome::Start);
        assert_eq!(map.join_key_reconstruction(b"foo", Some(waiter(2))), JoinOutcome::Joined);
        assert_eq!(map.complete_key_reconstruction(b"foo", true).len(), 2);
        assert_eq!(map.join_key_reconstruction(b"foo", None), JoinOutcome::AlreadyDone);
    }

    #[test]
    fn shift_keys_after_compaction() {
        let map = DegradedMap::new();
        let pos = ChunkPos::new(1, 1, 0);
        map.insert_chunk(sealed_chunk(pos, &[(b"a", b"11"), (b"b", b"22"), (b"c", b"33")]));
        let b_meta = map.find_key_metadata(b"b").unwrap();
        map.delete_key(b"b");
        map.shift_keys_after(pos, b_meta.offset, b_meta.length);
        let c_meta = map.find_key_metadata(b"c").unwrap();
        assert_eq!(c_meta.offset, b_meta.offset);
        // Keys before the hole are untouched.
        assert_eq!(map.find_key_metadata(b"a").unwrap().offset, 0);
    }
}
