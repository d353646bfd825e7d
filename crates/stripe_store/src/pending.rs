//! Pending-request correlation tracker.
//!
//! Every asynchronously dispatched request records a continuation here,
//! keyed by `(instance_id, request_id, peer)`. The matching response erases
//! the entry exactly once; a response with no entry is a duplicate or a
//! late arrival and is dropped by the caller after logging. Fan-out flows
//! (parity forwarding, chunk gathering) share one `(instance_id,
//! request_id)` across several peers and use `count` to detect the last
//! acknowledgement.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::metadata::{ChunkPos, RedirectSet};
use crate::transport::PeerId;

/// Correlation key for one in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingId {
    pub instance_id: u16,
    pub request_id: u32,
    pub peer: PeerId,
}

impl PendingId {
    pub fn new(instance_id: u16, request_id: u32, peer: PeerId) -> Self {
        Self { instance_id, request_id, peer }
    }
}

struct Entry<T> {
    parent: PendingId,
    payload: T,
}

/// One category of pending requests. Each category has its own lock; all
/// operations acquire and release it internally, so no exit path can leak
/// a held lock.
pub struct PendingSet<T> {
    name: &'static str,
    map: Mutex<HashMap<PendingId, Entry<T>>>,
}

impl<T> PendingSet<T> {
    pub fn new(name: &'static str) -> Self {
        Self { name, map: Mutex::new(HashMap::new()) }
    }

    /// Record a waiting continuation. Returns false (and logs) if the key is
    /// already present: that is a request-id collision, i.e. a bug in the
    /// caller, not a valid state; the existing entry is left untouched.
    pub fn insert(&self, id: PendingId, parent: PendingId, payload: T) -> bool {
        let mut map = self.map.lock().expect("pending map poisoned");
        if map.contains_key(&id) {
            tracing::error!(
                category = self.name,
                instance_id = id.instance_id,
                request_id = id.request_id,
                peer = id.peer,
                "duplicate pending entry"
            );
            return false;
        }
        map.insert(id, Entry { parent, payload });
        true
    }

    /// Atomically remove and return the entry, or `None` when the response
    /// does not match any in-flight request (duplicate/late arrival).
    pub fn erase(&self, id: PendingId) -> Option<(PendingId, T)> {
        let mut map = self.map.lock().expect("pending map poisoned");
        match map.remove(&id) {
            Some(entry) => Some((entry.parent, entry.payload)),
            None => {
                tracing::error!(
                    category = self.name,
                    instance_id = id.instance_id,
                    request_id = id.request_id,
                    peer = id.peer,
                    "no pending entry matches response; discarding"
                );
                None
            }
        }
    }

    /// Like `erase`, but matches on `(instance_id, request_id)` alone —
    /// used where the responding peer is not the peer the entry was keyed
    /// under (e.g. a fan-out whose first response completes the op).
    pub fn erase_any(&self, instance_id: u16, request_id: u32) -> Option<(PendingId, PendingId, T)> {
        let mut map = self.map.lock().expect("pending map poisoned");
        let key = map
            .keys()
            .find(|id| id.instance_id == instance_id && id.request_id == request_id)
            .copied();
        match key {
            Some(id) => {
                let entry = map.remove(&id).expect("key just observed");
                Some((id, entry.parent, entry.payload))
            }
            None => {
                tracing::error!(
                    category = self.name,
                    instance_id,
                    request_id,
                    "no pending entry matches response; discarding"
                );
                None
            }
        }
    }

    /// Remaining fan-out entries sharing `(instance_id, request_id)`,
    /// excluding `exclude`. Zero means the caller just observed the last
    /// acknowledgement and may answer the original request.
    pub fn count(&self, instance_id: u16, request_id: u32, exclude: PeerId) -> usize {
        let map = self.map.lock().expect("pending map poisoned");
        map.keys()
            .filter(|id| {
                id.instance_id == instance_id && id.request_id == request_id && id.peer != exclude
            })
            .count()
    }

    /// Remove every entry sharing `(instance_id, request_id)`.
    pub fn erase_all(&self, instance_id: u16, request_id: u32) -> Vec<(PendingId, PendingId, T)> {
        let mut map = self.map.lock().expect("pending map poisoned");
        let keys: Vec<PendingId> = map
            .keys()
            .filter(|id| id.instance_id == instance_id && id.request_id == request_id)
            .copied()
            .collect();
        keys.into_iter()
            .map(|id| {
                let entry = map.remove(&id).expect("key just observed");
                (id, entry.parent, entry.payload)
            })
            .collect()
    }

    /// Run `f` over the entry without removing it.
    pub fn with_entry<R>(&self, id: PendingId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut map = self.map.lock().expect("pending map poisoned");
        map.get_mut(&id).map(|entry| f(&mut entry.payload))
    }

    /// `erase` without the missing-entry log, for callers probing several
    /// categories for the owner of a response.
    pub fn erase_quiet(&self, id: PendingId) -> Option<(PendingId, T)> {
        let mut map = self.map.lock().expect("pending map poisoned");
        map.remove(&id).map(|entry| (entry.parent, entry.payload))
    }

    /// Fan-in completion check: if every entry sharing `(instance_id,
    /// request_id)` satisfies `ready`, atomically remove and return them
    /// all; otherwise leave the set untouched. At most one caller observes
    /// the complete set.
    pub fn try_collect(
        &self,
        instance_id: u16,
        request_id: u32,
        ready: impl Fn(&T) -> bool,
    ) -> Option<Vec<(PendingId, PendingId, T)>> {
        let mut map = self.map.lock().expect("pending map poisoned");
        let keys: Vec<PendingId> = map
            .keys()
            .filter(|id| id.instance_id == instance_id && id.request_id == request_id)
            .copied()
            .collect();
        if keys.is_empty() || keys.iter().any(|id| !ready(&map[id].payload)) {
            return None;
        }
        Some(
            keys.into_iter()
                .map(|id| {
                    let entry = map.remove(&id).expect("key just observed");
                    (id, entry.parent, entry.payload)
                })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("pending map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The kind of client operation a degraded op is serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradedOpKind {
    Get,
    Update { value_offset: u32, value: Vec<u8> },
    Delete,
}

/// In-flight degraded GET/UPDATE/DELETE state, owned by the tracker from
/// insertion until exactly one response (or the timeout sweep) erases it.
#[derive(Debug, Clone)]
pub struct DegradedOp {
    pub kind: DegradedOpKind,
    pub key: Vec<u8>,
    pub pos: ChunkPos,
    pub is_sealed: bool,
    pub redirect: RedirectSet,
    /// The client connection to answer, with its original ids.
    pub client: PendingId,
}

/// One outstanding GET_CHUNK fetch within a reconstruction fan-in.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub pos: ChunkPos,
    /// Filled in by the response; `None` until it arrives.
    pub chunk: Option<Vec<u8>>,
    /// Declared size from the responder; zero means unsealed there.
    pub size: u32,
    pub seal_indicator: Vec<bool>,
    /// This node serves the chunk itself; no network fetch happens.
    pub self_sourced: bool,
}

impl ChunkRequest {
    pub fn remote(pos: ChunkPos) -> Self {
        Self { pos, chunk: None, size: 0, seal_indicator: Vec::new(), self_sourced: false }
    }

    pub fn local(pos: ChunkPos) -> Self {
        Self { pos, chunk: None, size: 0, seal_indicator: Vec::new(), self_sourced: true }
    }
}

/// A parity-delta forward awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct ChunkUpdate {
    pub pos: ChunkPos,
    pub offset: u32,
    pub length: u32,
    pub key: Vec<u8>,
    pub value_offset: u32,
    /// Whether the originating client request was a degraded one.
    pub is_degraded: bool,
}

/// One stripe rebuild performed on behalf of the recovery orchestrator:
/// decode the lost chunk, then forward it to the promoted backup.
#[derive(Debug, Clone)]
pub struct RecoveryJob {
    /// The lost chunk being rebuilt.
    pub pos: ChunkPos,
    /// The coordinator's batch this job counts against.
    pub batch: PendingId,
}

/// Categories used by a storage node. Grouped by who the request went to.
pub struct Pending {
    // Requests from clients this node still owes an answer.
    pub client_get: PendingSet<Vec<u8>>,
    pub client_update: PendingSet<Vec<u8>>,
    pub client_delete: PendingSet<Vec<u8>>,
    // Requests this node sent to server peers. Forward-key entries carry
    // the client response to emit once the last acknowledgement arrives.
    pub degraded_ops: PendingSet<DegradedOp>,
    pub peer_get_chunk: PendingSet<ChunkRequest>,
    pub peer_set_chunk: PendingSet<ChunkPos>,
    pub peer_unsealed_get: PendingSet<Vec<u8>>,
    pub peer_forward_key: PendingSet<crate::proto::Body>,
    pub peer_forward_chunk: PendingSet<ChunkPos>,
    pub peer_update_chunk: PendingSet<ChunkUpdate>,
    pub peer_delete_chunk: PendingSet<ChunkUpdate>,
    pub peer_seal_chunk: PendingSet<ChunkPos>,
    // Stripe rebuilds running for the recovery orchestrator.
    pub recovery_ops: PendingSet<RecoveryJob>,
}

impl Pending {
    pub fn new() -> Self {
        Self {
            client_get: PendingSet::new("client.get"),
            client_update: PendingSet::new("client.update"),
            client_delete: PendingSet::new("client.delete"),
            degraded_ops: PendingSet::new("peer.degraded_ops"),
            peer_get_chunk: PendingSet::new("peer.get_chunk"),
            peer_set_chunk: PendingSet::new("peer.set_chunk"),
            peer_unsealed_get: PendingSet::new("peer.unsealed_get"),
            peer_forward_key: PendingSet::new("peer.forward_key"),
            peer_forward_chunk: PendingSet::new("peer.forward_chunk"),
            peer_update_chunk: PendingSet::new("peer.update_chunk"),
            peer_delete_chunk: PendingSet::new("peer.delete_chunk"),
            peer_seal_chunk: PendingSet::new("peer.seal_chunk"),
            recovery_ops: PendingSet::new("peer.recovery_ops"),
        }
    }
}

impl Default for Pending {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(request_id: u32, peer: PeerId) -> PendingId {
        PendingId::new(1, request_id, peer)
    }

    #[test]
    fn duplicate_insert_is_rejected_and_original_survives() {
        let set = PendingSet::new("test");
        assert!(set.insert(id(9, 2), id(9, 1), "first"));
        assert!(!set.insert(id(9, 2), id(9, 1), "second"));
        let (_, payload) = set.erase(id(9, 2)).unwrap();
        assert_eq!(payload, "first");
    }

    #[test]
    fn erase_of_unknown_response_returns_none() {
        let set: PendingSet<()> = PendingSet::new("test");
        assert!(set.erase(id(1, 1)).is_none());
    }

    #[test]
    fn erase_is_exactly_once() {
        let set = PendingSet::new("test");
        set.insert(id(5, 3), id(5, 0), 42u32);
        assert!(set.erase(id(5, 3)).is_some());
        assert!(set.erase(id(5, 3)).is_none());
    }

    #[test]
    fn count_excludes_the_named_peer() {
        let set = PendingSet::new("test");
        for peer in 1..=3 {
            set.insert(id(7, peer), id(7, 0), ());
        }
        // Observing peer 2's ack: two other entries remain.
        assert_eq!(set.count(1, 7, 2), 2);
        set.erase(id(7, 1)).unwrap();
        set.erase(id(7, 3)).unwrap();
        assert_eq!(set.count(1, 7, 2), 0);
    }

    #[test]
    fn fan_in_completes_only_after_last_ack_out_of_order() {
        let set = PendingSet::new("test");
        for peer in 1..=3 {
            set.insert(id(4, peer), id(4, 0), ());
        }
        // Acks arrive 3, 1, 2. Only the last observes an empty remainder.
        for (peer, expect_done) in [(3, false), (1, false), (2, true)] {
            set.erase(id(4, peer)).unwrap();
            let done = set.count(1, 4, peer) == 0;
            assert_eq!(done, expect_done, "peer {peer}");
        }
    }

    #[test]
    fn erase_any_matches_regardless_of_peer() {
        let set = PendingSet::new("test");
        set.insert(id(8, 0), id(8, 9), "op");
        let (found, parent, payload) = set.erase_any(1, 8).unwrap();
        assert_eq!(found.peer, 0);
        assert_eq!(parent.request_id, 8);
        assert_eq!(payload, "op");
    }

    #[test]
    fn try_collect_fires_exactly_once_when_all_ready() {
        let set: PendingSet<Option<u32>> = PendingSet::new("test");
        for peer in 1..=3 {
            set.insert(id(2, peer), id(2, 0), None);
        }
        // Nothing ready yet.
        assert!(set.try_collect(1, 2, |v| v.is_some()).is_none());
        set.with_entry(id(2, 1), |v| *v = Some(10));
        set.with_entry(id(2, 2), |v| *v = Some(20));
        assert!(set.try_collect(1, 2, |v| v.is_some()).is_none());
        set.with_entry(id(2, 3), |v| *v = Some(30));
        let collected = set.try_collect(1, 2, |v| v.is_some()).unwrap();
        assert_eq!(collected.len(), 3);
        // The set is drained; a second collect sees nothing.
        assert!(set.try_collect(1, 2, |v| v.is_some()).is_none());
    }

    #[test]
    fn erase_all_drains_the_fan_out() {
        let set = PendingSet::new("test");
        for peer in 1..=4 {
            set.insert(id(6, peer), id(6, 0), peer);
        }
        set.insert(id(7, 1), id(7, 0), 99);
        let drained = set.erase_all(1, 6);
        assert_eq!(drained.len(), 4);
        assert_eq!(set.len(), 1);
    }
}
