//! Stripe/chunk addressing and key location records.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Address of one chunk slot: `(list, stripe, chunk)`. Chunk ids below `k`
/// are data chunks, ids in `[k, k + m)` are parity chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    pub list_id: u32,
    pub stripe_id: u32,
    pub chunk_id: u32,
}

impl ChunkPos {
    pub fn new(list_id: u32, stripe_id: u32, chunk_id: u32) -> Self {
        Self { list_id, stripe_id, chunk_id }
    }

    /// The same slot with the stripe id erased. Degraded-lock destinations
    /// are stripe-agnostic: a destination is a `(list, chunk)` role.
    pub fn without_stripe(mut self) -> Self {
        self.stripe_id = u32::MAX;
        self
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.list_id, self.stripe_id, self.chunk_id)
    }
}

/// Location of one serialized key-value record inside a sealed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMetadata {
    pub pos: ChunkPos,
    pub offset: u32,
    pub length: u32,
}

/// One source-to-destination chunk redirect: `(list, chunk)` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapPair {
    pub original_list: u32,
    pub original_chunk: u32,
    pub redirected_list: u32,
    pub redirected_chunk: u32,
}

/// The redirect set carried by every degraded request and stored in the
/// coordinator's lock table: which chunk slots are being served elsewhere,
/// which chunk the requesting node is reconstructing, and which chunk ids
/// are known to survive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RedirectSet {
    pub pairs: Vec<RemapPair>,
    pub ongoing_at_chunk: u32,
    pub surviving_chunk_ids: Vec<u32>,
}

impl RedirectSet {
    /// Whether any redirected source is a data chunk (`chunk_id < k`).
    pub fn redirects_data(&self, k: u32) -> bool {
        self.pairs.iter().any(|p| p.original_chunk < k)
    }

    /// The destination for a given source chunk, if redirected.
    pub fn destination_of(&self, chunk_id: u32) -> Option<(u32, u32)> {
        self.pairs
            .iter()
            .find(|p| p.original_chunk == chunk_id)
            .map(|p| (p.redirected_list, p.redirected_chunk))
    }

    /// Whether a chunk id appears as a redirect source.
    pub fn is_redirected(&self, chunk_id: u32) -> bool {
        self.pairs.iter().any(|p| p.original_chunk == chunk_id)
    }
}

/// Persistent key remap record on the coordinator: key |-> `(list, chunk)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemappingRecord {
    pub list_id: u32,
    pub chunk_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(src: u32, dst: u32) -> RemapPair {
        RemapPair {
            original_list: 1,
            original_chunk: src,
            redirected_list: 1,
            redirected_chunk: dst,
        }
    }

    #[test]
    fn redirect_set_classifies_data_and_parity() {
        let set = RedirectSet {
            pairs: vec![pair(4, 6), pair(5, 7)],
            ongoing_at_chunk: 0,
            surviving_chunk_ids: vec![0, 1, 2, 3],
        };
        // k = 4: chunks 4 and 5 are parity, so no data chunk is redirected.
        assert!(!set.redirects_data(4));
        assert!(set.redirects_data(5));
        assert_eq!(set.destination_of(4), Some((1, 6)));
        assert_eq!(set.destination_of(0), None);
    }

    #[test]
    fn pos_ordering_is_list_stripe_chunk() {
        let a = ChunkPos::new(1, 2, 3);
        let b = ChunkPos::new(1, 3, 0);
        assert!(a < b);
    }
}
