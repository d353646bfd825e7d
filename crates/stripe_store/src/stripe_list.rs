//! Deterministic stripe-list placement.
//!
//! Each stripe list has `k + m` chunk slots. Slot `c` of list `l` lives on
//! server `(l + c) % num_servers`, which keeps slots of one list on distinct
//! servers whenever `k + m <= num_servers`. Keys hash to a list and a data
//! chunk slot.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Index of a server in the cluster configuration's server table.
pub type ServerIndex = u32;

pub fn hash_key(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Clone)]
pub struct StripeList {
    num_lists: u32,
    num_servers: u32,
    k: u32,
    m: u32,
}

impl StripeList {
    pub fn new(num_lists: u32, num_servers: u32, k: u32, m: u32) -> anyhow::Result<Self> {
        if num_servers < k + m {
            anyhow::bail!(
                "need at least k + m = {} servers, have {num_servers}",
                k + m
            );
        }
        if num_lists == 0 {
            anyhow::bail!("need at least one stripe list");
        }
        Ok(Self { num_lists, num_servers, k, m })
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    pub fn m(&self) -> u32 {
        self.m
    }

    pub fn chunk_count(&self) -> u32 {
        self.k + self.m
    }

    pub fn num_lists(&self) -> u32 {
        self.num_lists
    }

    /// Server holding chunk slot `chunk_id` of list `list_id`.
    pub fn server_at(&self, list_id: u32, chunk_id: u32) -> ServerIndex {
        (list_id + chunk_id) % self.num_servers
    }

    /// All `k + m` servers of a list, indexed by chunk id.
    pub fn servers_of(&self, list_id: u32) -> Vec<ServerIndex> {
        (0..self.chunk_count()).map(|c| self.server_at(list_id, c)).collect()
    }

    /// The `(list, data chunk)` a key maps to.
    pub fn locate(&self, key: &[u8]) -> (u32, u32) {
        let h = hash_key(key);
        let list_id = (h % u64::from(self.num_lists)) as u32;
        let chunk_id = ((h / u64::from(self.num_lists)) % u64::from(self.k)) as u32;
        (list_id, chunk_id)
    }

    /// Every `(list_id, chunk_id)` slot a server participates in.
    pub fn slots_of(&self, server: ServerIndex) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        for list_id in 0..self.num_lists {
            for chunk_id in 0..self.chunk_count() {
                if self.server_at(list_id, chunk_id) == server {
                    out.push((list_id, chunk_id));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_within_a_list_are_distinct_servers() {
        let list = StripeList::new(8, 7, 4, 2).unwrap();
        for l in 0..8 {
            let mut servers = list.servers_of(l);
            servers.sort_unstable();
            servers.dedup();
            assert_eq!(servers.len() as u32, list.chunk_count());
        }
    }

    #[test]
    fn locate_is_stable_and_in_range() {
        let list = StripeList::new(4, 6, 4, 2).unwrap();
        let (l1, c1) = list.locate(b"foo");
        let (l2, c2) = list.locate(b"foo");
        assert_eq!((l1, c1), (l2, c2));
        assert!(l1 < 4);
        assert!(c1 < 4);
    }

    #[test]
    fn slots_of_inverts_server_at() {
        let list = StripeList::new(3, 6, 4, 2).unwrap();
        for server in 0..6 {
            for (l, c) in list.slots_of(server) {
                assert_eq!(list.server_at(l, c), server);
            }
        }
    }

    #[test]
    fn too_few_servers_is_rejected() {
        assert!(StripeList::new(1, 5, 4, 2).is_err());
    }
}
