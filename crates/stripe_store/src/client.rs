//! Client library: routes requests by stripe placement, and when a target
//! server is known dead, obtains a degraded lock from the coordinator and
//! redirects the operation to the reconstructing server.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::oneshot;

use crate::config::ClusterConfig;
use crate::metadata::{RedirectSet, RemapPair};
use crate::proto::{Body, Frame, LockOutcome, NodeRole};
use crate::stripe_list::StripeList;
use crate::transport::{self, PeerId, Transport};

/// How long the client waits for any single response.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

struct Inflight {
    map: Mutex<HashMap<u32, oneshot::Sender<Body>>>,
}

impl Inflight {
    fn register(&self, request_id: u32) -> oneshot::Receiver<Body> {
        let (tx, rx) = oneshot::channel();
        self.map.lock().expect("inflight poisoned").insert(request_id, tx);
        rx
    }

    fn complete(&self, request_id: u32, body: Body) {
        if let Some(tx) = self.map.lock().expect("inflight poisoned").remove(&request_id) {
            let _ = tx.send(body);
        } else {
            tracing::debug!(request_id, "late response discarded");
        }
    }
}

pub struct Client {
    cluster: ClusterConfig,
    stripe_list: StripeList,
    transport: Arc<Transport>,
    coordinator: PeerId,
    server_addrs: RwLock<Vec<SocketAddr>>,
    server_peers: Mutex<HashMap<u32, PeerId>>,
    dead: Mutex<HashSet<u32>>,
    instance_id: AtomicU16,
    next_request: AtomicU32,
    inflight: Arc<Inflight>,
}

impl Client {
    pub async fn connect(cluster: ClusterConfig, coordinator_addr: SocketAddr) -> Result<Arc<Self>> {
        let stripe_list = StripeList::new(
            cluster.num_lists,
            cluster.servers.len() as u32,
            cluster.coding.k,
            cluster.coding.m,
        )?;
        let transport = Transport::new();
        let inflight = Arc::new(Inflight { map: Mutex::new(HashMap::new()) });

        let handler_inflight = Arc::clone(&inflight);
        let coordinator = transport::connect(
            Arc::clone(&transport),
            coordinator_addr,
            "coordinator".into(),
            move |_peer, frame| {
                let inflight = Arc::clone(&handler_inflight);
                async move { inflight.complete(frame.request_id, frame.body) }
            },
        )
        .await?;

        let client = Arc::new(Self {
            stripe_list,
            transport,
            coordinator,
            server_addrs: RwLock::new(cluster.servers.clone()),
            server_peers: Mutex::new(HashMap::new()),
            dead: Mutex::new(HashSet::new()),
            instance_id: AtomicU16::new(0),
            next_request: AtomicU32::new(1),
            inflight,
            cluster,
        });

        let rid = client.next_rid();
        let body = Body::Register { role: NodeRole::Client, listen_addr: "0.0.0.0:0".into() };
        let response = client.request(client.coordinator, rid, body).await?;
        match response {
            Body::RegisterResponse { success: true, instance_id } => {
                client.instance_id.store(instance_id, Ordering::Relaxed);
            }
            other => bail!("registration failed: {other:?}"),
        }
        Ok(client)
    }

    fn next_rid(&self) -> u32 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    /// Record that a server is down; subsequent requests touching its
    /// chunks go through the degraded path.
    pub fn mark_dead(&self, index: u32) {
        self.dead.lock().expect("dead set poisoned").insert(index);
        self.server_peers.lock().expect("server peers poisoned").remove(&index);
    }

    pub fn mark_alive(&self, index: u32) {
        self.dead.lock().expect("dead set poisoned").remove(&index);
    }

    /// Adopt a coordinator announcement that a backup took over a slot.
    pub fn adopt_promotion(&self, index: u32, addr: SocketAddr) {
        self.server_addrs.write().expect("server addrs poisoned")[index as usize] = addr;
        self.server_peers.lock().expect("server peers poisoned").remove(&index);
        self.mark_alive(index);
    }

    fn is_dead(&self, index: u32) -> bool {
        self.dead.lock().expect("dead set poisoned").contains(&index)
    }

    async fn peer_for_server(self: &Arc<Self>, index: u32) -> Result<PeerId> {
        if let Some(peer) = self.server_peers.lock().expect("server peers poisoned").get(&index) {
            if self.transport.is_connected(*peer) {
                return Ok(*peer);
            }
        }
        let addr = self.server_addrs.read().expect("server addrs poisoned")[index as usize];
        let inflight = Arc::clone(&self.inflight);
        let peer = transport::connect(
            Arc::clone(&self.transport),
            addr,
            format!("server-{index}"),
            move |_peer, frame| {
                let inflight = Arc::clone(&inflight);
                async move { inflight.complete(frame.request_id, frame.body) }
            },
        )
        .await?;
        self.server_peers.lock().expect("server peers poisoned").insert(index, peer);
        let rid = self.next_rid();
        let register =
            Body::Register { role: NodeRole::Client, listen_addr: "0.0.0.0:0".into() };
        self.request(peer, rid, register).await?;
        Ok(peer)
    }

    async fn request(&self, peer: PeerId, rid: u32, body: Body) -> Result<Body> {
        let rx = self.inflight.register(rid);
        let instance = self.instance_id.load(Ordering::Relaxed);
        if !self.transport.send(peer, Frame::new(instance, rid, body)).await {
            bail!("peer unreachable");
        }
        tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .context("request timed out")?
            .context("connection closed mid-request")
    }

    // ---- normal operations ----

    pub async fn set(self: &Arc<Self>, key: &[u8], value: &[u8]) -> Result<bool> {
        let (list_id, chunk_id) = self.stripe_list.locate(key);
        let index = self.stripe_list.server_at(list_id, chunk_id);
        let peer = self.peer_for_server(index).await?;
        let body = Body::Set { key: key.to_vec(), value: value.to_vec() };
        match self.request(peer, self.next_rid(), body).await? {
            Body::SetResponse { success, .. } => Ok(success),
            other => bail!("unexpected SET response: {other:?}"),
        }
    }

    pub async fn get(self: &Arc<Self>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (list_id, chunk_id) = self.stripe_list.locate(key);
        let index = self.stripe_list.server_at(list_id, chunk_id);
        if self.is_dead(index) || self.any_parity_dead(list_id) {
            return self.degraded_get(key).await;
        }
        let peer = self.peer_for_server(index).await?;
        match self.request(peer, self.next_rid(), Body::Get { key: key.to_vec() }).await? {
            Body::GetResponse { success: true, value, .. } => Ok(Some(value)),
            Body::GetResponse { success: false, .. } => Ok(None),
            other => bail!("unexpected GET response: {other:?}"),
        }
    }

    pub async fn update(self: &Arc<Self>, key: &[u8], value_offset: u32, value: &[u8]) -> Result<bool> {
        let (list_id, chunk_id) = self.stripe_list.locate(key);
        let index = self.stripe_list.server_at(list_id, chunk_id);
        if self.is_dead(index) || self.any_parity_dead(list_id) {
            return self.degraded_update(key, value_offset, value).await;
        }
        let peer = self.peer_for_server(index).await?;
        let body =
            Body::Update { key: key.to_vec(), value_offset, value: value.to_vec() };
        match self.request(peer, self.next_rid(), body).await? {
            Body::UpdateResponse { success, .. } => Ok(success),
            other => bail!("unexpected UPDATE response: {other:?}"),
        }
    }

    pub async fn delete(self: &Arc<Self>, key: &[u8]) -> Result<bool> {
        let (list_id, chunk_id) = self.stripe_list.locate(key);
        let index = self.stripe_list.server_at(list_id, chunk_id);
        if self.is_dead(index) || self.any_parity_dead(list_id) {
            return self.degraded_delete(key).await;
        }
        let peer = self.peer_for_server(index).await?;
        match self.request(peer, self.next_rid(), Body::Delete { key: key.to_vec() }).await? {
            Body::DeleteResponse { success, .. } => Ok(success),
            other => bail!("unexpected DELETE response: {other:?}"),
        }
    }

    // ---- degraded operations ----

    fn any_parity_dead(&self, list_id: u32) -> bool {
        (self.cluster.coding.k..self.stripe_list.chunk_count())
            .any(|c| self.is_dead(self.stripe_list.server_at(list_id, c)))
    }

    /// Propose destinations for every dead chunk slot of the key's list:
    /// rotate through the surviving slots, preferring ones not already
    /// chosen, so each dead chunk gets a distinct stand-in.
    fn propose_redirects(&self, list_id: u32) -> RedirectSet {
        let n = self.stripe_list.chunk_count();
        let mut surviving = Vec::new();
        let mut dead_chunks = Vec::new();
        for c in 0..n {
            if self.is_dead(self.stripe_list.server_at(list_id, c)) {
                dead_chunks.push(c);
            } else {
                surviving.push(c);
            }
        }

        let mut used = HashSet::new();
        let mut pairs = Vec::with_capacity(dead_chunks.len());
        for (i, dead) in dead_chunks.iter().enumerate() {
            // Prefer parity-side survivors; their servers already hold
            // stripe state for the list.
            let candidate = surviving
                .iter()
                .cycle()
                .skip(i % surviving.len().max(1))
                .take(surviving.len())
                .find(|c| !used.contains(*c) && **c >= self.cluster.coding.k)
                .or_else(|| {
                    surviving
                        .iter()
                        .cycle()
                        .skip(i % surviving.len().max(1))
                        .take(surviving.len())
                        .find(|c| !used.contains(*c))
                });
            if let Some(candidate) = candidate {
                used.insert(*candidate);
                pairs.push(RemapPair {
                    original_list: list_id,
                    original_chunk: *dead,
                    redirected_list: list_id,
                    redirected_chunk: *candidate,
                });
            }
        }
        RedirectSet { pairs, ongoing_at_chunk: 0, surviving_chunk_ids: surviving }
    }

    /// Ask the coordinator for a degraded lock. Returns `None` when the
    /// key does not exist.
    async fn acquire_lock(
        self: &Arc<Self>,
        key: &[u8],
    ) -> Result<Option<(LockOutcome, bool, u32, u32, RedirectSet)>> {
        let (list_id, _) = self.stripe_list.locate(key);
        let body = Body::DegradedLock {
            key: key.to_vec(),
            redirect: self.propose_redirects(list_id),
        };
        match self.request(self.coordinator, self.next_rid(), body).await? {
            Body::DegradedLockResponse { outcome: LockOutcome::NotExist, .. } => Ok(None),
            Body::DegradedLockResponse {
                outcome,
                is_sealed,
                stripe_id,
                src_chunk_id,
                redirect,
                ..
            } => Ok(Some((outcome, is_sealed, stripe_id, src_chunk_id, redirect))),
            other => bail!("unexpected DEGRADED_LOCK response: {other:?}"),
        }
    }

    /// The server that executes a degraded op: the destination standing in
    /// for the addressed data chunk, or the original server when only
    /// parity is redirected.
    fn executor_for(&self, redirect: &RedirectSet, list_id: u32, data_chunk: u32) -> u32 {
        match redirect.destination_of(data_chunk) {
            Some((dst_list, dst_chunk)) => self.stripe_list.server_at(dst_list, dst_chunk),
            None => self.stripe_list.server_at(list_id, data_chunk),
        }
    }

    pub async fn degraded_get(self: &Arc<Self>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some((outcome, is_sealed, stripe_id, data_chunk, redirect)) =
            self.acquire_lock(key).await?
        else {
            return Ok(None);
        };
        let (list_id, _) = self.stripe_list.locate(key);
        if outcome == LockOutcome::NotNeeded {
            let index = self.stripe_list.server_at(list_id, data_chunk);
            let peer = self.peer_for_server(index).await?;
            return match self
                .request(peer, self.next_rid(), Body::Get { key: key.to_vec() })
                .await?
            {
                Body::GetResponse { success: true, value, .. } => Ok(Some(value)),
                _ => Ok(None),
            };
        }
        let executor = self.executor_for(&redirect, list_id, data_chunk);
        let peer = self.peer_for_server(executor).await?;
        let body = Body::DegradedGet { key: key.to_vec(), stripe_id, is_sealed, redirect };
        match self.request(peer, self.next_rid(), body).await? {
            Body::GetResponse { success: true, value, .. } => Ok(Some(value)),
            Body::GetResponse { success: false, .. } => Ok(None),
            other => bail!("unexpected degraded GET response: {other:?}"),
        }
    }

    pub async fn degraded_update(
        self: &Arc<Self>,
        key: &[u8],
        value_offset: u32,
        value: &[u8],
    ) -> Result<bool> {
        let Some((outcome, is_sealed, stripe_id, data_chunk, redirect)) =
            self.acquire_lock(key).await?
        else {
            return Ok(false);
        };
        let (list_id, _) = self.stripe_list.locate(key);
        if outcome == LockOutcome::NotNeeded {
            let index = self.stripe_list.server_at(list_id, data_chunk);
            let peer = self.peer_for_server(index).await?;
            let body =
                Body::Update { key: key.to_vec(), value_offset, value: value.to_vec() };
            return match self.request(peer, self.next_rid(), body).await? {
                Body::UpdateResponse { success, .. } => Ok(success),
                other => bail!("unexpected UPDATE response: {other:?}"),
            };
        }
        let executor = self.executor_for(&redirect, list_id, data_chunk);
        let peer = self.peer_for_server(executor).await?;
        let body = Body::DegradedUpdate {
            key: key.to_vec(),
            value_offset,
            value: value.to_vec(),
            stripe_id,
            is_sealed,
            redirect,
        };
        match self.request(peer, self.next_rid(), body).await? {
            Body::UpdateResponse { success, .. } => Ok(success),
            other => bail!("unexpected degraded UPDATE response: {other:?}"),
        }
    }

    pub async fn degraded_delete(self: &Arc<Self>, key: &[u8]) -> Result<bool> {
        let Some((outcome, is_sealed, stripe_id, data_chunk, redirect)) =
            self.acquire_lock(key).await?
        else {
            return Ok(false);
        };
        let (list_id, _) = self.stripe_list.locate(key);
        if outcome == LockOutcome::NotNeeded {
            let index = self.stripe_list.server_at(list_id, data_chunk);
            let peer = self.peer_for_server(index).await?;
            return match self
                .request(peer, self.next_rid(), Body::Delete { key: key.to_vec() })
                .await?
            {
                Body::DeleteResponse { success, .. } => Ok(success),
                other => bail!("unexpected DELETE response: {other:?}"),
            };
        }
        let executor = self.executor_for(&redirect, list_id, data_chunk);
        let peer = self.peer_for_server(executor).await?;
        let body =
            Body::DegradedDelete { key: key.to_vec(), stripe_id, is_sealed, redirect };
        match self.request(peer, self.next_rid(), body).await? {
            Body::DeleteResponse { success, .. } => Ok(success),
            other => bail!("unexpected degraded DELETE response: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodingConfig;
    use stripe_coding::Scheme;

    fn test_client(dead: &[u32]) -> Client {
        let cluster = ClusterConfig {
            coding: CodingConfig { scheme: Scheme::Rs, k: 4, m: 2, chunk_size: 4096 },
            num_lists: 2,
            servers: (0..8)
                .map(|i| format!("127.0.0.1:{}", 7000 + i).parse().unwrap())
                .collect(),
        };
        let stripe_list = StripeList::new(2, 8, 4, 2).unwrap();
        let client = Client {
            stripe_list,
            transport: Transport::new(),
            coordinator: 0,
            server_addrs: RwLock::new(cluster.servers.clone()),
            server_peers: Mutex::new(HashMap::new()),
            dead: Mutex::new(dead.iter().copied().collect()),
            instance_id: AtomicU16::new(1),
            next_request: AtomicU32::new(1),
            inflight: Arc::new(Inflight { map: Mutex::new(HashMap::new()) }),
            cluster,
        };
        client
    }

    #[test]
    fn redirects_cover_every_dead_chunk_with_distinct_destinations() {
        // List 0: chunk c lives on server c. Kill servers 1 and 4.
        let client = test_client(&[1, 4]);
        let set = client.propose_redirects(0);
        assert_eq!(set.pairs.len(), 2);
        let sources: Vec<u32> = set.pairs.iter().map(|p| p.original_chunk).collect();
        assert!(sources.contains(&1));
        assert!(sources.contains(&4));
        let mut dests: Vec<u32> = set.pairs.iter().map(|p| p.redirected_chunk).collect();
        dests.sort_unstable();
        dests.dedup();
        assert_eq!(dests.len(), 2, "destinations must be distinct");
        for d in dests {
            assert!(set.surviving_chunk_ids.contains(&d));
        }
    }

    #[test]
    fn executor_follows_data_redirect() {
        let client = test_client(&[1]);
        let set = client.propose_redirects(0);
        let executor = client.executor_for(&set, 0, 1);
        let (_, dst_chunk) = set.destination_of(1).unwrap();
        assert_eq!(executor, client.stripe_list.server_at(0, dst_chunk));
        // A chunk that is not redirected executes at its own server.
        assert_eq!(client.executor_for(&set, 0, 2), 2);
    }
}
