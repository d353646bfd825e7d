//! Storage node: primary key-value store, per-list unsealed write heads,
//! incremental parity accumulation, and the frame dispatch loop.
//!
//! Parity is maintained incrementally: data servers forward unsealed
//! key-values at SET time (so parity peers can answer degraded reads for
//! unsealed data), then push the full chunk at seal time; parity servers
//! fold each sealed data chunk's linear contribution into an accumulating
//! parity chunk and remember which data chunks they have seen sealed. That
//! per-stripe seal bitmap is what GET_CHUNK reports to reconstruction.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Sentinel for a backup node that has not been promoted into a slot yet.
pub const UNASSIGNED_INDEX: u32 = u32::MAX;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use tokio::net::TcpListener;

use crate::chunk::{Chunk, ChunkPool, ChunkStatus};
use crate::config::{ClusterConfig, NodeTuning};
use crate::degraded;
use crate::degraded_map::DegradedMap;
use crate::metadata::{ChunkPos, KeyMetadata};
use crate::pending::{ChunkUpdate, Pending, PendingId};
use crate::proto::{Body, ForwardOp, Frame, NodeRole};
use crate::recovery::{self, RecoveryState};
use crate::stripe_list::StripeList;
use crate::transport::{self, PeerId, Transport};
use stripe_coding::{bitwise_xor, Coding};

/// Result of appending one record into the write head.
pub struct SetOutcome {
    pub meta: KeyMetadata,
    /// The head this append displaced, now sealed and cached; its bytes
    /// must be announced to the list's parity peers.
    pub sealed: Option<Chunk>,
}

/// Primary store: sealed chunks, the per-list unsealed write head, and the
/// key index over both.
pub struct Store {
    keys: Mutex<HashMap<Vec<u8>, KeyMetadata>>,
    chunks: Mutex<HashMap<ChunkPos, Chunk>>,
    heads: Mutex<HashMap<u32, Chunk>>,
    next_stripe: Mutex<HashMap<u32, u32>>,
    chunk_size: usize,
}

impl Store {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            chunks: Mutex::new(HashMap::new()),
            heads: Mutex::new(HashMap::new()),
            next_stripe: Mutex::new(HashMap::new()),
            chunk_size,
        }
    }

    /// Stripe id the write head of `list_id` is currently filling.
    pub fn head_stripe(&self, list_id: u32) -> u32 {
        *self.next_stripe.lock().expect("stripe counter poisoned").entry(list_id).or_insert(0)
    }

    /// Append a record, sealing the head first if the record does not fit.
    pub fn set(&self, list_id: u32, my_chunk_id: u32, key: &[u8], value: &[u8]) -> SetOutcome {
        let mut heads = self.heads.lock().expect("heads poisoned");
        let mut sealed = None;

        let needs_seal = heads
            .get(&list_id)
            .map(|head| !head.fits(key.len(), value.len()))
            .unwrap_or(false);
        if needs_seal {
            let mut head = heads.remove(&list_id).expect("head just observed");
            head.status = ChunkStatus::Cached;
            self.chunks.lock().expect("chunks poisoned").insert(head.pos, head.clone());
            let mut counters = self.next_stripe.lock().expect("stripe counter poisoned");
            *counters.entry(list_id).or_insert(0) += 1;
            sealed = Some(head);
        }

        let head = heads.entry(list_id).or_insert_with(|| {
            let stripe = *self
                .next_stripe
                .lock()
                .expect("stripe counter poisoned")
                .entry(list_id)
                .or_insert(0);
            let mut chunk = Chunk::new(self.chunk_size);
            chunk.pos = ChunkPos::new(list_id, stripe, my_chunk_id);
            chunk
        });
        let offset = head.append_record(key, value);
        let meta = KeyMetadata {
            pos: head.pos,
            offset,
            length: crate::chunk::RECORD_HEADER_SIZE + key.len() as u32 + value.len() as u32,
        };
        self.keys.lock().expect("keys poisoned").insert(key.to_vec(), meta);
        SetOutcome { meta, sealed }
    }

    pub fn key_meta(&self, key: &[u8]) -> Option<KeyMetadata> {
        self.keys.lock().expect("keys poisoned").get(key).copied()
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let meta = self.key_meta(key)?;
        self.with_resident_chunk(meta.pos, |chunk| {
            chunk.record_at(meta.offset).map(|(_, value)| value.to_vec())
        })?
    }

    /// Whether `pos` is sealed here (resident in the sealed-chunk map).
    pub fn is_sealed(&self, pos: ChunkPos) -> bool {
        self.chunks.lock().expect("chunks poisoned").contains_key(&pos)
    }

    pub fn chunk_bytes(&self, pos: ChunkPos) -> Option<(Vec<u8>, u32)> {
        let chunks = self.chunks.lock().expect("chunks poisoned");
        chunks.get(&pos).map(|c| (c.data().to_vec(), c.size()))
    }

    pub fn insert_sealed(&self, chunk: Chunk) {
        let pos = chunk.pos;
        let records = if chunk.is_parity { Vec::new() } else { chunk.records() };
        self.chunks.lock().expect("chunks poisoned").insert(pos, chunk);
        let mut keys = self.keys.lock().expect("keys poisoned");
        for (key, offset, length) in records {
            keys.entry(key).or_insert(KeyMetadata { pos, offset, length });
        }
    }

    /// Run `f` against the chunk holding `pos`, whether sealed or the live
    /// write head.
    pub fn with_resident_chunk<R>(&self, pos: ChunkPos, f: impl FnOnce(&mut Chunk) -> R) -> Option<R> {
        {
            let mut chunks = self.chunks.lock().expect("chunks poisoned");
            if let Some(chunk) = chunks.get_mut(&pos) {
                return Some(f(chunk));
            }
        }
        let mut heads = self.heads.lock().expect("heads poisoned");
        match heads.get_mut(&pos.list_id) {
            Some(head) if head.pos == pos => Some(f(head)),
            _ => None,
        }
    }

    pub fn delete_key(&self, key: &[u8]) -> Option<KeyMetadata> {
        self.keys.lock().expect("keys poisoned").remove(key)
    }

    /// Rewrite key offsets after compacting the chunk at `pos`.
    pub fn shift_keys_after(&self, pos: ChunkPos, from_offset: u32, shrink: u32) {
        let mut keys = self.keys.lock().expect("keys poisoned");
        for meta in keys.values_mut() {
            if meta.pos == pos && meta.offset > from_offset {
                meta.offset -= shrink;
            }
        }
    }

    /// Sealed chunks and keys this node owns, for recovery planning.
    pub fn snapshot(&self) -> (Vec<ChunkPos>, Vec<Vec<u8>>) {
        let chunks = self.chunks.lock().expect("chunks poisoned");
        let keys = self.keys.lock().expect("keys poisoned");
        let sealed: Vec<ChunkPos> = chunks.keys().copied().collect();
        let unsealed = keys
            .iter()
            .filter(|(_, meta)| !chunks.contains_key(&meta.pos))
            .map(|(key, _)| key.clone())
            .collect();
        (sealed, unsealed)
    }
}

/// Parity accumulation for one stripe.
struct ParityAccum {
    data: Vec<u8>,
    seen_sealed: Vec<bool>,
}

/// Parity-role state: accumulating parity chunks, forwarded unsealed
/// key-value copies, and this parity's view of each data chunk's seal
/// progress (seal notifications arrive in stripe order per data slot, so
/// the count of seals seen is the data server's current head stripe).
pub struct ParityState {
    acc: Mutex<HashMap<ChunkPos, ParityAccum>>,
    kv: Mutex<HashMap<Vec<u8>, (ChunkPos, Vec<u8>)>>,
    seal_counts: Mutex<HashMap<(u32, u32), u32>>,
}

impl ParityState {
    pub fn new() -> Self {
        Self {
            acc: Mutex::new(HashMap::new()),
            kv: Mutex::new(HashMap::new()),
            seal_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Best-effort stripe the data server's write head for `(list, chunk)`
    /// is currently filling.
    pub fn head_stripe_guess(&self, list_id: u32, chunk_id: u32) -> u32 {
        *self
            .seal_counts
            .lock()
            .expect("seal counts poisoned")
            .get(&(list_id, chunk_id))
            .unwrap_or(&0)
    }

    pub fn store_kv(&self, key: Vec<u8>, data_pos: ChunkPos, value: Vec<u8>) {
        self.kv.lock().expect("parity kv poisoned").insert(key, (data_pos, value));
    }

    pub fn find_kv(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.kv.lock().expect("parity kv poisoned").get(key).map(|(_, v)| v.clone())
    }

    pub fn update_kv(&self, key: &[u8], value_offset: u32, bytes: &[u8]) -> bool {
        let mut kv = self.kv.lock().expect("parity kv poisoned");
        match kv.get_mut(key) {
            Some((_, value)) if value_offset as usize + bytes.len() <= value.len() => {
                value[value_offset as usize..value_offset as usize + bytes.len()]
                    .copy_from_slice(bytes);
                true
            }
            _ => false,
        }
    }

    pub fn remove_kv(&self, key: &[u8]) -> bool {
        self.kv.lock().expect("parity kv poisoned").remove(key).is_some()
    }

    /// Seal bitmap this parity holds for a stripe, if it is accumulating.
    pub fn seal_indicator(&self, parity_pos: ChunkPos) -> Option<Vec<bool>> {
        let acc = self.acc.lock().expect("parity acc poisoned");
        acc.get(&parity_pos).map(|a| a.seen_sealed.clone())
    }

    pub fn accum_bytes(&self, parity_pos: ChunkPos) -> Option<Vec<u8>> {
        let acc = self.acc.lock().expect("parity acc poisoned");
        acc.get(&parity_pos).map(|a| a.data.clone())
    }
}

impl Default for ParityState {
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata changes queued for the next coordinator sync.
#[derive(Default)]
pub struct SyncBatch {
    pub sealed: Vec<ChunkPos>,
    pub set_keys: Vec<(Vec<u8>, ChunkPos)>,
    pub del_keys: Vec<Vec<u8>>,
}

impl SyncBatch {
    fn is_empty(&self) -> bool {
        self.sealed.is_empty() && self.set_keys.is_empty() && self.del_keys.is_empty()
    }
}

/// Everything a storage node shares across its connection tasks. Built once
/// at startup and passed around by `Arc`.
pub struct ServerState {
    pub cluster: ClusterConfig,
    pub tuning: NodeTuning,
    /// This node's slot in the server table; `UNASSIGNED_INDEX` for a
    /// backup awaiting promotion.
    pub server_index: AtomicU32,
    /// Where this node listens (a backup's address is not in the table).
    pub listen_addr: SocketAddr,
    /// list id |-> this server's chunk slot in that list.
    pub roles: RwLock<HashMap<u32, u32>>,
    pub stripe_list: StripeList,
    pub coding: Box<dyn Coding>,
    pub transport: Arc<Transport>,
    pub pending: Pending,
    pub pool: ChunkPool,
    pub store: Store,
    pub parity: ParityState,
    pub degraded: DegradedMap,
    pub recovery: RecoveryState,
    pub instance_id: AtomicU16,
    next_request: AtomicU32,
    pub coordinator: RwLock<Option<PeerId>>,
    /// Live server table; recovery rewrites entries when a backup takes
    /// over a failed server's slot.
    pub server_addrs: RwLock<Vec<SocketAddr>>,
    pub server_peers: Mutex<HashMap<u32, PeerId>>,
    pub peer_roles: Mutex<HashMap<PeerId, NodeRole>>,
    pub sync: Mutex<SyncBatch>,
    /// Release batches in flight, keyed by the coordinator's request.
    pub releases: Mutex<HashMap<PendingId, ReleaseProgress>>,
}

/// Hand-back progress for one release batch.
pub struct ReleaseProgress {
    /// Positions named in the batch, reported back to the coordinator.
    pub total: u32,
    /// SET_CHUNK transfers actually issued.
    pub expected: u32,
    pub acked: u32,
}

impl ServerState {
    pub fn new(
        cluster: ClusterConfig,
        tuning: NodeTuning,
        server_index: u32,
        listen_addr: SocketAddr,
        transport: Arc<Transport>,
    ) -> Result<Arc<Self>> {
        let coding = stripe_coding::instantiate(
            cluster.coding.scheme,
            cluster.coding.k as usize,
            cluster.coding.m as usize,
            cluster.coding.chunk_size,
        )?;
        let stripe_list = StripeList::new(
            cluster.num_lists,
            cluster.servers.len() as u32,
            cluster.coding.k,
            cluster.coding.m,
        )?;
        let roles = if server_index == UNASSIGNED_INDEX {
            HashMap::new()
        } else {
            stripe_list.slots_of(server_index).into_iter().collect()
        };
        let server_addrs = cluster.servers.clone();
        Ok(Arc::new(Self {
            tuning,
            server_index: AtomicU32::new(server_index),
            listen_addr,
            roles: RwLock::new(roles),
            coding,
            transport,
            pending: Pending::new(),
            pool: ChunkPool::new(tuning.chunk_pool_slots, cluster.coding.chunk_size),
            store: Store::new(cluster.coding.chunk_size),
            parity: ParityState::new(),
            degraded: DegradedMap::new(),
            recovery: RecoveryState::new(),
            instance_id: AtomicU16::new(0),
            next_request: AtomicU32::new(1),
            coordinator: RwLock::new(None),
            server_addrs: RwLock::new(server_addrs),
            server_peers: Mutex::new(HashMap::new()),
            peer_roles: Mutex::new(HashMap::new()),
            sync: Mutex::new(SyncBatch::default()),
            releases: Mutex::new(HashMap::new()),
            stripe_list,
            cluster,
        }))
    }

    pub fn my_instance(&self) -> u16 {
        self.instance_id.load(Ordering::Relaxed)
    }

    pub fn my_index(&self) -> u32 {
        self.server_index.load(Ordering::Relaxed)
    }

    /// This server's chunk slot in `list_id`, if it participates.
    pub fn my_role(&self, list_id: u32) -> Option<u32> {
        self.roles.read().expect("roles poisoned").get(&list_id).copied()
    }

    /// Take over a failed server's identity (backup promotion).
    pub fn assume_index(&self, index: u32) {
        self.server_index.store(index, Ordering::Relaxed);
        let roles = self.stripe_list.slots_of(index).into_iter().collect();
        *self.roles.write().expect("roles poisoned") = roles;
        let mut addrs = self.server_addrs.write().expect("server addrs poisoned");
        addrs[index as usize] = self.listen_addr;
    }

    pub fn next_rid(&self) -> u32 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    pub fn k(&self) -> u32 {
        self.cluster.coding.k
    }

    pub fn m(&self) -> u32 {
        self.cluster.coding.m
    }

    fn peer_role(&self, peer: PeerId) -> Option<NodeRole> {
        self.peer_roles.lock().expect("peer roles poisoned").get(&peer).copied()
    }

    /// Send a response back on the connection a request arrived from.
    pub async fn reply(&self, to: PendingId, body: Body) {
        let frame = Frame::new(to.instance_id, to.request_id, body);
        self.transport.send(to.peer, frame).await;
    }

    /// Connection to the server at `index`, dialing on first use.
    // Returns a boxed (concrete, `Send`) future: the connect handler
    // re-enters `handle_frame`, which can await back here, so leaving this
    // as an opaque `async fn` makes the cyclic future unprovably `Send`.
    pub fn peer_for_server<'a>(self: &'a Arc<Self>, index: u32) -> BoxFuture<'a, Option<PeerId>> {
        Box::pin(async move {
        if index == self.my_index() {
            return None;
        }
        if let Some(peer) = self.server_peers.lock().expect("server peers poisoned").get(&index) {
            if self.transport.is_connected(*peer) {
                return Some(*peer);
            }
        }
        let addr = self.server_addrs.read().expect("server addrs poisoned").get(index as usize).copied()?;
        let state = Arc::clone(self);
        // Boxed: the handler re-enters handle_frame, which can land back
        // here; without the indirection the future type would be cyclic.
        let handler = move |peer, frame| -> BoxFuture<'static, ()> {
            let state = Arc::clone(&state);
            Box::pin(async move { handle_frame(state, peer, frame).await })
        };
        match transport::connect(Arc::clone(&self.transport), addr, format!("server-{index}"), handler)
            .await
        {
            Ok(peer) => {
                self.server_peers.lock().expect("server peers poisoned").insert(index, peer);
                self.peer_roles
                    .lock()
                    .expect("peer roles poisoned")
                    .insert(peer, NodeRole::Server);
                let register = Frame::new(
                    self.my_instance(),
                    self.next_rid(),
                    Body::Register {
                        role: NodeRole::Server,
                        listen_addr: self.listen_addr.to_string(),
                    },
                );
                self.transport.send(peer, register).await;
                Some(peer)
            }
            Err(err) => {
                tracing::warn!(index, error = %err, "cannot reach server peer");
                None
            }
        }
        })
    }

    /// The `m` parity slots of a list: `(chunk_id, server_index)`.
    pub fn parity_slots(&self, list_id: u32) -> Vec<(u32, u32)> {
        (self.k()..self.k() + self.m())
            .map(|c| (c, self.stripe_list.server_at(list_id, c)))
            .collect()
    }

    pub fn queue_sealed_sync(&self, pos: ChunkPos) {
        self.sync.lock().expect("sync batch poisoned").sealed.push(pos);
    }

    pub fn queue_key_sync(&self, key: Vec<u8>, pos: ChunkPos) {
        self.sync.lock().expect("sync batch poisoned").set_keys.push((key, pos));
    }

    pub fn queue_del_sync(&self, key: Vec<u8>) {
        self.sync.lock().expect("sync batch poisoned").del_keys.push(key);
    }
}

/// Announce a freshly sealed chunk to the list's parity peers.
async fn announce_seal(state: &Arc<ServerState>, sealed: Chunk) {
    state.queue_sealed_sync(sealed.pos);
    let rid = state.next_rid();
    for (_, server) in state.parity_slots(sealed.pos.list_id) {
        if server == state.my_index() {
            continue;
        }
        let Some(peer) = state.peer_for_server(server).await else { continue };
        let id = PendingId::new(state.my_instance(), rid, peer);
        state.pending.peer_seal_chunk.insert(id, PendingId::new(0, 0, 0), sealed.pos);
        state
            .transport
            .send(
                peer,
                Frame::new(
                    state.my_instance(),
                    rid,
                    Body::SealChunk { pos: sealed.pos, data: sealed.data().to_vec() },
                ),
            )
            .await;
    }
}

/// Fold one sealed data chunk into this parity server's accumulator.
fn apply_seal(state: &ServerState, pos: ChunkPos, data: &[u8]) -> bool {
    let Some(my_chunk) = state.my_role(pos.list_id) else {
        tracing::warn!(%pos, "seal notification for a list this server is not in");
        return false;
    };
    if my_chunk < state.k() {
        tracing::warn!(%pos, "seal notification arrived at a data slot");
        return false;
    }
    {
        let mut counts = state.parity.seal_counts.lock().expect("seal counts poisoned");
        let count = counts.entry((pos.list_id, pos.chunk_id)).or_insert(0);
        *count = (*count).max(pos.stripe_id + 1);
    }
    let parity_index = (my_chunk - state.k()) as usize;
    let contribution = match state.coding.parity_delta(pos.chunk_id as usize, parity_index, data) {
        Ok(c) => c,
        Err(err) => {
            tracing::error!(%pos, error = %err, "parity contribution failed");
            return false;
        }
    };

    let parity_pos = ChunkPos::new(pos.list_id, pos.stripe_id, my_chunk);
    let k = state.k() as usize;
    let mut acc = state.parity.acc.lock().expect("parity acc poisoned");
    let entry = acc.entry(parity_pos).or_insert_with(|| ParityAccum {
        data: vec![0u8; state.cluster.coding.chunk_size],
        seen_sealed: vec![false; k],
    });
    bitwise_xor(&mut entry.data, &contribution);
    entry.seen_sealed[pos.chunk_id as usize] = true;
    let complete = entry.seen_sealed.iter().all(|s| *s);
    if complete {
        let finished = acc.remove(&parity_pos).expect("entry just observed");
        drop(acc);
        let mut chunk = Chunk::new(state.cluster.coding.chunk_size);
        chunk.load(parity_pos, true, &finished.data);
        state.store.insert_sealed(chunk);
        state.queue_sealed_sync(parity_pos);
    } else {
        drop(acc);
    }

    // Forwarded unsealed copies of this data chunk's stripe (or earlier
    // ones) are superseded by the sealed bytes.
    let mut kv = state.parity.kv.lock().expect("parity kv poisoned");
    kv.retain(|_, (data_pos, _)| {
        !(data_pos.list_id == pos.list_id
            && data_pos.chunk_id == pos.chunk_id
            && data_pos.stripe_id <= pos.stripe_id)
    });
    true
}

/// Apply a data-chunk delta to the parity chunk `target_chunk_id` this node
/// holds, whether as natural owner (sealed or accumulating) or as a
/// degraded redirect destination.
pub fn apply_parity_delta(
    state: &ServerState,
    pos: ChunkPos,
    target_chunk_id: u32,
    offset: u32,
    delta: &[u8],
) -> bool {
    if target_chunk_id < state.k() {
        tracing::warn!(%pos, target_chunk_id, "parity delta addressed to a data slot");
        return false;
    }
    let parity_index = (target_chunk_id - state.k()) as usize;
    let pdelta = match state.coding.parity_delta(pos.chunk_id as usize, parity_index, delta) {
        Ok(d) => d,
        Err(err) => {
            tracing::error!(%pos, error = %err, "parity delta failed");
            return false;
        }
    };
    let parity_pos = ChunkPos::new(pos.list_id, pos.stripe_id, target_chunk_id);
    let start = offset as usize;

    let applied = state
        .store
        .with_resident_chunk(parity_pos, |chunk| {
            bitwise_xor(&mut chunk.data_mut()[start..start + pdelta.len()], &pdelta);
        })
        .is_some();
    if applied {
        return true;
    }
    {
        let mut acc = state.parity.acc.lock().expect("parity acc poisoned");
        if let Some(entry) = acc.get_mut(&parity_pos) {
            bitwise_xor(&mut entry.data[start..start + pdelta.len()], &pdelta);
            return true;
        }
    }
    state
        .degraded
        .with_chunk_mut(parity_pos, |chunk| {
            bitwise_xor(&mut chunk.data_mut()[start..start + pdelta.len()], &pdelta);
        })
        .is_some()
}

// ---- client-facing normal path ----

async fn handle_set(state: Arc<ServerState>, client: PendingId, key: Vec<u8>, value: Vec<u8>) {
    let (list_id, chunk_id) = state.stripe_list.locate(&key);
    if state.stripe_list.server_at(list_id, chunk_id) != state.my_index() {
        tracing::warn!(list_id, chunk_id, "misrouted SET");
        state
            .reply(client, Body::SetResponse {
                success: false,
                key,
                pos: ChunkPos::new(list_id, 0, chunk_id),
            })
            .await;
        return;
    }

    let outcome = state.store.set(list_id, chunk_id, &key, &value);
    state.queue_key_sync(key.clone(), outcome.meta.pos);
    if let Some(sealed) = outcome.sealed {
        announce_seal(&state, sealed).await;
    }

    // Forward the unsealed copy to every parity peer; the client is
    // answered when the last copy is acknowledged.
    let rid = state.next_rid();
    let ack = Body::SetResponse { success: true, key: key.clone(), pos: outcome.meta.pos };
    let mut fanned_out = 0;
    for (_, server) in state.parity_slots(list_id) {
        if server == state.my_index() {
            continue;
        }
        let Some(peer) = state.peer_for_server(server).await else { continue };
        let id = PendingId::new(state.my_instance(), rid, peer);
        if state.pending.peer_forward_key.insert(id, client, ack.clone()) {
            fanned_out += 1;
            state
                .transport
                .send(peer, Frame::new(state.my_instance(), rid, Body::Set {
                    key: key.clone(),
                    value: value.clone(),
                }))
                .await;
        }
    }
    if fanned_out == 0 {
        state.reply(client, ack).await;
    }
}

/// Parity-side handler for a forwarded unsealed copy. The copy is keyed by
/// the data chunk position it belongs to so sealing can retire it.
async fn handle_peer_set(state: Arc<ServerState>, from: PendingId, key: Vec<u8>, value: Vec<u8>) {
    let (list_id, chunk_id) = state.stripe_list.locate(&key);
    let stripe_guess = state.parity.head_stripe_guess(list_id, chunk_id);
    let pos = ChunkPos::new(list_id, stripe_guess, chunk_id);
    state.parity.store_kv(key.clone(), pos, value);
    state
        .reply(from, Body::SetResponse { success: true, key, pos })
        .await;
}

async fn handle_get(state: Arc<ServerState>, client: PendingId, key: Vec<u8>) {
    let value = state
        .store
        .get(&key)
        .or_else(|| state.degraded.find_value_by_key(&key));
    match value {
        Some(value) => {
            state
                .reply(client, Body::GetResponse { success: true, is_degraded: false, key, value })
                .await
        }
        None => {
            state
                .reply(client, Body::GetResponse {
                    success: false,
                    is_degraded: false,
                    key,
                    value: Vec::new(),
                })
                .await
        }
    }
}

async fn handle_update(
    state: Arc<ServerState>,
    client: PendingId,
    key: Vec<u8>,
    value_offset: u32,
    value: Vec<u8>,
) {
    let Some(meta) = state.store.key_meta(&key) else {
        state
            .reply(client, Body::UpdateResponse {
                success: false,
                is_degraded: false,
                key,
                value_offset,
                length: value.len() as u32,
            })
            .await;
        return;
    };

    let sealed = state.store.is_sealed(meta.pos);
    let updated = state.store.with_resident_chunk(meta.pos, |chunk| {
        chunk.update_value(meta.offset, value_offset, &value)
    });
    let Some(Some((chunk_offset, delta))) = updated else {
        state
            .reply(client, Body::UpdateResponse {
                success: false,
                is_degraded: false,
                key,
                value_offset,
                length: value.len() as u32,
            })
            .await;
        return;
    };

    let update = ChunkUpdate {
        pos: meta.pos,
        offset: chunk_offset,
        length: delta.len() as u32,
        key: key.clone(),
        value_offset,
        is_degraded: false,
    };
    let fanned_out = forward_delta(&state, client, update, &delta, sealed, false, &value).await;
    if fanned_out == 0 {
        state
            .reply(client, Body::UpdateResponse {
                success: true,
                is_degraded: false,
                key,
                value_offset,
                length: value.len() as u32,
            })
            .await;
    }
}

async fn handle_delete(state: Arc<ServerState>, client: PendingId, key: Vec<u8>) {
    let Some(meta) = state.store.key_meta(&key) else {
        state
            .reply(client, Body::DeleteResponse { success: false, is_degraded: false, key })
            .await;
        return;
    };

    let sealed = state.store.is_sealed(meta.pos);
    let delta = state.store.with_resident_chunk(meta.pos, |chunk| {
        chunk.delete_record(meta.offset, meta.length)
    });
    let Some(delta) = delta else {
        state
            .reply(client, Body::DeleteResponse { success: false, is_degraded: false, key })
            .await;
        return;
    };
    state.store.delete_key(&key);
    state.store.shift_keys_after(meta.pos, meta.offset, meta.length);
    state.queue_del_sync(key.clone());

    let update = ChunkUpdate {
        pos: meta.pos,
        offset: meta.offset,
        length: delta.len() as u32,
        key: key.clone(),
        value_offset: 0,
        is_degraded: false,
    };
    let fanned_out = forward_delta(&state, client, update, &delta, sealed, true, &[]).await;
    if fanned_out == 0 {
        state
            .reply(client, Body::DeleteResponse { success: true, is_degraded: false, key })
            .await;
    }
}

/// Forward a mutation to every parity peer of the stripe: the chunk delta
/// for sealed records, the key-value update/removal for unsealed ones.
/// Returns how many forwards were issued; the caller answers the client
/// directly when zero. The normal path is the degraded forwarder with no
/// redirects in play.
#[allow(clippy::too_many_arguments)]
pub async fn forward_delta(
    state: &Arc<ServerState>,
    client: PendingId,
    update: ChunkUpdate,
    delta: &[u8],
    sealed: bool,
    is_delete: bool,
    new_value: &[u8],
) -> usize {
    degraded::forward_delta_redirected(
        state,
        client,
        &crate::metadata::RedirectSet::default(),
        update,
        delta,
        sealed,
        is_delete,
        new_value,
    )
    .await
}

// ---- dispatch ----

/// Handle one inbound frame. Exhaustive over the message space: anything a
/// storage node should never receive is logged and dropped.
pub async fn handle_frame(state: Arc<ServerState>, peer: PeerId, frame: Frame) {
    let from = PendingId::new(frame.instance_id, frame.request_id, peer);
    let is_server_peer = matches!(state.peer_role(peer), Some(NodeRole::Server | NodeRole::Backup));

    match frame.body {
        Body::Register { role, listen_addr } => {
            state.peer_roles.lock().expect("peer roles poisoned").insert(peer, role);
            if matches!(role, NodeRole::Server | NodeRole::Backup) {
                // Remember the reverse route to this server's slot.
                let addrs = state.server_addrs.read().expect("server addrs poisoned");
                if let Ok(addr) = listen_addr.parse::<SocketAddr>() {
                    if let Some(index) = addrs.iter().position(|a| *a == addr) {
                        drop(addrs);
                        state
                            .server_peers
                            .lock()
                            .expect("server peers poisoned")
                            .insert(index as u32, peer);
                    }
                }
            }
            state
                .reply(from, Body::RegisterResponse { success: true, instance_id: 0 })
                .await;
        }
        Body::RegisterResponse { success, instance_id } => {
            // Only the coordinator assigns a real instance id.
            let coordinator = *state.coordinator.read().expect("coordinator poisoned");
            if success && coordinator == Some(peer) && instance_id != 0 {
                state.instance_id.store(instance_id, Ordering::Relaxed);
                tracing::info!(instance_id, "registered with coordinator");
            }
        }

        Body::Set { key, value } => {
            if is_server_peer {
                handle_peer_set(state, from, key, value).await;
            } else {
                handle_set(state, from, key, value).await;
            }
        }
        Body::SetResponse { success, pos, .. } => {
            if !success {
                tracing::warn!(%pos, "parity copy of SET failed");
            }
            degraded::on_forward_key_ack(state, from, peer).await;
        }
        Body::Get { key } => handle_get(state, from, key).await,
        Body::Update { key, value_offset, value } => {
            if is_server_peer {
                let success = state.parity.update_kv(&key, value_offset, &value);
                state
                    .reply(from, Body::UpdateResponse {
                        success,
                        is_degraded: false,
                        key,
                        value_offset,
                        length: value.len() as u32,
                    })
                    .await;
            } else {
                handle_update(state, from, key, value_offset, value).await;
            }
        }
        Body::Delete { key } => {
            if is_server_peer {
                let success = state.parity.remove_kv(&key);
                state
                    .reply(from, Body::DeleteResponse { success, is_degraded: false, key })
                    .await;
            } else {
                handle_delete(state, from, key).await;
            }
        }
        // Acks for unsealed parity copies ride the same fan-in as chunk
        // deltas.
        Body::UpdateResponse { .. } => degraded::on_delta_ack(state, from, peer, false).await,
        Body::DeleteResponse { .. } => degraded::on_delta_ack(state, from, peer, true).await,

        Body::DegradedGet { key, stripe_id, is_sealed, redirect } => {
            degraded::handle_degraded_get(state, from, key, stripe_id, is_sealed, redirect).await;
        }
        Body::DegradedUpdate { key, value_offset, value, stripe_id, is_sealed, redirect } => {
            degraded::handle_degraded_update(
                state, from, key, value_offset, value, stripe_id, is_sealed, redirect,
            )
            .await;
        }
        Body::DegradedDelete { key, stripe_id, is_sealed, redirect } => {
            degraded::handle_degraded_delete(state, from, key, stripe_id, is_sealed, redirect)
                .await;
        }

        Body::GetChunk { pos } => {
            let body = build_get_chunk_response(&state, pos);
            state.reply(from, body).await;
        }
        Body::GetChunkResponse { success, pos, size, seal_indicator, data } => {
            degraded::on_get_chunk_response(state, from, success, pos, size, seal_indicator, data)
                .await;
        }
        Body::UnsealedGet { list_id, chunk_id, key } => {
            let value = state.parity.find_kv(&key).or_else(|| state.store.get(&key));
            let _ = (list_id, chunk_id);
            match value {
                Some(value) => {
                    state
                        .reply(from, Body::UnsealedGetResponse { success: true, key, value })
                        .await
                }
                None => {
                    state
                        .reply(from, Body::UnsealedGetResponse {
                            success: false,
                            key,
                            value: Vec::new(),
                        })
                        .await
                }
            }
        }
        Body::UnsealedGetResponse { success, key, value } => {
            degraded::on_unsealed_get_response(state, from, success, key, value).await;
        }

        Body::ForwardKey { op, pos, key, value, update } => {
            let value = match (&op, update) {
                (ForwardOp::Update, Some((offset, bytes))) => {
                    let mut v = value;
                    let end = offset as usize + bytes.len();
                    if end <= v.len() {
                        v[offset as usize..end].copy_from_slice(&bytes);
                    }
                    v
                }
                _ => value,
            };
            // A key whose data slot this node now owns (recovery hand-off)
            // joins the primary store; anything else is a degraded-
            // destination copy.
            let (list_id, chunk_id) = state.stripe_list.locate(&key);
            let owns = state.stripe_list.server_at(list_id, chunk_id) == state.my_index();
            let success = match op {
                ForwardOp::Delete => {
                    state.degraded.delete_value(&key);
                    state.parity.remove_kv(&key);
                    if owns {
                        state.store.delete_key(&key);
                    }
                    true
                }
                _ if owns => {
                    let outcome = state.store.set(list_id, chunk_id, &key, &value);
                    state.queue_key_sync(key.clone(), outcome.meta.pos);
                    true
                }
                _ => {
                    // Refresh whichever copies this node holds.
                    if state.parity.find_kv(&key).is_some() {
                        state.parity.store_kv(key.clone(), pos, value.clone());
                    }
                    state.degraded.delete_value(&key);
                    state.degraded.insert_value(key.clone(), value);
                    true
                }
            };
            recovery::note_forwarded_key(&state, &key).await;
            state
                .reply(from, Body::ForwardKeyResponse { success, pos, key })
                .await;
        }
        Body::ForwardKeyResponse { success, pos, .. } => {
            if !success {
                tracing::warn!(%pos, "forwarded key rejected");
            }
            degraded::on_forward_key_ack(state, from, peer).await;
        }
        Body::ForwardChunk { pos, is_parity, data } => {
            let mut chunk = Chunk::new(state.cluster.coding.chunk_size);
            chunk.load(pos, is_parity, &data);
            if !is_parity {
                chunk.rescan();
            }
            // A chunk whose slot this node owns is a recovery hand-off into
            // the primary store; otherwise it is a degraded-destination
            // copy.
            let owner = state.stripe_list.server_at(pos.list_id, pos.chunk_id);
            let success = if owner == state.my_index() {
                state.store.insert_sealed(chunk);
                state.queue_sealed_sync(pos);
                true
            } else {
                state.degraded.insert_chunk(chunk)
            };
            recovery::note_forwarded_chunk(&state, pos).await;
            state
                .reply(from, Body::ForwardChunkResponse { success, pos })
                .await;
        }
        Body::ForwardChunkResponse { success, pos } => {
            if !success {
                tracing::warn!(%pos, "forwarded chunk rejected (already resident)");
            }
            state.pending.peer_forward_chunk.erase_quiet(from);
        }

        Body::UpdateChunk { pos, target_chunk_id, offset, delta } => {
            let success = apply_parity_delta(&state, pos, target_chunk_id, offset, &delta);
            state
                .reply(from, Body::UpdateChunkResponse { success, pos, offset })
                .await;
        }
        Body::UpdateChunkResponse { success, pos, .. } => {
            if !success {
                tracing::warn!(%pos, "parity update rejected");
            }
            degraded::on_delta_ack(state, from, peer, false).await;
        }
        Body::DeleteChunk { pos, target_chunk_id, offset, delta } => {
            let success = apply_parity_delta(&state, pos, target_chunk_id, offset, &delta);
            state
                .reply(from, Body::DeleteChunkResponse { success, pos, offset })
                .await;
        }
        Body::DeleteChunkResponse { success, pos, .. } => {
            if !success {
                tracing::warn!(%pos, "parity delete rejected");
            }
            degraded::on_delta_ack(state, from, peer, true).await;
        }

        Body::SealChunk { pos, data } => {
            let success = apply_seal(&state, pos, &data);
            state.reply(from, Body::SealChunkResponse { success, pos }).await;
        }
        Body::SealChunkResponse { success, pos } => {
            if !success {
                tracing::warn!(%pos, "seal notification rejected");
            }
            state.pending.peer_seal_chunk.erase_quiet(from);
        }

        Body::ReleaseDegradedLocks { positions, is_completed } => {
            handle_release(state, from, positions, is_completed).await;
        }
        Body::SetChunk { pos, sealed, unsealed } => {
            let success = install_transferred_chunk(&state, pos, sealed, unsealed);
            state.reply(from, Body::SetChunkResponse { success, pos }).await;
        }
        Body::SetChunkResponse { success, pos } => {
            if !success {
                tracing::warn!(%pos, "chunk hand-back rejected");
            }
            on_set_chunk_ack(state, from).await;
        }

        Body::Reconstruction { list_id, chunk_id, stripe_ids, is_completed } => {
            recovery::handle_reconstruction(state, from, list_id, chunk_id, stripe_ids, is_completed)
                .await;
        }
        Body::ReconstructionUnsealed { list_id, chunk_id, keys, is_completed } => {
            recovery::handle_reconstruction_unsealed(
                state, from, list_id, chunk_id, keys, is_completed,
            )
            .await;
        }
        Body::BackupServerPromoted { src_addr, chunks, keys, is_completed } => {
            recovery::handle_backup_promoted(state, from, src_addr, chunks, keys, is_completed)
                .await;
        }
        Body::ServerReconstructed { src_addr, dst_addr } => {
            let success = adopt_reconstructed_server(&state, &src_addr, &dst_addr);
            state
                .reply(from, Body::ServerReconstructedResponse { success })
                .await;
        }

        other => {
            tracing::warn!(opcode = other.opcode(), "storage node dropping unexpected message");
        }
    }
}

/// What this node can supply for a chunk slot: `(bytes, declared_size,
/// seal_indicator)`. A declared size of zero means "unsealed here"; the
/// requester reads the chunk as zeros. Checked in order: sealed store,
/// accumulating parity (whose seal bitmap the reconstruction needs), then
/// the degraded cache.
pub fn read_local_chunk(state: &ServerState, pos: ChunkPos) -> (Vec<u8>, u32, Vec<bool>) {
    if let Some((data, size)) = state.store.chunk_bytes(pos) {
        let seal_indicator = if pos.chunk_id >= state.k() {
            vec![true; state.k() as usize]
        } else {
            Vec::new()
        };
        return (data, size, seal_indicator);
    }
    if let Some(bytes) = state.parity.accum_bytes(pos) {
        let seal_indicator = state.parity.seal_indicator(pos).unwrap_or_default();
        return (bytes, state.cluster.coding.chunk_size as u32, seal_indicator);
    }
    if let Some(data) = state.degraded.chunk_data(pos) {
        let size = data.len() as u32;
        return (data, size, Vec::new());
    }
    (Vec::new(), 0, Vec::new())
}

/// Answer a peer's GET_CHUNK: sealed bytes, accumulating parity bytes with
/// the seal bitmap, or "unsealed" (size 0).
fn build_get_chunk_response(state: &ServerState, pos: ChunkPos) -> Body {
    let (data, size, seal_indicator) = read_local_chunk(state, pos);
    Body::GetChunkResponse { success: true, pos, size, seal_indicator, data }
}

/// Destination-side release: hand every reconstructed chunk back to its
/// original owner, then confirm the batch to the coordinator.
async fn handle_release(
    state: Arc<ServerState>,
    from: PendingId,
    positions: Vec<ChunkPos>,
    is_completed: bool,
) {
    let _ = is_completed;
    let total = positions.len() as u32;
    if total == 0 {
        state.reply(from, Body::ReleaseDegradedLocksResponse { count: 0 }).await;
        return;
    }

    // One transfer per position, each with its own request id so repeated
    // hand-backs to the same owner do not collide in the tracker.
    let mut sent = 0u32;
    for pos in positions {
        let chunk = state.degraded.remove_chunk(pos);
        let owner = state.stripe_list.server_at(pos.list_id, pos.chunk_id);
        let Some(peer) = state.peer_for_server(owner).await else {
            tracing::warn!(%pos, owner, "release: owner unreachable, dropping hand-back");
            continue;
        };
        let sealed = chunk.map(|c| c.data().to_vec());
        let rid = state.next_rid();
        let id = PendingId::new(state.my_instance(), rid, peer);
        if state.pending.peer_set_chunk.insert(id, from, pos) {
            sent += 1;
            state
                .transport
                .send(
                    peer,
                    Frame::new(state.my_instance(), rid, Body::SetChunk {
                        pos,
                        sealed,
                        unsealed: Vec::new(),
                    }),
                )
                .await;
        }
    }

    if sent == 0 {
        state.reply(from, Body::ReleaseDegradedLocksResponse { count: total }).await;
    } else {
        state
            .releases
            .lock()
            .expect("releases poisoned")
            .insert(from, ReleaseProgress { total, expected: sent, acked: 0 });
    }
}

async fn on_set_chunk_ack(state: Arc<ServerState>, from: PendingId) {
    let Some((coordinator, _)) = state.pending.peer_set_chunk.erase(from) else {
        return;
    };
    let done = {
        let mut releases = state.releases.lock().expect("releases poisoned");
        match releases.get_mut(&coordinator) {
            Some(progress) => {
                progress.acked += 1;
                if progress.acked >= progress.expected {
                    let total = progress.total;
                    releases.remove(&coordinator);
                    Some(total)
                } else {
                    None
                }
            }
            None => None,
        }
    };
    if let Some(total) = done {
        state
            .reply(coordinator, Body::ReleaseDegradedLocksResponse { count: total })
            .await;
    }
}

/// Owner-side install of a chunk handed back at release, or of an unsealed
/// key-value batch.
fn install_transferred_chunk(
    state: &ServerState,
    pos: ChunkPos,
    sealed: Option<Vec<u8>>,
    unsealed: Vec<(Vec<u8>, Vec<u8>)>,
) -> bool {
    if let Some(data) = sealed {
        let mut chunk = Chunk::new(state.cluster.coding.chunk_size);
        chunk.load(pos, pos.chunk_id >= state.k(), &data);
        if !chunk.is_parity {
            chunk.rescan();
        }
        state.store.insert_sealed(chunk);
        state.queue_sealed_sync(pos);
        return true;
    }
    for (key, value) in unsealed {
        let (list_id, chunk_id) = state.stripe_list.locate(&key);
        if state.stripe_list.server_at(list_id, chunk_id) == state.my_index() {
            let outcome = state.store.set(list_id, chunk_id, &key, &value);
            state.queue_key_sync(key, outcome.meta.pos);
        } else {
            state.parity.store_kv(key, pos, value);
        }
    }
    true
}

/// Rewrite the server table after the coordinator announced a promotion.
fn adopt_reconstructed_server(state: &ServerState, src_addr: &str, dst_addr: &str) -> bool {
    let (Ok(src), Ok(dst)) = (src_addr.parse::<SocketAddr>(), dst_addr.parse::<SocketAddr>())
    else {
        tracing::warn!(src_addr, dst_addr, "unparseable reconstruction announcement");
        return false;
    };
    let mut addrs = state.server_addrs.write().expect("server addrs poisoned");
    match addrs.iter().position(|a| *a == src) {
        Some(index) => {
            addrs[index] = dst;
            drop(addrs);
            // Drop the stale route; the next use redials the backup.
            state.server_peers.lock().expect("server peers poisoned").remove(&(index as u32));
            tracing::info!(%src, %dst, index, "server table updated for promoted backup");
            true
        }
        None => {
            tracing::warn!(%src, "announced failed server is not in the table");
            false
        }
    }
}

/// Periodically push queued metadata changes to the coordinator.
async fn sync_loop(state: Arc<ServerState>) {
    let mut ticker = tokio::time::interval(state.tuning.sync_interval);
    loop {
        ticker.tick().await;
        let batch = {
            let mut sync = state.sync.lock().expect("sync batch poisoned");
            if sync.is_empty() {
                continue;
            }
            std::mem::take(&mut *sync)
        };
        let coordinator = *state.coordinator.read().expect("coordinator poisoned");
        let Some(peer) = coordinator else { continue };
        state
            .transport
            .send(
                peer,
                Frame::new(state.my_instance(), state.next_rid(), Body::SyncMetadata {
                    sealed: batch.sealed,
                    set_keys: batch.set_keys,
                    del_keys: batch.del_keys,
                }),
            )
            .await;
    }
}

/// Run a storage node until the listener fails. Active servers must listen
/// at their slot's address from the server table; backups listen anywhere
/// and receive a slot at promotion.
pub async fn run(
    cluster: ClusterConfig,
    tuning: NodeTuning,
    listen_addr: SocketAddr,
    coordinator_addr: SocketAddr,
    role: NodeRole,
) -> Result<()> {
    let server_index = match role {
        NodeRole::Backup => UNASSIGNED_INDEX,
        _ => cluster
            .servers
            .iter()
            .position(|a| *a == listen_addr)
            .map(|i| i as u32)
            .context("listen address is not in the server table")?,
    };

    let transport = Transport::new();
    let state =
        ServerState::new(cluster, tuning, server_index, listen_addr, Arc::clone(&transport))?;

    // Register with the coordinator.
    let handler_state = Arc::clone(&state);
    let coordinator_peer = transport::connect(
        Arc::clone(&transport),
        coordinator_addr,
        "coordinator".into(),
        move |peer, frame| {
            let state = Arc::clone(&handler_state);
            async move { handle_frame(state, peer, frame).await }
        },
    )
    .await?;
    *state.coordinator.write().expect("coordinator poisoned") = Some(coordinator_peer);
    state
        .transport
        .send(
            coordinator_peer,
            Frame::new(0, state.next_rid(), Body::Register {
                role,
                listen_addr: listen_addr.to_string(),
            }),
        )
        .await;

    tokio::spawn(sync_loop(Arc::clone(&state)));

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    tracing::info!(%listen_addr, server_index, "storage node listening");
    let accept_state = Arc::clone(&state);
    transport::listen(transport, listener, "peer", move |peer, frame| {
        let state = Arc::clone(&accept_state);
        async move { handle_frame(state, peer, frame).await }
    })
    .await
}
