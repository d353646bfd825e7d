//! Coordinator node: registration and instance-id assignment, the
//! per-server metadata mirrors, degraded lock arbitration, lock release,
//! and the full-node recovery orchestrator.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::config::{ClusterConfig, NodeTuning};
use crate::lock_table::{Acquire, LockTable, RemappingRecordMap};
use crate::metadata::{ChunkPos, RedirectSet, RemapPair};
use crate::pending::PendingId;
use crate::proto::{Body, Frame, LockOutcome, NodeRole, BATCH_LIMIT};
use crate::stripe_list::StripeList;
use crate::transport::{self, PeerId, Transport};

/// Liveness and routing for one slot of the server table.
struct ServerEntry {
    addr: SocketAddr,
    peer: Option<PeerId>,
    instance_id: u16,
    alive: bool,
}

/// The coordinator's mirror of one server's metadata, fed by SyncMetadata.
pub struct ServerMeta {
    pub sealed: Mutex<HashSet<ChunkPos>>,
    pub keys: Mutex<HashMap<Vec<u8>, ChunkPos>>,
    pub locks: LockTable,
}

impl ServerMeta {
    fn new() -> Self {
        Self {
            sealed: Mutex::new(HashSet::new()),
            keys: Mutex::new(HashMap::new()),
            locks: LockTable::new(),
        }
    }
}

/// An idle backup node waiting for promotion.
struct BackupEntry {
    peer: PeerId,
    addr: SocketAddr,
}

/// Counters for the active recovery.
struct RecoveryProgress {
    failed_index: u32,
    remaining_chunks: u32,
    remaining_keys: u32,
    total_chunks: u32,
    total_keys: u32,
    started: Instant,
}

/// Waits keyed by request id: announcement acks and release batches.
struct CountedWait {
    remaining: u32,
    notify: Arc<Notify>,
}

pub struct CoordinatorState {
    pub cluster: ClusterConfig,
    pub tuning: NodeTuning,
    pub stripe_list: StripeList,
    pub transport: Arc<Transport>,
    pub remap: RemappingRecordMap,
    metas: Vec<ServerMeta>,
    servers: Mutex<Vec<ServerEntry>>,
    backups: Mutex<Vec<BackupEntry>>,
    peer_index: Mutex<HashMap<PeerId, u32>>,
    next_instance: AtomicU16,
    next_request: AtomicU32,
    announce_waits: Mutex<HashMap<u32, CountedWait>>,
    release_waits: Mutex<HashMap<u32, CountedWait>>,
    recovery: Mutex<Option<RecoveryProgress>>,
    recovery_queue: Mutex<Vec<u32>>,
}

impl CoordinatorState {
    pub fn new(
        cluster: ClusterConfig,
        tuning: NodeTuning,
        transport: Arc<Transport>,
    ) -> Result<Arc<Self>> {
        let stripe_list = StripeList::new(
            cluster.num_lists,
            cluster.servers.len() as u32,
            cluster.coding.k,
            cluster.coding.m,
        )?;
        let servers = cluster
            .servers
            .iter()
            .map(|addr| ServerEntry { addr: *addr, peer: None, instance_id: 0, alive: false })
            .collect();
        let metas = (0..cluster.servers.len()).map(|_| ServerMeta::new()).collect();
        Ok(Arc::new(Self {
            tuning,
            stripe_list,
            transport,
            remap: RemappingRecordMap::new(),
            metas,
            servers: Mutex::new(servers),
            backups: Mutex::new(Vec::new()),
            peer_index: Mutex::new(HashMap::new()),
            next_instance: AtomicU16::new(1),
            next_request: AtomicU32::new(1),
            announce_waits: Mutex::new(HashMap::new()),
            release_waits: Mutex::new(HashMap::new()),
            recovery: Mutex::new(None),
            recovery_queue: Mutex::new(Vec::new()),
            cluster,
        }))
    }

    fn next_rid(&self) -> u32 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    pub fn meta(&self, index: u32) -> &ServerMeta {
        &self.metas[index as usize]
    }

    fn server_peer(&self, index: u32) -> Option<PeerId> {
        self.servers.lock().expect("servers poisoned").get(index as usize).and_then(|e| e.peer)
    }

    fn is_alive(&self, index: u32) -> bool {
        self.servers
            .lock()
            .expect("servers poisoned")
            .get(index as usize)
            .map(|e| e.alive && e.peer.is_some())
            .unwrap_or(false)
    }

    async fn reply(&self, to: PendingId, body: Body) {
        self.transport.send(to.peer, Frame::new(to.instance_id, to.request_id, body)).await;
    }

    /// Chunk ids of a list whose servers are currently reachable.
    fn surviving_chunk_ids(&self, list_id: u32) -> Vec<u32> {
        (0..self.stripe_list.chunk_count())
            .filter(|c| self.is_alive(self.stripe_list.server_at(list_id, *c)))
            .collect()
    }
}

// ---- frame dispatch ----

pub async fn handle_frame(state: Arc<CoordinatorState>, peer: PeerId, frame: Frame) {
    let from = PendingId::new(frame.instance_id, frame.request_id, peer);
    match frame.body {
        Body::Register { role, listen_addr } => {
            let instance_id = state.next_instance.fetch_add(1, Ordering::Relaxed);
            let parsed = listen_addr.parse::<SocketAddr>();
            match (role, parsed) {
                (NodeRole::Server, Ok(addr)) => {
                    let mut servers = state.servers.lock().expect("servers poisoned");
                    match servers.iter_mut().position(|e| e.addr == addr) {
                        Some(index) => {
                            let entry = &mut servers[index];
                            entry.peer = Some(peer);
                            entry.instance_id = instance_id;
                            entry.alive = true;
                            drop(servers);
                            state
                                .peer_index
                                .lock()
                                .expect("peer index poisoned")
                                .insert(peer, index as u32);
                            tracing::info!(index, %addr, instance_id, "server registered");
                        }
                        None => {
                            drop(servers);
                            tracing::warn!(%addr, "server registered from unknown address");
                        }
                    }
                }
                (NodeRole::Backup, Ok(addr)) => {
                    state
                        .backups
                        .lock()
                        .expect("backups poisoned")
                        .push(BackupEntry { peer, addr });
                    tracing::info!(%addr, "backup node available");
                }
                (NodeRole::Client, _) => {
                    tracing::info!(instance_id, "client registered");
                }
                (_, Err(_)) => {
                    tracing::warn!(listen_addr, "unparseable listen address in registration");
                    state
                        .reply(from, Body::RegisterResponse { success: false, instance_id: 0 })
                        .await;
                    return;
                }
            }
            state
                .reply(from, Body::RegisterResponse { success: true, instance_id })
                .await;
        }

        Body::SyncMetadata { sealed, set_keys, del_keys } => {
            let index = state.peer_index.lock().expect("peer index poisoned").get(&peer).copied();
            let Some(index) = index else {
                tracing::warn!("metadata sync from unregistered peer");
                return;
            };
            let meta = state.meta(index);
            meta.sealed.lock().expect("sealed poisoned").extend(sealed);
            let mut keys = meta.keys.lock().expect("keys poisoned");
            for (key, pos) in set_keys {
                keys.insert(key, pos);
            }
            for key in del_keys {
                keys.remove(&key);
            }
        }

        Body::DegradedLock { key, redirect } => {
            handle_degraded_lock(state, from, key, redirect).await;
        }

        Body::ReleaseDegradedLocksResponse { count } => {
            let mut waits = state.release_waits.lock().expect("release waits poisoned");
            if let Some(wait) = waits.get_mut(&frame.request_id) {
                wait.remaining = wait.remaining.saturating_sub(count);
                if wait.remaining == 0 {
                    let wait = waits.remove(&frame.request_id).expect("entry just observed");
                    wait.notify.notify_one();
                }
            } else {
                tracing::error!(
                    request_id = frame.request_id,
                    "release response matches no pending wait; discarding"
                );
            }
        }

        Body::ReconstructionResponse { success, list_id, chunk_id, num_stripes } => {
            if !success {
                tracing::warn!(list_id, chunk_id, "reconstruction batch reported failure");
            }
            on_reconstruction_progress(&state, num_stripes, 0).await;
        }
        Body::ReconstructionUnsealedResponse { success, list_id, chunk_id, num_keys } => {
            if !success {
                tracing::warn!(list_id, chunk_id, "unsealed reconstruction batch failed");
            }
            on_reconstruction_progress(&state, 0, num_keys).await;
        }
        Body::BackupServerPromotedResponse { chunk_count, key_count } => {
            tracing::info!(chunk_count, key_count, "promoted backup caught up");
        }
        Body::ServerReconstructedResponse { success } => {
            if !success {
                tracing::warn!("peer rejected reconstruction announcement");
            }
            let mut waits = state.announce_waits.lock().expect("announce waits poisoned");
            if let Some(wait) = waits.get_mut(&frame.request_id) {
                wait.remaining = wait.remaining.saturating_sub(1);
                if wait.remaining == 0 {
                    let wait = waits.remove(&frame.request_id).expect("entry just observed");
                    wait.notify.notify_one();
                }
            }
        }

        other => {
            tracing::warn!(opcode = other.opcode(), "coordinator dropping unexpected message");
        }
    }
}

// ---- degraded lock arbitration ----

/// Decide a DEGRADED_LOCK request. The request is validated against this
/// coordinator's metadata mirror, filtered down to chunks that actually
/// need reconstruction, and then run through the per-stripe lock table.
async fn handle_degraded_lock(
    state: Arc<CoordinatorState>,
    from: PendingId,
    key: Vec<u8>,
    requested: RedirectSet,
) {
    let (list_id, data_chunk) = state.stripe_list.locate(&key);

    // A key remapped at write time is not reconstructed; the caller must
    // retry against the remap destination.
    if let Some(record) = state.remap.find(&key) {
        let redirect = RedirectSet {
            pairs: vec![RemapPair {
                original_list: list_id,
                original_chunk: data_chunk,
                redirected_list: record.list_id,
                redirected_chunk: record.chunk_id,
            }],
            ongoing_at_chunk: record.chunk_id,
            surviving_chunk_ids: state.surviving_chunk_ids(list_id),
        };
        state
            .reply(from, Body::DegradedLockResponse {
                outcome: LockOutcome::Remapped,
                key,
                is_sealed: false,
                stripe_id: 0,
                src_chunk_id: data_chunk,
                redirect,
            })
            .await;
        return;
    }

    let src_index = state.stripe_list.server_at(list_id, data_chunk);
    let meta = state.meta(src_index);
    let Some(pos) = meta.keys.lock().expect("keys poisoned").get(&key).copied() else {
        state
            .reply(from, Body::DegradedLockResponse {
                outcome: LockOutcome::NotExist,
                key,
                is_sealed: false,
                stripe_id: 0,
                src_chunk_id: data_chunk,
                redirect: RedirectSet::default(),
            })
            .await;
        return;
    };
    let is_sealed = meta.sealed.lock().expect("sealed poisoned").contains(&pos);

    // Keep only redirects whose source is genuinely down, and drop
    // unsealed data chunks other than the one being reconstructed (their
    // bytes are still only in a write head; there is nothing to decode).
    let mut pairs: Vec<RemapPair> = Vec::with_capacity(requested.pairs.len());
    for pair in requested.pairs {
        let holder = state.stripe_list.server_at(pos.list_id, pair.original_chunk);
        if state.is_alive(holder) {
            continue;
        }
        if pair.original_chunk < state.cluster.coding.k {
            let chunk_pos = ChunkPos::new(pos.list_id, pos.stripe_id, pair.original_chunk);
            let chunk_sealed = state
                .meta(holder)
                .sealed
                .lock()
                .expect("sealed poisoned")
                .contains(&chunk_pos);
            if !chunk_sealed && pair.original_chunk != data_chunk {
                continue;
            }
        }
        pairs.push(pair);
    }

    if pairs.is_empty() {
        state
            .reply(from, Body::DegradedLockResponse {
                outcome: LockOutcome::NotNeeded,
                key,
                is_sealed,
                stripe_id: pos.stripe_id,
                src_chunk_id: data_chunk,
                redirect: RedirectSet::default(),
            })
            .await;
        return;
    }

    // The requesting node reconstructs at the addressed data chunk's
    // destination, or at the chunk itself when it is still alive.
    let ongoing_at_chunk = pairs
        .iter()
        .find(|p| p.original_chunk == data_chunk)
        .map(|p| p.redirected_chunk)
        .unwrap_or(data_chunk);
    let requested = RedirectSet {
        pairs,
        ongoing_at_chunk,
        surviving_chunk_ids: state.surviving_chunk_ids(pos.list_id),
    };

    let (outcome, lock) = match meta.locks.acquire(pos.list_id, pos.stripe_id, requested) {
        Acquire::Granted(lock) => (LockOutcome::Granted, lock),
        Acquire::Existing(lock) => (LockOutcome::AlreadyLocked, lock),
        // A conflicting destination is refused; the reply carries the
        // authoritative assignment for the caller's retry.
        Acquire::Conflict(lock) => (LockOutcome::AlreadyLocked, lock),
    };
    state
        .reply(from, Body::DegradedLockResponse {
            outcome,
            key,
            is_sealed,
            stripe_id: pos.stripe_id,
            src_chunk_id: data_chunk,
            redirect: lock.redirect,
        })
        .await;
}

// ---- lock release ----

/// Release every degraded lock held against `src_index`: swap the table,
/// batch the swapped-out set by destination, stream the batches, and wait
/// until every destination confirms its hand-backs.
pub async fn release_degraded_locks(state: &Arc<CoordinatorState>, src_index: u32) {
    let taken = state.meta(src_index).locks.take_all();
    if taken.is_empty() {
        return;
    }

    // destination (list, chunk) |-> source chunk positions to hand back.
    let mut by_dest: HashMap<(u32, u32), Vec<ChunkPos>> = HashMap::new();
    for ((list_id, stripe_id), lock) in taken {
        for pair in lock.redirect.pairs {
            by_dest
                .entry((pair.redirected_list, pair.redirected_chunk))
                .or_default()
                .push(ChunkPos::new(list_id, stripe_id, pair.original_chunk));
        }
    }

    let rid = state.next_rid();
    let total: u32 = by_dest.values().map(|v| v.len() as u32).sum();
    let notify = Arc::new(Notify::new());
    state.release_waits.lock().expect("release waits poisoned").insert(
        rid,
        CountedWait { remaining: total, notify: Arc::clone(&notify) },
    );

    for ((dst_list, dst_chunk), positions) in by_dest {
        let dest = state.stripe_list.server_at(dst_list, dst_chunk);
        let Some(peer) = state.server_peer(dest) else {
            tracing::warn!(dest, "release destination unreachable; skipping its locks");
            let mut waits = state.release_waits.lock().expect("release waits poisoned");
            if let Some(wait) = waits.get_mut(&rid) {
                wait.remaining = wait.remaining.saturating_sub(positions.len() as u32);
            }
            continue;
        };
        // The set may exceed one frame; stream continuation batches.
        let mut start = 0;
        while start < positions.len() {
            let end = (start + BATCH_LIMIT).min(positions.len());
            let body = Body::ReleaseDegradedLocks {
                positions: positions[start..end].to_vec(),
                is_completed: end == positions.len(),
            };
            state.transport.send(peer, Frame::new(0, rid, body)).await;
            start = end;
        }
    }

    let still_waiting = state
        .release_waits
        .lock()
        .expect("release waits poisoned")
        .get(&rid)
        .map(|w| w.remaining > 0)
        .unwrap_or(false);
    if still_waiting {
        notify.notified().await;
    }
    tracing::info!(src_index, total, "degraded locks released");
}

// ---- recovery orchestration ----

// Returns a boxed (concrete, `Send`) future so the recursive edge
// `run_recovery` -> here -> `tokio::spawn(run_recovery)` is not an opaque
// async cycle the auto-trait solver can't prove `Send` for.
fn on_reconstruction_progress<'a>(
    state: &'a Arc<CoordinatorState>,
    chunks: u32,
    keys: u32,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
    let finished = {
        let mut recovery = state.recovery.lock().expect("recovery poisoned");
        let done = match recovery.as_mut() {
            Some(progress) => {
                progress.remaining_chunks = progress.remaining_chunks.saturating_sub(chunks);
                progress.remaining_keys = progress.remaining_keys.saturating_sub(keys);
                progress.remaining_chunks == 0 && progress.remaining_keys == 0
            }
            None => {
                tracing::error!("reconstruction progress with no active recovery; discarding");
                false
            }
        };
        if done {
            recovery.take()
        } else {
            None
        }
    };
    let Some(progress) = finished else { return };

    tracing::info!(
        chunks = progress.total_chunks,
        keys = progress.total_keys,
        elapsed = ?progress.started.elapsed(),
        "recovery completed"
    );
    release_degraded_locks(state, progress.failed_index).await;

    // A failure that arrived during this recovery was parked; start it now.
    let next = state.recovery_queue.lock().expect("recovery queue poisoned").pop();
    if let Some(index) = next {
        let state = Arc::clone(state);
        tokio::spawn(async move { run_recovery(state, index).await });
    }
    })
}

/// Detect dead servers by polling connection liveness.
async fn monitor_loop(state: Arc<CoordinatorState>) {
    let mut ticker = tokio::time::interval(state.tuning.failure_check_interval);
    loop {
        ticker.tick().await;
        let failed: Vec<(u32, u16)> = {
            let mut servers = state.servers.lock().expect("servers poisoned");
            let mut failed = Vec::new();
            for (index, entry) in servers.iter_mut().enumerate() {
                if entry.alive {
                    if let Some(peer) = entry.peer {
                        if !state.transport.is_connected(peer) {
                            entry.alive = false;
                            entry.peer = None;
                            failed.push((index as u32, entry.instance_id));
                        }
                    }
                }
            }
            failed
        };
        for (index, instance_id) in failed {
            tracing::warn!(index, instance_id, "server lost; starting recovery");
            let state = Arc::clone(&state);
            tokio::spawn(async move { run_recovery(state, index).await });
        }
    }
}

/// Full recovery of one failed server onto a backup node.
pub async fn run_recovery(state: Arc<CoordinatorState>, failed_index: u32) {
    // One recovery at a time; later failures queue behind it.
    {
        let mut recovery = state.recovery.lock().expect("recovery poisoned");
        if recovery.is_some() {
            state.recovery_queue.lock().expect("recovery queue poisoned").push(failed_index);
            return;
        }
        *recovery = Some(RecoveryProgress {
            failed_index,
            remaining_chunks: 0,
            remaining_keys: 0,
            total_chunks: 0,
            total_keys: 0,
            started: Instant::now(),
        });
    }

    // SelectBackup: no idle backup is a hard stop.
    let Some(backup) = state.backups.lock().expect("backups poisoned").pop() else {
        tracing::error!(failed_index, "no backup node is available; recovery aborted");
        *state.recovery.lock().expect("recovery poisoned") = None;
        return;
    };

    let src_addr = {
        let mut servers = state.servers.lock().expect("servers poisoned");
        let entry = &mut servers[failed_index as usize];
        let src_addr = entry.addr;
        entry.addr = backup.addr;
        entry.peer = Some(backup.peer);
        entry.alive = true;
        src_addr
    };
    state
        .peer_index
        .lock()
        .expect("peer index poisoned")
        .insert(backup.peer, failed_index);

    // Announce: block until every live peer acknowledges the substitution,
    // bounding the window where stale routing could misdirect requests.
    let rid = state.next_rid();
    let targets: Vec<PeerId> = {
        let servers = state.servers.lock().expect("servers poisoned");
        servers
            .iter()
            .enumerate()
            .filter(|(i, e)| *i != failed_index as usize && e.alive)
            .filter_map(|(_, e)| e.peer)
            .collect()
    };
    if !targets.is_empty() {
        let notify = Arc::new(Notify::new());
        state.announce_waits.lock().expect("announce waits poisoned").insert(
            rid,
            CountedWait { remaining: targets.len() as u32, notify: Arc::clone(&notify) },
        );
        let body = Body::ServerReconstructed {
            src_addr: src_addr.to_string(),
            dst_addr: backup.addr.to_string(),
        };
        for peer in targets {
            state.transport.send(peer, Frame::new(0, rid, body.clone())).await;
        }
        if tokio::time::timeout(state.tuning.announce_timeout, notify.notified()).await.is_err() {
            tracing::warn!("announcement round timed out; proceeding with recovery");
            state.announce_waits.lock().expect("announce waits poisoned").remove(&rid);
        }
    }

    // Promote: ship the failed server's sealed-chunk metadata and unsealed
    // key set to the backup in bounded batches.
    let meta = state.meta(failed_index);
    let sealed: Vec<ChunkPos> =
        meta.sealed.lock().expect("sealed poisoned").iter().copied().collect();
    let unsealed: Vec<Vec<u8>> = {
        let sealed_set = meta.sealed.lock().expect("sealed poisoned");
        meta.keys
            .lock()
            .expect("keys poisoned")
            .iter()
            .filter(|(_, pos)| !sealed_set.contains(pos))
            .map(|(key, _)| key.clone())
            .collect()
    };
    let promote_rid = state.next_rid();
    let mut chunk_cursor = 0;
    let mut key_cursor = 0;
    loop {
        let chunk_end = (chunk_cursor + BATCH_LIMIT).min(sealed.len());
        let key_end = (key_cursor + BATCH_LIMIT).min(unsealed.len());
        let is_completed = chunk_end == sealed.len() && key_end == unsealed.len();
        let body = Body::BackupServerPromoted {
            src_addr: src_addr.to_string(),
            chunks: sealed[chunk_cursor..chunk_end].to_vec(),
            keys: unsealed[key_cursor..key_end].to_vec(),
            is_completed,
        };
        state.transport.send(backup.peer, Frame::new(0, promote_rid, body)).await;
        chunk_cursor = chunk_end;
        key_cursor = key_end;
        if is_completed {
            break;
        }
    }

    // Distribute-and-track: partition the failed server's stripes
    // round-robin among surviving peers of each of its lists, and its
    // unsealed keys among the lists' surviving parity servers.
    let mut total_chunks = 0u32;
    let mut total_keys = 0u32;
    for (list_id, chunk_id) in state.stripe_list.slots_of(failed_index) {
        let stripes: Vec<u32> = sealed
            .iter()
            .filter(|pos| pos.list_id == list_id && pos.chunk_id == chunk_id)
            .map(|pos| pos.stripe_id)
            .collect();
        let keys: Vec<Vec<u8>> = if chunk_id < state.cluster.coding.k {
            unsealed
                .iter()
                .filter(|key| state.stripe_list.locate(key) == (list_id, chunk_id))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let helpers: Vec<u32> = (0..state.stripe_list.chunk_count())
            .filter(|c| *c != chunk_id)
            .map(|c| state.stripe_list.server_at(list_id, c))
            .filter(|s| *s != failed_index && state.is_alive(*s))
            .collect();
        let parity_helpers: Vec<u32> = (state.cluster.coding.k..state.stripe_list.chunk_count())
            .filter(|c| *c != chunk_id)
            .map(|c| state.stripe_list.server_at(list_id, c))
            .filter(|s| *s != failed_index && state.is_alive(*s))
            .collect();
        if helpers.is_empty() {
            tracing::error!(list_id, chunk_id, "no surviving helpers; list unrecoverable");
            continue;
        }

        // Round-robin stripe assignment across helpers.
        let mut assignments: HashMap<u32, Vec<u32>> = HashMap::new();
        for (i, stripe) in stripes.iter().enumerate() {
            assignments.entry(helpers[i % helpers.len()]).or_default().push(*stripe);
        }
        for (server, stripe_ids) in assignments {
            let Some(peer) = state.server_peer(server) else { continue };
            total_chunks += stripe_ids.len() as u32;
            let rid = state.next_rid();
            let mut start = 0;
            while start < stripe_ids.len() {
                let end = (start + BATCH_LIMIT).min(stripe_ids.len());
                let body = Body::Reconstruction {
                    list_id,
                    chunk_id,
                    stripe_ids: stripe_ids[start..end].to_vec(),
                    is_completed: end == stripe_ids.len(),
                };
                state.transport.send(peer, Frame::new(0, rid, body)).await;
                start = end;
            }
        }

        if !keys.is_empty() && !parity_helpers.is_empty() {
            let mut key_assignments: HashMap<u32, Vec<Vec<u8>>> = HashMap::new();
            for (i, key) in keys.iter().enumerate() {
                key_assignments
                    .entry(parity_helpers[i % parity_helpers.len()])
                    .or_default()
                    .push(key.clone());
            }
            for (server, server_keys) in key_assignments {
                let Some(peer) = state.server_peer(server) else { continue };
                total_keys += server_keys.len() as u32;
                let rid = state.next_rid();
                let mut start = 0;
                while start < server_keys.len() {
                    let end = (start + BATCH_LIMIT).min(server_keys.len());
                    let body = Body::ReconstructionUnsealed {
                        list_id,
                        chunk_id,
                        keys: server_keys[start..end].to_vec(),
                        is_completed: end == server_keys.len(),
                    };
                    state.transport.send(peer, Frame::new(0, rid, body)).await;
                    start = end;
                }
            }
        }
    }

    {
        let mut recovery = state.recovery.lock().expect("recovery poisoned");
        if let Some(progress) = recovery.as_mut() {
            progress.remaining_chunks = total_chunks;
            progress.remaining_keys = total_keys;
            progress.total_chunks = total_chunks;
            progress.total_keys = total_keys;
        }
    }
    tracing::info!(failed_index, total_chunks, total_keys, "recovery tasks distributed");

    // Nothing to rebuild: complete immediately.
    if total_chunks == 0 && total_keys == 0 {
        on_reconstruction_progress(&state, 0, 0).await;
    }
}

/// Run the coordinator until the listener fails.
pub async fn run(cluster: ClusterConfig, tuning: NodeTuning, listen_addr: SocketAddr) -> Result<()> {
    let transport = Transport::new();
    let state = CoordinatorState::new(cluster, tuning, Arc::clone(&transport))?;

    tokio::spawn(monitor_loop(Arc::clone(&state)));

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    tracing::info!(%listen_addr, "coordinator listening");
    let accept_state = Arc::clone(&state);
    transport::listen(transport, listener, "node", move |peer, frame| {
        let state = Arc::clone(&accept_state);
        async move { handle_frame(state, peer, frame).await }
    })
    .await
}
