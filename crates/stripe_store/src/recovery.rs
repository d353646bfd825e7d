//! Storage-node side of full-node recovery: rebuild batches of lost
//! stripes on behalf of the coordinator, stream unsealed key-values to the
//! promoted backup, and (on the backup itself) track the promised data
//! until everything has arrived.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::metadata::ChunkPos;
use crate::pending::{ChunkRequest, PendingId, RecoveryJob};
use crate::proto::{Body, ForwardOp, Frame};
use crate::server::ServerState;
use crate::transport::LOCAL_PEER;

/// One batch of stripes the coordinator asked this node to rebuild.
struct Batch {
    list_id: u32,
    chunk_id: u32,
    remaining: u32,
    total: u32,
}

/// Data promised to this node during its promotion from backup.
struct Promotion {
    coordinator: PendingId,
    chunks: HashSet<ChunkPos>,
    keys: HashSet<Vec<u8>>,
    chunk_total: u32,
    key_total: u32,
    final_batch_seen: bool,
}

impl Promotion {
    fn is_complete(&self) -> bool {
        self.final_batch_seen && self.chunks.is_empty() && self.keys.is_empty()
    }
}

pub struct RecoveryState {
    batches: Mutex<HashMap<PendingId, Batch>>,
    promotion: Mutex<Option<Promotion>>,
}

impl RecoveryState {
    pub fn new() -> Self {
        Self { batches: Mutex::new(HashMap::new()), promotion: Mutex::new(None) }
    }
}

impl Default for RecoveryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Rebuild a batch of sealed stripes whose `chunk_id` slot was lost. Each
/// stripe runs through the shared GET_CHUNK fan-in; per-stripe failures are
/// logged and counted down without aborting the batch.
pub async fn handle_reconstruction(
    state: Arc<ServerState>,
    from: PendingId,
    list_id: u32,
    chunk_id: u32,
    stripe_ids: Vec<u32>,
    is_completed: bool,
) {
    let _ = is_completed;
    if stripe_ids.is_empty() {
        state
            .reply(from, Body::ReconstructionResponse {
                success: true,
                list_id,
                chunk_id,
                num_stripes: 0,
            })
            .await;
        return;
    }
    {
        let mut batches = state.recovery.batches.lock().expect("batches poisoned");
        let batch = batches.entry(from).or_insert(Batch {
            list_id,
            chunk_id,
            remaining: 0,
            total: 0,
        });
        batch.remaining += stripe_ids.len() as u32;
        batch.total += stripe_ids.len() as u32;
    }

    for stripe_id in stripe_ids {
        let pos = ChunkPos::new(list_id, stripe_id, chunk_id);
        let job_id = PendingId::new(state.my_instance(), state.next_rid(), LOCAL_PEER);
        let job = RecoveryJob { pos, batch: from };
        state.pending.recovery_ops.insert(job_id, from, job);
        start_recovery_fanout(&state, job_id, pos).await;
    }
}

/// GET_CHUNK fan-out for one lost stripe, rotated by stripe id so
/// consecutive stripes draw from different survivors.
async fn start_recovery_fanout(state: &Arc<ServerState>, job_id: PendingId, pos: ChunkPos) {
    let k = state.k() as usize;
    let n = (state.k() + state.m()) as usize;
    let rotation = pos.stripe_id as usize % n;

    let mut selected = Vec::with_capacity(k);
    for i in 0..n {
        if selected.len() == k {
            break;
        }
        let id = ((rotation + i) % n) as u32;
        if id == pos.chunk_id {
            continue;
        }
        selected.push(id);
    }

    let mut issued = 0;
    for id in selected {
        let chunk_pos = ChunkPos::new(pos.list_id, pos.stripe_id, id);
        let holder = state.stripe_list.server_at(pos.list_id, id);
        if holder == state.my_index() {
            let (data, size, seal_indicator) = crate::server::read_local_chunk(state, chunk_pos);
            let mut request = ChunkRequest::local(chunk_pos);
            let mut bytes = data;
            bytes.resize(state.cluster.coding.chunk_size, 0);
            request.chunk = Some(bytes);
            request.size = size;
            request.seal_indicator = seal_indicator;
            state.pending.peer_get_chunk.insert(
                PendingId::new(job_id.instance_id, job_id.request_id, LOCAL_PEER),
                job_id,
                request,
            );
            issued += 1;
            continue;
        }
        let Some(peer) = state.peer_for_server(holder).await else {
            tracing::warn!(chunk = %chunk_pos, holder, "recovery survivor unreachable");
            continue;
        };
        let id = PendingId::new(job_id.instance_id, job_id.request_id, peer);
        if state.pending.peer_get_chunk.insert(id, job_id, ChunkRequest::remote(chunk_pos)) {
            issued += 1;
            state
                .transport
                .send(
                    peer,
                    Frame::new(job_id.instance_id, job_id.request_id, Body::GetChunk {
                        pos: chunk_pos,
                    }),
                )
                .await;
        }
    }

    if issued < k {
        tracing::error!(%pos, issued, "not enough survivors for recovery; skipping stripe");
        state.pending.peer_get_chunk.erase_all(job_id.instance_id, job_id.request_id);
        if let Some((_, job)) = state.pending.recovery_ops.erase_quiet(job_id) {
            finish_job(state, job, None).await;
        }
        return;
    }

    crate::degraded::try_finish_local(state, job_id).await;
}

/// Complete one stripe rebuild: push the rebuilt chunk to the promoted
/// backup (now in the failed slot of the server table), then count the
/// batch down and confirm it to the coordinator when it drains.
pub async fn finish_job(state: &Arc<ServerState>, job: RecoveryJob, stripe: Option<Vec<Vec<u8>>>) {
    match stripe {
        Some(stripe) => {
            let backup = state.stripe_list.server_at(job.pos.list_id, job.pos.chunk_id);
            if backup == state.my_index() {
                // This node is the promoted backup itself.
                let staged = state.pool.alloc().await;
                let mut chunk = staged.into_inner();
                let is_parity = job.pos.chunk_id >= state.k();
                chunk.load(job.pos, is_parity, &stripe[job.pos.chunk_id as usize]);
                if !is_parity {
                    chunk.rescan();
                }
                state.store.insert_sealed(chunk);
            } else if let Some(peer) = state.peer_for_server(backup).await {
                let rid = state.next_rid();
                let id = PendingId::new(state.my_instance(), rid, peer);
                state.pending.peer_forward_chunk.insert(id, job.batch, job.pos);
                state
                    .transport
                    .send(
                        peer,
                        Frame::new(state.my_instance(), rid, Body::ForwardChunk {
                            pos: job.pos,
                            is_parity: job.pos.chunk_id >= state.k(),
                            data: stripe[job.pos.chunk_id as usize].clone(),
                        }),
                    )
                    .await;
            } else {
                tracing::error!(pos = %job.pos, backup, "promoted backup unreachable");
            }
        }
        None => {
            tracing::error!(pos = %job.pos, "stripe rebuild failed; continuing with the batch");
        }
    }

    let done = {
        let mut batches = state.recovery.batches.lock().expect("batches poisoned");
        match batches.get_mut(&job.batch) {
            Some(batch) => {
                batch.remaining = batch.remaining.saturating_sub(1);
                if batch.remaining == 0 {
                    let batch = batches.remove(&job.batch).expect("entry just observed");
                    Some(batch)
                } else {
                    None
                }
            }
            None => None,
        }
    };
    if let Some(batch) = done {
        state
            .reply(job.batch, Body::ReconstructionResponse {
                success: true,
                list_id: batch.list_id,
                chunk_id: batch.chunk_id,
                num_stripes: batch.total,
            })
            .await;
    }
}

/// Stream this node's forwarded copies of the named unsealed keys to the
/// promoted backup.
pub async fn handle_reconstruction_unsealed(
    state: Arc<ServerState>,
    from: PendingId,
    list_id: u32,
    chunk_id: u32,
    keys: Vec<Vec<u8>>,
    is_completed: bool,
) {
    let _ = is_completed;
    let num_keys = keys.len() as u32;
    let backup = state.stripe_list.server_at(list_id, chunk_id);
    let peer = if backup == state.my_index() {
        None
    } else {
        state.peer_for_server(backup).await
    };

    for key in keys {
        let Some(value) = state.parity.find_kv(&key).or_else(|| state.store.get(&key)) else {
            tracing::warn!(key = ?String::from_utf8_lossy(&key), "unsealed key not held here; skipping");
            continue;
        };
        let pos = ChunkPos::new(list_id, 0, chunk_id);
        match peer {
            Some(peer) => {
                let rid = state.next_rid();
                let id = PendingId::new(state.my_instance(), rid, peer);
                state.pending.peer_forward_key.insert(
                    id,
                    from,
                    Body::ForwardKeyResponse { success: true, pos, key: key.clone() },
                );
                state
                    .transport
                    .send(
                        peer,
                        Frame::new(state.my_instance(), rid, Body::ForwardKey {
                            op: ForwardOp::Get,
                            pos,
                            key,
                            value,
                            update: None,
                        }),
                    )
                    .await;
            }
            None => {
                state.degraded.insert_value(key.clone(), value);
                note_forwarded_key(&state, &key).await;
            }
        }
    }

    state
        .reply(from, Body::ReconstructionUnsealedResponse {
            success: true,
            list_id,
            chunk_id,
            num_keys,
        })
        .await;
}

/// Backup side of promotion: adopt the failed server's slot and record the
/// sealed chunks and unsealed keys that will be streamed in.
pub async fn handle_backup_promoted(
    state: Arc<ServerState>,
    from: PendingId,
    src_addr: String,
    chunks: Vec<ChunkPos>,
    keys: Vec<Vec<u8>>,
    is_completed: bool,
) {
    if let Ok(src) = src_addr.parse::<SocketAddr>() {
        let index = {
            let addrs = state.server_addrs.read().expect("server addrs poisoned");
            addrs.iter().position(|a| *a == src)
        };
        if let Some(index) = index {
            if state.my_index() != index as u32 {
                state.assume_index(index as u32);
                tracing::info!(index, %src, "assumed failed server's slot");
            }
        }
    }

    let respond_now = {
        let mut promotion = state.recovery.promotion.lock().expect("promotion poisoned");
        let entry = promotion.get_or_insert_with(|| Promotion {
            coordinator: from,
            chunks: HashSet::new(),
            keys: HashSet::new(),
            chunk_total: 0,
            key_total: 0,
            final_batch_seen: false,
        });
        entry.coordinator = from;
        entry.chunk_total += chunks.len() as u32;
        entry.key_total += keys.len() as u32;
        entry.chunks.extend(chunks);
        entry.keys.extend(keys);
        entry.final_batch_seen = entry.final_batch_seen || is_completed;
        entry.is_complete()
    };
    if respond_now {
        announce_promotion_complete(&state).await;
    }
}

/// Called for every arriving forwarded chunk; retires a promotion promise
/// when one is outstanding.
pub async fn note_forwarded_chunk(state: &Arc<ServerState>, pos: ChunkPos) {
    let complete = {
        let mut promotion = state.recovery.promotion.lock().expect("promotion poisoned");
        match promotion.as_mut() {
            Some(entry) => entry.chunks.remove(&pos) && entry.is_complete(),
            _ => false,
        }
    };
    if complete {
        announce_promotion_complete(state).await;
    }
}

/// Called for every arriving forwarded key; retires a promotion promise.
pub async fn note_forwarded_key(state: &Arc<ServerState>, key: &[u8]) {
    let complete = {
        let mut promotion = state.recovery.promotion.lock().expect("promotion poisoned");
        match promotion.as_mut() {
            Some(entry) => entry.keys.remove(key) && entry.is_complete(),
            _ => false,
        }
    };
    if complete {
        announce_promotion_complete(state).await;
    }
}

async fn announce_promotion_complete(state: &Arc<ServerState>) {
    let taken = state.recovery.promotion.lock().expect("promotion poisoned").take();
    let Some(entry) = taken else { return };
    tracing::info!(
        chunks = entry.chunk_total,
        keys = entry.key_total,
        "backup promotion caught up"
    );
    state
        .reply(entry.coordinator, Body::BackupServerPromotedResponse {
            chunk_count: entry.chunk_total,
            key_count: entry.key_total,
        })
        .await;
}
