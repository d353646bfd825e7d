//! Degraded operation executor.
//!
//! Turns a client GET/UPDATE/DELETE addressed to a dead chunk into a
//! decode-then-serve (or decode-then-mutate-then-re-encode) sequence:
//! gather `k` surviving chunks, repair seal-status disagreement, decode,
//! serve the op from the rebuilt bytes, and keep parity consistent by
//! forwarding deltas to the redirect destinations. Concurrent requests for
//! the same stripe join one in-flight reconstruction; parked requests are
//! failed back to their clients if the round exceeds the configured
//! timeout.

use std::sync::Arc;

use crate::degraded_map::{JoinOutcome, Waiter};
use crate::metadata::{ChunkPos, RedirectSet};
use crate::pending::{ChunkRequest, ChunkUpdate, DegradedOp, DegradedOpKind, PendingId};
use crate::proto::{Body, ForwardOp, Frame};
use crate::server::{apply_parity_delta, ServerState};
use crate::transport::{PeerId, LOCAL_PEER};
use stripe_coding::zeros;

pub async fn handle_degraded_get(
    state: Arc<ServerState>,
    client: PendingId,
    key: Vec<u8>,
    stripe_id: u32,
    is_sealed: bool,
    redirect: RedirectSet,
) {
    degraded_entry(state, client, DegradedOpKind::Get, key, stripe_id, is_sealed, redirect).await;
}

#[allow(clippy::too_many_arguments)]
pub async fn handle_degraded_update(
    state: Arc<ServerState>,
    client: PendingId,
    key: Vec<u8>,
    value_offset: u32,
    value: Vec<u8>,
    stripe_id: u32,
    is_sealed: bool,
    redirect: RedirectSet,
) {
    let kind = DegradedOpKind::Update { value_offset, value };
    degraded_entry(state, client, kind, key, stripe_id, is_sealed, redirect).await;
}

pub async fn handle_degraded_delete(
    state: Arc<ServerState>,
    client: PendingId,
    key: Vec<u8>,
    stripe_id: u32,
    is_sealed: bool,
    redirect: RedirectSet,
) {
    degraded_entry(state, client, DegradedOpKind::Delete, key, stripe_id, is_sealed, redirect)
        .await;
}

async fn degraded_entry(
    state: Arc<ServerState>,
    client: PendingId,
    kind: DegradedOpKind,
    key: Vec<u8>,
    stripe_id: u32,
    is_sealed: bool,
    redirect: RedirectSet,
) {
    let (list_id, data_chunk) = state.stripe_list.locate(&key);
    let pos = ChunkPos::new(list_id, stripe_id, data_chunk);

    // Only parity chunks are remapped: the addressed data chunk is intact,
    // so no reconstruction is needed. Serve normally but keep parity
    // forwarding redirect-aware.
    if !redirect.is_redirected(data_chunk) {
        fallback_normal(state, client, kind, key, pos, redirect).await;
        return;
    }

    // Already resident from an earlier reconstruction?
    if state.degraded.has_chunk(pos) || state.degraded.find_value_by_key(&key).is_some() {
        let op = DegradedOp { kind, key, pos, is_sealed, redirect, client };
        serve_resident(&state, op).await;
        return;
    }

    // Migrated away after release: answering from scratch would resurrect
    // stale data.
    if state.degraded.is_removed(pos) {
        reply_failure(&state, client, &kind, key).await;
        return;
    }

    let op_id = PendingId::new(state.my_instance(), state.next_rid(), LOCAL_PEER);
    let op = DegradedOp { kind, key: key.clone(), pos, is_sealed, redirect, client };
    let waiter = Waiter { id: op_id, chunk_id: data_chunk };

    if is_sealed {
        match state.degraded.join_chunk_reconstruction(list_id, stripe_id, Some(waiter)) {
            JoinOutcome::AlreadyDone => {
                serve_resident(&state, op).await;
            }
            JoinOutcome::Joined => {
                state.pending.degraded_ops.insert(op_id, client, op);
            }
            JoinOutcome::Start => {
                state.pending.degraded_ops.insert(op_id, client, op.clone());
                start_chunk_fanout(&state, op_id, &op).await;
                spawn_chunk_timeout(Arc::clone(&state), list_id, stripe_id, op_id);
            }
        }
    } else {
        match state.degraded.join_key_reconstruction(&key, Some(waiter)) {
            JoinOutcome::AlreadyDone => {
                serve_resident(&state, op).await;
            }
            JoinOutcome::Joined => {
                state.pending.degraded_ops.insert(op_id, client, op);
            }
            JoinOutcome::Start => {
                state.pending.degraded_ops.insert(op_id, client, op.clone());
                start_unsealed_fetch(&state, op_id, &op).await;
                spawn_key_timeout(Arc::clone(&state), key, op_id);
            }
        }
    }
}

// ---- sealed path: GET_CHUNK fan-out and decode ----

/// Pick the `k` survivors to fetch for a reconstruction, rotating through
/// `surviving_chunk_ids` starting at `request_id % m` so repeated
/// reconstructions spread load across peers. Redirected (dead) chunks are
/// never selected.
fn select_survivors(k: usize, m: usize, request_id: u32, redirect: &RedirectSet) -> Vec<u32> {
    let survivors = &redirect.surviving_chunk_ids;
    if survivors.is_empty() {
        return Vec::new();
    }
    let rotation = if m == 0 { 0 } else { request_id as usize % m };
    let mut selected: Vec<u32> = Vec::with_capacity(k);
    for i in 0..survivors.len() {
        if selected.len() == k {
            break;
        }
        let id = survivors[(rotation + i) % survivors.len()];
        if redirect.is_redirected(id) || selected.contains(&id) {
            continue;
        }
        selected.push(id);
    }
    selected
}

/// Issue GET_CHUNK to `k` survivors.
async fn start_chunk_fanout(state: &Arc<ServerState>, op_id: PendingId, op: &DegradedOp) {
    let k = state.k() as usize;
    let m = state.m() as usize;
    let selected = select_survivors(k, m, op.client.request_id, &op.redirect);
    if selected.len() < k {
        tracing::error!(
            pos = %op.pos,
            surviving = op.redirect.surviving_chunk_ids.len(),
            "fewer than k surviving chunks; stripe is unrecoverable"
        );
        fail_round(state, op.pos.list_id, op.pos.stripe_id, op_id, true).await;
        return;
    }

    for id in selected {
        let chunk_pos = ChunkPos::new(op.pos.list_id, op.pos.stripe_id, id);
        let holder = state.stripe_list.server_at(op.pos.list_id, id);
        if holder == state.my_index() {
            // This node supplies its own chunk without a network hop.
            let (data, size, seal_indicator) = crate::server::read_local_chunk(state, chunk_pos);
            let mut request = ChunkRequest::local(chunk_pos);
            let mut bytes = data;
            bytes.resize(state.cluster.coding.chunk_size, 0);
            request.chunk = Some(bytes);
            request.size = size;
            request.seal_indicator = seal_indicator;
            state.pending.peer_get_chunk.insert(
                PendingId::new(op_id.instance_id, op_id.request_id, LOCAL_PEER),
                op_id,
                request,
            );
            continue;
        }
        let Some(peer) = state.peer_for_server(holder).await else {
            tracing::warn!(chunk = %chunk_pos, holder, "survivor unreachable");
            continue;
        };
        let id = PendingId::new(op_id.instance_id, op_id.request_id, peer);
        if state.pending.peer_get_chunk.insert(id, op_id, ChunkRequest::remote(chunk_pos)) {
            state
                .transport
                .send(
                    peer,
                    Frame::new(op_id.instance_id, op_id.request_id, Body::GetChunk {
                        pos: chunk_pos,
                    }),
                )
                .await;
        }
    }

    // Everything may have been local.
    try_finish_fanout(state, op_id.instance_id, op_id.request_id).await;
}

/// Record one GET_CHUNK response and finish the round if it was the last.
#[allow(clippy::too_many_arguments)]
pub async fn on_get_chunk_response(
    state: Arc<ServerState>,
    from: PendingId,
    success: bool,
    pos: ChunkPos,
    size: u32,
    seal_indicator: Vec<bool>,
    data: Vec<u8>,
) {
    let recorded = state.pending.peer_get_chunk.with_entry(from, |request| {
        if success {
            let mut bytes = data;
            bytes.resize(state.cluster.coding.chunk_size, 0);
            request.chunk = Some(bytes);
            request.size = size;
            request.seal_indicator = seal_indicator;
        } else {
            // A refusal still counts as an arrival: the chunk reads as
            // zeros and unsealed.
            request.chunk = Some(zeros(state.cluster.coding.chunk_size));
            request.size = 0;
        }
    });
    if recorded.is_none() {
        tracing::error!(
            %pos,
            request_id = from.request_id,
            "no pending GET_CHUNK matches response; discarding"
        );
        return;
    }
    try_finish_fanout(&state, from.instance_id, from.request_id).await;
}

/// Re-check a fan-in that may already be complete because every source was
/// local (used by the recovery path after issuing its requests).
pub async fn try_finish_local(state: &Arc<ServerState>, op_id: PendingId) {
    try_finish_fanout(state, op_id.instance_id, op_id.request_id).await;
}

async fn try_finish_fanout(state: &Arc<ServerState>, instance_id: u16, request_id: u32) {
    let Some(entries) =
        state.pending.peer_get_chunk.try_collect(instance_id, request_id, |r| r.chunk.is_some())
    else {
        return;
    };
    let parent = entries[0].1;

    let stripe = match assemble_stripe(state, &entries) {
        Ok(stripe) => stripe,
        Err(err) => {
            tracing::error!(error = %err, "stripe decode failed");
            if let Some((_, job)) = state.pending.recovery_ops.erase_quiet(parent) {
                crate::recovery::finish_job(state, job, None).await;
            } else if let Some(op) =
                state.pending.degraded_ops.with_entry(parent, |op| op.clone())
            {
                fail_round(state, op.pos.list_id, op.pos.stripe_id, parent, true).await;
            }
            return;
        }
    };

    // A recovery job and a degraded op share the same fan-in machinery;
    // the parent id tells them apart.
    if let Some((_, job)) = state.pending.recovery_ops.erase_quiet(parent) {
        crate::recovery::finish_job(state, job, Some(stripe)).await;
        return;
    }

    // The starter op stays in the tracker; it is served through the waiter
    // list like everyone else.
    let Some(op) = state.pending.degraded_ops.with_entry(parent, |op| op.clone()) else {
        tracing::error!(request_id, "completed fan-in has no owner; discarding");
        return;
    };
    install_and_serve(state, op, stripe).await;
}

/// Build the full stripe from gathered survivors: repair seal-status
/// disagreement, then decode the missing chunks.
fn assemble_stripe(
    state: &Arc<ServerState>,
    entries: &[(PendingId, PendingId, ChunkRequest)],
) -> anyhow::Result<Vec<Vec<u8>>> {
    let k = state.k() as usize;
    let m = state.m() as usize;
    let n = k + m;
    let chunk_size = state.cluster.coding.chunk_size;

    let mut chunks: Vec<Vec<u8>> = (0..n).map(|_| zeros(chunk_size)).collect();
    let mut present = vec![false; n];
    // seen[j][i]: parity j's belief about data chunk i; the last row is the
    // authoritative view assembled from direct evidence.
    let mut seen: Vec<Vec<bool>> = vec![vec![false; k]; m];
    let mut sealed = vec![false; k];
    let mut parity_present = vec![false; m];

    for (_, _, request) in entries {
        let idx = request.pos.chunk_id as usize;
        let bytes = request.chunk.clone().expect("collected entries are filled");
        chunks[idx] = bytes;
        present[idx] = true;
        if idx < k {
            sealed[idx] = sealed[idx] || request.size > 0;
        } else {
            parity_present[idx - k] = true;
            for (i, flag) in request.seal_indicator.iter().enumerate().take(k) {
                seen[idx - k][i] = *flag;
            }
        }
    }

    // Data chunks being reconstructed are treated as sealed; that is what
    // the surviving parity encodes.
    for (i, was_seen) in sealed.iter_mut().enumerate() {
        if !present[i] {
            *was_seen = true;
        }
    }
    for j in 0..m {
        if parity_present[j] {
            for i in 0..k {
                sealed[i] = sealed[i] || seen[j][i];
            }
        }
    }

    let disagreement = (0..m).any(|j| {
        parity_present[j] && (0..k).any(|i| present[i] && seen[j][i] != sealed[i])
    });
    if disagreement {
        state.coding.force_seal(&mut chunks, &present, &seen, &sealed)?;
    }

    state.coding.decode(&mut chunks, &present)?;
    Ok(chunks)
}

/// Install the rebuilt chunks, forward redirected copies to their
/// destinations, release every parked waiter, and serve their ops.
async fn install_and_serve(state: &Arc<ServerState>, op: DegradedOp, stripe: Vec<Vec<u8>>) {
    let list_id = op.pos.list_id;
    let stripe_id = op.pos.stripe_id;
    let k = state.k();

    for pair in &op.redirect.pairs {
        let rebuilt_id = pair.original_chunk;
        let rebuilt_pos = ChunkPos::new(list_id, stripe_id, rebuilt_id);
        let is_parity = rebuilt_id >= k;
        let dest_server = state
            .stripe_list
            .server_at(pair.redirected_list, pair.redirected_chunk);

        // The addressed chunk always lands in the local cache: the parked
        // ops are served from here even when another server is the official
        // destination. Staging goes through the bounded chunk arena, so a
        // burst of reconstructions backpressures instead of ballooning.
        if dest_server == state.my_index() || rebuilt_pos == op.pos {
            let staged = state.pool.alloc().await;
            let mut chunk = staged.into_inner();
            chunk.load(rebuilt_pos, is_parity, &stripe[rebuilt_id as usize]);
            if !is_parity {
                chunk.rescan();
            }
            state.degraded.insert_chunk(chunk);
        }
        if dest_server != state.my_index() {
            // Another destination owns this rebuilt chunk; push it there.
            let Some(peer) = state.peer_for_server(dest_server).await else { continue };
            let rid = state.next_rid();
            let id = PendingId::new(state.my_instance(), rid, peer);
            state.pending.peer_forward_chunk.insert(id, op.client, rebuilt_pos);
            state
                .transport
                .send(
                    peer,
                    Frame::new(state.my_instance(), rid, Body::ForwardChunk {
                        pos: rebuilt_pos,
                        is_parity,
                        data: stripe[rebuilt_id as usize].clone(),
                    }),
                )
                .await;
        }
    }

    let waiters = state.degraded.complete_chunk_reconstruction(list_id, stripe_id, true);
    for waiter in waiters {
        let Some((_, parked)) = state.pending.degraded_ops.erase_quiet(waiter.id) else {
            continue;
        };
        serve_resident(state, parked).await;
    }
}

/// Serve an op whose target is resident in the degraded cache.
async fn serve_resident(state: &Arc<ServerState>, op: DegradedOp) {
    match op.kind.clone() {
        DegradedOpKind::Get => {
            match state.degraded.find_value_by_key(&op.key) {
                Some(value) => {
                    state
                        .reply(op.client, Body::GetResponse {
                            success: true,
                            is_degraded: true,
                            key: op.key,
                            value,
                        })
                        .await;
                }
                None => reply_failure(state, op.client, &DegradedOpKind::Get, op.key).await,
            }
        }
        DegradedOpKind::Update { value_offset, value } => {
            if state.degraded.update_value_in_place(&op.key, value_offset, &value) {
                // Unsealed copy: refresh this node's own parity copy, then
                // forward the new bytes to every other holder (redirect
                // destinations and surviving parity alike).
                state.parity.update_kv(&op.key, value_offset, &value);
                forward_key_to_destinations(state, &op, ForwardOp::Update, value_offset, value)
                    .await;
                return;
            }
            let Some(meta) = state.degraded.find_key_metadata(&op.key) else {
                reply_failure(
                    state,
                    op.client,
                    &DegradedOpKind::Update { value_offset, value },
                    op.key,
                )
                .await;
                return;
            };
            let updated = state
                .degraded
                .with_chunk_mut(meta.pos, |chunk| chunk.update_value(meta.offset, value_offset, &value));
            let Some(Some((chunk_offset, delta))) = updated else {
                reply_failure(
                    state,
                    op.client,
                    &DegradedOpKind::Update { value_offset, value },
                    op.key,
                )
                .await;
                return;
            };
            let update = ChunkUpdate {
                pos: meta.pos,
                offset: chunk_offset,
                length: delta.len() as u32,
                key: op.key.clone(),
                value_offset,
                is_degraded: true,
            };
            let sent = forward_delta_redirected(
                state, op.client, &op.redirect, update, &delta, true, false, &value,
            )
            .await;
            if sent == 0 {
                state
                    .reply(op.client, Body::UpdateResponse {
                        success: true,
                        is_degraded: true,
                        key: op.key,
                        value_offset,
                        length: value.len() as u32,
                    })
                    .await;
            }
        }
        DegradedOpKind::Delete => {
            if state.degraded.delete_value(&op.key).is_some() {
                // This node's own forwarded copy (if it is a parity holder)
                // must not resurrect the key later.
                state.parity.remove_kv(&op.key);
                forward_key_to_destinations(state, &op, ForwardOp::Delete, 0, Vec::new()).await;
                return;
            }
            let Some(meta) = state.degraded.find_key_metadata(&op.key) else {
                reply_failure(state, op.client, &DegradedOpKind::Delete, op.key).await;
                return;
            };
            let delta = state
                .degraded
                .with_chunk_mut(meta.pos, |chunk| chunk.delete_record(meta.offset, meta.length));
            let Some(delta) = delta else {
                reply_failure(state, op.client, &DegradedOpKind::Delete, op.key).await;
                return;
            };
            state.degraded.delete_key(&op.key);
            state.degraded.shift_keys_after(meta.pos, meta.offset, meta.length);
            let update = ChunkUpdate {
                pos: meta.pos,
                offset: meta.offset,
                length: delta.len() as u32,
                key: op.key.clone(),
                value_offset: 0,
                is_degraded: true,
            };
            let sent = forward_delta_redirected(
                state, op.client, &op.redirect, update, &delta, true, true, &[],
            )
            .await;
            if sent == 0 {
                state
                    .reply(op.client, Body::DeleteResponse {
                        success: true,
                        is_degraded: true,
                        key: op.key,
                    })
                    .await;
            }
        }
    }
}

/// Forward a mutation to every parity holder of the stripe, following
/// redirects for the parity slots that are themselves dead: the chunk delta
/// for sealed records, the key-value update/removal for unsealed ones
/// (their bytes only exist as forwarded copies on the parity side). Returns
/// the number of acks the client answer must wait for.
#[allow(clippy::too_many_arguments)]
pub async fn forward_delta_redirected(
    state: &Arc<ServerState>,
    client: PendingId,
    redirect: &RedirectSet,
    update: ChunkUpdate,
    delta: &[u8],
    sealed: bool,
    is_delete: bool,
    new_value: &[u8],
) -> usize {
    let pos = update.pos;
    let rid = state.next_rid();
    let mut sent = 0;
    for parity_chunk in state.k()..state.k() + state.m() {
        let holder = match redirect.destination_of(parity_chunk) {
            Some((dst_list, dst_chunk)) => state.stripe_list.server_at(dst_list, dst_chunk),
            None => state.stripe_list.server_at(pos.list_id, parity_chunk),
        };
        if holder == state.my_index() {
            if sealed {
                apply_parity_delta(state, pos, parity_chunk, update.offset, delta);
            } else if is_delete {
                state.parity.remove_kv(&update.key);
            } else {
                state.parity.update_kv(&update.key, update.value_offset, new_value);
            }
            continue;
        }
        let Some(peer) = state.peer_for_server(holder).await else { continue };
        let id = PendingId::new(state.my_instance(), rid, peer);
        let body = if sealed {
            if is_delete {
                Body::DeleteChunk {
                    pos,
                    target_chunk_id: parity_chunk,
                    offset: update.offset,
                    delta: delta.to_vec(),
                }
            } else {
                Body::UpdateChunk {
                    pos,
                    target_chunk_id: parity_chunk,
                    offset: update.offset,
                    delta: delta.to_vec(),
                }
            }
        } else if is_delete {
            Body::Delete { key: update.key.clone() }
        } else {
            Body::Update {
                key: update.key.clone(),
                value_offset: update.value_offset,
                value: new_value.to_vec(),
            }
        };
        let tracked = if is_delete {
            state.pending.peer_delete_chunk.insert(id, client, update.clone())
        } else {
            state.pending.peer_update_chunk.insert(id, client, update.clone())
        };
        if tracked {
            sent += 1;
            state.transport.send(peer, Frame::new(state.my_instance(), rid, body)).await;
        }
    }
    sent
}

/// Last-ack bookkeeping for parity delta fan-outs (normal and degraded).
pub async fn on_delta_ack(state: Arc<ServerState>, from: PendingId, peer: PeerId, is_delete: bool) {
    let set = if is_delete { &state.pending.peer_delete_chunk } else { &state.pending.peer_update_chunk };
    let Some((parent, update)) = set.erase(from) else {
        return;
    };
    if set.count(from.instance_id, from.request_id, peer) != 0 {
        return;
    }
    let body = if is_delete {
        Body::DeleteResponse { success: true, is_degraded: update.is_degraded, key: update.key }
    } else {
        Body::UpdateResponse {
            success: true,
            is_degraded: update.is_degraded,
            key: update.key,
            value_offset: update.value_offset,
            length: update.length,
        }
    };
    state.reply(parent, body).await;
}

/// Push an updated or deleted unsealed key-value to every redirect
/// destination; the client is answered after the last ack.
async fn forward_key_to_destinations(
    state: &Arc<ServerState>,
    op: &DegradedOp,
    forward_op: ForwardOp,
    value_offset: u32,
    new_bytes: Vec<u8>,
) {
    let reply = match forward_op {
        ForwardOp::Update => Body::UpdateResponse {
            success: true,
            is_degraded: true,
            key: op.key.clone(),
            value_offset,
            length: new_bytes.len() as u32,
        },
        _ => Body::DeleteResponse { success: true, is_degraded: true, key: op.key.clone() },
    };
    let value = state.degraded.find_value_by_key(&op.key).unwrap_or_default();
    let rid = state.next_rid();
    let mut sent = 0;

    // Redirect destinations plus the surviving natural parity holders, so
    // every copy of the unsealed value converges.
    let mut targets: Vec<u32> = op
        .redirect
        .pairs
        .iter()
        .map(|pair| state.stripe_list.server_at(pair.redirected_list, pair.redirected_chunk))
        .collect();
    for parity_chunk in state.k()..state.k() + state.m() {
        if !op.redirect.is_redirected(parity_chunk) {
            targets.push(state.stripe_list.server_at(op.pos.list_id, parity_chunk));
        }
    }
    targets.sort_unstable();
    targets.dedup();

    for dest in targets {
        if dest == state.my_index() {
            continue;
        }
        let Some(peer) = state.peer_for_server(dest).await else { continue };
        let id = PendingId::new(state.my_instance(), rid, peer);
        if state.pending.peer_forward_key.insert(id, op.client, reply.clone()) {
            sent += 1;
            let update = match forward_op {
                ForwardOp::Update => Some((value_offset, new_bytes.clone())),
                _ => None,
            };
            state
                .transport
                .send(
                    peer,
                    Frame::new(state.my_instance(), rid, Body::ForwardKey {
                        op: forward_op,
                        pos: op.pos,
                        key: op.key.clone(),
                        value: value.clone(),
                        update,
                    }),
                )
                .await;
        }
    }
    if sent == 0 {
        state.reply(op.client, reply).await;
    }
}

/// Last-ack bookkeeping for forwarded key-values and SET parity copies.
pub async fn on_forward_key_ack(state: Arc<ServerState>, from: PendingId, peer: PeerId) {
    let Some((parent, reply)) = state.pending.peer_forward_key.erase(from) else {
        return;
    };
    if state.pending.peer_forward_key.count(from.instance_id, from.request_id, peer) == 0 {
        state.reply(parent, reply).await;
    }
}

// ---- unsealed path ----

/// Fetch the live key-value from a surviving parity peer holding a
/// forwarded copy, rotating the starting peer by request id.
async fn start_unsealed_fetch(state: &Arc<ServerState>, op_id: PendingId, op: &DegradedOp) {
    let m = state.m();
    let (list_id, data_chunk) = (op.pos.list_id, op.pos.chunk_id);

    // This node may itself hold the value (it is the data server, or a
    // parity holder of the copy).
    if let Some(value) = state.store.get(&op.key).or_else(|| state.parity.find_kv(&op.key)) {
        state.degraded.insert_value(op.key.clone(), value);
        finish_key_round(state, &op.key, true).await;
        return;
    }

    if m == 0 {
        fail_key_round(state, &op.key, op_id).await;
        return;
    }
    for i in 0..m {
        let parity_chunk = state.k() + (op.client.request_id + i) % m;
        if op.redirect.is_redirected(parity_chunk) {
            continue;
        }
        let holder = state.stripe_list.server_at(list_id, parity_chunk);
        if holder == state.my_index() {
            continue;
        }
        let Some(peer) = state.peer_for_server(holder).await else { continue };
        let id = PendingId::new(op_id.instance_id, op_id.request_id, peer);
        if state.pending.peer_unsealed_get.insert(id, op_id, op.key.clone()) {
            state
                .transport
                .send(
                    peer,
                    Frame::new(op_id.instance_id, op_id.request_id, Body::UnsealedGet {
                        list_id,
                        chunk_id: data_chunk,
                        key: op.key.clone(),
                    }),
                )
                .await;
            return;
        }
    }

    tracing::error!(key = ?String::from_utf8_lossy(&op.key), "no surviving parity holds the unsealed value");
    fail_key_round(state, &op.key, op_id).await;
}

pub async fn on_unsealed_get_response(
    state: Arc<ServerState>,
    from: PendingId,
    success: bool,
    key: Vec<u8>,
    value: Vec<u8>,
) {
    if state.pending.peer_unsealed_get.erase(from).is_none() {
        return;
    }
    if success {
        state.degraded.insert_value(key.clone(), value);
    }
    finish_key_round(&state, &key, success).await;
}

async fn finish_key_round(state: &Arc<ServerState>, key: &[u8], success: bool) {
    let waiters = state.degraded.complete_key_reconstruction(key, success);
    for waiter in waiters {
        let Some((_, parked)) = state.pending.degraded_ops.erase_quiet(waiter.id) else {
            continue;
        };
        if success {
            serve_resident(state, parked).await;
        } else {
            reply_failure(state, parked.client, &parked.kind, parked.key).await;
        }
    }
}

async fn fail_key_round(state: &Arc<ServerState>, key: &[u8], _op_id: PendingId) {
    finish_key_round(state, key, false).await;
}

// ---- fallback and failure paths ----

/// Parity-only redirect: serve from the primary store, forwarding parity
/// deltas through the redirect map.
async fn fallback_normal(
    state: Arc<ServerState>,
    client: PendingId,
    kind: DegradedOpKind,
    key: Vec<u8>,
    _pos: ChunkPos,
    redirect: RedirectSet,
) {
    match kind {
        DegradedOpKind::Get => {
            let value = state
                .store
                .get(&key)
                .or_else(|| state.degraded.find_value_by_key(&key));
            match value {
                Some(value) => {
                    state
                        .reply(client, Body::GetResponse {
                            success: true,
                            is_degraded: true,
                            key,
                            value,
                        })
                        .await;
                }
                None => reply_failure(&state, client, &DegradedOpKind::Get, key).await,
            }
        }
        DegradedOpKind::Update { value_offset, value } => {
            let Some(meta) = state.store.key_meta(&key) else {
                reply_failure(&state, client, &DegradedOpKind::Update { value_offset, value }, key)
                    .await;
                return;
            };
            let sealed = state.store.is_sealed(meta.pos);
            let updated = state.store.with_resident_chunk(meta.pos, |chunk| {
                chunk.update_value(meta.offset, value_offset, &value)
            });
            let Some(Some((chunk_offset, delta))) = updated else {
                reply_failure(&state, client, &DegradedOpKind::Update { value_offset, value }, key)
                    .await;
                return;
            };
            let update = ChunkUpdate {
                pos: meta.pos,
                offset: chunk_offset,
                length: delta.len() as u32,
                key: key.clone(),
                value_offset,
                is_degraded: true,
            };
            let sent = forward_delta_redirected(
                &state, client, &redirect, update, &delta, sealed, false, &value,
            )
            .await;
            if sent == 0 {
                state
                    .reply(client, Body::UpdateResponse {
                        success: true,
                        is_degraded: true,
                        key,
                        value_offset,
                        length: value.len() as u32,
                    })
                    .await;
            }
        }
        DegradedOpKind::Delete => {
            let Some(meta) = state.store.key_meta(&key) else {
                reply_failure(&state, client, &DegradedOpKind::Delete, key).await;
                return;
            };
            let sealed = state.store.is_sealed(meta.pos);
            let delta = state.store.with_resident_chunk(meta.pos, |chunk| {
                chunk.delete_record(meta.offset, meta.length)
            });
            let Some(delta) = delta else {
                reply_failure(&state, client, &DegradedOpKind::Delete, key).await;
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
                is_degraded: true,
            };
            let sent = forward_delta_redirected(
                &state, client, &redirect, update, &delta, sealed, true, &[],
            )
            .await;
            if sent == 0 {
                state
                    .reply(client, Body::DeleteResponse { success: true, is_degraded: true, key })
                    .await;
            }
        }
    }
}

async fn reply_failure(
    state: &Arc<ServerState>,
    client: PendingId,
    kind: &DegradedOpKind,
    key: Vec<u8>,
) {
    let body = match kind {
        DegradedOpKind::Get => {
            Body::GetResponse { success: false, is_degraded: true, key, value: Vec::new() }
        }
        DegradedOpKind::Update { value_offset, value } => Body::UpdateResponse {
            success: false,
            is_degraded: true,
            key,
            value_offset: *value_offset,
            length: value.len() as u32,
        },
        DegradedOpKind::Delete => {
            Body::DeleteResponse { success: false, is_degraded: true, key }
        }
    };
    state.reply(client, body).await;
}

/// Abort one sealed reconstruction round: drop the marker, drain and fail
/// every parked waiter, and discard outstanding chunk requests.
async fn fail_round(
    state: &Arc<ServerState>,
    list_id: u32,
    stripe_id: u32,
    op_id: PendingId,
    permanent: bool,
) {
    let _ = permanent;
    state.pending.peer_get_chunk.erase_all(op_id.instance_id, op_id.request_id);
    let waiters = state.degraded.complete_chunk_reconstruction(list_id, stripe_id, false);
    for waiter in waiters {
        let Some((_, parked)) = state.pending.degraded_ops.erase_quiet(waiter.id) else {
            continue;
        };
        reply_failure(state, parked.client, &parked.kind, parked.key).await;
    }
}

/// Reconstruction joins must not park forever: after the timeout the round
/// is failed and every waiter gets an explicit failure response. A late
/// peer response after this point hits the tracker's "no pending entry"
/// path and is dropped.
fn spawn_chunk_timeout(state: Arc<ServerState>, list_id: u32, stripe_id: u32, op_id: PendingId) {
    tokio::spawn(async move {
        tokio::time::sleep(state.tuning.degraded_timeout).await;
        let waiters = state.degraded.complete_chunk_reconstruction(list_id, stripe_id, false);
        if waiters.is_empty() {
            return;
        }
        tracing::warn!(list_id, stripe_id, "degraded reconstruction timed out");
        state.pending.peer_get_chunk.erase_all(op_id.instance_id, op_id.request_id);
        for waiter in waiters {
            let Some((_, parked)) = state.pending.degraded_ops.erase_quiet(waiter.id) else {
                continue;
            };
            reply_failure(&state, parked.client, &parked.kind, parked.key).await;
        }
    });
}

fn spawn_key_timeout(state: Arc<ServerState>, key: Vec<u8>, op_id: PendingId) {
    tokio::spawn(async move {
        tokio::time::sleep(state.tuning.degraded_timeout).await;
        let waiters = state.degraded.complete_key_reconstruction(&key, false);
        if waiters.is_empty() {
            return;
        }
        tracing::warn!(key = ?String::from_utf8_lossy(&key), "unsealed recovery timed out");
        state.pending.peer_unsealed_get.erase_all(op_id.instance_id, op_id.request_id);
        for waiter in waiters {
            let Some((_, parked)) = state.pending.degraded_ops.erase_quiet(waiter.id) else {
                continue;
            };
            reply_failure(&state, parked.client, &parked.kind, parked.key).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::RemapPair;

    fn redirect_with(dead: &[(u32, u32)], surviving: Vec<u32>) -> RedirectSet {
        RedirectSet {
            pairs: dead
                .iter()
                .map(|(src, dst)| RemapPair {
                    original_list: 3,
                    original_chunk: *src,
                    redirected_list: 3,
                    redirected_chunk: *dst,
                })
                .collect(),
            ongoing_at_chunk: dead.first().map(|(_, d)| *d).unwrap_or(0),
            surviving_chunk_ids: surviving,
        }
    }

    #[test]
    fn selects_exactly_k_survivors_with_rotated_start() {
        // Stripe (list=3, stripe=7) with k=4, m=2; chunk 1 is dead and its
        // five peers survive. Exactly four of the five are fetched,
        // starting at request_id % m into the surviving list.
        let redirect = redirect_with(&[(1, 5)], vec![0, 2, 3, 4, 5]);

        let selected = select_survivors(4, 2, 10, &redirect);
        assert_eq!(selected.len(), 4);
        // request_id 10, m = 2: rotation 0, so the first four survivors.
        assert_eq!(selected, vec![0, 2, 3, 4]);

        let rotated = select_survivors(4, 2, 11, &redirect);
        assert_eq!(rotated, vec![2, 3, 4, 5]);

        // The dead chunk is never fetched.
        for selection in [&selected, &rotated] {
            assert!(!selection.contains(&1));
        }
    }

    #[test]
    fn redirected_survivor_entries_are_skipped() {
        // Chunk 5 is listed as surviving but is itself a redirect source;
        // the selection must not fetch it.
        let redirect = redirect_with(&[(1, 4), (5, 2)], vec![0, 2, 3, 4, 5]);
        let selected = select_survivors(4, 2, 0, &redirect);
        assert_eq!(selected, vec![0, 2, 3, 4]);
    }

    #[test]
    fn too_few_survivors_yields_short_selection() {
        let redirect = redirect_with(&[(0, 4), (1, 5)], vec![2, 3]);
        let selected = select_survivors(4, 2, 0, &redirect);
        assert!(selected.len() < 4);
    }
}
