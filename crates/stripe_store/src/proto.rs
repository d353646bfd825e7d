//! Wire protocol: frame layout, message bodies, and the codec used with
//! `tokio_util::codec::Framed`.
//!
//! Frame layout: `magic: u16 | opcode: u8 | instance_id: u16 | request_id:
//! u32 | body_len: u32 | body_crc: u32 | body`. A frame that fails the magic
//! or CRC check, or carries an unknown opcode, is logged and skipped without
//! touching any node state; the connection stays up.

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::metadata::{ChunkPos, RedirectSet, RemapPair};

pub const MAGIC: u16 = 0xECA7;
pub const HEADER_SIZE: usize = 2 + 1 + 2 + 4 + 4 + 4;
/// Upper bound on one frame's body; batched messages split below this.
pub const MAX_BODY: usize = 8 << 20;
/// Entries per batched release/reconstruction frame before continuation.
pub const BATCH_LIMIT: usize = 1024;

/// Node role, exchanged during registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Client,
    Server,
    Backup,
}

impl NodeRole {
    fn to_u8(self) -> u8 {
        match self {
            NodeRole::Client => 0,
            NodeRole::Server => 1,
            NodeRole::Backup => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(NodeRole::Client),
            1 => Ok(NodeRole::Server),
            2 => Ok(NodeRole::Backup),
            other => bail!("invalid node role {other}"),
        }
    }
}

/// Outcome of a degraded-lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Lock granted to this caller; reconstruction may start.
    Granted,
    /// Already locked with a compatible assignment; reuse it.
    AlreadyLocked,
    /// Key is served by a remapped chunk; retry against that mapping.
    Remapped,
    /// No lock needed or lock refused; use the normal path.
    NotNeeded,
    /// Key does not exist on the addressed stripe.
    NotExist,
}

impl LockOutcome {
    fn to_u8(self) -> u8 {
        match self {
            LockOutcome::Granted => 0,
            LockOutcome::AlreadyLocked => 1,
            LockOutcome::Remapped => 2,
            LockOutcome::NotNeeded => 3,
            LockOutcome::NotExist => 4,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(LockOutcome::Granted),
            1 => Ok(LockOutcome::AlreadyLocked),
            2 => Ok(LockOutcome::Remapped),
            3 => Ok(LockOutcome::NotNeeded),
            4 => Ok(LockOutcome::NotExist),
            other => bail!("invalid lock outcome {other}"),
        }
    }
}

/// Which client-facing operation a forwarded key-value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOp {
    Get,
    Update,
    Delete,
}

impl ForwardOp {
    fn to_u8(self) -> u8 {
        match self {
            ForwardOp::Get => 0,
            ForwardOp::Update => 1,
            ForwardOp::Delete => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ForwardOp::Get),
            1 => Ok(ForwardOp::Update),
            2 => Ok(ForwardOp::Delete),
            other => bail!("invalid forward op {other}"),
        }
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub instance_id: u16,
    pub request_id: u32,
    pub body: Body,
}

impl Frame {
    pub fn new(instance_id: u16, request_id: u32, body: Body) -> Self {
        Self { instance_id, request_id, body }
    }
}

/// Every message body, exhaustive per direction. Success/failure always
/// travels as an explicit response variant field, never as a dropped
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    // Registration handshake.
    Register { role: NodeRole, listen_addr: String },
    RegisterResponse { success: bool, instance_id: u16 },

    // Normal path (client -> server).
    Set { key: Vec<u8>, value: Vec<u8> },
    SetResponse { success: bool, key: Vec<u8>, pos: ChunkPos },
    Get { key: Vec<u8> },
    GetResponse { success: bool, is_degraded: bool, key: Vec<u8>, value: Vec<u8> },
    Update { key: Vec<u8>, value_offset: u32, value: Vec<u8> },
    UpdateResponse { success: bool, is_degraded: bool, key: Vec<u8>, value_offset: u32, length: u32 },
    Delete { key: Vec<u8> },
    DeleteResponse { success: bool, is_degraded: bool, key: Vec<u8> },

    // Degraded path (client -> server).
    DegradedGet { key: Vec<u8>, stripe_id: u32, is_sealed: bool, redirect: RedirectSet },
    DegradedUpdate {
        key: Vec<u8>,
        value_offset: u32,
        value: Vec<u8>,
        stripe_id: u32,
        is_sealed: bool,
        redirect: RedirectSet,
    },
    DegradedDelete { key: Vec<u8>, stripe_id: u32, is_sealed: bool, redirect: RedirectSet },

    // Degraded lock (client -> coordinator -> client).
    DegradedLock { key: Vec<u8>, redirect: RedirectSet },
    DegradedLockResponse {
        outcome: LockOutcome,
        key: Vec<u8>,
        is_sealed: bool,
        stripe_id: u32,
        src_chunk_id: u32,
        redirect: RedirectSet,
    },

    // Lock release (coordinator -> server -> coordinator).
    ReleaseDegradedLocks { positions: Vec<ChunkPos>, is_completed: bool },
    ReleaseDegradedLocksResponse { count: u32 },

    // Chunk exchange between server peers.
    GetChunk { pos: ChunkPos },
    GetChunkResponse {
        success: bool,
        pos: ChunkPos,
        /// Declared size; zero means the chunk is unsealed on that peer.
        size: u32,
        /// Parity peers report which data chunks they saw sealed.
        seal_indicator: Vec<bool>,
        data: Vec<u8>,
    },
    SetChunk { pos: ChunkPos, sealed: Option<Vec<u8>>, unsealed: Vec<(Vec<u8>, Vec<u8>)> },
    SetChunkResponse { success: bool, pos: ChunkPos },

    // Unsealed key-value fetch from a parity peer.
    UnsealedGet { list_id: u32, chunk_id: u32, key: Vec<u8> },
    UnsealedGetResponse { success: bool, key: Vec<u8>, value: Vec<u8> },

    // Reconstructed data pushed to a redirect destination.
    ForwardKey {
        op: ForwardOp,
        pos: ChunkPos,
        key: Vec<u8>,
        value: Vec<u8>,
        update: Option<(u32, Vec<u8>)>,
    },
    ForwardKeyResponse { success: bool, pos: ChunkPos, key: Vec<u8> },
    ForwardChunk { pos: ChunkPos, is_parity: bool, data: Vec<u8> },
    ForwardChunkResponse { success: bool, pos: ChunkPos },

    // Parity delta application on peers. `pos` names the mutated data
    // chunk; `target_chunk_id` names the parity chunk the receiver holds
    // (it may be a redirect destination rather than the natural owner).
    UpdateChunk { pos: ChunkPos, target_chunk_id: u32, offset: u32, delta: Vec<u8> },
    UpdateChunkResponse { success: bool, pos: ChunkPos, offset: u32 },
    DeleteChunk { pos: ChunkPos, target_chunk_id: u32, offset: u32, delta: Vec<u8> },
    DeleteChunkResponse { success: bool, pos: ChunkPos, offset: u32 },

    // Seal notification (data server -> parity peers).
    SealChunk { pos: ChunkPos, data: Vec<u8> },
    SealChunkResponse { success: bool, pos: ChunkPos },

    // Recovery orchestration (coordinator <-> servers).
    ServerReconstructed { src_addr: String, dst_addr: String },
    ServerReconstructedResponse { success: bool },
    BackupServerPromoted {
        src_addr: String,
        chunks: Vec<ChunkPos>,
        keys: Vec<Vec<u8>>,
        is_completed: bool,
    },
    BackupServerPromotedResponse { chunk_count: u32, key_count: u32 },
    Reconstruction { list_id: u32, chunk_id: u32, stripe_ids: Vec<u32>, is_completed: bool },
    ReconstructionResponse { success: bool, list_id: u32, chunk_id: u32, num_stripes: u32 },
    ReconstructionUnsealed { list_id: u32, chunk_id: u32, keys: Vec<Vec<u8>>, is_completed: bool },
    ReconstructionUnsealedResponse { success: bool, list_id: u32, chunk_id: u32, num_keys: u32 },

    // Periodic server -> coordinator metadata sync (sealed chunks and key
    // ownership), unacknowledged.
    SyncMetadata {
        sealed: Vec<ChunkPos>,
        set_keys: Vec<(Vec<u8>, ChunkPos)>,
        del_keys: Vec<Vec<u8>>,
    },
}

impl Body {
    pub fn opcode(&self) -> u8 {
        match self {
            Body::Register { .. } => 0x01,
            Body::RegisterResponse { .. } => 0x02,
            Body::Set { .. } => 0x10,
            Body::SetResponse { .. } => 0x11,
            Body::Get { .. } => 0x12,
            Body::GetResponse { .. } => 0x13,
            Body::Update { .. } => 0x14,
            Body::UpdateResponse { .. } => 0x15,
            Body::Delete { .. } => 0x16,
            Body::DeleteResponse { .. } => 0x17,
            Body::DegradedGet { .. } => 0x20,
            Body::DegradedUpdate { .. } => 0x21,
            Body::DegradedDelete { .. } => 0x22,
            Body::DegradedLock { .. } => 0x23,
            Body::DegradedLockResponse { .. } => 0x24,
            Body::ReleaseDegradedLocks { .. } => 0x25,
            Body::ReleaseDegradedLocksResponse { .. } => 0x26,
            Body::GetChunk { .. } => 0x30,
            Body::GetChunkResponse { .. } => 0x31,
            Body::SetChunk { .. } => 0x32,
            Body::SetChunkResponse { .. } => 0x33,
            Body::UnsealedGet { .. } => 0x34,
            Body::UnsealedGetResponse { .. } => 0x35,
            Body::ForwardKey { .. } => 0x36,
            Body::ForwardKeyResponse { .. } => 0x37,
            Body::ForwardChunk { .. } => 0x38,
            Body::ForwardChunkResponse { .. } => 0x39,
            Body::UpdateChunk { .. } => 0x3A,
            Body::UpdateChunkResponse { .. } => 0x3B,
            Body::DeleteChunk { .. } => 0x3C,
            Body::DeleteChunkResponse { .. } => 0x3D,
            Body::SealChunk { .. } => 0x3E,
            Body::SealChunkResponse { .. } => 0x3F,
            Body::ServerReconstructed { .. } => 0x40,
            Body::ServerReconstructedResponse { .. } => 0x41,
            Body::BackupServerPromoted { .. } => 0x42,
            Body::BackupServerPromotedResponse { .. } => 0x43,
            Body::Reconstruction { .. } => 0x44,
            Body::ReconstructionResponse { .. } => 0x45,
            Body::ReconstructionUnsealed { .. } => 0x46,
            Body::ReconstructionUnsealedResponse { .. } => 0x47,
            Body::SyncMetadata { .. } => 0x48,
        }
    }
}

fn put_bool(dst: &mut BytesMut, v: bool) {
    dst.put_u8(u8::from(v));
}

fn get_bool(src: &mut impl Buf) -> Result<bool> {
    ensure_remaining(src, 1)?;
    Ok(src.get_u8() != 0)
}

fn put_key(dst: &mut BytesMut, key: &[u8]) {
    debug_assert!(key.len() <= u8::MAX as usize);
    dst.put_u8(key.len() as u8);
    dst.put_slice(key);
}

fn get_key(src: &mut impl Buf) -> Result<Vec<u8>> {
    ensure_remaining(src, 1)?;
    let len = src.get_u8() as usize;
    ensure_remaining(src, len)?;
    let mut key = vec![0u8; len];
    src.copy_to_slice(&mut key);
    Ok(key)
}

fn put_blob(dst: &mut BytesMut, bytes: &[u8]) {
    dst.put_u32(bytes.len() as u32);
    dst.put_slice(bytes);
}

fn get_blob(src: &mut impl Buf) -> Result<Vec<u8>> {
    ensure_remaining(src, 4)?;
    let len = src.get_u32() as usize;
    if len > MAX_BODY {
        bail!("blob length {len} exceeds frame limit");
    }
    ensure_remaining(src, len)?;
    let mut bytes = vec![0u8; len];
    src.copy_to_slice(&mut bytes);
    Ok(bytes)
}

fn put_str(dst: &mut BytesMut, s: &str) {
    put_blob(dst, s.as_bytes());
}

fn get_str(src: &mut impl Buf) -> Result<String> {
    let bytes = get_blob(src)?;
    String::from_utf8(bytes).map_err(|_| anyhow::anyhow!("invalid utf-8 string field"))
}

fn put_pos(dst: &mut BytesMut, pos: &ChunkPos) {
    dst.put_u32(pos.list_id);
    dst.put_u32(pos.stripe_id);
    dst.put_u32(pos.chunk_id);
}

fn get_pos(src: &mut impl Buf) -> Result<ChunkPos> {
    ensure_remaining(src, 12)?;
    Ok(ChunkPos::new(src.get_u32(), src.get_u32(), src.get_u32()))
}

fn put_redirect(dst: &mut BytesMut, set: &RedirectSet) {
    dst.put_u32(set.pairs.len() as u32);
    for p in &set.pairs {
        dst.put_u32(p.original_list);
        dst.put_u32(p.original_chunk);
        dst.put_u32(p.redirected_list);
        dst.put_u32(p.redirected_chunk);
    }
    dst.put_u32(set.ongoing_at_chunk);
    dst.put_u32(set.surviving_chunk_ids.len() as u32);
    for id in &set.surviving_chunk_ids {
        dst.put_u32(*id);
    }
}

fn get_redirect(src: &mut impl Buf) -> Result<RedirectSet> {
    ensure_remaining(src, 4)?;
    let count = src.get_u32() as usize;
    if count > 4096 {
        bail!("redirect count {count} is implausible");
    }
    let mut pairs = Vec::with_capacity(count);
    for _ in 0..count {
        ensure_remaining(src, 16)?;
        pairs.push(RemapPair {
            original_list: src.get_u32(),
            original_chunk: src.get_u32(),
            redirected_list: src.get_u32(),
            redirected_chunk: src.get_u32(),
        });
    }
    ensure_remaining(src, 8)?;
    let ongoing_at_chunk = src.get_u32();
    let surviving = src.get_u32() as usize;
    if surviving > 4096 {
        bail!("surviving chunk count {surviving} is implausible");
    }
    let mut surviving_chunk_ids = Vec::with_capacity(surviving);
    for _ in 0..surviving {
        ensure_remaining(src, 4)?;
        surviving_chunk_ids.push(src.get_u32());
    }
    Ok(RedirectSet { pairs, ongoing_at_chunk, surviving_chunk_ids })
}

fn put_bools(dst: &mut BytesMut, bits: &[bool]) {
    dst.put_u16(bits.len() as u16);
    for b in bits {
        dst.put_u8(u8::from(*b));
    }
}

fn get_bools(src: &mut impl Buf) -> Result<Vec<bool>> {
    ensure_remaining(src, 2)?;
    let len = src.get_u16() as usize;
    ensure_remaining(src, len)?;
    Ok((0..len).map(|_| src.get_u8() != 0).collect())
}

fn ensure_remaining(src: &impl Buf, need: usize) -> Result<()> {
    if src.remaining() < need {
        bail!("truncated frame body: need {need} more bytes, have {}", src.remaining());
    }
    Ok(())
}

impl Body {
    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Body::Register { role, listen_addr } => {
                dst.put_u8(role.to_u8());
                put_str(dst, listen_addr);
            }
            Body::RegisterResponse { success, instance_id } => {
                put_bool(dst, *success);
                dst.put_u16(*instance_id);
            }
            Body::Set { key, value } => {
                put_key(dst, key);
                put_blob(dst, value);
            }
            Body::SetResponse { success, key, pos } => {
                put_bool(dst, *success);
                put_key(dst, key);
                put_pos(dst, pos);
            }
            Body::Get { key } => put_key(dst, key),
            Body::GetResponse { success, is_degraded, key, value } => {
                put_bool(dst, *success);
                put_bool(dst, *is_degraded);
                put_key(dst, key);
                put_blob(dst, value);
            }
            Body::Update { key, value_offset, value } => {
                put_key(dst, key);
                dst.put_u32(*value_offset);
                put_blob(dst, value);
            }
            Body::UpdateResponse { success, is_degraded, key, value_offset, length } => {
                put_bool(dst, *success);
                put_bool(dst, *is_degraded);
                put_key(dst, key);
                dst.put_u32(*value_offset);
                dst.put_u32(*length);
            }
            Body::Delete { key } => put_key(dst, key),
            Body::DeleteResponse { success, is_degraded, key } => {
                put_bool(dst, *success);
                put_bool(dst, *is_degraded);
                put_key(dst, key);
            }
            Body::DegradedGet { key, stripe_id, is_sealed, redirect } => {
                put_key(dst, key);
                dst.put_u32(*stripe_id);
                put_bool(dst, *is_sealed);
                put_redirect(dst, redirect);
            }
            Body::DegradedUpdate { key, value_offset, value, stripe_id, is_sealed, redirect } => {
                put_key(dst, key);
                dst.put_u32(*value_offset);
                put_blob(dst, value);
                dst.put_u32(*stripe_id);
                put_bool(dst, *is_sealed);
                put_redirect(dst, redirect);
            }
            Body::DegradedDelete { key, stripe_id, is_sealed, redirect } => {
                put_key(dst, key);
                dst.put_u32(*stripe_id);
                put_bool(dst, *is_sealed);
                put_redirect(dst, redirect);
            }
            Body::DegradedLock { key, redirect } => {
                put_key(dst, key);
                put_redirect(dst, redirect);
            }
            Body::DegradedLockResponse { outcome, key, is_sealed, stripe_id, src_chunk_id, redirect } => {
                dst.put_u8(outcome.to_u8());
                put_key(dst, key);
                put_bool(dst, *is_sealed);
                dst.put_u32(*stripe_id);
                dst.put_u32(*src_chunk_id);
                put_redirect(dst, redirect);
            }
            Body::ReleaseDegradedLocks { positions, is_completed } => {
                put_bool(dst, *is_completed);
                dst.put_u32(positions.len() as u32);
                for pos in positions {
                    put_pos(dst, pos);
                }
            }
            Body::ReleaseDegradedLocksResponse { count } => dst.put_u32(*count),
            Body::GetChunk { pos } => put_pos(dst, pos),
            Body::GetChunkResponse { success, pos, size, seal_indicator, data } => {
                put_bool(dst, *success);
                put_pos(dst, pos);
                dst.put_u32(*size);
                put_bools(dst, seal_indicator);
                put_blob(dst, data);
            }
            Body::SetChunk { pos, sealed, unsealed } => {
                put_pos(dst, pos);
                match sealed {
                    Some(data) => {
                        put_bool(dst, true);
                        put_blob(dst, data);
                    }
                    None => put_bool(dst, false),
                }
                dst.put_u32(unsealed.len() as u32);
                for (key, value) in unsealed {
                    put_key(dst, key);
                    put_blob(dst, value);
                }
            }
            Body::SetChunkResponse { success, pos } => {
                put_bool(dst, *success);
                put_pos(dst, pos);
            }
            Body::UnsealedGet { list_id, chunk_id, key } => {
                dst.put_u32(*list_id);
                dst.put_u32(*chunk_id);
                put_key(dst, key);
            }
            Body::UnsealedGetResponse { success, key, value } => {
                put_bool(dst, *success);
                put_key(dst, key);
                put_blob(dst, value);
            }
            Body::ForwardKey { op, pos, key, value, update } => {
                dst.put_u8(op.to_u8());
                put_pos(dst, pos);
                put_key(dst, key);
                put_blob(dst, value);
                match update {
                    Some((offset, bytes)) => {
                        put_bool(dst, true);
                        dst.put_u32(*offset);
                        put_blob(dst, bytes);
                    }
                    None => put_bool(dst, false),
                }
            }
            Body::ForwardKeyResponse { success, pos, key } => {
                put_bool(dst, *success);
                put_pos(dst, pos);
                put_key(dst, key);
            }
            Body::ForwardChunk { pos, is_parity, data } => {
                put_pos(dst, pos);
                put_bool(dst, *is_parity);
                put_blob(dst, data);
            }
            Body::ForwardChunkResponse { success, pos } => {
                put_bool(dst, *success);
                put_pos(dst, pos);
            }
            Body::UpdateChunk { pos, target_chunk_id, offset, delta }
            | Body::DeleteChunk { pos, target_chunk_id, offset, delta } => {
                put_pos(dst, pos);
                dst.put_u32(*target_chunk_id);
                dst.put_u32(*offset);
                put_blob(dst, delta);
            }
            Body::UpdateChunkResponse { success, pos, offset }
            | Body::DeleteChunkResponse { success, pos, offset } => {
                put_bool(dst, *success);
                put_pos(dst, pos);
                dst.put_u32(*offset);
            }
            Body::SealChunk { pos, data } => {
                put_pos(dst, pos);
                put_blob(dst, data);
            }
            Body::SealChunkResponse { success, pos } => {
                put_bool(dst, *success);
                put_pos(dst, pos);
            }
            Body::ServerReconstructed { src_addr, dst_addr } => {
                put_str(dst, src_addr);
                put_str(dst, dst_addr);
            }
            Body::ServerReconstructedResponse { success } => put_bool(dst, *success),
            Body::BackupServerPromoted { src_addr, chunks, keys, is_completed } => {
                put_str(dst, src_addr);
                put_bool(dst, *is_completed);
                dst.put_u32(chunks.len() as u32);
                for pos in chunks {
                    put_pos(dst, pos);
                }
                dst.put_u32(keys.len() as u32);
                for key in keys {
                    put_key(dst, key);
                }
            }
            Body::BackupServerPromotedResponse { chunk_count, key_count } => {
                dst.put_u32(*chunk_count);
                dst.put_u32(*key_count);
            }
            Body::Reconstruction { list_id, chunk_id, stripe_ids, is_completed } => {
                dst.put_u32(*list_id);
                dst.put_u32(*chunk_id);
                put_bool(dst, *is_completed);
                dst.put_u32(stripe_ids.len() as u32);
                for id in stripe_ids {
                    dst.put_u32(*id);
                }
            }
            Body::ReconstructionResponse { success, list_id, chunk_id, num_stripes } => {
                put_bool(dst, *success);
                dst.put_u32(*list_id);
                dst.put_u32(*chunk_id);
                dst.put_u32(*num_stripes);
            }
            Body::ReconstructionUnsealed { list_id, chunk_id, keys, is_completed } => {
                dst.put_u32(*list_id);
                dst.put_u32(*chunk_id);
                put_bool(dst, *is_completed);
                dst.put_u32(keys.len() as u32);
                for key in keys {
                    put_key(dst, key);
                }
            }
            Body::ReconstructionUnsealedResponse { success, list_id, chunk_id, num_keys } => {
                put_bool(dst, *success);
                dst.put_u32(*list_id);
                dst.put_u32(*chunk_id);
                dst.put_u32(*num_keys);
            }
            Body::SyncMetadata { sealed, set_keys, del_keys } => {
                dst.put_u32(sealed.len() as u32);
                for pos in sealed {
                    put_pos(dst, pos);
                }
                dst.put_u32(set_keys.len() as u32);
                for (key, pos) in set_keys {
                    put_key(dst, key);
                    put_pos(dst, pos);
                }
                dst.put_u32(del_keys.len() as u32);
                for key in del_keys {
                    put_key(dst, key);
                }
            }
        }
    }

    fn decode(opcode: u8, src: &mut impl Buf) -> Result<Body> {
        let body = match opcode {
            0x01 => Body::Register {
                role: {
                    ensure_remaining(src, 1)?;
                    NodeRole::from_u8(src.get_u8())?
                },
                listen_addr: get_str(src)?,
            },
            0x02 => Body::RegisterResponse {
                success: get_bool(src)?,
                instance_id: {
                    ensure_remaining(src, 2)?;
                    src.get_u16()
                },
            },
            0x10 => Body::Set { key: get_key(src)?, value: get_blob(src)? },
            0x11 => Body::SetResponse {
                success: get_bool(src)?,
                key: get_key(src)?,
                pos: get_pos(src)?,
            },
            0x12 => Body::Get { key: get_key(src)? },
            0x13 => Body::GetResponse {
                success: get_bool(src)?,
                is_degraded: get_bool(src)?,
                key: get_key(src)?,
                value: get_blob(src)?,
            },
            0x14 => Body::Update {
                key: get_key(src)?,
                value_offset: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                value: get_blob(src)?,
            },
            0x15 => Body::UpdateResponse {
                success: get_bool(src)?,
                is_degraded: get_bool(src)?,
                key: get_key(src)?,
                value_offset: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                length: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
            },
            0x16 => Body::Delete { key: get_key(src)? },
            0x17 => Body::DeleteResponse {
                success: get_bool(src)?,
                is_degraded: get_bool(src)?,
                key: get_key(src)?,
            },
            0x20 => Body::DegradedGet {
                key: get_key(src)?,
                stripe_id: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                is_sealed: get_bool(src)?,
                redirect: get_redirect(src)?,
            },
            0x21 => Body::DegradedUpdate {
                key: get_key(src)?,
                value_offset: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                value: get_blob(src)?,
                stripe_id: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                is_sealed: get_bool(src)?,
                redirect: get_redirect(src)?,
            },
            0x22 => Body::DegradedDelete {
                key: get_key(src)?,
                stripe_id: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                is_sealed: get_bool(src)?,
                redirect: get_redirect(src)?,
            },
            0x23 => Body::DegradedLock { key: get_key(src)?, redirect: get_redirect(src)? },
            0x24 => Body::DegradedLockResponse {
                outcome: {
                    ensure_remaining(src, 1)?;
                    LockOutcome::from_u8(src.get_u8())?
                },
                key: get_key(src)?,
                is_sealed: get_bool(src)?,
                stripe_id: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                src_chunk_id: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                redirect: get_redirect(src)?,
            },
            0x25 => {
                let is_completed = get_bool(src)?;
                ensure_remaining(src, 4)?;
                let count = src.get_u32() as usize;
                let mut positions = Vec::with_capacity(count.min(BATCH_LIMIT));
                for _ in 0..count {
                    positions.push(get_pos(src)?);
                }
                Body::ReleaseDegradedLocks { positions, is_completed }
            }
            0x26 => Body::ReleaseDegradedLocksResponse {
                count: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
            },
            0x30 => Body::GetChunk { pos: get_pos(src)? },
            0x31 => Body::GetChunkResponse {
                success: get_bool(src)?,
                pos: get_pos(src)?,
                size: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                seal_indicator: get_bools(src)?,
                data: get_blob(src)?,
            },
            0x32 => {
                let pos = get_pos(src)?;
                let sealed = if get_bool(src)? { Some(get_blob(src)?) } else { None };
                ensure_remaining(src, 4)?;
                let count = src.get_u32() as usize;
                let mut unsealed = Vec::with_capacity(count.min(BATCH_LIMIT));
                for _ in 0..count {
                    let key = get_key(src)?;
                    let value = get_blob(src)?;
                    unsealed.push((key, value));
                }
                Body::SetChunk { pos, sealed, unsealed }
            }
            0x33 => Body::SetChunkResponse { success: get_bool(src)?, pos: get_pos(src)? },
            0x34 => Body::UnsealedGet {
                list_id: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                chunk_id: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                key: get_key(src)?,
            },
            0x35 => Body::UnsealedGetResponse {
                success: get_bool(src)?,
                key: get_key(src)?,
                value: get_blob(src)?,
            },
            0x36 => {
                let op = {
                    ensure_remaining(src, 1)?;
                    ForwardOp::from_u8(src.get_u8())?
                };
                let pos = get_pos(src)?;
                let key = get_key(src)?;
                let value = get_blob(src)?;
                let update = if get_bool(src)? {
                    ensure_remaining(src, 4)?;
                    let offset = src.get_u32();
                    Some((offset, get_blob(src)?))
                } else {
                    None
                };
                Body::ForwardKey { op, pos, key, value, update }
            }
            0x37 => Body::ForwardKeyResponse {
                success: get_bool(src)?,
                pos: get_pos(src)?,
                key: get_key(src)?,
            },
            0x38 => Body::ForwardChunk {
                pos: get_pos(src)?,
                is_parity: get_bool(src)?,
                data: get_blob(src)?,
            },
            0x39 => Body::ForwardChunkResponse { success: get_bool(src)?, pos: get_pos(src)? },
            0x3A => Body::UpdateChunk {
                pos: get_pos(src)?,
                target_chunk_id: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                offset: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                delta: get_blob(src)?,
            },
            0x3B => Body::UpdateChunkResponse {
                success: get_bool(src)?,
                pos: get_pos(src)?,
                offset: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
            },
            0x3C => Body::DeleteChunk {
                pos: get_pos(src)?,
                target_chunk_id: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                offset: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                delta: get_blob(src)?,
            },
            0x3D => Body::DeleteChunkResponse {
                success: get_bool(src)?,
                pos: get_pos(src)?,
                offset: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
            },
            0x3E => Body::SealChunk { pos: get_pos(src)?, data: get_blob(src)? },
            0x3F => Body::SealChunkResponse { success: get_bool(src)?, pos: get_pos(src)? },
            0x40 => Body::ServerReconstructed {
                src_addr: get_str(src)?,
                dst_addr: get_str(src)?,
            },
            0x41 => Body::ServerReconstructedResponse { success: get_bool(src)? },
            0x42 => {
                let src_addr = get_str(src)?;
                let is_completed = get_bool(src)?;
                ensure_remaining(src, 4)?;
                let chunk_count = src.get_u32() as usize;
                let mut chunks = Vec::with_capacity(chunk_count.min(BATCH_LIMIT));
                for _ in 0..chunk_count {
                    chunks.push(get_pos(src)?);
                }
                ensure_remaining(src, 4)?;
                let key_count = src.get_u32() as usize;
                let mut keys = Vec::with_capacity(key_count.min(BATCH_LIMIT));
                for _ in 0..key_count {
                    keys.push(get_key(src)?);
                }
                Body::BackupServerPromoted { src_addr, chunks, keys, is_completed }
            }
            0x43 => Body::BackupServerPromotedResponse {
                chunk_count: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                key_count: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
            },
            0x44 => {
                ensure_remaining(src, 8)?;
                let list_id = src.get_u32();
                let chunk_id = src.get_u32();
                let is_completed = get_bool(src)?;
                ensure_remaining(src, 4)?;
                let count = src.get_u32() as usize;
                let mut stripe_ids = Vec::with_capacity(count.min(BATCH_LIMIT));
                for _ in 0..count {
                    ensure_remaining(src, 4)?;
                    stripe_ids.push(src.get_u32());
                }
                Body::Reconstruction { list_id, chunk_id, stripe_ids, is_completed }
            }
            0x45 => Body::ReconstructionResponse {
                success: get_bool(src)?,
                list_id: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                chunk_id: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                num_stripes: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
            },
            0x46 => {
                ensure_remaining(src, 8)?;
                let list_id = src.get_u32();
                let chunk_id = src.get_u32();
                let is_completed = get_bool(src)?;
                ensure_remaining(src, 4)?;
                let count = src.get_u32() as usize;
                let mut keys = Vec::with_capacity(count.min(BATCH_LIMIT));
                for _ in 0..count {
                    keys.push(get_key(src)?);
                }
                Body::ReconstructionUnsealed { list_id, chunk_id, keys, is_completed }
            }
            0x47 => Body::ReconstructionUnsealedResponse {
                success: get_bool(src)?,
                list_id: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                chunk_id: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
                num_keys: {
                    ensure_remaining(src, 4)?;
                    src.get_u32()
                },
            },
            0x48 => {
                ensure_remaining(src, 4)?;
                let sealed_count = src.get_u32() as usize;
                let mut sealed = Vec::with_capacity(sealed_count.min(BATCH_LIMIT));
                for _ in 0..sealed_count {
                    sealed.push(get_pos(src)?);
                }
                ensure_remaining(src, 4)?;
                let set_count = src.get_u32() as usize;
                let mut set_keys = Vec::with_capacity(set_count.min(BATCH_LIMIT));
                for _ in 0..set_count {
                    let key = get_key(src)?;
                    let pos = get_pos(src)?;
                    set_keys.push((key, pos));
                }
                ensure_remaining(src, 4)?;
                let del_count = src.get_u32() as usize;
                let mut del_keys = Vec::with_capacity(del_count.min(BATCH_LIMIT));
                for _ in 0..del_count {
                    del_keys.push(get_key(src)?);
                }
                Body::SyncMetadata { sealed, set_keys, del_keys }
            }
            other => bail!("unknown opcode 0x{other:02X}"),
        };
        Ok(body)
    }
}

/// Framed codec: header + CRC-checked body. Malformed frames are skipped
/// with a warning rather than tearing down the connection.
#[derive(Debug, Default)]
pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }
            let mut header = &src[..HEADER_SIZE];
            let magic = header.get_u16();
            if magic != MAGIC {
                bail!("bad magic 0x{magic:04X}; stream is out of sync");
            }
            let opcode = header.get_u8();
            let instance_id = header.get_u16();
            let request_id = header.get_u32();
            let body_len = header.get_u32() as usize;
            let body_crc = header.get_u32();
            if body_len > MAX_BODY {
                bail!("frame body of {body_len} bytes exceeds limit");
            }
            if src.len() < HEADER_SIZE + body_len {
                src.reserve(HEADER_SIZE + body_len - src.len());
                return Ok(None);
            }

            src.advance(HEADER_SIZE);
            let body_bytes = src.split_to(body_len);
            if crc32fast::hash(&body_bytes) != body_crc {
                tracing::warn!(opcode, request_id, "dropping frame with bad checksum");
                continue;
            }
            match Body::decode(opcode, &mut body_bytes.freeze()) {
                Ok(body) => return Ok(Some(Frame { instance_id, request_id, body })),
                Err(err) => {
                    tracing::warn!(opcode, request_id, error = %err, "dropping malformed frame");
                    continue;
                }
            }
        }
    }
}

impl Encoder<Frame> for WireCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::new();
        frame.body.encode(&mut body);
        dst.reserve(HEADER_SIZE + body.len());
        dst.put_u16(MAGIC);
        dst.put_u8(frame.body.opcode());
        dst.put_u16(frame.instance_id);
        dst.put_u32(frame.request_id);
        dst.put_u32(body.len() as u32);
        dst.put_u32(crc32fast::hash(&body));
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(body: Body) -> Body {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(3, 77, body), &mut buf)
            .expect("encode");
        let frame = codec.decode(&mut buf).expect("decode").expect("complete frame");
        assert_eq!(frame.instance_id, 3);
        assert_eq!(frame.request_id, 77);
        assert!(buf.is_empty());
        frame.body
    }

    fn sample_redirect() -> RedirectSet {
        RedirectSet {
            pairs: vec![RemapPair {
                original_list: 3,
                original_chunk: 1,
                redirected_list: 3,
                redirected_chunk: 5,
            }],
            ongoing_at_chunk: 5,
            surviving_chunk_ids: vec![0, 2, 3, 4, 5],
        }
    }

    #[test]
    fn degraded_lock_round_trips() {
        let body = Body::DegradedLockResponse {
            outcome: LockOutcome::AlreadyLocked,
            key: b"foo".to_vec(),
            is_sealed: true,
            stripe_id: 7,
            src_chunk_id: 1,
            redirect: sample_redirect(),
        };
        assert_eq!(round_trip(body.clone()), body);
    }

    #[test]
    fn get_chunk_response_round_trips() {
        let body = Body::GetChunkResponse {
            success: true,
            pos: ChunkPos::new(3, 7, 4),
            size: 64,
            seal_indicator: vec![true, false, true, true],
            data: (0..64u8).collect(),
        };
        assert_eq!(round_trip(body.clone()), body);
    }

    #[test]
    fn release_batch_round_trips() {
        let body = Body::ReleaseDegradedLocks {
            positions: (0..10).map(|i| ChunkPos::new(1, i, 2)).collect(),
            is_completed: false,
        };
        assert_eq!(round_trip(body.clone()), body);
    }

    #[test]
    fn corrupt_body_is_skipped_and_next_frame_survives() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(1, 1, Body::Get { key: b"a".to_vec() }), &mut buf)
            .unwrap();
        let first_len = buf.len();
        codec
            .encode(Frame::new(1, 2, Body::Get { key: b"b".to_vec() }), &mut buf)
            .unwrap();
        // Flip one body byte of the first frame; its CRC no longer matches.
        buf[first_len - 1] ^= 0xFF;

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.request_id, 2);
    }

    #[test]
    fn partial_header_waits_for_more() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(1, 1, Body::Get { key: b"k".to_vec() }), &mut buf)
            .unwrap();
        let mut partial = buf.split_to(5);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }
}
