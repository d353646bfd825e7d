//! Fixed-capacity chunk buffers, the serialized record layout inside them,
//! and the bounded chunk arena.
//!
//! A record is `key_len: u8 | value_len: u24 (big-endian) | key | value`,
//! packed end-to-end from offset 0. A zero key_len and value_len terminates
//! the scan, so bytes beyond the declared size always read as "no record".

use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use crate::metadata::ChunkPos;

/// Bytes of record framing before the key: 1 byte key length + 3 bytes
/// value length.
pub const RECORD_HEADER_SIZE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Clean chunk with no data written.
    Empty,
    /// Holds data not yet sealed into a stripe.
    Dirty,
    /// Sealed and resident.
    Cached,
    /// Known to exist but its bytes must be fetched or rebuilt.
    NeedsLoad,
}

/// One chunk-sized byte buffer plus its stripe assignment.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub status: ChunkStatus,
    pub pos: ChunkPos,
    pub is_parity: bool,
    /// Number of records (data chunks only).
    pub count: u32,
    /// Occupied bytes.
    size: u32,
    data: Vec<u8>,
}

impl Chunk {
    pub fn new(capacity: usize) -> Self {
        Self {
            status: ChunkStatus::Empty,
            pos: ChunkPos::new(0, 0, 0),
            is_parity: false,
            count: 0,
            size: 0,
            data: vec![0u8; capacity],
        }
    }

    pub fn capacity(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Room left for one more record with the given key/value sizes.
    pub fn fits(&self, key_len: usize, value_len: usize) -> bool {
        self.size as usize + RECORD_HEADER_SIZE as usize + key_len + value_len
            <= self.data.len()
    }

    /// Append a record, returning its offset. The caller has checked `fits`.
    pub fn append_record(&mut self, key: &[u8], value: &[u8]) -> u32 {
        let offset = self.size as usize;
        let mut at = offset;
        self.data[at] = key.len() as u8;
        let vlen = (value.len() as u32).to_be_bytes();
        self.data[at + 1..at + 4].copy_from_slice(&vlen[1..4]);
        at += RECORD_HEADER_SIZE as usize;
        self.data[at..at + key.len()].copy_from_slice(key);
        at += key.len();
        self.data[at..at + value.len()].copy_from_slice(value);
        at += value.len();
        self.size = at as u32;
        self.count += 1;
        self.status = ChunkStatus::Dirty;
        offset as u32
    }

    /// Read the record starting at `offset`, if one is framed there.
    pub fn record_at(&self, offset: u32) -> Option<(&[u8], &[u8])> {
        let at = offset as usize;
        if at + RECORD_HEADER_SIZE as usize > self.data.len() {
            return None;
        }
        let key_len = self.data[at] as usize;
        let value_len = u32::from_be_bytes([0, self.data[at + 1], self.data[at + 2], self.data[at + 3]]) as usize;
        if key_len == 0 && value_len == 0 {
            return None;
        }
        let key_start = at + RECORD_HEADER_SIZE as usize;
        let value_start = key_start + key_len;
        let end = value_start + value_len;
        if end > self.data.len() {
            return None;
        }
        Some((&self.data[key_start..value_start], &self.data[value_start..end]))
    }

    /// Walk all records: `(key, offset, total_length)` per record.
    pub fn records(&self) -> Vec<(Vec<u8>, u32, u32)> {
        let mut out = Vec::new();
        let mut offset = 0u32;
        while let Some((key, value)) = self.record_at(offset) {
            let length = RECORD_HEADER_SIZE + key.len() as u32 + value.len() as u32;
            out.push((key.to_vec(), offset, length));
            offset += length;
        }
        out
    }

    /// Overwrite `len` bytes of a record's value in place, returning the XOR
    /// delta (old ^ new) that parity peers must fold in at the same chunk
    /// offset.
    pub fn update_value(&mut self, record_offset: u32, value_offset: u32, new_bytes: &[u8]) -> Option<(u32, Vec<u8>)> {
        let (key, value) = self.record_at(record_offset)?;
        if (value_offset as usize + new_bytes.len()) > value.len() {
            return None;
        }
        let chunk_offset =
            record_offset + RECORD_HEADER_SIZE + key.len() as u32 + value_offset;
        let start = chunk_offset as usize;
        let mut delta = vec![0u8; new_bytes.len()];
        for (i, b) in new_bytes.iter().enumerate() {
            delta[i] = self.data[start + i] ^ b;
            self.data[start + i] = *b;
        }
        self.status = ChunkStatus::Dirty;
        Some((chunk_offset, delta))
    }

    /// Remove the record at `(offset, length)` and compact: trailing records
    /// shift left and the freed tail is zeroed. Returns the XOR delta
    /// covering the modified suffix `[offset, old_size)`, which parity peers
    /// apply at the same offset.
    pub fn delete_record(&mut self, offset: u32, length: u32) -> Vec<u8> {
        let offset = offset as usize;
        let length = length as usize;
        let old_size = self.size as usize;
        let old_suffix = self.data[offset..old_size].to_vec();

        self.data.copy_within(offset + length..old_size, offset);
        self.data[old_size - length..old_size].fill(0);
        self.size = (old_size - length) as u32;
        self.count = self.count.saturating_sub(1);
        self.status = ChunkStatus::Dirty;

        let mut delta = old_suffix;
        for (i, d) in delta.iter_mut().enumerate() {
            *d ^= self.data[offset + i];
        }
        delta
    }

    /// Adopt bytes fetched from a peer (GET_CHUNK response) or produced by
    /// the decoder.
    pub fn load(&mut self, pos: ChunkPos, is_parity: bool, bytes: &[u8]) {
        self.data.fill(0);
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.pos = pos;
        self.is_parity = is_parity;
        self.size = bytes.len() as u32;
        self.status = ChunkStatus::Cached;
        self.count = if is_parity { 0 } else { self.records().len() as u32 };
    }

    /// Recompute `size`/`count` after the decoder wrote raw bytes in place.
    pub fn rescan(&mut self) {
        let mut size = 0u32;
        let mut count = 0u32;
        let mut offset = 0u32;
        while let Some((key, value)) = self.record_at(offset) {
            let length = RECORD_HEADER_SIZE + key.len() as u32 + value.len() as u32;
            offset += length;
            size = offset;
            count += 1;
        }
        self.size = size;
        self.count = count;
    }

    /// Reset to an empty, unassigned buffer.
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.size = 0;
        self.count = 0;
        self.is_parity = false;
        self.status = ChunkStatus::Empty;
        self.pos = ChunkPos::new(0, 0, 0);
    }
}

/// Bounded arena of chunk buffers. `alloc` waits until a slot frees rather
/// than growing, so a flood of reconstructions backpressures instead of
/// exhausting memory.
pub struct ChunkPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    chunk_size: usize,
    free: Mutex<Vec<Chunk>>,
    slots: Semaphore,
}

impl ChunkPool {
    pub fn new(capacity: usize, chunk_size: usize) -> Self {
        let free = (0..capacity).map(|_| Chunk::new(chunk_size)).collect();
        Self {
            inner: Arc::new(PoolInner {
                chunk_size,
                free: Mutex::new(free),
                slots: Semaphore::new(capacity),
            }),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Take a chunk, waiting for a free slot. The chunk returns to the pool
    /// when the guard drops.
    pub async fn alloc(&self) -> PooledChunk {
        let permit = self
            .inner
            .slots
            .acquire()
            .await
            .expect("chunk pool semaphore closed");
        permit.forget();
        let chunk = self
            .inner
            .free
            .lock()
            .expect("chunk pool poisoned")
            .pop()
            .expect("semaphore permit implies a free chunk");
        PooledChunk { chunk: Some(chunk), pool: Arc::clone(&self.inner) }
    }

    /// Non-blocking variant for paths that prefer failure over waiting.
    pub fn try_alloc(&self) -> Option<PooledChunk> {
        let permit = self.inner.slots.try_acquire().ok()?;
        permit.forget();
        let chunk = self
            .inner
            .free
            .lock()
            .expect("chunk pool poisoned")
            .pop()
            .expect("semaphore permit implies a free chunk");
        Some(PooledChunk { chunk: Some(chunk), pool: Arc::clone(&self.inner) })
    }
}

impl Clone for ChunkPool {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

/// RAII guard over a pooled chunk.
pub struct PooledChunk {
    chunk: Option<Chunk>,
    pool: Arc<PoolInner>,
}

impl PooledChunk {
    /// Detach the chunk from the pool, e.g. when it graduates into the
    /// sealed-chunk cache. The pool slot is handed back so the arena stays
    /// at fixed capacity for in-flight work.
    pub fn into_inner(mut self) -> Chunk {
        self.chunk.take().expect("chunk already taken")
    }
}

impl std::ops::Deref for PooledChunk {
    type Target = Chunk;

    fn deref(&self) -> &Chunk {
        self.chunk.as_ref().expect("chunk already taken")
    }
}

impl std::ops::DerefMut for PooledChunk {
    fn deref_mut(&mut self) -> &mut Chunk {
        self.chunk.as_mut().expect("chunk already taken")
    }
}

impl Drop for PooledChunk {
    fn drop(&mut self) {
        match self.chunk.take() {
            Some(mut chunk) => {
                chunk.clear();
                self.pool.free.lock().expect("chunk pool poisoned").push(chunk);
                self.pool.slots.add_permits(1);
            }
            // Detached via into_inner: replace the slot with a fresh buffer.
            None => {
                self.pool
                    .free
                    .lock()
                    .expect("chunk pool poisoned")
                    .push(Chunk::new(self.pool.chunk_size));
                self.pool.slots.add_permits(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_with(records: &[(&[u8], &[u8])]) -> Chunk {
        let mut chunk = Chunk::new(256);
        for (k, v) in records {
            chunk.append_record(k, v);
        }
        chunk
    }

    #[test]
    fn append_and_scan() {
        let chunk = chunk_with(&[(b"foo", b"hello"), (b"barbar", b"x")]);
        let records = chunk.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, b"foo");
        assert_eq!(records[0].1, 0);
        assert_eq!(records[0].2, RECORD_HEADER_SIZE + 3 + 5);
        assert_eq!(records[1].0, b"barbar");
        assert_eq!(records[1].1, records[0].2);
        assert_eq!(chunk.record_at(records[1].1).unwrap().1, b"x");
    }

    #[test]
    fn update_value_yields_xor_delta() {
        let mut chunk = chunk_with(&[(b"k", b"aaaa")]);
        let before = chunk.record_at(0).unwrap().1.to_vec();
        let (chunk_offset, delta) = chunk.update_value(0, 1, b"zz").unwrap();
        assert_eq!(chunk_offset, RECORD_HEADER_SIZE + 1 + 1);
        assert_eq!(chunk.record_at(0).unwrap().1, b"azza");
        // old ^ delta == new
        assert_eq!(before[1] ^ delta[0], b'z');
        assert_eq!(before[2] ^ delta[1], b'z');
    }

    #[test]
    fn update_past_value_end_is_rejected() {
        let mut chunk = chunk_with(&[(b"k", b"aaaa")]);
        assert!(chunk.update_value(0, 3, b"zz").is_none());
    }

    #[test]
    fn delete_compacts_and_delta_covers_suffix() {
        let mut chunk = chunk_with(&[(b"a", b"11"), (b"b", b"2222"), (b"c", b"3")]);
        let records = chunk.records();
        let (offset, length) = (records[1].1, records[1].2);
        let old_size = chunk.size();
        let old_bytes = chunk.data().to_vec();

        let delta = chunk.delete_record(offset, length);

        // Middle record is gone, trailing record moved up.
        let after = chunk.records();
        assert_eq!(after.len(), 2);
        assert_eq!(after[1].0, b"c");
        assert_eq!(after[1].1, offset);
        assert_eq!(chunk.size(), old_size - length);

        // Applying the delta to the old suffix reproduces the new bytes.
        assert_eq!(delta.len() as u32, old_size - offset);
        for (i, d) in delta.iter().enumerate() {
            assert_eq!(old_bytes[offset as usize + i] ^ d, chunk.data()[offset as usize + i]);
        }
    }

    #[test]
    fn rescan_after_raw_load() {
        let source = chunk_with(&[(b"one", b"1"), (b"two", b"22")]);
        let mut target = Chunk::new(256);
        target.data_mut().copy_from_slice(source.data());
        target.rescan();
        assert_eq!(target.size(), source.size());
        assert_eq!(target.count, 2);
    }

    #[tokio::test]
    async fn pool_blocks_at_capacity() {
        let pool = ChunkPool::new(1, 64);
        let held = pool.alloc().await;
        assert!(pool.try_alloc().is_none());
        drop(held);
        assert!(pool.try_alloc().is_some());
    }

    #[tokio::test]
    async fn detached_chunk_frees_its_slot() {
        let pool = ChunkPool::new(1, 64);
        let taken = pool.alloc().await;
        let _chunk = taken.into_inner();
        // into_inner consumed the guard, so its slot came back immediately.
        assert!(pool.try_alloc().is_some());
    }
}
