//! Erasure coding capability for stripestore.
//!
//! A stripe is `k` data chunks plus `m` parity chunks, each `chunk_size`
//! bytes. All schemes implemented here are linear over GF(2^8), which the
//! degraded-update path relies on: the parity effect of a data-chunk delta
//! can be computed by encoding a zero stripe carrying only the delta.

use anyhow::{bail, Result};

mod raid;
mod rs;

pub use raid::{Raid0, Raid1, Raid5};
pub use rs::ReedSolomonCoding;

/// Supported coding schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Raid0,
    Raid1,
    Raid5,
    Rs,
}

impl std::str::FromStr for Scheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raid0" => Ok(Scheme::Raid0),
            "raid1" => Ok(Scheme::Raid1),
            "raid5" => Ok(Scheme::Raid5),
            "rs" => Ok(Scheme::Rs),
            other => bail!("unknown coding scheme: {other}"),
        }
    }
}

/// Construct a coding instance for the given scheme and stripe geometry.
pub fn instantiate(scheme: Scheme, k: usize, m: usize, chunk_size: usize) -> Result<Box<dyn Coding>> {
    match scheme {
        Scheme::Raid0 => Ok(Box::new(Raid0::new(k, chunk_size)?)),
        Scheme::Raid1 => Ok(Box::new(Raid1::new(k, m, chunk_size)?)),
        Scheme::Raid5 => Ok(Box::new(Raid5::new(k, m, chunk_size)?)),
        Scheme::Rs => Ok(Box::new(ReedSolomonCoding::new(k, m, chunk_size)?)),
    }
}

/// XOR `src` into `dst` in place. Lengths must match.
pub fn bitwise_xor(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    // Chunked to let the compiler vectorize the common whole-word prefix.
    let (dst_words, dst_tail) = dst.split_at_mut(src.len() / 8 * 8);
    let (src_words, src_tail) = src.split_at(src.len() / 8 * 8);
    for (d, s) in dst_words.chunks_exact_mut(8).zip(src_words.chunks_exact(8)) {
        let x = u64::from_ne_bytes(d.try_into().unwrap()) ^ u64::from_ne_bytes(s.try_into().unwrap());
        d.copy_from_slice(&x.to_ne_bytes());
    }
    for (d, s) in dst_tail.iter_mut().zip(src_tail) {
        *d ^= s;
    }
}

/// An all-zero chunk buffer. Stands in for chunks with no written data and
/// for bytes beyond a chunk's declared length.
pub fn zeros(chunk_size: usize) -> Vec<u8> {
    vec![0u8; chunk_size]
}

/// One erasure-coding scheme bound to a `(k, m, chunk_size)` geometry.
pub trait Coding: Send + Sync {
    fn k(&self) -> usize;
    fn m(&self) -> usize;
    fn chunk_size(&self) -> usize;

    /// Generate the `parity_index`-th parity chunk (0-based within the
    /// parity range) from the `k` data chunks.
    fn encode(&self, data: &[Vec<u8>], parity_index: usize, parity: &mut [u8]) -> Result<()>;

    /// Rebuild the missing entries of a full stripe in place. `chunks` has
    /// `k + m` entries; `present[i]` tells whether `chunks[i]` holds live
    /// bytes. On success every rebuilt entry contains the original bytes.
    fn decode(&self, chunks: &mut [Vec<u8>], present: &[bool]) -> Result<()>;

    /// Parity effect of a data-chunk delta: the bytes to XOR into parity
    /// chunk `parity_index` at the same offset where `delta` was XORed into
    /// data chunk `data_index`. Valid for any linear scheme, which is all of
    /// them here.
    fn parity_delta(&self, data_index: usize, parity_index: usize, delta: &[u8]) -> Result<Vec<u8>> {
        let mut stripe = vec![vec![0u8; delta.len()]; self.k()];
        stripe[data_index].copy_from_slice(delta);
        let mut out = vec![0u8; delta.len()];
        self.encode_prefix(&stripe, parity_index, &mut out)?;
        Ok(out)
    }

    /// Like `encode`, but over data buffers that may be shorter than
    /// `chunk_size` (used for delta computation). Default delegates to
    /// `encode` for schemes whose arithmetic is length-agnostic.
    fn encode_prefix(&self, data: &[Vec<u8>], parity_index: usize, parity: &mut [u8]) -> Result<()> {
        self.encode(data, parity_index, parity)
    }

    /// Resolve seal-status disagreement between surviving parity chunks
    /// before decoding.
    ///
    /// `seen[j][i]` is parity `j`'s belief about whether data chunk `i` was
    /// sealed when the parity was produced; `sealed[i]` is the authoritative
    /// status (a data chunk is sealed if any survivor saw it sealed). A
    /// parity that has not yet folded in a sealed data chunk's bytes gets
    /// the missing contribution XORed in, so all survivors describe the same
    /// stripe. Data chunks being repaired into a parity must be present.
    fn force_seal(
        &self,
        chunks: &mut [Vec<u8>],
        present: &[bool],
        seen: &[Vec<bool>],
        sealed: &[bool],
    ) -> Result<()> {
        let k = self.k();
        for j in 0..self.m() {
            if !present[k + j] {
                continue;
            }
            for i in 0..k {
                if seen[j][i] == sealed[i] {
                    continue;
                }
                if !present[i] {
                    bail!(
                        "cannot repair parity {j}: data chunk {i} disagrees on seal status but is unavailable"
                    );
                }
                let contribution = self.parity_delta(i, j, &chunks[i].clone())?;
                bitwise_xor(&mut chunks[k + j], &contribution);
            }
        }
        Ok(())
    }
}

pub(crate) fn check_geometry(k: usize, m: usize, chunk_size: usize) -> Result<()> {
    if k == 0 {
        bail!("k must be at least 1");
    }
    if chunk_size == 0 {
        bail!("chunk size must be non-zero");
    }
    let _ = m;
    Ok(())
}

pub(crate) fn check_stripe(chunks: &[Vec<u8>], present: &[bool], n: usize) -> Result<()> {
    if chunks.len() != n || present.len() != n {
        bail!("stripe has {} chunks, expected {n}", chunks.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_is_involutive() {
        let a: Vec<u8> = (0..37).collect();
        let b: Vec<u8> = (0..37).map(|i| i * 7 + 3).collect();
        let mut c = a.clone();
        bitwise_xor(&mut c, &b);
        bitwise_xor(&mut c, &b);
        assert_eq!(a, c);
    }

    #[test]
    fn scheme_parses() {
        assert_eq!("rs".parse::<Scheme>().unwrap(), Scheme::Rs);
        assert_eq!("raid5".parse::<Scheme>().unwrap(), Scheme::Raid5);
        assert!("raid6".parse::<Scheme>().is_err());
    }

    #[test]
    fn force_seal_repairs_lagging_parity() {
        // k=2, m=1 XOR parity. Parity 0 was produced before data chunk 1
        // sealed, so it is missing chunk 1's contribution.
        let coding = Raid5::new(2, 1, 16).unwrap();
        let d0 = vec![0xAAu8; 16];
        let d1 = vec![0x0Fu8; 16];
        let stale_parity = d0.clone(); // only chunk 0 folded in

        let mut chunks = vec![d0.clone(), d1.clone(), stale_parity];
        let present = vec![true, true, true];
        let seen = vec![vec![true, false]];
        let sealed = vec![true, true];
        coding.force_seal(&mut chunks, &present, &seen, &sealed).unwrap();

        let mut expect = d0;
        bitwise_xor(&mut expect, &d1);
        assert_eq!(chunks[2], expect);
    }

    #[test]
    fn force_seal_needs_the_disagreeing_chunk() {
        let coding = Raid5::new(2, 1, 8).unwrap();
        let mut chunks = vec![vec![1u8; 8], vec![0u8; 8], vec![1u8; 8]];
        let present = vec![true, false, true];
        let seen = vec![vec![true, false]];
        let sealed = vec![true, true];
        assert!(coding.force_seal(&mut chunks, &present, &seen, &sealed).is_err());
    }
}
