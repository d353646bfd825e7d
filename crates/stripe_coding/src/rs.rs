//! Reed-Solomon over GF(2^8), backed by the `reed-solomon-erasure` crate.

use anyhow::{bail, Context, Result};
use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::{check_geometry, check_stripe, Coding};

pub struct ReedSolomonCoding {
    inner: ReedSolomon,
    k: usize,
    m: usize,
    chunk_size: usize,
}

impl ReedSolomonCoding {
    pub fn new(k: usize, m: usize, chunk_size: usize) -> Result<Self> {
        check_geometry(k, m, chunk_size)?;
        if m == 0 {
            bail!("reed-solomon requires at least one parity chunk");
        }
        let inner = ReedSolomon::new(k, m).context("invalid reed-solomon geometry")?;
        Ok(Self { inner, k, m, chunk_size })
    }
}

impl Coding for ReedSolomonCoding {
    fn k(&self) -> usize {
        self.k
    }

    fn m(&self) -> usize {
        self.m
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn encode(&self, data: &[Vec<u8>], parity_index: usize, parity: &mut [u8]) -> Result<()> {
        if parity_index >= self.m {
            bail!("parity index {parity_index} out of range (m = {})", self.m);
        }
        let len = parity.len();
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.k + self.m);
        for chunk in data.iter().take(self.k) {
            shards.push(chunk[..len].to_vec());
        }
        shards.extend(std::iter::repeat_with(|| vec![0u8; len]).take(self.m));
        self.inner.encode(&mut shards).context("reed-solomon encode failed")?;
        parity.copy_from_slice(&shards[self.k + parity_index]);
        Ok(())
    }

    fn decode(&self, chunks: &mut [Vec<u8>], present: &[bool]) -> Result<()> {
        check_stripe(chunks, present, self.k + self.m)?;
        let mut shards: Vec<Option<Vec<u8>>> = chunks
            .iter()
            .zip(present)
            .map(|(chunk, ok)| ok.then(|| chunk.clone()))
            .collect();
        self.inner
            .reconstruct(&mut shards)
            .context("reed-solomon reconstruct failed")?;
        for (i, shard) in shards.into_iter().enumerate() {
            if !present[i] {
                chunks[i] = shard.expect("reconstruct fills missing shards");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn random_stripe(k: usize, size: usize, seed: u64) -> Vec<Vec<u8>> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..k).map(|_| (0..size).map(|_| rng.gen()).collect()).collect()
    }

    fn full_stripe(coding: &ReedSolomonCoding, seed: u64) -> Vec<Vec<u8>> {
        let mut chunks = random_stripe(coding.k(), coding.chunk_size(), seed);
        for j in 0..coding.m() {
            let mut parity = vec![0u8; coding.chunk_size()];
            coding.encode(&chunks, j, &mut parity).unwrap();
            chunks.push(parity);
        }
        chunks
    }

    #[test]
    fn round_trip_single_data_loss() {
        let coding = ReedSolomonCoding::new(4, 2, 128).unwrap();
        let mut chunks = full_stripe(&coding, 7);
        let original = chunks[1].clone();
        chunks[1] = vec![0u8; 128];
        let mut present = vec![true; 6];
        present[1] = false;
        coding.decode(&mut chunks, &present).unwrap();
        assert_eq!(chunks[1], original);
    }

    #[test]
    fn round_trip_m_losses() {
        let coding = ReedSolomonCoding::new(4, 2, 64).unwrap();
        let mut chunks = full_stripe(&coding, 11);
        let originals = (chunks[0].clone(), chunks[5].clone());
        chunks[0] = vec![0u8; 64];
        chunks[5] = vec![0u8; 64];
        let present = vec![false, true, true, true, true, false];
        coding.decode(&mut chunks, &present).unwrap();
        assert_eq!(chunks[0], originals.0);
        assert_eq!(chunks[5], originals.1);
    }

    #[test]
    fn too_many_losses_fail() {
        let coding = ReedSolomonCoding::new(4, 2, 64).unwrap();
        let mut chunks = full_stripe(&coding, 13);
        let present = vec![false, false, false, true, true, true];
        assert!(coding.decode(&mut chunks, &present).is_err());
    }

    #[test]
    fn reencode_after_decode_matches() {
        // Round-trip law: decode then re-encode over the surviving set
        // reproduces the lost parity bytes exactly.
        let coding = ReedSolomonCoding::new(4, 2, 64).unwrap();
        let mut chunks = full_stripe(&coding, 17);
        let lost_parity = chunks[4].clone();
        chunks[4] = vec![0u8; 64];
        let present = vec![true, true, true, true, false, true];
        coding.decode(&mut chunks, &present).unwrap();
        assert_eq!(chunks[4], lost_parity);

        let mut again = vec![0u8; 64];
        coding.encode(&chunks[..4], 0, &mut again).unwrap();
        assert_eq!(again, lost_parity);
    }

    #[test]
    fn parity_delta_is_linear() {
        let coding = ReedSolomonCoding::new(3, 2, 48).unwrap();
        let mut chunks = full_stripe(&coding, 23);

        // XOR a delta into data chunk 2, patch parity 1 via parity_delta.
        let delta: Vec<u8> = (0..16).map(|i| (i * 13 + 5) as u8).collect();
        for (i, d) in delta.iter().enumerate() {
            chunks[2][8 + i] ^= d;
        }
        let pdelta = coding.parity_delta(2, 1, &delta).unwrap();
        for (i, d) in pdelta.iter().enumerate() {
            chunks[4][8 + i] ^= d;
        }

        let mut expect = vec![0u8; 48];
        coding.encode(&chunks[..3], 1, &mut expect).unwrap();
        assert_eq!(chunks[4], expect);
    }
}
