//! XOR-family schemes: striping (RAID-0), mirroring (RAID-1) and single
//! XOR parity (RAID-5).

use anyhow::{bail, Result};

use crate::{bitwise_xor, check_geometry, check_stripe, Coding};

/// Pure striping. No parity, no redundancy: decode succeeds only when every
/// chunk survived.
pub struct Raid0 {
    k: usize,
    chunk_size: usize,
}

impl Raid0 {
    pub fn new(k: usize, chunk_size: usize) -> Result<Self> {
        check_geometry(k, 0, chunk_size)?;
        Ok(Self { k, chunk_size })
    }
}

impl Coding for Raid0 {
    fn k(&self) -> usize {
        self.k
    }

    fn m(&self) -> usize {
        0
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn encode(&self, _data: &[Vec<u8>], _parity_index: usize, _parity: &mut [u8]) -> Result<()> {
        bail!("raid0 carries no parity")
    }

    fn decode(&self, chunks: &mut [Vec<u8>], present: &[bool]) -> Result<()> {
        check_stripe(chunks, present, self.k)?;
        if let Some(lost) = present.iter().position(|p| !p) {
            bail!("raid0 cannot recover lost chunk {lost}");
        }
        Ok(())
    }
}

/// Mirroring: every parity chunk is a copy of the single data chunk.
pub struct Raid1 {
    m: usize,
    chunk_size: usize,
}

impl Raid1 {
    pub fn new(k: usize, m: usize, chunk_size: usize) -> Result<Self> {
        check_geometry(k, m, chunk_size)?;
        if k != 1 {
            bail!("raid1 requires k = 1, got k = {k}");
        }
        if m == 0 {
            bail!("raid1 requires at least one mirror");
        }
        Ok(Self { m, chunk_size })
    }
}

impl Coding for Raid1 {
    fn k(&self) -> usize {
        1
    }

    fn m(&self) -> usize {
        self.m
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn encode(&self, data: &[Vec<u8>], _parity_index: usize, parity: &mut [u8]) -> Result<()> {
        parity.copy_from_slice(&data[0][..parity.len()]);
        Ok(())
    }

    fn decode(&self, chunks: &mut [Vec<u8>], present: &[bool]) -> Result<()> {
        check_stripe(chunks, present, 1 + self.m)?;
        let Some(source) = present.iter().position(|p| *p) else {
            bail!("raid1 stripe has no surviving copy");
        };
        let bytes = chunks[source].clone();
        for (i, chunk) in chunks.iter_mut().enumerate() {
            if !present[i] {
                chunk.copy_from_slice(&bytes);
            }
        }
        Ok(())
    }
}

/// Single XOR parity across all data chunks. Tolerates one loss.
pub struct Raid5 {
    k: usize,
    chunk_size: usize,
}

impl Raid5 {
    pub fn new(k: usize, m: usize, chunk_size: usize) -> Result<Self> {
        check_geometry(k, m, chunk_size)?;
        if m != 1 {
            bail!("raid5 carries exactly one parity chunk, got m = {m}");
        }
        Ok(Self { k, chunk_size })
    }
}

impl Coding for Raid5 {
    fn k(&self) -> usize {
        self.k
    }

    fn m(&self) -> usize {
        1
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn encode(&self, data: &[Vec<u8>], parity_index: usize, parity: &mut [u8]) -> Result<()> {
        if parity_index != 0 {
            bail!("raid5 has a single parity chunk");
        }
        parity.fill(0);
        for chunk in data.iter().take(self.k) {
            bitwise_xor(parity, &chunk[..parity.len()]);
        }
        Ok(())
    }

    fn decode(&self, chunks: &mut [Vec<u8>], present: &[bool]) -> Result<()> {
        check_stripe(chunks, present, self.k + 1)?;
        let lost: Vec<usize> = present
            .iter()
            .enumerate()
            .filter(|(_, p)| !**p)
            .map(|(i, _)| i)
            .collect();
        match lost.len() {
            0 => Ok(()),
            1 => {
                let target = lost[0];
                let mut rebuilt = vec![0u8; self.chunk_size];
                for (i, chunk) in chunks.iter().enumerate() {
                    if i != target {
                        bitwise_xor(&mut rebuilt, chunk);
                    }
                }
                chunks[target] = rebuilt;
                Ok(())
            }
            n => bail!("raid5 cannot recover {n} lost chunks"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stripe(k: usize, size: usize) -> Vec<Vec<u8>> {
        (0..k)
            .map(|i| (0..size).map(|b| (i * 31 + b * 7 + 1) as u8).collect())
            .collect()
    }

    #[test]
    fn raid5_round_trip() {
        let coding = Raid5::new(4, 1, 64).unwrap();
        let mut chunks = stripe(4, 64);
        let mut parity = vec![0u8; 64];
        coding.encode(&chunks, 0, &mut parity).unwrap();
        chunks.push(parity);

        let original = chunks[2].clone();
        chunks[2] = vec![0u8; 64];
        let present = vec![true, true, false, true, true];
        coding.decode(&mut chunks, &present).unwrap();
        assert_eq!(chunks[2], original);
    }

    #[test]
    fn raid5_parity_loss_recomputes() {
        let coding = Raid5::new(3, 1, 32).unwrap();
        let mut chunks = stripe(3, 32);
        let mut parity = vec![0u8; 32];
        coding.encode(&chunks, 0, &mut parity).unwrap();
        let expect = parity.clone();
        chunks.push(vec![0u8; 32]);
        let present = vec![true, true, true, false];
        coding.decode(&mut chunks, &present).unwrap();
        assert_eq!(chunks[3], expect);
    }

    #[test]
    fn raid5_two_losses_fail() {
        let coding = Raid5::new(3, 1, 32).unwrap();
        let mut chunks = stripe(4, 32);
        let present = vec![true, false, false, true];
        assert!(coding.decode(&mut chunks, &present).is_err());
    }

    #[test]
    fn raid1_any_survivor_restores_all() {
        let coding = Raid1::new(1, 2, 16).unwrap();
        let data = stripe(1, 16).remove(0);
        let mut chunks = vec![data.clone(), data.clone(), data.clone()];
        chunks[0] = vec![0u8; 16];
        chunks[2] = vec![0u8; 16];
        let present = vec![false, true, false];
        coding.decode(&mut chunks, &present).unwrap();
        assert_eq!(chunks[0], data);
        assert_eq!(chunks[2], data);
    }

    #[test]
    fn raid0_recovers_nothing() {
        let coding = Raid0::new(4, 16).unwrap();
        let mut chunks = stripe(4, 16);
        assert!(coding.decode(&mut chunks, &[true, true, false, true]).is_err());
        assert!(coding.decode(&mut chunks, &[true; 4]).is_ok());
    }

    #[test]
    fn raid5_delta_matches_full_reencode() {
        let coding = Raid5::new(3, 1, 32).unwrap();
        let mut chunks = stripe(3, 32);
        let mut parity = vec![0u8; 32];
        coding.encode(&chunks, 0, &mut parity).unwrap();

        // Mutate 8 bytes of chunk 1 and patch parity via the delta.
        let mut delta = vec![0u8; 8];
        for (i, d) in delta.iter_mut().enumerate() {
            *d = chunks[1][4 + i] ^ 0x5C;
            chunks[1][4 + i] ^= 0x5C;
        }
        let pdelta = coding.parity_delta(1, 0, &delta).unwrap();
        bitwise_xor(&mut parity[4..12], &pdelta);

        let mut expect = vec![0u8; 32];
        coding.encode(&chunks, 0, &mut expect).unwrap();
        assert_eq!(parity, expect);
    }
}
