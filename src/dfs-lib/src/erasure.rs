//! Reed–Solomon coding over GF(2⁸) with a Vandermonde-derived generator.
//!
//! The raw Vandermonde matrix `V` (row `i`, col `j` = `(i+1)^j`) is
//! normalized into `G = V · V_top⁻¹` so its top `k×k` block is the identity:
//! the first `k` encoded blocks are the data itself, and any `k` rows of `G`
//! remain invertible. Decoding selects the first `k` available rows, inverts
//! that sub-matrix with Gauss–Jordan elimination, and recovers the data
//! column per byte position. `k` data blocks plus `m` parity blocks survive
//! any `m` losses.

use once_cell::sync::Lazy;

use crate::{block_id_for, sha256_hex, DfsError, DfsResult};

/// Primitive polynomial x⁸ + x⁴ + x³ + x² + 1.
const PRIMITIVE_POLY: u32 = 0x11D;

struct GfTables {
    log: [u8; 256],
    exp: [u8; 256],
}

static GF: Lazy<GfTables> = Lazy::new(|| {
    let mut log = [0u8; 256];
    let mut exp = [0u8; 256];
    exp[0] = 1;
    let mut x: u32 = 1;
    for i in 1..255 {
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= PRIMITIVE_POLY;
        }
        exp[i] = x as u8;
        log[x as usize] = i as u8;
    }
    exp[255] = exp[0];
    log[1] = 0;
    GfTables { log, exp }
});

#[inline]
fn gf_add(a: u8, b: u8) -> u8 {
    a ^ b
}

#[inline]
fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let log_sum = (GF.log[a as usize] as usize + GF.log[b as usize] as usize) % 255;
    GF.exp[log_sum]
}

#[inline]
fn gf_div(a: u8, b: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    debug_assert!(b != 0, "division by zero in GF(256)");
    let log_diff =
        (GF.log[a as usize] as usize + 255 - GF.log[b as usize] as usize) % 255;
    GF.exp[log_diff]
}

#[inline]
fn gf_pow(base: u8, exp: usize) -> u8 {
    if base == 0 {
        return 0;
    }
    if exp == 0 {
        return 1;
    }
    let log_result = (GF.log[base as usize] as usize * exp) % 255;
    GF.exp[log_result]
}

pub struct ErasureCoder {
    data_blocks: usize,
    parity_blocks: usize,
    /// Systematic generator: identity on top, parity rows below.
    generator: Vec<Vec<u8>>,
}

impl ErasureCoder {
    pub fn new(data_blocks: usize, parity_blocks: usize) -> DfsResult<Self> {
        if data_blocks == 0 || parity_blocks == 0 {
            return Err(DfsError::InvalidArgument(
                "erasure coding needs at least one data and one parity block".to_string(),
            ));
        }
        if data_blocks + parity_blocks > 255 {
            return Err(DfsError::InvalidArgument(format!(
                "k + m must be <= 255, got {}",
                data_blocks + parity_blocks
            )));
        }

        let vandermonde = Self::vandermonde(data_blocks + parity_blocks, data_blocks);
        let top: Vec<Vec<u8>> = vandermonde[..data_blocks].to_vec();
        let top_inverse = invert_matrix(&top)?;
        let generator = vandermonde
            .iter()
            .map(|row| {
                (0..data_blocks)
                    .map(|col| {
                        let mut acc = 0u8;
                        for (l, &value) in row.iter().enumerate() {
                            acc = gf_add(acc, gf_mul(value, top_inverse[l][col]));
                        }
                        acc
                    })
                    .collect()
            })
            .collect();

        Ok(Self {
            data_blocks,
            parity_blocks,
            generator,
        })
    }

    pub fn data_blocks(&self) -> usize {
        self.data_blocks
    }

    pub fn parity_blocks(&self) -> usize {
        self.parity_blocks
    }

    pub fn total_blocks(&self) -> usize {
        self.data_blocks + self.parity_blocks
    }

    /// Row `i`, column `j` is `(i+1)^j` in GF(2⁸).
    fn vandermonde(rows: usize, cols: usize) -> Vec<Vec<u8>> {
        (0..rows)
            .map(|i| (0..cols).map(|j| gf_pow((i + 1) as u8, j)).collect())
            .collect()
    }

    /// Split `data` into `k` zero-padded blocks and append `m` parity blocks.
    /// Empty input yields no blocks.
    pub fn encode(&self, data: &[u8]) -> Vec<Vec<u8>> {
        if data.is_empty() {
            return Vec::new();
        }

        let k = self.data_blocks;
        let block_size = data.len().div_ceil(k);

        let mut blocks: Vec<Vec<u8>> = Vec::with_capacity(self.total_blocks());
        for i in 0..k {
            let start = (i * block_size).min(data.len());
            let end = ((i + 1) * block_size).min(data.len());
            let mut block = data[start..end].to_vec();
            block.resize(block_size, 0);
            blocks.push(block);
        }

        for row in &self.generator[k..] {
            let mut parity = vec![0u8; block_size];
            for (pos, out) in parity.iter_mut().enumerate() {
                let mut acc = 0u8;
                for (j, block) in blocks[..k].iter().enumerate() {
                    acc = gf_add(acc, gf_mul(row[j], block[pos]));
                }
                *out = acc;
            }
            blocks.push(parity);
        }

        blocks
    }

    pub fn can_decode(&self, availability: &[bool]) -> bool {
        availability.iter().filter(|a| **a).count() >= self.data_blocks
    }

    /// Recover the concatenated data blocks (still zero-padded) from any `k`
    /// available blocks. `blocks[i]` is ignored unless `availability[i]`.
    pub fn decode(&self, blocks: &[Vec<u8>], availability: &[bool]) -> DfsResult<Vec<u8>> {
        let total = self.total_blocks();
        if blocks.len() != total || availability.len() != total {
            return Err(DfsError::InvalidArgument(format!(
                "expected {} blocks and availability entries, got {} / {}",
                total,
                blocks.len(),
                availability.len()
            )));
        }

        let available: Vec<usize> = (0..total).filter(|&i| availability[i]).collect();
        if available.len() < self.data_blocks {
            return Err(DfsError::IntegrityFailure(format!(
                "only {} of {} required blocks available",
                available.len(),
                self.data_blocks
            )));
        }

        let k = self.data_blocks;
        if availability[..k].iter().all(|a| *a) {
            let mut out = Vec::with_capacity(k * blocks[0].len());
            for block in &blocks[..k] {
                out.extend_from_slice(block);
            }
            return Ok(out);
        }

        let selected = &available[..k];
        let block_size = blocks[selected[0]].len();
        if selected.iter().any(|&i| blocks[i].len() != block_size) {
            return Err(DfsError::InvalidArgument(
                "available blocks differ in size".to_string(),
            ));
        }

        let sub: Vec<Vec<u8>> = selected.iter().map(|&i| self.generator[i].clone()).collect();
        let inverse = invert_matrix(&sub)?;

        let mut decoded = vec![vec![0u8; block_size]; k];
        let mut symbols = vec![0u8; k];
        for pos in 0..block_size {
            for (slot, &idx) in selected.iter().enumerate() {
                symbols[slot] = blocks[idx][pos];
            }
            for (row, out) in decoded.iter_mut().enumerate() {
                let mut acc = 0u8;
                for (j, &symbol) in symbols.iter().enumerate() {
                    acc = gf_add(acc, gf_mul(inverse[row][j], symbol));
                }
                out[pos] = acc;
            }
        }

        let mut out = Vec::with_capacity(k * block_size);
        for block in decoded {
            out.extend_from_slice(&block);
        }
        Ok(out)
    }

    /// Regenerate the blocks at `missing` indices from the surviving ones.
    pub fn repair(
        &self,
        blocks: &[Vec<u8>],
        availability: &[bool],
        missing: &[usize],
    ) -> DfsResult<Vec<(usize, Vec<u8>)>> {
        let data = self.decode(blocks, availability)?;
        let regenerated = self.encode(&data);
        missing
            .iter()
            .map(|&idx| {
                regenerated
                    .get(idx)
                    .cloned()
                    .map(|block| (idx, block))
                    .ok_or_else(|| {
                        DfsError::InvalidArgument(format!("block index {} out of range", idx))
                    })
            })
            .collect()
    }
}

/// Gauss–Jordan inversion in GF(2⁸).
fn invert_matrix(matrix: &[Vec<u8>]) -> DfsResult<Vec<Vec<u8>>> {
    let n = matrix.len();
    if n == 0 || matrix.iter().any(|row| row.len() != n) {
        return Err(DfsError::InvalidArgument(
            "matrix must be square for inversion".to_string(),
        ));
    }

    // Augmented [A | I].
    let mut aug: Vec<Vec<u8>> = matrix
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut extended = row.clone();
            extended.extend((0..n).map(|j| u8::from(i == j)));
            extended
        })
        .collect();

    for i in 0..n {
        let pivot = (i..n)
            .find(|&r| aug[r][i] != 0)
            .ok_or_else(|| DfsError::IntegrityFailure("matrix is not invertible".to_string()))?;
        aug.swap(i, pivot);

        let diagonal = aug[i][i];
        for value in aug[i].iter_mut() {
            *value = gf_div(*value, diagonal);
        }

        for row in 0..n {
            if row == i || aug[row][i] == 0 {
                continue;
            }
            let factor = aug[row][i];
            for col in 0..2 * n {
                let scaled = gf_mul(factor, aug[i][col]);
                aug[row][col] = gf_add(aug[row][col], scaled);
            }
        }
    }

    Ok(aug.into_iter().map(|row| row[n..].to_vec()).collect())
}

/// One encoded block of a code group, ready for placement.
#[derive(Debug, Clone)]
pub struct CodedBlock {
    pub chunk_id: String,
    pub block_index: usize,
    pub is_parity: bool,
    pub data: Vec<u8>,
    pub checksum: String,
}

/// A full `(k, m)` erasure group with its block inventory.
#[derive(Debug, Clone)]
pub struct CodeGroup {
    pub group_id: String,
    pub data_blocks: usize,
    pub parity_blocks: usize,
    pub original_size: u64,
    pub blocks: Vec<CodedBlock>,
}

/// Encodes chunk slices into [`CodeGroup`]s and back. Block ids follow
/// `"{group_id}_block_{i}"`.
pub struct CodeGroupCodec {
    coder: ErasureCoder,
}

impl CodeGroupCodec {
    pub fn new(data_blocks: usize, parity_blocks: usize) -> DfsResult<Self> {
        Ok(Self {
            coder: ErasureCoder::new(data_blocks, parity_blocks)?,
        })
    }

    pub fn data_blocks(&self) -> usize {
        self.coder.data_blocks()
    }

    pub fn parity_blocks(&self) -> usize {
        self.coder.parity_blocks()
    }

    pub fn encode_group(&self, group_id: &str, data: &[u8]) -> DfsResult<CodeGroup> {
        if data.is_empty() {
            return Err(DfsError::InvalidArgument(
                "cannot erasure-code an empty slice".to_string(),
            ));
        }
        let encoded = self.coder.encode(data);
        let blocks = encoded
            .into_iter()
            .enumerate()
            .map(|(i, block)| CodedBlock {
                chunk_id: block_id_for(group_id, i),
                block_index: i,
                is_parity: i >= self.coder.data_blocks(),
                checksum: sha256_hex(&block),
                data: block,
            })
            .collect();
        Ok(CodeGroup {
            group_id: group_id.to_string(),
            data_blocks: self.coder.data_blocks(),
            parity_blocks: self.coder.parity_blocks(),
            original_size: data.len() as u64,
            blocks,
        })
    }

    /// Reassemble the original slice from whatever blocks the group carries.
    pub fn decode_group(&self, group: &CodeGroup) -> DfsResult<Vec<u8>> {
        let total = self.coder.total_blocks();
        let mut blocks = vec![Vec::new(); total];
        let mut availability = vec![false; total];
        for block in &group.blocks {
            if block.block_index < total {
                blocks[block.block_index] = block.data.clone();
                availability[block.block_index] = true;
            }
        }
        let mut data = self.coder.decode(&blocks, &availability)?;
        let original = group.original_size as usize;
        if original <= data.len() {
            data.truncate(original);
        }
        Ok(data)
    }

    /// Regenerate the named missing blocks of a group.
    pub fn repair_group(
        &self,
        group: &CodeGroup,
        missing: &[usize],
    ) -> DfsResult<Vec<CodedBlock>> {
        let total = self.coder.total_blocks();
        let mut blocks = vec![Vec::new(); total];
        let mut availability = vec![false; total];
        for block in &group.blocks {
            if block.block_index < total {
                blocks[block.block_index] = block.data.clone();
                availability[block.block_index] = true;
            }
        }
        let repaired = self.coder.repair(&blocks, &availability, missing)?;
        Ok(repaired
            .into_iter()
            .map(|(idx, data)| CodedBlock {
                chunk_id: block_id_for(&group.group_id, idx),
                block_index: idx,
                is_parity: idx >= self.coder.data_blocks(),
                checksum: sha256_hex(&data),
                data,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn encode_shapes() {
        let coder = ErasureCoder::new(4, 2).unwrap();
        let blocks = coder.encode(&sample_data(1000));
        assert_eq!(blocks.len(), 6);
        // 1000 / 4 = 250 exactly.
        assert!(blocks.iter().all(|b| b.len() == 250));

        let blocks = coder.encode(&sample_data(1001));
        assert!(blocks.iter().all(|b| b.len() == 251));
    }

    #[test]
    fn encode_empty_is_empty() {
        let coder = ErasureCoder::new(4, 2).unwrap();
        assert!(coder.encode(&[]).is_empty());
    }

    #[test]
    fn round_trip_all_loss_patterns_within_m() {
        let coder = ErasureCoder::new(4, 2).unwrap();
        let data = sample_data(4096);
        let blocks = coder.encode(&data);

        // Every pattern of 0, 1 or 2 losses out of 6 blocks must decode.
        for mask in 0u32..(1 << 6) {
            let lost = mask.count_ones() as usize;
            if lost > 2 {
                continue;
            }
            let availability: Vec<bool> = (0..6).map(|i| mask & (1 << i) == 0).collect();
            let decoded = coder.decode(&blocks, &availability).unwrap();
            assert_eq!(&decoded[..data.len()], &data[..], "mask {:06b}", mask);
        }
    }

    #[test]
    fn too_many_losses_fail_deterministically() {
        let coder = ErasureCoder::new(4, 2).unwrap();
        let blocks = coder.encode(&sample_data(4096));

        for mask in 0u32..(1 << 6) {
            if (mask.count_ones() as usize) <= 2 {
                continue;
            }
            let availability: Vec<bool> = (0..6).map(|i| mask & (1 << i) == 0).collect();
            let err = coder.decode(&blocks, &availability).unwrap_err();
            assert!(matches!(err, DfsError::IntegrityFailure(_)));
        }
    }

    #[test]
    fn decode_with_exactly_k_blocks() {
        let coder = ErasureCoder::new(4, 2).unwrap();
        let data = sample_data(997);
        let blocks = coder.encode(&data);

        // Only parity 4 and data 0, 2, 3 survive: exactly k = 4 blocks.
        let availability = vec![true, false, true, true, true, false];
        let decoded = coder.decode(&blocks, &availability).unwrap();
        assert_eq!(&decoded[..data.len()], &data[..]);
    }

    #[test]
    fn repair_regenerates_missing_blocks() {
        let coder = ErasureCoder::new(4, 2).unwrap();
        let blocks = coder.encode(&sample_data(2048));

        let availability = vec![true, false, true, true, true, false];
        let repaired = coder.repair(&blocks, &availability, &[1, 5]).unwrap();
        assert_eq!(repaired.len(), 2);
        assert_eq!(repaired[0], (1, blocks[1].clone()));
        assert_eq!(repaired[1], (5, blocks[5].clone()));
    }

    #[test]
    fn group_codec_round_trip_with_losses() {
        let codec = CodeGroupCodec::new(4, 2).unwrap();
        let data = sample_data(3000);
        let mut group = codec.encode_group("file_x_group_0", &data).unwrap();

        assert_eq!(group.blocks.len(), 6);
        assert_eq!(group.blocks[0].chunk_id, "file_x_group_0_block_0");
        assert_eq!(group.blocks[5].chunk_id, "file_x_group_0_block_5");
        assert!(group.blocks[5].is_parity);
        assert!(!group.blocks[3].is_parity);
        for block in &group.blocks {
            assert_eq!(block.checksum, sha256_hex(&block.data));
        }

        // Lose two arbitrary blocks, including a data block.
        group.blocks.retain(|b| b.block_index != 1 && b.block_index != 4);
        let decoded = codec.decode_group(&group).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn group_codec_repair_names_blocks() {
        let codec = CodeGroupCodec::new(4, 2).unwrap();
        let mut group = codec.encode_group("file_x_group_3", &sample_data(512)).unwrap();
        let lost: Vec<CodedBlock> = group
            .blocks
            .iter()
            .filter(|b| b.block_index == 2)
            .cloned()
            .collect();
        group.blocks.retain(|b| b.block_index != 2);

        let repaired = codec.repair_group(&group, &[2]).unwrap();
        assert_eq!(repaired.len(), 1);
        assert_eq!(repaired[0].chunk_id, "file_x_group_3_block_2");
        assert_eq!(repaired[0].data, lost[0].data);
        assert_eq!(repaired[0].checksum, lost[0].checksum);
    }

    #[test]
    fn gf_arithmetic_basics() {
        // a * 1 = a, a / a = 1, a ^ a = 0.
        for a in 1..=255u8 {
            assert_eq!(gf_mul(a, 1), a);
            assert_eq!(gf_div(a, a), 1);
            assert_eq!(gf_add(a, a), 0);
        }
        // Multiplication distributes over addition in GF(2^8).
        for &(a, b, c) in &[(3u8, 7u8, 200u8), (90, 17, 254), (255, 2, 3)] {
            assert_eq!(
                gf_mul(a, gf_add(b, c)),
                gf_add(gf_mul(a, b), gf_mul(a, c))
            );
        }
    }

    #[test]
    fn singular_matrix_is_reported() {
        let singular = vec![vec![1u8, 2], vec![1u8, 2]];
        assert!(invert_matrix(&singular).is_err());
    }

    #[test]
    fn generator_is_systematic() {
        let coder = ErasureCoder::new(5, 3).unwrap();
        for (i, row) in coder.generator[..5].iter().enumerate() {
            for (j, &value) in row.iter().enumerate() {
                assert_eq!(value, u8::from(i == j), "top rows must be identity");
            }
        }
    }
}
