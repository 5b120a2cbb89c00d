//! Reed-Solomon protection for optical frames.
//!
//! A framed payload is split into [`DATA_SHARDS`] equal shards plus a
//! range-dependent number of parity shards. Every shard carries its own CRC32,
//! so a shard damaged in flight is recognised and treated as an erasure; up to
//! `parity` erasures are rebuilt.
//!
//! Block layout:
//! `magic(1) | data(1) | parity(1) | shard_len(4) | payload_len(4) | hcrc(4)`
//! followed by `data + parity` times `shard | crc32(4)`.
use bytes::{Buf, BufMut, BytesMut};
use reed_solomon_erasure::galois_8::ReedSolomon;
use thiserror::Error;

use crate::profile::RangeCategory;

pub const DATA_SHARDS: usize = 16;
pub const MIN_PARITY_SHARDS: usize = 4;
pub const MAX_PARITY_SHARDS: usize = 16;
pub const BLOCK_HEADER_LEN: usize = 1 + 1 + 1 + 4 + 4 + 4;
const BLOCK_MAGIC: u8 = 0xEC;
const SHARD_CRC_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EccError {
    #[error("invalid ecc parameters: {0}")]
    Parameters(String),
    #[error("ecc block header damaged")]
    Header,
    #[error("{missing} shards lost, only {parity} recoverable")]
    Uncorrectable { missing: usize, parity: usize },
    #[error("reed-solomon: {0}")]
    Codec(String),
}

fn codec_error(err: reed_solomon_erasure::Error) -> EccError {
    EccError::Codec(err.to_string())
}

/// Parity shards used at each range; longer paths see more scintillation.
pub fn parity_for(category: RangeCategory) -> usize {
    match category {
        RangeCategory::Close => 4,
        RangeCategory::Medium => 8,
        RangeCategory::Far => 12,
        RangeCategory::Extreme => 16,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBlock {
    pub payload: Vec<u8>,
    /// Data shards that failed their CRC and were rebuilt from parity.
    pub repaired_shards: usize,
}

/// Wraps `payload` in a protected block with `parity_shards` parity shards.
pub fn encode_block(payload: &[u8], parity_shards: usize) -> Result<Vec<u8>, EccError> {
    if !(MIN_PARITY_SHARDS..=MAX_PARITY_SHARDS).contains(&parity_shards) {
        return Err(EccError::Parameters(format!(
            "parity shards {parity_shards} outside [{MIN_PARITY_SHARDS}, {MAX_PARITY_SHARDS}]"
        )));
    }
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| EccError::Parameters(format!("payload of {} bytes", payload.len())))?;
    let shard_len = payload.len().div_ceil(DATA_SHARDS).max(1);

    let mut shards: Vec<Vec<u8>> = (0..DATA_SHARDS + parity_shards)
        .map(|index| {
            let mut shard = vec![0u8; shard_len];
            if index < DATA_SHARDS {
                let start = (index * shard_len).min(payload.len());
                let end = ((index + 1) * shard_len).min(payload.len());
                shard[..end - start].copy_from_slice(&payload[start..end]);
            }
            shard
        })
        .collect();
    ReedSolomon::new(DATA_SHARDS, parity_shards)
        .map_err(codec_error)?
        .encode(&mut shards)
        .map_err(codec_error)?;

    let mut block =
        BytesMut::with_capacity(BLOCK_HEADER_LEN + shards.len() * (shard_len + SHARD_CRC_LEN));
    block.put_u8(BLOCK_MAGIC);
    block.put_u8(DATA_SHARDS as u8);
    block.put_u8(parity_shards as u8);
    block.put_u32(shard_len as u32);
    block.put_u32(payload_len);
    let header_crc = crc32fast::hash(&block[..]);
    block.put_u32(header_crc);
    for shard in &shards {
        block.put_slice(shard);
        block.put_u32(crc32fast::hash(shard));
    }
    Ok(block.to_vec())
}

/// Unwraps a block, rebuilding shards that fail their CRC or are missing
/// from a truncated block.
///
/// # Errors
/// * `Header` when the header is damaged or inconsistent; nothing else about
///   the block can be trusted then.
/// * `Uncorrectable` when more shards are lost than there is parity.
pub fn decode_block(block: &[u8]) -> Result<DecodedBlock, EccError> {
    if block.len() < BLOCK_HEADER_LEN {
        return Err(EccError::Header);
    }
    let mut header = &block[..BLOCK_HEADER_LEN];
    let magic = header.get_u8();
    let data = header.get_u8() as usize;
    let parity = header.get_u8() as usize;
    let shard_len = header.get_u32() as usize;
    let payload_len = header.get_u32() as usize;
    let header_crc = header.get_u32();
    if magic != BLOCK_MAGIC
        || crc32fast::hash(&block[..BLOCK_HEADER_LEN - SHARD_CRC_LEN]) != header_crc
    {
        return Err(EccError::Header);
    }
    let body = &block[BLOCK_HEADER_LEN..];
    if data != DATA_SHARDS
        || !(MIN_PARITY_SHARDS..=MAX_PARITY_SHARDS).contains(&parity)
        || shard_len == 0
        || shard_len > body.len()
        || payload_len > data * shard_len
    {
        return Err(EccError::Header);
    }

    let stride = shard_len + SHARD_CRC_LEN;
    let mut shards: Vec<Option<Vec<u8>>> = (0..data + parity)
        .map(|index| {
            let at = index * stride;
            let chunk = body.get(at..at + stride)?;
            let (shard, crc) = chunk.split_at(shard_len);
            let crc = u32::from_be_bytes(crc.try_into().ok()?);
            (crc32fast::hash(shard) == crc).then(|| shard.to_vec())
        })
        .collect();
    let missing = shards.iter().filter(|shard| shard.is_none()).count();
    if missing > parity {
        return Err(EccError::Uncorrectable { missing, parity });
    }
    let repaired_shards = shards[..data].iter().filter(|shard| shard.is_none()).count();
    if repaired_shards > 0 {
        ReedSolomon::new(data, parity)
            .map_err(codec_error)?
            .reconstruct_data(&mut shards)
            .map_err(codec_error)?;
    }

    let mut payload = Vec::with_capacity(data * shard_len);
    for shard in shards.into_iter().take(data) {
        let shard = shard.ok_or(EccError::Uncorrectable { missing, parity })?;
        payload.extend_from_slice(&shard);
    }
    payload.truncate(payload_len);
    Ok(DecodedBlock {
        payload,
        repaired_shards,
    })
}
