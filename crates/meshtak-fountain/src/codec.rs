//! LT fountain codec: wire frames, encoder, peeling decoder and per-transfer
//! receive state.
//!
//! Wire layout (big-endian, magic `"FTN"`):
//!
//! ```text
//! data  = magic(3) | transfer_id(3) | seed(2) | K(1) | total_len(2) | payload(220)
//! ack   = magic(3) | transfer_id(3) | type(1) | received(2) | needed(2) | hash(8)
//! ```

use crate::lcg::JavaRandom;
use crate::soliton::SolitonDistribution;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, trace};

pub const FOUNTAIN_MAGIC: [u8; 3] = *b"FTN";

/// Source/coded block payload size.
pub const BLOCK_SIZE: usize = 220;

pub const DATA_FRAME_LEN: usize = 231;
pub const ACK_FRAME_LEN: usize = 19;

/// Largest forwarder payload that still fits one radio datagram; anything
/// bigger goes through the fountain.
pub const MAX_DIRECT_PAYLOAD: usize = 233;

/// Transport-type byte prefixed to forwarder payloads.
pub const TRANSPORT_COT: u8 = 0x00;
pub const TRANSPORT_FILE: u8 = 0x01;

const ACK_TYPE_COMPLETE: u8 = 0x02;
const ACK_TYPE_NEED_MORE: u8 = 0x03;

/// Receive-side state lifetime; the sender has no timeout of its own.
pub const RECEIVE_STATE_TTL: Duration = Duration::from_secs(60);

const MAX_SOURCE_BLOCKS: usize = 255;

#[derive(Error, Debug)]
pub enum FountainError {
    #[error("encoding failed: {0}")]
    EncodingFailed(String),
}

/// Seed of coded block `i` of a transfer.
pub fn block_seed(transfer_id: u32, index: u32) -> u16 {
    ((transfer_id as u64 * 31337 + index as u64 * 7919) & 0xFFFF) as u16
}

/// Transfer ids mix a random 24-bit value with the epoch second counter.
pub fn generate_transfer_id() -> u32 {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    (rand::random::<u32>() ^ (epoch as u32 & 0xFFFF)) & 0xFF_FFFF
}

/// Regenerate the source-block index set of a coded block.
///
/// The degree draw always runs, even though the first block's degree is
/// forced to 1, so the generator state stays aligned with the peer.
pub fn block_indices(
    seed: u16,
    k: usize,
    first_block: bool,
    dist: &SolitonDistribution,
) -> Vec<usize> {
    let mut rng = JavaRandom::new(seed as i64);
    let sampled = dist.sample(&mut rng);
    let degree = if first_block { 1 } else { sampled };
    let wanted = degree.min(k).max(1);

    let mut indices = Vec::with_capacity(wanted);
    while indices.len() < wanted {
        let idx = rng.next_int(k as i32) as usize;
        if !indices.contains(&idx) {
            indices.push(idx);
        }
    }
    indices
}

/// A coded-block frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub transfer_id: u32,
    pub seed: u16,
    pub k: u8,
    pub total_len: u16,
    pub payload: [u8; BLOCK_SIZE],
}

impl DataFrame {
    pub fn encode(&self) -> [u8; DATA_FRAME_LEN] {
        let mut buf = [0u8; DATA_FRAME_LEN];
        buf[..3].copy_from_slice(&FOUNTAIN_MAGIC);
        buf[3..6].copy_from_slice(&self.transfer_id.to_be_bytes()[1..]);
        buf[6..8].copy_from_slice(&self.seed.to_be_bytes());
        buf[8] = self.k;
        buf[9..11].copy_from_slice(&self.total_len.to_be_bytes());
        buf[11..].copy_from_slice(&self.payload);
        buf
    }

    fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() != DATA_FRAME_LEN || buf[8] == 0 {
            return None;
        }
        let mut payload = [0u8; BLOCK_SIZE];
        payload.copy_from_slice(&buf[11..]);
        Some(Self {
            transfer_id: u32::from_be_bytes([0, buf[3], buf[4], buf[5]]),
            seed: u16::from_be_bytes([buf[6], buf[7]]),
            k: buf[8],
            total_len: u16::from_be_bytes([buf[9], buf[10]]),
            payload,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Complete,
    NeedMore,
}

/// A receive acknowledgement frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub transfer_id: u32,
    pub kind: AckKind,
    pub received: u16,
    pub needed: u16,
    pub hash: [u8; 8],
}

impl AckFrame {
    pub fn complete(transfer_id: u32, received: u16, hash: [u8; 8]) -> Self {
        Self {
            transfer_id,
            kind: AckKind::Complete,
            received,
            needed: 0,
            hash,
        }
    }

    pub fn encode(&self) -> [u8; ACK_FRAME_LEN] {
        let mut buf = [0u8; ACK_FRAME_LEN];
        buf[..3].copy_from_slice(&FOUNTAIN_MAGIC);
        buf[3..6].copy_from_slice(&self.transfer_id.to_be_bytes()[1..]);
        buf[6] = match self.kind {
            AckKind::Complete => ACK_TYPE_COMPLETE,
            AckKind::NeedMore => ACK_TYPE_NEED_MORE,
        };
        buf[7..9].copy_from_slice(&self.received.to_be_bytes());
        buf[9..11].copy_from_slice(&self.needed.to_be_bytes());
        buf[11..].copy_from_slice(&self.hash);
        buf
    }

    fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() != ACK_FRAME_LEN {
            return None;
        }
        let kind = match buf[6] {
            ACK_TYPE_COMPLETE => AckKind::Complete,
            ACK_TYPE_NEED_MORE => AckKind::NeedMore,
            _ => return None,
        };
        let mut hash = [0u8; 8];
        hash.copy_from_slice(&buf[11..]);
        Some(Self {
            transfer_id: u32::from_be_bytes([0, buf[3], buf[4], buf[5]]),
            kind,
            received: u16::from_be_bytes([buf[7], buf[8]]),
            needed: u16::from_be_bytes([buf[9], buf[10]]),
            hash,
        })
    }
}

/// Classification of an inbound forwarder payload.
#[derive(Debug)]
pub enum Frame {
    Data(DataFrame),
    Ack(AckFrame),
    /// Carries the fountain magic but is not a well-formed frame; drop it.
    Malformed,
}

pub fn parse_frame(buf: &[u8]) -> Option<Frame> {
    if buf.len() < 3 || buf[..3] != FOUNTAIN_MAGIC {
        return None;
    }
    if buf.len() == ACK_FRAME_LEN {
        return Some(AckFrame::parse(buf).map(Frame::Ack).unwrap_or(Frame::Malformed));
    }
    Some(DataFrame::parse(buf).map(Frame::Data).unwrap_or(Frame::Malformed))
}

/// A fountain-encoded outbound transfer.
#[derive(Debug, Clone)]
pub struct EncodedTransfer {
    pub transfer_id: u32,
    pub k: u8,
    pub block_count: u16,
    pub frames: Vec<[u8; DATA_FRAME_LEN]>,
    pub hash_prefix: [u8; 8],
}

impl EncodedTransfer {
    pub fn pending(&self) -> PendingTransfer {
        PendingTransfer {
            transfer_id: self.transfer_id,
            total_blocks: self.block_count,
            hash_prefix: self.hash_prefix,
        }
    }
}

/// Send-side record of a transfer awaiting its Complete ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransfer {
    pub transfer_id: u32,
    pub total_blocks: u16,
    pub hash_prefix: [u8; 8],
}

fn redundancy_overhead(k: usize) -> f64 {
    if k <= 10 {
        0.50
    } else if k <= 50 {
        0.25
    } else {
        0.15
    }
}

/// Split and fountain-encode a payload into ready-to-send frames.
pub fn encode_transfer(
    transfer_id: u32,
    payload: &[u8],
) -> Result<EncodedTransfer, FountainError> {
    let k = payload.len().div_ceil(BLOCK_SIZE).max(1);
    if k > MAX_SOURCE_BLOCKS {
        return Err(FountainError::EncodingFailed(format!(
            "payload of {} bytes needs {} blocks, limit is {}",
            payload.len(),
            k,
            MAX_SOURCE_BLOCKS
        )));
    }

    let blocks = source_blocks(payload, k);
    let count = (k as f64 * (1.0 + redundancy_overhead(k))).ceil() as usize;
    let dist = SolitonDistribution::new(k);

    let mut frames = Vec::with_capacity(count);
    for i in 0..count {
        let seed = block_seed(transfer_id, i as u32);
        let mut coded = [0u8; BLOCK_SIZE];
        for idx in block_indices(seed, k, i == 0, &dist) {
            xor_into(&mut coded, &blocks[idx]);
        }
        let frame = DataFrame {
            transfer_id,
            seed,
            k: k as u8,
            total_len: payload.len() as u16,
            payload: coded,
        };
        frames.push(frame.encode());
    }

    Ok(EncodedTransfer {
        transfer_id,
        k: k as u8,
        block_count: count as u16,
        frames,
        hash_prefix: sha_prefix(payload),
    })
}

fn source_blocks(payload: &[u8], k: usize) -> Vec<[u8; BLOCK_SIZE]> {
    let mut blocks = vec![[0u8; BLOCK_SIZE]; k];
    for (i, chunk) in payload.chunks(BLOCK_SIZE).enumerate() {
        blocks[i][..chunk.len()].copy_from_slice(chunk);
    }
    blocks
}

fn xor_into(dst: &mut [u8; BLOCK_SIZE], src: &[u8; BLOCK_SIZE]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

pub(crate) fn sha_prefix(data: &[u8]) -> [u8; 8] {
    let digest = Sha256::digest(data);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    prefix
}

#[derive(Clone)]
struct CodedBlock {
    indices: Vec<usize>,
    payload: [u8; BLOCK_SIZE],
}

struct ReceiveState {
    k: usize,
    total_len: usize,
    dist: SolitonDistribution,
    blocks: HashMap<u16, CodedBlock>,
    created: Instant,
}

impl ReceiveState {
    fn new(k: usize, total_len: usize) -> Self {
        Self {
            k,
            total_len,
            dist: SolitonDistribution::new(k),
            blocks: HashMap::new(),
            created: Instant::now(),
        }
    }

    /// Run the peeling schedule over everything received so far.
    fn try_decode(&self) -> Option<Vec<u8>> {
        let mut decoded: Vec<Option<[u8; BLOCK_SIZE]>> = vec![None; self.k];
        let mut working: Vec<CodedBlock> = self.blocks.values().cloned().collect();

        loop {
            let mut progress = false;
            for block in working.iter_mut() {
                // Substitute already-known sources out of this block.
                let mut i = 0;
                while i < block.indices.len() {
                    match decoded[block.indices[i]] {
                        Some(src) => {
                            xor_into(&mut block.payload, &src);
                            block.indices.swap_remove(i);
                        }
                        None => i += 1,
                    }
                }
                if block.indices.len() == 1 {
                    let idx = block.indices[0];
                    decoded[idx] = Some(block.payload);
                    block.indices.clear();
                    progress = true;
                }
            }

            if decoded.iter().all(Option::is_some) {
                let mut out = Vec::with_capacity(self.k * BLOCK_SIZE);
                for block in decoded.into_iter().flatten() {
                    out.extend_from_slice(&block);
                }
                out.truncate(self.total_len);
                return Some(out);
            }
            if !progress {
                return None;
            }
        }
    }
}

/// A fully decoded transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub transfer_id: u32,
    pub data: Vec<u8>,
    pub hash_prefix: [u8; 8],
    pub received_blocks: u16,
}

/// Receive-side state table, keyed by transfer id.
pub struct FountainReceiver {
    transfers: HashMap<u32, ReceiveState>,
    ttl: Duration,
}

impl Default for FountainReceiver {
    fn default() -> Self {
        Self::new(RECEIVE_STATE_TTL)
    }
}

impl FountainReceiver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            transfers: HashMap::new(),
            ttl,
        }
    }

    /// Feed one coded block; returns the reassembled payload once the
    /// transfer completes. Stale transfers are collected on every arrival.
    pub fn ingest(&mut self, frame: &DataFrame) -> Option<CompletedTransfer> {
        self.evict_expired();

        let k = frame.k as usize;
        let state = self
            .transfers
            .entry(frame.transfer_id)
            .or_insert_with(|| ReceiveState::new(k, frame.total_len as usize));
        if state.k != k || state.total_len != frame.total_len as usize {
            debug!(
                transfer_id = frame.transfer_id,
                "block header disagrees with transfer state, dropping"
            );
            return None;
        }
        if state.blocks.contains_key(&frame.seed) {
            trace!(
                transfer_id = frame.transfer_id,
                seed = frame.seed,
                "duplicate block"
            );
            return None;
        }

        let first = frame.seed == block_seed(frame.transfer_id, 0);
        let indices = block_indices(frame.seed, k, first, &state.dist);
        state.blocks.insert(
            frame.seed,
            CodedBlock {
                indices,
                payload: frame.payload,
            },
        );

        let data = state.try_decode()?;
        let received_blocks = state.blocks.len() as u16;
        self.transfers.remove(&frame.transfer_id);
        debug!(
            transfer_id = frame.transfer_id,
            bytes = data.len(),
            "transfer complete"
        );
        Some(CompletedTransfer {
            transfer_id: frame.transfer_id,
            hash_prefix: sha_prefix(&data),
            data,
            received_blocks,
        })
    }

    pub fn evict_expired(&mut self) {
        let ttl = self.ttl;
        self.transfers.retain(|id, state| {
            let live = state.created.elapsed() <= ttl;
            if !live {
                debug!(transfer_id = *id, "receive state expired");
            }
            live
        });
    }

    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }
}
