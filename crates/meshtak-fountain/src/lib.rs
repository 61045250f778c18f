//! # MeshTAK Fountain
//!
//! Reliable-transfer codec for large CoT payloads crossing the mesh: zlib
//! compression plus an LT (Luby Transform) fountain code. Block degrees and
//! index sets are drawn from a bit-exact reproduction of the Java 48-bit
//! linear-congruential generator, so transfers interoperate with the Android
//! peer implementation.

mod codec;
mod lcg;
mod soliton;
mod zlib;

pub use codec::{
    block_indices, block_seed, encode_transfer, generate_transfer_id, parse_frame, AckFrame,
    AckKind, CompletedTransfer, DataFrame, EncodedTransfer, FountainError, FountainReceiver,
    Frame, PendingTransfer, ACK_FRAME_LEN, BLOCK_SIZE, DATA_FRAME_LEN, FOUNTAIN_MAGIC,
    MAX_DIRECT_PAYLOAD, RECEIVE_STATE_TTL, TRANSPORT_COT, TRANSPORT_FILE,
};
pub use lcg::JavaRandom;
pub use soliton::SolitonDistribution;
pub use zlib::{compress, decompress, ZlibError};
