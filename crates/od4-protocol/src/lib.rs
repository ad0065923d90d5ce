//! OD4 Protocol -- Envelope types, frame codec, frame reassembly.
//!
//! UDP multicast to 225.0.0.<CID>. Each datagram carries one frame:
//! 0x0D, then a little-endian u32 `(body_len << 8) | 0xA4`, then a
//! protobuf-encoded Envelope of `body_len` bytes.

pub mod codec;
pub mod envelope;
pub mod reassembler;

pub use codec::{EnvelopeCodec, FrameHeader};
pub use envelope::{decode, encode, encode_with, Envelope, Timestamp};
pub use reassembler::{FrameReassembler, ScanPolicy};

/// First header byte.
pub const HEADER_MAGIC_BYTE0: u8 = 0x0D;

/// Low byte of the little-endian length word.
pub const HEADER_MAGIC_BYTE1: u8 = 0xA4;

/// Frame header size in bytes.
pub const HEADER_SIZE: usize = 5;

/// Largest body length the 24-bit length field can carry.
pub const MAX_BODY_LEN: usize = (1 << 24) - 1;

/// Fixed socket read size used by the receive loop.
pub const RECEIVE_SIZE: usize = 2048;

/// Largest UDP payload over IPv4: 0xFFFF minus IPv4 (20) and UDP (8) headers.
pub const MAX_UDP_PAYLOAD: usize = 0xFFFF - 20 - 8;

/// Default multicast port for OD4 sessions.
pub const DEFAULT_PORT: u16 = 12175;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid header magic: got {byte0:#04x} {byte1:#04x}")]
    InvalidMagic { byte0: u8, byte1: u8 },
    #[error("frame body too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("envelope decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
