//! Frame header and Envelope codec.
//!
//! Wire format: 0x0D, little-endian u32 `(body_len << 8) | 0xA4`, then
//! `body_len` bytes of protobuf-encoded Envelope.

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::Envelope;
use crate::{ProtocolError, HEADER_MAGIC_BYTE0, HEADER_MAGIC_BYTE1, HEADER_SIZE, MAX_BODY_LEN};

/// The fixed 5-byte header in front of every Envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub body_len: usize,
}

impl FrameHeader {
    /// Header for a body of `body_len` bytes. Fails above 2^24 - 1.
    pub fn new(body_len: usize) -> Result<Self, ProtocolError> {
        if body_len > MAX_BODY_LEN {
            return Err(ProtocolError::FrameTooLarge {
                size: body_len,
                max: MAX_BODY_LEN,
            });
        }
        Ok(Self { body_len })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let word = ((self.body_len as u32) << 8) | u32::from(HEADER_MAGIC_BYTE1);
        let le = word.to_le_bytes();
        [HEADER_MAGIC_BYTE0, le[0], le[1], le[2], le[3]]
    }

    /// Parse the first [`HEADER_SIZE`] bytes of `src`.
    ///
    /// Returns `Ok(None)` when fewer than five bytes are available.
    pub fn parse(src: &[u8]) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        if src[0] != HEADER_MAGIC_BYTE0 || src[1] != HEADER_MAGIC_BYTE1 {
            return Err(ProtocolError::InvalidMagic {
                byte0: src[0],
                byte1: src[1],
            });
        }
        let word = u32::from_le_bytes([src[1], src[2], src[3], src[4]]);
        Ok(Some(Self {
            body_len: (word >> 8) as usize,
        }))
    }

    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.body_len
    }
}

/// Codec for framing Envelope values over a contiguous byte stream.
///
/// Datagram receivers that see partial deliveries should use
/// [`crate::FrameReassembler`] instead; this decoder fails hard on a bad
/// header and does not resynchronise.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvelopeCodec;

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match FrameHeader::parse(src)? {
            Some(h) => h,
            None => return Ok(None),
        };

        let total = header.frame_len();
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let body = src.split_to(header.body_len);
        Ok(Some(Envelope::decode(body.freeze())?))
    }
}

impl Encoder<&Envelope> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = FrameHeader::new(item.encoded_len())?;

        dst.reserve(header.frame_len());
        dst.put_slice(&header.to_bytes());
        item.encode(dst)
            .map_err(|e| ProtocolError::Io(std::io::Error::other(e)))?;

        Ok(())
    }
}
