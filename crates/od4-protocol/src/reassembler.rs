//! Frame reassembly from socket reads.
//!
//! Turns a sequence of arbitrarily sized reads into complete frame bodies.
//! Two states: waiting for a 5-byte header, or waiting for `n` body bytes.
//! A bad header is reported once and the buffer is resynchronised on the
//! next `0x0D 0xA4` pair.
//!
//! Scanning follows [`ScanPolicy`]. Under the default `BoundarySignal`, a
//! read of exactly `receive_size` bytes is assumed to be a partial delivery
//! and is buffered without scanning; only a shorter read lets frames out.
//! This assumes every datagram arrives in one read smaller than
//! `receive_size`. A datagram of `receive_size` bytes or more stays buffered
//! until the next short read arrives.

use bytes::{Buf, Bytes, BytesMut};

use crate::codec::FrameHeader;
use crate::{
    ProtocolError, HEADER_MAGIC_BYTE0, HEADER_MAGIC_BYTE1, HEADER_SIZE, MAX_UDP_PAYLOAD,
    RECEIVE_SIZE,
};

/// When buffered bytes are run through the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanPolicy {
    /// Scan only after a read shorter than the receive size.
    #[default]
    BoundarySignal,
    /// Scan after every read.
    EveryRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHeader,
    AwaitingBody(usize),
}

#[derive(Debug)]
pub struct FrameReassembler {
    buf: BytesMut,
    state: State,
    policy: ScanPolicy,
    receive_size: usize,
    max_body_len: usize,
    scannable: bool,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(ScanPolicy::default())
    }
}

impl FrameReassembler {
    pub fn new(policy: ScanPolicy) -> Self {
        Self {
            buf: BytesMut::with_capacity(RECEIVE_SIZE * 2),
            state: State::AwaitingHeader,
            policy,
            receive_size: RECEIVE_SIZE,
            max_body_len: MAX_UDP_PAYLOAD - HEADER_SIZE,
            scannable: false,
        }
    }

    /// Override the read size that counts as a partial delivery.
    pub fn with_receive_size(mut self, receive_size: usize) -> Self {
        self.receive_size = receive_size;
        self
    }

    /// Headers announcing more than `max` body bytes are treated as corrupt.
    pub fn with_max_body_len(mut self, max: usize) -> Self {
        self.max_body_len = max;
        self
    }

    pub fn receive_size(&self) -> usize {
        self.receive_size
    }

    /// Bytes currently held, including a consumed header's pending body.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append one socket read.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        self.scannable = match self.policy {
            ScanPolicy::EveryRead => true,
            ScanPolicy::BoundarySignal => chunk.len() < self.receive_size,
        };
    }

    /// Append one read and iterate over whatever frames it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.push(chunk);
        self.frames()
    }

    /// Frames available without further input. Stops at the first point
    /// where more bytes are needed; calling again after the next `push`
    /// resumes where it left off.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { inner: self }
    }

    /// Advance the state machine by at most one frame or error event.
    pub fn next_frame(&mut self) -> Option<Result<Bytes, ProtocolError>> {
        if !self.scannable {
            return None;
        }

        loop {
            match self.state {
                State::AwaitingHeader => {
                    match FrameHeader::parse(&self.buf) {
                        Ok(None) => return None,
                        Ok(Some(header)) if header.body_len > self.max_body_len => {
                            self.resync();
                            return Some(Err(ProtocolError::FrameTooLarge {
                                size: header.body_len,
                                max: self.max_body_len,
                            }));
                        }
                        Ok(Some(header)) => {
                            self.buf.advance(HEADER_SIZE);
                            self.state = State::AwaitingBody(header.body_len);
                        }
                        Err(e) => {
                            self.resync();
                            return Some(Err(e));
                        }
                    }
                }
                State::AwaitingBody(n) => {
                    if self.buf.len() < n {
                        return None;
                    }
                    let body = self.buf.split_to(n).freeze();
                    self.state = State::AwaitingHeader;
                    return Some(Ok(body));
                }
            }
        }
    }

    /// Drop bytes up to the next candidate header start, always at least one.
    fn resync(&mut self) {
        let skip = self.buf[1..]
            .windows(2)
            .position(|w| w[0] == HEADER_MAGIC_BYTE0 && w[1] == HEADER_MAGIC_BYTE1)
            .map(|pos| pos + 1)
            .unwrap_or_else(|| {
                // Keep a trailing 0x0D; it may pair with the next read.
                match self.buf.last() {
                    Some(&HEADER_MAGIC_BYTE0) if self.buf.len() > 1 => self.buf.len() - 1,
                    _ => self.buf.len(),
                }
            });
        tracing::debug!(skipped = skip, "reassembler: resynchronising");
        self.buf.advance(skip);
    }
}

/// Iterator over completed frame bodies. Framing errors are yielded as
/// items; the reassembler has already recovered when one is returned.
pub struct Frames<'a> {
    inner: &'a mut FrameReassembler,
}

impl Iterator for Frames<'_> {
    type Item = Result<Bytes, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next_frame()
    }
}
