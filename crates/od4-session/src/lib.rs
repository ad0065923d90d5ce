//! OD4 Session -- publish/subscribe over UDP multicast.
//!
//! A session is identified by a CID (0..=255) and lives on the multicast
//! group 225.0.0.<CID>. Participants send typed Envelopes to the group and
//! receive the ones they registered callbacks for.

pub mod config;
pub mod receive_task;
pub mod registry;
pub mod session;

use std::net::{Ipv4Addr, SocketAddrV4};

use od4_protocol::ProtocolError;

pub use registry::{CallbackRegistry, Timestamps};
pub use session::{Publisher, Session};

/// Multicast group for a session identifier.
pub fn group_address(cid: u8) -> Ipv4Addr {
    Ipv4Addr::new(225, 0, 0, cid)
}

/// Session lifecycle and transport errors. Returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid CID {0}: must be in 0..=255")]
    InvalidCid(u16),
    #[error("no CID configured")]
    MissingCid,
    #[error("invalid receive size {size}: must be in {min}..={max}")]
    InvalidReceiveSize { size: usize, min: usize, max: usize },
    #[error("session already connected")]
    AlreadyConnected,
    #[error("session was stopped")]
    Stopped,
    #[error("session not connected")]
    NotConnected,
    #[error("failed to open multicast socket on port {port}: {source}")]
    Bind { port: u16, source: std::io::Error },
    #[error("failed to join multicast group {group}: {source}")]
    JoinGroup {
        group: Ipv4Addr,
        source: std::io::Error,
    },
    #[error("frame of {size} bytes exceeds UDP payload limit ({max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("send to {dest} failed: {source}")]
    Send {
        dest: SocketAddrV4,
        source: std::io::Error,
    },
    #[error("signal handler error: {0}")]
    Signal(std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Failure of a single received frame. Logged by the receive loop; never
/// stops it.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("malformed envelope: {0}")]
    Envelope(ProtocolError),
    #[error("malformed payload for data type {data_type}: {source}")]
    Payload {
        data_type: u32,
        source: ProtocolError,
    },
}
