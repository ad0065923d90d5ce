//! Test harness for in-process od4-session integration tests.
//!
//! Provides connected sessions on dedicated ports, a raw group listener
//! for inspecting datagrams on the wire, and a small test message type.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use od4_session::{group_address, Session};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Port for a test, offset from a base unlikely to collide with a real
/// session on 12175.
pub fn test_port(offset: u16) -> u16 {
    23100 + offset
}

/// Application message used across tests; mirrors a single text field.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TestMessage {
    #[prost(string, tag = "11")]
    pub attribute11: String,
}

impl TestMessage {
    pub fn new(text: &str) -> Self {
        Self {
            attribute11: text.to_string(),
        }
    }
}

/// A session on `cid`/`port`, already connected.
pub async fn connected_session(cid: u16, port: u16) -> anyhow::Result<Session> {
    let mut session = Session::with_port(cid, port)?;
    session.connect().await?;
    Ok(session)
}

/// Plain socket joined to the session group, reading whole datagrams.
pub async fn raw_listener(cid: u8, port: u16) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.join_multicast_v4(&group_address(cid), &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Next datagram on `socket`, or an error after [`TIMEOUT`].
pub async fn recv_datagram(socket: &UdpSocket) -> anyhow::Result<Vec<u8>> {
    let mut buf = vec![0u8; 65536];
    let (n, _) = tokio::time::timeout(TIMEOUT, socket.recv_from(&mut buf)).await??;
    buf.truncate(n);
    Ok(buf)
}

/// Next value on `rx`, or an error after [`TIMEOUT`].
pub async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> anyhow::Result<T> {
    match tokio::time::timeout(TIMEOUT, rx.recv()).await {
        Ok(Some(v)) => Ok(v),
        Ok(None) => anyhow::bail!("channel closed"),
        Err(_) => anyhow::bail!("timeout after {:?}", TIMEOUT),
    }
}

/// Assert nothing arrives on `rx` for `wait`.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>, wait: Duration) {
    if let Ok(Some(v)) = tokio::time::timeout(wait, rx.recv()).await {
        panic!("unexpected delivery: {v:?}");
    }
}
