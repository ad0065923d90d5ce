//! Receive loop -- one per connected session.
//!
//! Reads the multicast socket into a [`FrameReassembler`], decodes every
//! completed frame, and hands it to the registered callback on the
//! blocking pool so a slow handler never holds up reception. Framing and
//! decode failures are logged per frame; the loop keeps going.
//!
//! Datagrams the session sent itself are dropped before framing. They are
//! recognised by the send socket's port and a source address local to this
//! host.
//!
//! Reads are `receive_size` bytes. A datagram longer than that is
//! truncated by the kernel; senders are expected to stay below it.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use od4_protocol::{Envelope, FrameReassembler, Timestamp};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::registry::{CallbackRegistry, Timestamps};
use crate::DispatchError;

/// Pause after consecutive socket errors; the last entry repeats.
const RECV_ERROR_BACKOFF_MS: [u64; 4] = [10, 50, 250, 1_000];

/// Run until `shutdown` flips to true or its sender is dropped.
pub async fn run_receive_loop(
    socket: UdpSocket,
    registry: CallbackRegistry,
    mut reassembler: FrameReassembler,
    mut own: OwnTraffic,
    shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; reassembler.receive_size()];
    let stop = wait_for_stop(shutdown);
    tokio::pin!(stop);
    let mut recv_errors = 0usize;

    tracing::debug!(
        receive_size = buf.len(),
        send_port = own.send_port,
        "receive loop started"
    );

    loop {
        tokio::select! {
            _ = &mut stop => break,
            res = socket.recv_from(&mut buf) => {
                let (n, from) = match res {
                    Ok(r) => {
                        recv_errors = 0;
                        r
                    }
                    Err(e) => {
                        let delay = recv_backoff(recv_errors);
                        recv_errors += 1;
                        tracing::warn!(
                            consecutive = recv_errors,
                            backoff_ms = delay.as_millis() as u64,
                            "recv: socket error: {e}"
                        );
                        tokio::select! {
                            _ = &mut stop => break,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                };
                if own.matches(from) {
                    tracing::trace!(%from, bytes = n, "recv: own datagram, skipping");
                    continue;
                }
                let received = Timestamp::now();
                tracing::trace!(%from, bytes = n, "recv: datagram");

                for frame in reassembler.feed(&buf[..n]) {
                    let body = match frame {
                        Ok(body) => body,
                        Err(e) => {
                            tracing::warn!(%from, "recv: framing error: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = dispatch(&registry, &body, received) {
                        tracing::warn!(%from, "recv: dispatch failed: {e}");
                    }
                }
            }
        }
    }

    tracing::debug!("receive loop stopped");
}

fn recv_backoff(consecutive: usize) -> Duration {
    let idx = consecutive.min(RECV_ERROR_BACKOFF_MS.len() - 1);
    Duration::from_millis(RECV_ERROR_BACKOFF_MS[idx])
}

/// Matches datagrams sent by this session's own send socket.
#[derive(Debug)]
pub struct OwnTraffic {
    send_port: u16,
    local: HashMap<IpAddr, bool>,
}

impl OwnTraffic {
    pub fn new(send_port: u16) -> Self {
        Self {
            send_port,
            local: HashMap::new(),
        }
    }

    /// True when `from` carries the send port and an address of this host.
    pub fn matches(&mut self, from: SocketAddr) -> bool {
        if from.port() != self.send_port {
            return false;
        }
        *self
            .local
            .entry(from.ip())
            .or_insert_with(|| is_local_address(from.ip()))
    }
}

// Binding succeeds only for addresses assigned to this host.
fn is_local_address(ip: IpAddr) -> bool {
    ip.is_loopback() || std::net::UdpSocket::bind(SocketAddr::new(ip, 0)).is_ok()
}

/// Resolves once the stop flag is set, including when it was set before
/// this receiver was created.
pub(crate) async fn wait_for_stop(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Decode one frame body and hand it to the matching callbacks.
///
/// `received` is stamped into the envelope unless the wire already carries
/// one. Returns how many handlers were scheduled; an unregistered data
/// type is not an error and yields 0. Must run inside a tokio runtime.
pub fn dispatch(
    registry: &CallbackRegistry,
    body: &[u8],
    received: Timestamp,
) -> Result<usize, DispatchError> {
    let mut envelope = od4_protocol::decode(body).map_err(DispatchError::Envelope)?;
    if envelope.received.map_or(true, |ts| ts.is_zero()) {
        envelope.received = Some(received);
    }

    let timestamps = wall_clock(&envelope);
    let mut scheduled = 0;

    if let Some(handler) = registry.catch_all() {
        let env = envelope.clone();
        tokio::task::spawn_blocking(move || (*handler)(env));
        scheduled += 1;
    }

    match registry.lookup(envelope.data_type) {
        Some(callback) => {
            let job = callback.prepare(&envelope, timestamps)?;
            tokio::task::spawn_blocking(job);
            scheduled += 1;
        }
        None => {
            tracing::trace!(data_type = envelope.data_type, "no callback registered, dropping");
        }
    }

    Ok(scheduled)
}

fn wall_clock(envelope: &Envelope) -> Timestamps {
    envelope.timestamps().map(|ts| ts.to_datetime())
}
