//! Session lifecycle: connect, send, register, run, shutdown.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use od4_protocol::{Envelope, FrameReassembler, Timestamp, HEADER_SIZE, MAX_UDP_PAYLOAD};
use prost::Message;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::receive_task::{run_receive_loop, wait_for_stop, OwnTraffic};
use crate::registry::{CallbackRegistry, Timestamps};
use crate::{group_address, SessionError};

/// Largest useful socket read: one whole UDP datagram.
pub const MAX_RECEIVE_SIZE: usize = u16::MAX as usize;

/// A participant in one OD4 session.
///
/// `connect()` opens a receive socket on the group port and a send socket on
/// an ephemeral port, then starts the receive loop exactly once. Datagrams
/// from the session's own send socket are not delivered back to it.
/// The loop runs until [`Session::stop`] or [`Session::shutdown`] is called
/// or the session is dropped.
pub struct Session {
    cid: u8,
    group: Ipv4Addr,
    config: SessionConfig,
    registry: CallbackRegistry,
    publisher: Option<Publisher>,
    local_addr: Option<SocketAddr>,
    receive_handle: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Session {
    /// Session on the default port. Fails for a CID above 255.
    pub fn new(cid: u16) -> Result<Self, SessionError> {
        Self::from_config(SessionConfig::for_cid(cid))
    }

    pub fn with_port(cid: u16, port: u16) -> Result<Self, SessionError> {
        let mut config = SessionConfig::for_cid(cid);
        config.session.port = port;
        Self::from_config(config)
    }

    pub fn from_config(config: SessionConfig) -> Result<Self, SessionError> {
        let raw = config.session.cid.ok_or(SessionError::MissingCid)?;
        let cid = u8::try_from(raw).map_err(|_| SessionError::InvalidCid(raw))?;
        let receive_size = config.receiver.receive_size;
        if receive_size <= HEADER_SIZE || receive_size > MAX_RECEIVE_SIZE {
            return Err(SessionError::InvalidReceiveSize {
                size: receive_size,
                min: HEADER_SIZE + 1,
                max: MAX_RECEIVE_SIZE,
            });
        }
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            cid,
            group: group_address(cid),
            config,
            registry: CallbackRegistry::new(),
            publisher: None,
            local_addr: None,
            receive_handle: None,
            shutdown_tx,
        })
    }

    pub fn cid(&self) -> u8 {
        self.cid
    }

    pub fn group(&self) -> Ipv4Addr {
        self.group
    }

    pub fn port(&self) -> u16 {
        self.config.session.port
    }

    pub fn is_connected(&self) -> bool {
        self.publisher.is_some()
    }

    /// Whether the receive loop is alive.
    pub fn is_running(&self) -> bool {
        self.receive_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    /// Local address of the receive socket.
    pub fn local_addr(&self) -> Result<SocketAddr, SessionError> {
        self.local_addr.ok_or(SessionError::NotConnected)
    }

    /// Open the sockets, join the group, and start receiving.
    ///
    /// A second call fails with [`SessionError::AlreadyConnected`], and a
    /// call after [`Session::stop`] fails with [`SessionError::Stopped`].
    /// Must be called from within a tokio runtime.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.publisher.is_some() {
            return Err(SessionError::AlreadyConnected);
        }
        if *self.shutdown_tx.borrow() {
            return Err(SessionError::Stopped);
        }

        let port = self.port();
        let recv_err = |source| SessionError::Bind { port, source };
        let send_err = |source| SessionError::Bind { port: 0, source };

        let recv_socket = UdpSocket::from_std(open_multicast_socket(self.group, &self.config)?)
            .map_err(recv_err)?;
        let send_socket =
            UdpSocket::from_std(open_send_socket(&self.config)?).map_err(send_err)?;
        let local_addr = recv_socket.local_addr().map_err(recv_err)?;
        let send_port = send_socket.local_addr().map_err(send_err)?.port();

        let reassembler = FrameReassembler::new(self.config.receiver.scan_policy.into())
            .with_receive_size(self.config.receiver.receive_size);
        let handle = tokio::spawn(run_receive_loop(
            recv_socket,
            self.registry.clone(),
            reassembler,
            OwnTraffic::new(send_port),
            self.shutdown_tx.subscribe(),
        ));

        self.publisher = Some(Publisher {
            socket: Arc::new(send_socket),
            dest: SocketAddrV4::new(self.group, port),
        });
        self.local_addr = Some(local_addr);
        self.receive_handle = Some(handle);

        tracing::info!(
            cid = self.cid,
            group = %self.group,
            port,
            send_port,
            "joined session"
        );
        Ok(())
    }

    /// Handle for sending, cloneable into callbacks and other tasks.
    pub fn publisher(&self) -> Result<&Publisher, SessionError> {
        self.publisher.as_ref().ok_or(SessionError::NotConnected)
    }

    /// Send `payload` as one Envelope of `data_type`. Returns bytes sent.
    pub async fn send(&self, data_type: u32, payload: &[u8]) -> Result<usize, SessionError> {
        self.publisher()?.send(data_type, payload).await
    }

    /// Encode `message` and send it as `data_type`.
    pub async fn send_message<T: Message>(
        &self,
        data_type: u32,
        message: &T,
    ) -> Result<usize, SessionError> {
        self.publisher()?.send_message(data_type, message).await
    }

    /// Register `handler` for `data_type`, replacing any earlier one.
    pub fn register_message_callback<T, F>(&self, data_type: u32, handler: F)
    where
        T: Message + Default + Send + 'static,
        F: Fn(T, Timestamps) + Send + Sync + 'static,
    {
        self.registry.register(data_type, handler);
    }

    /// Like [`Session::register_message_callback`] with an extra argument
    /// handed to every invocation.
    pub fn register_message_callback_with<T, F, A>(&self, data_type: u32, handler: F, extra: A)
    where
        T: Message + Default + Send + 'static,
        F: Fn(T, Timestamps, A) + Send + Sync + 'static,
        A: Clone + Send + Sync + 'static,
    {
        self.registry.register_with(data_type, handler, extra);
    }

    pub fn unregister_message_callback(&self, data_type: u32) -> bool {
        self.registry.unregister(data_type)
    }

    /// Receive every Envelope, regardless of data type.
    ///
    /// Runs in addition to any typed callback registered for the same data
    /// type; it does not replace them.
    pub fn on_envelope<F>(&self, handler: F)
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.registry.set_catch_all(handler);
    }

    /// Block until Ctrl-C or [`Session::stop`].
    pub async fn run(&self) -> Result<(), SessionError> {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.map_err(SessionError::Signal)?;
                tracing::info!(cid = self.cid, "interrupt received, stopping session");
                self.stop();
            }
            _ = wait_for_stop(self.shutdown_tx.subscribe()) => {}
        }
        Ok(())
    }

    /// Call `delegate` at `freq_hz` until it returns false or the session
    /// stops. A non-positive frequency runs at 1 Hz.
    pub async fn time_trigger<F>(&self, freq_hz: f32, mut delegate: F)
    where
        F: FnMut() -> bool,
    {
        let hz = if freq_hz > 0.0 { freq_hz } else { 1.0 };
        let slice = Duration::from_secs_f32(1.0 / hz);
        let mut ticker = tokio::time::interval(slice);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let stop = wait_for_stop(self.shutdown_tx.subscribe());
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {}
            }

            let started = Instant::now();
            if !delegate() {
                break;
            }
            let spent = started.elapsed();
            if spent > slice {
                tracing::warn!(
                    spent_ms = spent.as_millis() as u64,
                    slice_ms = slice.as_millis() as u64,
                    "time-triggered delegate violated allocated time slice"
                );
            }
        }
    }

    /// Signal the receive loop and any `run()` callers to stop.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Stop and wait for the receive loop to finish.
    pub async fn shutdown(&mut self) {
        self.stop();
        if let Some(handle) = self.receive_handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("receive loop ended abnormally: {e}");
            }
        }
        tracing::info!(cid = self.cid, "session stopped");
    }
}

/// Sending half of a connected session. Cheap to clone; safe to use from
/// many tasks and from callback handlers.
#[derive(Clone, Debug)]
pub struct Publisher {
    socket: Arc<UdpSocket>,
    dest: SocketAddrV4,
}

impl Publisher {
    pub fn destination(&self) -> SocketAddrV4 {
        self.dest
    }

    /// Address of the send socket. Its port identifies this session's own
    /// datagrams on the receive side.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn send(&self, data_type: u32, payload: &[u8]) -> Result<usize, SessionError> {
        self.send_with(data_type, payload, None, 0).await
    }

    pub async fn send_message<T: Message>(
        &self,
        data_type: u32,
        message: &T,
    ) -> Result<usize, SessionError> {
        self.send(data_type, &message.encode_to_vec()).await
    }

    /// Send with an explicit sample time point and sender stamp. Without a
    /// sample time point the sent time is used.
    pub async fn send_with(
        &self,
        data_type: u32,
        payload: &[u8],
        sample: Option<DateTime<Utc>>,
        sender_stamp: u32,
    ) -> Result<usize, SessionError> {
        let frame = build_frame(data_type, payload, sample, sender_stamp)?;
        self.socket
            .send_to(&frame, self.dest)
            .await
            .map_err(|source| SessionError::Send {
                dest: self.dest,
                source,
            })
    }

    /// Non-async send for use inside synchronous callback handlers.
    ///
    /// Fails with a `WouldBlock` send error if the socket buffer is full.
    pub fn try_send(&self, data_type: u32, payload: &[u8]) -> Result<usize, SessionError> {
        let frame = build_frame(data_type, payload, None, 0)?;
        self.socket
            .try_send_to(&frame, SocketAddr::V4(self.dest))
            .map_err(|source| SessionError::Send {
                dest: self.dest,
                source,
            })
    }
}

fn build_frame(
    data_type: u32,
    payload: &[u8],
    sample: Option<DateTime<Utc>>,
    sender_stamp: u32,
) -> Result<Bytes, SessionError> {
    let sample = sample.map(Timestamp::from_datetime).unwrap_or_default();
    let frame = od4_protocol::encode_with(data_type, payload, Timestamp::now(), sample, sender_stamp)?;
    if frame.len() > MAX_UDP_PAYLOAD {
        return Err(SessionError::PayloadTooLarge {
            size: frame.len(),
            max: MAX_UDP_PAYLOAD,
        });
    }
    tracing::trace!(data_type, bytes = frame.len(), "send: frame built");
    Ok(frame)
}

/// Receive side: bound to the group port, shared with other participants
/// on this host.
fn open_multicast_socket(
    group: Ipv4Addr,
    config: &SessionConfig,
) -> Result<std::net::UdpSocket, SessionError> {
    let port = config.session.port;
    let bind_err = |source| SessionError::Bind { port, source };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true).map_err(bind_err)?;
    socket
        .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
        .map_err(bind_err)?;

    socket
        .join_multicast_v4(&group, &config.network.interface)
        .map_err(|source| SessionError::JoinGroup { group, source })?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    Ok(socket.into())
}

/// Send side: an ephemeral port owned by this session alone.
fn open_send_socket(config: &SessionConfig) -> Result<std::net::UdpSocket, SessionError> {
    let net = &config.network;
    let bind_err = |source| SessionError::Bind { port: 0, source };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    socket
        .bind(&SocketAddrV4::new(net.interface, 0).into())
        .map_err(bind_err)?;
    socket.set_multicast_loop_v4(net.multicast_loop).map_err(bind_err)?;
    socket.set_multicast_ttl_v4(net.multicast_ttl).map_err(bind_err)?;
    if !net.interface.is_unspecified() {
        socket.set_multicast_if_v4(&net.interface).map_err(bind_err)?;
    }
    socket.set_nonblocking(true).map_err(bind_err)?;

    Ok(socket.into())
}
