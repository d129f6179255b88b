//! Socket transport: TCP for unicast requests, UDP for LAN broadcasts.
//!
//! Sockets are created with socket2 at bind time so port conflicts surface
//! before a session starts, and converted to tokio sockets when listening
//! begins. Every accepted connection, received datagram and outbound send
//! runs on its own task in a shared `TaskTracker`; `stop_listening` cancels
//! the two receive loops and waits for the tracker to drain.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use peerfs_core::config::NetworkConfig;
use peerfs_core::wire::{MessageHeader, HEADER_SIZE};

use crate::error::TransportError;
use crate::network::{
    Channel, MessageHandler, Network, OperationKind, OperationStatus, SocketOperation,
};

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 65_536;

pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    local_addr: Ipv4Addr,
    bind_addr: Ipv4Addr,
    tcp_port: u16,
    broadcast_target: SocketAddrV4,
    sender: std::net::UdpSocket,
    listeners: Mutex<Option<Listeners>>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    self_broadcasts: AtomicBool,
    connect_timeout: Duration,
    recv_timeout: Duration,
    max_payload: usize,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Bound but not yet polled sockets.
struct Listeners {
    tcp: std::net::TcpListener,
    udp: std::net::UdpSocket,
}

impl Transport {
    /// Bind the TCP listener, the UDP receiver and the UDP sender.
    ///
    /// Port 0 in the config binds an OS-assigned port; the bound ports are
    /// what `tcp_port()` and `udp_port()` report and what sends target.
    pub fn bind(config: &NetworkConfig) -> Result<Self, TransportError> {
        let tcp_addr = SocketAddrV4::new(config.bind_addr, config.tcp_port);
        let tcp = make_tcp_listener(tcp_addr).map_err(|source| TransportError::Bind {
            what: "tcp listener",
            addr: tcp_addr,
            source,
        })?;
        let tcp_port = tcp.local_addr()?.port();

        let udp_addr = SocketAddrV4::new(udp_listen_addr(config), config.udp_port);
        let udp = make_udp_receiver(udp_addr).map_err(|source| TransportError::Bind {
            what: "udp receiver",
            addr: udp_addr,
            source,
        })?;
        let udp_port = udp.local_addr()?.port();

        let sender_addr = SocketAddrV4::new(config.bind_addr, 0);
        let sender = make_udp_sender(sender_addr).map_err(|source| TransportError::Bind {
            what: "udp sender",
            addr: sender_addr,
            source,
        })?;

        let local_addr = resolve_local_addr(config)?;

        tracing::info!(
            local_addr = %local_addr,
            tcp_port,
            udp_port,
            broadcast_addr = %config.broadcast_addr,
            "transport bound"
        );

        Ok(Self {
            inner: Arc::new(TransportInner {
                local_addr,
                bind_addr: config.bind_addr,
                tcp_port,
                broadcast_target: SocketAddrV4::new(config.broadcast_addr, udp_port),
                sender,
                listeners: Mutex::new(Some(Listeners { tcp, udp })),
                handler: RwLock::new(None),
                self_broadcasts: AtomicBool::new(false),
                connect_timeout: config.connect_timeout(),
                recv_timeout: config.recv_timeout(),
                max_payload: config.max_payload_bytes,
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn tcp_port(&self) -> u16 {
        self.inner.tcp_port
    }

    pub fn udp_port(&self) -> u16 {
        self.inner.broadcast_target.port()
    }
}

impl Network for Transport {
    fn local_addr(&self) -> Ipv4Addr {
        self.inner.local_addr
    }

    fn start_listening(&self, handler: Arc<dyn MessageHandler>) -> Result<(), TransportError> {
        let listeners = self
            .inner
            .listeners
            .lock()
            .take()
            .ok_or(TransportError::AlreadyListening)?;
        let tcp = TcpListener::from_std(listeners.tcp)?;
        let udp = UdpSocket::from_std(listeners.udp)?;

        *self.inner.handler.write() = Some(handler.clone());

        let inner = self.inner.clone();
        let accept_handler = handler.clone();
        self.inner
            .tracker
            .spawn(async move { inner.accept_loop(tcp, accept_handler).await });

        let inner = self.inner.clone();
        self.inner
            .tracker
            .spawn(async move { inner.recv_loop(udp, handler).await });

        tracing::info!(tcp_port = self.inner.tcp_port, "transport listening");
        Ok(())
    }

    fn stop_listening(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.inner.shutdown.cancel();
            self.inner.tracker.close();
            self.inner.tracker.wait().await;
            *self.inner.handler.write() = None;
            tracing::info!("transport stopped");
        })
    }

    fn send_unicast(&self, frame: Bytes, dest: Ipv4Addr) {
        if self.inner.shutdown.is_cancelled() {
            tracing::warn!(dest = %dest, "transport stopped, unicast dropped");
            return;
        }
        let inner = self.inner.clone();
        let handler = self.inner.handler.read().clone();
        self.inner.tracker.spawn(async move {
            if let Err(op) = inner.deliver(&frame, dest).await {
                tracing::warn!(dest = %dest, operation = %op, "unicast failed");
                if let Some(handler) = handler {
                    handler.on_error(op);
                }
            }
        });
    }

    fn broadcast(&self, frame: Bytes) {
        if let Err(e) = self.inner.sender.send_to(&frame, self.inner.broadcast_target) {
            tracing::warn!(error = %e, target = %self.inner.broadcast_target, "broadcast failed");
            if let Some(handler) = self.inner.handler.read().clone() {
                handler.on_error(SocketOperation::new(
                    OperationKind::UdpSend,
                    OperationStatus::SendFailed,
                    None,
                ));
            }
        }
    }

    fn set_self_broadcasts(&self, enabled: bool) {
        self.inner.self_broadcasts.store(enabled, Ordering::Relaxed);
    }
}

impl TransportInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener, handler: Arc<dyn MessageHandler>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!("accept loop shutting down");
                    return;
                }

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok((stream, SocketAddr::V4(peer))) => (stream, *peer.ip()),
                        Ok((_, peer)) => {
                            tracing::trace!(peer = %peer, "ignoring non-IPv4 connection");
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            handler.on_error(SocketOperation::new(
                                OperationKind::TcpReceive,
                                OperationStatus::ReceiveFailed,
                                None,
                            ));
                            continue;
                        }
                    };

                    let inner = self.clone();
                    let handler = handler.clone();
                    self.tracker.spawn(async move {
                        match inner.read_frame(stream).await {
                            Ok(frame) => handler.on_message(frame, peer, Channel::Unicast),
                            Err(status) => {
                                tracing::warn!(peer = %peer, status = ?status, "receive failed");
                                handler.on_error(SocketOperation::new(
                                    OperationKind::TcpReceive,
                                    status,
                                    Some(peer),
                                ));
                            }
                        }
                    });
                }
            }
        }
    }

    async fn recv_loop(self: Arc<Self>, socket: UdpSocket, handler: Arc<dyn MessageHandler>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!("broadcast receiver shutting down");
                    return;
                }

                received = socket.recv_from(&mut buf) => {
                    let (len, sender) = match received {
                        Ok((len, SocketAddr::V4(src))) => (len, *src.ip()),
                        Ok((_, src)) => {
                            tracing::trace!(src = %src, "ignoring non-IPv4 datagram");
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            handler.on_error(SocketOperation::new(
                                OperationKind::UdpReceive,
                                OperationStatus::ReceiveFailed,
                                None,
                            ));
                            continue;
                        }
                    };

                    if sender == self.local_addr && !self.self_broadcasts.load(Ordering::Relaxed) {
                        tracing::trace!("ignoring own broadcast");
                        continue;
                    }

                    let frame = Bytes::copy_from_slice(&buf[..len]);
                    let handler = handler.clone();
                    self.tracker.spawn(async move {
                        handler.on_message(frame, sender, Channel::Broadcast);
                    });
                }
            }
        }
    }

    /// Read one header-framed message and nothing more.
    async fn read_frame(&self, mut stream: TcpStream) -> Result<Bytes, OperationStatus> {
        let mut header = [0u8; HEADER_SIZE];
        self.read_bounded(&mut stream, &mut header).await?;

        let payload_len = MessageHeader::parse(&header)
            .map_err(|_| OperationStatus::Malformed)?
            .payload_len();
        if payload_len > self.max_payload {
            let err = TransportError::FrameTooLarge {
                declared: payload_len,
                limit: self.max_payload,
            };
            tracing::warn!(error = %err, "refusing frame");
            return Err(OperationStatus::Malformed);
        }

        let mut frame = vec![0u8; HEADER_SIZE + payload_len];
        frame[..HEADER_SIZE].copy_from_slice(&header);
        self.read_bounded(&mut stream, &mut frame[HEADER_SIZE..]).await?;
        Ok(Bytes::from(frame))
    }

    async fn read_bounded(&self, stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), OperationStatus> {
        match tokio::time::timeout(self.recv_timeout, stream.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(OperationStatus::ReceiveFailed),
            Err(_) => Err(OperationStatus::TimedOut),
        }
    }

    /// One connection per frame: connect, write, close.
    async fn deliver(&self, frame: &[u8], dest: Ipv4Addr) -> Result<(), SocketOperation> {
        let fail = |status| SocketOperation::new(OperationKind::TcpSend, status, Some(dest));

        let socket = TcpSocket::new_v4().map_err(|_| fail(OperationStatus::CantOpenSocket))?;
        if !self.bind_addr.is_unspecified() {
            socket
                .bind(SocketAddrV4::new(self.bind_addr, 0).into())
                .map_err(|_| fail(OperationStatus::CantOpenSocket))?;
        }

        let target = SocketAddrV4::new(dest, self.tcp_port);
        let mut stream = match tokio::time::timeout(self.connect_timeout, socket.connect(target.into())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(_)) => return Err(fail(OperationStatus::CantConnect)),
            Err(_) => return Err(fail(OperationStatus::TimedOut)),
        };

        match tokio::time::timeout(self.connect_timeout, stream.write_all(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(fail(OperationStatus::SendFailed)),
            Err(_) => return Err(fail(OperationStatus::TimedOut)),
        }
        let _ = stream.shutdown().await;
        tracing::trace!(dest = %dest, bytes = frame.len(), "unicast delivered");
        Ok(())
    }
}

// ── Socket construction ───────────────────────────────────────────────────────

fn make_tcp_listener(addr: SocketAddrV4) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(socket.into())
}

fn make_udp_receiver(addr: SocketAddrV4) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Blocking socket; datagrams are small enough that `send_to` returns at once.
fn make_udp_sender(addr: SocketAddrV4) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// A socket bound to a unicast address never sees datagrams sent to a
/// broadcast address, so the receiver takes the wildcard unless broadcasts
/// stay on loopback, where several nodes share one host and port.
fn udp_listen_addr(config: &NetworkConfig) -> Ipv4Addr {
    if config.broadcast_addr.is_loopback() {
        config.bind_addr
    } else {
        Ipv4Addr::UNSPECIFIED
    }
}

/// Own address: explicit advertise address, else a concrete bind address,
/// else whatever source address the kernel would route from.
fn resolve_local_addr(config: &NetworkConfig) -> Result<Ipv4Addr, TransportError> {
    if let Some(addr) = config.advertise_addr {
        return Ok(addr);
    }
    if !config.bind_addr.is_unspecified() {
        return Ok(config.bind_addr);
    }
    probe_local_addr(config.broadcast_addr).map_err(TransportError::AddressDiscovery)
}

/// Connecting a UDP socket sends nothing but fixes its source address.
fn probe_local_addr(broadcast_addr: Ipv4Addr) -> io::Result<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_broadcast(true)?;

    for target in [broadcast_addr, Ipv4Addr::new(8, 8, 8, 8)] {
        if socket.connect((target, 9)).is_err() {
            continue;
        }
        if let SocketAddr::V4(local) = socket.local_addr()? {
            if !local.ip().is_unspecified() {
                return Ok(*local.ip());
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        "no route to determine an IPv4 source address",
    ))
}
