//! The seam between the protocol engine and whatever moves its bytes.
//!
//! `Transport` implements `Network` over real sockets; `MemoryNetwork`
//! implements it inside one process. The protocol engine only ever sees
//! `MessageHandler` callbacks carrying a raw frame and the sender's address.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::TransportError;

/// Which channel a frame arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Reliable point-to-point (TCP).
    Unicast,
    /// Unreliable LAN broadcast (UDP).
    Broadcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    TcpSend,
    TcpReceive,
    UdpSend,
    UdpReceive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    CantOpenSocket,
    CantConnect,
    SendFailed,
    ReceiveFailed,
    TimedOut,
    /// Frame refused before delivery (oversized or short).
    Malformed,
}

/// Describes a failed socket operation reported through `on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOperation {
    pub kind: OperationKind,
    pub status: OperationStatus,
    /// Remote end, when one is known.
    pub peer: Option<Ipv4Addr>,
}

impl SocketOperation {
    pub fn new(kind: OperationKind, status: OperationStatus, peer: Option<Ipv4Addr>) -> Self {
        Self { kind, status, peer }
    }

    /// An outbound unicast that never reached its peer.
    pub fn is_lost_peer(&self) -> bool {
        self.kind == OperationKind::TcpSend
            && matches!(
                self.status,
                OperationStatus::CantConnect | OperationStatus::SendFailed | OperationStatus::TimedOut
            )
    }
}

impl fmt::Display for SocketOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {:?}", self.kind, self.status)?;
        if let Some(peer) = self.peer {
            write!(f, " ({peer})")?;
        }
        Ok(())
    }
}

/// Callbacks the network invokes. Called concurrently from many tasks.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, frame: Bytes, sender: Ipv4Addr, channel: Channel);
    fn on_error(&self, operation: SocketOperation);
}

pub trait Network: Send + Sync {
    /// Address peers know this node by.
    fn local_addr(&self) -> Ipv4Addr;

    /// Begin delivering frames to `handler`. Fails if already listening.
    fn start_listening(&self, handler: Arc<dyn MessageHandler>) -> Result<(), TransportError>;

    /// Stop receiving and wait until every dispatched task has finished.
    /// No handler call happens after the returned future resolves.
    fn stop_listening(&self) -> BoxFuture<'_, ()>;

    /// Deliver one frame to `dest`. Never blocks the caller; failures are
    /// reported through `on_error`.
    fn send_unicast(&self, frame: Bytes, dest: Ipv4Addr);

    /// Deliver one frame to every node on the segment.
    fn broadcast(&self, frame: Bytes);

    /// When disabled (the default), broadcasts originating from this node
    /// are dropped on receipt.
    fn set_self_broadcasts(&self, enabled: bool);
}
