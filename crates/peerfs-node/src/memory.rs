//! In-process network for embedding several nodes in one process.
//!
//! Delivery is synchronous: `broadcast` and `send_unicast` call the
//! receivers' handlers before returning, so a chain of protocol reactions
//! has fully played out when the originating call returns. Every sent frame
//! is recorded in the hub's log.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use peerfs_core::wire::MessageHeader;
use peerfs_core::MessageKind;

use crate::error::TransportError;
use crate::network::{
    Channel, MessageHandler, Network, OperationKind, OperationStatus, SocketOperation,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Unicast(Ipv4Addr),
    Broadcast,
}

/// One entry in the hub's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    /// None when the header does not name a known kind.
    pub kind: Option<MessageKind>,
    pub from: Ipv4Addr,
    pub to: Destination,
}

#[derive(Clone)]
struct Endpoint {
    handler: Arc<dyn MessageHandler>,
    self_broadcasts: Arc<AtomicBool>,
}

#[derive(Default)]
struct HubInner {
    endpoints: Mutex<HashMap<Ipv4Addr, Endpoint>>,
    log: Mutex<Vec<SentFrame>>,
}

/// Shared medium connecting `MemoryNetwork`s.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A network endpoint with the given address. Registers with the hub
    /// when it starts listening.
    pub fn network(&self, addr: Ipv4Addr) -> MemoryNetwork {
        MemoryNetwork {
            hub: self.clone(),
            addr,
            self_broadcasts: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        self.inner.log.lock().clone()
    }

    /// Kinds sent by `from`, in order.
    pub fn kinds_sent_by(&self, from: Ipv4Addr) -> Vec<MessageKind> {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|f| f.from == from)
            .filter_map(|f| f.kind)
            .collect()
    }

    pub fn count(&self, kind: MessageKind) -> usize {
        self.inner.log.lock().iter().filter(|f| f.kind == Some(kind)).count()
    }

    pub fn clear_log(&self) {
        self.inner.log.lock().clear();
    }

    pub fn is_listening(&self, addr: Ipv4Addr) -> bool {
        self.inner.endpoints.lock().contains_key(&addr)
    }

    /// Deliver a frame as if `from` had sent it. Not logged, and the sender
    /// need not be registered. Returns false when a unicast target is absent.
    pub fn inject(&self, frame: Bytes, from: Ipv4Addr, to: Destination) -> bool {
        match to {
            Destination::Broadcast => {
                self.fan_out(&frame, from);
                true
            }
            Destination::Unicast(dest) => match self.endpoint(dest) {
                Some(endpoint) => {
                    endpoint.handler.on_message(frame, from, Channel::Unicast);
                    true
                }
                None => false,
            },
        }
    }

    fn record(&self, frame: &[u8], from: Ipv4Addr, to: Destination) {
        let kind = MessageHeader::parse(frame).and_then(|h| h.kind()).ok();
        match kind {
            Some(kind) => tracing::trace!(from = %from, to = ?to, kind = %kind, "hub frame"),
            None => tracing::trace!(from = %from, to = ?to, "hub frame of unknown kind"),
        }
        self.inner.log.lock().push(SentFrame { kind, from, to });
    }

    fn endpoint(&self, addr: Ipv4Addr) -> Option<Endpoint> {
        self.inner.endpoints.lock().get(&addr).cloned()
    }

    /// Snapshot the endpoints first; handlers may broadcast in turn.
    fn fan_out(&self, frame: &Bytes, from: Ipv4Addr) {
        let endpoints: Vec<(Ipv4Addr, Endpoint)> = self
            .inner
            .endpoints
            .lock()
            .iter()
            .map(|(addr, endpoint)| (*addr, endpoint.clone()))
            .collect();

        for (addr, endpoint) in endpoints {
            if addr == from && !endpoint.self_broadcasts.load(Ordering::Relaxed) {
                continue;
            }
            endpoint.handler.on_message(frame.clone(), from, Channel::Broadcast);
        }
    }
}

/// One node's view of a `MemoryHub`.
pub struct MemoryNetwork {
    hub: MemoryHub,
    addr: Ipv4Addr,
    self_broadcasts: Arc<AtomicBool>,
}

impl Network for MemoryNetwork {
    fn local_addr(&self) -> Ipv4Addr {
        self.addr
    }

    fn start_listening(&self, handler: Arc<dyn MessageHandler>) -> Result<(), TransportError> {
        let mut endpoints = self.hub.inner.endpoints.lock();
        if endpoints.contains_key(&self.addr) {
            return Err(TransportError::AlreadyListening);
        }
        endpoints.insert(
            self.addr,
            Endpoint {
                handler,
                self_broadcasts: self.self_broadcasts.clone(),
            },
        );
        Ok(())
    }

    fn stop_listening(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.hub.inner.endpoints.lock().remove(&self.addr);
        })
    }

    fn send_unicast(&self, frame: Bytes, dest: Ipv4Addr) {
        self.hub.record(&frame, self.addr, Destination::Unicast(dest));
        match self.hub.endpoint(dest) {
            Some(endpoint) => endpoint.handler.on_message(frame, self.addr, Channel::Unicast),
            None => {
                tracing::debug!(dest = %dest, "no such node on hub");
                if let Some(own) = self.hub.endpoint(self.addr) {
                    own.handler.on_error(SocketOperation::new(
                        OperationKind::TcpSend,
                        OperationStatus::CantConnect,
                        Some(dest),
                    ));
                }
            }
        }
    }

    fn broadcast(&self, frame: Bytes) {
        self.hub.record(&frame, self.addr, Destination::Broadcast);
        self.hub.fan_out(&frame, self.addr);
    }

    fn set_self_broadcasts(&self, enabled: bool) {
        self.self_broadcasts.store(enabled, Ordering::Relaxed);
    }
}
