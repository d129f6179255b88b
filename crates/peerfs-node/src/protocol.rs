//! Protocol state machine: one handler per message kind.
//!
//! Handlers run concurrently on transport tasks. Each takes the directory
//! lock only around its own mutation and releases it before sending; the
//! in-process network delivers synchronously, so sending under the lock
//! would deadlock on the first self-addressed reply.

use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};

use bytes::Bytes;

use peerfs_core::{ContentHash, FileDescriptor, Message, MessageKind};

use crate::events::NodeEvent;
use crate::network::{Channel, MessageHandler, SocketOperation};
use crate::node::{NodeInner, Phase};

/// Registered with the network for the length of a session.
pub(crate) struct Dispatcher {
    node: Weak<NodeInner>,
}

impl Dispatcher {
    pub(crate) fn new(node: &Arc<NodeInner>) -> Self {
        Self {
            node: Arc::downgrade(node),
        }
    }
}

impl MessageHandler for Dispatcher {
    fn on_message(&self, frame: Bytes, sender: Ipv4Addr, channel: Channel) {
        if let Some(node) = self.node.upgrade() {
            node.handle_frame(&frame, sender, channel);
        }
    }

    fn on_error(&self, operation: SocketOperation) {
        if let Some(node) = self.node.upgrade() {
            node.handle_error(operation);
        }
    }
}

impl NodeInner {
    fn handle_frame(&self, frame: &[u8], sender: Ipv4Addr, channel: Channel) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(sender = %sender, channel = ?channel, error = %e, "dropping malformed frame");
                return;
            }
        };
        tracing::debug!(sender = %sender, channel = ?channel, kind = %message.kind(), "received");

        match message {
            Message::Hello => self.on_hello(sender),
            Message::HelloReply(snapshot) => self.on_hello_reply(sender, snapshot),
            Message::Disconnecting => self.on_disconnecting(sender),
            Message::ConnectionLost(lost) => {
                if lost == self.addr {
                    tracing::debug!(sender = %sender, "peer reports this node lost, ignoring");
                } else {
                    self.forget(lost);
                }
            }
            Message::CmdRefused { refused, reason } => {
                if refused == MessageKind::HolderChange {
                    // The local copy went with the frame.
                    tracing::warn!(peer = %sender, reason = %reason, "hand-over refused, file lost");
                } else {
                    tracing::warn!(peer = %sender, kind = %refused, reason = %reason, "request refused");
                }
                self.publish(NodeEvent::Refused {
                    from: sender,
                    kind: refused,
                    reason,
                });
            }
            Message::Shutdown => {
                if sender != self.addr {
                    self.forget(sender);
                }
            }
            Message::NewFile(descriptor) => {
                let outcome = self.directory.lock().announce(descriptor.clone());
                tracing::debug!(
                    name = %descriptor.name,
                    hash = %descriptor.content_hash,
                    outcome = ?outcome,
                    "NEW_FILE"
                );
            }
            Message::RevokeFile(descriptor) => {
                let removed = self.directory.lock().revoke(&descriptor.content_hash);
                tracing::debug!(name = %descriptor.name, removed, "REVOKE_FILE");
            }
            Message::DiscardDescriptor(descriptor) => {
                self.directory.lock().discard(&descriptor);
                tracing::debug!(name = %descriptor.name, "DISCARD_DESCRIPTOR");
            }
            Message::UpdateDescriptor(descriptor) => {
                tracing::debug!(name = %descriptor.name, holder = %descriptor.holder, "UPDATE_DESCRIPTOR");
                self.directory.lock().update(descriptor, self.addr);
            }
            Message::HolderChange {
                descriptor,
                content,
            } => self.on_holder_change(sender, descriptor, content),
            Message::FileTransfer {
                descriptor,
                content,
            } => self.on_file_transfer(sender, descriptor, content),
            Message::UploadFile {
                descriptor,
                content,
            } => self.on_upload_file(sender, descriptor, content),
            Message::GetFile(descriptor) => self.on_get_file(sender, descriptor),
            Message::DeleteFile(descriptor) => self.on_delete_file(sender, descriptor),
        }
    }

    /// Outbound unicast failures mean the peer is gone; tell everyone.
    fn handle_error(&self, operation: SocketOperation) {
        match operation.peer {
            Some(peer) if operation.is_lost_peer() && peer != self.addr => {
                tracing::warn!(peer = %peer, operation = %operation, "peer unreachable");
                self.forget(peer);
                self.broadcast(Message::ConnectionLost(peer));
            }
            _ => tracing::warn!(operation = %operation, "socket operation failed"),
        }
    }

    // ── Membership ────────────────────────────────────────────────────────────

    fn on_hello(&self, sender: Ipv4Addr) {
        if sender == self.addr {
            return;
        }
        let snapshot = {
            let mut dir = self.directory.lock();
            if dir.record_peer(sender) {
                tracing::info!(peer = %sender, "peer joined");
            }
            dir.local().to_vec()
        };
        self.send(Message::HelloReply(snapshot), sender);
    }

    fn on_hello_reply(&self, sender: Ipv4Addr, snapshot: Vec<FileDescriptor>) {
        if sender == self.addr {
            return;
        }
        let mut dir = self.directory.lock();
        if !dir.is_new_node() {
            tracing::debug!(peer = %sender, "HELLO_REPLY after grace period, ignoring");
            return;
        }
        let files = snapshot.len();
        dir.remove_duplicates();
        dir.merge_snapshot(snapshot);
        dir.record_peer(sender);
        tracing::info!(peer = %sender, files, "merged peer directory");
    }

    fn on_disconnecting(&self, sender: Ipv4Addr) {
        if sender == self.addr {
            return;
        }
        let fenced = self.directory.lock().invalidate_held_by(sender);
        tracing::info!(peer = %sender, fenced, "peer disconnecting");
    }

    fn forget(&self, addr: Ipv4Addr) {
        let (removed, was_peer) = self.directory.lock().forget_node(addr);
        if was_peer || removed > 0 {
            tracing::info!(peer = %addr, removed, "peer gone, its files dropped");
            self.publish(NodeEvent::PeerLost(addr));
        }
    }

    // ── File transfer ─────────────────────────────────────────────────────────

    fn on_upload_file(&self, sender: Ipv4Addr, descriptor: FileDescriptor, content: Bytes) {
        if self.phase() == Phase::Departing {
            return self.refuse(sender, MessageKind::UploadFile, "node is leaving the network");
        }
        if ContentHash::compute(&content) != descriptor.content_hash {
            tracing::warn!(name = %descriptor.name, peer = %sender, "uploaded content does not match its hash");
            return self.refuse(sender, MessageKind::UploadFile, "content does not match its hash");
        }
        if let Err(e) = self.blobs.store(&descriptor.content_hash.to_hex(), &content) {
            tracing::warn!(name = %descriptor.name, error = %e, "cannot store uploaded file");
            return self.refuse(sender, MessageKind::UploadFile, "cannot store file");
        }

        let descriptor = FileDescriptor {
            holder: self.addr,
            valid: true,
            ..descriptor
        };
        {
            let mut dir = self.directory.lock();
            dir.add_local(descriptor.clone());
            dir.announce(descriptor.clone());
        }
        tracing::info!(name = %descriptor.name, owner = %descriptor.owner, "now holding uploaded file");
        self.broadcast(Message::NewFile(descriptor));
    }

    fn on_holder_change(&self, sender: Ipv4Addr, descriptor: FileDescriptor, content: Bytes) {
        if self.phase() == Phase::Departing {
            return self.refuse(sender, MessageKind::HolderChange, "node is leaving the network");
        }
        if ContentHash::compute(&content) != descriptor.content_hash {
            tracing::warn!(name = %descriptor.name, peer = %sender, "handed-over content does not match its hash");
            return self.refuse(sender, MessageKind::HolderChange, "content does not match its hash");
        }
        if let Err(e) = self.blobs.store(&descriptor.content_hash.to_hex(), &content) {
            tracing::warn!(name = %descriptor.name, error = %e, "cannot store handed-over file");
            return self.refuse(sender, MessageKind::HolderChange, "cannot store file");
        }

        let descriptor = FileDescriptor {
            holder: self.addr,
            valid: true,
            ..descriptor
        };
        {
            let mut dir = self.directory.lock();
            dir.add_local(descriptor.clone());
            dir.update(descriptor.clone(), self.addr);
        }
        tracing::info!(name = %descriptor.name, from = %sender, "took over file");
        self.broadcast(Message::UpdateDescriptor(descriptor));
    }

    /// Integrity failures are logged and reported, never retried.
    fn on_file_transfer(&self, sender: Ipv4Addr, descriptor: FileDescriptor, content: Bytes) {
        if let Err(e) = self.downloads.store(&descriptor.name, &content) {
            tracing::warn!(name = %descriptor.name, error = %e, "cannot store received file");
            return;
        }
        let verified = ContentHash::compute(&content) == descriptor.content_hash;
        if verified {
            tracing::info!(name = %descriptor.name, from = %sender, size = content.len(), "file received");
        } else {
            tracing::warn!(
                name = %descriptor.name,
                from = %sender,
                expected = %descriptor.content_hash,
                "received file does not match its hash"
            );
        }
        self.publish(NodeEvent::FileReceived {
            descriptor,
            verified,
        });
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    fn on_get_file(&self, sender: Ipv4Addr, requested: FileDescriptor) {
        if self.phase() == Phase::Departing {
            return self.refuse(sender, MessageKind::GetFile, "node is leaving the network");
        }
        let held = self
            .directory
            .lock()
            .local_by_hash(&requested.content_hash)
            .cloned();
        let Some(held) = held else {
            return self.refuse(sender, MessageKind::GetFile, "file is not held here");
        };
        if !held.valid {
            return self.refuse(sender, MessageKind::GetFile, "file is being moved or deleted");
        }

        match self.blobs.load(&held.content_hash.to_hex()) {
            Ok(content) => {
                tracing::info!(name = %held.name, to = %sender, "serving file");
                self.send(
                    Message::FileTransfer {
                        descriptor: held,
                        content: Bytes::from(content),
                    },
                    sender,
                );
            }
            Err(e) => {
                tracing::warn!(name = %held.name, error = %e, "cannot read held file");
                self.refuse(sender, MessageKind::GetFile, "cannot read file");
            }
        }
    }

    fn on_delete_file(&self, sender: Ipv4Addr, requested: FileDescriptor) {
        let departing = self.phase() == Phase::Departing;
        let held = self
            .directory
            .lock()
            .local_by_hash(&requested.content_hash)
            .cloned();
        let Some(held) = held else {
            return self.refuse(sender, MessageKind::DeleteFile, "file is not held here");
        };
        // The owner's own discard fence precedes its delete.
        if departing || (!held.valid && sender != held.owner) {
            return self.refuse(sender, MessageKind::DeleteFile, "file is being moved or deleted");
        }
        if sender != held.owner {
            return self.refuse(sender, MessageKind::DeleteFile, "only the owner may delete");
        }
        if !self.blobs.delete(&held.content_hash.to_hex()) {
            tracing::warn!(name = %held.name, "held file missing from storage");
            return self.refuse(sender, MessageKind::DeleteFile, "file is missing from storage");
        }

        self.directory.lock().revoke(&held.content_hash);
        tracing::info!(name = %held.name, owner = %held.owner, "file deleted");
        self.broadcast(Message::RevokeFile(held));
    }

    fn refuse(&self, dest: Ipv4Addr, kind: MessageKind, reason: &str) {
        tracing::warn!(peer = %dest, kind = %kind, reason, "refusing request");
        self.send(
            Message::CmdRefused {
                refused: kind,
                reason: reason.to_string(),
            },
            dest,
        );
    }
}
