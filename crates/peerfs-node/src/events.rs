use std::net::Ipv4Addr;

use peerfs_core::{FileDescriptor, MessageKind};

/// Outcomes that arrive after the API call that caused them has returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A peer declined one of our requests.
    Refused {
        from: Ipv4Addr,
        kind: MessageKind,
        reason: String,
    },

    /// A requested file was written to the download store. `verified` is
    /// false when its content does not match the descriptor's hash.
    FileReceived {
        descriptor: FileDescriptor,
        verified: bool,
    },

    /// A peer left or became unreachable; its files were dropped from the
    /// directory.
    PeerLost(Ipv4Addr),
}
