use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

use peerfs_core::{DescriptorError, WireError};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {what} on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },

    #[error("could not determine this node's IPv4 address: {0}")]
    AddressDiscovery(#[source] io::Error),

    #[error("frame declares {declared} payload bytes, limit is {limit}")]
    FrameTooLarge { declared: usize, limit: usize },

    #[error("transport is already listening")]
    AlreadyListening,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    #[error("no other node is known")]
    NoOtherNode,
}

/// Local precondition failures. Nothing is sent when one of these is
/// returned.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("node is not in a running session")]
    NotRunning,

    #[error("{0} does not exist in the network")]
    NotFound(String),

    #[error("{count} files are named {name}; give the content hash as well")]
    Ambiguous { name: String, count: usize },

    #[error("{name} is owned by {owner}")]
    NotOwner { name: String, owner: Ipv4Addr },

    #[error("{0} is being moved or deleted")]
    Unavailable(String),

    #[error("content of {name} is already published as {existing}")]
    AlreadyPublished { name: String, existing: String },

    #[error("{name} is {size} bytes; with its descriptor it exceeds the {limit}-byte frame limit")]
    TooLarge { name: String, size: u64, limit: usize },

    #[error(transparent)]
    InvalidName(#[from] DescriptorError),

    #[error("local storage: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session already started")]
    AlreadyStarted,

    #[error("session has ended; create a new node to rejoin")]
    Ended,

    #[error("no session is running")]
    NotRunning,

    #[error("storage unavailable: {0}")]
    Storage(#[source] io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
