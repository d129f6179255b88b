//! peerfs-node: the node protocol engine.
//!
//! A `Node` joins a LAN segment, keeps a directory of every file published
//! there, stores the files placed on it and serves, hands over or deletes
//! them on request. It talks through a `Network`: the socket `Transport`
//! in production, a `MemoryHub` when several nodes share one process.

pub mod directory;
pub mod error;
pub mod events;
pub mod memory;
pub mod network;
pub mod node;
pub mod placement;
mod protocol;
pub mod store;
pub mod transport;

pub use error::{PlacementError, RequestError, SessionError, TransportError};
pub use events::NodeEvent;
pub use memory::{Destination, MemoryHub, MemoryNetwork, SentFrame};
pub use network::{Channel, MessageHandler, Network, SocketOperation};
pub use node::{Node, NodeSettings, Phase, THIS_HOST};
pub use store::{DiskStore, FileStore, MemoryStore};
pub use transport::Transport;
