//! peerfs-core: shared types, wire format, and configuration.
//! All other peerfs crates depend on this one.

pub mod config;
pub mod descriptor;
pub mod wire;

pub use descriptor::{ContentHash, DescriptorError, FileDescriptor};
pub use wire::{Message, MessageKind, WireError};
