//! peerfs wire format: the messages nodes exchange.
//!
//! Every message is a fixed 8-byte header followed by a kind-specific
//! payload. The header and the descriptor record are fixed-layout structs
//! with explicit little-endian fields; all nodes in a deployment must agree
//! on them byte for byte (there is no version negotiation).
//!
//! Decoding always checks lengths before interpreting anything: the header
//! must declare exactly the number of payload bytes that arrived, and each
//! kind's payload must have the shape that kind requires.

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, I64, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::descriptor::{validate_name, ContentHash, FileDescriptor, HASH_HEX_LEN, MAX_NAME_LEN};

// ── Header ────────────────────────────────────────────────────────────────────

/// Precedes every message on both the unicast and broadcast channels.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct MessageHeader {
    /// `MessageKind` discriminant.
    pub kind: U32<LittleEndian>,

    /// Exact number of payload bytes following the header.
    pub payload_len: U32<LittleEndian>,
}

assert_eq_size!(MessageHeader, [u8; 8]);

pub const HEADER_SIZE: usize = std::mem::size_of::<MessageHeader>();

impl MessageHeader {
    pub fn new(kind: MessageKind, payload_len: u32) -> Self {
        Self {
            kind: U32::new(kind as u32),
            payload_len: U32::new(payload_len),
        }
    }

    /// Parse the first `HEADER_SIZE` bytes of a frame.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        bytes
            .get(..HEADER_SIZE)
            .and_then(MessageHeader::read_from)
            .ok_or(WireError::TruncatedHeader(bytes.len()))
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len.get() as usize
    }

    pub fn kind(&self) -> Result<MessageKind, WireError> {
        MessageKind::try_from(self.kind.get())
    }
}

// ── Descriptor record ─────────────────────────────────────────────────────────

/// On-wire form of a `FileDescriptor`.
///
/// Wire size: 316 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct DescriptorRecord {
    /// UTF-8 file name, NUL-padded.
    pub name: [u8; MAX_NAME_LEN + 1],

    /// Lowercase ASCII hex of the content hash.
    pub content_hash: [u8; HASH_HEX_LEN],

    pub size: U64<LittleEndian>,

    /// Unix seconds.
    pub upload_time: I64<LittleEndian>,

    /// IPv4 octets of the owner node.
    pub owner: [u8; 4],

    /// IPv4 octets of the holder node.
    pub holder: [u8; 4],

    /// 1 = valid, 0 = discarded. Any other value is rejected.
    pub valid: u8,

    /// Must be zero.
    pub reserved: [u8; 3],
}

assert_eq_size!(DescriptorRecord, [u8; 316]);

pub const DESCRIPTOR_SIZE: usize = std::mem::size_of::<DescriptorRecord>();

impl DescriptorRecord {
    pub fn from_descriptor(d: &FileDescriptor) -> Self {
        let mut name = [0u8; MAX_NAME_LEN + 1];
        let name_bytes = d.name.as_bytes();
        let len = name_bytes.len().min(MAX_NAME_LEN);
        name[..len].copy_from_slice(&name_bytes[..len]);

        let mut content_hash = [0u8; HASH_HEX_LEN];
        content_hash.copy_from_slice(d.content_hash.to_hex().as_bytes());

        Self {
            name,
            content_hash,
            size: U64::new(d.size),
            upload_time: I64::new(d.upload_time),
            owner: d.owner.octets(),
            holder: d.holder.octets(),
            valid: u8::from(d.valid),
            reserved: [0u8; 3],
        }
    }

    pub fn to_descriptor(&self) -> Result<FileDescriptor, WireError> {
        let name_len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .ok_or(WireError::MalformedDescriptor("name is not NUL-terminated"))?;
        let name = std::str::from_utf8(&self.name[..name_len])
            .map_err(|_| WireError::MalformedDescriptor("name is not UTF-8"))?;
        validate_name(name).map_err(|_| WireError::MalformedDescriptor("illegal name"))?;

        let hash_str = std::str::from_utf8(&self.content_hash)
            .map_err(|_| WireError::MalformedDescriptor("hash is not ASCII"))?;
        let content_hash = ContentHash::from_hex(hash_str)
            .map_err(|_| WireError::MalformedDescriptor("hash is not hex"))?;

        let valid = match self.valid {
            0 => false,
            1 => true,
            _ => return Err(WireError::MalformedDescriptor("validity byte out of range")),
        };

        Ok(FileDescriptor {
            name: name.to_string(),
            content_hash,
            size: self.size.get(),
            upload_time: self.upload_time.get(),
            owner: Ipv4Addr::from(self.owner),
            holder: Ipv4Addr::from(self.holder),
            valid,
        })
    }
}

fn read_descriptor(bytes: &[u8]) -> Result<FileDescriptor, WireError> {
    DescriptorRecord::read_from(bytes)
        .ok_or(WireError::BadPayload {
            kind: "descriptor",
            len: bytes.len(),
        })?
        .to_descriptor()
}

// ── Message kinds ─────────────────────────────────────────────────────────────

/// The complete catalogue of protocol messages.
///
/// UDP broadcasts: Hello, Disconnecting, ConnectionLost, Shutdown, NewFile,
/// RevokeFile, DiscardDescriptor, UpdateDescriptor.
/// TCP unicasts: everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    Hello = 0,
    HelloReply = 1,
    Disconnecting = 2,
    ConnectionLost = 3,
    CmdRefused = 4,
    Shutdown = 5,
    NewFile = 6,
    RevokeFile = 7,
    DiscardDescriptor = 8,
    UpdateDescriptor = 9,
    HolderChange = 10,
    FileTransfer = 11,
    UploadFile = 12,
    GetFile = 13,
    DeleteFile = 14,
}

impl TryFrom<u32> for MessageKind {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use MessageKind::*;
        Ok(match value {
            0 => Hello,
            1 => HelloReply,
            2 => Disconnecting,
            3 => ConnectionLost,
            4 => CmdRefused,
            5 => Shutdown,
            6 => NewFile,
            7 => RevokeFile,
            8 => DiscardDescriptor,
            9 => UpdateDescriptor,
            10 => HolderChange,
            11 => FileTransfer,
            12 => UploadFile,
            13 => GetFile,
            14 => DeleteFile,
            other => return Err(WireError::UnknownKind(other)),
        })
    }
}

impl From<MessageKind> for u32 {
    fn from(kind: MessageKind) -> u32 {
        kind as u32
    }
}

impl MessageKind {
    /// Protocol name as it appears in logs.
    pub fn name(self) -> &'static str {
        use MessageKind::*;
        match self {
            Hello => "HELLO",
            HelloReply => "HELLO_REPLY",
            Disconnecting => "DISCONNECTING",
            ConnectionLost => "CONNECTION_LOST",
            CmdRefused => "CMD_REFUSED",
            Shutdown => "SHUTDOWN",
            NewFile => "NEW_FILE",
            RevokeFile => "REVOKE_FILE",
            DiscardDescriptor => "DISCARD_DESCRIPTOR",
            UpdateDescriptor => "UPDATE_DESCRIPTOR",
            HolderChange => "HOLDER_CHANGE",
            FileTransfer => "FILE_TRANSFER",
            UploadFile => "UPLOAD_FILE",
            GetFile => "GET_FILE",
            DeleteFile => "DELETE_FILE",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello,
    HelloReply(Vec<FileDescriptor>),
    Disconnecting,
    ConnectionLost(Ipv4Addr),
    CmdRefused { refused: MessageKind, reason: String },
    Shutdown,
    NewFile(FileDescriptor),
    RevokeFile(FileDescriptor),
    DiscardDescriptor(FileDescriptor),
    UpdateDescriptor(FileDescriptor),
    HolderChange { descriptor: FileDescriptor, content: Bytes },
    FileTransfer { descriptor: FileDescriptor, content: Bytes },
    UploadFile { descriptor: FileDescriptor, content: Bytes },
    GetFile(FileDescriptor),
    DeleteFile(FileDescriptor),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello => MessageKind::Hello,
            Message::HelloReply(_) => MessageKind::HelloReply,
            Message::Disconnecting => MessageKind::Disconnecting,
            Message::ConnectionLost(_) => MessageKind::ConnectionLost,
            Message::CmdRefused { .. } => MessageKind::CmdRefused,
            Message::Shutdown => MessageKind::Shutdown,
            Message::NewFile(_) => MessageKind::NewFile,
            Message::RevokeFile(_) => MessageKind::RevokeFile,
            Message::DiscardDescriptor(_) => MessageKind::DiscardDescriptor,
            Message::UpdateDescriptor(_) => MessageKind::UpdateDescriptor,
            Message::HolderChange { .. } => MessageKind::HolderChange,
            Message::FileTransfer { .. } => MessageKind::FileTransfer,
            Message::UploadFile { .. } => MessageKind::UploadFile,
            Message::GetFile(_) => MessageKind::GetFile,
            Message::DeleteFile(_) => MessageKind::DeleteFile,
        }
    }

    /// Payload bytes `encode` will produce, without building them.
    pub fn payload_len(&self) -> usize {
        match self {
            Message::Hello | Message::Disconnecting | Message::Shutdown => 0,
            Message::HelloReply(descriptors) => descriptors.len() * DESCRIPTOR_SIZE,
            Message::ConnectionLost(_) => 4,
            Message::CmdRefused { reason, .. } => 4 + reason.len(),
            Message::NewFile(_)
            | Message::RevokeFile(_)
            | Message::DiscardDescriptor(_)
            | Message::UpdateDescriptor(_)
            | Message::GetFile(_)
            | Message::DeleteFile(_) => DESCRIPTOR_SIZE,
            Message::HolderChange { content, .. }
            | Message::FileTransfer { content, .. }
            | Message::UploadFile { content, .. } => DESCRIPTOR_SIZE + content.len(),
        }
    }

    /// Serialize header and payload into one frame.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let payload_len = header_len(self.payload_len())?;
        let mut payload = BytesMut::with_capacity(payload_len as usize);
        match self {
            Message::Hello | Message::Disconnecting | Message::Shutdown => {}
            Message::HelloReply(descriptors) => {
                for d in descriptors {
                    payload.put_slice(DescriptorRecord::from_descriptor(d).as_bytes());
                }
            }
            Message::ConnectionLost(addr) => payload.put_slice(&addr.octets()),
            Message::CmdRefused { refused, reason } => {
                payload.put_u32_le(u32::from(*refused));
                payload.put_slice(reason.as_bytes());
            }
            Message::NewFile(d)
            | Message::RevokeFile(d)
            | Message::DiscardDescriptor(d)
            | Message::UpdateDescriptor(d)
            | Message::GetFile(d)
            | Message::DeleteFile(d) => {
                payload.put_slice(DescriptorRecord::from_descriptor(d).as_bytes());
            }
            Message::HolderChange { descriptor, content }
            | Message::FileTransfer { descriptor, content }
            | Message::UploadFile { descriptor, content } => {
                payload.put_slice(DescriptorRecord::from_descriptor(descriptor).as_bytes());
                payload.put_slice(content);
            }
        }

        let header = MessageHeader::new(self.kind(), payload_len);
        let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        frame.put_slice(header.as_bytes());
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    /// Parse one complete frame.
    pub fn decode(frame: &[u8]) -> Result<Message, WireError> {
        let header = MessageHeader::parse(frame)?;
        let payload = &frame[HEADER_SIZE..];
        if payload.len() != header.payload_len() {
            return Err(WireError::LengthMismatch {
                declared: header.payload_len(),
                actual: payload.len(),
            });
        }
        let kind = header.kind()?;

        let message = match kind {
            MessageKind::Hello | MessageKind::Disconnecting | MessageKind::Shutdown => {
                if !payload.is_empty() {
                    return Err(WireError::BadPayload {
                        kind: kind.name(),
                        len: payload.len(),
                    });
                }
                match kind {
                    MessageKind::Hello => Message::Hello,
                    MessageKind::Disconnecting => Message::Disconnecting,
                    _ => Message::Shutdown,
                }
            }
            MessageKind::HelloReply => {
                if payload.len() % DESCRIPTOR_SIZE != 0 {
                    return Err(WireError::BadPayload {
                        kind: kind.name(),
                        len: payload.len(),
                    });
                }
                let descriptors = payload
                    .chunks_exact(DESCRIPTOR_SIZE)
                    .map(read_descriptor)
                    .collect::<Result<Vec<_>, _>>()?;
                Message::HelloReply(descriptors)
            }
            MessageKind::ConnectionLost => {
                let octets: [u8; 4] = payload.try_into().map_err(|_| WireError::BadPayload {
                    kind: kind.name(),
                    len: payload.len(),
                })?;
                Message::ConnectionLost(Ipv4Addr::from(octets))
            }
            MessageKind::CmdRefused => {
                if payload.len() < 4 {
                    return Err(WireError::BadPayload {
                        kind: kind.name(),
                        len: payload.len(),
                    });
                }
                let (tag, reason) = payload.split_at(4);
                let tag = u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]]);
                Message::CmdRefused {
                    refused: MessageKind::try_from(tag)?,
                    reason: String::from_utf8_lossy(reason).into_owned(),
                }
            }
            MessageKind::NewFile => Message::NewFile(read_descriptor(payload)?),
            MessageKind::RevokeFile => Message::RevokeFile(read_descriptor(payload)?),
            MessageKind::DiscardDescriptor => {
                Message::DiscardDescriptor(read_descriptor(payload)?)
            }
            MessageKind::UpdateDescriptor => Message::UpdateDescriptor(read_descriptor(payload)?),
            MessageKind::GetFile => Message::GetFile(read_descriptor(payload)?),
            MessageKind::DeleteFile => Message::DeleteFile(read_descriptor(payload)?),
            MessageKind::HolderChange | MessageKind::FileTransfer | MessageKind::UploadFile => {
                if payload.len() < DESCRIPTOR_SIZE {
                    return Err(WireError::BadPayload {
                        kind: kind.name(),
                        len: payload.len(),
                    });
                }
                let (record, content) = payload.split_at(DESCRIPTOR_SIZE);
                let descriptor = read_descriptor(record)?;
                let content = Bytes::copy_from_slice(content);
                match kind {
                    MessageKind::HolderChange => Message::HolderChange { descriptor, content },
                    MessageKind::FileTransfer => Message::FileTransfer { descriptor, content },
                    _ => Message::UploadFile { descriptor, content },
                }
            }
        };
        Ok(message)
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// TCP port for unicast requests.
pub const DEFAULT_TCP_PORT: u16 = 3333;

/// UDP port for broadcasts.
pub const DEFAULT_UDP_PORT: u16 = 2000;

/// Upper bound on a declared payload. Frames above this are refused before
/// any buffer is allocated.
pub const MAX_PAYLOAD: usize = 512 * 1024 * 1024;

/// The header carries the payload length as a u32.
fn header_len(len: usize) -> Result<u32, WireError> {
    u32::try_from(len).map_err(|_| WireError::PayloadTooLarge(len))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame of {0} bytes is shorter than the message header")]
    TruncatedHeader(usize),

    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    #[error("header declares {declared} payload bytes but {actual} arrived")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("{kind} payload of {len} bytes has the wrong shape")]
    BadPayload { kind: &'static str, len: usize },

    #[error("malformed descriptor record: {0}")]
    MalformedDescriptor(&'static str),

    #[error("payload of {0} bytes does not fit the header's length field")]
    PayloadTooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
