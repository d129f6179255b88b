//! File descriptors: the metadata record every node keeps for a file
//! stored somewhere in the network.
//!
//! A descriptor is a plain value. It is copied across the wire in the
//! fixed-size record defined in `wire.rs` and never holds references to
//! node state.

use std::cmp::Ordering;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Longest file name a descriptor can carry, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Length of the rendered digest in hex characters.
pub const HASH_HEX_LEN: usize = 32;

// ── Content hash ──────────────────────────────────────────────────────────────

/// MD5 digest of a file's content.
///
/// Used as the content-addressed storage key on the holder and as the
/// global identity of a file when deduplicating announcements.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    /// Hash the given bytes.
    pub fn compute(content: &[u8]) -> Self {
        Self(md5::compute(content).0)
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The 32-character lowercase hex rendering. Also the blob store key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 32-character hex digest. Upper and lower case are accepted.
    pub fn from_hex(s: &str) -> Result<Self, DescriptorError> {
        if s.len() != HASH_HEX_LEN {
            return Err(DescriptorError::MalformedHash(s.to_string()));
        }
        let mut out = [0u8; 16];
        hex::decode_to_slice(s, &mut out)
            .map_err(|_| DescriptorError::MalformedHash(s.to_string()))?;
        Ok(Self(out))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

// ── Descriptor ────────────────────────────────────────────────────────────────

/// One file tracked anywhere in the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// User-visible name. 1..=255 bytes, no NUL, no path separators.
    pub name: String,

    /// Digest of the content. Identity for deduplication.
    pub content_hash: ContentHash,

    /// Content length in bytes.
    pub size: u64,

    /// Creation time, Unix seconds.
    pub upload_time: i64,

    /// Node authorized to delete the file.
    pub owner: Ipv4Addr,

    /// Node currently storing the bytes.
    pub holder: Ipv4Addr,

    /// False while the file is mid-transition. An invalid descriptor must
    /// not be served or deleted until an update arrives.
    pub valid: bool,
}

impl FileDescriptor {
    /// Build a valid descriptor for freshly uploaded content.
    pub fn for_content(
        name: &str,
        content: &[u8],
        upload_time: i64,
        owner: Ipv4Addr,
        holder: Ipv4Addr,
    ) -> Result<Self, DescriptorError> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            content_hash: ContentHash::compute(content),
            size: content.len() as u64,
            upload_time,
            owner,
            holder,
            valid: true,
        })
    }

    /// Deterministic tie-break between two descriptors announcing the same
    /// content hash: the earlier upload wins, then the lexicographically
    /// smaller name. Returns true when `self` should be kept over `other`.
    pub fn supersedes(&self, other: &FileDescriptor) -> bool {
        match self.upload_time.cmp(&other.upload_time) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.name < other.name,
        }
    }

    /// Same descriptor with the validity flag cleared.
    pub fn invalidated(&self) -> Self {
        Self {
            valid: false,
            ..self.clone()
        }
    }
}

/// Check a user-visible file name.
pub fn validate_name(name: &str) -> Result<(), DescriptorError> {
    if name.is_empty() {
        return Err(DescriptorError::EmptyName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(DescriptorError::NameTooLong(name.len()));
    }
    if name.contains(['\0', '/', '\\']) || name == "." || name == ".." {
        return Err(DescriptorError::IllegalName(name.to_string()));
    }
    Ok(())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("file name is empty")]
    EmptyName,

    #[error("file name is {0} bytes, maximum is {MAX_NAME_LEN}")]
    NameTooLong(usize),

    #[error("file name {0:?} contains a NUL byte or path component")]
    IllegalName(String),

    #[error("malformed content hash {0:?}")]
    MalformedHash(String),
}
