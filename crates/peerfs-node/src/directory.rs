//! The per-node file directory.
//!
//! `DirectoryState` is plain data with one method per protocol rule. The
//! node keeps it behind a single lock; nothing here does I/O, so callers
//! take the lock, apply a rule, copy out what they need and release it
//! before sending anything.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use peerfs_core::{ContentHash, FileDescriptor};

use crate::error::RequestError;

/// What a NEW_FILE announcement did to the network view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announce {
    Inserted,
    /// An entry with the same hash lost the tie-break and was replaced.
    Replaced,
    /// An existing entry with the same hash won the tie-break.
    Kept,
}

#[derive(Debug, Clone)]
pub struct DirectoryState {
    local: Vec<FileDescriptor>,
    network: Vec<FileDescriptor>,
    peers: BTreeSet<Ipv4Addr>,
    is_new_node: bool,
}

impl Default for DirectoryState {
    fn default() -> Self {
        Self {
            local: Vec::new(),
            network: Vec::new(),
            peers: BTreeSet::new(),
            is_new_node: true,
        }
    }
}

impl DirectoryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptors of files stored on this node.
    pub fn local(&self) -> &[FileDescriptor] {
        &self.local
    }

    /// Best-effort view of every file in the network.
    pub fn network(&self) -> &[FileDescriptor] {
        &self.network
    }

    pub fn peers(&self) -> &BTreeSet<Ipv4Addr> {
        &self.peers
    }

    pub fn is_new_node(&self) -> bool {
        self.is_new_node
    }

    /// Leave the new-node window. True only on the first call.
    pub fn end_grace(&mut self) -> bool {
        std::mem::replace(&mut self.is_new_node, false)
    }

    /// True if the peer was not known before.
    pub fn record_peer(&mut self, addr: Ipv4Addr) -> bool {
        self.peers.insert(addr)
    }

    // ── Membership ────────────────────────────────────────────────────────────

    /// Collapse network entries sharing a hash to the one the NEW_FILE
    /// tie-break prefers.
    pub fn remove_duplicates(&mut self) {
        self.network.sort_by(|a, b| {
            a.content_hash
                .cmp(&b.content_hash)
                .then(a.upload_time.cmp(&b.upload_time))
                .then_with(|| a.name.cmp(&b.name))
        });
        self.network.dedup_by(|later, kept| later.content_hash == kept.content_hash);
    }

    /// Merge one HELLO_REPLY snapshot.
    pub fn merge_snapshot(&mut self, snapshot: Vec<FileDescriptor>) {
        for descriptor in snapshot {
            self.announce(descriptor);
        }
    }

    /// DISCONNECTING: soft-fence every file held by `holder`.
    pub fn invalidate_held_by(&mut self, holder: Ipv4Addr) -> usize {
        let mut count = 0;
        for d in self.network.iter_mut().filter(|d| d.holder == holder) {
            d.valid = false;
            count += 1;
        }
        count
    }

    /// CONNECTION_LOST / SHUTDOWN: drop every file held by `addr` and the
    /// peer itself. Returns how many descriptors were removed and whether
    /// `addr` was a known peer.
    pub fn forget_node(&mut self, addr: Ipv4Addr) -> (usize, bool) {
        let before = self.network.len();
        self.network.retain(|d| d.holder != addr);
        let was_peer = self.peers.remove(&addr);
        (before - self.network.len(), was_peer)
    }

    // ── Descriptor rules ──────────────────────────────────────────────────────

    /// NEW_FILE: insert, or resolve a hash collision by `supersedes`.
    pub fn announce(&mut self, descriptor: FileDescriptor) -> Announce {
        match self
            .network
            .iter_mut()
            .find(|d| d.content_hash == descriptor.content_hash)
        {
            Some(existing) if descriptor.supersedes(existing) => {
                *existing = descriptor;
                Announce::Replaced
            }
            Some(_) => Announce::Kept,
            None => {
                self.network.push(descriptor);
                Announce::Inserted
            }
        }
    }

    /// REVOKE_FILE: forget the hash everywhere. Returns entries removed.
    pub fn revoke(&mut self, hash: &ContentHash) -> usize {
        let before = self.local.len() + self.network.len();
        self.local.retain(|d| &d.content_hash != hash);
        self.network.retain(|d| &d.content_hash != hash);
        before - (self.local.len() + self.network.len())
    }

    /// DISCARD_DESCRIPTOR: invalidate by hash. A discard that overtakes the
    /// announcement is kept as an invalid placeholder.
    pub fn discard(&mut self, descriptor: &FileDescriptor) {
        let hash = descriptor.content_hash;
        let mut found = false;
        for d in self.network.iter_mut().filter(|d| d.content_hash == hash) {
            d.valid = false;
            found = true;
        }
        if !found {
            self.network.push(descriptor.invalidated());
        }
        for d in self.local.iter_mut().filter(|d| d.content_hash == hash) {
            d.valid = false;
        }
    }

    /// UPDATE_DESCRIPTOR: replace by hash, inserting when absent. The local
    /// list follows the holder: kept when it is `me`, dropped otherwise.
    pub fn update(&mut self, descriptor: FileDescriptor, me: Ipv4Addr) {
        if descriptor.holder == me {
            upsert(&mut self.local, descriptor.clone());
        } else {
            self.local.retain(|d| d.content_hash != descriptor.content_hash);
        }
        upsert(&mut self.network, descriptor);
    }

    // ── Local files ───────────────────────────────────────────────────────────

    pub fn add_local(&mut self, descriptor: FileDescriptor) {
        upsert(&mut self.local, descriptor);
    }

    pub fn local_by_hash(&self, hash: &ContentHash) -> Option<&FileDescriptor> {
        self.local.iter().find(|d| &d.content_hash == hash)
    }

    pub fn remove_local(&mut self, hash: &ContentHash) -> Option<FileDescriptor> {
        let pos = self.local.iter().position(|d| &d.content_hash == hash)?;
        Some(self.local.remove(pos))
    }

    pub fn take_local(&mut self) -> Vec<FileDescriptor> {
        std::mem::take(&mut self.local)
    }

    // ── Lookups ───────────────────────────────────────────────────────────────

    pub fn by_hash(&self, hash: &ContentHash) -> Option<&FileDescriptor> {
        self.network.iter().find(|d| &d.content_hash == hash)
    }

    /// Unique network entry with this name.
    pub fn find_by_name(&self, name: &str) -> Result<FileDescriptor, RequestError> {
        let mut matches = self.network.iter().filter(|d| d.name == name);
        match (matches.next(), matches.count()) {
            (None, _) => Err(RequestError::NotFound(name.to_string())),
            (Some(d), 0) => Ok(d.clone()),
            (Some(_), rest) => Err(RequestError::Ambiguous {
                name: name.to_string(),
                count: rest + 1,
            }),
        }
    }

    /// Network entry with this hash, provided its name matches too.
    pub fn find(&self, name: &str, hash: &ContentHash) -> Result<FileDescriptor, RequestError> {
        match self.by_hash(hash) {
            Some(d) if d.name == name => Ok(d.clone()),
            _ => Err(RequestError::NotFound(format!("{name} ({hash})"))),
        }
    }
}

fn upsert(list: &mut Vec<FileDescriptor>, descriptor: FileDescriptor) {
    match list
        .iter_mut()
        .find(|d| d.content_hash == descriptor.content_hash)
    {
        Some(existing) => *existing = descriptor,
        None => list.push(descriptor),
    }
}
