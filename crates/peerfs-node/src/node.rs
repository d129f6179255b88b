//! A peerfs node: one session in the network and the public API over it.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use peerfs_core::config::PeerfsConfig;
use peerfs_core::wire::DESCRIPTOR_SIZE;
use peerfs_core::{ContentHash, FileDescriptor, Message};

use crate::directory::DirectoryState;
use crate::error::{PlacementError, RequestError, SessionError};
use crate::events::NodeEvent;
use crate::network::{MessageHandler, Network};
use crate::placement;
use crate::protocol::Dispatcher;
use crate::store::{DiskStore, FileStore};
use crate::transport::Transport;

/// How `format_address` renders this node's own address.
pub const THIS_HOST: &str = ">>THIS HOST<<";

const EVENT_CAPACITY: usize = 256;

/// Session timings and the largest payload peers accept.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub grace_period: Duration,
    pub discard_propagation: Duration,
    pub delete_fence: Duration,
    /// Uploads whose file-carrying frame would exceed this are rejected
    /// before anything is sent. Must match `network.max_payload_bytes`
    /// across the network.
    pub max_payload: usize,
}

impl From<&PeerfsConfig> for NodeSettings {
    fn from(config: &PeerfsConfig) -> Self {
        Self {
            grace_period: config.session.grace_period(),
            discard_propagation: config.session.discard_propagation(),
            delete_fence: config.session.delete_fence(),
            max_payload: config.network.max_payload_bytes,
        }
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self::from(&PeerfsConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    /// `end_session` in progress.
    Departing,
    Ended,
}

pub(crate) struct NodeInner {
    pub(crate) addr: Ipv4Addr,
    pub(crate) network: Arc<dyn Network>,
    pub(crate) blobs: Arc<dyn FileStore>,
    pub(crate) downloads: Arc<dyn FileStore>,
    pub(crate) directory: Mutex<DirectoryState>,
    pub(crate) phase: Mutex<Phase>,
    pub(crate) events: broadcast::Sender<NodeEvent>,
    settings: NodeSettings,
    grace_timer: Mutex<Option<JoinHandle<()>>>,
}

impl NodeInner {
    pub(crate) fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub(crate) fn send(&self, message: Message, dest: Ipv4Addr) {
        tracing::debug!(dest = %dest, kind = %message.kind(), "unicast");
        match message.encode() {
            Ok(frame) => self.network.send_unicast(frame, dest),
            Err(e) => tracing::warn!(dest = %dest, kind = %message.kind(), error = %e, "message not sent"),
        }
    }

    pub(crate) fn broadcast(&self, message: Message) {
        tracing::debug!(kind = %message.kind(), "broadcast");
        match message.encode() {
            Ok(frame) => self.network.broadcast(frame),
            Err(e) => tracing::warn!(kind = %message.kind(), error = %e, "broadcast not sent"),
        }
    }

    pub(crate) fn publish(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn ensure_running(&self) -> Result<(), RequestError> {
        match self.phase() {
            Phase::Running => Ok(()),
            _ => Err(RequestError::NotRunning),
        }
    }
}

/// Handle to a node. Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Bind sockets and open on-disk stores as configured.
    pub fn bind(config: &PeerfsConfig) -> Result<Node, SessionError> {
        let transport = Transport::bind(&config.network)?;
        let blobs = DiskStore::open(&config.storage.blob_dir).map_err(SessionError::Storage)?;
        let downloads =
            DiskStore::open(&config.storage.download_dir).map_err(SessionError::Storage)?;
        Ok(Node::with_network(
            Arc::new(transport),
            Arc::new(blobs),
            Arc::new(downloads),
            NodeSettings::from(config),
        ))
    }

    pub fn with_network(
        network: Arc<dyn Network>,
        blobs: Arc<dyn FileStore>,
        downloads: Arc<dyn FileStore>,
        settings: NodeSettings,
    ) -> Node {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Node {
            inner: Arc::new(NodeInner {
                addr: network.local_addr(),
                network,
                blobs,
                downloads,
                directory: Mutex::new(DirectoryState::new()),
                phase: Mutex::new(Phase::Idle),
                events,
                settings,
                grace_timer: Mutex::new(None),
            }),
        }
    }

    pub fn local_addr(&self) -> Ipv4Addr {
        self.inner.addr
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Join the network: listen, open the new-node window, say HELLO.
    pub async fn start_session(&self) -> Result<(), SessionError> {
        {
            let mut phase = self.inner.phase.lock();
            match *phase {
                Phase::Idle => *phase = Phase::Running,
                Phase::Running | Phase::Departing => return Err(SessionError::AlreadyStarted),
                Phase::Ended => return Err(SessionError::Ended),
            }
        }

        let handler: Arc<dyn MessageHandler> = Arc::new(Dispatcher::new(&self.inner));
        if let Err(e) = self.inner.network.start_listening(handler) {
            *self.inner.phase.lock() = Phase::Idle;
            return Err(e.into());
        }
        self.inner.network.set_self_broadcasts(true);

        let node = Arc::downgrade(&self.inner);
        let grace = self.inner.settings.grace_period;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(node) = node.upgrade() {
                if node.directory.lock().end_grace() {
                    tracing::info!("new-node grace period over");
                }
            }
        });
        *self.inner.grace_timer.lock() = Some(timer);

        tracing::info!(addr = %self.inner.addr, grace_ms = grace.as_millis() as u64, "session started");
        self.inner.broadcast(Message::Hello);
        Ok(())
    }

    /// Leave the network, handing every local file to another node first.
    pub async fn end_session(&self) -> Result<(), SessionError> {
        {
            let mut phase = self.inner.phase.lock();
            if *phase != Phase::Running {
                return Err(SessionError::NotRunning);
            }
            *phase = Phase::Departing;
        }
        let me = self.inner.addr;
        tracing::info!(addr = %me, "ending session");

        self.inner.broadcast(Message::Disconnecting);

        let local = self.inner.directory.lock().local().to_vec();
        for descriptor in &local {
            let discarded = descriptor.invalidated();
            self.inner.directory.lock().discard(&discarded);
            self.inner.broadcast(Message::DiscardDescriptor(discarded));
            tokio::time::sleep(self.inner.settings.discard_propagation).await;
        }

        let plan = {
            let dir = self.inner.directory.lock();
            placement::plan_migration(me, dir.peers(), dir.network(), &local)
        };
        match plan {
            Ok(plan) => {
                for (descriptor, target) in plan {
                    self.hand_over(descriptor, target);
                }
            }
            Err(PlacementError::NoOtherNode) => {
                tracing::info!(files = local.len(), "no other node exists, local files are dropped");
                for descriptor in &local {
                    self.inner.blobs.delete(&descriptor.content_hash.to_hex());
                }
            }
        }
        self.inner.directory.lock().take_local();

        self.inner.broadcast(Message::Shutdown);

        if let Some(timer) = self.inner.grace_timer.lock().take() {
            timer.abort();
        }
        self.inner.network.stop_listening().await;
        *self.inner.phase.lock() = Phase::Ended;
        tracing::info!(addr = %me, "session ended");
        Ok(())
    }

    fn hand_over(&self, descriptor: FileDescriptor, target: Ipv4Addr) {
        let key = descriptor.content_hash.to_hex();
        let content = match self.inner.blobs.load(&key) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(name = %descriptor.name, error = %e, "cannot read held file, dropping it");
                return;
            }
        };
        tracing::info!(
            name = %descriptor.name,
            target = %target,
            size = descriptor.size,
            "handing file over"
        );
        let descriptor = FileDescriptor {
            holder: target,
            valid: false,
            ..descriptor
        };
        self.inner.send(
            Message::HolderChange {
                descriptor,
                content: Bytes::from(content),
            },
            target,
        );
        // Best effort: the copy is released once the frame is queued. A
        // failed send or a refusal surfaces as CONNECTION_LOST or CMD_REFUSED.
        self.inner.blobs.delete(&key);
    }

    // ── Files ─────────────────────────────────────────────────────────────────

    /// Publish a local file under its file name.
    pub async fn upload_file(&self, path: impl AsRef<Path>) -> Result<FileDescriptor, RequestError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                RequestError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} has no usable file name", path.display()),
                ))
            })?
            .to_string();
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            tracing::info!(path = %path.display(), error = %e, "upload: cannot read file");
            RequestError::Io(e)
        })?;
        self.check_size(&name, metadata.len())?;
        let content = tokio::fs::read(path).await.map_err(|e| {
            tracing::info!(path = %path.display(), error = %e, "upload: cannot read file");
            RequestError::Io(e)
        })?;
        self.upload_bytes(&name, &content)
    }

    /// Publish `content` as `name`, stored on the least-loaded node.
    pub fn upload_bytes(&self, name: &str, content: &[u8]) -> Result<FileDescriptor, RequestError> {
        self.inner.ensure_running()?;
        self.check_size(name, content.len() as u64)?;
        let me = self.inner.addr;

        let mut descriptor = FileDescriptor::for_content(name, content, unix_now(), me, me)
            .map_err(|e| {
                tracing::info!(name, error = %e, "upload: invalid name");
                RequestError::from(e)
            })?;

        {
            let dir = self.inner.directory.lock();
            if let Some(existing) = dir.by_hash(&descriptor.content_hash) {
                tracing::info!(
                    name,
                    hash = %descriptor.content_hash,
                    existing = %existing.name,
                    "upload: content already published"
                );
                return Err(RequestError::AlreadyPublished {
                    name: name.to_string(),
                    existing: existing.name.clone(),
                });
            }
            descriptor.holder = placement::least_loaded(me, dir.peers(), dir.network());
        }

        if descriptor.holder == me {
            self.inner
                .blobs
                .store(&descriptor.content_hash.to_hex(), content)?;
            {
                let mut dir = self.inner.directory.lock();
                dir.add_local(descriptor.clone());
                dir.announce(descriptor.clone());
            }
            tracing::info!(name, hash = %descriptor.content_hash, holder = THIS_HOST, "file uploaded");
            self.inner.broadcast(Message::NewFile(descriptor.clone()));
        } else {
            tracing::info!(
                name,
                hash = %descriptor.content_hash,
                holder = %descriptor.holder,
                "uploading file"
            );
            self.inner.send(
                Message::UploadFile {
                    descriptor: descriptor.clone(),
                    content: Bytes::copy_from_slice(content),
                },
                descriptor.holder,
            );
        }
        Ok(descriptor)
    }

    /// Every copy of a file travels in one frame: descriptor plus content.
    fn check_size(&self, name: &str, size: u64) -> Result<(), RequestError> {
        let limit = self.inner.settings.max_payload;
        let fits = usize::try_from(size)
            .ok()
            .and_then(|size| size.checked_add(DESCRIPTOR_SIZE))
            .is_some_and(|payload| payload <= limit);
        if fits {
            return Ok(());
        }
        tracing::info!(name, size, limit, "upload: file too large for one frame");
        Err(RequestError::TooLarge {
            name: name.to_string(),
            size,
            limit,
        })
    }

    /// Fetch the only file called `name` into the download store.
    pub fn get_file(&self, name: &str) -> Result<FileDescriptor, RequestError> {
        self.inner.ensure_running()?;
        let descriptor = self.lookup(name, None)?;
        self.fetch(descriptor)
    }

    pub fn get_file_with_hash(&self, name: &str, hash: &str) -> Result<FileDescriptor, RequestError> {
        self.inner.ensure_running()?;
        let hash: ContentHash = hash.parse()?;
        let descriptor = self.lookup(name, Some(&hash))?;
        self.fetch(descriptor)
    }

    fn fetch(&self, descriptor: FileDescriptor) -> Result<FileDescriptor, RequestError> {
        if !descriptor.valid {
            tracing::info!(name = %descriptor.name, "get: file is being moved or deleted");
            return Err(RequestError::Unavailable(descriptor.name));
        }

        if descriptor.holder != self.inner.addr {
            self.inner.send(Message::GetFile(descriptor.clone()), descriptor.holder);
            return Ok(descriptor);
        }

        // Held here: copy the blob into the download store.
        let content = self.inner.blobs.load(&descriptor.content_hash.to_hex())?;
        self.inner.downloads.store(&descriptor.name, &content)?;
        let verified = ContentHash::compute(&content) == descriptor.content_hash;
        tracing::info!(name = %descriptor.name, holder = THIS_HOST, "file copied from local storage");
        self.inner.publish(NodeEvent::FileReceived {
            descriptor: descriptor.clone(),
            verified,
        });
        Ok(descriptor)
    }

    /// Delete the only file called `name`. Only its owner may.
    pub async fn delete_file(&self, name: &str) -> Result<FileDescriptor, RequestError> {
        self.inner.ensure_running()?;
        let descriptor = self.lookup(name, None)?;
        self.remove(descriptor).await
    }

    pub async fn delete_file_with_hash(
        &self,
        name: &str,
        hash: &str,
    ) -> Result<FileDescriptor, RequestError> {
        self.inner.ensure_running()?;
        let hash: ContentHash = hash.parse()?;
        let descriptor = self.lookup(name, Some(&hash))?;
        self.remove(descriptor).await
    }

    /// Fence with DISCARD_DESCRIPTOR, then ask the holder to delete.
    async fn remove(&self, descriptor: FileDescriptor) -> Result<FileDescriptor, RequestError> {
        if descriptor.owner != self.inner.addr {
            tracing::info!(
                name = %descriptor.name,
                owner = %descriptor.owner,
                "delete: not the owner"
            );
            return Err(RequestError::NotOwner {
                name: descriptor.name,
                owner: descriptor.owner,
            });
        }
        if !descriptor.valid {
            tracing::info!(name = %descriptor.name, "delete: file is being moved or deleted");
            return Err(RequestError::Unavailable(descriptor.name));
        }

        let discarded = descriptor.invalidated();
        self.inner.directory.lock().discard(&discarded);
        self.inner.broadcast(Message::DiscardDescriptor(discarded.clone()));

        tokio::time::sleep(self.inner.settings.delete_fence).await;

        tracing::info!(name = %discarded.name, holder = %discarded.holder, "deleting file");
        self.inner.send(Message::DeleteFile(discarded.clone()), discarded.holder);
        Ok(discarded)
    }

    fn lookup(&self, name: &str, hash: Option<&ContentHash>) -> Result<FileDescriptor, RequestError> {
        let dir = self.inner.directory.lock();
        let found = match hash {
            Some(hash) => dir.find(name, hash),
            None => dir.find_by_name(name),
        };
        if let Err(e) = &found {
            tracing::info!(name, error = %e, "lookup failed");
        }
        found
    }

    // ── Views ─────────────────────────────────────────────────────────────────

    pub fn local_descriptors(&self) -> Vec<FileDescriptor> {
        self.inner.directory.lock().local().to_vec()
    }

    pub fn network_descriptors(&self) -> Vec<FileDescriptor> {
        self.inner.directory.lock().network().to_vec()
    }

    pub fn peers(&self) -> Vec<Ipv4Addr> {
        self.inner.directory.lock().peers().iter().copied().collect()
    }

    pub fn is_new_node(&self) -> bool {
        self.inner.directory.lock().is_new_node()
    }

    pub fn format_address(&self, addr: Ipv4Addr) -> String {
        if addr == self.inner.addr {
            THIS_HOST.to_string()
        } else {
            addr.to_string()
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
