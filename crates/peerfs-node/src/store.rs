//! Local content storage.
//!
//! A node keeps two stores: blobs of the files it holds, keyed by content
//! hash, and files it fetched from the network, keyed by name. Neither store
//! knows about descriptors or peers.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

pub trait FileStore: Send + Sync {
    fn load(&self, name: &str) -> io::Result<Vec<u8>>;
    fn store(&self, name: &str, content: &[u8]) -> io::Result<()>;
    /// False when there was nothing to delete.
    fn delete(&self, name: &str) -> bool;
}

/// Files under one directory. Names are single path components.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Creates `root` if it does not exist.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> io::Result<PathBuf> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\', '\0'])
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{name:?} is not a plain file name"),
            ));
        }
        Ok(self.root.join(name))
    }
}

impl FileStore for DiskStore {
    fn load(&self, name: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.path(name)?)
    }

    fn store(&self, name: &str, content: &[u8]) -> io::Result<()> {
        std::fs::write(self.path(name)?, content)
    }

    fn delete(&self, name: &str) -> bool {
        match self.path(name) {
            Ok(path) => std::fs::remove_file(path).is_ok(),
            Err(_) => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

impl FileStore for MemoryStore {
    fn load(&self, name: &str) -> io::Result<Vec<u8>> {
        self.files
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{name} not stored")))
    }

    fn store(&self, name: &str, content: &[u8]) -> io::Result<()> {
        self.files.lock().insert(name.to_string(), content.to_vec());
        Ok(())
    }

    fn delete(&self, name: &str) -> bool {
        self.files.lock().remove(name).is_some()
    }
}
