//! Durable key-value storage for reporting state.
use std::{
    cell::RefCell,
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    rc::Rc,
};

use thiserror::Error;

/// An error that can occur when reading or writing the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("store io error: {0}")]
    Io(#[from] io::Error),
    /// The stored data could not be encoded or decoded.
    #[error("store encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// String keys to string values, written through synchronously.
pub trait KeyValueStore {
    /// Read a value.
    ///
    /// # Errors
    ///
    /// Fails if the backing storage cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value. The write is durable when this returns.
    ///
    /// # Errors
    ///
    /// Fails if the backing storage cannot be written.
    fn set(&mut self, key: &str, value: String) -> Result<(), StoreError>;

    /// Delete a value.
    ///
    /// # Errors
    ///
    /// Fails if the backing storage cannot be written.
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store. Clones share the same map, which lets tests simulate a
/// restart by handing a clone to a fresh pipeline.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore(Rc<RefCell<BTreeMap<String, String>>>);

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.0.borrow().get(key).cloned())
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), StoreError> {
        self.0.borrow_mut().insert(key.to_owned(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.0.borrow_mut().remove(key);
        Ok(())
    }
}

/// A single JSON object on disk. Every write rewrites the file through a
/// temporary sibling and a rename.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileStore {
    /// Open `path`, starting empty if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read or parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self { path, entries })
    }

    fn flush(&self) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.insert(key.to_owned(), value);
        self.flush()
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        if self.entries.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{FileStore, KeyValueStore, MemoryStore};

    #[test]
    fn memory_clones_share_state() {
        let mut a = MemoryStore::new();
        let b = a.clone();

        a.set("k", "v".into()).unwrap();
        assert_eq!(b.get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn file_survives_reopen() {
        let path = std::env::temp_dir().join(format!("hazardwatch-store-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let mut store = FileStore::open(&path).unwrap();
        store.set("today", "[\"pin-001\"]".into()).unwrap();
        store.set("gone", "x".into()).unwrap();
        store.remove("gone").unwrap();
        drop(store);

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get("today").unwrap().as_deref(), Some("[\"pin-001\"]"));
        assert_eq!(reopened.get("gone").unwrap(), None);

        std::fs::remove_file(&path).unwrap();
    }
}
