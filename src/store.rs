//! Durable key-to-bytes storage surviving power loss.
//!
//! Both the security layer and the update manager persist through this trait;
//! the real device backs it with flash, tests use the in-memory double.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

/// Durable record storage. Keys are slash-separated paths
/// (e.g. `security/nonce`, `fota/state`).
pub trait RecordStore {
    /// Read a record, `None` if it does not exist.
    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
    /// Write a record, replacing any previous value.
    fn write(&mut self, key: &str, data: &[u8]) -> io::Result<()>;
    /// Remove a record. Removing a missing record is not an error.
    fn remove(&mut self, key: &str) -> io::Result<()>;
}

/// Filesystem-backed store mapping keys to files under a root directory.
pub struct FsRecordStore {
    root: PathBuf,
}

impl FsRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl RecordStore for FsRecordStore {
    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, key: &str, data: &[u8]) -> io::Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)
    }

    fn remove(&mut self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// In-memory store for tests and simulation.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: HashMap<String, Vec<u8>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }
}

impl RecordStore for MemoryRecordStore {
    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.records.get(key).cloned())
    }

    fn write(&mut self, key: &str, data: &[u8]) -> io::Result<()> {
        self.records.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> io::Result<()> {
        self.records.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_store_round_trip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FsRecordStore::new(dir.path());

        assert!(store.read("security/nonce").unwrap().is_none());
        store.write("security/nonce", b"abc").unwrap();
        assert_eq!(store.read("security/nonce").unwrap().unwrap(), b"abc");

        store.remove("security/nonce").unwrap();
        assert!(store.read("security/nonce").unwrap().is_none());
        // Removing again is fine.
        store.remove("security/nonce").unwrap();
    }

    #[test]
    fn memory_store_overwrites() {
        let mut store = MemoryRecordStore::new();
        store.write("k", b"1").unwrap();
        store.write("k", b"2").unwrap();
        assert_eq!(store.read("k").unwrap().unwrap(), b"2");
    }
}
