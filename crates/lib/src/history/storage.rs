//! Key-value byte storage backing the history store.
//!
//! `FileStore` keeps one file per key under a directory and replaces it via
//! temp file + rename, so a crash mid-write leaves the previous value intact.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Byte storage addressed by string keys. `set` fully overwrites the value.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, bytes: &[u8]) -> io::Result<()>;
}

/// Directory-backed store: key `k` lives at `<dir>/k.json`.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) the storage directory.
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)
    }
}

/// In-process store; contents are lost when dropped.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let g = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "memory store poisoned"))?;
        Ok(g.get(key).cloned())
    }

    fn set(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        let mut g = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "memory store poisoned"))?;
        g.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("ember-store-test-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn file_store_missing_key_is_none() {
        let store = FileStore::open(temp_dir()).unwrap();
        assert_eq!(store.get("absent").unwrap(), None);
    }

    #[test]
    fn file_store_overwrites_value() {
        let dir = temp_dir();
        let store = FileStore::open(&dir).unwrap();
        store.set("history", b"[1]").unwrap();
        store.set("history", b"[2]").unwrap();
        assert_eq!(store.get("history").unwrap(), Some(b"[2]".to_vec()));
        assert!(dir.join("history.json").exists());
        assert!(!dir.join("history.json.tmp").exists());
    }

    #[test]
    fn file_store_sanitizes_keys() {
        let dir = temp_dir();
        let store = FileStore::open(&dir).unwrap();
        store.set("../escape/key", b"x").unwrap();
        assert!(dir.join(".._escape_key.json").exists());
        assert_eq!(store.get("../escape/key").unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", b"v").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
    }
}
