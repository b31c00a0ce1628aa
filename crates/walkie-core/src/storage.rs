//! Key-value persistence
//!
//! The identity and contact stores persist through [`KeyValueStore`], the
//! same shape as browser local storage: string keys, string values, every
//! write visible to the next read. Two backends ship with the crate:
//!
//! - [`MemoryStore`] keeps values in memory. Clones share the same backing
//!   map, which lets tests simulate an application restart by building a
//!   second component on a clone.
//! - [`JsonFileStore`] keeps all keys in one JSON object on disk and rewrites
//!   the file on every mutation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{WalkieError, WalkieResult};

/// String key-value storage
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    /// Read a value; missing keys are `Ok(None)`
    fn get(&self, key: &str) -> WalkieResult<Option<String>>;

    /// Write a value, replacing any previous one
    fn set(&self, key: &str, value: &str) -> WalkieResult<()>;

    /// Delete a key; deleting a missing key is not an error
    fn remove(&self, key: &str) -> WalkieResult<()>;
}

/// In-memory store whose clones share one backing map
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with the given entries
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        {
            let mut map = store.entries.write();
            for (k, v) in entries {
                map.insert(k.into(), v.into());
            }
        }
        store
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> WalkieResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> WalkieResult<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> WalkieResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// File-backed store holding every key in a single JSON object
///
/// The file is loaded once on open and rewritten (write to a sibling temp
/// file, then rename) after each mutation. A missing file opens as an empty
/// store; an unreadable one is logged and treated as empty so a corrupt file
/// never prevents startup.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> WalkieResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<BTreeMap<String, String>>(&contents) {
                Ok(map) => map,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Store file is corrupt, starting empty"
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), keys = entries.len(), "Opened JSON file store");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> WalkieResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            WalkieError::storage(format!("failed to replace {}: {}", self.path.display(), e))
        })
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> WalkieResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> WalkieResult<()> {
        let mut entries = self.entries.write();
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> WalkieResult<()> {
        let mut entries = self.entries.write();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("walkie-store-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[test]
    fn test_memory_store_clones_share_entries() {
        let store = MemoryStore::new();
        let restarted = store.clone();

        store.set("walkie-id", "abc").unwrap();
        assert_eq!(restarted.get("walkie-id").unwrap(), Some("abc".to_string()));

        restarted.remove("walkie-id").unwrap();
        assert_eq!(store.get("walkie-id").unwrap(), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    #[serial]
    fn test_file_store_survives_reopen() {
        let path = temp_path("store.json");
        {
            let store = JsonFileStore::open(&path).unwrap();
            store.set("walkie-id", "abc").unwrap();
            store.set("walkie-friends", "[]").unwrap();
            store.remove("walkie-friends").unwrap();
        }

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get("walkie-id").unwrap(), Some("abc".to_string()));
        assert_eq!(reopened.get("walkie-friends").unwrap(), None);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    #[serial]
    fn test_file_store_tolerates_corrupt_file() {
        let path = temp_path("corrupt.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get("walkie-id").unwrap(), None);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
