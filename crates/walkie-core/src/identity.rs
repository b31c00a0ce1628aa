//! Local identity persistence
//!
//! The local endpoint identifier is created once per installation and reused
//! on every start so the other party can keep calling the same id. It only
//! changes when the broker reports the id as taken, in which case the
//! supervisor swaps in a suffixed variant through [`IdentityStore::replace_id`].

use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::WalkieConfig;
use crate::error::WalkieResult;
use crate::signaling::PeerId;
use crate::storage::KeyValueStore;

/// Persists the local endpoint identifier
#[derive(Debug, Clone)]
pub struct IdentityStore {
    store: Arc<dyn KeyValueStore>,
    key: String,
    legacy_keys: Vec<String>,
}

impl IdentityStore {
    /// Create an identity store under `key`
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            legacy_keys: Vec::new(),
        }
    }

    /// Create an identity store using the keys from `config`
    pub fn from_config(store: Arc<dyn KeyValueStore>, config: &WalkieConfig) -> Self {
        Self {
            store,
            key: config.identity_key.clone(),
            legacy_keys: config.legacy_identity_keys.clone(),
        }
    }

    /// Read the stored identifier without creating one
    ///
    /// An id found only under a legacy key is migrated to the primary key.
    pub fn stored_id(&self) -> WalkieResult<Option<PeerId>> {
        if let Some(id) = self.read_key(&self.key)? {
            return Ok(Some(id));
        }
        for legacy in &self.legacy_keys {
            if let Some(id) = self.read_key(legacy)? {
                info!(
                    from = %legacy,
                    to = %self.key,
                    id = %id,
                    "Migrating identity from legacy key"
                );
                self.store.set(&self.key, id.as_str())?;
                self.store.remove(legacy)?;
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Return the stored identifier, generating and persisting one if absent
    pub fn get_or_create_id(&self) -> WalkieResult<PeerId> {
        if let Some(id) = self.stored_id()? {
            debug!(id = %id, "Using stored identity");
            return Ok(id);
        }
        let id = generate_id();
        self.store.set(&self.key, id.as_str())?;
        info!(id = %id, "Generated new local identity");
        Ok(id)
    }

    /// Overwrite the stored identifier
    pub fn replace_id(&self, id: &PeerId) -> WalkieResult<()> {
        warn!(id = %id, "Replacing stored identity");
        self.store.set(&self.key, id.as_str())
    }

    /// Forget the stored identifier; the next start creates a new one
    pub fn reset(&self) -> WalkieResult<()> {
        self.store.remove(&self.key)?;
        for legacy in &self.legacy_keys {
            self.store.remove(legacy)?;
        }
        Ok(())
    }

    fn read_key(&self, key: &str) -> WalkieResult<Option<PeerId>> {
        Ok(self
            .store
            .get(key)?
            .as_deref()
            .and_then(PeerId::parse))
    }
}

/// Generate a fresh random identifier
pub fn generate_id() -> PeerId {
    PeerId::new(uuid::Uuid::new_v4().to_string())
}

/// Derive a variant of `base` with `len` random lowercase alphanumerics
/// appended after a dash, e.g. `abc-x7k2`
pub fn suffixed_id(base: &PeerId, len: usize) -> PeerId {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    PeerId::new(format!("{}-{}", base.as_str(), suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn store() -> (MemoryStore, IdentityStore) {
        let backing = MemoryStore::new();
        let identity =
            IdentityStore::from_config(Arc::new(backing.clone()), &WalkieConfig::default());
        (backing, identity)
    }

    #[test]
    fn test_id_survives_restart() {
        let (backing, identity) = store();
        let first = identity.get_or_create_id().unwrap();

        let restarted =
            IdentityStore::from_config(Arc::new(backing.clone()), &WalkieConfig::default());
        assert_eq!(restarted.get_or_create_id().unwrap(), first);
        assert_eq!(backing.get("walkie-id").unwrap(), Some(first.to_string()));
    }

    #[test]
    fn test_replace_and_reset() {
        let (_backing, identity) = store();
        identity.get_or_create_id().unwrap();

        identity.replace_id(&PeerId::new("abc-1234")).unwrap();
        assert_eq!(identity.stored_id().unwrap(), Some(PeerId::new("abc-1234")));

        identity.reset().unwrap();
        assert_eq!(identity.stored_id().unwrap(), None);
    }

    #[test]
    fn test_legacy_key_is_migrated() {
        let backing = MemoryStore::with_entries([("walkie-peer-id", "old-id")]);
        let identity =
            IdentityStore::from_config(Arc::new(backing.clone()), &WalkieConfig::default());

        assert_eq!(identity.get_or_create_id().unwrap(), PeerId::new("old-id"));
        assert_eq!(backing.get("walkie-id").unwrap(), Some("old-id".to_string()));
        assert_eq!(backing.get("walkie-peer-id").unwrap(), None);
    }

    #[test]
    fn test_blank_stored_value_counts_as_missing() {
        let backing = MemoryStore::with_entries([("walkie-id", "   ")]);
        let identity = IdentityStore::from_config(Arc::new(backing), &WalkieConfig::default());
        assert_eq!(identity.stored_id().unwrap(), None);
        let created = identity.get_or_create_id().unwrap();
        assert!(!created.as_str().trim().is_empty());
    }

    #[test]
    fn test_suffixed_id_shape() {
        let id = suffixed_id(&PeerId::new("abc"), 4);
        let (base, suffix) = id.as_str().split_once('-').unwrap();
        assert_eq!(base, "abc");
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
