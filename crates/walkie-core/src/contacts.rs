//! Contact book
//!
//! A small ordered list of `{ name, id }` pairs persisted as a JSON array
//! under the contacts key. Every mutation is written through immediately.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::WalkieResult;
use crate::signaling::PeerId;
use crate::storage::KeyValueStore;

/// A saved remote party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    #[serde(rename = "id")]
    pub remote_id: PeerId,
}

impl Contact {
    pub fn new(name: impl Into<String>, remote_id: impl Into<PeerId>) -> Self {
        Self {
            name: name.into(),
            remote_id: remote_id.into(),
        }
    }
}

/// Ordered contact list, unique by remote id
#[derive(Debug)]
pub struct ContactBook {
    store: Arc<dyn KeyValueStore>,
    key: String,
    contacts: Vec<Contact>,
}

impl ContactBook {
    /// Load the contact list stored under `key`
    ///
    /// Missing or unreadable data yields an empty book; loading never fails.
    pub fn load(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        let key = key.into();
        let contacts = match store.get(&key) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<Contact>>(&raw) {
                Ok(list) => dedup_by_id(list),
                Err(e) => {
                    warn!(key = %key, error = %e, "Ignoring corrupt contact list");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(key = %key, error = %e, "Contact storage unavailable");
                Vec::new()
            }
        };
        debug!(count = contacts.len(), "Loaded contacts");
        Self { store, key, contacts }
    }

    pub fn list(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn find(&self, remote_id: &PeerId) -> Option<&Contact> {
        self.contacts.iter().find(|c| &c.remote_id == remote_id)
    }

    /// Add a contact, or rename the existing entry with the same id
    ///
    /// Returns `Ok(false)` without touching storage when either field is
    /// blank after trimming.
    pub fn add(&mut self, name: &str, remote_id: &str) -> WalkieResult<bool> {
        let name = name.trim();
        let Some(remote_id) = PeerId::parse(remote_id) else {
            return Ok(false);
        };
        if name.is_empty() {
            return Ok(false);
        }

        match self.contacts.iter_mut().find(|c| c.remote_id == remote_id) {
            Some(existing) => existing.name = name.to_string(),
            None => self.contacts.push(Contact::new(name, remote_id)),
        }
        self.persist()?;
        Ok(true)
    }

    /// Remove the contact with `remote_id`; returns whether one was removed
    pub fn remove(&mut self, remote_id: &PeerId) -> WalkieResult<bool> {
        let before = self.contacts.len();
        self.contacts.retain(|c| &c.remote_id != remote_id);
        self.persist()?;
        Ok(self.contacts.len() != before)
    }

    fn persist(&self) -> WalkieResult<()> {
        let json = serde_json::to_string(&self.contacts)?;
        self.store.set(&self.key, &json)
    }
}

fn dedup_by_id(list: Vec<Contact>) -> Vec<Contact> {
    let mut out: Vec<Contact> = Vec::with_capacity(list.len());
    for contact in list {
        if !out.iter().any(|c| c.remote_id == contact.remote_id) {
            out.push(contact);
        }
    }
    out
}
