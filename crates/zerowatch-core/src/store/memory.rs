//! In-memory store used by tests and the simulator

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::vec::Vec;

use embassy_time::Duration;

use super::{KeyValueStore, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    ttl: Option<Duration>,
}

/// Key-value store held in RAM with TTL bookkeeping.
///
/// Time only moves when [`advance`](Self::advance) is called. Every
/// mutating call (`set`, `expire`, `del`) is counted, and publishes are
/// recorded, so tests can assert exactly what a component touched.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, Entry>,
    published: Vec<(String, String)>,
    mutations: usize,
    failing_sets: BTreeSet<String>,
    undecodable: BTreeSet<String>,
    offline: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value without counting it as a mutation
    pub fn insert(&mut self, key: &str, value: &str) {
        self.entries.insert(
            String::from(key),
            Entry {
                value: String::from(value),
                ttl: None,
            },
        );
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|e| e.value.as_str())
    }

    /// Remaining time-to-live of `key`, if one was applied
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.entries.get(key).and_then(|e| e.ttl)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Every `(channel, message)` published so far
    pub fn published(&self) -> &[(String, String)] {
        &self.published
    }

    pub fn mutations(&self) -> usize {
        self.mutations
    }

    /// Make every `set` of `key` fail
    pub fn fail_sets_on(&mut self, key: &str) {
        self.failing_sets.insert(String::from(key));
    }

    /// Undo [`fail_sets_on`](Self::fail_sets_on)
    pub fn allow_sets_on(&mut self, key: &str) {
        self.failing_sets.remove(key);
    }

    /// Seed a value whose bytes are not UTF-8: `get` fails with
    /// [`StoreError::NotUtf8`] until the key is set or deleted
    pub fn insert_undecodable(&mut self, key: &str) {
        self.insert(key, "");
        self.undecodable.insert(String::from(key));
    }

    /// Make every operation fail, as a dropped connection would
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    /// Let `by` elapse, dropping entries whose TTL runs out
    pub fn advance(&mut self, by: Duration) {
        self.entries.retain(|_, entry| match entry.ttl {
            Some(ttl) if ttl <= by => false,
            Some(ttl) => {
                entry.ttl = Some(ttl - by);
                true
            }
            None => true,
        });
    }

    fn online(&self) -> Result<(), StoreError> {
        if self.offline {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

impl KeyValueStore for MemoryStore {
    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        self.online()?;
        if self.undecodable.contains(key) {
            return Err(StoreError::NotUtf8);
        }
        Ok(self.entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.online()?;
        self.mutations += 1;
        if self.failing_sets.contains(key) {
            return Err(StoreError::Server(String::from("ERR injected failure")));
        }
        // SET clears any previous TTL, as on the real server
        self.insert(key, value);
        self.undecodable.remove(key);
        Ok(())
    }

    async fn expire(&mut self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.online()?;
        self.mutations += 1;
        Ok(match self.entries.get_mut(key) {
            Some(entry) => {
                entry.ttl = Some(ttl);
                true
            }
            None => false,
        })
    }

    async fn del(&mut self, key: &str) -> Result<bool, StoreError> {
        self.online()?;
        self.mutations += 1;
        self.undecodable.remove(key);
        Ok(self.entries.remove(key).is_some())
    }

    async fn publish(&mut self, channel: &str, message: &str) -> Result<u32, StoreError> {
        self.online()?;
        self.published
            .push((String::from(channel), String::from(message)));
        Ok(0)
    }
}
