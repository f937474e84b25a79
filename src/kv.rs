//! Fast-store contract and the bundled in-process implementation.
//!
//! The engine talks to its hot store through [`KvStore`]: string keys,
//! opaque byte values, one set-valued registry key, and prefix scans. A
//! remote deployment plugs a client for its store (Redis or compatible)
//! into the same trait; [`MemoryKvStore`] backs standalone servers and
//! tests.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;

use crate::error::Result;

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, keys: &[String]) -> Result<()>;

    fn set_add(&self, set_key: &str, member: &str) -> Result<()>;
    fn set_remove(&self, set_key: &str, member: &str) -> Result<()>;
    fn set_is_member(&self, set_key: &str, member: &str) -> Result<bool>;
    fn set_members(&self, set_key: &str) -> Result<Vec<String>>;

    /// Keys currently starting with `prefix`.
    fn scan_keys(&self, prefix: &str) -> Result<HashSet<String>>;
}

/// In-process fast store.
#[derive(Default)]
pub struct MemoryKvStore {
    values: RwLock<HashMap<String, Vec<u8>>>,
    sets: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.values.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, keys: &[String]) -> Result<()> {
        let mut values = self.values.write();
        for key in keys {
            values.remove(key);
        }
        Ok(())
    }

    fn set_add(&self, set_key: &str, member: &str) -> Result<()> {
        self.sets
            .write()
            .entry(set_key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    fn set_remove(&self, set_key: &str, member: &str) -> Result<()> {
        if let Some(set) = self.sets.write().get_mut(set_key) {
            set.remove(member);
        }
        Ok(())
    }

    fn set_is_member(&self, set_key: &str, member: &str) -> Result<bool> {
        Ok(self
            .sets
            .read()
            .get(set_key)
            .map(|set| set.contains(member))
            .unwrap_or(false))
    }

    fn set_members(&self, set_key: &str) -> Result<Vec<String>> {
        Ok(self
            .sets
            .read()
            .get(set_key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn scan_keys(&self, prefix: &str) -> Result<HashSet<String>> {
        Ok(self
            .values
            .read()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
