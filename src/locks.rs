//! Per-key read-write locks.
//!
//! One lock per partition-bitmap key, created lazily on first use. Writers
//! to the same partition serialize; readers share; different keys never
//! contend. The table is process-local and cleared when the engine closes.

use std::{collections::HashMap, sync::Arc};

use parking_lot::{Mutex, RwLock};

#[derive(Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding `key`, creating it on first use.
    pub fn acquire(&self, key: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(key) {
            return Arc::clone(lock);
        }
        let lock = Arc::new(RwLock::new(()));
        locks.insert(key.to_string(), Arc::clone(&lock));
        lock
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }

    pub fn clear(&self) {
        self.locks.lock().clear();
    }
}
