use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::consumer::MessageConsumer;
use crate::message::Message;

/// Key-addressable store for the current state of every entity of a channel.
///
/// Implementations may keep entries in memory, off-heap, or on disk.
pub trait WorkingSet: Send + Sync {
    fn put(&self, key: &str, value: String);

    fn get(&self, key: &str) -> Option<String>;

    fn remove(&self, key: &str) -> Option<String>;

    /// Visits all entries, stopping at the first error.
    fn for_each(
        &self,
        visitor: &mut dyn FnMut(&str, &str) -> std::io::Result<()>,
    ) -> std::io::Result<()>;

    fn size(&self) -> usize;

    fn clear(&self);

    /// A tombstone removes the key, anything else replaces its value.
    /// Applying the same message twice has the same effect as applying it once.
    fn apply(&self, message: &Message) {
        let key = message.key().compaction_key();
        match message.payload() {
            Some(payload) => self.put(key, payload.to_string()),
            None => {
                self.remove(key);
            }
        }
    }
}

/// A [`WorkingSet`] on the heap. Entries are visited in key order, which
/// keeps snapshot files deterministic.
#[derive(Debug, Default)]
pub struct InMemoryWorkingSet {
    entries: Mutex<BTreeMap<String, String>>,
}

impl InMemoryWorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorkingSet for InMemoryWorkingSet {
    fn put(&self, key: &str, value: String) {
        self.entries().insert(key.to_string(), value);
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    fn remove(&self, key: &str) -> Option<String> {
        self.entries().remove(key)
    }

    fn for_each(
        &self,
        visitor: &mut dyn FnMut(&str, &str) -> std::io::Result<()>,
    ) -> std::io::Result<()> {
        for (key, value) in self.entries().iter() {
            visitor(key, value)?;
        }
        Ok(())
    }

    fn size(&self) -> usize {
        self.entries().len()
    }

    fn clear(&self) {
        self.entries().clear();
    }
}

/// Folds every consumed message into a [`WorkingSet`].
pub struct WorkingSetConsumer {
    working_set: Arc<dyn WorkingSet>,
    applied: AtomicU64,
    tombstones: AtomicU64,
}

impl WorkingSetConsumer {
    pub fn new(working_set: Arc<dyn WorkingSet>) -> Self {
        Self {
            working_set,
            applied: AtomicU64::new(0),
            tombstones: AtomicU64::new(0),
        }
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn tombstones(&self) -> u64 {
        self.tombstones.load(Ordering::Relaxed)
    }
}

impl MessageConsumer for WorkingSetConsumer {
    fn accept(&self, message: &Message) -> anyhow::Result<()> {
        self.working_set.apply(message);
        self.applied.fetch_add(1, Ordering::Relaxed);
        if message.is_tombstone() {
            self.tombstones.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
