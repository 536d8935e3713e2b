//! # CacheStore
//! Timestamped entity snapshots that survive reloads.
//! Reads are synchronous and served from memory, so the UI can paint cached state before anything hits the network.
//! The store never merges and never evicts: a write replaces the entry, and staleness is only reported, the caller decides what to do with it.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::{runtime::Clock, storage::StorageBackend};

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub value: T,
    pub written_at: DateTime<Utc>,
    #[serde(rename = "ttlMs", with = "ttl_millis", default)]
    pub ttl: Option<Duration>,
}

impl<T> CacheEntry<T> {
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        now.signed_duration_since(self.written_at)
            .to_std()
            .is_ok_and(|age| age > ttl)
    }
}

mod ttl_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match ttl {
            Some(ttl) => serializer.serialize_some(&(ttl.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

type RawEntry = CacheEntry<serde_json::Value>;

pub struct CacheStore {
    backend: Box<dyn StorageBackend>,
    clock: Rc<dyn Clock>,
    prefix: String,
    // `None` marks a key known to be absent, so a removed entry is never re-read from the backend.
    memory: RefCell<HashMap<String, Option<RawEntry>>>,
    persistent: Cell<bool>,
}

impl CacheStore {
    pub fn new(
        backend: Box<dyn StorageBackend>,
        clock: Rc<dyn Clock>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            clock,
            prefix: prefix.into(),
            memory: RefCell::new(HashMap::new()),
            persistent: Cell::new(true),
        }
    }

    /// False once a write to the backend has failed; from then on this session only caches in memory.
    pub fn is_persistent(&self) -> bool {
        self.persistent.get()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        let raw = self.get_raw(key)?;
        match serde_json::from_value(raw.value) {
            Ok(value) => Some(CacheEntry {
                value,
                written_at: raw.written_at,
                ttl: raw.ttl,
            }),
            Err(e) => {
                log::warn!("Cached value for {key} has an unexpected shape, ignoring it: {e}");
                None
            }
        }
    }

    /// Replaces the entry for `key` and returns its timestamp.
    pub fn set<T: serde::Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<DateTime<Utc>, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        let now = self.clock.now();
        // writtenAt never goes backwards for a key, even if the clock does
        let written_at = match self.get_raw(key) {
            Some(previous) if previous.written_at > now => previous.written_at,
            _ => now,
        };
        let entry = RawEntry {
            value,
            written_at,
            ttl,
        };

        self.persist(key, &entry);
        self.memory
            .borrow_mut()
            .insert(key.to_string(), Some(entry));
        Ok(written_at)
    }

    pub fn remove(&self, key: &str) {
        self.memory.borrow_mut().insert(key.to_string(), None);
        if let Err(e) = self.backend.remove(&self.storage_key(key)) {
            log::warn!("Failed to remove {key} from storage: {e}");
        }
    }

    /// True if there's no entry or it outlived its ttl. Entries without a ttl never go stale.
    pub fn is_stale(&self, key: &str) -> bool {
        match self.get_raw(key) {
            Some(entry) => entry.is_stale_at(self.clock.now()),
            None => true,
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    fn get_raw(&self, key: &str) -> Option<RawEntry> {
        if let Some(known) = self.memory.borrow().get(key) {
            return known.clone();
        }

        let hydrated = self.load(key);
        self.memory
            .borrow_mut()
            .insert(key.to_string(), hydrated.clone());
        hydrated
    }

    fn load(&self, key: &str) -> Option<RawEntry> {
        let text = match self.backend.get(&self.storage_key(key)) {
            Ok(text) => text?,
            Err(e) => {
                log::warn!("Failed to read {key} from storage: {e}");
                return None;
            }
        };
        serde_json::from_str(&text)
            .inspect_err(|e| log::warn!("Dropping unreadable cache entry {key}: {e}"))
            .ok()
    }

    fn persist(&self, key: &str, entry: &RawEntry) {
        if !self.persistent.get() {
            return;
        }
        let text = match serde_json::to_string(entry) {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to serialize cache entry {key}: {e}");
                return;
            }
        };
        if let Err(e) = self.backend.set(&self.storage_key(key), &text) {
            log::warn!("Cache write for {key} failed ({e}), keeping the cache in memory for this session");
            self.persistent.set(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        storage::{MemoryStorage, StorageError},
        testing::ManualClock,
    };

    fn store_with(backend: Rc<MemoryStorage>, clock: Rc<ManualClock>) -> CacheStore {
        CacheStore::new(Box::new(backend), clock, "test")
    }

    #[test]
    fn set_then_get_round_trips_value_and_stamp() {
        let clock = Rc::new(ManualClock::default());
        let store = store_with(Rc::new(MemoryStorage::default()), clock.clone());

        let written_at = store.set("cart:u1", &vec![1, 2, 3], None).unwrap();
        let entry = store.get::<Vec<i32>>("cart:u1").unwrap();

        assert_eq!(entry.value, vec![1, 2, 3]);
        assert_eq!(entry.written_at, written_at);
        assert_eq!(written_at, clock.now());
    }

    #[test]
    fn entries_survive_a_reload() {
        let backend = Rc::new(MemoryStorage::default());
        let clock = Rc::new(ManualClock::default());

        store_with(backend.clone(), clock.clone())
            .set("balance:u1", &42, Some(Duration::from_secs(60)))
            .unwrap();

        let reloaded = store_with(backend.clone(), clock);
        let entry = reloaded.get::<i32>("balance:u1").unwrap();
        assert_eq!(entry.value, 42);
        assert_eq!(entry.ttl, Some(Duration::from_secs(60)));
        assert!(backend.get("test:balance:u1").unwrap().is_some());
    }

    #[test]
    fn staleness_is_reported_not_enforced() {
        let clock = Rc::new(ManualClock::default());
        let store = store_with(Rc::new(MemoryStorage::default()), clock.clone());

        assert!(store.is_stale("missing"));

        store.set("k", &"v", Some(Duration::from_secs(30))).unwrap();
        store.set("forever", &"v", None).unwrap();
        assert!(!store.is_stale("k"));

        clock.advance(Duration::from_secs(31));
        assert!(store.is_stale("k"));
        assert!(!store.is_stale("forever"));
        // Still readable.
        assert_eq!(store.get::<String>("k").unwrap().value, "v");
    }

    #[test]
    fn written_at_never_moves_backwards() {
        let clock = Rc::new(ManualClock::default());
        let store = store_with(Rc::new(MemoryStorage::default()), clock.clone());

        let first = store.set("k", &1, None).unwrap();
        clock.rewind(Duration::from_secs(5));
        let second = store.set("k", &2, None).unwrap();

        assert_eq!(second, first);
        assert_eq!(store.get::<i32>("k").unwrap().value, 2);
    }

    #[test]
    fn quota_failure_degrades_to_memory() {
        let backend = Rc::new(MemoryStorage::with_quota(64));
        let store = store_with(backend.clone(), Rc::new(ManualClock::default()));

        store.set("big", &"x".repeat(200), None).unwrap();

        assert!(!store.is_persistent());
        assert_eq!(store.get::<String>("big").unwrap().value.len(), 200);
        assert_eq!(backend.get("test:big"), Ok(None));

        // Later writes stay in memory too, even small ones.
        store.set("small", &1, None).unwrap();
        assert_eq!(store.get::<i32>("small").unwrap().value, 1);
        assert!(backend.is_empty());
    }

    #[test]
    fn removed_entries_are_not_rehydrated() {
        let backend = Rc::new(MemoryStorage::default());
        let store = store_with(backend.clone(), Rc::new(ManualClock::default()));

        store.set("k", &1, None).unwrap();
        store.remove("k");

        assert!(store.get::<i32>("k").is_none());
        assert_eq!(backend.get("test:k"), Ok(None));
    }

    #[test]
    fn corrupt_entries_read_as_absent() {
        let backend = Rc::new(MemoryStorage::default());
        backend.set("test:k", "not json").unwrap();
        let store = store_with(backend, Rc::new(ManualClock::default()));

        assert!(store.get::<i32>("k").is_none());
        assert!(store.is_stale("k"));
    }

    #[test]
    fn shape_mismatch_reads_as_absent() {
        let store = store_with(
            Rc::new(MemoryStorage::default()),
            Rc::new(ManualClock::default()),
        );
        store.set("k", &"text", None).unwrap();
        assert!(store.get::<i32>("k").is_none());
    }

    #[test]
    fn storage_errors_are_displayable() {
        assert_eq!(StorageError::QuotaExceeded.to_string(), "storage quota exceeded");
    }
}
