//! Radius-bounded content storage.
//!
//! The persistence backend is consumed through a trait: an ordered
//! key→value store keyed by hex-encoded content ids. Two backends ship
//! here — an in-memory map and a sqlite database. `RadiusStore` layers the
//! admission and eviction policy on top and keeps a distance-ordered index
//! so farthest-first eviction never scans the backend.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use cairn_core::distance::{ContentId, Distance, NodeId, Radius};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend: {0}")]
    Backend(String),
    #[error("corrupt store key: {0}")]
    CorruptKey(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> StoreError {
        StoreError::Backend(e.to_string())
    }
}

/// A batched mutation.
pub enum BatchOp {
    Put(String, Vec<u8>),
    Delete(String),
}

/// Ordered key→value persistence, keyed by hex content id.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;
    /// Visit every entry in key order.
    fn for_each(&self, f: &mut dyn FnMut(&str, &[u8])) -> Result<(), StoreError>;
}

// ── Memory backend ────────────────────────────────────────────────────────────

/// In-memory backend used by tests and by nodes running without a
/// database path.
#[derive(Default)]
pub struct MemoryBackend {
    map: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.read().expect("store lock poisoned").get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.map
            .write()
            .expect("store lock poisoned")
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.map.write().expect("store lock poisoned").remove(key);
        Ok(())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut map = self.map.write().expect("store lock poisoned");
        for op in ops {
            match op {
                BatchOp::Put(k, v) => {
                    map.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }

    fn for_each(&self, f: &mut dyn FnMut(&str, &[u8])) -> Result<(), StoreError> {
        for (k, v) in self.map.read().expect("store lock poisoned").iter() {
            f(k, v);
        }
        Ok(())
    }
}

// ── Sqlite backend ────────────────────────────────────────────────────────────

/// Durable backend over a single-table sqlite database.
pub struct SqliteBackend {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<SqliteBackend, StoreError> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS content (
                key   TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )?;
        Ok(SqliteBackend {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<SqliteBackend, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS content (
                key   TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )?;
        Ok(SqliteBackend {
            conn: Mutex::new(conn),
        })
    }
}

impl StorageBackend for SqliteBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let mut stmt = conn.prepare_cached("SELECT value FROM content WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.prepare_cached("INSERT OR REPLACE INTO content (key, value) VALUES (?1, ?2)")?
            .execute(rusqlite::params![key, value])?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.prepare_cached("DELETE FROM content WHERE key = ?1")?
            .execute([key])?;
        Ok(())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().expect("sqlite lock poisoned");
        let tx = conn.transaction()?;
        for op in ops {
            match op {
                BatchOp::Put(k, v) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO content (key, value) VALUES (?1, ?2)",
                        rusqlite::params![k, v],
                    )?;
                }
                BatchOp::Delete(k) => {
                    tx.execute("DELETE FROM content WHERE key = ?1", [k])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn for_each(&self, f: &mut dyn FnMut(&str, &[u8])) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let mut stmt = conn.prepare_cached("SELECT key, value FROM content ORDER BY key")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let value: Vec<u8> = row.get(1)?;
            f(&key, &value);
        }
        Ok(())
    }
}

// ── Radius store ──────────────────────────────────────────────────────────────

/// How the store relates to a content id, for OFFER decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Already stored locally.
    Stored,
    /// Within radius and not yet stored.
    Wanted,
    /// Outside the responsibility radius.
    OutOfRange,
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// Stored; `evicted` items were dropped to stay under budget.
    Admitted { evicted: usize },
    /// Concurrent admits collapse to one write.
    AlreadyStored,
    /// Distance from the local id exceeds the radius.
    OutsideRadius,
}

struct StoredMeta {
    content_id: ContentId,
    size: u64,
}

/// Admission, lookup, and farthest-first eviction over a backend.
pub struct RadiusStore {
    local_id: NodeId,
    radius: Radius,
    /// Byte high-watermark; 0 disables eviction.
    max_bytes: u64,
    bytes_stored: u64,
    by_distance: BTreeMap<Distance, StoredMeta>,
    backend: Box<dyn StorageBackend>,
}

impl RadiusStore {
    /// Open over a backend, rebuilding the distance index from whatever
    /// the backend already holds.
    pub fn open(
        local_id: NodeId,
        radius: Radius,
        max_bytes: u64,
        backend: Box<dyn StorageBackend>,
    ) -> Result<RadiusStore, StoreError> {
        let mut by_distance = BTreeMap::new();
        let mut bytes_stored = 0u64;
        let mut corrupt: Option<String> = None;
        backend.for_each(&mut |key, value| {
            match parse_key(key) {
                Ok(content_id) => {
                    let distance = Distance::between(&local_id, &content_id);
                    bytes_stored += value.len() as u64;
                    by_distance.insert(
                        distance,
                        StoredMeta {
                            content_id,
                            size: value.len() as u64,
                        },
                    );
                }
                Err(_) => corrupt = Some(key.to_string()),
            }
        })?;
        if let Some(key) = corrupt {
            return Err(StoreError::CorruptKey(key));
        }
        Ok(RadiusStore {
            local_id,
            radius,
            max_bytes,
            bytes_stored,
            by_distance,
            backend,
        })
    }

    pub fn radius(&self) -> Radius {
        self.radius
    }

    /// Explicit reconfiguration is the only way the radius grows.
    pub fn set_radius(&mut self, radius: Radius) {
        self.radius = radius;
    }

    pub fn bytes_stored(&self) -> u64 {
        self.bytes_stored
    }

    pub fn len(&self) -> usize {
        self.by_distance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_distance.is_empty()
    }

    pub fn is_within_radius(&self, content_id: &ContentId) -> bool {
        Distance::between(&self.local_id, content_id) <= self.radius
    }

    pub fn contains(&self, content_id: &ContentId) -> bool {
        self.by_distance
            .contains_key(&Distance::between(&self.local_id, content_id))
    }

    pub fn interest(&self, content_id: &ContentId) -> Interest {
        if self.contains(content_id) {
            Interest::Stored
        } else if self.is_within_radius(content_id) {
            Interest::Wanted
        } else {
            Interest::OutOfRange
        }
    }

    pub fn get(&self, content_id: &ContentId) -> Result<Option<Vec<u8>>, StoreError> {
        self.backend.get(&store_key(content_id))
    }

    /// Store an already-verified item. Rejects anything outside the
    /// radius, collapses duplicate admits, and evicts down to the byte
    /// budget afterwards.
    pub fn insert(
        &mut self,
        content_id: ContentId,
        value: &[u8],
    ) -> Result<AdmitOutcome, StoreError> {
        let distance = Distance::between(&self.local_id, &content_id);
        if distance > self.radius {
            return Ok(AdmitOutcome::OutsideRadius);
        }
        if self.by_distance.contains_key(&distance) {
            return Ok(AdmitOutcome::AlreadyStored);
        }
        self.backend.put(&store_key(&content_id), value)?;
        self.bytes_stored += value.len() as u64;
        self.by_distance.insert(
            distance,
            StoredMeta {
                content_id,
                size: value.len() as u64,
            },
        );
        let evicted = self.evict_to_budget()?;
        Ok(AdmitOutcome::Admitted { evicted })
    }

    pub fn remove(&mut self, content_id: &ContentId) -> Result<bool, StoreError> {
        let distance = Distance::between(&self.local_id, content_id);
        match self.by_distance.remove(&distance) {
            Some(meta) => {
                self.backend.delete(&store_key(&meta.content_id))?;
                self.bytes_stored -= meta.size;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop farthest items until stored bytes fit the high-watermark,
    /// shrinking the radius to the farthest retained item. Returns how
    /// many items were evicted.
    fn evict_to_budget(&mut self) -> Result<usize, StoreError> {
        if self.max_bytes == 0 {
            return Ok(0);
        }
        let mut evicted = 0usize;
        let mut ops = Vec::new();
        while self.bytes_stored > self.max_bytes {
            let Some((distance, meta)) = self.by_distance.pop_last() else {
                break;
            };
            ops.push(BatchOp::Delete(store_key(&meta.content_id)));
            self.bytes_stored -= meta.size;
            evicted += 1;
            tracing::debug!(
                content_id = hex::encode(meta.content_id),
                %distance,
                "evicting content under storage pressure"
            );
        }
        if evicted > 0 {
            self.backend.batch(ops)?;
            // One-way shrink: eviction never widens responsibility.
            if let Some((farthest, _)) = self.by_distance.last_key_value() {
                if *farthest < self.radius {
                    self.radius = *farthest;
                }
            }
        }
        Ok(evicted)
    }
}

fn store_key(content_id: &ContentId) -> String {
    hex::encode(content_id)
}

fn parse_key(key: &str) -> Result<ContentId, StoreError> {
    let bytes = hex::decode(key).map_err(|_| StoreError::CorruptKey(key.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| StoreError::CorruptKey(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(tail: u8) -> ContentId {
        let mut out = [0u8; 32];
        out[0] = tail;
        out
    }

    fn open_store(radius: Radius, max_bytes: u64) -> RadiusStore {
        RadiusStore::open([0u8; 32], radius, max_bytes, Box::new(MemoryBackend::new())).unwrap()
    }

    #[test]
    fn admits_within_radius_only() {
        let mut radius_bytes = [0u8; 32];
        radius_bytes[0] = 0x10;
        let mut store = open_store(Distance(radius_bytes), 0);

        assert_eq!(
            store.insert(id(0x05), b"near").unwrap(),
            AdmitOutcome::Admitted { evicted: 0 }
        );
        assert_eq!(
            store.insert(id(0x50), b"far").unwrap(),
            AdmitOutcome::OutsideRadius
        );
        assert_eq!(store.get(&id(0x05)).unwrap().unwrap(), b"near");
        assert!(store.get(&id(0x50)).unwrap().is_none());
    }

    #[test]
    fn duplicate_admit_is_single_write() {
        let mut store = open_store(Distance::MAX, 0);
        assert_eq!(
            store.insert(id(1), b"value").unwrap(),
            AdmitOutcome::Admitted { evicted: 0 }
        );
        assert_eq!(
            store.insert(id(1), b"other").unwrap(),
            AdmitOutcome::AlreadyStored
        );
        // First write wins.
        assert_eq!(store.get(&id(1)).unwrap().unwrap(), b"value");
    }

    #[test]
    fn eviction_is_farthest_first_and_shrinks_radius() {
        let mut store = open_store(Distance::MAX, 100);
        // Three items of 40 bytes each; the third pushes past 100 bytes.
        store.insert(id(0x01), &[0xaa; 40]).unwrap();
        store.insert(id(0x40), &[0xbb; 40]).unwrap();
        let outcome = store.insert(id(0x80), &[0xcc; 40]).unwrap();
        assert_eq!(outcome, AdmitOutcome::Admitted { evicted: 1 });

        // The farthest item (0x80...) is gone.
        assert!(store.get(&id(0x80)).unwrap().is_none());
        assert!(store.get(&id(0x01)).unwrap().is_some());
        assert!(store.get(&id(0x40)).unwrap().is_some());
        assert_eq!(store.bytes_stored(), 80);

        // Radius shrank to the farthest retained distance.
        assert_eq!(store.radius(), Distance::between(&[0u8; 32], &id(0x40)));

        // And it does not grow back on its own.
        store.remove(&id(0x40)).unwrap();
        assert_eq!(store.radius(), Distance::between(&[0u8; 32], &id(0x40)));
    }

    #[test]
    fn interest_classification() {
        let mut radius_bytes = [0u8; 32];
        radius_bytes[0] = 0x10;
        let mut store = open_store(Distance(radius_bytes), 0);
        store.insert(id(0x02), b"here").unwrap();

        assert_eq!(store.interest(&id(0x02)), Interest::Stored);
        assert_eq!(store.interest(&id(0x03)), Interest::Wanted);
        assert_eq!(store.interest(&id(0x55)), Interest::OutOfRange);
    }

    #[test]
    fn index_rebuilds_from_backend() {
        let backend = MemoryBackend::new();
        backend.put(&hex::encode(id(0x07)), &[1u8; 10]).unwrap();
        backend.put(&hex::encode(id(0x09)), &[2u8; 20]).unwrap();
        let store =
            RadiusStore::open([0u8; 32], Distance::MAX, 0, Box::new(backend)).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.bytes_stored(), 30);
        assert!(store.contains(&id(0x07)));
    }

    #[test]
    fn corrupt_backend_key_is_an_error() {
        let backend = MemoryBackend::new();
        backend.put("not-hex", &[1u8]).unwrap();
        let result = RadiusStore::open([0u8; 32], Distance::MAX, 0, Box::new(backend));
        assert!(matches!(result, Err(StoreError::CorruptKey(_))));
    }

    #[test]
    fn sqlite_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.db");
        let backend = SqliteBackend::open(&path).unwrap();
        backend.put("aa", b"one").unwrap();
        backend.put("bb", b"two").unwrap();
        backend.delete("aa").unwrap();
        backend
            .batch(vec![
                BatchOp::Put("cc".into(), b"three".to_vec()),
                BatchOp::Delete("bb".into()),
            ])
            .unwrap();

        assert!(backend.get("aa").unwrap().is_none());
        assert!(backend.get("bb").unwrap().is_none());
        assert_eq!(backend.get("cc").unwrap().unwrap(), b"three");

        let mut seen = Vec::new();
        backend
            .for_each(&mut |k, _| seen.push(k.to_string()))
            .unwrap();
        assert_eq!(seen, vec!["cc".to_string()]);
    }

    #[test]
    fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.db");
        {
            let backend = SqliteBackend::open(&path).unwrap();
            let mut store =
                RadiusStore::open([0u8; 32], Distance::MAX, 0, Box::new(backend)).unwrap();
            store.insert(id(0x11), b"persisted").unwrap();
        }
        let backend = SqliteBackend::open(&path).unwrap();
        let store = RadiusStore::open([0u8; 32], Distance::MAX, 0, Box::new(backend)).unwrap();
        assert_eq!(store.get(&id(0x11)).unwrap().unwrap(), b"persisted");
    }
}
