//! The `MetaStore` capability (spec §6.2, §3.6) and its two
//! implementations: a `rocksdb`-backed store for production use, and an
//! in-memory fake for tests.
//!
//! Column families, grounded in the original's `db/meta_db.cpp`
//! (`default`/`keys`/`source`), renamed to the roles this spec assigns
//! them: `meta` (per-api_path `api_meta_map`), `keys` (provider object
//! key index), `upload` (pending uploads), `upload_active` (in-flight
//! uploads), `resume` (incomplete-download journal, spec §3.6).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::bitset::Bitset;
use crate::error::{ApiResult, ErrorKind, RepertoryError};

pub const CF_META: &str = "meta";
pub const CF_KEYS: &str = "keys";
pub const CF_UPLOAD: &str = "upload";
pub const CF_UPLOAD_ACTIVE: &str = "upload_active";
pub const CF_RESUME: &str = "resume";

pub const ALL_COLUMN_FAMILIES: [&str; 5] = [CF_META, CF_KEYS, CF_UPLOAD, CF_UPLOAD_ACTIVE, CF_RESUME];

/// One entry in the pending or in-flight upload queue, keyed by
/// `(enqueue_time_ns, api_path)` per spec §3.6.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct UploadEntry {
    pub enqueue_time_ns: u64,
    pub api_path: String,
    pub source_path: String,
}

/// A resume-journal entry for a file that closed while incompletely
/// downloaded and dirty (spec §3.6, §4.3.7).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumeEntry {
    pub chunk_size: u64,
    pub source_path: String,
    pub read_state: Bitset,
}

/// Persistent map from `api_path` to `api_meta_map`, plus the upload
/// queue/active/resume column families (spec §6.2).
///
/// Single-writer per key; whole-value replacement is atomic. The engine
/// treats this purely as a capability: no concrete backend is named in
/// `repertory-engine`.
pub trait MetaStore: Send + Sync {
    fn get_meta(&self, api_path: &str) -> ApiResult<HashMap<String, String>>;

    fn get_meta_value(&self, api_path: &str, key: &str) -> ApiResult<Option<String>>;

    fn set_meta(&self, api_path: &str, values: HashMap<String, String>) -> ApiResult<()>;

    fn remove_meta(&self, api_path: &str) -> ApiResult<()>;

    /// Every known api_path, for the eviction sweep and deleted-file
    /// reaper (spec §4.6.5, §4.7).
    fn list_paths(&self) -> ApiResult<Vec<String>>;

    fn queue_upload(&self, entry: UploadEntry) -> ApiResult<()>;

    /// Remove every `upload`/`upload_active` entry for `api_path`
    /// (spec §4.6.3: `queue_upload` removes prior entries first).
    fn remove_upload(&self, api_path: &str) -> ApiResult<()>;

    /// Earliest pending entry, if any, without removing it.
    fn peek_upload(&self) -> ApiResult<Option<UploadEntry>>;

    /// Move an entry from `upload` to `upload_active`.
    fn activate_upload(&self, entry: &UploadEntry) -> ApiResult<()>;

    /// Remove an entry from `upload_active` (successful completion).
    fn complete_upload(&self, entry: &UploadEntry) -> ApiResult<()>;

    /// Every currently in-flight upload, used by `start()` to requeue
    /// (spec §4.6.3: "move any upload_active entries back to upload").
    fn list_active_uploads(&self) -> ApiResult<Vec<UploadEntry>>;

    fn store_resume(&self, api_path: &str, entry: ResumeEntry) -> ApiResult<()>;

    fn remove_resume(&self, api_path: &str) -> ApiResult<()>;

    fn get_resume(&self, api_path: &str) -> ApiResult<Option<ResumeEntry>>;

    fn list_resume(&self) -> ApiResult<Vec<(String, ResumeEntry)>>;
}

/// In-process test fake. Not used in production; grounded in the
/// teacher's practice of colocating lightweight fakes with the trait
/// they implement for use by the engine's own test suite.
#[derive(Default)]
pub struct InMemoryMetaStore {
    inner: Mutex<InMemoryMetaStoreState>,
}

#[derive(Default)]
struct InMemoryMetaStoreState {
    meta: HashMap<String, HashMap<String, String>>,
    upload: Vec<UploadEntry>,
    upload_active: Vec<UploadEntry>,
    resume: HashMap<String, ResumeEntry>,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaStore for InMemoryMetaStore {
    fn get_meta(&self, api_path: &str) -> ApiResult<HashMap<String, String>> {
        Ok(self.inner.lock().unwrap().meta.get(api_path).cloned().unwrap_or_default())
    }

    fn get_meta_value(&self, api_path: &str, key: &str) -> ApiResult<Option<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .meta
            .get(api_path)
            .and_then(|m| m.get(key).cloned()))
    }

    fn set_meta(&self, api_path: &str, values: HashMap<String, String>) -> ApiResult<()> {
        let mut state = self.inner.lock().unwrap();
        let entry = state.meta.entry(api_path.to_string()).or_default();
        for (k, v) in values {
            entry.insert(k, v);
        }
        Ok(())
    }

    fn remove_meta(&self, api_path: &str) -> ApiResult<()> {
        self.inner.lock().unwrap().meta.remove(api_path);
        Ok(())
    }

    fn list_paths(&self) -> ApiResult<Vec<String>> {
        Ok(self.inner.lock().unwrap().meta.keys().cloned().collect())
    }

    fn queue_upload(&self, entry: UploadEntry) -> ApiResult<()> {
        let mut state = self.inner.lock().unwrap();
        state.upload.retain(|e| e.api_path != entry.api_path);
        state.upload_active.retain(|e| e.api_path != entry.api_path);
        state.resume.remove(&entry.api_path);
        state.upload.push(entry);
        Ok(())
    }

    fn remove_upload(&self, api_path: &str) -> ApiResult<()> {
        let mut state = self.inner.lock().unwrap();
        state.upload.retain(|e| e.api_path != api_path);
        state.upload_active.retain(|e| e.api_path != api_path);
        Ok(())
    }

    fn peek_upload(&self) -> ApiResult<Option<UploadEntry>> {
        let state = self.inner.lock().unwrap();
        Ok(state.upload.iter().min_by_key(|e| e.enqueue_time_ns).cloned())
    }

    fn activate_upload(&self, entry: &UploadEntry) -> ApiResult<()> {
        let mut state = self.inner.lock().unwrap();
        state.upload.retain(|e| e != entry);
        state.upload_active.push(entry.clone());
        Ok(())
    }

    fn complete_upload(&self, entry: &UploadEntry) -> ApiResult<()> {
        self.inner.lock().unwrap().upload_active.retain(|e| e != entry);
        Ok(())
    }

    fn list_active_uploads(&self) -> ApiResult<Vec<UploadEntry>> {
        Ok(self.inner.lock().unwrap().upload_active.clone())
    }

    fn store_resume(&self, api_path: &str, entry: ResumeEntry) -> ApiResult<()> {
        self.inner.lock().unwrap().resume.insert(api_path.to_string(), entry);
        Ok(())
    }

    fn remove_resume(&self, api_path: &str) -> ApiResult<()> {
        self.inner.lock().unwrap().resume.remove(api_path);
        Ok(())
    }

    fn get_resume(&self, api_path: &str) -> ApiResult<Option<ResumeEntry>> {
        Ok(self.inner.lock().unwrap().resume.get(api_path).cloned())
    }

    fn list_resume(&self) -> ApiResult<Vec<(String, ResumeEntry)>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .resume
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Production [`MetaStore`] backed by `rocksdb`, one column family per
/// role (spec §4.6.3, grounded in `examples/original_source/src/db/meta_db.cpp`).
pub struct RocksMetaStore {
    db: rocksdb::DB,
}

impl RocksMetaStore {
    pub fn open(path: &std::path::Path) -> ApiResult<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<rocksdb::ColumnFamilyDescriptor> = ALL_COLUMN_FAMILIES
            .iter()
            .map(|name| rocksdb::ColumnFamilyDescriptor::new(*name, rocksdb::Options::default()))
            .collect();

        let db = rocksdb::DB::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| RepertoryError::new(ErrorKind::Os, e.to_string()))?;

        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> ApiResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| RepertoryError::new(ErrorKind::Error, format!("missing column family {name}")))
    }

    fn get_bincode<T: serde::de::DeserializeOwned>(&self, cf: &str, key: &[u8]) -> ApiResult<Option<T>> {
        let cf_handle = self.cf(cf)?;
        let bytes = self
            .db
            .get_cf(cf_handle, key)
            .map_err(|e| RepertoryError::new(ErrorKind::Os, e.to_string()))?;
        match bytes {
            Some(b) => {
                let value = bincode::deserialize(&b)
                    .map_err(|e| RepertoryError::new(ErrorKind::Error, e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn put_bincode<T: serde::Serialize>(&self, cf: &str, key: &[u8], value: &T) -> ApiResult<()> {
        let cf_handle = self.cf(cf)?;
        let bytes = bincode::serialize(value).map_err(|e| RepertoryError::new(ErrorKind::Error, e.to_string()))?;
        self.db
            .put_cf(cf_handle, key, bytes)
            .map_err(|e| RepertoryError::new(ErrorKind::Os, e.to_string()))
    }

    fn delete(&self, cf: &str, key: &[u8]) -> ApiResult<()> {
        let cf_handle = self.cf(cf)?;
        self.db
            .delete_cf(cf_handle, key)
            .map_err(|e| RepertoryError::new(ErrorKind::Os, e.to_string()))
    }

    fn iter_cf(&self, cf: &str) -> ApiResult<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf_handle = self.cf(cf)?;
        Ok(self
            .db
            .iterator_cf(cf_handle, rocksdb::IteratorMode::Start)
            .filter_map(|r| r.ok())
            .collect())
    }

    fn upload_key(entry: &UploadEntry) -> Vec<u8> {
        let mut key = entry.enqueue_time_ns.to_be_bytes().to_vec();
        key.extend_from_slice(entry.api_path.as_bytes());
        key
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredResumeEntry {
    chunk_size: u64,
    source_path: String,
    read_state: Vec<u8>,
}

impl MetaStore for RocksMetaStore {
    fn get_meta(&self, api_path: &str) -> ApiResult<HashMap<String, String>> {
        Ok(self
            .get_bincode::<HashMap<String, String>>(CF_META, api_path.as_bytes())?
            .unwrap_or_default())
    }

    fn get_meta_value(&self, api_path: &str, key: &str) -> ApiResult<Option<String>> {
        Ok(self.get_meta(api_path)?.get(key).cloned())
    }

    fn set_meta(&self, api_path: &str, values: HashMap<String, String>) -> ApiResult<()> {
        let mut current = self.get_meta(api_path)?;
        current.extend(values);
        self.put_bincode(CF_META, api_path.as_bytes(), &current)
    }

    fn remove_meta(&self, api_path: &str) -> ApiResult<()> {
        self.delete(CF_META, api_path.as_bytes())
    }

    fn list_paths(&self) -> ApiResult<Vec<String>> {
        Ok(self
            .iter_cf(CF_META)?
            .into_iter()
            .filter_map(|(k, _)| String::from_utf8(k.to_vec()).ok())
            .collect())
    }

    fn queue_upload(&self, entry: UploadEntry) -> ApiResult<()> {
        self.remove_upload(&entry.api_path)?;
        self.remove_resume(&entry.api_path)?;
        self.put_bincode(CF_UPLOAD, &Self::upload_key(&entry), &entry.source_path)
    }

    fn remove_upload(&self, api_path: &str) -> ApiResult<()> {
        for entry in self.list_pending_or_active(CF_UPLOAD)? {
            if entry.api_path == api_path {
                self.delete(CF_UPLOAD, &Self::upload_key(&entry))?;
            }
        }
        for entry in self.list_pending_or_active(CF_UPLOAD_ACTIVE)? {
            if entry.api_path == api_path {
                self.delete(CF_UPLOAD_ACTIVE, &Self::upload_key(&entry))?;
            }
        }
        Ok(())
    }

    fn peek_upload(&self) -> ApiResult<Option<UploadEntry>> {
        Ok(self
            .list_pending_or_active(CF_UPLOAD)?
            .into_iter()
            .min_by_key(|e| e.enqueue_time_ns))
    }

    fn activate_upload(&self, entry: &UploadEntry) -> ApiResult<()> {
        self.delete(CF_UPLOAD, &Self::upload_key(entry))?;
        self.put_bincode(CF_UPLOAD_ACTIVE, &Self::upload_key(entry), &entry.source_path)
    }

    fn complete_upload(&self, entry: &UploadEntry) -> ApiResult<()> {
        self.delete(CF_UPLOAD_ACTIVE, &Self::upload_key(entry))
    }

    fn list_active_uploads(&self) -> ApiResult<Vec<UploadEntry>> {
        self.list_pending_or_active(CF_UPLOAD_ACTIVE)
    }

    fn store_resume(&self, api_path: &str, entry: ResumeEntry) -> ApiResult<()> {
        let stored = StoredResumeEntry {
            chunk_size: entry.chunk_size,
            source_path: entry.source_path,
            read_state: entry.read_state.to_bytes(),
        };
        self.put_bincode(CF_RESUME, api_path.as_bytes(), &stored)
    }

    fn remove_resume(&self, api_path: &str) -> ApiResult<()> {
        self.delete(CF_RESUME, api_path.as_bytes())
    }

    fn get_resume(&self, api_path: &str) -> ApiResult<Option<ResumeEntry>> {
        let stored: Option<StoredResumeEntry> = self.get_bincode(CF_RESUME, api_path.as_bytes())?;
        stored
            .map(|s| {
                Ok(ResumeEntry {
                    chunk_size: s.chunk_size,
                    source_path: s.source_path,
                    read_state: Bitset::from_bytes(&s.read_state)
                        .map_err(|e| RepertoryError::new(ErrorKind::Error, e.to_string()))?,
                })
            })
            .transpose()
    }

    fn list_resume(&self) -> ApiResult<Vec<(String, ResumeEntry)>> {
        let mut out = Vec::new();
        for (key, _) in self.iter_cf(CF_RESUME)? {
            if let Ok(api_path) = String::from_utf8(key.to_vec()) {
                if let Some(entry) = self.get_resume(&api_path)? {
                    out.push((api_path, entry));
                }
            }
        }
        Ok(out)
    }
}

impl RocksMetaStore {
    fn list_pending_or_active(&self, cf: &str) -> ApiResult<Vec<UploadEntry>> {
        let mut out = Vec::new();
        for (key, value) in self.iter_cf(cf)? {
            if key.len() < 8 {
                continue;
            }
            let mut time_bytes = [0u8; 8];
            time_bytes.copy_from_slice(&key[..8]);
            let enqueue_time_ns = u64::from_be_bytes(time_bytes);
            let api_path = String::from_utf8_lossy(&key[8..]).to_string();
            let source_path: String = bincode::deserialize(&value)
                .map_err(|e| RepertoryError::new(ErrorKind::Error, e.to_string()))?;
            out.push(UploadEntry {
                enqueue_time_ns,
                api_path,
                source_path,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_upload_dedupes_prior_entries() {
        let store = InMemoryMetaStore::new();
        store
            .queue_upload(UploadEntry {
                enqueue_time_ns: 1,
                api_path: "/a".to_string(),
                source_path: "/cache/1".to_string(),
            })
            .unwrap();
        store
            .queue_upload(UploadEntry {
                enqueue_time_ns: 2,
                api_path: "/a".to_string(),
                source_path: "/cache/2".to_string(),
            })
            .unwrap();

        let peek = store.peek_upload().unwrap().unwrap();
        assert_eq!(peek.enqueue_time_ns, 2);
        assert_eq!(peek.source_path, "/cache/2");
    }

    #[test]
    fn activate_then_complete_clears_active() {
        let store = InMemoryMetaStore::new();
        let entry = UploadEntry {
            enqueue_time_ns: 1,
            api_path: "/a".to_string(),
            source_path: "/cache/1".to_string(),
        };
        store.queue_upload(entry.clone()).unwrap();
        store.activate_upload(&entry).unwrap();
        assert!(store.peek_upload().unwrap().is_none());
        assert_eq!(store.list_active_uploads().unwrap().len(), 1);

        store.complete_upload(&entry).unwrap();
        assert!(store.list_active_uploads().unwrap().is_empty());
    }

    #[test]
    fn resume_round_trips() {
        let store = InMemoryMetaStore::new();
        let mut bits = Bitset::zeros(4);
        bits.set(0, true);
        store
            .store_resume(
                "/a",
                ResumeEntry {
                    chunk_size: 1024,
                    source_path: "/cache/1".to_string(),
                    read_state: bits.clone(),
                },
            )
            .unwrap();

        let restored = store.get_resume("/a").unwrap().unwrap();
        assert_eq!(restored.chunk_size, 1024);
        assert_eq!(restored.read_state, bits);
    }

    #[test]
    fn queue_upload_clears_resume_entry() {
        let store = InMemoryMetaStore::new();
        store
            .store_resume(
                "/a",
                ResumeEntry {
                    chunk_size: 1024,
                    source_path: "/cache/1".to_string(),
                    read_state: Bitset::zeros(4),
                },
            )
            .unwrap();
        store
            .queue_upload(UploadEntry {
                enqueue_time_ns: 1,
                api_path: "/a".to_string(),
                source_path: "/cache/1".to_string(),
            })
            .unwrap();
        assert!(store.get_resume("/a").unwrap().is_none());
    }
}
