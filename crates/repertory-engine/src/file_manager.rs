//! Owns the registry of open files, the upload queue worker, and the
//! create/remove/rename surface (spec §4.6). The largest component after
//! `open_file`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use repertory_core::config::EngineConfig;
use repertory_core::error::{ApiResult, ErrorKind, RepertoryError};
use repertory_core::events::{Event, EventBus};
use repertory_core::meta::meta_key;
use repertory_core::meta_store::{MetaStore, UploadEntry};
use repertory_core::provider::Provider;
use repertory_core::path;

use crate::cache_size_mgr::CacheSizeMgr;
use crate::open_file::{HandleId, OpenFile, OpenFileData};
use crate::upload::UploadTask;

const UPLOAD_RETRY_DELAY: Duration = Duration::from_secs(5);
const UPLOAD_IDLE_TICK: Duration = Duration::from_millis(200);

struct Registry {
    by_path: HashMap<String, Arc<OpenFile>>,
    handle_to_path: HashMap<HandleId, String>,
}

struct UploadState {
    stopping: bool,
    in_flight: usize,
}

/// Owns every open `open_file`, the persisted upload queue, and the
/// create/remove/rename surface consumed by a host adapter (spec §4.6,
/// §6.3).
pub struct FileManager {
    config: EngineConfig,
    cache_dir: PathBuf,
    provider: Arc<dyn Provider>,
    meta_store: Arc<dyn MetaStore>,
    event_bus: Arc<EventBus>,
    cache_size_mgr: Arc<CacheSizeMgr>,
    registry: Mutex<Registry>,
    next_handle: AtomicU64,
    upload_state: Mutex<UploadState>,
    upload_handle: Mutex<Option<JoinHandle<()>>>,
}

impl FileManager {
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn Provider>,
        meta_store: Arc<dyn MetaStore>,
        event_bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let cache_dir = config.cache_dir();
        let cache_size_mgr = Arc::new(CacheSizeMgr::new(config.cache_max_bytes));
        Arc::new(Self {
            config,
            cache_dir,
            provider,
            meta_store,
            event_bus,
            cache_size_mgr,
            registry: Mutex::new(Registry {
                by_path: HashMap::new(),
                handle_to_path: HashMap::new(),
            }),
            next_handle: AtomicU64::new(1),
            upload_state: Mutex::new(UploadState {
                stopping: true,
                in_flight: 0,
            }),
            upload_handle: Mutex::new(None),
        })
    }

    pub fn cache_size_mgr(&self) -> &Arc<CacheSizeMgr> {
        &self.cache_size_mgr
    }

    // ---- §4.6.1 open/close lifecycle ----------------------------------

    pub fn open(
        &self,
        api_path: &str,
        directory: bool,
        open_data: OpenFileData,
    ) -> ApiResult<(HandleId, Arc<OpenFile>)> {
        let api_path = path::canonicalize(api_path)?;

        let mut registry = self.registry.lock();
        let of = if let Some(existing) = registry.by_path.get(&api_path) {
            existing.clone()
        } else {
            drop(registry);
            let of = Arc::new(self.construct_open_file(&api_path, directory)?);
            registry = self.registry.lock();
            registry.by_path.entry(api_path.clone()).or_insert(of.clone()).clone()
        };

        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        of.add_handle(handle, open_data);
        registry.handle_to_path.insert(handle, api_path.clone());
        drop(registry);

        self.event_bus.publish(Event::FilesystemItemAdded {
            seq: self.event_bus.next_seq(),
            api_path,
        });

        Ok((handle, of))
    }

    fn construct_open_file(&self, api_path: &str, directory: bool) -> ApiResult<OpenFile> {
        let mut fsi = self.provider.get_filesystem_item(api_path, directory)?;

        let mut meta = HashMap::new();
        meta.insert(meta_key::DIRECTORY.to_string(), fsi.directory.to_string());

        if !fsi.directory && fsi.source_path.is_empty() {
            let source_path = self.cache_dir.join(uuid::Uuid::new_v4().to_string());
            fsi.source_path = source_path.to_string_lossy().into_owned();
            meta.insert(meta_key::SOURCE.to_string(), fsi.source_path.clone());
        }
        self.meta_store.set_meta(api_path, meta)?;

        let resume = if fsi.directory {
            None
        } else {
            self.meta_store.get_resume(api_path)?.filter(|r| r.source_path == fsi.source_path)
        };

        OpenFile::new(
            self.config.chunk_size as usize,
            self.config.chunk_timeout_secs,
            fsi,
            self.provider.clone(),
            self.meta_store.clone(),
            self.event_bus.clone(),
            self.cache_size_mgr.clone(),
            resume.map(|r| r.read_state),
        )
    }

    pub fn get_open_file(&self, api_path: &str) -> Option<Arc<OpenFile>> {
        self.registry.lock().by_path.get(api_path).cloned()
    }

    pub fn close(self: &Arc<Self>, handle: HandleId) {
        let api_path = {
            let mut registry = self.registry.lock();
            registry.handle_to_path.remove(&handle)
        };
        let Some(api_path) = api_path else { return };

        let of = self.registry.lock().by_path.get(&api_path).cloned();
        let Some(of) = of else { return };
        of.remove_handle(handle);

        if of.can_close() {
            let mut registry = self.registry.lock();
            registry.by_path.remove(&api_path);
            drop(registry);
            of.close();
        }
    }

    /// Forcibly drops every handle for `api_path` and closes it.
    pub fn close_all(&self, api_path: &str) {
        let of = {
            let mut registry = self.registry.lock();
            let of = registry.by_path.remove(api_path);
            registry.handle_to_path.retain(|_, p| p != api_path);
            of
        };
        if let Some(of) = of {
            of.close();
        }
    }

    /// Registered with `polling` as `timed_out_close` (spec §4.3.8, §4.8).
    /// A file left registered with zero handles becomes eligible once it
    /// goes idle; `close(handle)` only finalizes eagerly when the last
    /// handle release already finds `can_close()` true.
    pub fn sweep_timed_out(&self) {
        let candidates: Vec<(String, Arc<OpenFile>)> = {
            let registry = self.registry.lock();
            registry
                .by_path
                .iter()
                .filter(|(_, of)| of.can_close())
                .map(|(path, of)| (path.clone(), of.clone()))
                .collect()
        };

        for (api_path, of) in candidates {
            {
                let mut registry = self.registry.lock();
                if !matches!(registry.by_path.get(&api_path), Some(cur) if Arc::ptr_eq(cur, &of)) {
                    continue;
                }
                registry.by_path.remove(&api_path);
            }
            of.close();
            self.event_bus.publish(Event::DownloadTimeout {
                seq: self.event_bus.next_seq(),
                api_path,
            });
        }
    }

    /// Reconciles `*used_space` for every currently-open dirty file (spec
    /// §6.3): a host adapter's own on-disk usage counter only sees bytes
    /// once an upload finalizes, so it under-reports while a write is still
    /// buffered locally. Adds each open file's logical size in, once per
    /// distinct dirty entry.
    pub fn update_used_space(&self, used_space: &mut u64) {
        let registry = self.registry.lock();
        for of in registry.by_path.values() {
            if of.is_modified() {
                *used_space += of.size();
            }
        }
    }

    pub fn is_processing(&self, api_path: &str) -> bool {
        if let Some(of) = self.registry.lock().by_path.get(api_path) {
            if of.handle_count() > 0 {
                return true;
            }
        }
        matches!(self.meta_store.peek_upload(), Ok(Some(e)) if e.api_path == api_path)
            || self
                .meta_store
                .list_active_uploads()
                .map(|v| v.iter().any(|e| e.api_path == api_path))
                .unwrap_or(false)
    }

    // ---- §4.6.2 create/remove/rename -----------------------------------

    pub fn create(
        &self,
        api_path: &str,
        directory: bool,
        meta: HashMap<String, String>,
        open_data: OpenFileData,
    ) -> ApiResult<(HandleId, Arc<OpenFile>)> {
        let api_path = path::canonicalize(api_path)?;

        if directory {
            self.provider.create_directory(&api_path, meta)?;
        } else {
            match self.provider.create_file(&api_path, meta) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::ItemExists => {}
                Err(e) => return Err(e),
            }
        }

        self.open(&api_path, directory, open_data)
    }

    pub fn remove_file(&self, api_path: &str) -> ApiResult<()> {
        let api_path = path::canonicalize(api_path)?;

        if let Some(of) = self.registry.lock().by_path.get(&api_path) {
            if of.is_modified() {
                return Err(RepertoryError::new(ErrorKind::FileInUse, "file has unsaved writes"));
            }
        }

        let fsi = self.provider.get_filesystem_item(&api_path, false)?;
        match self.provider.remove_file(&api_path) {
            Ok(()) => {}
            Err(e) => {
                self.event_bus.publish(Event::FileRemoveFailed {
                    seq: self.event_bus.next_seq(),
                    api_path: api_path.clone(),
                    error: e.clone(),
                });
                return Err(e);
            }
        }
        self.meta_store.remove_upload(&api_path)?;
        self.close_all(&api_path);
        let _ = std::fs::remove_file(&fsi.source_path);
        self.meta_store.remove_meta(&api_path)?;

        self.event_bus.publish(Event::FileRemoved {
            seq: self.event_bus.next_seq(),
            api_path,
        });
        Ok(())
    }

    pub fn rename_file(&self, from: &str, to: &str, overwrite: bool) -> ApiResult<()> {
        if !self.provider.is_rename_supported() {
            return Err(RepertoryError::new(ErrorKind::NotImplemented, "provider does not support rename"));
        }
        let from = path::canonicalize(from)?;
        let to = path::canonicalize(to)?;
        if from == to {
            return Err(RepertoryError::new(ErrorKind::ItemExists, "rename to the same path"));
        }
        if !self.provider.is_file(&from)? {
            return Err(RepertoryError::new(ErrorKind::ItemNotFound, from.as_str()));
        }

        if self.provider.is_file(&to)? {
            if let Some(of) = self.registry.lock().by_path.get(&to) {
                if of.is_modified() {
                    return Err(RepertoryError::new(ErrorKind::FileInUse, to.as_str()));
                }
            }
            if !overwrite {
                return Err(RepertoryError::new(ErrorKind::ItemExists, to.as_str()));
            }
            self.remove_file(&to)?;
        }

        let parent = path::parent(&to);
        if !path::is_root(&parent) && !self.provider.is_directory(&parent)? {
            return Err(RepertoryError::new(ErrorKind::DirectoryNotFound, parent.as_str()));
        }

        self.provider.rename_file(&from, &to)?;

        let mut registry = self.registry.lock();
        if let Some(of) = registry.by_path.remove(&from) {
            of.rename(to.clone(), path::parent(&to));
            registry.by_path.insert(to.clone(), of);
            for path in registry.handle_to_path.values_mut() {
                if *path == from {
                    *path = to.clone();
                }
            }
        }
        Ok(())
    }

    pub fn rename_directory(&self, from: &str, to: &str) -> ApiResult<()> {
        let from = path::canonicalize(from)?;
        let to = path::canonicalize(to)?;

        if !self.provider.is_directory(&from)? {
            return Err(RepertoryError::new(ErrorKind::DirectoryNotFound, from.as_str()));
        }
        if self.provider.is_directory(&to)? || self.provider.is_file(&to)? {
            return Err(RepertoryError::new(ErrorKind::DirectoryExists, to.as_str()));
        }

        self.provider.create_directory_clone_source_meta(&from, &to)?;

        for item in self.provider.get_directory_items(&from)? {
            let child_to = path::reparent(&item.api_path, &from, &to);
            if item.directory {
                self.rename_directory(&item.api_path, &child_to)?;
            } else {
                self.rename_file(&item.api_path, &child_to, false)?;
            }
        }

        self.provider.remove_directory(&from)?;

        let mut registry = self.registry.lock();
        let retarget: Vec<String> = registry
            .by_path
            .keys()
            .filter(|p| path::is_under(p, &from))
            .cloned()
            .collect();
        for old_path in retarget {
            if let Some(of) = registry.by_path.remove(&old_path) {
                let new_path = path::reparent(&old_path, &from, &to);
                of.rename(new_path.clone(), path::parent(&new_path));
                registry.by_path.insert(new_path, of);
            }
        }
        Ok(())
    }

    // ---- §4.6.3 upload queue --------------------------------------------

    pub fn queue_upload(&self, entry: UploadEntry) -> ApiResult<()> {
        self.meta_store.queue_upload(entry.clone())?;
        self.event_bus.publish(Event::FileUploadQueued {
            seq: self.event_bus.next_seq(),
            api_path: entry.api_path,
            source_path: entry.source_path,
        });
        Ok(())
    }

    fn upload_worker_loop(self: Arc<Self>) {
        loop {
            if self.upload_state.lock().stopping {
                return;
            }

            let at_capacity = self.upload_state.lock().in_flight >= self.config.max_upload_count.max(1);
            if at_capacity {
                std::thread::sleep(UPLOAD_IDLE_TICK);
                continue;
            }

            let entry = match self.meta_store.peek_upload() {
                Ok(Some(e)) => e,
                Ok(None) => {
                    std::thread::sleep(UPLOAD_IDLE_TICK);
                    continue;
                }
                Err(_) => {
                    std::thread::sleep(UPLOAD_IDLE_TICK);
                    continue;
                }
            };

            if self.meta_store.activate_upload(&entry).is_err() {
                continue;
            }
            self.upload_state.lock().in_flight += 1;

            let this = self.clone();
            std::thread::spawn(move || {
                this.run_one_upload(entry);
                this.upload_state.lock().in_flight -= 1;
            });
        }
    }

    fn run_one_upload(&self, entry: UploadEntry) {
        let task = UploadTask::new(entry.api_path.clone(), entry.source_path.clone());
        let error = task.run(self.provider.as_ref(), &self.event_bus);

        match error.kind() {
            ErrorKind::Success => {
                let _ = self.meta_store.complete_upload(&entry);
            }
            ErrorKind::UploadStopped => {
                let _ = self.meta_store.complete_upload(&entry);
                let _ = self.meta_store.queue_upload(entry.clone());
                self.event_bus.publish(Event::FileUploadRetry {
                    seq: self.event_bus.next_seq(),
                    api_path: entry.api_path,
                    error,
                });
                std::thread::sleep(UPLOAD_RETRY_DELAY);
            }
            _ => {
                let path_missing = !self.provider.is_file(&entry.api_path).unwrap_or(true);
                let source_missing = !std::path::Path::new(&entry.source_path).exists();
                let _ = self.meta_store.complete_upload(&entry);

                if path_missing || source_missing {
                    self.event_bus.publish(Event::FileUploadNotFound {
                        seq: self.event_bus.next_seq(),
                        api_path: entry.api_path,
                        source_path: entry.source_path,
                    });
                } else {
                    let _ = self.meta_store.queue_upload(entry.clone());
                    self.event_bus.publish(Event::FileUploadRetry {
                        seq: self.event_bus.next_seq(),
                        api_path: entry.api_path,
                        error,
                    });
                    std::thread::sleep(UPLOAD_RETRY_DELAY);
                }
            }
        }
    }

    // ---- §4.6.4 eviction hook -------------------------------------------

    pub fn evict_file(&self, api_path: &str) -> bool {
        if self.is_processing(api_path) {
            return false;
        }
        if matches!(self.meta_store.get_meta_value(api_path, meta_key::PINNED), Ok(Some(v)) if v == "true") {
            return false;
        }
        if self.registry.lock().by_path.contains_key(api_path) {
            return false;
        }

        let fsi = match self.provider.get_filesystem_item(api_path, false) {
            Ok(f) => f,
            Err(_) => return false,
        };
        if fsi.source_path.is_empty() || std::fs::remove_file(&fsi.source_path).is_err() {
            return false;
        }

        self.cache_size_mgr.shrink(fsi.size);
        self.event_bus.publish(Event::FilesystemItemEvicted {
            seq: self.event_bus.next_seq(),
            api_path: api_path.to_string(),
        });
        true
    }

    // ---- §4.6.5 deleted-file reaper --------------------------------------

    fn collect_provider_paths(&self, dir: &str, files: &mut HashSet<String>, dirs: &mut HashSet<String>) {
        let Ok(items) = self.provider.get_directory_items(dir) else {
            return;
        };
        for item in items {
            if item.directory {
                dirs.insert(item.api_path.clone());
                self.collect_provider_paths(&item.api_path, files, dirs);
            } else {
                files.insert(item.api_path.clone());
            }
        }
    }

    /// Registered with `polling` at `low` frequency as `check_deleted`
    /// (spec §4.6.5, §4.8).
    pub fn reap_deleted(&self) {
        let mut live_files = HashSet::new();
        let mut live_dirs = HashSet::new();
        self.collect_provider_paths(path::ROOT, &mut live_files, &mut live_dirs);

        let known = match self.meta_store.list_paths() {
            Ok(p) => p,
            Err(_) => return,
        };

        let mut missing_files = Vec::new();
        let mut missing_dirs = Vec::new();
        for api_path in known {
            if path::is_root(&api_path) {
                continue;
            }
            let is_known_dir = self
                .meta_store
                .get_meta_value(&api_path, meta_key::DIRECTORY)
                .unwrap_or(None)
                .map(|v| v == "true")
                .unwrap_or(false);

            if is_known_dir {
                if !live_dirs.contains(&api_path) {
                    missing_dirs.push(api_path);
                }
            } else if !live_files.contains(&api_path) {
                missing_files.push(api_path);
            }
        }

        for api_path in missing_files {
            self.reap_missing_file(&api_path);
        }
        for api_path in missing_dirs {
            let _ = self.meta_store.remove_meta(&api_path);
            self.event_bus.publish(Event::DirectoryRemovedExternally {
                seq: self.event_bus.next_seq(),
                api_path,
            });
        }
    }

    fn reap_missing_file(&self, api_path: &str) {
        let source_path = self
            .meta_store
            .get_meta_value(api_path, meta_key::SOURCE)
            .unwrap_or(None)
            .unwrap_or_default();

        if !source_path.is_empty() && std::path::Path::new(&source_path).exists() {
            self.event_bus.publish(Event::OrphanedFileDetected {
                seq: self.event_bus.next_seq(),
                api_path: api_path.to_string(),
                source_path: source_path.clone(),
            });

            let orphaned_dir = self.cache_dir.parent().unwrap_or(&self.cache_dir).join("orphaned");
            let name = path::name(api_path);
            let dest = orphaned_dir.join(format!("{}_{}", uuid::Uuid::new_v4(), name));

            let moved = std::fs::create_dir_all(&orphaned_dir).and_then(|()| std::fs::rename(&source_path, &dest));
            match moved {
                Ok(()) => {
                    self.event_bus.publish(Event::OrphanedFileProcessed {
                        seq: self.event_bus.next_seq(),
                        api_path: api_path.to_string(),
                        source_path: dest.to_string_lossy().into_owned(),
                    });
                }
                Err(e) => {
                    self.event_bus.publish(Event::OrphanedFileProcessingFailed {
                        seq: self.event_bus.next_seq(),
                        api_path: api_path.to_string(),
                        source_path,
                        error: RepertoryError::from(e),
                    });
                }
            }
        }

        self.close_all(api_path);
        let _ = self.meta_store.remove_upload(api_path);
        let _ = self.meta_store.remove_meta(api_path);

        self.event_bus.publish(Event::FileRemovedExternally {
            seq: self.event_bus.next_seq(),
            api_path: api_path.to_string(),
        });
    }

    // ---- lifecycle --------------------------------------------------------

    /// Reconciles persisted state and starts the upload worker (spec
    /// §4.6.3 "on start()").
    pub fn start(self: &Arc<Self>) -> ApiResult<()> {
        for entry in self.meta_store.list_active_uploads()? {
            self.meta_store.complete_upload(&entry)?;
            self.meta_store.queue_upload(entry)?;
        }

        for (api_path, resume) in self.meta_store.list_resume()? {
            if resume.source_path.is_empty() || !std::path::Path::new(&resume.source_path).exists() {
                continue;
            }
            let Ok(fsi) = self.provider.get_filesystem_item(&api_path, false) else {
                continue;
            };
            let Ok(on_disk) = std::fs::metadata(&resume.source_path) else {
                continue;
            };
            if on_disk.len() != fsi.size {
                continue;
            }

            match OpenFile::new(
                self.config.chunk_size as usize,
                self.config.chunk_timeout_secs,
                fsi,
                self.provider.clone(),
                self.meta_store.clone(),
                self.event_bus.clone(),
                self.cache_size_mgr.clone(),
                Some(resume.read_state),
            ) {
                Ok(of) => {
                    self.event_bus.publish(Event::DownloadRestored {
                        seq: self.event_bus.next_seq(),
                        api_path: api_path.clone(),
                        source_path: resume.source_path,
                    });
                    self.registry.lock().by_path.insert(api_path, Arc::new(of));
                }
                Err(e) => {
                    self.event_bus.publish(Event::DownloadRestoreFailed {
                        seq: self.event_bus.next_seq(),
                        api_path,
                        error: e,
                    });
                }
            }
        }

        self.upload_state.lock().stopping = false;
        let this = self.clone();
        *self.upload_handle.lock() = Some(std::thread::spawn(move || this.upload_worker_loop()));

        self.event_bus.publish(Event::ServiceStarted { seq: self.event_bus.next_seq() });
        info!("file_manager started");
        Ok(())
    }

    pub fn stop(&self) {
        self.event_bus.publish(Event::ServiceShutdownBegin { seq: self.event_bus.next_seq() });
        self.upload_state.lock().stopping = true;
        if let Some(handle) = self.upload_handle.lock().take() {
            let _ = handle.join();
        }

        let entries: Vec<Arc<OpenFile>> = self.registry.lock().by_path.drain().map(|(_, v)| v).collect();
        for of in entries {
            of.close();
        }

        self.cache_size_mgr.shutdown();
        self.event_bus.publish(Event::ServiceShutdownEnd { seq: self.event_bus.next_seq() });
        debug!("file_manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProvider;
    use repertory_core::meta_store::InMemoryMetaStore;

    fn manager() -> (Arc<FileManager>, Arc<FakeProvider>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeProvider::new());
        let meta_store = Arc::new(InMemoryMetaStore::new());
        let event_bus = Arc::new(EventBus::new());
        let mut config = EngineConfig::default();
        config.chunk_size = 1024;
        config.chunk_timeout_secs = 0;
        config.cache_dir = Some(dir.path().to_path_buf());

        let fm = FileManager::new(config, provider.clone(), meta_store, event_bus);
        (fm, provider, dir)
    }

    #[test]
    fn open_allocates_source_path_and_persists_meta() {
        let (fm, provider, _dir) = manager();
        provider.seed_file("/a", vec![1, 2, 3]);

        let (handle, of) = fm.open("/a", false, OpenFileData::default()).unwrap();
        assert!(handle > 0);
        assert!(!of.source_path().is_empty());
        assert_eq!(of.handle_count(), 1);
    }

    #[test]
    fn second_open_attaches_new_handle_to_same_entry() {
        let (fm, provider, _dir) = manager();
        provider.seed_file("/a", vec![1, 2, 3]);

        let (h1, of1) = fm.open("/a", false, OpenFileData::default()).unwrap();
        let (h2, of2) = fm.open("/a", false, OpenFileData::default()).unwrap();
        assert_ne!(h1, h2);
        assert!(Arc::ptr_eq(&of1, &of2));
        assert_eq!(of1.handle_count(), 2);
    }

    #[test]
    fn close_removes_registry_entry_once_idle() {
        let (fm, provider, _dir) = manager();
        provider.seed_file("/a", vec![1, 2, 3]);

        let (handle, _of) = fm.open("/a", false, OpenFileData::default()).unwrap();
        fm.close(handle);
        assert!(fm.get_open_file("/a").is_none());
    }

    #[test]
    fn remove_file_refuses_when_dirty_handle_open() {
        let (fm, provider, _dir) = manager();
        provider.seed_file("/a", vec![0u8; 10]);

        let (_handle, of) = fm.open("/a", false, OpenFileData { write: true }).unwrap();
        of.write(0, b"hi").unwrap();

        let err = fm.remove_file("/a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileInUse);
    }

    #[test]
    fn rename_file_with_overwrite_migrates_registry_key() {
        let (fm, provider, _dir) = manager();
        provider.seed_file("/a", vec![0u8; 10]);
        provider.seed_file("/b", vec![1u8; 10]);

        let (_handle, _of) = fm.open("/a", false, OpenFileData::default()).unwrap();
        fm.rename_file("/a", "/b", true).unwrap();

        assert!(fm.get_open_file("/b").is_some());
        assert!(fm.get_open_file("/a").is_none());
        assert!(!provider.contains("/a"));
    }

    #[test]
    fn rename_file_onto_dirty_destination_is_file_in_use() {
        let (fm, provider, _dir) = manager();
        provider.seed_file("/a", vec![0u8; 10]);
        provider.seed_file("/b", vec![1u8; 10]);

        let (_h, of_b) = fm.open("/b", false, OpenFileData { write: true }).unwrap();
        of_b.write(0, b"dirty").unwrap();

        let err = fm.rename_file("/a", "/b", true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileInUse);
    }

    #[test]
    fn evict_file_removes_cache_body_and_shrinks_budget() {
        let (fm, provider, _dir) = manager();
        provider.seed_file("/a", vec![0u8; 2048]);

        let (handle, of) = fm.open("/a", false, OpenFileData::default()).unwrap();
        let mut out = Vec::new();
        of.read(0, 2048, &mut out).unwrap();
        fm.close(handle);

        assert!(fm.evict_file("/a"));
    }

    #[test]
    fn reap_deleted_removes_meta_for_files_absent_from_provider() {
        let (fm, provider, _dir) = manager();
        provider.seed_file("/a", vec![0u8; 10]);
        let (handle, _of) = fm.open("/a", false, OpenFileData::default()).unwrap();
        fm.close(handle);

        provider.remove_file("/a").unwrap();
        fm.reap_deleted();

        assert!(fm.meta_store.get_meta("/a").unwrap().is_empty());
    }

    #[test]
    fn upload_retries_transient_failures_then_succeeds() {
        let (fm, provider, dir) = manager();
        provider.seed_file("/a", vec![0u8; 4]);
        provider.fail_next_uploads(2);

        let source_path = dir.path().join("src.bin");
        std::fs::write(&source_path, b"abcd").unwrap();

        let completed = Arc::new(std::sync::Mutex::new(None));
        let c2 = completed.clone();
        fm.event_bus.subscribe(Arc::new(move |e: &Event| {
            if let Event::FileUploadCompleted { error, .. } = e {
                *c2.lock().unwrap() = Some(error.is_success());
            }
        }));

        fm.start().unwrap();
        fm.queue_upload(UploadEntry {
            enqueue_time_ns: 0,
            api_path: "/a".to_string(),
            source_path: source_path.to_str().unwrap().to_string(),
        })
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(15);
        while completed.lock().unwrap().is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
        }
        fm.stop();

        assert_eq!(provider.upload_call_count(), 3);
        assert_eq!(*completed.lock().unwrap(), Some(true));
        assert!(fm.meta_store.peek_upload().unwrap().is_none());
    }

    #[test]
    fn update_used_space_adds_logical_size_of_open_dirty_files_only() {
        let (fm, provider, _dir) = manager();
        provider.seed_file("/a", vec![0u8; 10]);
        provider.seed_file("/b", vec![0u8; 10]);

        let (_h1, of_a) = fm.open("/a", false, OpenFileData { write: true }).unwrap();
        of_a.write(0, b"hello").unwrap();
        let (_h2, _of_b) = fm.open("/b", false, OpenFileData::default()).unwrap();

        let mut used_space = 100u64;
        fm.update_used_space(&mut used_space);
        assert_eq!(used_space, 100 + of_a.size());
    }

    #[test]
    fn sweep_timed_out_closes_idle_unmodified_entry_and_emits_timeout() {
        let (fm, provider, _dir) = manager();
        provider.seed_file("/a", vec![0u8; 10]);

        let (handle, of) = fm.open("/a", false, OpenFileData::default()).unwrap();
        let mut out = Vec::new();
        of.read(0, 10, &mut out).unwrap();
        of.remove_handle(handle);
        assert!(of.can_close());

        let timed_out = Arc::new(std::sync::Mutex::new(false));
        let t2 = timed_out.clone();
        fm.event_bus.subscribe(Arc::new(move |e: &Event| {
            if matches!(e, Event::DownloadTimeout { .. }) {
                *t2.lock().unwrap() = true;
            }
        }));

        fm.sweep_timed_out();

        assert!(fm.get_open_file("/a").is_none());
        assert!(*timed_out.lock().unwrap());
    }
}
