//! In-process fakes used by the engine's own test suite (spec §8).
//!
//! Not compiled into release builds of dependents; exists purely so
//! `open_file`/`file_manager`/`upload` tests can run against a
//! deterministic `Provider` without a network or an object store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use repertory_core::error::{ApiResult, ErrorKind, RepertoryError};
use repertory_core::meta::FilesystemItem;
use repertory_core::provider::{DirectoryItem, Provider};

#[derive(Default)]
struct FakeFile {
    data: Vec<u8>,
    directory: bool,
    meta: HashMap<String, String>,
}

/// An in-memory object store standing in for an S3/Sia backend.
pub struct FakeProvider {
    files: Mutex<HashMap<String, FakeFile>>,
    read_only: bool,
    rename_supported: bool,
    read_calls: AtomicUsize,
    upload_calls: AtomicUsize,
    fail_uploads_remaining: AtomicUsize,
    removed_paths: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            read_only: false,
            rename_supported: true,
            read_calls: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
            fail_uploads_remaining: AtomicUsize::new(0),
            removed_paths: Mutex::new(Vec::new()),
        }
    }

    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::new()
        }
    }

    pub fn seed_file(&self, api_path: &str, data: Vec<u8>) {
        self.files.lock().unwrap().insert(
            api_path.to_string(),
            FakeFile {
                data,
                directory: false,
                meta: HashMap::new(),
            },
        );
    }

    pub fn seed_directory(&self, api_path: &str) {
        self.files.lock().unwrap().insert(
            api_path.to_string(),
            FakeFile {
                data: Vec::new(),
                directory: true,
                meta: HashMap::new(),
            },
        );
    }

    pub fn read_call_count(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn upload_call_count(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    /// The next `n` calls to `upload_file` fail with `upload_failed`.
    pub fn fail_next_uploads(&self, n: usize) {
        self.fail_uploads_remaining.store(n, Ordering::SeqCst);
    }

    pub fn removed_paths(&self) -> Vec<String> {
        self.removed_paths.lock().unwrap().clone()
    }

    pub fn contains(&self, api_path: &str) -> bool {
        self.files.lock().unwrap().contains_key(api_path)
    }
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for FakeProvider {
    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn is_rename_supported(&self) -> bool {
        self.rename_supported
    }

    fn get_filesystem_item(&self, api_path: &str, directory: bool) -> ApiResult<FilesystemItem> {
        let files = self.files.lock().unwrap();
        match files.get(api_path) {
            Some(f) => Ok(FilesystemItem {
                api_path: api_path.to_string(),
                api_parent: repertory_core::path::parent(api_path),
                directory: f.directory,
                size: f.data.len() as u64,
                source_path: f.meta.get("source").cloned().unwrap_or_default(),
            }),
            None if directory => Ok(FilesystemItem::new_directory(
                api_path,
                repertory_core::path::parent(api_path),
            )),
            None => Err(RepertoryError::new(ErrorKind::ItemNotFound, api_path)),
        }
    }

    fn get_directory_items(&self, api_path: &str) -> ApiResult<Vec<DirectoryItem>> {
        let files = self.files.lock().unwrap();
        let mut items: Vec<DirectoryItem> = files
            .iter()
            .filter(|(path, _)| repertory_core::path::parent(path) == api_path)
            .map(|(path, f)| DirectoryItem {
                api_path: path.clone(),
                directory: f.directory,
                size: f.data.len() as u64,
            })
            .collect();
        items.sort_by(|a, b| b.directory.cmp(&a.directory).then(a.api_path.cmp(&b.api_path)));
        Ok(items)
    }

    fn get_item_meta(&self, api_path: &str) -> ApiResult<HashMap<String, String>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(api_path)
            .map(|f| f.meta.clone())
            .unwrap_or_default())
    }

    fn get_item_meta_key(&self, api_path: &str, key: &str) -> ApiResult<Option<String>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(api_path)
            .and_then(|f| f.meta.get(key).cloned()))
    }

    fn set_item_meta(&self, api_path: &str, values: HashMap<String, String>) -> ApiResult<()> {
        let mut files = self.files.lock().unwrap();
        let entry = files.entry(api_path.to_string()).or_default();
        entry.meta.extend(values);
        Ok(())
    }

    fn create_file(&self, api_path: &str, meta: HashMap<String, String>) -> ApiResult<()> {
        if self.read_only {
            return Err(RepertoryError::new(ErrorKind::PermissionDenied, "read-only provider"));
        }
        let mut files = self.files.lock().unwrap();
        if files.contains_key(api_path) {
            return Err(RepertoryError::new(ErrorKind::ItemExists, api_path));
        }
        files.insert(
            api_path.to_string(),
            FakeFile {
                data: Vec::new(),
                directory: false,
                meta,
            },
        );
        Ok(())
    }

    fn create_directory(&self, api_path: &str, meta: HashMap<String, String>) -> ApiResult<()> {
        let mut files = self.files.lock().unwrap();
        if files.contains_key(api_path) {
            return Err(RepertoryError::new(ErrorKind::DirectoryExists, api_path));
        }
        files.insert(
            api_path.to_string(),
            FakeFile {
                data: Vec::new(),
                directory: true,
                meta,
            },
        );
        Ok(())
    }

    fn create_directory_clone_source_meta(&self, from: &str, to: &str) -> ApiResult<()> {
        let meta = self.get_item_meta(from)?;
        self.create_directory(to, meta)
    }

    fn remove_file(&self, api_path: &str) -> ApiResult<()> {
        let mut files = self.files.lock().unwrap();
        if files.remove(api_path).is_none() {
            return Err(RepertoryError::new(ErrorKind::ItemNotFound, api_path));
        }
        self.removed_paths.lock().unwrap().push(api_path.to_string());
        Ok(())
    }

    fn remove_directory(&self, api_path: &str) -> ApiResult<()> {
        let mut files = self.files.lock().unwrap();
        let has_children = files.keys().any(|p| repertory_core::path::parent(p) == api_path);
        if has_children {
            return Err(RepertoryError::new(ErrorKind::DirectoryNotEmpty, api_path));
        }
        files.remove(api_path);
        Ok(())
    }

    fn rename_file(&self, from: &str, to: &str) -> ApiResult<()> {
        let mut files = self.files.lock().unwrap();
        let file = files
            .remove(from)
            .ok_or_else(|| RepertoryError::new(ErrorKind::ItemNotFound, from))?;
        files.insert(to.to_string(), file);
        Ok(())
    }

    fn is_file(&self, api_path: &str) -> ApiResult<bool> {
        Ok(self.files.lock().unwrap().get(api_path).map(|f| !f.directory).unwrap_or(false))
    }

    fn is_directory(&self, api_path: &str) -> ApiResult<bool> {
        Ok(self.files.lock().unwrap().get(api_path).map(|f| f.directory).unwrap_or(false))
    }

    fn is_file_writeable(&self, _api_path: &str) -> bool {
        !self.read_only
    }

    fn read_file_bytes(
        &self,
        api_path: &str,
        length: usize,
        offset: u64,
        out_buf: &mut [u8],
        stop_flag: &AtomicBool,
    ) -> ApiResult<()> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if stop_flag.load(Ordering::SeqCst) {
            return Err(RepertoryError::new(ErrorKind::DownloadStopped, "stop flag set"));
        }
        let files = self.files.lock().unwrap();
        let file = files
            .get(api_path)
            .ok_or_else(|| RepertoryError::new(ErrorKind::ItemNotFound, api_path))?;
        let offset = offset as usize;
        let end = (offset + length).min(file.data.len());
        if offset >= file.data.len() {
            return Ok(());
        }
        let n = end - offset;
        out_buf[..n].copy_from_slice(&file.data[offset..end]);
        Ok(())
    }

    fn upload_file(&self, api_path: &str, source_path: &str, stop_flag: &AtomicBool) -> ApiResult<()> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if stop_flag.load(Ordering::SeqCst) {
            return Err(RepertoryError::new(ErrorKind::UploadStopped, "stop flag set"));
        }

        let remaining = self.fail_uploads_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_uploads_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(RepertoryError::new(ErrorKind::UploadFailed, "simulated transport failure"));
        }

        let data = std::fs::read(source_path)?;
        let mut files = self.files.lock().unwrap();
        let entry = files.entry(api_path.to_string()).or_default();
        entry.data = data;
        Ok(())
    }

    fn get_file_size(&self, api_path: &str) -> ApiResult<u64> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(api_path)
            .map(|f| f.data.len() as u64)
            .unwrap_or(0))
    }

    fn get_total_drive_space(&self) -> u64 {
        u64::MAX
    }

    fn get_used_drive_space(&self) -> u64 {
        self.files.lock().unwrap().values().map(|f| f.data.len() as u64).sum()
    }
}
