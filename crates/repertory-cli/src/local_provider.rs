//! Demo `Provider` backed by a real directory on local disk, standing in
//! for an S3/Sia backend so `repertory-engine` can be exercised end to end
//! without a network. Not a host adapter: nothing here mounts a
//! filesystem, it just gives `FileManager` something concrete to talk to.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use repertory_core::error::{ApiResult, ErrorKind, RepertoryError};
use repertory_core::meta::FilesystemItem;
use repertory_core::path;
use repertory_core::provider::{DirectoryItem, Provider};

/// Backs every `api_path` by a real file or directory under `root`, plus
/// an in-memory sidecar for the arbitrary string metadata the `Provider`
/// contract carries (a plain directory has no native slot for that).
pub struct LocalDiskProvider {
    root: PathBuf,
    read_only: bool,
    meta: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl LocalDiskProvider {
    pub fn new(root: impl Into<PathBuf>, read_only: bool) -> ApiResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            read_only,
            meta: Mutex::new(HashMap::new()),
        })
    }

    fn real_path(&self, api_path: &str) -> PathBuf {
        if path::is_root(api_path) {
            return self.root.clone();
        }
        self.root.join(api_path.trim_start_matches('/'))
    }

    fn require_writable(&self) -> ApiResult<()> {
        if self.read_only {
            return Err(RepertoryError::new(ErrorKind::PermissionDenied, "provider is read-only"));
        }
        Ok(())
    }
}

#[cfg(unix)]
fn is_not_empty(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOTEMPTY)
}

#[cfg(not(unix))]
fn is_not_empty(_e: &std::io::Error) -> bool {
    false
}

impl Provider for LocalDiskProvider {
    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn is_rename_supported(&self) -> bool {
        true
    }

    fn get_filesystem_item(&self, api_path: &str, directory: bool) -> ApiResult<FilesystemItem> {
        let real = self.real_path(api_path);
        let parent = path::parent(api_path);

        match fs::metadata(&real) {
            Ok(md) => Ok(FilesystemItem {
                api_path: api_path.to_string(),
                api_parent: parent,
                directory: md.is_dir(),
                size: if md.is_dir() { 0 } else { md.len() },
                source_path: String::new(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && directory => {
                Ok(FilesystemItem::new_directory(api_path, parent))
            }
            Err(e) => Err(RepertoryError::from(e)),
        }
    }

    fn get_directory_items(&self, api_path: &str) -> ApiResult<Vec<DirectoryItem>> {
        let real = self.real_path(api_path);
        let mut items = Vec::new();
        for entry in fs::read_dir(&real)? {
            let entry = entry?;
            let md = entry.metadata()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_api_path = path::join(api_path, &name);
            items.push(DirectoryItem {
                api_path: child_api_path,
                directory: md.is_dir(),
                size: if md.is_dir() { 0 } else { md.len() },
            });
        }
        items.sort_by(|a, b| b.directory.cmp(&a.directory).then(a.api_path.cmp(&b.api_path)));
        Ok(items)
    }

    fn get_item_meta(&self, api_path: &str) -> ApiResult<HashMap<String, String>> {
        Ok(self.meta.lock().unwrap().get(api_path).cloned().unwrap_or_default())
    }

    fn get_item_meta_key(&self, api_path: &str, key: &str) -> ApiResult<Option<String>> {
        Ok(self.meta.lock().unwrap().get(api_path).and_then(|m| m.get(key).cloned()))
    }

    fn set_item_meta(&self, api_path: &str, values: HashMap<String, String>) -> ApiResult<()> {
        self.meta.lock().unwrap().entry(api_path.to_string()).or_default().extend(values);
        Ok(())
    }

    fn create_file(&self, api_path: &str, meta: HashMap<String, String>) -> ApiResult<()> {
        self.require_writable()?;
        let real = self.real_path(api_path);
        if let Some(parent) = real.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().write(true).create_new(true).open(&real)?;
        self.set_item_meta(api_path, meta)
    }

    fn create_directory(&self, api_path: &str, meta: HashMap<String, String>) -> ApiResult<()> {
        self.require_writable()?;
        let real = self.real_path(api_path);
        if real.exists() {
            return Err(RepertoryError::new(ErrorKind::DirectoryExists, api_path));
        }
        fs::create_dir_all(&real)?;
        self.set_item_meta(api_path, meta)
    }

    fn create_directory_clone_source_meta(&self, from: &str, to: &str) -> ApiResult<()> {
        let meta = self.get_item_meta(from)?;
        self.create_directory(to, meta)
    }

    fn remove_file(&self, api_path: &str) -> ApiResult<()> {
        self.require_writable()?;
        fs::remove_file(self.real_path(api_path))?;
        self.meta.lock().unwrap().remove(api_path);
        Ok(())
    }

    fn remove_directory(&self, api_path: &str) -> ApiResult<()> {
        self.require_writable()?;
        let real = self.real_path(api_path);
        match fs::remove_dir(&real) {
            Ok(()) => {
                self.meta.lock().unwrap().remove(api_path);
                Ok(())
            }
            Err(e) if is_not_empty(&e) => Err(RepertoryError::new(ErrorKind::DirectoryNotEmpty, api_path)),
            Err(e) => Err(RepertoryError::from(e)),
        }
    }

    fn rename_file(&self, from: &str, to: &str) -> ApiResult<()> {
        self.require_writable()?;
        let to_real = self.real_path(to);
        if let Some(parent) = to_real.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(self.real_path(from), to_real)?;
        if let Some(meta) = self.meta.lock().unwrap().remove(from) {
            self.meta.lock().unwrap().insert(to.to_string(), meta);
        }
        Ok(())
    }

    fn is_file(&self, api_path: &str) -> ApiResult<bool> {
        Ok(self.real_path(api_path).is_file())
    }

    fn is_directory(&self, api_path: &str) -> ApiResult<bool> {
        Ok(self.real_path(api_path).is_dir())
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
        if stop_flag.load(Ordering::SeqCst) {
            return Err(RepertoryError::new(ErrorKind::DownloadStopped, "stop flag set"));
        }
        let mut file = File::open(self.real_path(api_path))?;
        file.seek(SeekFrom::Start(offset))?;

        let mut total = 0;
        while total < length {
            if stop_flag.load(Ordering::SeqCst) {
                return Err(RepertoryError::new(ErrorKind::DownloadStopped, "stop flag set"));
            }
            match file.read(&mut out_buf[total..length])? {
                0 => break,
                n => total += n,
            }
        }
        Ok(())
    }

    fn upload_file(&self, api_path: &str, source_path: &str, stop_flag: &AtomicBool) -> ApiResult<()> {
        self.require_writable()?;
        if stop_flag.load(Ordering::SeqCst) {
            return Err(RepertoryError::new(ErrorKind::UploadStopped, "stop flag set"));
        }
        let real = self.real_path(api_path);
        if let Some(parent) = real.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source_path, &real)?;
        Ok(())
    }

    fn get_file_size(&self, api_path: &str) -> ApiResult<u64> {
        Ok(fs::metadata(self.real_path(api_path)).map(|m| m.len()).unwrap_or(0))
    }

    fn get_total_drive_space(&self) -> u64 {
        u64::MAX
    }

    fn get_used_drive_space(&self) -> u64 {
        fn walk(dir: &Path) -> u64 {
            let Ok(entries) = fs::read_dir(dir) else {
                return 0;
            };
            let mut total = 0;
            for entry in entries.flatten() {
                let Ok(md) = entry.metadata() else { continue };
                if md.is_dir() {
                    total += walk(&entry.path());
                } else {
                    total += md.len();
                }
            }
            total
        }
        walk(&self.root)
    }
}
