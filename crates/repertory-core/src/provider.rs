//! The `Provider` capability (spec §6.1)
//!
//! The engine only ever sees this trait; no S3/Sia backend lives in this
//! workspace. Modeled as a trait object, per the design note that "the
//! core never pattern-matches on provider kind."

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;

use crate::error::ApiResult;
use crate::meta::FilesystemItem;

/// One entry returned by `get_directory_items`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryItem {
    pub api_path: String,
    pub directory: bool,
    pub size: u64,
}

/// Remote object-store capability consumed by the engine.
///
/// Implementors are expected to be `Send + Sync` and internally
/// thread-safe; the engine calls these methods from many threads
/// concurrently and never serializes access on the caller's behalf.
pub trait Provider: Send + Sync {
    /// True if the backend rejects all writes (create/remove/rename/upload).
    fn is_read_only(&self) -> bool;

    /// True if `rename_file`/`rename_directory` are supported.
    fn is_rename_supported(&self) -> bool;

    fn get_filesystem_item(&self, api_path: &str, directory: bool) -> ApiResult<FilesystemItem>;

    /// Ordered: directories first, then by `api_path` ascending; includes
    /// `.`/`..` entries per spec §6.1.
    fn get_directory_items(&self, api_path: &str) -> ApiResult<Vec<DirectoryItem>>;

    fn get_item_meta(&self, api_path: &str) -> ApiResult<HashMap<String, String>>;

    fn get_item_meta_key(&self, api_path: &str, key: &str) -> ApiResult<Option<String>>;

    fn set_item_meta(&self, api_path: &str, values: HashMap<String, String>) -> ApiResult<()>;

    fn create_file(&self, api_path: &str, meta: HashMap<String, String>) -> ApiResult<()>;

    fn create_directory(&self, api_path: &str, meta: HashMap<String, String>) -> ApiResult<()>;

    fn create_directory_clone_source_meta(&self, from: &str, to: &str) -> ApiResult<()>;

    fn remove_file(&self, api_path: &str) -> ApiResult<()>;

    fn remove_directory(&self, api_path: &str) -> ApiResult<()>;

    fn rename_file(&self, from: &str, to: &str) -> ApiResult<()>;

    fn is_file(&self, api_path: &str) -> ApiResult<bool>;

    fn is_directory(&self, api_path: &str) -> ApiResult<bool>;

    fn is_file_writeable(&self, api_path: &str) -> bool;

    /// Fills `out_buf[..length]` starting at `offset`. Implementations
    /// must observe `stop_flag` and return `download_stopped` promptly.
    fn read_file_bytes(
        &self,
        api_path: &str,
        length: usize,
        offset: u64,
        out_buf: &mut [u8],
        stop_flag: &AtomicBool,
    ) -> ApiResult<()>;

    /// Streams the local file at `source_path` to the backend under
    /// `api_path`. Implementations must observe `stop_flag`.
    fn upload_file(&self, api_path: &str, source_path: &str, stop_flag: &AtomicBool) -> ApiResult<()>;

    fn get_file_size(&self, api_path: &str) -> ApiResult<u64>;

    fn get_total_drive_space(&self) -> u64;

    fn get_used_drive_space(&self) -> u64;
}
