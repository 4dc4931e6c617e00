//! Data model: `filesystem_item` and `api_meta_map` (spec §3.2–3.3)

use std::collections::HashMap;

/// A directory or file entry as known to the provider/meta store.
///
/// Invariant (spec §3.2 note): for every api_path the core has acted on,
/// either `directory` is true or both `size` and `source_path` are
/// present (non-empty).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilesystemItem {
    pub api_path: String,
    pub api_parent: String,
    pub directory: bool,
    pub size: u64,
    pub source_path: String,
}

impl FilesystemItem {
    pub fn new_directory(api_path: impl Into<String>, api_parent: impl Into<String>) -> Self {
        Self {
            api_path: api_path.into(),
            api_parent: api_parent.into(),
            directory: true,
            size: 0,
            source_path: String::new(),
        }
    }

    pub fn new_file(
        api_path: impl Into<String>,
        api_parent: impl Into<String>,
        size: u64,
        source_path: impl Into<String>,
    ) -> Self {
        Self {
            api_path: api_path.into(),
            api_parent: api_parent.into(),
            directory: false,
            size,
            source_path: source_path.into(),
        }
    }
}

/// Recognized `api_meta_map` keys (spec §3.3).
pub mod meta_key {
    pub const DIRECTORY: &str = "directory";
    pub const SIZE: &str = "size";
    pub const SOURCE: &str = "source";
    pub const ACCESSED: &str = "accessed";
    pub const MODIFIED: &str = "modified";
    pub const WRITTEN: &str = "written";
    pub const CHANGED: &str = "changed";
    pub const CREATION: &str = "creation";
    pub const ATTRIBUTES: &str = "attributes";
    pub const MODE: &str = "mode";
    pub const UID: &str = "uid";
    pub const GID: &str = "gid";
    pub const PINNED: &str = "pinned";
    pub const KEY: &str = "key";
}

/// A per-api_path metadata map: well-known string keys to string values,
/// as persisted by `meta_store`. Values are kept as strings per spec
/// §3.3; typed accessors are provided at the Rust boundary so call sites
/// don't parse/format by hand everywhere.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApiMetaMap(HashMap<String, String>);

impl ApiMetaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_directory(&self) -> bool {
        self.get(meta_key::DIRECTORY) == Some("true")
    }

    pub fn set_directory(&mut self, directory: bool) {
        self.set(meta_key::DIRECTORY, directory.to_string());
    }

    pub fn size(&self) -> Option<u64> {
        self.get(meta_key::SIZE).and_then(|v| v.parse().ok())
    }

    pub fn set_size(&mut self, size: u64) {
        self.set(meta_key::SIZE, size.to_string());
    }

    pub fn source_path(&self) -> Option<&str> {
        self.get(meta_key::SOURCE).filter(|s| !s.is_empty())
    }

    pub fn set_source_path(&mut self, source_path: impl Into<String>) {
        self.set(meta_key::SOURCE, source_path.into());
    }

    pub fn is_pinned(&self) -> bool {
        self.get(meta_key::PINNED) == Some("true")
    }

    pub fn set_pinned(&mut self, pinned: bool) {
        self.set(meta_key::PINNED, pinned.to_string());
    }

    /// `accessed`/`modified`/`written`/`changed` as Unix nanos.
    pub fn time_ns(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn set_time_ns(&mut self, key: &str, nanos: u64) {
        self.set(key, nanos.to_string());
    }

    /// Stamp `changed`, `modified`, and `written` to the same instant, the
    /// pattern used by the write path (spec §4.3.5 step 6).
    pub fn touch_write(&mut self, now_ns: u64) {
        self.set_time_ns(meta_key::CHANGED, now_ns);
        self.set_time_ns(meta_key::MODIFIED, now_ns);
        self.set_time_ns(meta_key::WRITTEN, now_ns);
    }
}

impl From<HashMap<String, String>> for ApiMetaMap {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

impl From<ApiMetaMap> for HashMap<String, String> {
    fn from(map: ApiMetaMap) -> Self {
        map.0
    }
}
