//! Local-cache eviction sweep (spec §4.7): evicts cached file bodies,
//! oldest-accessed first, until usage drops under the configured budget.
//! Driven by `polling` at `medium` frequency.

use std::sync::Arc;

use repertory_core::meta::meta_key;
use repertory_core::meta_store::MetaStore;

use crate::cache_size_mgr::CacheSizeMgr;
use crate::file_manager::FileManager;

/// Which meta timestamp drives the eviction ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionOrder {
    Accessed,
    Modified,
}

pub struct EvictionSweeper {
    file_manager: Arc<FileManager>,
    meta_store: Arc<dyn MetaStore>,
    cache_size_mgr: Arc<CacheSizeMgr>,
    low_watermark: u64,
    order: EvictionOrder,
}

impl EvictionSweeper {
    pub fn new(
        file_manager: Arc<FileManager>,
        meta_store: Arc<dyn MetaStore>,
        low_watermark: u64,
        order: EvictionOrder,
    ) -> Self {
        let cache_size_mgr = file_manager.cache_size_mgr().clone();
        Self {
            file_manager,
            meta_store,
            cache_size_mgr,
            low_watermark,
            order,
        }
    }

    /// Registered with `polling` as `evict_cache` (spec §4.8).
    pub fn run(&self) {
        if self.cache_size_mgr.used() <= self.low_watermark {
            return;
        }

        let Ok(paths) = self.meta_store.list_paths() else {
            return;
        };

        let mut candidates: Vec<(String, u64)> = Vec::new();
        for api_path in paths {
            if self.is_pinned(&api_path) || self.file_manager.is_processing(&api_path) {
                continue;
            }
            let stamp = self.timestamp_for(&api_path);
            candidates.push((api_path, stamp));
        }
        candidates.sort_by_key(|(_, stamp)| *stamp);

        for (api_path, _) in candidates {
            if self.cache_size_mgr.used() <= self.low_watermark {
                break;
            }
            self.file_manager.evict_file(&api_path);
        }
    }

    fn is_pinned(&self, api_path: &str) -> bool {
        matches!(self.meta_store.get_meta_value(api_path, meta_key::PINNED), Ok(Some(v)) if v == "true")
    }

    fn timestamp_for(&self, api_path: &str) -> u64 {
        let key = match self.order {
            EvictionOrder::Accessed => meta_key::ACCESSED,
            EvictionOrder::Modified => meta_key::MODIFIED,
        };
        self.meta_store
            .get_meta_value(api_path, key)
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProvider;
    use repertory_core::config::EngineConfig;
    use repertory_core::events::EventBus;
    use repertory_core::meta_store::InMemoryMetaStore;
    use std::collections::HashMap;

    fn sweeper(cache_max: u64, low_watermark: u64) -> (EvictionSweeper, Arc<FakeProvider>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeProvider::new());
        let meta_store = Arc::new(InMemoryMetaStore::new());
        let event_bus = Arc::new(EventBus::new());

        let mut config = EngineConfig::default();
        config.chunk_size = 1024;
        config.chunk_timeout_secs = 0;
        config.cache_max_bytes = cache_max;
        config.cache_dir = Some(dir.path().to_path_buf());

        let fm = FileManager::new(config, provider.clone(), meta_store.clone(), event_bus);
        let sweeper = EvictionSweeper::new(fm, meta_store, low_watermark, EvictionOrder::Accessed);
        (sweeper, provider, dir)
    }

    #[test]
    fn run_is_noop_below_low_watermark() {
        let (sweeper, _provider, _dir) = sweeper(1_000_000, 1_000_000);
        sweeper.run();
    }

    #[test]
    fn run_evicts_oldest_unpinned_entry_first() {
        let (sweeper, provider, _dir) = sweeper(u64::MAX, 2048);
        provider.seed_file("/old", vec![0u8; 2048]);
        provider.seed_file("/new", vec![0u8; 2048]);

        for (path, ts) in [("/old", 1u64), ("/new", 2u64)] {
            let (handle, of) = sweeper.file_manager.open(path, false, Default::default()).unwrap();
            let mut out = Vec::new();
            of.read(0, 2048, &mut out).unwrap();
            let mut meta = HashMap::new();
            meta.insert(meta_key::ACCESSED.to_string(), ts.to_string());
            sweeper.meta_store.set_meta(path, meta).unwrap();
            sweeper.file_manager.close(handle);
        }

        sweeper.run();

        assert!(!sweeper.file_manager.evict_file("/old"));
        assert!(sweeper.file_manager.evict_file("/new"));
    }

    #[test]
    fn pinned_entries_are_never_evicted() {
        let (sweeper, provider, _dir) = sweeper(u64::MAX, 0);
        provider.seed_file("/pinned", vec![0u8; 1024]);

        let (handle, of) = sweeper.file_manager.open("/pinned", false, Default::default()).unwrap();
        let mut out = Vec::new();
        of.read(0, 1024, &mut out).unwrap();
        sweeper.file_manager.close(handle);

        let mut meta = HashMap::new();
        meta.insert(meta_key::PINNED.to_string(), "true".to_string());
        sweeper.meta_store.set_meta("/pinned", meta).unwrap();

        sweeper.run();

        assert!(!sweeper.file_manager.evict_file("/pinned"));
    }
}
