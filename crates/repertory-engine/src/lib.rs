//! Chunked cache-and-upload engine: `open_file`, `ring_buffer_open_file`,
//! `file_manager`, `eviction`, `polling`. Consumes `repertory-core`'s
//! `Provider`/`MetaStore` capabilities and never names a concrete backend.

pub mod cache_size_mgr;
pub mod chunk_io;
pub mod download;
pub mod eviction;
pub mod file_manager;
pub mod open_file;
pub mod polling;
pub mod ring_buffer_open_file;
pub mod upload;

#[cfg(test)]
pub mod testing;

pub use cache_size_mgr::CacheSizeMgr;
pub use download::Download;
pub use eviction::{EvictionOrder, EvictionSweeper};
pub use file_manager::FileManager;
pub use open_file::{HandleId, OpenFile, OpenFileData};
pub use polling::{Frequency, Polling};
pub use ring_buffer_open_file::RingBufferOpenFile;
pub use upload::UploadTask;
