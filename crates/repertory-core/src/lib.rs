//! Identifiers, error taxonomy, capability traits, events, and
//! configuration shared by the engine and its host.

pub mod bitset;
pub mod config;
pub mod error;
pub mod events;
pub mod meta;
pub mod meta_store;
pub mod path;
pub mod provider;

pub use bitset::Bitset;
pub use config::EngineConfig;
pub use error::{ApiResult, ErrorKind, RepertoryError};
pub use events::{Event, EventBus};
pub use meta::{ApiMetaMap, FilesystemItem};
pub use meta_store::{InMemoryMetaStore, MetaStore, ResumeEntry, RocksMetaStore, UploadEntry};
pub use provider::{DirectoryItem, Provider};
