//! Typed event bus (spec §6.5)
//!
//! The core only emits; it never subscribes to its own events. `EventBus`
//! is a leaf lock (spec §5, lock level 6): subscribers are invoked while
//! holding `subscribers_lock`, so handlers must not call back into the
//! engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::RepertoryError;

/// One emitted event. Every variant carries `api_path`; most carry
/// `source_path`; some carry a progress fraction or a terminal error.
#[derive(Clone, Debug)]
pub enum Event {
    DownloadBegin {
        seq: u64,
        api_path: String,
    },
    DownloadProgress {
        seq: u64,
        api_path: String,
        fraction: f64,
    },
    DownloadEnd {
        seq: u64,
        api_path: String,
        error: RepertoryError,
    },
    DownloadTimeout {
        seq: u64,
        api_path: String,
    },
    DownloadStored {
        seq: u64,
        api_path: String,
        source_path: String,
    },
    DownloadStoredFailed {
        seq: u64,
        api_path: String,
        source_path: String,
        error: RepertoryError,
    },
    DownloadStoredRemoved {
        seq: u64,
        api_path: String,
    },
    DownloadRestored {
        seq: u64,
        api_path: String,
        source_path: String,
    },
    DownloadRestoreFailed {
        seq: u64,
        api_path: String,
        error: RepertoryError,
    },
    FileUploadQueued {
        seq: u64,
        api_path: String,
        source_path: String,
    },
    FileUploadRetry {
        seq: u64,
        api_path: String,
        error: RepertoryError,
    },
    FileUploadCompleted {
        seq: u64,
        api_path: String,
        source_path: String,
        error: RepertoryError,
        cancelled: bool,
    },
    FileUploadRemoved {
        seq: u64,
        api_path: String,
    },
    FileUploadNotFound {
        seq: u64,
        api_path: String,
        source_path: String,
    },
    FileRemoved {
        seq: u64,
        api_path: String,
    },
    FileRemoveFailed {
        seq: u64,
        api_path: String,
        error: RepertoryError,
    },
    FilesystemItemAdded {
        seq: u64,
        api_path: String,
    },
    FilesystemItemEvicted {
        seq: u64,
        api_path: String,
    },
    DirectoryRemoved {
        seq: u64,
        api_path: String,
    },
    DirectoryRemoveFailed {
        seq: u64,
        api_path: String,
        error: RepertoryError,
    },
    DirectoryRemovedExternally {
        seq: u64,
        api_path: String,
    },
    FileRemovedExternally {
        seq: u64,
        api_path: String,
    },
    OrphanedFileDetected {
        seq: u64,
        api_path: String,
        source_path: String,
    },
    OrphanedFileProcessed {
        seq: u64,
        api_path: String,
        source_path: String,
    },
    OrphanedFileProcessingFailed {
        seq: u64,
        api_path: String,
        source_path: String,
        error: RepertoryError,
    },
    ServiceStarted {
        seq: u64,
    },
    ServiceShutdownBegin {
        seq: u64,
    },
    ServiceShutdownEnd {
        seq: u64,
    },
    ProviderOffline {
        seq: u64,
    },
}

impl Event {
    /// The monotonically increasing sequence number, used by log
    /// consumers to order interleaved per-path event streams.
    pub fn seq(&self) -> u64 {
        match self {
            Event::DownloadBegin { seq, .. }
            | Event::DownloadProgress { seq, .. }
            | Event::DownloadEnd { seq, .. }
            | Event::DownloadTimeout { seq, .. }
            | Event::DownloadStored { seq, .. }
            | Event::DownloadStoredFailed { seq, .. }
            | Event::DownloadStoredRemoved { seq, .. }
            | Event::DownloadRestored { seq, .. }
            | Event::DownloadRestoreFailed { seq, .. }
            | Event::FileUploadQueued { seq, .. }
            | Event::FileUploadRetry { seq, .. }
            | Event::FileUploadCompleted { seq, .. }
            | Event::FileUploadRemoved { seq, .. }
            | Event::FileUploadNotFound { seq, .. }
            | Event::FileRemoved { seq, .. }
            | Event::FileRemoveFailed { seq, .. }
            | Event::FilesystemItemAdded { seq, .. }
            | Event::FilesystemItemEvicted { seq, .. }
            | Event::DirectoryRemoved { seq, .. }
            | Event::DirectoryRemoveFailed { seq, .. }
            | Event::DirectoryRemovedExternally { seq, .. }
            | Event::FileRemovedExternally { seq, .. }
            | Event::OrphanedFileDetected { seq, .. }
            | Event::OrphanedFileProcessed { seq, .. }
            | Event::OrphanedFileProcessingFailed { seq, .. }
            | Event::ServiceStarted { seq }
            | Event::ServiceShutdownBegin { seq }
            | Event::ServiceShutdownEnd { seq }
            | Event::ProviderOffline { seq } => *seq,
        }
    }

    /// `api_path` of the event, when the event names one.
    pub fn api_path(&self) -> Option<&str> {
        match self {
            Event::ServiceStarted { .. }
            | Event::ServiceShutdownBegin { .. }
            | Event::ServiceShutdownEnd { .. }
            | Event::ProviderOffline { .. } => None,
            Event::DownloadBegin { api_path, .. }
            | Event::DownloadProgress { api_path, .. }
            | Event::DownloadEnd { api_path, .. }
            | Event::DownloadTimeout { api_path, .. }
            | Event::DownloadStored { api_path, .. }
            | Event::DownloadStoredFailed { api_path, .. }
            | Event::DownloadStoredRemoved { api_path, .. }
            | Event::DownloadRestored { api_path, .. }
            | Event::DownloadRestoreFailed { api_path, .. }
            | Event::FileUploadQueued { api_path, .. }
            | Event::FileUploadRetry { api_path, .. }
            | Event::FileUploadCompleted { api_path, .. }
            | Event::FileUploadRemoved { api_path, .. }
            | Event::FileUploadNotFound { api_path, .. }
            | Event::FileRemoved { api_path, .. }
            | Event::FileRemoveFailed { api_path, .. }
            | Event::FilesystemItemAdded { api_path, .. }
            | Event::FilesystemItemEvicted { api_path, .. }
            | Event::DirectoryRemoved { api_path, .. }
            | Event::DirectoryRemoveFailed { api_path, .. }
            | Event::DirectoryRemovedExternally { api_path, .. }
            | Event::FileRemovedExternally { api_path, .. }
            | Event::OrphanedFileDetected { api_path, .. }
            | Event::OrphanedFileProcessed { api_path, .. }
            | Event::OrphanedFileProcessingFailed { api_path, .. } => Some(api_path),
        }
    }
}

/// A subscriber callback. Invoked synchronously while holding the bus's
/// leaf lock; must not block or call back into the engine.
pub type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

/// Process-wide publish/subscribe hub for [`Event`]. A single instance is
/// constructed once and passed explicitly into `file_manager` (spec §9:
/// "pass explicit handles/structs ... tests can then supply fakes").
pub struct EventBus {
    next_seq: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_seq: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a subscriber; returns nothing to unregister by, matching
    /// the fire-and-forget logging/metrics consumers this exists for.
    pub fn subscribe(&self, subscriber: Subscriber) {
        self.subscribers.lock().push(subscriber);
    }

    /// Allocate the next sequence number for an about-to-be-built event.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Publish an already-constructed event to every subscriber in
    /// registration order.
    pub fn publish(&self, event: Event) {
        let subscribers = self.subscribers.lock();
        for subscriber in subscribers.iter() {
            subscriber(&event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn seq_is_monotonically_increasing() {
        let bus = EventBus::new();
        let a = bus.next_seq();
        let b = bus.next_seq();
        assert!(b > a);
    }

    #[test]
    fn publish_invokes_every_subscriber_in_order() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = count.clone();
        bus.subscribe(Arc::new(move |_: &Event| {
            c1.fetch_add(1, Ordering::SeqCst);
        }));
        let c2 = count.clone();
        bus.subscribe(Arc::new(move |_: &Event| {
            c2.fetch_add(10, Ordering::SeqCst);
        }));

        bus.publish(Event::ServiceStarted { seq: bus.next_seq() });
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn api_path_extraction() {
        let e = Event::DownloadBegin {
            seq: 1,
            api_path: "/a".to_string(),
        };
        assert_eq!(e.api_path(), Some("/a"));

        let e = Event::ServiceStarted { seq: 1 };
        assert_eq!(e.api_path(), None);
    }
}
