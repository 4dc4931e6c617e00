//! One background task bound to `(api_path, source_path)` (spec §4.5).
//!
//! `UploadTask` performs a single upload attempt; retry/back-off and
//! queue bookkeeping live in `file_manager`'s worker loop, which owns the
//! thread this runs on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use repertory_core::error::RepertoryError;
use repertory_core::events::{Event, EventBus};
use repertory_core::provider::Provider;

/// One upload attempt for a single `(api_path, source_path)` pair.
pub struct UploadTask {
    api_path: String,
    source_path: String,
    stop_flag: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl UploadTask {
    pub fn new(api_path: impl Into<String>, source_path: impl Into<String>) -> Self {
        Self {
            api_path: api_path.into(),
            source_path: source_path.into(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn api_path(&self) -> &str {
        &self.api_path
    }

    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    /// Sets the cancelled and stop flags; an in-flight `provider.upload_file`
    /// call observing `stop_flag` should return `upload_stopped` promptly.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Runs the upload to completion, emitting `file_upload_completed`
    /// (spec §4.5 steps 1-3). Returns the terminal error (success on
    /// success).
    pub fn run(&self, provider: &dyn Provider, event_bus: &EventBus) -> RepertoryError {
        let result = provider.upload_file(&self.api_path, &self.source_path, &self.stop_flag);

        let error = match result {
            Ok(()) => {
                reset_mtime(&self.source_path);
                RepertoryError::success()
            }
            Err(e) => e,
        };

        event_bus.publish(Event::FileUploadCompleted {
            seq: event_bus.next_seq(),
            api_path: self.api_path.clone(),
            source_path: self.source_path.clone(),
            error: error.clone(),
            cancelled: self.is_cancelled(),
        });

        error
    }
}

/// Resets the source file's mtime to now, so eviction's
/// "modified-after-upload" heuristic doesn't treat a just-uploaded file
/// as freshly dirty.
fn reset_mtime(source_path: &str) {
    let now = filetime::FileTime::now();
    if let Err(e) = filetime::set_file_mtime(source_path, now) {
        tracing::warn!(source_path, error = %e, "failed to reset mtime after upload");
    }
}
