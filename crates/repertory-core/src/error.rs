//! Error taxonomy for the repertory core engine
//!
//! Mirrors the abstract error kinds consumed throughout `open_file` and
//! `file_manager`: a single sticky `ErrorKind` plus a human-readable
//! message, rather than one `thiserror` variant per call site. Call sites
//! match on `kind()`; the message is for logs only.

use thiserror::Error;

/// Abstract error kind, independent of the underlying cause.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation completed normally. Used as the sticky default for
    /// `open_file::api_error` before any failure has occurred.
    Success,
    /// Local filesystem or syscall failure.
    Os,
    /// Called on the wrong kind of entity, or a write against a
    /// read-only provider.
    InvalidOperation,
    /// Unknown or already-closed handle.
    InvalidHandle,
    /// Target file missing at provider or meta store.
    ItemNotFound,
    /// Target directory missing at provider or meta store.
    DirectoryNotFound,
    /// Target file present when absence was required.
    ItemExists,
    /// Target directory present when absence was required.
    DirectoryExists,
    /// Remove attempted on a non-empty directory.
    DirectoryNotEmpty,
    /// Target has open dirty handles or is otherwise processing.
    FileInUse,
    /// Shutdown observed while a read was in flight.
    DownloadStopped,
    /// Closed dirty before every chunk was materialized.
    DownloadIncomplete,
    /// Provider reported a transport-level read failure.
    DownloadFailed,
    /// Provider reported a transport-level upload failure.
    UploadFailed,
    /// Upload was cancelled by shutdown.
    UploadStopped,
    /// Provider refused a write.
    PermissionDenied,
    /// Local size disagrees with provider size after an operation.
    FileSizeMismatch,
    /// Output buffer was too small to satisfy the request.
    BufferTooSmall,
    /// Output buffer overflowed during a fill.
    BufferOverflow,
    /// Optional capability not offered by the provider.
    NotImplemented,
    /// Allocation failure.
    OutOfMemory,
    /// Fallback for causes that do not fit another kind.
    Error,
}

impl ErrorKind {
    /// True for [`ErrorKind::Success`].
    pub fn is_success(self) -> bool {
        matches!(self, ErrorKind::Success)
    }

    /// Map to a libc errno, for host adapters that need one. Kinds with
    /// no natural errno fall back to `EIO`.
    #[cfg(unix)]
    pub fn to_errno(self) -> i32 {
        match self {
            ErrorKind::Success => 0,
            ErrorKind::InvalidOperation => libc::EINVAL,
            ErrorKind::InvalidHandle => libc::EBADF,
            ErrorKind::ItemNotFound | ErrorKind::DirectoryNotFound => libc::ENOENT,
            ErrorKind::ItemExists | ErrorKind::DirectoryExists => libc::EEXIST,
            ErrorKind::DirectoryNotEmpty => libc::ENOTEMPTY,
            ErrorKind::FileInUse => libc::EBUSY,
            ErrorKind::DownloadStopped | ErrorKind::UploadStopped => libc::EINTR,
            ErrorKind::DownloadIncomplete
            | ErrorKind::DownloadFailed
            | ErrorKind::UploadFailed
            | ErrorKind::Os => libc::EIO,
            ErrorKind::PermissionDenied => libc::EACCES,
            ErrorKind::FileSizeMismatch => libc::EIO,
            ErrorKind::BufferTooSmall | ErrorKind::BufferOverflow => libc::ENOBUFS,
            ErrorKind::NotImplemented => libc::ENOSYS,
            ErrorKind::OutOfMemory => libc::ENOMEM,
            ErrorKind::Error => libc::EIO,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Success => "success",
            ErrorKind::Os => "os_error",
            ErrorKind::InvalidOperation => "invalid_operation",
            ErrorKind::InvalidHandle => "invalid_handle",
            ErrorKind::ItemNotFound => "item_not_found",
            ErrorKind::DirectoryNotFound => "directory_not_found",
            ErrorKind::ItemExists => "item_exists",
            ErrorKind::DirectoryExists => "directory_exists",
            ErrorKind::DirectoryNotEmpty => "directory_not_empty",
            ErrorKind::FileInUse => "file_in_use",
            ErrorKind::DownloadStopped => "download_stopped",
            ErrorKind::DownloadIncomplete => "download_incomplete",
            ErrorKind::DownloadFailed => "download_failed",
            ErrorKind::UploadFailed => "upload_failed",
            ErrorKind::UploadStopped => "upload_stopped",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::FileSizeMismatch => "file_size_mismatch",
            ErrorKind::BufferTooSmall => "buffer_too_small",
            ErrorKind::BufferOverflow => "buffer_overflow",
            ErrorKind::NotImplemented => "not_implemented",
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::Error => "error",
        };
        f.write_str(s)
    }
}

/// A sticky, API-facing error: a kind plus a human-readable cause.
///
/// `RepertoryError::success()` is the default value and is what
/// `open_file::api_error` holds before any operation has failed.
#[derive(Clone, Debug, Error)]
#[error("{kind}: {message}")]
pub struct RepertoryError {
    kind: ErrorKind,
    message: String,
}

impl RepertoryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The success sentinel used to initialize sticky error fields.
    pub fn success() -> Self {
        Self {
            kind: ErrorKind::Success,
            message: String::new(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_success(&self) -> bool {
        self.kind.is_success()
    }
}

impl Default for RepertoryError {
    fn default() -> Self {
        Self::success()
    }
}

impl PartialEq for RepertoryError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl From<std::io::Error> for RepertoryError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::ItemNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => ErrorKind::ItemExists,
            _ => ErrorKind::Os,
        };
        Self::new(kind, e.to_string())
    }
}

/// Convenience alias used throughout the engine.
pub type ApiResult<T> = Result<T, RepertoryError>;
