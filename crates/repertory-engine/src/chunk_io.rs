//! Thin, per-handle-serialized wrapper over a cache file (spec §4.2).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use repertory_core::error::{ApiResult, ErrorKind, RepertoryError};

struct Inner {
    file: Option<File>,
    read_only: bool,
}

/// Serializes I/O against one local cache file so that concurrent chunk
/// downloads and host reads see consistent size/offset semantics.
pub struct ChunkIo {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl ChunkIo {
    /// Opens (creating if needed) the cache file at `path`, creating
    /// parent directories as needed. `read_only` opens shared-read only.
    pub fn open_or_create(path: impl Into<PathBuf>, read_only: bool) -> ApiResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = if read_only {
            OpenOptions::new().read(true).open(&path)?
        } else {
            OpenOptions::new().read(true).write(true).create(true).open(&path)?
        };

        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                file: Some(file),
                read_only,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fills `buf`; a short read occurs only at EOF. Returns bytes read.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> ApiResult<usize> {
        let mut inner = self.inner.lock();
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| RepertoryError::new(ErrorKind::InvalidHandle, "chunk_io is closed"))?;
        file.seek(SeekFrom::Start(offset))?;

        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..])? {
                0 => break,
                n => total += n,
            }
        }
        Ok(total)
    }

    /// Writes all of `buf`, extending the file as needed. Returns bytes
    /// written.
    pub fn write(&self, buf: &[u8], offset: u64) -> ApiResult<usize> {
        let mut inner = self.inner.lock();
        if inner.read_only {
            return Err(RepertoryError::new(
                ErrorKind::PermissionDenied,
                "chunk_io is read-only",
            ));
        }
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| RepertoryError::new(ErrorKind::InvalidHandle, "chunk_io is closed"))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(buf.len())
    }

    /// Sets the file to exactly `size`, allocating if growing.
    pub fn truncate(&self, size: u64) -> ApiResult<()> {
        let mut inner = self.inner.lock();
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| RepertoryError::new(ErrorKind::InvalidHandle, "chunk_io is closed"))?;
        file.set_len(size)?;
        Ok(())
    }

    /// Current on-disk size.
    pub fn size(&self) -> ApiResult<u64> {
        let mut inner = self.inner.lock();
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| RepertoryError::new(ErrorKind::InvalidHandle, "chunk_io is closed"))?;
        Ok(file.metadata()?.len())
    }

    pub fn sync(&self) -> ApiResult<()> {
        let inner = self.inner.lock();
        if let Some(file) = inner.file.as_ref() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Idempotent.
    pub fn close(&self) {
        self.inner.lock().file.take();
    }
}
