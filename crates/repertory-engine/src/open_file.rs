//! The chunked cache-and-upload state machine for one open api_path
//! (spec §3.4, §4.3). The largest component in the engine.
//!
//! Locking follows the flattened pattern from the design notes (spec
//! §9 REDESIGN FLAG): every public method acquires `state` once and
//! delegates to a private `_locked` helper, rather than relying on
//! reentrant mutexes. `state` guards everything the spec's `open_file`
//! struct lists except cache-file bytes themselves, which `ChunkIo`
//! serializes independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use repertory_core::error::{ApiResult, ErrorKind, RepertoryError};
use repertory_core::events::{Event, EventBus};
use repertory_core::meta::FilesystemItem;
use repertory_core::meta_store::{MetaStore, ResumeEntry};
use repertory_core::provider::Provider;
use repertory_core::Bitset;

use crate::cache_size_mgr::CacheSizeMgr;
use crate::chunk_io::ChunkIo;
use crate::download::Download;

pub type HandleId = u64;

/// Per-handle data the host associates with one open reference.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenFileData {
    pub write: bool,
}

struct State {
    fsi: FilesystemItem,
    read_state: Bitset,
    last_chunk_size: usize,
    allocated: bool,
    modified: bool,
    removed: bool,
    notified: bool,
    handles: HashMap<HandleId, OpenFileData>,
    active_downloads: HashMap<usize, Arc<Download>>,
    reader_chunk: usize,
    last_io_time: Instant,
    api_error: RepertoryError,
    reader_stop: bool,
}

/// One open file's chunked cache state (spec §3.4).
pub struct OpenFile {
    chunk_size: usize,
    chunk_timeout_secs: u64,
    provider: Arc<dyn Provider>,
    meta_store: Arc<dyn MetaStore>,
    event_bus: Arc<EventBus>,
    cache_size_mgr: Arc<CacheSizeMgr>,
    chunk_io: Option<ChunkIo>,
    stop_requested: AtomicBool,
    state: Mutex<State>,
    reader_cond: Condvar,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

fn chunk_count(size: u64, chunk_size: usize) -> usize {
    if size == 0 {
        0
    } else {
        ((size - 1) / chunk_size as u64 + 1) as usize
    }
}

fn last_chunk_size_for(size: u64, chunk_size: usize) -> usize {
    if size == 0 {
        0
    } else {
        let rem = (size % chunk_size as u64) as usize;
        if rem == 0 {
            chunk_size
        } else {
            rem
        }
    }
}

impl OpenFile {
    /// Construction (spec §4.3.1).
    pub fn new(
        chunk_size: usize,
        chunk_timeout_secs: u64,
        fsi: FilesystemItem,
        provider: Arc<dyn Provider>,
        meta_store: Arc<dyn MetaStore>,
        event_bus: Arc<EventBus>,
        cache_size_mgr: Arc<CacheSizeMgr>,
        resume_read_state: Option<Bitset>,
    ) -> ApiResult<Self> {
        if fsi.directory {
            let state = State {
                last_chunk_size: 0,
                read_state: Bitset::zeros(0),
                allocated: false,
                modified: false,
                removed: false,
                notified: false,
                handles: HashMap::new(),
                active_downloads: HashMap::new(),
                reader_chunk: 0,
                last_io_time: Instant::now(),
                api_error: RepertoryError::success(),
                reader_stop: false,
                fsi,
            };
            return Ok(Self {
                chunk_size,
                chunk_timeout_secs,
                provider,
                meta_store,
                event_bus,
                cache_size_mgr,
                chunk_io: None,
                stop_requested: AtomicBool::new(false),
                state: Mutex::new(state),
                reader_cond: Condvar::new(),
                reader_handle: Mutex::new(None),
            });
        }

        let read_only = provider.is_read_only();
        let chunk_io = match ChunkIo::open_or_create(fsi.source_path.clone(), read_only) {
            Ok(io) => io,
            Err(e) => {
                return Err(e);
            }
        };

        let (read_state, modified, mut allocated) = match resume_read_state {
            Some(bits) => (bits, true, true),
            None => (Bitset::zeros(chunk_count(fsi.size, chunk_size)), false, false),
        };

        let mut read_state = read_state;
        let on_disk_size = chunk_io.size().unwrap_or(0);
        if on_disk_size == fsi.size || read_only {
            read_state = Bitset::ones(chunk_count(fsi.size, chunk_size));
            allocated = true;
        }

        let last_chunk_size = last_chunk_size_for(fsi.size, chunk_size);

        let state = State {
            last_chunk_size,
            read_state,
            allocated,
            modified,
            removed: false,
            notified: false,
            handles: HashMap::new(),
            active_downloads: HashMap::new(),
            reader_chunk: 0,
            last_io_time: Instant::now(),
            api_error: RepertoryError::success(),
            reader_stop: false,
            fsi,
        };

        Ok(Self {
            chunk_size,
            chunk_timeout_secs,
            provider,
            meta_store,
            event_bus,
            cache_size_mgr,
            chunk_io: Some(chunk_io),
            stop_requested: AtomicBool::new(false),
            state: Mutex::new(state),
            reader_cond: Condvar::new(),
            reader_handle: Mutex::new(None),
        })
    }

    pub fn api_path(&self) -> String {
        self.state.lock().fsi.api_path.clone()
    }

    pub fn source_path(&self) -> String {
        self.state.lock().fsi.source_path.clone()
    }

    pub fn size(&self) -> u64 {
        self.state.lock().fsi.size
    }

    pub fn is_modified(&self) -> bool {
        self.state.lock().modified
    }

    pub fn is_directory(&self) -> bool {
        self.state.lock().fsi.directory
    }

    /// Retargets this entry's `api_path`/`api_parent` in place, used by
    /// `file_manager` when a rename succeeds at the provider (spec §4.6.2).
    pub fn rename(&self, new_api_path: impl Into<String>, new_api_parent: impl Into<String>) {
        let mut state = self.state.lock();
        state.fsi.api_path = new_api_path.into();
        state.fsi.api_parent = new_api_parent.into();
    }

    fn chunk_io(&self) -> ApiResult<&ChunkIo> {
        self.chunk_io
            .as_ref()
            .ok_or_else(|| RepertoryError::new(ErrorKind::InvalidOperation, "no cache file for a directory"))
    }

    pub fn add_handle(&self, handle: HandleId, data: OpenFileData) {
        self.state.lock().handles.insert(handle, data);
    }

    /// Detaches a handle and, if this leaves the file modified but fully
    /// materialized with no outstanding error, queues its upload right
    /// away rather than waiting for the idle-timeout sweep to close it.
    pub fn remove_handle(&self, handle: HandleId) {
        let queue = {
            let mut state = self.state.lock();
            state.handles.remove(&handle);
            state.modified && state.read_state.all() && state.api_error.is_success()
        };
        if queue {
            self.queue_upload_now();
        }
    }

    fn queue_upload_now(&self) {
        let (api_path, source_path) = {
            let mut state = self.state.lock();
            state.modified = false;
            (state.fsi.api_path.clone(), state.fsi.source_path.clone())
        };
        let queued = self.meta_store.queue_upload(repertory_core::meta_store::UploadEntry {
            enqueue_time_ns: now_unix_nanos(),
            api_path: api_path.clone(),
            source_path: source_path.clone(),
        });
        if queued.is_ok() {
            self.emit(Event::FileUploadQueued {
                seq: self.next_seq(),
                api_path,
                source_path,
            });
        }
    }

    pub fn handle_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    fn emit(&self, event: Event) {
        self.event_bus.publish(event);
    }

    fn next_seq(&self) -> u64 {
        self.event_bus.next_seq()
    }

    /// Lazily reconciles the cache file's on-disk size with `fsi.size`
    /// (spec §4.3.1: `check_start`).
    fn check_start(&self) -> ApiResult<()> {
        let mut state = self.state.lock();
        if state.allocated || state.fsi.directory {
            return Ok(());
        }

        let size = state.fsi.size;
        drop(state);

        self.cache_size_mgr.expand(size)?;
        if let Err(e) = self.chunk_io()?.truncate(size) {
            self.cache_size_mgr.shrink(size);
            return Err(e);
        }

        let mut state = self.state.lock();
        state.allocated = true;
        Ok(())
    }

    /// Ensures the reader thread is running, hinting it toward
    /// `reader_chunk` (spec §4.3.3).
    fn ensure_reader_started(self: &Arc<Self>, hint: usize) {
        {
            let mut state = self.state.lock();
            state.reader_chunk = hint;
        }
        self.reader_cond.notify_all();

        let mut handle = self.reader_handle.lock();
        if handle.is_some() {
            return;
        }
        let this = self.clone();
        *handle = Some(std::thread::spawn(move || this.reader_loop()));
    }

    fn reader_loop(self: Arc<Self>) {
        let mut next_chunk = 0usize;
        loop {
            {
                let mut state = self.state.lock();
                loop {
                    if state.reader_stop || self.stop_requested.load(Ordering::SeqCst) {
                        return;
                    }
                    if state.read_state.all() || state.read_state.is_empty() {
                        self.reader_cond.wait_for(&mut state, Duration::from_millis(200));
                        if state.reader_stop || self.stop_requested.load(Ordering::SeqCst) {
                            return;
                        }
                        if state.read_state.all() || state.read_state.is_empty() {
                            continue;
                        }
                    }
                    if state.reader_chunk != next_chunk {
                        next_chunk = state.reader_chunk;
                    }
                    break;
                }
                let len = state.read_state.len();
                if len == 0 {
                    continue;
                }
                next_chunk = (next_chunk + 1) % len;
            }

            let _ = self.download_chunk(next_chunk, true, false);
        }
    }

    fn stop_reader(&self) {
        {
            let mut state = self.state.lock();
            state.reader_stop = true;
        }
        self.reader_cond.notify_all();
        if let Some(handle) = self.reader_handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Chunk download protocol (spec §4.3.2).
    pub fn download_chunk(&self, idx: usize, skip_active: bool, reset_timeout: bool) -> ApiResult<()> {
        let download = {
            let mut state = self.state.lock();
            if !state.api_error.is_success() {
                return Err(state.api_error.clone());
            }
            if idx >= state.read_state.len() || state.read_state.get(idx) {
                return Ok(());
            }
            if let Some(existing) = state.active_downloads.get(&idx).cloned() {
                if skip_active {
                    return Ok(());
                }
                drop(state);
                let err = existing.wait();
                return if err.is_success() { Ok(()) } else { Err(err) };
            }

            let no_downloads_in_flight = state.active_downloads.is_empty();
            let nothing_materialized = state.read_state.count_ones() == 0;
            if no_downloads_in_flight && nothing_materialized {
                let seq = self.next_seq();
                let api_path = state.fsi.api_path.clone();
                drop(state);
                self.emit(Event::DownloadBegin { seq, api_path });
                state = self.state.lock();
            }

            if reset_timeout {
                state.last_io_time = Instant::now();
            }

            let download = Arc::new(Download::new());
            state.active_downloads.insert(idx, download.clone());
            download
        };

        let (offset, length, api_path) = {
            let state = self.state.lock();
            let last_idx = state.read_state.len().saturating_sub(1);
            let length = if idx == last_idx {
                state.last_chunk_size
            } else {
                self.chunk_size
            };
            (idx as u64 * self.chunk_size as u64, length, state.fsi.api_path.clone())
        };

        let stop_flag = AtomicBool::new(self.stop_requested.load(Ordering::SeqCst));
        let mut buf = vec![0u8; length];
        let read_result = self
            .provider
            .read_file_bytes(&api_path, length, offset, &mut buf, &stop_flag);

        let final_error = match read_result {
            Ok(()) => match self.chunk_io.as_ref().expect("chunk_io present for non-directory").write(&buf, offset) {
                Ok(_) => {
                    let mut state = self.state.lock();
                    state.read_state.set(idx, true);
                    RepertoryError::success()
                }
                Err(e) => e,
            },
            Err(e) => e,
        };

        if reset_timeout {
            self.state.lock().last_io_time = Instant::now();
        }

        // Completion step (spec §4.3.2 step 8), holding the file's lock.
        let (progress, all_set, should_notify_end, seq) = {
            let mut state = self.state.lock();
            state.active_downloads.remove(&idx);
            if !final_error.is_success() && state.api_error.is_success() {
                state.api_error = final_error.clone();
            }
            let progress = state.read_state.fraction();
            let all_set = state.read_state.all();
            let should_notify_end = all_set && !state.notified;
            if should_notify_end {
                state.notified = true;
            }
            (progress, all_set, should_notify_end, self.next_seq())
        };

        self.emit(Event::DownloadProgress {
            seq,
            api_path: api_path.clone(),
            fraction: progress,
        });
        if all_set && should_notify_end {
            self.emit(Event::DownloadEnd {
                seq: self.next_seq(),
                api_path: api_path.clone(),
                error: final_error.clone(),
            });
        }

        download.complete(final_error.clone());

        if final_error.is_success() {
            Ok(())
        } else {
            Err(final_error)
        }
    }

    /// Sequential range download; aborts on first non-success
    /// (spec §4.3.2).
    pub fn download_range(&self, begin: usize, end_inclusive: usize, reset_timeout: bool) -> ApiResult<()> {
        for idx in begin..=end_inclusive {
            self.download_chunk(idx, false, reset_timeout)?;
        }
        Ok(())
    }

    fn chunk_range(&self, offset: u64, len: u64) -> (usize, usize) {
        let begin = (offset / self.chunk_size as u64) as usize;
        let end = if len == 0 {
            begin
        } else {
            ((offset + len - 1) / self.chunk_size as u64) as usize
        };
        (begin, end)
    }

    /// Read path (spec §4.3.4).
    pub fn read(self: &Arc<Self>, offset: u64, size: usize, out: &mut Vec<u8>) -> ApiResult<usize> {
        {
            let state = self.state.lock();
            if state.fsi.directory {
                return Err(RepertoryError::new(ErrorKind::InvalidOperation, "read on directory"));
            }
            if self.stop_requested.load(Ordering::SeqCst) {
                return Err(RepertoryError::new(ErrorKind::DownloadStopped, "stop requested"));
            }
        }

        let read_size = {
            let state = self.state.lock();
            let remaining = state.fsi.size.saturating_sub(offset);
            (size as u64).min(remaining) as usize
        };
        if read_size == 0 {
            out.clear();
            return Ok(0);
        }

        self.check_start()?;

        let read_only = self.provider.is_read_only();
        let all_set = self.state.lock().read_state.all();

        if all_set {
            self.state.lock().last_io_time = Instant::now();
            if read_only && !self.state.lock().allocated {
                let mut buf = vec![0u8; read_size];
                let stop_flag = AtomicBool::new(false);
                let api_path = self.api_path();
                self.provider
                    .read_file_bytes(&api_path, read_size, offset, &mut buf, &stop_flag)?;
                out.clear();
                out.extend_from_slice(&buf);
                return Ok(read_size);
            }
            let mut buf = vec![0u8; read_size];
            let n = self.chunk_io()?.read(&mut buf, offset)?;
            out.clear();
            out.extend_from_slice(&buf[..n]);
            return Ok(n);
        }

        let (begin, end) = self.chunk_range(offset, read_size as u64);
        self.ensure_reader_started(end);
        self.download_range(begin, end, true)?;

        let mut buf = vec![0u8; read_size];
        let n = self.chunk_io()?.read(&mut buf, offset)?;
        out.clear();
        out.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    /// Write path (spec §4.3.5).
    pub fn write(self: &Arc<Self>, offset: u64, data: &[u8]) -> ApiResult<usize> {
        let read_only = self.provider.is_read_only();
        {
            let state = self.state.lock();
            if state.fsi.directory || read_only {
                return Err(RepertoryError::new(ErrorKind::InvalidOperation, "write not permitted"));
            }
        }
        if data.is_empty() {
            return Ok(0);
        }
        if self.stop_requested.load(Ordering::SeqCst) {
            return Err(RepertoryError::new(ErrorKind::DownloadStopped, "stop requested"));
        }

        self.check_start()?;

        let len = data.len() as u64;
        let (begin, end) = self.chunk_range(offset, len);
        let last_idx = self.state.lock().read_state.len().saturating_sub(1);
        let clamped_end = end.min(last_idx);
        self.ensure_reader_started(clamped_end);
        if begin <= clamped_end {
            self.download_range(begin, clamped_end, false)?;
        }

        let new_size = offset + len;
        if new_size > self.state.lock().fsi.size {
            self.resize(new_size)?;
        }

        self.chunk_io()?.write(data, offset)?;
        self.state.lock().last_io_time = Instant::now();

        let api_path = self.api_path();
        let now = now_unix_nanos();
        let mut meta = std::collections::HashMap::new();
        meta.insert("changed".to_string(), now.to_string());
        meta.insert("modified".to_string(), now.to_string());
        meta.insert("written".to_string(), now.to_string());
        self.meta_store.set_meta(&api_path, meta)?;

        self.mark_modified()?;

        Ok(data.len())
    }

    fn mark_modified(&self) -> ApiResult<()> {
        let (first_transition, api_path, source_path, chunk_size, read_state) = {
            let mut state = self.state.lock();
            let first_transition = !state.modified;
            state.modified = true;
            (
                first_transition,
                state.fsi.api_path.clone(),
                state.fsi.source_path.clone(),
                self.chunk_size as u64,
                state.read_state.clone(),
            )
        };
        if first_transition {
            self.meta_store.store_resume(
                &api_path,
                ResumeEntry {
                    chunk_size,
                    source_path,
                    read_state,
                },
            )?;
            self.meta_store.remove_upload(&api_path)?;
        }
        Ok(())
    }

    /// Resize/truncate (spec §4.3.6). `op` performs the host-level
    /// truncate/allocation while the file lock is held.
    pub fn resize(&self, new_size: u64) -> ApiResult<()> {
        self.native_operation(new_size, |chunk_io, size| chunk_io.truncate(size))
    }

    fn native_operation(
        &self,
        new_size: u64,
        op: impl FnOnce(&ChunkIo, u64) -> ApiResult<()>,
    ) -> ApiResult<()> {
        {
            let state = self.state.lock();
            if state.fsi.directory {
                return Err(RepertoryError::new(ErrorKind::InvalidOperation, "resize on directory"));
            }
        }
        if self.stop_requested.load(Ordering::SeqCst) {
            return Err(RepertoryError::new(ErrorKind::DownloadStopped, "stop requested"));
        }

        self.check_start()?;

        let old_size = self.state.lock().fsi.size;
        if new_size > old_size {
            self.cache_size_mgr.expand(new_size - old_size)?;
        } else if new_size < old_size {
            self.cache_size_mgr.shrink(old_size - new_size);
        }

        let new_last_chunk = if new_size == 0 {
            0
        } else {
            chunk_count(new_size, self.chunk_size).saturating_sub(1)
        };

        let read_state_len = self.state.lock().read_state.len();
        if new_size > 0 && new_last_chunk < read_state_len {
            self.download_chunk(new_last_chunk, false, false)?;
        }

        if let Err(e) = op(self.chunk_io()?, new_size) {
            self.state.lock().api_error = e.clone();
            return Err(e);
        }

        let actual_size = self.chunk_io()?.size()?;
        if actual_size != new_size {
            let err = RepertoryError::new(ErrorKind::FileSizeMismatch, "post-resize size mismatch");
            self.state.lock().api_error = err.clone();
            return Err(err);
        }

        let new_len = chunk_count(new_size, self.chunk_size);
        let last_chunk_size = last_chunk_size_for(new_size, self.chunk_size);

        let (size_changed, api_path) = {
            let mut state = self.state.lock();
            let prev_len = state.read_state.len();
            state.read_state.resize(new_len);
            if new_len > prev_len {
                for i in prev_len..new_len {
                    state.read_state.set(i, true);
                }
            }
            state.last_chunk_size = last_chunk_size;
            let size_changed = state.fsi.size != new_size;
            state.fsi.size = new_size;
            if size_changed {
                state.modified = true;
            }
            (size_changed, state.fsi.api_path.clone())
        };

        if size_changed {
            let now = now_unix_nanos();
            let mut meta = std::collections::HashMap::new();
            meta.insert("changed".to_string(), now.to_string());
            meta.insert("modified".to_string(), now.to_string());
            meta.insert("written".to_string(), now.to_string());
            meta.insert("size".to_string(), new_size.to_string());
            self.meta_store.set_meta(&api_path, meta)?;
            self.mark_modified()?;
        }

        Ok(())
    }

    /// True when the file is eligible for the idle-timeout sweep
    /// (spec §4.3.8).
    pub fn can_close(&self) -> bool {
        let state = self.state.lock();
        if state.fsi.directory {
            return false;
        }
        let idle = self.chunk_timeout_secs == 0
            || state.last_io_time.elapsed() >= Duration::from_secs(self.chunk_timeout_secs);
        state.handles.is_empty() && state.active_downloads.is_empty() && !state.modified && idle
    }

    /// Close protocol (spec §4.3.7). Returns `false` for a no-op
    /// (directory, or already stopped).
    pub fn close(self: &Arc<Self>) -> bool {
        if self.state.lock().fsi.directory {
            return false;
        }
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.stop_reader();

        let (modified, api_error, all_set, size, api_path, source_path) = {
            let state = self.state.lock();
            (
                state.modified,
                state.api_error.clone(),
                state.read_state.all() || state.read_state.is_empty(),
                state.fsi.size,
                state.fsi.api_path.clone(),
                state.fsi.source_path.clone(),
            )
        };

        let terminal = if api_error.is_success() && modified && !all_set {
            RepertoryError::new(ErrorKind::DownloadIncomplete, "closed before fully materialized")
        } else if !modified && size > 0 && !all_set {
            RepertoryError::new(ErrorKind::DownloadStopped, "closed while downloading")
        } else {
            api_error
        };

        if let Some(io) = self.chunk_io.as_ref() {
            io.close();
        }

        let chunk_size = self.chunk_size as u64;
        let read_state = self.state.lock().read_state.clone();

        if terminal.is_success() && modified {
            self.queue_upload_now();
        } else if terminal.kind() == ErrorKind::DownloadIncomplete && modified {
            let _ = self.meta_store.store_resume(
                &api_path,
                ResumeEntry {
                    chunk_size,
                    source_path: source_path.clone(),
                    read_state,
                },
            );
        } else {
            let _ = self.meta_store.remove_resume(&api_path);
        }

        if !terminal.is_success() {
            let _ = std::fs::remove_file(&source_path);
            self.cache_size_mgr.shrink(size);
            let fresh = uuid::Uuid::new_v4().to_string();
            let mut meta = std::collections::HashMap::new();
            meta.insert("source".to_string(), fresh);
            let _ = self.meta_store.set_meta(&api_path, meta);
            warn!(api_path, error = %terminal, "open_file closed with error, reallocated source_path");
        }

        debug!(api_path, modified, "open_file closed");
        true
    }
}

fn now_unix_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
