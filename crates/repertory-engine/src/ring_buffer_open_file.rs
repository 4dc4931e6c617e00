//! Bounded sliding-window cache for read-only streaming of oversized files
//! (spec §3.5, §4.4). Used when the admission layer decides a file is too
//! large to cache fully; `file_manager` opens this instead of `OpenFile`.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use repertory_core::error::{ApiResult, ErrorKind, RepertoryError};
use repertory_core::meta::FilesystemItem;
use repertory_core::provider::Provider;
use repertory_core::Bitset;

use crate::chunk_io::ChunkIo;
use crate::download::Download;

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

struct State {
    ring_state: Bitset,
    first_chunk: usize,
    last_chunk: usize,
    current_chunk: usize,
    active_downloads: HashMap<usize, Arc<Download>>,
    api_error: RepertoryError,
}

impl State {
    fn invalidate_all(&mut self, ring_size: usize) {
        self.ring_state = Bitset::ones(ring_size);
    }

    fn invalidate_slot(&mut self, chunk: usize, ring_size: usize) {
        self.ring_state.set(chunk % ring_size, true);
    }
}

/// A read-only sliding window over a file too large to cache whole
/// (spec §4.4).
pub struct RingBufferOpenFile {
    fsi: FilesystemItem,
    chunk_size: usize,
    last_chunk_size: usize,
    total_chunks: usize,
    ring_size: usize,
    provider: Arc<dyn Provider>,
    chunk_io: ChunkIo,
    state: Mutex<State>,
}

impl RingBufferOpenFile {
    /// `ring_size` must be a power of 2 and at least 4 (spec §3.5).
    pub fn new(
        ring_size: usize,
        chunk_size: usize,
        fsi: FilesystemItem,
        provider: Arc<dyn Provider>,
    ) -> ApiResult<Self> {
        if ring_size < 4 || !ring_size.is_power_of_two() {
            return Err(RepertoryError::new(
                ErrorKind::InvalidOperation,
                "ring_size must be a power of 2 and >= 4",
            ));
        }

        let total_chunks = chunk_count(fsi.size, chunk_size);
        let last_chunk_size = last_chunk_size_for(fsi.size, chunk_size);
        let chunk_io = ChunkIo::open_or_create(fsi.source_path.clone(), false)?;
        chunk_io.truncate(ring_size as u64 * chunk_size as u64)?;

        let last_chunk = total_chunks.saturating_sub(1).min(ring_size.saturating_sub(1));

        Ok(Self {
            fsi,
            chunk_size,
            last_chunk_size,
            total_chunks,
            ring_size,
            provider,
            chunk_io,
            state: Mutex::new(State {
                ring_state: Bitset::ones(ring_size),
                first_chunk: 0,
                last_chunk,
                current_chunk: 0,
                active_downloads: HashMap::new(),
                api_error: RepertoryError::success(),
            }),
        })
    }

    pub fn api_path(&self) -> &str {
        &self.fsi.api_path
    }

    pub fn size(&self) -> u64 {
        self.fsi.size
    }

    pub fn is_modified(&self) -> bool {
        false
    }

    pub fn window(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (state.first_chunk, state.current_chunk, state.last_chunk)
    }

    /// True iff slot for `chunk` holds valid (downloaded) data for that
    /// chunk, i.e. `chunk` is inside the window and not invalidated.
    pub fn is_valid(&self, chunk: usize) -> bool {
        let state = self.state.lock();
        chunk >= state.first_chunk
            && chunk <= state.last_chunk
            && !state.ring_state.get(chunk % self.ring_size)
    }

    /// Resets the window; requires `first < total_chunks` and
    /// `current <= last_chunk` (spec §4.4 `set`).
    pub fn set(&self, first: usize, current: usize) -> ApiResult<()> {
        if self.total_chunks > 0 && first >= self.total_chunks {
            return Err(RepertoryError::new(ErrorKind::InvalidOperation, "first out of range"));
        }
        let last = (first + self.ring_size - 1).min(self.total_chunks.saturating_sub(1));
        if current > last {
            return Err(RepertoryError::new(ErrorKind::InvalidOperation, "current past last"));
        }

        let mut state = self.state.lock();
        state.first_chunk = first;
        state.last_chunk = last;
        state.current_chunk = current;
        state.invalidate_all(self.ring_size);
        Ok(())
    }

    /// Advances the window, applying the centering rule (spec §4.4).
    ///
    /// A raw target strictly inside the window (`current_chunk + count <
    /// last_chunk`) just advances `current_chunk` in place. Reaching or
    /// crossing the edge instead recenters the window on the new current
    /// chunk (half the ring behind it, clamped to stay inside
    /// `[0, total_chunks)`), invalidating every slot the window leaves
    /// behind since the same physical slots are what the newly entered
    /// chunks will reuse.
    pub fn forward(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut state = self.state.lock();
        let raw_target = state.current_chunk + count;

        if raw_target < state.last_chunk {
            state.current_chunk = raw_target;
            return;
        }

        let new_current = raw_target.min(self.total_chunks.saturating_sub(1));
        let half = self.ring_size / 2;
        let max_first = self.total_chunks.saturating_sub(self.ring_size);
        let new_first = new_current.saturating_sub(half).min(max_first);
        let new_last = (new_first + self.ring_size - 1).min(self.total_chunks.saturating_sub(1));

        let shift = new_first.saturating_sub(state.first_chunk);
        if shift >= self.ring_size {
            state.invalidate_all(self.ring_size);
        } else {
            for i in state.first_chunk..state.first_chunk + shift {
                state.invalidate_slot(i, self.ring_size);
            }
        }

        state.first_chunk = new_first;
        state.last_chunk = new_last;
        state.current_chunk = new_current.clamp(new_first, new_last);
    }

    /// Symmetric to [`RingBufferOpenFile::forward`]; never centers.
    pub fn reverse(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut state = self.state.lock();
        if count <= state.current_chunk.saturating_sub(state.first_chunk) {
            state.current_chunk -= count;
            return;
        }

        let ahead = state.current_chunk - state.first_chunk;
        let removed = count - ahead;
        let new_current = state.current_chunk.saturating_sub(count);

        if removed >= self.ring_size {
            state.invalidate_all(self.ring_size);
            state.first_chunk = new_current;
            state.last_chunk = (new_current + self.ring_size - 1).min(self.total_chunks.saturating_sub(1));
            state.current_chunk = new_current;
        } else {
            let old_last = state.last_chunk;
            for i in 0..removed {
                state.invalidate_slot(old_last - i, self.ring_size);
            }
            state.first_chunk = state.first_chunk.saturating_sub(removed);
            state.last_chunk -= removed;
            state.current_chunk = new_current;
        }
    }

    /// Downloads chunk `idx` into slot `idx % ring_size` if not already
    /// valid (spec §4.4: "uses `chunk_io` at `(c mod ring_size) *
    /// chunk_size`"). Mirrors `open_file::download_chunk`'s single-flight
    /// protocol (spec testable property 6: no concurrent download per
    /// chunk).
    pub fn download_chunk(&self, idx: usize) -> ApiResult<()> {
        let download = {
            let mut state = self.state.lock();
            if !state.api_error.is_success() {
                return Err(state.api_error.clone());
            }
            if idx < state.first_chunk || idx > state.last_chunk {
                return Ok(());
            }
            if !state.ring_state.get(idx % self.ring_size) {
                return Ok(());
            }
            if let Some(existing) = state.active_downloads.get(&(idx % self.ring_size)).cloned() {
                drop(state);
                let err = existing.wait();
                return if err.is_success() { Ok(()) } else { Err(err) };
            }
            let download = Arc::new(Download::new());
            state.active_downloads.insert(idx % self.ring_size, download.clone());
            download
        };

        let length = if idx + 1 == self.total_chunks {
            self.last_chunk_size
        } else {
            self.chunk_size
        };
        let offset = idx as u64 * self.chunk_size as u64;
        let slot_offset = (idx % self.ring_size) as u64 * self.chunk_size as u64;

        let stop_flag = AtomicBool::new(false);
        let mut buf = vec![0u8; length];
        let result = self
            .provider
            .read_file_bytes(&self.fsi.api_path, length, offset, &mut buf, &stop_flag)
            .and_then(|()| self.chunk_io.write(&buf, slot_offset).map(|_| ()));

        let final_error = match result {
            Ok(()) => {
                let mut state = self.state.lock();
                state.ring_state.set(idx % self.ring_size, false);
                RepertoryError::success()
            }
            Err(e) => {
                let mut state = self.state.lock();
                if state.api_error.is_success() {
                    state.api_error = e.clone();
                }
                e
            }
        };

        self.state.lock().active_downloads.remove(&(idx % self.ring_size));
        download.complete(final_error.clone());

        if final_error.is_success() {
            Ok(())
        } else {
            Err(final_error)
        }
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

    /// Read path (spec §4.4): slides the window to cover each requested
    /// chunk, downloads it, and copies bytes out.
    pub fn read(&self, offset: u64, size: usize, out: &mut Vec<u8>) -> ApiResult<usize> {
        let remaining = self.fsi.size.saturating_sub(offset);
        let read_size = (size as u64).min(remaining) as usize;
        if read_size == 0 {
            out.clear();
            return Ok(0);
        }

        let (begin, end) = self.chunk_range(offset, read_size as u64);
        out.clear();
        out.resize(read_size, 0);

        for chunk in begin..=end {
            let current = self.state.lock().current_chunk;
            if chunk > current {
                self.forward(chunk - current);
            } else if chunk < current {
                self.reverse(current - chunk);
            }
            self.download_chunk(chunk)?;

            let chunk_start = chunk as u64 * self.chunk_size as u64;
            let slot_offset = (chunk % self.ring_size) as u64 * self.chunk_size as u64;
            let want_begin = offset.max(chunk_start);
            let want_end = (offset + read_size as u64).min(chunk_start + self.chunk_size as u64);
            let want_len = (want_end - want_begin) as usize;
            let in_slot_offset = slot_offset + (want_begin - chunk_start);

            let mut buf = vec![0u8; want_len];
            self.chunk_io.read(&mut buf, in_slot_offset)?;
            let out_pos = (want_begin - offset) as usize;
            out[out_pos..out_pos + want_len].copy_from_slice(&buf);
        }

        debug!(api_path = %self.fsi.api_path, offset, read_size, "ring_buffer_open_file read");
        Ok(read_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProvider;
    use tempfile::tempdir;

    fn new_ring(total_size: u64, chunk_size: usize, ring_size: usize) -> (RingBufferOpenFile, Arc<FakeProvider>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let provider = Arc::new(FakeProvider::new());
        let data: Vec<u8> = (0..total_size).map(|i| (i % 251) as u8).collect();
        provider.seed_file("/f", data);

        let source_path = dir.path().join("ring").to_str().unwrap().to_string();
        let fsi = FilesystemItem::new_file("/f", "/", total_size, source_path);
        let rb = RingBufferOpenFile::new(ring_size, chunk_size, fsi, provider.clone()).unwrap();
        (rb, provider, dir)
    }

    #[test]
    fn construction_computes_total_chunks_and_initial_window() {
        let (rb, _p, _dir) = new_ring(16 * 1024, 1024, 8);
        assert_eq!(rb.total_chunks, 16);
        let (first, current, last) = rb.window();
        assert_eq!((first, current), (0, 0));
        assert_eq!(last, 7);
    }

    #[test]
    fn long_jump_forward_invalidates_everything_and_clamps_to_total() {
        let (rb, _p, _dir) = new_ring(16 * 1024, 1024, 8);
        rb.set(0, 0).unwrap();
        rb.forward(100);
        let (first, current, last) = rb.window();
        assert_eq!(current, 15);
        assert_eq!(last, 15);
        assert_eq!(first, 8);
        for c in first..=last {
            assert!(!rb.is_valid(c));
        }
    }

    #[test]
    fn forward_within_window_just_advances_current() {
        let (rb, _p, _dir) = new_ring(16 * 1024, 1024, 8);
        rb.set(0, 0).unwrap();
        rb.forward(3);
        let (first, current, last) = rb.window();
        assert_eq!((first, current, last), (0, 3, 7));
    }

    #[test]
    fn forward_touching_window_edge_slides_and_invalidates_vacated_slots() {
        let (rb, _p, _dir) = new_ring(16 * 1024, 1024, 8);
        rb.set(0, 3).unwrap();
        rb.download_chunk(0).unwrap();
        rb.download_chunk(1).unwrap();
        rb.download_chunk(2).unwrap();
        assert!(rb.is_valid(0));
        assert!(rb.is_valid(1));
        assert!(rb.is_valid(2));

        rb.forward(4);
        let (first, current, last) = rb.window();
        assert_eq!((first, current, last), (3, 7, 10));

        // Slots 0..2 held the chunks the window just vacated; the physical
        // slots they occupied (idx % ring_size) are what chunks 8..10 now
        // reuse, so they must come back invalid even though they were
        // downloaded a moment ago.
        for slot in 0..=2usize {
            assert!(rb.state.lock().ring_state.get(slot));
        }
    }

    #[test]
    fn reverse_within_window_just_retreats_current() {
        let (rb, _p, _dir) = new_ring(16 * 1024, 1024, 8);
        rb.set(0, 5).unwrap();
        rb.reverse(2);
        let (first, current, last) = rb.window();
        assert_eq!((first, current, last), (0, 3, 7));
    }

    #[test]
    fn read_downloads_covered_chunks_and_returns_correct_bytes() {
        let (rb, provider, _dir) = new_ring(16 * 1024, 1024, 8);
        let mut out = Vec::new();
        let n = rb.read(0, 2048, &mut out).unwrap();
        assert_eq!(n, 2048);
        assert_eq!(provider.read_call_count(), 2);

        let mut expected = Vec::new();
        for i in 0..2048u64 {
            expected.push((i % 251) as u8);
        }
        assert_eq!(out, expected);
    }

    #[test]
    fn read_past_window_slides_and_invalidates_stale_slots() {
        let (rb, _provider, _dir) = new_ring(32 * 1024, 1024, 8);
        let mut out = Vec::new();
        rb.read(0, 1024, &mut out).unwrap();
        assert!(rb.is_valid(0));

        rb.read(20 * 1024, 1024, &mut out).unwrap();
        assert!(!rb.is_valid(0));
        assert!(rb.is_valid(20));
    }
}
