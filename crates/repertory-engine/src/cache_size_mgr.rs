//! Global admission control over local cache bytes (spec §4.1).
//!
//! A single mutex-guarded counter shared by every `open_file`/
//! `ring_buffer_open_file` in the process. Accounting is advisory, not
//! byte-accurate on the filesystem: cache files grow in block
//! increments, so the engine keeps logical-byte accounting and relies on
//! eviction to reconcile (spec §4.1 design choice).

use parking_lot::{Condvar, Mutex};

use repertory_core::error::{ApiResult, ErrorKind, RepertoryError};

struct State {
    used: u64,
    max: u64,
    shutting_down: bool,
}

/// Process-wide cache-byte admission counter.
pub struct CacheSizeMgr {
    state: Mutex<State>,
    changed: Condvar,
}

impl CacheSizeMgr {
    pub fn new(max: u64) -> Self {
        Self {
            state: Mutex::new(State {
                used: 0,
                max,
                shutting_down: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Blocks until `used + n <= max`, then commits the growth. Returns
    /// an error only if [`CacheSizeMgr::shutdown`] has been called.
    pub fn expand(&self, n: u64) -> ApiResult<()> {
        let mut state = self.state.lock();
        loop {
            if state.shutting_down {
                return Err(RepertoryError::new(
                    ErrorKind::DownloadStopped,
                    "cache_size_mgr is shutting down",
                ));
            }
            if state.used.saturating_add(n) <= state.max {
                state.used += n;
                return Ok(());
            }
            self.changed.wait(&mut state);
        }
    }

    /// Releases `n` bytes, never underflowing below zero, and wakes every
    /// waiter in [`CacheSizeMgr::expand`].
    pub fn shrink(&self, n: u64) {
        let mut state = self.state.lock();
        state.used = state.used.saturating_sub(n);
        self.changed.notify_all();
    }

    /// Updates the cap; a blocked grower may now proceed.
    pub fn set_max(&self, n: u64) {
        let mut state = self.state.lock();
        state.max = n;
        self.changed.notify_all();
    }

    pub fn used(&self) -> u64 {
        self.state.lock().used
    }

    pub fn max(&self) -> u64 {
        self.state.lock().max
    }

    /// Unblocks every waiter in `expand` with an error; subsequent calls
    /// also fail immediately.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutting_down = true;
        self.changed.notify_all();
    }
}
