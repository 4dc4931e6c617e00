//! One-shot completion object: a single writer/many-readers notification
//! carrying a final `api_error` (spec §2, §4.3.2).

use parking_lot::{Condvar, Mutex};

use repertory_core::error::RepertoryError;

/// Represents one in-flight chunk download. Installed into
/// `open_file::active_downloads` while a provider read is outstanding;
/// every waiter observes the same final error.
pub struct Download {
    state: Mutex<Option<RepertoryError>>,
    done: Condvar,
}

impl Download {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    /// Completes the download with `error`; wakes every waiter. Calling
    /// this more than once is a programming error but harmlessly
    /// overwrites the result, matching "exactly one thread performs the
    /// provider read" (spec §4.3.2 ordering guarantee).
    pub fn complete(&self, error: RepertoryError) {
        let mut state = self.state.lock();
        *state = Some(error);
        self.done.notify_all();
    }

    /// Blocks until [`Download::complete`] is called, then returns the
    /// final error.
    pub fn wait(&self) -> RepertoryError {
        let mut state = self.state.lock();
        while state.is_none() {
            self.done.wait(&mut state);
        }
        state.clone().unwrap()
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().is_some()
    }
}

impl Default for Download {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repertory_core::error::ErrorKind;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_returns_the_completed_error() {
        let download = Arc::new(Download::new());
        let d2 = download.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            d2.complete(RepertoryError::success());
        });

        let result = download.wait();
        handle.join().unwrap();
        assert!(result.is_success());
    }

    #[test]
    fn many_waiters_see_the_same_error() {
        let download = Arc::new(Download::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let d = download.clone();
                thread::spawn(move || d.wait().kind())
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        download.complete(RepertoryError::new(ErrorKind::DownloadFailed, "boom"));

        for w in waiters {
            assert_eq!(w.join().unwrap(), ErrorKind::DownloadFailed);
        }
    }

    #[test]
    fn is_complete_reflects_state() {
        let download = Download::new();
        assert!(!download.is_complete());
        download.complete(RepertoryError::success());
        assert!(download.is_complete());
    }
}
