//! Three-bucket scheduler (spec §4.8): `high`/`medium`/`low` frequency
//! callbacks, driven by one background thread on a short tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use repertory_core::config::PollingConfig;

/// Which of the three configured intervals a callback runs at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frequency {
    High,
    Medium,
    Low,
}

type Callback = Box<dyn Fn() + Send + Sync>;

struct Entry {
    freq: Frequency,
    callback: Callback,
    last_run: Instant,
}

struct State {
    entries: HashMap<String, Entry>,
    stopping: bool,
}

/// Process-wide periodic-callback scheduler.
pub struct Polling {
    config: PollingConfig,
    state: Mutex<State>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

const TICK: Duration = Duration::from_millis(250);

impl Polling {
    pub fn new(config: PollingConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(State {
                entries: HashMap::new(),
                stopping: false,
            }),
            handle: Mutex::new(None),
        })
    }

    /// Registers (or replaces) a named callback at the given frequency.
    pub fn set_callback(&self, name: impl Into<String>, freq: Frequency, callback: Callback) {
        let mut state = self.state.lock();
        state.entries.insert(
            name.into(),
            Entry {
                freq,
                callback,
                last_run: Instant::now() - Duration::from_secs(3600),
            },
        );
    }

    pub fn remove_callback(&self, name: &str) {
        self.state.lock().entries.remove(name);
    }

    fn interval_for(&self, freq: Frequency) -> Duration {
        let secs = match freq {
            Frequency::High => self.config.high_freq_secs,
            Frequency::Medium => self.config.medium_freq_secs,
            Frequency::Low => self.config.low_freq_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    /// Runs every due callback once, regardless of elapsed time. Exposed
    /// directly so tests can drive the scheduler without sleeping.
    pub fn run_due(&self) {
        let due: Vec<String> = {
            let state = self.state.lock();
            state
                .entries
                .iter()
                .filter(|(_, e)| e.last_run.elapsed() >= self.interval_for(e.freq))
                .map(|(name, _)| name.clone())
                .collect()
        };

        for name in due {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(&name) else {
                continue;
            };
            entry.last_run = Instant::now();
            drop(state);

            trace!(name, "polling callback firing");
            let state = self.state.lock();
            if let Some(entry) = state.entries.get(&name) {
                (entry.callback)();
            }
        }
    }

    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let this = self.clone();
        *handle = Some(std::thread::spawn(move || {
            loop {
                if this.state.lock().stopping {
                    return;
                }
                this.run_due();
                std::thread::sleep(TICK);
            }
        }));
        debug!("polling started");
    }

    pub fn stop(&self) {
        self.state.lock().stopping = true;
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        debug!("polling stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cfg() -> PollingConfig {
        PollingConfig {
            high_freq_secs: 0,
            medium_freq_secs: 0,
            low_freq_secs: 0,
        }
    }

    #[test]
    fn run_due_fires_newly_registered_callback() {
        let polling = Polling::new(cfg());
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        polling.set_callback("x", Frequency::High, Box::new(move || {
            c2.fetch_add(1, Ordering::SeqCst);
        }));
        polling.run_due();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_callback_stops_future_firing() {
        let polling = Polling::new(cfg());
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        polling.set_callback("x", Frequency::Low, Box::new(move || {
            c2.fetch_add(1, Ordering::SeqCst);
        }));
        polling.remove_callback("x");
        polling.run_due();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn start_then_stop_joins_cleanly() {
        let polling = Polling::new(PollingConfig {
            high_freq_secs: 1,
            medium_freq_secs: 5,
            low_freq_secs: 30,
        });
        polling.start();
        std::thread::sleep(Duration::from_millis(10));
        polling.stop();
    }
}
