//! Deadline supervision for reactor handlers.
//!
//! The reactor arms the watchdog before every handler call and disarms it
//! after. If a handler overruns the 2-second deadline, the watchdog thread
//! assumes the reactor is wedged on an allocation stall and kills the
//! highest-adjustment live process it can find, reading the registry under
//! the shared lock and only flipping validity flags (removal stays with the
//! reactor).

use crate::reaper::Reaper;
use crate::registry::Registry;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// Handler deadline.
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(2);

struct State {
    deadline: Option<Instant>,
    generation: u64,
    shutdown: bool,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// The watchdog timer thread.
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl Watchdog {
    /// Spawn the watchdog; `on_expiry` runs on the watchdog thread each time
    /// a deadline passes while still armed.
    pub fn spawn<F>(on_expiry: F) -> std::io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let inner = Arc::new(Inner {
            state: Mutex::new(State { deadline: None, generation: 0, shutdown: false }),
            cond: Condvar::new(),
        });

        let thread_inner = Arc::clone(&inner);
        thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || watchdog_loop(thread_inner, on_expiry))?;

        Ok(Self { inner })
    }

    /// Arm the deadline for the handler about to run.
    pub fn start(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.deadline = Some(Instant::now() + WATCHDOG_TIMEOUT);
        state.generation += 1;
        self.inner.cond.notify_one();
    }

    /// Disarm after the handler returned.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.deadline = None;
        self.inner.cond.notify_one();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.shutdown = true;
        self.inner.cond.notify_one();
    }
}

fn watchdog_loop<F: Fn()>(inner: Arc<Inner>, on_expiry: F) {
    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        if state.shutdown {
            return;
        }
        match state.deadline {
            None => {
                state = inner.cond.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            Some(deadline) => {
                let now = Instant::now();
                if now < deadline {
                    let (guard, _) = inner
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    state = guard;
                    continue;
                }
                // Deadline passed while armed. Run the callback unlocked so
                // it can take the registry lock.
                let generation = state.generation;
                state.deadline = None;
                drop(state);
                tracing::warn!("watchdog timed out");
                on_expiry();
                state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                // A handler that finished meanwhile re-arms normally; stale
                // deadlines from the handled generation stay cleared.
                if state.generation != generation {
                    continue;
                }
            }
        }
    }
}

/// Kill the first live process found walking buckets from the top.
///
/// Runs on the watchdog thread: shared registry lock only, records are
/// invalidated rather than removed. Returns the killed pid, if any.
pub fn emergency_kill(registry: &RwLock<Registry>, reaper: &Reaper) -> Option<i32> {
    use rustix::fd::AsFd;

    let guard = registry.read().unwrap_or_else(|e| e.into_inner());
    for adj in (0..=crate::OOM_SCORE_ADJ_MAX).rev() {
        let mut candidate = guard.tail(adj);
        while let Some(record) = candidate {
            if record.is_valid()
                && reaper.kill(record.pid, record.pidfd.as_ref().map(|fd| fd.as_fd())).is_ok()
            {
                tracing::warn!(
                    pid = record.pid,
                    oom_score_adj = adj,
                    "watchdog killed process"
                );
                record.invalidate();
                return Some(record.pid);
            }
            candidate = guard.next_candidate(adj, record.pid);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_watchdog_fires_on_overrun() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);
        let watchdog = Watchdog::spawn(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        watchdog.start();
        // Shorten the wait by never stopping; the deadline is 2s.
        thread::sleep(WATCHDOG_TIMEOUT + Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        watchdog.stop();
    }

    #[test]
    fn test_watchdog_stop_prevents_firing() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);
        let watchdog = Watchdog::spawn(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        for _ in 0..5 {
            watchdog.start();
            watchdog.stop();
        }
        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
