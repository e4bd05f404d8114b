//! Cooperative wait primitive.
//!
//! One [`WaitGate`] belongs to each runnable. Agent code parks its own
//! thread in it; any other thread releases it. Closing the gate (done by
//! the runnable when the agent stops) releases every parked thread and
//! makes later parks return at once, so a stopped agent cannot stay parked.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct GateState {
    waiting: bool,
    closed: bool,
}

/// Mutex + condition variable wait gate.
#[derive(Debug, Default)]
pub struct WaitGate {
    state: Mutex<GateState>,
    released: Condvar,
}

impl WaitGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block the calling thread until [`WaitGate::unpark`] or close.
    pub fn park(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.waiting = true;
        while state.waiting && !state.closed {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.waiting = false;
    }

    /// Release every parked thread. No effect if nobody is parked.
    pub fn unpark(&self) {
        let mut state = self.lock();
        state.waiting = false;
        self.released.notify_all();
    }

    pub fn is_waiting(&self) -> bool {
        self.lock().waiting
    }

    pub(crate) fn open(&self) {
        self.lock().closed = false;
    }

    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.waiting = false;
        self.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for(gate: &WaitGate, waiting: bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while gate.is_waiting() != waiting {
            assert!(Instant::now() < deadline, "gate never reached waiting={}", waiting);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_park_until_unpark() {
        let gate = Arc::new(WaitGate::new());
        let parked = Arc::clone(&gate);
        let handle = thread::spawn(move || parked.park());

        wait_for(&gate, true);
        gate.unpark();
        handle.join().unwrap();
        assert!(!gate.is_waiting());
    }

    #[test]
    fn test_unpark_releases_all_waiters() {
        let gate = Arc::new(WaitGate::new());
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let parked = Arc::clone(&gate);
                thread::spawn(move || parked.park())
            })
            .collect();

        wait_for(&gate, true);
        // let the others reach the condvar as well
        thread::sleep(Duration::from_millis(50));
        gate.unpark();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_closed_gate_never_blocks() {
        let gate = WaitGate::new();
        gate.close();
        gate.park();
        assert!(!gate.is_waiting());

        gate.open();
        let gate = Arc::new(gate);
        let parked = Arc::clone(&gate);
        let handle = thread::spawn(move || parked.park());
        wait_for(&gate, true);
        gate.close();
        handle.join().unwrap();
    }
}
