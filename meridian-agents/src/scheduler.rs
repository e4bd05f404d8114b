//! One-shot schedule timers.
//!
//! Each armed schedule owns one sleeping thread. A timer fires once; the
//! callback is expected to re-arm the next occurrence, so recurring
//! schedules become a chain of one-shot timers. Arming a sid that is
//! already armed replaces the pending timer.

use meridian_core::{AgentError, Sid, StationResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Default)]
struct Timer {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl Timer {
    fn cancel(&self) {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    /// Sleep until `deadline`. Returns false if cancelled first.
    fn sleep_until(&self, deadline: Instant) -> bool {
        let mut cancelled = self.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *cancelled {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            cancelled = self
                .wake
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

type TimerTable = Mutex<HashMap<Sid, Arc<Timer>>>;

/// Set of pending schedule timers, keyed by instance sid.
#[derive(Default)]
pub struct ScheduleTimers {
    timers: Arc<TimerTable>,
    closed: AtomicBool,
}

fn table(timers: &TimerTable) -> MutexGuard<'_, HashMap<Sid, Arc<Timer>>> {
    timers.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScheduleTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fire` once after `delay` unless cancelled or replaced first.
    pub fn arm<F>(&self, sid: Sid, delay: Duration, fire: F) -> StationResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(AgentError::ShuttingDown.into());
        }

        let timer = Arc::new(Timer::default());
        if let Some(previous) = table(&self.timers).insert(sid, Arc::clone(&timer)) {
            previous.cancel();
        }

        let timers = Arc::clone(&self.timers);
        let deadline = Instant::now() + delay;
        let spawned = thread::Builder::new()
            .name(format!("schedule-{}", sid))
            .spawn({
                let timer = Arc::clone(&timer);
                move || {
                    if !timer.sleep_until(deadline) {
                        return;
                    }
                    {
                        let mut table = table(&timers);
                        match table.get(&sid) {
                            Some(current) if Arc::ptr_eq(current, &timer) => {
                                table.remove(&sid);
                            }
                            _ => return,
                        }
                    }
                    debug!(sid, "Schedule timer fired");
                    fire();
                }
            });

        if let Err(e) = spawned {
            let mut table = table(&self.timers);
            if table.get(&sid).is_some_and(|t| Arc::ptr_eq(t, &timer)) {
                table.remove(&sid);
            }
            return Err(AgentError::SpawnFailed {
                agent: format!("schedule-{}", sid),
                reason: e.to_string(),
            }
            .into());
        }
        debug!(sid, delay_ms = delay.as_millis() as u64, "Schedule timer armed");
        Ok(())
    }

    /// Cancel the pending timer of `sid`. Returns false if none was armed.
    pub fn cancel(&self, sid: Sid) -> bool {
        match table(&self.timers).remove(&sid) {
            Some(timer) => {
                timer.cancel();
                debug!(sid, "Schedule timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, sid: Sid) -> bool {
        table(&self.timers).contains_key(&sid)
    }

    pub fn armed_count(&self) -> usize {
        table(&self.timers).len()
    }

    /// Cancel every timer and refuse new ones.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        for (_, timer) in table(&self.timers).drain() {
            timer.cancel();
        }
    }
}
