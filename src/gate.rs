//! Rendezvous signals ordering a writer transaction against the driver.
//!
//! A [`Signal`] is a counting semaphore that starts with zero permits. The
//! writer acquires, the driver releases; every acquire consumes exactly one
//! earlier release.

use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::errors::{IsoprobeError, Result};

#[derive(Debug, Default)]
struct SignalState {
    permits: usize,
    waiters: usize,
    interrupted: bool,
}

/// A named counting signal with zero initial permits.
#[derive(Debug)]
pub struct Signal {
    name: &'static str,
    state: Mutex<SignalState>,
    available: Condvar,
}

impl Signal {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(SignalState::default()),
            available: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Adds one permit and wakes one waiter. Never blocks.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.permits += 1;
        debug!("signal '{}' released ({} available)", self.name, state.permits);
        drop(state);
        self.available.notify_one();
    }

    /// Blocks until a permit is available and consumes it.
    ///
    /// Fails with [`IsoprobeError::InterruptedWait`] once the signal has been
    /// interrupted, even if permits remain.
    pub fn acquire(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            self.check_interrupted(&state)?;
            if state.permits > 0 {
                state.permits -= 1;
                return Ok(());
            }
            state.waiters += 1;
            self.available.wait(&mut state);
            state.waiters -= 1;
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    /// Returns `Ok(false)` when no permit arrived in time.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            self.check_interrupted(&state)?;
            if state.permits > 0 {
                state.permits -= 1;
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            state.waiters += 1;
            self.available.wait_until(&mut state, deadline);
            state.waiters -= 1;
        }
    }

    /// Fails every current and future acquire with `InterruptedWait`.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        if !state.interrupted {
            state.interrupted = true;
            if state.waiters > 0 {
                warn!(
                    "signal '{}' interrupted with {} waiter(s)",
                    self.name, state.waiters
                );
            }
        }
        drop(state);
        self.available.notify_all();
    }

    pub fn available_permits(&self) -> usize {
        self.state.lock().permits
    }

    /// Number of threads currently blocked in an acquire.
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters
    }

    fn check_interrupted(&self, state: &SignalState) -> Result<()> {
        if state.interrupted {
            return Err(IsoprobeError::InterruptedWait(format!(
                "signal '{}' interrupted",
                self.name
            )));
        }
        Ok(())
    }
}

/// The signals shared by one writer operation and the driver.
#[derive(Debug)]
pub struct RendezvousGate {
    /// Released by the driver once it has read the pre-write state.
    pub started: Signal,
    /// Released by the driver once it has finished observing; lets the writer commit.
    pub flushed: Signal,
    /// Released by the writer right after its flush reached the table.
    pub flush_point: Signal,
}

impl Default for RendezvousGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RendezvousGate {
    pub fn new() -> Self {
        Self {
            started: Signal::new("started"),
            flushed: Signal::new("flushed"),
            flush_point: Signal::new("flush_point"),
        }
    }

    /// Interrupts all three signals, so a writer parked at any checkpoint aborts.
    pub fn interrupt_all(&self) {
        self.started.interrupt();
        self.flushed.interrupt();
        self.flush_point.interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn wait_for_waiters(signal: &Signal, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while signal.waiters() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(signal.waiters(), count);
    }

    #[test]
    fn release_before_acquire_is_consumed_once() {
        let signal = Signal::new("started");
        signal.release();
        assert_eq!(signal.available_permits(), 1);
        signal.acquire().unwrap();
        assert_eq!(signal.available_permits(), 0);
        assert!(!signal.acquire_timeout(Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn acquire_blocks_until_release() {
        let signal = Arc::new(Signal::new("flushed"));
        let waiter_signal = Arc::clone(&signal);
        let waiter = thread::spawn(move || waiter_signal.acquire());

        wait_for_waiters(&signal, 1);
        assert!(!waiter.is_finished());

        signal.release();
        waiter.join().unwrap().unwrap();
        assert_eq!(signal.available_permits(), 0);
    }

    #[test]
    fn one_release_unblocks_exactly_one_waiter() {
        let signal = Arc::new(Signal::new("started"));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let s = Arc::clone(&signal);
                thread::spawn(move || s.acquire_timeout(Duration::from_millis(500)))
            })
            .collect();
        wait_for_waiters(&signal, 2);

        signal.release();
        let acquired: Vec<bool> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        assert_eq!(acquired.iter().filter(|a| **a).count(), 1);
    }

    #[test]
    fn interrupt_fails_blocked_acquire() {
        let gate = Arc::new(RendezvousGate::new());
        let waiter_gate = Arc::clone(&gate);
        let waiter = thread::spawn(move || waiter_gate.flushed.acquire());

        wait_for_waiters(&gate.flushed, 1);
        gate.interrupt_all();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(IsoprobeError::InterruptedWait(_))));
        assert!(gate.started.acquire().is_err());
    }
}
