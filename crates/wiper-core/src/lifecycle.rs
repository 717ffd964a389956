//! Mutex + condition variable flags shared between component threads.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Up,
    Down,
}

/// One-shot flag that moves Idle -> Up -> Down and never back.
///
/// Lowering an Idle flag goes straight to Down so a component stopped before
/// it started never runs.
#[derive(Debug)]
pub struct LifecycleFlag {
    phase: Mutex<Phase>,
    cond: Condvar,
}

impl LifecycleFlag {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Idle),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> Phase {
        *self.lock()
    }

    /// Returns true if this call moved the flag from Idle to Up.
    pub fn raise(&self) -> bool {
        let mut phase = self.lock();
        if *phase != Phase::Idle {
            return false;
        }
        *phase = Phase::Up;
        self.cond.notify_all();
        true
    }

    /// Returns true if this call moved the flag to Down.
    pub fn lower(&self) -> bool {
        let mut phase = self.lock();
        if *phase == Phase::Down {
            return false;
        }
        *phase = Phase::Down;
        self.cond.notify_all();
        true
    }

    pub fn is_up(&self) -> bool {
        self.phase() == Phase::Up
    }

    pub fn is_down(&self) -> bool {
        self.phase() == Phase::Down
    }

    /// Blocks until the flag is Down or the timeout elapses. Returns true if Down.
    pub fn wait_for_down(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |phase| *phase != Phase::Down)
            .unwrap_or_else(PoisonError::into_inner);
        *guard == Phase::Down
    }
}

impl Default for LifecycleFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Boolean that may toggle any number of times, with waiters.
#[derive(Debug)]
pub struct WaitFlag {
    value: Mutex<bool>,
    cond: Condvar,
}

impl WaitFlag {
    pub fn new(initial: bool) -> Self {
        Self {
            value: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `value`, wakes all waiters and returns the previous value.
    pub fn set(&self, value: bool) -> bool {
        let mut guard = self.lock();
        let previous = *guard;
        *guard = value;
        self.cond.notify_all();
        previous
    }

    pub fn get(&self) -> bool {
        *self.lock()
    }

    /// Wakes waiters without changing the value so they re-check external state.
    pub fn wake(&self) {
        let _guard = self.lock();
        self.cond.notify_all();
    }

    /// Blocks until `done` returns true for the current value.
    ///
    /// `done` runs with the flag's lock held; anything else it reads must be
    /// changed before the writer calls [`WaitFlag::wake`].
    pub fn wait_until<F>(&self, mut done: F) -> bool
    where
        F: FnMut(bool) -> bool,
    {
        let guard = self.lock();
        let guard = self
            .cond
            .wait_while(guard, |value| !done(*value))
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    /// Like [`WaitFlag::wait_until`] but gives up after `timeout`.
    /// Returns `None` on timeout.
    pub fn wait_timeout_until<F>(&self, timeout: Duration, mut done: F) -> Option<bool>
    where
        F: FnMut(bool) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        loop {
            if done(*guard) {
                return Some(*guard);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            guard = self
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl Default for WaitFlag {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lifecycle_transitions_once() {
        let flag = LifecycleFlag::new();
        assert!(flag.raise());
        assert!(!flag.raise());
        assert!(flag.is_up());
        assert!(flag.lower());
        assert!(!flag.lower());
        assert!(!flag.raise());
        assert!(flag.is_down());
    }

    #[test]
    fn lowering_idle_flag_skips_up() {
        let flag = LifecycleFlag::new();
        assert!(flag.lower());
        assert!(!flag.raise());
        assert_eq!(flag.phase(), Phase::Down);
    }

    #[test]
    fn wait_for_down_wakes_on_lower() {
        let flag = Arc::new(LifecycleFlag::new());
        flag.raise();
        let waiter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || flag.wait_for_down(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        flag.lower();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_for_down_times_out() {
        let flag = LifecycleFlag::new();
        flag.raise();
        assert!(!flag.wait_for_down(Duration::from_millis(10)));
    }

    #[test]
    fn wait_flag_toggles_and_wakes() {
        let flag = Arc::new(WaitFlag::new(false));
        let waiter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || flag.wait_until(|v| v))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!flag.set(true));
        assert!(waiter.join().unwrap());
        assert!(flag.set(false));
        assert!(!flag.get());
    }

    #[test]
    fn wait_timeout_until_reports_timeout() {
        let flag = WaitFlag::new(false);
        assert_eq!(flag.wait_timeout_until(Duration::from_millis(10), |v| v), None);
        flag.set(true);
        assert_eq!(
            flag.wait_timeout_until(Duration::from_millis(10), |v| v),
            Some(true)
        );
    }
}
