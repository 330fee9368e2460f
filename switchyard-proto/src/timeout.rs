//! One-shot, cancelable timeouts over an injected timer backend.

use crate::TimeoutError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::debug;

pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Identifies one armed timer within its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// The two timer primitives a runtime must supply.
///
/// Cancelling a handle whose callback already ran must be a no-op.
pub trait TimerBackend: Send + Sync {
    fn arm(&self, delay: Duration, callback: TimerCallback) -> Result<TimerHandle, TimeoutError>;
    fn cancel(&self, handle: TimerHandle);
}

/// Why a timeout reached its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Elapsed,
    Forced,
}

impl Expiry {
    pub fn is_forced(self) -> bool {
        self == Expiry::Forced
    }
}

#[derive(Debug)]
enum TimerState {
    Idle,
    /// The handle is `None` only while the backend is being armed.
    Armed(Option<TimerHandle>),
    Reached,
}

struct Shared {
    state: Mutex<TimerState>,
    on_reach: Box<dyn Fn(Expiry) + Send + Sync>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn elapsed(&self) {
        {
            let mut state = self.state();
            if !matches!(*state, TimerState::Armed(_)) {
                return;
            }
            *state = TimerState::Reached;
        }
        (self.on_reach)(Expiry::Elapsed);
    }
}

/// A one-shot timer whose callback runs exactly once per start, either when
/// the delay elapses or immediately on [`Timeout::force_stop`].
pub struct Timeout {
    delay: Duration,
    backend: Arc<dyn TimerBackend>,
    shared: Arc<Shared>,
}

impl Timeout {
    pub fn new<F>(backend: Arc<dyn TimerBackend>, delay: Duration, on_reach: F) -> Self
    where
        F: Fn(Expiry) + Send + Sync + 'static,
    {
        Self {
            delay,
            backend,
            shared: Arc::new(Shared {
                state: Mutex::new(TimerState::Idle),
                on_reach: Box::new(on_reach),
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.shared.state(), TimerState::Armed(_))
    }

    pub fn is_reached(&self) -> bool {
        matches!(*self.shared.state(), TimerState::Reached)
    }

    pub fn start(&self) -> Result<(), TimeoutError> {
        {
            let mut state = self.shared.state();
            if matches!(*state, TimerState::Armed(_)) {
                return Err(TimeoutError::AlreadyRunning);
            }
            *state = TimerState::Armed(None);
        }

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let armed = self.backend.arm(
            self.delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.elapsed();
                }
            }),
        );

        let mut state = self.shared.state();
        match armed {
            Ok(handle) => {
                if let TimerState::Armed(slot @ None) = &mut *state {
                    *slot = Some(handle);
                }
                debug!("Timeout armed for {:?}", self.delay);
                Ok(())
            }
            Err(e) => {
                *state = TimerState::Idle;
                Err(e)
            }
        }
    }

    /// Cancels the timer and runs the callback now, flagged as forced.
    pub fn force_stop(&self) -> Result<(), TimeoutError> {
        let handle = {
            let mut state = self.shared.state();
            let TimerState::Armed(handle) = *state else {
                return Err(TimeoutError::NotRunning);
            };
            *state = TimerState::Reached;
            handle
        };

        if let Some(handle) = handle {
            self.backend.cancel(handle);
        }
        (self.shared.on_reach)(Expiry::Forced);
        Ok(())
    }

    /// Returns a finished timeout to its never-started state.
    pub fn reset(&self) -> Result<(), TimeoutError> {
        let mut state = self.shared.state();
        if matches!(*state, TimerState::Armed(_)) {
            return Err(TimeoutError::StillRunning);
        }
        *state = TimerState::Idle;
        Ok(())
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        let handle = {
            let mut state = self.shared.state();
            match std::mem::replace(&mut *state, TimerState::Idle) {
                TimerState::Armed(handle) => handle,
                _ => None,
            }
        };
        if let Some(handle) = handle {
            self.backend.cancel(handle);
        }
    }
}

impl std::fmt::Debug for Timeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeout")
            .field("delay", &self.delay)
            .field("state", &*self.shared.state())
            .finish()
    }
}

/// A timer backend fired by hand from tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct ManualTimers {
    next_id: std::sync::atomic::AtomicU64,
    pending: Mutex<Vec<(TimerHandle, TimerCallback)>>,
    cancelled: Mutex<Vec<TimerHandle>>,
}

#[cfg(test)]
impl ManualTimers {
    pub(crate) fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub(crate) fn cancelled(&self) -> Vec<TimerHandle> {
        self.cancelled.lock().unwrap().clone()
    }

    /// Runs every pending callback, as if all delays elapsed at once.
    pub(crate) fn fire_all(&self) {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        for (_, callback) in pending {
            callback();
        }
    }
}

#[cfg(test)]
impl TimerBackend for ManualTimers {
    fn arm(&self, _delay: Duration, callback: TimerCallback) -> Result<TimerHandle, TimeoutError> {
        let handle = TimerHandle(
            self.next_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        );
        self.pending.lock().unwrap().push((handle, callback));
        Ok(handle)
    }

    fn cancel(&self, handle: TimerHandle) {
        self.pending.lock().unwrap().retain(|(pending, _)| *pending != handle);
        self.cancelled.lock().unwrap().push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(timers: &Arc<ManualTimers>) -> (Timeout, Arc<Mutex<Vec<Expiry>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let timeout = Timeout::new(timers.clone(), Duration::from_secs(5), move |expiry| {
            sink.lock().unwrap().push(expiry);
        });
        (timeout, fired)
    }

    #[test]
    fn test_natural_expiry_fires_once() {
        let timers = Arc::new(ManualTimers::default());
        let (timeout, fired) = recording(&timers);

        timeout.start().unwrap();
        assert!(timeout.is_running());
        timers.fire_all();

        assert_eq!(*fired.lock().unwrap(), vec![Expiry::Elapsed]);
        assert!(timeout.is_reached());
        assert_eq!(timeout.force_stop(), Err(TimeoutError::NotRunning));
    }

    #[test]
    fn test_start_twice_fails() {
        let timers = Arc::new(ManualTimers::default());
        let (timeout, _) = recording(&timers);

        timeout.start().unwrap();
        assert_eq!(timeout.start(), Err(TimeoutError::AlreadyRunning));
        assert_eq!(timers.pending(), 1);
    }

    #[test]
    fn test_force_stop_unarmed_fails() {
        let timers = Arc::new(ManualTimers::default());
        let (timeout, fired) = recording(&timers);

        assert_eq!(timeout.force_stop(), Err(TimeoutError::NotRunning));
        assert!(fired.lock().unwrap().is_empty());
    }

    #[test]
    fn test_force_stop_prevents_natural_expiry() {
        let timers = Arc::new(ManualTimers::default());
        let (timeout, fired) = recording(&timers);

        timeout.start().unwrap();
        timeout.force_stop().unwrap();
        assert_eq!(timers.cancelled(), vec![TimerHandle(0)]);

        timers.fire_all();
        assert_eq!(*fired.lock().unwrap(), vec![Expiry::Forced]);
    }

    #[test]
    fn test_stale_callback_after_force_stop_is_ignored() {
        struct Leaky(Mutex<Vec<TimerCallback>>);
        impl TimerBackend for Leaky {
            fn arm(&self, _: Duration, callback: TimerCallback) -> Result<TimerHandle, TimeoutError> {
                self.0.lock().unwrap().push(callback);
                Ok(TimerHandle(7))
            }
            // Too late to cancel; the callback fires anyway.
            fn cancel(&self, _: TimerHandle) {}
        }

        let backend = Arc::new(Leaky(Mutex::new(Vec::new())));
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let timeout = Timeout::new(backend.clone(), Duration::from_secs(1), move |expiry| {
            sink.lock().unwrap().push(expiry);
        });

        timeout.start().unwrap();
        timeout.force_stop().unwrap();
        for callback in backend.0.lock().unwrap().drain(..) {
            callback();
        }
        assert_eq!(*fired.lock().unwrap(), vec![Expiry::Forced]);
    }

    #[test]
    fn test_reset_allows_reuse() {
        let timers = Arc::new(ManualTimers::default());
        let (timeout, fired) = recording(&timers);

        timeout.start().unwrap();
        assert_eq!(timeout.reset(), Err(TimeoutError::StillRunning));
        timers.fire_all();

        timeout.reset().unwrap();
        assert!(!timeout.is_reached());
        timeout.start().unwrap();
        timers.fire_all();
        assert_eq!(*fired.lock().unwrap(), vec![Expiry::Elapsed, Expiry::Elapsed]);
    }

    #[test]
    fn test_arm_failure_leaves_timeout_idle() {
        struct Broken;
        impl TimerBackend for Broken {
            fn arm(&self, _: Duration, _: TimerCallback) -> Result<TimerHandle, TimeoutError> {
                Err(TimeoutError::CouldNotArm("runtime shut down".to_string()))
            }
            fn cancel(&self, _: TimerHandle) {}
        }

        let timeout = Timeout::new(Arc::new(Broken), Duration::from_secs(1), |_| {});
        assert!(matches!(timeout.start(), Err(TimeoutError::CouldNotArm(_))));
        assert!(!timeout.is_running());
        assert_eq!(timeout.force_stop(), Err(TimeoutError::NotRunning));
    }

    #[test]
    fn test_drop_cancels_armed_timer() {
        let timers = Arc::new(ManualTimers::default());
        let (timeout, fired) = recording(&timers);

        timeout.start().unwrap();
        drop(timeout);

        assert_eq!(timers.pending(), 0);
        assert!(fired.lock().unwrap().is_empty());
    }
}
