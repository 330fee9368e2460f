use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use switchyard_proto::{TimeoutError, TimerBackend, TimerCallback, TimerHandle};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::trace;

type Tasks = Arc<Mutex<HashMap<u64, AbortHandle>>>;

/// Timer backend running each timer as a sleeping tokio task.
pub struct TokioTimers {
    runtime: Handle,
    next_id: AtomicU64,
    tasks: Tasks,
}

fn lock(tasks: &Tasks) -> MutexGuard<'_, HashMap<u64, AbortHandle>> {
    tasks.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TokioTimers {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Timers armed and not yet fired or cancelled
    pub fn armed(&self) -> usize {
        lock(&self.tasks).len()
    }
}

impl TimerBackend for TokioTimers {
    fn arm(&self, delay: Duration, callback: TimerCallback) -> Result<TimerHandle, TimeoutError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);

        // Held across the spawn so the task cannot look itself up too early.
        let mut armed = lock(&self.tasks);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let fired = lock(&tasks).remove(&id).is_some();
            if fired {
                trace!("Timer {} fired", id);
                callback();
            }
        });
        armed.insert(id, task.abort_handle());

        Ok(TimerHandle(id))
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(task) = lock(&self.tasks).remove(&handle.0) {
            trace!("Timer {} cancelled", handle.0);
            task.abort();
        }
    }
}
