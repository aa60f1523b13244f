//! Wait/notify registry for iterations published in the background.
//!
//! A caller registers a correlation id, hands the id to whoever does the
//! work, and suspends on the returned receiver. The worker calls
//! [`WaitNotify::notify`] with the same id when it is done.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use uuid::Uuid;

/// Correlation id -> pending waiter.
pub struct WaitNotify<T> {
    waiters: Mutex<HashMap<Uuid, oneshot::Sender<T>>>,
}

/// Receiving half returned by [`WaitNotify::register`].
pub type Waiter<T> = oneshot::Receiver<T>;

impl<T> WaitNotify<T> {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Register a fresh correlation id.
    pub fn register(&self) -> (Uuid, Waiter<T>) {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        (id, rx)
    }

    /// Deliver `value` to the waiter for `id`.
    ///
    /// Returns `false` if nobody is waiting (unknown id, already notified,
    /// or the waiter went away).
    pub fn notify(&self, id: Uuid, value: T) -> bool {
        let Some(tx) = self.lock().remove(&id) else {
            tracing::warn!(correlation_id = %id, "notify for unknown waiter");
            return false;
        };
        tx.send(value).is_ok()
    }

    /// Number of registered waiters not yet notified.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, oneshot::Sender<T>>> {
        // A poisoned map is still structurally sound; keep serving it.
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> Default for WaitNotify<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for WaitNotify<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitNotify")
            .field("pending", &self.pending())
            .finish()
    }
}
