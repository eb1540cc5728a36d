use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

/// Process-local FIFO lock serializing mutating git invocations.
///
/// Concurrent git commands that mutate the same repository race
/// destructively on the index and refs; this mutex linearizes them within
/// one process. Waiters are granted the lock strictly in arrival order.
/// Cross-process exclusion is out of scope — git's own `index.lock` is the
/// last line of defense there.
#[derive(Clone, Default)]
pub struct GitMutex {
    state: Arc<Mutex<LockState>>,
}

#[derive(Default)]
struct LockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl GitMutex {
    /// Creates an unlocked mutex.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock, waiting behind earlier callers.
    ///
    /// The returned guard releases on drop; [`GitLockGuard::release`] may be
    /// called explicitly and is idempotent.
    pub async fn acquire(&self) -> GitLockGuard {
        let receiver = {
            let mut state = lock_state(&self.state);
            if state.locked {
                let (sender, receiver) = oneshot::channel();
                state.waiters.push_back(sender);
                Some(receiver)
            } else {
                state.locked = true;
                None
            }
        };

        if let Some(receiver) = receiver {
            // The sender is only dropped when the holder skips a canceled
            // waiter, which cannot be this one: we are still awaiting.
            let _ = receiver.await;
        }

        GitLockGuard {
            state: Arc::clone(&self.state),
            released: false,
        }
    }

    /// Runs `f` under the lock, releasing on every exit path.
    pub async fn with_lock<T, F, Fut>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire().await;
        let result = f().await;
        drop(guard);

        result
    }

    /// Returns whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        lock_state(&self.state).locked
    }

    /// Returns how many callers are queued behind the current holder.
    pub fn pending(&self) -> usize {
        lock_state(&self.state).waiters.len()
    }
}

/// Release handle for one [`GitMutex`] acquisition.
pub struct GitLockGuard {
    state: Arc<Mutex<LockState>>,
    released: bool,
}

impl GitLockGuard {
    /// Releases the lock, handing it to the oldest waiter.
    ///
    /// Releasing twice is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut state = lock_state(&self.state);
        loop {
            match state.waiters.pop_front() {
                // A waiter whose acquire future was dropped leaves a dead
                // sender; skip it and hand the lock to the next one.
                Some(sender) => {
                    if sender.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    state.locked = false;
                    return;
                }
            }
        }
    }
}

impl Drop for GitLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock_state(state: &Mutex<LockState>) -> std::sync::MutexGuard<'_, LockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
