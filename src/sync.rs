//! Locks and condition variables (§4.B), and the lock-ordering discipline
//! from §5: `dispatcher → waitService → heap`, never nested in a cycle.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::ThreadId;
use std::time::Duration;

/// A recursive mutex: the same thread may re-acquire it without deadlocking.
/// The dispatcher and worker pool both need this (a callback running on the
/// service thread may itself call back into the pool that invoked it), which
/// the teacher's `Poll` — being `!Sync` by construction — never needed.
pub struct MprMutex<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    owner: Option<ThreadId>,
    depth: u32,
    value: T,
}

// Safety: access to `value` is only exposed through `lock()`, which enforces
// the recursive-owner discipline via the `Mutex` guarding `Inner`.
unsafe impl<T: Send> Sync for MprMutex<T> {}

impl<T> MprMutex<T> {
    pub fn new(value: T) -> Self {
        MprMutex { inner: Mutex::new(Inner { owner: None, depth: 0, value }) }
    }

    /// Locks the mutex, blocking the current thread. Re-entrant: if this
    /// thread already holds the lock the depth counter is bumped instead of
    /// deadlocking.
    pub fn lock(&self) -> MprMutexGuard<'_, T> {
        let this = std::thread::current().id();
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if guard.owner != Some(this) {
            // Fall back to blocking acquisition semantics: since `Inner` is
            // itself protected by a single `Mutex`, a non-owner thread must
            // wait for the owner to fully unwind before it can proceed. We
            // approximate this with a spin-wait on the depth field, which is
            // fine for the runtime's use (held for microseconds, per §5).
            while guard.owner.is_some() && guard.owner != Some(this) {
                drop(guard);
                std::thread::yield_now();
                guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            }
            guard.owner = Some(this);
        }
        guard.depth += 1;
        MprMutexGuard { mutex: self, _not_send: std::marker::PhantomData }
    }

    fn unlock_one(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.depth -= 1;
        if guard.depth == 0 {
            guard.owner = None;
        }
    }

    fn with_value<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard.value)
    }
}

pub struct MprMutexGuard<'a, T> {
    mutex: &'a MprMutex<T>,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl<T> std::ops::Deref for MprMutexGuard<'_, T> {
    type Target = MprMutex<T>;
    fn deref(&self) -> &MprMutex<T> {
        self.mutex
    }
}

impl<T> Drop for MprMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock_one();
    }
}

impl<'a, T> MprMutexGuard<'a, T> {
    pub fn get(&self, f: impl FnOnce(&mut T)) {
        self.mutex.with_value(|v| f(v));
    }

    pub fn map<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.mutex.with_value(f)
    }
}

/// Outcome of a condition-variable wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signalled,
    Timeout,
}

/// A condition variable over a plain `Mutex<bool>` "signalled" flag, matching
/// the spec's `wait(timeout_ms)` / `signal` / `reset` contract.
pub struct MprCondvar {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl Default for MprCondvar {
    fn default() -> Self {
        Self::new()
    }
}

impl MprCondvar {
    pub fn new() -> Self {
        MprCondvar { flag: Mutex::new(false), cv: Condvar::new() }
    }

    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        let guard = self.flag.lock().unwrap_or_else(|e| e.into_inner());
        let (mut guard, result) =
            self.cv.wait_timeout_while(guard, timeout, |signalled| !*signalled).unwrap_or_else(|e| e.into_inner());
        if *guard {
            *guard = false;
            WaitOutcome::Signalled
        } else if result.timed_out() {
            WaitOutcome::Timeout
        } else {
            WaitOutcome::Signalled
        }
    }

    pub fn signal(&self) {
        let mut guard = self.flag.lock().unwrap_or_else(|e| e.into_inner());
        *guard = true;
        self.cv.notify_all();
    }

    pub fn reset(&self) {
        let mut guard = self.flag.lock().unwrap_or_else(|e| e.into_inner());
        *guard = false;
    }
}

pub type LockResult<'a, T> = Result<MutexGuard<'a, T>, ()>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn recursive_mutex_allows_reentry_same_thread() {
        let m = MprMutex::new(0);
        let g1 = m.lock();
        let g2 = m.lock(); // would deadlock with std::sync::Mutex
        g2.get(|v| *v += 1);
        drop(g2);
        drop(g1);
        assert_eq!(m.with_value(|v| *v), 1);
    }

    #[test]
    fn condvar_times_out() {
        let cv = MprCondvar::new();
        let start = Instant::now();
        let outcome = cv.wait(Duration::from_millis(20));
        assert_eq!(outcome, WaitOutcome::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn condvar_signal_wakes_waiter() {
        let cv = Arc::new(MprCondvar::new());
        let cv2 = cv.clone();
        let handle = std::thread::spawn(move || cv2.wait(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        cv.signal();
        assert_eq!(handle.join().unwrap(), WaitOutcome::Signalled);
    }
}
