use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Coarse lock shared by a decoder, its frames and the bitmaps built on them. Every
/// engine call touching that chain runs while holding it.
pub(crate) type SyncObject = Arc<Mutex<()>>;

pub(crate) fn new_sync_object() -> SyncObject {
    Arc::new(Mutex::new(()))
}

pub(crate) fn lock_sync(sync: &Mutex<()>) -> MutexGuard<'_, ()> {
    sync.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum InitState<T> {
    Pending,
    InProgress,
    Done(T),
}

/// One-time initializer with three explicit states. Threads arriving while another
/// runs the initializer wait on the condition variable and observe its result; a
/// failed or panicking run puts the state back to pending.
pub(crate) struct GuardedInit<T> {
    state: Mutex<InitState<T>>,
    ready: Condvar,
    runs: AtomicUsize,
}

struct ResetOnUnwind<'a, T> {
    cell: &'a GuardedInit<T>,
    armed: bool,
}

impl<T> Drop for ResetOnUnwind<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            *lock(&self.cell.state) = InitState::Pending;
            self.cell.ready.notify_all();
        }
    }
}

impl<T: Clone> GuardedInit<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(InitState::Pending),
            ready: Condvar::new(),
            runs: AtomicUsize::new(0),
        }
    }

    pub(crate) fn get(&self) -> Option<T> {
        match &*lock(&self.state) {
            InitState::Done(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(&*lock(&self.state), InitState::Done(_))
    }

    /// Number of times an initializer has started.
    pub(crate) fn runs(&self) -> usize {
        self.runs.load(Ordering::Relaxed)
    }

    pub(crate) fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let mut state = lock(&self.state);
        loop {
            match &*state {
                InitState::Done(value) => return Ok(value.clone()),
                InitState::InProgress => {
                    state = self
                        .ready
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                InitState::Pending => break,
            }
        }
        *state = InitState::InProgress;
        drop(state);

        self.runs.fetch_add(1, Ordering::Relaxed);
        let mut guard = ResetOnUnwind {
            cell: self,
            armed: true,
        };
        let result = init();
        guard.armed = false;

        let mut state = lock(&self.state);
        *state = match &result {
            Ok(value) => InitState::Done(value.clone()),
            Err(_) => InitState::Pending,
        };
        self.ready.notify_all();
        result
    }

    /// Stores `value` unless a value is present or being produced.
    pub(crate) fn set_if_pending(&self, value: T) -> bool {
        let mut state = lock(&self.state);
        if matches!(&*state, InitState::Pending) {
            *state = InitState::Done(value);
            return true;
        }
        false
    }

    /// Swaps a finished value for `value` when `current` accepts it. Leaves pending
    /// and in-flight states alone.
    pub(crate) fn replace_done(&self, current: impl FnOnce(&T) -> bool, value: T) -> bool {
        let mut state = lock(&self.state);
        let accepted = match &*state {
            InitState::Done(existing) => current(existing),
            _ => false,
        };
        if accepted {
            *state = InitState::Done(value);
        }
        accepted
    }

    /// Waits out an in-flight run, then returns to pending.
    pub(crate) fn reset(&self) -> Option<T> {
        let mut state = lock(&self.state);
        while matches!(&*state, InitState::InProgress) {
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match std::mem::replace(&mut *state, InitState::Pending) {
            InitState::Done(value) => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_runs_once_across_threads() {
        let cell = Arc::new(GuardedInit::<u32>::new());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cell.get_or_try_init::<()>(|| {
                        thread::sleep(Duration::from_millis(20));
                        Ok(7)
                    })
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(7));
        }
        assert_eq!(cell.runs(), 1);
        assert_eq!(cell.get(), Some(7));
    }

    #[test]
    fn test_failure_returns_to_pending() {
        let cell = GuardedInit::<u32>::new();
        assert_eq!(cell.get_or_try_init(|| Err("io")), Err("io"));
        assert!(!cell.is_done());
        assert_eq!(cell.get_or_try_init::<&str>(|| Ok(3)), Ok(3));
        assert_eq!(cell.runs(), 2);
    }

    #[test]
    fn test_panic_does_not_wedge() {
        let cell = Arc::new(GuardedInit::<u32>::new());
        let panicking = cell.clone();
        let result = thread::spawn(move || {
            let _ = panicking.get_or_try_init::<()>(|| panic!("decoder blew up"));
        })
        .join();
        assert!(result.is_err());
        assert_eq!(cell.get_or_try_init::<()>(|| Ok(1)), Ok(1));
    }

    #[test]
    fn test_reset_and_set() {
        let cell = GuardedInit::new();
        assert!(cell.set_if_pending(5u8));
        assert!(!cell.set_if_pending(6));
        assert_eq!(cell.reset(), Some(5));
        assert_eq!(cell.get(), None);
    }

    #[test]
    fn test_replace_done_only_swaps_the_expected_value() {
        let cell = GuardedInit::new();
        assert!(!cell.replace_done(|_| true, 1u8));
        assert!(cell.set_if_pending(2));
        assert!(!cell.replace_done(|value| *value == 9, 3));
        assert!(cell.replace_done(|value| *value == 2, 4));
        assert_eq!(cell.get(), Some(4));
        assert_eq!(cell.runs(), 0);
    }
}
