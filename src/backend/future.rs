// Promise/future pair for asynchronous transfers
//
// The worker thread holds the Promise, callers hold Futures.
// Waiting blocks on a condition variable, never polls.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    /// Not attached to any request (default, or the request was rejected)
    Invalid,
    Pending,
    Ready,
    /// The promise went away without being fulfilled
    Failed,
}

struct Shared {
    state: Mutex<FutureState>,
    signal: Condvar,
}

impl Shared {
    fn set(&self, state: FutureState) {
        let mut current = self.state.lock();
        if *current == FutureState::Pending {
            *current = state;
            self.signal.notify_all();
        }
    }
}

/// Producer side; fulfilled exactly once
pub struct Promise {
    shared: Arc<Shared>,
}

impl Promise {
    pub fn new() -> (Promise, Future) {
        let shared = Arc::new(Shared {
            state: Mutex::new(FutureState::Pending),
            signal: Condvar::new(),
        });
        (Promise { shared: shared.clone() }, Future { shared: Some(shared) })
    }

    pub fn fulfil(self) {
        self.shared.set(FutureState::Ready);
    }

    pub fn fail(self) {
        self.shared.set(FutureState::Failed);
    }
}

impl Drop for Promise {
    fn drop(&mut self) {
        // No-op when already fulfilled
        self.shared.set(FutureState::Failed);
    }
}

/// Completion token for an asynchronous request
#[derive(Clone, Default)]
pub struct Future {
    shared: Option<Arc<Shared>>,
}

impl Future {
    /// Future that is never attached to anything
    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FutureState {
        match &self.shared {
            Some(shared) => *shared.state.lock(),
            None => FutureState::Invalid,
        }
    }

    pub fn valid(&self) -> bool {
        self.shared.is_some()
    }

    pub fn ready(&self) -> bool {
        self.state() == FutureState::Ready
    }

    pub fn busy(&self) -> bool {
        self.state() == FutureState::Pending
    }

    /// Block until the request completes. Returns true when it succeeded.
    pub fn wait(&self) -> bool {
        let Some(shared) = &self.shared else {
            return false;
        };
        let mut state = shared.state.lock();
        while *state == FutureState::Pending {
            shared.signal.wait(&mut state);
        }
        *state == FutureState::Ready
    }

    /// Like `wait`, giving up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> FutureState {
        let Some(shared) = &self.shared else {
            return FutureState::Invalid;
        };
        let mut state = shared.state.lock();
        if *state == FutureState::Pending {
            shared.signal.wait_while_for(&mut state, |s| *s == FutureState::Pending, timeout);
        }
        *state
    }
}

impl std::fmt::Debug for Future {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Future").field(&self.state()).finish()
    }
}
