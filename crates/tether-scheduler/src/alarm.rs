use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{CancellationToken, SerialExecutor, TaskError};

#[derive(Default)]
struct AlarmState {
    next_id: u64,
    pending: Option<(u64, CancellationToken)>,
    disposed: bool,
}

/// Coalesces repeated requests into a single delayed job on an executor.
///
/// Each [`Alarm::cancel_and_request`] cancels whatever request is still
/// pending, so a burst of requests runs the last one once.
#[derive(Clone)]
pub struct Alarm {
    executor: SerialExecutor,
    state: Arc<Mutex<AlarmState>>,
}

impl Alarm {
    pub fn new(executor: SerialExecutor) -> Self {
        Self {
            executor,
            state: Arc::new(Mutex::new(AlarmState::default())),
        }
    }

    pub fn cancel_and_request<F>(&self, delay: Duration, f: F) -> Result<(), TaskError>
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let id = {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(TaskError::Closed);
            }
            state.next_id += 1;
            let id = state.next_id;
            if let Some((_, previous)) = state.pending.replace((id, token.clone())) {
                previous.cancel();
            }
            id
        };

        let state = Arc::clone(&self.state);
        let job_token = token.clone();
        self.executor.schedule_after_unless_cancelled(delay, token, move || {
            if job_token.is_cancelled() {
                return;
            }
            {
                let mut state = state.lock();
                if state.disposed {
                    return;
                }
                if state.pending.as_ref().is_some_and(|(current, _)| *current == id) {
                    state.pending = None;
                }
            }
            f();
        })
    }

    pub fn cancel_all_requests(&self) {
        if let Some((_, pending)) = self.state.lock().pending.take() {
            pending.cancel();
        }
    }

    /// Cancel pending requests and refuse new ones.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        state.disposed = true;
        if let Some((_, pending)) = state.pending.take() {
            pending.cancel();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}
