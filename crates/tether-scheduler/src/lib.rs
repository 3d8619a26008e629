//! Thread confinement primitives for the Tether debugger core.
//!
//! The debugger runs all target-VM traffic of one debug process on a single
//! command thread and all UI-visible state transitions on a single dispatch
//! thread. Both are [`SerialExecutor`]s: named OS threads draining a priority
//! queue, with support for delayed jobs and synchronous hand-off
//! ([`SerialExecutor::invoke_and_wait`]).

mod alarm;
mod executor;
mod progress;

use std::any::Any;
use std::time::Duration;

use thiserror::Error;

pub use alarm::Alarm;
pub use executor::{Priority, SerialExecutor};
pub use progress::{
    Progress, ProgressEvent, ProgressId, ProgressIndicator, ProgressReceiver, ProgressSender,
};
pub use tokio_util::sync::CancellationToken;

/// Returned by cooperative work that observed a cancelled token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task cancelled")]
    Cancelled,
    #[error("task did not complete within {0:?}")]
    DeadlineExceeded(Duration),
    #[error("task panicked")]
    Panicked,
    #[error("executor is shut down")]
    Closed,
}

impl From<Cancelled> for TaskError {
    fn from(_: Cancelled) -> Self {
        TaskError::Cancelled
    }
}

pub(crate) fn panic_payload_to_str(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
