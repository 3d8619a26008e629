use std::io;
use std::path::PathBuf;

use tether_scheduler::TaskError;
use tether_vm::VmError;
use thiserror::Error;

pub type DebuggerResult<T> = Result<T, DebuggerError>;

#[derive(Error, Debug)]
pub enum DebuggerError {
    #[error("unable to open debugger port ({address}): {message}")]
    Attach { address: String, message: String },
    #[error("vm: {0}")]
    Vm(#[from] VmError),
    #[error("task: {0}")]
    Task(#[from] TaskError),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to start debugger thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("debug process is detached")]
    ProcessDetached,
    #[error("debugger session is disposed")]
    SessionDisposed,
    #[error("debugger session is not suspended")]
    NotSuspended,
}
