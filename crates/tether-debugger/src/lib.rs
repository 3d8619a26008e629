//! JVM debugger session core.
//!
//! This crate provides:
//! - [`DebugProcess`]: one connection to a target VM with its own command
//!   thread, suspend bookkeeping and breakpoint state.
//! - [`DebuggerSession`]: the state machine (`STOPPED`, `WAITING_ATTACH`,
//!   `RUNNING`, `PAUSED`, `WAIT_EVALUATION`, `DISPOSED`) layered on a debug
//!   process, including the rule deciding which suspension becomes the active
//!   context.
//! - [`DebuggerManager`]: the registry of sessions keyed by debuggee process.
//! - [`hotswap`]: scanning compiled output for changed classes and redefining
//!   them in the running VMs.

mod breakpoints;
mod context;
mod environment;
mod error;
pub mod hotswap;
mod manager;
mod multi_process;
mod process;
mod session;
mod suspend;

pub use crate::breakpoints::{Breakpoint, BreakpointId, BreakpointKind, BreakpointManager};
pub use crate::context::DebuggerContext;
pub use crate::environment::{
    ClasspathEntry, ClasspathEntryKind, Environment, PositionResolver, ProcessHandle, ProcessKey,
    Sdk, SearchScope, SourcePosition, TerminationListener,
};
pub use crate::error::{DebuggerError, DebuggerResult};
pub use crate::manager::{DebuggerManager, DebuggerManagerListener};
pub use crate::multi_process::MultiProcessCommand;
pub use crate::process::{
    CursorPosition, CustomResumeAction, DebugProcess, DebugProcessListener, ProcessState,
    ResumeAction, ResumeCommand,
};
pub use crate::session::{
    ContextSwitchOffer, DebuggerSession, Event, SessionId, SessionListener, SessionStatus, State,
    StepCommandFactory,
};
pub use crate::suspend::{SuspendContext, SuspendContextId, SuspendManager};
