//! Virtual machine proxy boundary for Tether.
//!
//! `tether-debugger` never speaks the debug wire protocol itself. Everything it
//! needs from a target JVM (thread mirrors, stack frames, loaded reference
//! types, class redefinition, suspend/resume and stepping) goes through the
//! [`VirtualMachineProxy`] trait defined here, and connections are established
//! through a [`Connector`].
//!
//! [`MockVirtualMachine`] and [`MockConnector`] are deterministic in-memory
//! doubles used by the debugger test suites.

mod connection;
mod mock;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

pub use connection::{RemoteConnection, Transport};
pub use mock::{MockConnector, MockThread, MockVirtualMachine};

pub type ThreadId = u64;
pub type FrameId = u64;
pub type ReferenceTypeId = u64;

/// Identity handle for a thread in the target VM.
///
/// Two handles refer to the same thread iff their ids are equal; the name is
/// carried for display and for the "pause" thread-selection heuristics.
#[derive(Debug, Clone)]
pub struct ThreadRef {
    pub id: ThreadId,
    pub name: String,
}

impl ThreadRef {
    pub fn new(id: ThreadId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl PartialEq for ThreadRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ThreadRef {}

impl std::hash::Hash for ThreadRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"@{}", self.name, self.id)
    }
}

/// Mirrors `ThreadReference.status()` from JDI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Unknown,
    Zombie,
    Running,
    Sleeping,
    Monitor,
    Wait,
    NotStarted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Fully qualified, dotted name of the declaring type (`com.example.Foo$Inner`).
    pub class_name: String,
    pub method: String,
    pub line: u32,
    /// `SourceFile` attribute of the declaring type, when known.
    pub source_name: Option<String>,
}

impl Location {
    pub fn new(class_name: impl Into<String>, method: impl Into<String>, line: u32) -> Self {
        Self {
            class_name: class_name.into(),
            method: method.into(),
            line,
            source_name: None,
        }
    }

    pub fn with_source_name(mut self, source_name: impl Into<String>) -> Self {
        self.source_name = Some(source_name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrameInfo {
    pub id: FrameId,
    pub location: Location,
}

/// A loaded class in the target VM. Several reference types may share a name
/// when the class was loaded by more than one class loader.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReferenceType {
    pub id: ReferenceTypeId,
    pub name: String,
    pub class_loader: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    Into,
    Over,
    Out,
}

/// JDWP `SuspendPolicy` attached to an event set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendPolicy {
    None,
    EventThread,
    All,
}

/// Events delivered by the target VM's event queue.
#[derive(Debug, Clone)]
pub enum VmEvent {
    /// A set of events that left one or more threads suspended.
    Suspended(EventSet),
    ThreadStarted(ThreadRef),
    ThreadDeath(ThreadRef),
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct EventSet {
    pub policy: SuspendPolicy,
    pub thread: Option<ThreadRef>,
    pub events: Vec<EventKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A breakpoint request fired. `request_id` is the id the request was
    /// installed with.
    Breakpoint { request_id: u32, location: Location },
    StepCompleted { location: Location },
    Other,
}

/// Category of a failed `RedefineClasses` request, mirroring the JDI
/// exceptions thrown by `VirtualMachine.redefineClasses`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RedefinitionErrorKind {
    UnsupportedOperation,
    NoClassDefFound,
    Verify,
    UnsupportedClassVersion,
    ClassFormat,
    ClassCircularity,
    Other,
}

impl RedefinitionErrorKind {
    /// Classify a JDWP error code returned by `VirtualMachine/RedefineClasses`.
    pub fn from_error_code(error_code: u16) -> Self {
        match error_code {
            60 => Self::ClassFormat,
            61 => Self::ClassCircularity,
            62 => Self::Verify,
            63 | 64 | 66 | 67 | 70 | 71 | 99 => Self::UnsupportedOperation,
            68 => Self::UnsupportedClassVersion,
            69 => Self::NoClassDefFound,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for RedefinitionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnsupportedOperation => "unsupported operation",
            Self::NoClassDefFound => "class definition not found",
            Self::Verify => "verification error",
            Self::UnsupportedClassVersion => "unsupported class version",
            Self::ClassFormat => "class format error",
            Self::ClassCircularity => "class circularity error",
            Self::Other => "redefinition error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("virtual machine is not connected")]
    NotConnected,
    #[error("virtual machine disconnected")]
    Disconnected,
    #[error("object has been collected")]
    ObjectCollected,
    #[error("thread {0} is not suspended")]
    IncompatibleThreadState(ThreadId),
    #[error("{kind}: {message}")]
    Redefinition {
        kind: RedefinitionErrorKind,
        message: String,
    },
    #[error("JDWP command failed with error code {error_code}")]
    CommandFailed { error_code: u16 },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

impl VmError {
    /// Errors that only mean the thread state changed under us while reading
    /// it; callers degrade to "no frame available".
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VmError::ObjectCollected | VmError::IncompatibleThreadState(_)
        )
    }

    pub fn redefinition_kind(&self) -> Option<RedefinitionErrorKind> {
        match self {
            VmError::Redefinition { kind, .. } => Some(*kind),
            VmError::CommandFailed { error_code } => {
                Some(RedefinitionErrorKind::from_error_code(*error_code))
            }
            _ => None,
        }
    }
}

/// Everything the debugger core needs from a connected target VM.
///
/// Implementations must be callable from the debug process command thread;
/// the core never issues two calls concurrently against the same proxy.
pub trait VirtualMachineProxy: Send + Sync {
    /// Human readable description (`"OpenJDK 64-Bit Server VM 21"`).
    fn description(&self) -> String;

    fn all_threads(&self) -> Result<Vec<ThreadRef>, VmError>;
    fn thread_status(&self, thread: &ThreadRef) -> Result<ThreadStatus, VmError>;
    fn is_suspended(&self, thread: &ThreadRef) -> Result<bool, VmError>;
    fn frames(&self, thread: &ThreadRef) -> Result<Vec<StackFrameInfo>, VmError>;

    fn frame_count(&self, thread: &ThreadRef) -> Result<usize, VmError> {
        Ok(self.frames(thread)?.len())
    }

    /// All loaded reference types with the given dotted name.
    fn classes_by_name(&self, name: &str) -> Result<Vec<ReferenceType>, VmError>;

    fn can_redefine_classes(&self) -> bool {
        true
    }

    /// Redefine every class in `classes` in a single request.
    fn redefine_classes(&self, classes: &[(ReferenceType, Vec<u8>)]) -> Result<(), VmError>;

    fn suspend(&self) -> Result<(), VmError>;
    fn resume(&self) -> Result<(), VmError>;
    fn resume_thread(&self, thread: &ThreadRef) -> Result<(), VmError>;

    /// Install a single-shot step request on `thread`. The caller resumes.
    fn step(&self, thread: &ThreadRef, kind: StepKind) -> Result<(), VmError>;

    /// Install a single-shot breakpoint at `class_name:line`. The caller resumes.
    fn run_to_line(
        &self,
        thread: Option<&ThreadRef>,
        class_name: &str,
        line: u32,
    ) -> Result<(), VmError>;

    /// Detach from the target, letting it continue to run.
    fn dispose(&self) -> Result<(), VmError>;

    /// Terminate the target.
    fn exit(&self, exit_code: i32) -> Result<(), VmError>;
}

/// Establishes the debug-wire channel to a target VM.
pub trait Connector: Send + Sync {
    /// Open the transport (bind the listening socket or validate the remote
    /// address). Runs synchronously on the attaching thread.
    fn open(&self, connection: &RemoteConnection) -> Result<(), VmError>;

    /// Wait for the VM to connect (server mode) or connect to it (client mode).
    /// Runs on the debug process command thread.
    fn attach(
        &self,
        connection: &RemoteConnection,
        timeout: Duration,
    ) -> Result<Arc<dyn VirtualMachineProxy>, VmError>;
}
