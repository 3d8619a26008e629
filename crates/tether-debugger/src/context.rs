use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use tether_vm::{StackFrameInfo, ThreadRef, VirtualMachineProxy};

use crate::environment::{Environment, SourcePosition};
use crate::session::DebuggerSession;
use crate::suspend::SuspendContext;

/// Immutable view of what the debugger currently shows: a suspend context,
/// the thread and the frame within it.
///
/// A context without a suspend context never carries a thread or a frame;
/// the constructors are the only way to build one. Frame and position are
/// computed once by [`DebuggerContext::init_caches`] on the command thread
/// and cached.
#[derive(Clone)]
pub struct DebuggerContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    session: Weak<DebuggerSession>,
    suspend_context: Option<Arc<SuspendContext>>,
    thread: Option<ThreadRef>,
    frame: OnceLock<Option<StackFrameInfo>>,
    position: OnceLock<Option<SourcePosition>>,
}

impl DebuggerContext {
    pub fn empty(session: Weak<DebuggerSession>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                session,
                suspend_context: None,
                thread: None,
                frame: OnceLock::from(None),
                position: OnceLock::from(None),
            }),
        }
    }

    pub fn suspended(
        session: Weak<DebuggerSession>,
        suspend_context: Arc<SuspendContext>,
        thread: Option<ThreadRef>,
        frame: Option<StackFrameInfo>,
        position: Option<SourcePosition>,
    ) -> Self {
        let frame_cache = OnceLock::new();
        if let Some(frame) = frame {
            let _ = frame_cache.set(Some(frame));
        }
        let position_cache = OnceLock::new();
        if let Some(position) = position {
            let _ = position_cache.set(Some(position));
        }

        Self {
            inner: Arc::new(ContextInner {
                session,
                suspend_context: Some(suspend_context),
                thread,
                frame: frame_cache,
                position: position_cache,
            }),
        }
    }

    pub fn session(&self) -> Option<Arc<DebuggerSession>> {
        self.inner.session.upgrade()
    }

    pub fn suspend_context(&self) -> Option<&Arc<SuspendContext>> {
        self.inner.suspend_context.as_ref()
    }

    pub fn thread(&self) -> Option<&ThreadRef> {
        self.inner.thread.as_ref()
    }

    /// The current frame, once caches are initialised.
    pub fn frame(&self) -> Option<&StackFrameInfo> {
        self.inner.frame.get().and_then(Option::as_ref)
    }

    pub fn source_position(&self) -> Option<&SourcePosition> {
        self.inner.position.get().and_then(Option::as_ref)
    }

    pub fn is_initialised(&self) -> bool {
        self.inner.frame.get().is_some() && self.inner.position.get().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.suspend_context.is_none()
    }

    /// Populate the frame and position caches. Must run on the debug process
    /// command thread.
    pub(crate) fn init_caches(&self, vm: Option<&dyn VirtualMachineProxy>, environment: &Environment) {
        let frame = self.inner.frame.get_or_init(|| {
            let (Some(vm), Some(thread)) = (vm, self.inner.thread.as_ref()) else {
                return None;
            };
            match vm.frames(thread) {
                Ok(frames) => frames.into_iter().next(),
                Err(err) if err.is_transient() => {
                    tracing::debug!(target: "tether.session", thread = %thread, error = %err, "no frame available");
                    None
                }
                Err(err) => {
                    tracing::warn!(target: "tether.session", thread = %thread, error = %err, "failed to read frames");
                    None
                }
            }
        });

        self.inner.position.get_or_init(|| {
            frame
                .as_ref()
                .and_then(|frame| environment.resolve_position(&frame.location))
        });
    }
}

impl fmt::Debug for DebuggerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebuggerContext")
            .field("suspend_context", &self.inner.suspend_context.as_ref().map(|c| c.id()))
            .field("thread", &self.inner.thread)
            .field("frame", &self.frame())
            .field("position", &self.source_position())
            .finish()
    }
}
