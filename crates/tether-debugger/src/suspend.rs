use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tether_vm::{EventKind, Location, SuspendPolicy, ThreadId, ThreadRef};

use crate::breakpoints::BreakpointId;

pub type SuspendContextId = u64;

/// One suspension of the target VM: the event set that caused it, the
/// thread it happened on and the suspend policy.
///
/// Owned by the [`SuspendManager`]; everything else holds it through an
/// `Arc` and only reads from it.
pub struct SuspendContext {
    id: SuspendContextId,
    policy: SuspendPolicy,
    thread: Option<ThreadRef>,
    events: Vec<EventKind>,
    resumed: AtomicBool,
}

impl SuspendContext {
    pub fn id(&self) -> SuspendContextId {
        self.id
    }

    pub fn policy(&self) -> SuspendPolicy {
        self.policy
    }

    pub fn thread(&self) -> Option<&ThreadRef> {
        self.thread.as_ref()
    }

    pub fn events(&self) -> &[EventKind] {
        &self.events
    }

    /// `(breakpoint id, location)` for every breakpoint event in the set.
    pub fn breakpoint_events(&self) -> Vec<(BreakpointId, &Location)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                EventKind::Breakpoint {
                    request_id,
                    location,
                } => Some((*request_id, location)),
                _ => None,
            })
            .collect()
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for SuspendContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspendContext")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .field("thread", &self.thread)
            .field("resumed", &self.is_resumed())
            .finish()
    }
}

#[derive(Default)]
struct SuspendState {
    /// Paused contexts, oldest first.
    paused: Vec<Arc<SuspendContext>>,
    suspended_threads: HashSet<ThreadId>,
    all_suspended: bool,
}

/// Tracks the suspend contexts of one debug process.
#[derive(Default)]
pub struct SuspendManager {
    next_id: AtomicU64,
    state: Mutex<SuspendState>,
}

impl SuspendManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_suspend_context(
        &self,
        policy: SuspendPolicy,
        thread: Option<ThreadRef>,
        events: Vec<EventKind>,
    ) -> Arc<SuspendContext> {
        let context = Arc::new(SuspendContext {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            policy,
            thread,
            events,
            resumed: AtomicBool::new(false),
        });

        let mut state = self.state.lock();
        match policy {
            SuspendPolicy::All => state.all_suspended = true,
            SuspendPolicy::EventThread => {
                if let Some(thread) = &context.thread {
                    state.suspended_threads.insert(thread.id);
                }
            }
            SuspendPolicy::None => {}
        }
        state.paused.push(context.clone());
        context
    }

    pub(crate) fn resume(&self, context: &SuspendContext) {
        context.resumed.store(true, Ordering::SeqCst);

        let mut state = self.state.lock();
        state.paused.retain(|paused| paused.id != context.id);
        match context.policy {
            SuspendPolicy::All => {
                state.all_suspended = false;
                state.suspended_threads.clear();
            }
            SuspendPolicy::EventThread => {
                if let Some(thread) = &context.thread {
                    state.suspended_threads.remove(&thread.id);
                }
            }
            SuspendPolicy::None => {}
        }
    }

    /// Snapshot of every paused context, oldest first.
    pub fn paused_contexts(&self) -> Vec<Arc<SuspendContext>> {
        self.state.lock().paused.clone()
    }

    /// The most recently paused context still waiting to be resumed.
    pub fn paused_context(&self) -> Option<Arc<SuspendContext>> {
        self.state.lock().paused.last().cloned()
    }

    pub fn is_suspended(&self, thread: &ThreadRef) -> bool {
        let state = self.state.lock();
        state.all_suspended || state.suspended_threads.contains(&thread.id)
    }

    /// Drop every paused context; used when the process detaches.
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        for context in state.paused.drain(..) {
            context.resumed.store(true, Ordering::SeqCst);
        }
        state.suspended_threads.clear();
        state.all_suspended = false;
    }
}
