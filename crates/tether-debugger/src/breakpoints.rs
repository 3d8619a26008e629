use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;
use tether_vm::EventKind;

use crate::environment::SourcePosition;

/// Breakpoint ids double as the id of the VM event request installed for
/// them, so breakpoint events can be matched back to their breakpoint.
pub type BreakpointId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    Line,
    Method,
    Exception,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub kind: BreakpointKind,
    pub class_name: String,
    /// Where the user placed the breakpoint, if it is tied to a source line.
    pub position: Option<SourcePosition>,
}

#[derive(Default)]
struct BreakpointState {
    next_id: BreakpointId,
    breakpoints: BTreeMap<BreakpointId, Breakpoint>,
    requests: HashSet<BreakpointId>,
    invalid: HashMap<BreakpointId, String>,
    /// Outstanding `disable_breakpoints` calls.
    disabled_depth: usize,
}

/// Breakpoint bookkeeping for one debug process.
#[derive(Default)]
pub struct BreakpointManager {
    state: Mutex<BreakpointState>,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breakpoint and mark its event request as installed.
    pub fn add(
        &self,
        kind: BreakpointKind,
        class_name: impl Into<String>,
        position: Option<SourcePosition>,
    ) -> BreakpointId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.breakpoints.insert(
            id,
            Breakpoint {
                id,
                kind,
                class_name: class_name.into(),
                position,
            },
        );
        state.requests.insert(id);
        id
    }

    pub fn get(&self, id: BreakpointId) -> Option<Breakpoint> {
        self.state.lock().breakpoints.get(&id).cloned()
    }

    pub fn remove(&self, id: BreakpointId) -> Option<Breakpoint> {
        let mut state = self.state.lock();
        state.requests.remove(&id);
        state.invalid.remove(&id);
        state.breakpoints.remove(&id)
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.state.lock().breakpoints.values().cloned().collect()
    }

    /// Mute every breakpoint. Calls nest: breakpoints stay muted until each
    /// disable is matched by an [`enable_breakpoints`](Self::enable_breakpoints).
    /// Returns `true` when this call muted them.
    pub fn disable_breakpoints(&self) -> bool {
        let mut state = self.state.lock();
        state.disabled_depth += 1;
        let changed = state.disabled_depth == 1;
        if changed {
            tracing::debug!(target: "tether.process", "breakpoints disabled");
        }
        changed
    }

    /// Undo one [`disable_breakpoints`](Self::disable_breakpoints). Returns
    /// `true` when this call unmuted them.
    pub fn enable_breakpoints(&self) -> bool {
        let mut state = self.state.lock();
        if state.disabled_depth == 0 {
            return false;
        }
        state.disabled_depth -= 1;
        let changed = state.disabled_depth == 0;
        if changed {
            tracing::debug!(target: "tether.process", "breakpoints enabled");
        }
        changed
    }

    pub fn are_enabled(&self) -> bool {
        self.state.lock().disabled_depth == 0
    }

    /// `true` when `events` only reports breakpoint hits and breakpoints are
    /// muted, i.e. the event set must not stop the debuggee.
    pub fn mutes(&self, events: &[EventKind]) -> bool {
        !events.is_empty()
            && !self.are_enabled()
            && events
                .iter()
                .all(|event| matches!(event, EventKind::Breakpoint { .. }))
    }

    pub fn set_invalid(&self, id: BreakpointId, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::debug!(target: "tether.process", breakpoint = id, reason = %reason, "breakpoint invalidated");
        self.state.lock().invalid.insert(id, reason);
    }

    pub fn invalid_reason(&self, id: BreakpointId) -> Option<String> {
        self.state.lock().invalid.get(&id).cloned()
    }

    /// Forget every invalidation warning, e.g. after classes were reloaded.
    pub fn clear_invalid(&self) {
        self.state.lock().invalid.clear();
    }

    pub fn delete_request(&self, id: BreakpointId) {
        self.state.lock().requests.remove(&id);
    }

    pub fn has_request(&self, id: BreakpointId) -> bool {
        self.state.lock().requests.contains(&id)
    }
}
