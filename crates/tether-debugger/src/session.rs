use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use tether_config::DebuggerConfig;
use tether_scheduler::{Alarm, CancellationToken, Priority, SerialExecutor};
use tether_vm::{StackFrameInfo, SuspendPolicy, ThreadRef, ThreadStatus, VirtualMachineProxy};

use crate::breakpoints::BreakpointKind;
use crate::context::DebuggerContext;
use crate::environment::{Environment, SourcePosition};
use crate::process::{CursorPosition, DebugProcess, DebugProcessListener, ResumeCommand};
use crate::suspend::SuspendContext;
use crate::{DebuggerError, DebuggerResult};

pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Externally observable state of a debugger session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Stopped,
    Running,
    WaitingAttach,
    Paused,
    WaitEvaluation,
    Disposed,
}

/// Cause of the last state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    StartWaitAttach,
    Attached,
    Pause,
    Resume,
    Step,
    Context,
    Refresh,
    RefreshWithStack,
    ThreadsRefresh,
    Detached,
    Dispose,
}

/// Serializable summary of the session's current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub id: SessionId,
    pub name: String,
    pub state: State,
    pub event: Option<Event>,
    pub description: Option<String>,
}

/// A suspension that was not made the active context but could be switched
/// to, e.g. a breakpoint hit in another thread.
#[derive(Debug, Clone)]
pub struct ContextSwitchOffer {
    pub thread: ThreadRef,
    pub suspend_context: Arc<SuspendContext>,
}

pub trait SessionListener: Send + Sync {
    /// Called after every transition, in subscription order.
    fn state_changed(
        &self,
        session: &DebuggerSession,
        context: &DebuggerContext,
        state: State,
        event: Event,
    );

    fn context_switch_offered(&self, _session: &DebuggerSession, _offer: &ContextSwitchOffer) {}
}

/// Supplies custom resume commands for stepping. Providers are queried in
/// registration order; the first `Some` wins, otherwise the debug process
/// default command is used.
#[allow(unused_variables)]
pub trait StepCommandFactory: Send + Sync {
    fn step_over_command(&self, context: &Arc<SuspendContext>) -> Option<ResumeCommand> {
        None
    }

    fn step_into_command(
        &self,
        context: &Arc<SuspendContext>,
        ignore_filters: bool,
    ) -> Option<ResumeCommand> {
        None
    }

    fn step_out_command(&self, context: &Arc<SuspendContext>) -> Option<ResumeCommand> {
        None
    }

    fn run_to_cursor_command(
        &self,
        context: &Arc<SuspendContext>,
        position: &CursorPosition,
    ) -> Option<ResumeCommand> {
        None
    }
}

struct Snapshot {
    state: State,
    event: Option<Event>,
    description: Option<String>,
    context: DebuggerContext,
}

/// State machine over one [`DebugProcess`].
///
/// Transitions carrying a suspend context are published from the process
/// command thread after the context caches were initialised; transitions
/// without one are applied on the calling thread. `DISPOSED` is terminal.
pub struct DebuggerSession {
    this: Weak<DebuggerSession>,
    id: SessionId,
    name: String,
    process: DebugProcess,
    dispatcher: SerialExecutor,
    environment: Environment,
    snapshot: Mutex<Snapshot>,
    apply_lock: ReentrantMutex<()>,
    listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
    stepping_through: Mutex<Option<ThreadRef>>,
    ignore_filters_frame_count: Mutex<Option<usize>>,
    step_providers: Vec<Arc<dyn StepCommandFactory>>,
    update_alarm: Alarm,
    disposed: AtomicBool,
    workspace_token: CancellationToken,
    modified_classes_scan_required: AtomicBool,
}

impl DebuggerSession {
    pub fn new(
        environment: Environment,
        process: DebugProcess,
        dispatcher: SerialExecutor,
        step_providers: Vec<Arc<dyn StepCommandFactory>>,
        workspace_token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<DebuggerSession>| {
            process.add_listener(Arc::new(SessionProcessListener {
                session: this.clone(),
            }));

            Self {
                this: this.clone(),
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                name: environment.session_name.clone(),
                update_alarm: Alarm::new(dispatcher.clone()),
                snapshot: Mutex::new(Snapshot {
                    state: State::Stopped,
                    event: None,
                    description: None,
                    context: DebuggerContext::empty(this.clone()),
                }),
                process,
                dispatcher,
                environment,
                apply_lock: ReentrantMutex::new(()),
                listeners: Mutex::new(Vec::new()),
                stepping_through: Mutex::new(None),
                ignore_filters_frame_count: Mutex::new(None),
                step_providers,
                disposed: AtomicBool::new(false),
                workspace_token,
                modified_classes_scan_required: AtomicBool::new(false),
            }
        })
    }

    /// Build a session and start attaching. A session that fails to attach
    /// is disposed before the error is returned.
    pub fn create(
        environment: Environment,
        process: DebugProcess,
        dispatcher: SerialExecutor,
        step_providers: Vec<Arc<dyn StepCommandFactory>>,
        workspace_token: CancellationToken,
    ) -> DebuggerResult<Arc<Self>> {
        let session = Self::new(environment, process, dispatcher, step_providers, workspace_token);
        if let Err(err) = session.attach() {
            session.dispose();
            return Err(err);
        }
        Ok(session)
    }

    /// Open the connection and wait for the VM on the command thread.
    pub fn attach(&self) -> DebuggerResult<()> {
        if self.is_disposed() {
            return Err(DebuggerError::SessionDisposed);
        }
        self.process.open_connection()?;
        self.set_state(
            self.empty_context(),
            State::WaitingAttach,
            Event::StartWaitAttach,
            Some(connecting_text(&self.process)),
        );
        self.process.start_attach(self.environment.poll_timeout)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn process(&self) -> &DebugProcess {
        &self.process
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn config(&self) -> &DebuggerConfig {
        self.process.config()
    }

    pub(crate) fn dispatcher(&self) -> &SerialExecutor {
        &self.dispatcher
    }

    pub fn workspace_token(&self) -> &CancellationToken {
        &self.workspace_token
    }

    pub fn state(&self) -> State {
        self.snapshot.lock().state
    }

    pub fn event(&self) -> Option<Event> {
        self.snapshot.lock().event
    }

    pub fn state_description(&self) -> Option<String> {
        self.snapshot.lock().description.clone()
    }

    pub fn context(&self) -> DebuggerContext {
        self.snapshot.lock().context.clone()
    }

    pub fn suspend_context(&self) -> Option<Arc<SuspendContext>> {
        self.snapshot.lock().context.suspend_context().cloned()
    }

    pub fn status(&self) -> SessionStatus {
        let snapshot = self.snapshot.lock();
        SessionStatus {
            id: self.id,
            name: self.name.clone(),
            state: snapshot.state,
            event: snapshot.event,
            description: snapshot.description.clone(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state() == State::Paused
    }

    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == State::Stopped
    }

    pub fn is_attached(&self) -> bool {
        !self.is_stopped() && self.process.is_attached()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn stepping_through(&self) -> Option<ThreadRef> {
        self.stepping_through.lock().clone()
    }

    pub fn is_stepping_through(&self, thread: &ThreadRef) -> bool {
        self.stepping_through.lock().as_ref() == Some(thread)
    }

    fn set_stepping_through(&self, thread: Option<ThreadRef>) {
        *self.stepping_through.lock() = thread;
    }

    pub fn set_modified_classes_scan_required(&self, required: bool) {
        self.modified_classes_scan_required
            .store(required, Ordering::SeqCst);
    }

    pub fn is_modified_classes_scan_required(&self) -> bool {
        self.modified_classes_scan_required.load(Ordering::SeqCst)
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SessionListener>) {
        self.listeners
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    /// Remember the smallest stack depth at which step filters were
    /// suppressed.
    pub fn set_ignore_step_filters_flag(&self, frame_count: usize) {
        let mut threshold = self.ignore_filters_frame_count.lock();
        *threshold = Some(match *threshold {
            Some(current) => current.min(frame_count),
            None => frame_count,
        });
    }

    pub fn reset_ignore_step_filters_flag(&self) {
        *self.ignore_filters_frame_count.lock() = None;
    }

    /// `true` while execution is deeper than the recorded threshold.
    pub fn check_ignore_step_filters_flag(&self, frame_count: usize) -> bool {
        self.ignore_filters_frame_count
            .lock()
            .is_some_and(|threshold| frame_count > threshold)
    }

    fn empty_context(&self) -> DebuggerContext {
        DebuggerContext::empty(self.this.clone())
    }

    fn require_suspend_context(&self) -> DebuggerResult<Arc<SuspendContext>> {
        if self.is_disposed() {
            return Err(DebuggerError::SessionDisposed);
        }
        self.suspend_context().ok_or(DebuggerError::NotSuspended)
    }

    pub fn step_over(&self) -> DebuggerResult<()> {
        let context = self.require_suspend_context()?;
        let command = self
            .step_providers
            .iter()
            .find_map(|provider| provider.step_over_command(&context))
            .unwrap_or_else(|| self.process.create_step_over_command(&context));
        self.step(command)
    }

    pub fn step_into(&self, ignore_filters: bool) -> DebuggerResult<()> {
        let context = self.require_suspend_context()?;
        let command = self
            .step_providers
            .iter()
            .find_map(|provider| provider.step_into_command(&context, ignore_filters))
            .unwrap_or_else(|| self.process.create_step_into_command(&context));

        if ignore_filters {
            if let Some(thread) = command.context_thread().cloned() {
                let session = self.this.clone();
                self.process.schedule(Priority::High, move |process| {
                    let (Some(session), Some(vm)) = (session.upgrade(), process.vm()) else {
                        return;
                    };
                    match vm.frame_count(&thread) {
                        Ok(frame_count) => session.set_ignore_step_filters_flag(frame_count),
                        Err(err) => {
                            tracing::debug!(target: "tether.session", thread = %thread, error = %err, "frame count unavailable");
                        }
                    }
                })?;
            }
        }
        self.step(command)
    }

    pub fn step_out(&self) -> DebuggerResult<()> {
        let context = self.require_suspend_context()?;
        let command = self
            .step_providers
            .iter()
            .find_map(|provider| provider.step_out_command(&context))
            .unwrap_or_else(|| self.process.create_step_out_command(&context));
        self.step(command)
    }

    pub fn run_to_cursor(&self, position: &CursorPosition) -> DebuggerResult<()> {
        let context = self.require_suspend_context()?;
        let command = self
            .step_providers
            .iter()
            .find_map(|provider| provider.run_to_cursor_command(&context, position))
            .unwrap_or_else(|| self.process.create_run_to_cursor_command(&context, position));
        self.step(command)
    }

    pub fn resume(&self) -> DebuggerResult<()> {
        let context = self.require_suspend_context()?;
        self.set_stepping_through(None);
        self.reset_ignore_step_filters_flag();
        self.resume_action(self.process.create_resume_command(&context), Event::Resume)
    }

    /// Suspend every thread of the target VM.
    pub fn pause(&self) -> DebuggerResult<()> {
        if self.is_disposed() {
            return Err(DebuggerError::SessionDisposed);
        }
        self.process.pause()
    }

    fn step(&self, command: ResumeCommand) -> DebuggerResult<()> {
        self.set_stepping_through(command.context_thread().cloned());
        self.resume_action(command, Event::Step)
    }

    fn resume_action(&self, command: ResumeCommand, event: Event) -> DebuggerResult<()> {
        self.set_state(self.empty_context(), State::WaitEvaluation, event, None);
        self.process.schedule_resume(command)
    }

    /// Republish the current context so listeners re-read it.
    pub fn refresh(&self, with_stack: bool) {
        let (state, context) = {
            let snapshot = self.snapshot.lock();
            (snapshot.state, snapshot.context.clone())
        };
        let context = match context.suspend_context() {
            Some(suspend_context) => DebuggerContext::suspended(
                self.this.clone(),
                suspend_context.clone(),
                context.thread().cloned(),
                None,
                None,
            ),
            None => self.empty_context(),
        };
        let event = if with_stack {
            Event::RefreshWithStack
        } else {
            Event::Refresh
        };
        self.set_state(context, state, event, None);
    }

    /// Make `suspend_context` the active context.
    pub fn switch_context(&self, suspend_context: &Arc<SuspendContext>) {
        let context = DebuggerContext::suspended(
            self.this.clone(),
            suspend_context.clone(),
            suspend_context.thread().cloned(),
            None,
            None,
        );
        self.set_state(context, State::Paused, Event::Context, None);
    }

    /// Dispose the debug process and publish `DISPOSED` on the dispatcher.
    /// Only the first call has an effect.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(target: "tether.session", session = %self.name, "disposing session");

        self.process.dispose();
        self.update_alarm.dispose();

        let session = self.this.clone();
        let scheduled = self.dispatcher.schedule(Priority::Normal, move || {
            if let Some(session) = session.upgrade() {
                session.apply_state(session.empty_context(), State::Disposed, Event::Dispose, None);
            }
        });
        if scheduled.is_err() {
            self.apply_state(self.empty_context(), State::Disposed, Event::Dispose, None);
        }
    }

    fn set_state(
        &self,
        context: DebuggerContext,
        state: State,
        event: Event,
        description: Option<String>,
    ) {
        let Some(suspend_context) = context.suspend_context().cloned() else {
            self.apply_state(context, state, event, description);
            return;
        };

        let session = self.this.clone();
        let scheduled = self.process.schedule(Priority::High, move |process| {
            let Some(session) = session.upgrade() else {
                return;
            };
            if suspend_context.is_resumed() {
                tracing::trace!(target: "tether.session", ?state, ?event, "suspend context resumed, state change skipped");
                return;
            }
            let vm = process.vm();
            context.init_caches(vm.as_deref(), &session.environment);
            let description = match state {
                State::Paused => description.or_else(|| Some(describe_paused(&context))),
                _ => description,
            };
            session.apply_state(context, state, event, description);
        });
        if let Err(err) = scheduled {
            tracing::debug!(target: "tether.session", ?state, ?event, error = %err, "state change dropped");
        }
    }

    fn apply_state(
        &self,
        context: DebuggerContext,
        state: State,
        event: Event,
        description: Option<String>,
    ) {
        let _guard = self.apply_lock.lock();
        {
            let mut snapshot = self.snapshot.lock();
            if snapshot.state == State::Disposed {
                return;
            }
            if event != Event::Dispose && self.is_disposed() {
                return;
            }
            *snapshot = Snapshot {
                state,
                event: Some(event),
                description,
                context: context.clone(),
            };
        }

        tracing::debug!(
            target: "tether.session",
            session = %self.name,
            ?state,
            ?event,
            "state changed"
        );
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            listener.state_changed(self, &context, state, event);
        }
    }

    fn fire_threads_refresh(&self) {
        let _guard = self.apply_lock.lock();
        let (state, context) = {
            let snapshot = self.snapshot.lock();
            if snapshot.state == State::Disposed || self.is_disposed() {
                return;
            }
            (snapshot.state, snapshot.context.clone())
        };
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            listener.state_changed(self, &context, state, Event::ThreadsRefresh);
        }
    }

    /// Debounced `THREADS_REFRESH`, used for thread start/death bursts.
    fn notify_threads_refresh(&self) {
        let session = self.this.clone();
        let delay = self.config().threads_refresh_delay();
        let requested = self.update_alarm.cancel_and_request(delay, move || {
            if let Some(session) = session.upgrade() {
                session.fire_threads_refresh();
            }
        });
        if let Err(err) = requested {
            tracing::trace!(target: "tether.session", error = %err, "threads refresh not requested");
        }
    }

    fn on_dispatcher(&self, f: impl FnOnce(&DebuggerSession) + Send + 'static) {
        let session = self.this.clone();
        let scheduled = self.dispatcher.schedule(Priority::Normal, move || {
            if let Some(session) = session.upgrade() {
                f(&session);
            }
        });
        if let Err(err) = scheduled {
            tracing::trace!(target: "tether.session", error = %err, "dispatcher unavailable");
        }
    }

    fn offer_context_switch(&self, offer: ContextSwitchOffer) {
        tracing::debug!(target: "tether.session", thread = %offer.thread, "breakpoint reached in another thread");
        self.on_dispatcher(move |session| {
            let listeners = session.listeners.lock().clone();
            for listener in &listeners {
                listener.context_switch_offered(session, &offer);
            }
        });
    }

    fn should_set_as_active_context(
        &self,
        suspend_context: &SuspendContext,
        stepping: Option<&ThreadRef>,
    ) -> bool {
        let Some(new_thread) = suspend_context.thread() else {
            return true;
        };
        if suspend_context.policy() == SuspendPolicy::All || stepping == Some(new_thread) {
            return true;
        }

        let current = self.context();
        let Some(current_suspend_context) = current.suspend_context() else {
            return stepping.is_none();
        };
        if self.config().breakpoints_during_evaluation {
            return current_suspend_context
                .thread()
                .map_or(true, |thread| thread == new_thread);
        }
        false
    }

    /// Runs on the command thread for every new suspension.
    fn paused(&self, suspend_context: &Arc<SuspendContext>) {
        if self.is_disposed() {
            return;
        }
        let stepping = self.stepping_through();
        let mut current_thread = suspend_context.thread().cloned();

        if !self.should_set_as_active_context(suspend_context, stepping.as_ref()) {
            self.on_dispatcher(DebuggerSession::fire_threads_refresh);
            if let Some(thread) = suspend_context.thread() {
                if !suspend_context.breakpoint_events().is_empty() {
                    self.offer_context_switch(ContextSwitchOffer {
                        thread: thread.clone(),
                        suspend_context: suspend_context.clone(),
                    });
                }
            }
            if self.process.suspend_manager().paused_contexts().len() > 1 {
                return;
            }
            current_thread = stepping;
        } else {
            self.set_stepping_through(None);
        }

        let Some(vm) = self.process.vm() else {
            return;
        };

        let frame = match current_thread.clone() {
            Some(thread) => top_frame(vm.as_ref(), &thread),
            None => {
                current_thread = self.select_pause_thread(vm.as_ref(), suspend_context);
                match &current_thread {
                    Some(thread) if self.wait_until_suspended(vm.as_ref(), thread) => {
                        top_frame(vm.as_ref(), thread)
                    }
                    _ => None,
                }
            }
        };

        if let Some(thread) = &current_thread {
            match vm.frame_count(thread) {
                Ok(frame_count) => {
                    let below_threshold = self
                        .ignore_filters_frame_count
                        .lock()
                        .is_some_and(|threshold| frame_count <= threshold);
                    if frame_count == 0 || below_threshold {
                        self.reset_ignore_step_filters_flag();
                    }
                }
                Err(err) => {
                    tracing::debug!(target: "tether.session", thread = %thread, error = %err, "frame count unavailable");
                    self.reset_ignore_step_filters_flag();
                }
            }
        }

        let mut position = frame
            .as_ref()
            .and_then(|frame| self.environment.resolve_position(&frame.location));
        if let Some(resolved) = position.clone() {
            position = Some(self.validate_breakpoints(suspend_context, frame.as_ref(), resolved));
        }

        let position = if suspend_context.thread() == current_thread.as_ref() {
            position
        } else {
            None
        };
        let context = DebuggerContext::suspended(
            self.this.clone(),
            suspend_context.clone(),
            current_thread,
            None,
            position,
        );
        self.set_state(context, State::Paused, Event::Pause, None);
    }

    /// Invalidate line breakpoints whose position no longer matches where
    /// execution stopped. Returns the position to display.
    fn validate_breakpoints(
        &self,
        suspend_context: &SuspendContext,
        frame: Option<&StackFrameInfo>,
        position: SourcePosition,
    ) -> SourcePosition {
        let breakpoints = self.process.breakpoint_manager();
        let source_missing = position.compiled;
        let mut displayed = position;

        for (id, _) in suspend_context.breakpoint_events() {
            let Some(breakpoint) = breakpoints.get(id) else {
                continue;
            };
            if breakpoint.kind != BreakpointKind::Line {
                continue;
            }
            match breakpoint.position {
                Some(breakpoint_position)
                    if source_missing || breakpoint_position.line == displayed.line =>
                {
                    if source_missing {
                        let class_name = frame
                            .map(|frame| frame.location.class_name.as_str())
                            .unwrap_or_default();
                        breakpoints.set_invalid(
                            id,
                            format!("Source for class '{class_name}' not found"),
                        );
                        displayed = breakpoint_position;
                    }
                }
                _ => {
                    breakpoints.delete_request(id);
                    breakpoints.set_invalid(id, "Breakpoint is out of sync: source changed");
                }
            }
        }
        displayed
    }

    /// Pick the thread to show after a "pause all" request.
    fn select_pause_thread(
        &self,
        vm: &dyn VirtualMachineProxy,
        suspend_context: &SuspendContext,
    ) -> Option<ThreadRef> {
        let previous = self
            .process
            .suspend_manager()
            .paused_contexts()
            .into_iter()
            .rev()
            .filter(|context| context.id() != suspend_context.id())
            .find_map(|context| context.thread().cloned());
        if previous.is_some() {
            return previous;
        }

        let threads = match vm.all_threads() {
            Ok(threads) => threads,
            Err(err) => {
                tracing::debug!(target: "tether.session", error = %err, "thread list unavailable");
                return None;
            }
        };

        let config = self.config();
        if let Some(dispatch) = threads
            .iter()
            .find(|thread| config.is_dispatch_thread(&thread.name))
        {
            return Some(dispatch.clone());
        }

        let mut selected = None;
        for thread in threads {
            let running = matches!(vm.thread_status(&thread), Ok(ThreadStatus::Running));
            selected = Some(thread);
            if running {
                break;
            }
        }
        selected
    }

    /// Right after a VM-wide suspend the VM may still report threads as
    /// running; poll until `thread` is reported suspended.
    fn wait_until_suspended(&self, vm: &dyn VirtualMachineProxy, thread: &ThreadRef) -> bool {
        let config = self.config();
        for _ in 0..config.suspend_poll_max_attempts.max(1) {
            match vm.is_suspended(thread) {
                Ok(true) => return true,
                Ok(false) => std::thread::sleep(config.suspend_poll_interval()),
                Err(err) if err.is_transient() => return false,
                Err(err) => {
                    tracing::warn!(target: "tether.session", thread = %thread, error = %err, "failed to query thread state");
                    return false;
                }
            }
        }
        tracing::warn!(target: "tether.session", thread = %thread, "thread did not report suspended");
        false
    }

    /// Runs on the command thread when a suspend context was resumed.
    fn resumed(&self) {
        match self.process.suspend_manager().paused_context() {
            Some(paused) => {
                let thread = match self.stepping_through() {
                    Some(stepping)
                        if paused.policy() == SuspendPolicy::All
                            || paused.thread() == Some(&stepping) =>
                    {
                        Some(stepping)
                    }
                    _ => paused.thread().cloned(),
                };
                let context =
                    DebuggerContext::suspended(self.this.clone(), paused, thread, None, None);
                self.set_state(context, State::Paused, Event::Context, None);
            }
            None => self.set_state(self.empty_context(), State::Running, Event::Context, None),
        }
    }
}

impl fmt::Debug for DebuggerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebuggerSession")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn top_frame(vm: &dyn VirtualMachineProxy, thread: &ThreadRef) -> Option<StackFrameInfo> {
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
}

fn describe_paused(context: &DebuggerContext) -> String {
    let event_thread = context.suspend_context().and_then(|c| c.thread());
    if event_thread.is_some() && event_thread != context.thread() {
        return "Paused in another thread".to_string();
    }
    match context.source_position() {
        Some(position) => format!("Paused at {position}"),
        None => "Paused".to_string(),
    }
}

fn connecting_text(process: &DebugProcess) -> String {
    let connection = process.connection();
    if connection.server_mode {
        format!("Listening to the target VM, {connection}")
    } else {
        format!("Connecting to the target VM, {connection}")
    }
}

/// Routes debug process callbacks into the session state machine.
struct SessionProcessListener {
    session: Weak<DebuggerSession>,
}

impl DebugProcessListener for SessionProcessListener {
    fn connector_is_ready(&self, process: &DebugProcess) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        session.set_state(
            session.empty_context(),
            State::WaitingAttach,
            Event::StartWaitAttach,
            Some(connecting_text(process)),
        );
    }

    fn process_attached(&self, process: &DebugProcess) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let text = format!("Connected to the target VM, {}", process.connection());
        if let Some(handle) = &session.environment.process_handle {
            handle.notify_text(&text);
        }
        session.set_state(session.empty_context(), State::Running, Event::Attached, Some(text));
    }

    fn attach_failed(&self, _process: &DebugProcess, message: &str) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if let Some(handle) = &session.environment.process_handle {
            handle.notify_text(message);
        }
        session.set_state(
            session.empty_context(),
            State::Stopped,
            Event::Detached,
            Some(message.to_string()),
        );
    }

    fn process_detached(&self, process: &DebugProcess, _closed_by_user: bool) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        session.set_stepping_through(None);
        if session.is_stopped() {
            return;
        }
        let text = format!("Disconnected from the target VM, {}", process.connection());
        if let Some(handle) = &session.environment.process_handle {
            handle.notify_text(&text);
        }
        session.set_state(session.empty_context(), State::Stopped, Event::Detached, Some(text));
    }

    fn paused(&self, _process: &DebugProcess, suspend_context: &Arc<SuspendContext>) {
        if let Some(session) = self.session.upgrade() {
            session.paused(suspend_context);
        }
    }

    fn resumed(&self, _process: &DebugProcess, _suspend_context: Option<&Arc<SuspendContext>>) {
        if let Some(session) = self.session.upgrade() {
            session.resumed();
        }
    }

    fn thread_started(&self, _process: &DebugProcess, _thread: &ThreadRef) {
        if let Some(session) = self.session.upgrade() {
            session.notify_threads_refresh();
        }
    }

    fn thread_stopped(&self, _process: &DebugProcess, thread: &ThreadRef) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        {
            let mut stepping = session.stepping_through.lock();
            if stepping.as_ref() == Some(thread) {
                *stepping = None;
            }
        }
        session.notify_threads_refresh();
    }
}
