use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tether_config::DebuggerConfig;
use tether_scheduler::{Priority, SerialExecutor};
use tether_vm::{
    Connector, RemoteConnection, StepKind, SuspendPolicy, ThreadRef, VirtualMachineProxy, VmError,
    VmEvent,
};

use crate::breakpoints::BreakpointManager;
use crate::suspend::{SuspendContext, SuspendManager};
use crate::{DebuggerError, DebuggerResult};

/// Notifications from a [`DebugProcess`]. Every callback runs on the
/// process command thread.
#[allow(unused_variables)]
pub trait DebugProcessListener: Send + Sync {
    fn connector_is_ready(&self, process: &DebugProcess) {}
    fn process_attached(&self, process: &DebugProcess) {}
    fn process_detached(&self, process: &DebugProcess, closed_by_user: bool) {}
    fn attach_failed(&self, process: &DebugProcess, message: &str) {}
    fn paused(&self, process: &DebugProcess, suspend_context: &Arc<SuspendContext>) {}
    fn resumed(&self, process: &DebugProcess, suspend_context: Option<&Arc<SuspendContext>>) {}
    fn thread_started(&self, process: &DebugProcess, thread: &ThreadRef) {}
    fn thread_stopped(&self, process: &DebugProcess, thread: &ThreadRef) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Attaching,
    Attached,
    Detaching,
    Detached,
}

pub type CustomResumeAction =
    Arc<dyn Fn(&dyn VirtualMachineProxy, Option<&ThreadRef>) -> Result<(), VmError> + Send + Sync>;

/// What a [`ResumeCommand`] asks the VM to do before letting it run.
#[derive(Clone)]
pub enum ResumeAction {
    Resume,
    Step(StepKind),
    RunToLine { class_name: String, line: u32 },
    Custom(CustomResumeAction),
}

impl fmt::Debug for ResumeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeAction::Resume => f.write_str("Resume"),
            ResumeAction::Step(kind) => f.debug_tuple("Step").field(kind).finish(),
            ResumeAction::RunToLine { class_name, line } => f
                .debug_struct("RunToLine")
                .field("class_name", class_name)
                .field("line", line)
                .finish(),
            ResumeAction::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// A command that resumes a suspend context, optionally installing a step
/// or run-to-line request first.
#[derive(Debug, Clone)]
pub struct ResumeCommand {
    action: ResumeAction,
    thread: Option<ThreadRef>,
    suspend_context: Option<Arc<SuspendContext>>,
}

impl ResumeCommand {
    pub fn new(action: ResumeAction, suspend_context: Option<Arc<SuspendContext>>) -> Self {
        let thread = suspend_context
            .as_ref()
            .and_then(|context| context.thread().cloned());
        Self {
            action,
            thread,
            suspend_context,
        }
    }

    /// Override the thread the command acts on.
    pub fn with_thread(mut self, thread: Option<ThreadRef>) -> Self {
        self.thread = thread;
        self
    }

    pub fn action(&self) -> &ResumeAction {
        &self.action
    }

    /// The thread the command steps or resumes.
    pub fn context_thread(&self) -> Option<&ThreadRef> {
        self.thread.as_ref()
    }

    pub fn suspend_context(&self) -> Option<&Arc<SuspendContext>> {
        self.suspend_context.as_ref()
    }
}

/// Target of a run-to-cursor request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorPosition {
    pub class_name: String,
    pub line: u32,
}

/// One connection to a target VM, with its own command thread.
///
/// All VM traffic goes through the command thread; callers schedule work
/// with [`DebugProcess::schedule`] and receive results through
/// [`DebugProcessListener`] callbacks.
#[derive(Clone)]
pub struct DebugProcess {
    inner: Arc<ProcessInner>,
}

struct ProcessInner {
    connection: RemoteConnection,
    connector: Arc<dyn Connector>,
    config: DebuggerConfig,
    vm: RwLock<Option<Arc<dyn VirtualMachineProxy>>>,
    executor: SerialExecutor,
    suspend_manager: SuspendManager,
    breakpoints: BreakpointManager,
    listeners: Mutex<Vec<Arc<dyn DebugProcessListener>>>,
    state: Mutex<ProcessState>,
    state_changed: Condvar,
    disposed: AtomicBool,
}

impl DebugProcess {
    pub fn new(
        connection: RemoteConnection,
        connector: Arc<dyn Connector>,
        config: DebuggerConfig,
    ) -> DebuggerResult<Self> {
        let executor = SerialExecutor::spawn(format!(
            "tether-debugger {}",
            connection.address_display_name()
        ))
        .map_err(DebuggerError::Spawn)?;

        Ok(Self {
            inner: Arc::new(ProcessInner {
                connection,
                connector,
                config,
                vm: RwLock::new(None),
                executor,
                suspend_manager: SuspendManager::new(),
                breakpoints: BreakpointManager::new(),
                listeners: Mutex::new(Vec::new()),
                state: Mutex::new(ProcessState::Created),
                state_changed: Condvar::new(),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    pub fn connection(&self) -> &RemoteConnection {
        &self.inner.connection
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.inner.config
    }

    pub fn suspend_manager(&self) -> &SuspendManager {
        &self.inner.suspend_manager
    }

    pub fn breakpoint_manager(&self) -> &BreakpointManager {
        &self.inner.breakpoints
    }

    pub fn vm(&self) -> Option<Arc<dyn VirtualMachineProxy>> {
        self.inner.vm.read().clone()
    }

    pub fn require_vm(&self) -> DebuggerResult<Arc<dyn VirtualMachineProxy>> {
        self.vm().ok_or(DebuggerError::Vm(VmError::NotConnected))
    }

    pub fn state(&self) -> ProcessState {
        *self.inner.state.lock()
    }

    pub fn is_attached(&self) -> bool {
        self.state() == ProcessState::Attached
    }

    pub fn is_detaching(&self) -> bool {
        self.state() == ProcessState::Detaching
    }

    pub fn is_detached(&self) -> bool {
        self.state() == ProcessState::Detached
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// `true` when called from this process's command thread.
    pub fn is_command_thread(&self) -> bool {
        self.inner.executor.is_current()
    }

    pub fn add_listener(&self, listener: Arc<dyn DebugProcessListener>) {
        self.inner.listeners.lock().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn DebugProcessListener>) {
        self.inner
            .listeners
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    fn for_each_listener(&self, f: impl Fn(&dyn DebugProcessListener)) {
        let listeners = self.inner.listeners.lock().clone();
        for listener in &listeners {
            f(listener.as_ref());
        }
    }

    /// Run `f` on the command thread.
    pub fn schedule<F>(&self, priority: Priority, f: F) -> DebuggerResult<()>
    where
        F: FnOnce(&DebugProcess) + Send + 'static,
    {
        let process = self.clone();
        self.inner
            .executor
            .schedule(priority, move || f(&process))
            .map_err(DebuggerError::from)
    }

    /// Run `f` on the command thread and wait for its result. Runs inline
    /// when already on the command thread.
    pub fn invoke_and_wait<T, F>(&self, timeout: Option<Duration>, f: F) -> DebuggerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&DebugProcess) -> T + Send + 'static,
    {
        let process = self.clone();
        self.inner
            .executor
            .invoke_and_wait(Priority::Normal, timeout, move || f(&process))
            .map_err(DebuggerError::from)
    }

    fn set_state(&self, state: ProcessState) {
        *self.inner.state.lock() = state;
        self.inner.state_changed.notify_all();
    }

    /// Open the transport. Runs on the calling thread.
    pub fn open_connection(&self) -> DebuggerResult<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != ProcessState::Created {
                return Err(DebuggerError::ProcessDetached);
            }
            *state = ProcessState::Attaching;
        }

        self.inner
            .connector
            .open(&self.inner.connection)
            .map_err(|err| {
                self.set_state(ProcessState::Detached);
                DebuggerError::Attach {
                    address: self.inner.connection.address_display_name(),
                    message: err.to_string(),
                }
            })
    }

    /// Wait for (or connect to) the VM on the command thread. The outcome is
    /// reported through `process_attached` or `attach_failed`.
    pub fn start_attach(&self, timeout: Duration) -> DebuggerResult<()> {
        self.schedule(Priority::High, move |process| {
            if process.state() != ProcessState::Attaching {
                return;
            }
            process.for_each_listener(|listener| listener.connector_is_ready(process));

            match process
                .inner
                .connector
                .attach(&process.inner.connection, timeout)
            {
                Ok(vm) => {
                    tracing::debug!(
                        target: "tether.process",
                        address = %process.inner.connection.address_display_name(),
                        vm = %vm.description(),
                        "attached to target VM"
                    );
                    *process.inner.vm.write() = Some(vm);
                    process.set_state(ProcessState::Attached);
                    process.for_each_listener(|listener| listener.process_attached(process));
                }
                Err(err) => {
                    let message = format!(
                        "Unable to connect to the target VM, address: '{}', transport: '{}': {err}",
                        process.inner.connection.address_display_name(),
                        process.inner.connection.transport_name()
                    );
                    tracing::warn!(target: "tether.process", error = %err, "attach failed");
                    process.for_each_listener(|listener| listener.attach_failed(process, &message));
                    process.close_process(false);
                }
            }
        })
    }

    /// Deliver an event read from the VM event queue.
    pub fn dispatch_event(&self, event: VmEvent) -> DebuggerResult<()> {
        self.schedule(Priority::High, move |process| match event {
            VmEvent::Suspended(set) => {
                let Some(vm) = process.vm() else {
                    return;
                };
                if process.inner.breakpoints.mutes(&set.events) {
                    let resumed = match (set.policy, set.thread.as_ref()) {
                        (SuspendPolicy::None, _) => Ok(()),
                        (SuspendPolicy::EventThread, Some(thread)) => vm.resume_thread(thread),
                        _ => vm.resume(),
                    };
                    match resumed {
                        Ok(()) => tracing::debug!(target: "tether.process", thread = ?set.thread, "skipped muted breakpoint"),
                        Err(err) => tracing::warn!(target: "tether.process", error = %err, "failed to resume past muted breakpoint"),
                    }
                    return;
                }
                let context = process.inner.suspend_manager.push_suspend_context(
                    set.policy,
                    set.thread,
                    set.events,
                );
                tracing::debug!(target: "tether.process", context = ?context, "paused");
                process.for_each_listener(|listener| listener.paused(process, &context));
            }
            VmEvent::ThreadStarted(thread) => {
                process.for_each_listener(|listener| listener.thread_started(process, &thread));
            }
            VmEvent::ThreadDeath(thread) => {
                process.for_each_listener(|listener| listener.thread_stopped(process, &thread));
            }
            VmEvent::Disconnected => process.close_process(false),
        })
    }

    /// Suspend the whole VM.
    pub fn pause(&self) -> DebuggerResult<()> {
        self.schedule(Priority::High, |process| {
            let Some(vm) = process.vm() else {
                return;
            };
            if let Err(err) = vm.suspend() {
                tracing::warn!(target: "tether.process", error = %err, "failed to suspend VM");
                return;
            }
            let context =
                process
                    .inner
                    .suspend_manager
                    .push_suspend_context(SuspendPolicy::All, None, Vec::new());
            process.for_each_listener(|listener| listener.paused(process, &context));
        })
    }

    pub fn create_resume_command(&self, context: &Arc<SuspendContext>) -> ResumeCommand {
        ResumeCommand::new(ResumeAction::Resume, Some(context.clone()))
    }

    pub fn create_step_over_command(&self, context: &Arc<SuspendContext>) -> ResumeCommand {
        ResumeCommand::new(ResumeAction::Step(StepKind::Over), Some(context.clone()))
    }

    pub fn create_step_into_command(&self, context: &Arc<SuspendContext>) -> ResumeCommand {
        ResumeCommand::new(ResumeAction::Step(StepKind::Into), Some(context.clone()))
    }

    pub fn create_step_out_command(&self, context: &Arc<SuspendContext>) -> ResumeCommand {
        ResumeCommand::new(ResumeAction::Step(StepKind::Out), Some(context.clone()))
    }

    pub fn create_run_to_cursor_command(
        &self,
        context: &Arc<SuspendContext>,
        position: &CursorPosition,
    ) -> ResumeCommand {
        ResumeCommand::new(
            ResumeAction::RunToLine {
                class_name: position.class_name.clone(),
                line: position.line,
            },
            Some(context.clone()),
        )
    }

    /// Execute `command` on the command thread, resume its suspend context
    /// and notify listeners.
    pub fn schedule_resume(&self, command: ResumeCommand) -> DebuggerResult<()> {
        self.schedule(Priority::High, move |process| {
            if command
                .suspend_context()
                .is_some_and(|context| context.is_resumed())
            {
                return;
            }
            let Some(vm) = process.vm() else {
                return;
            };
            if let Err(err) = execute_resume(vm.as_ref(), &command) {
                tracing::warn!(
                    target: "tether.process",
                    action = ?command.action(),
                    error = %err,
                    "resume command failed"
                );
                return;
            }
            if let Some(context) = command.suspend_context() {
                process.inner.suspend_manager.resume(context);
            }
            process.for_each_listener(|listener| listener.resumed(process, command.suspend_context()));
        })
    }

    /// Detach from (or, with `force`, terminate) the target VM.
    pub fn stop(&self, force: bool) -> DebuggerResult<()> {
        self.schedule(Priority::High, move |process| {
            if let Some(vm) = process.vm() {
                let result = if force { vm.exit(-1) } else { vm.dispose() };
                if let Err(err) = result {
                    tracing::debug!(target: "tether.process", error = %err, force, "stop request failed");
                }
            }
            process.close_process(true);
            process.inner.executor.shutdown();
        })
    }

    /// Wait until the process is detached. Returns `false` on timeout.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while *state != ProcessState::Detached {
            if self
                .inner
                .state_changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return *state == ProcessState::Detached;
            }
        }
        true
    }

    fn close_process(&self, closed_by_user: bool) {
        {
            let mut state = self.inner.state.lock();
            if matches!(*state, ProcessState::Detaching | ProcessState::Detached) {
                return;
            }
            *state = ProcessState::Detaching;
        }

        self.inner.vm.write().take();
        self.inner.suspend_manager.clear();
        self.set_state(ProcessState::Detached);
        tracing::debug!(
            target: "tether.process",
            address = %self.inner.connection.address_display_name(),
            closed_by_user,
            "detached"
        );
        self.for_each_listener(|listener| listener.process_detached(self, closed_by_user));
    }

    /// Release the process. Detaches from the VM if still attached and shuts
    /// the command thread down. Runs at most once.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let scheduled = self.schedule(Priority::Normal, |process| {
            if let Some(vm) = process.vm() {
                if let Err(err) = vm.dispose() {
                    tracing::debug!(target: "tether.process", error = %err, "dispose request failed");
                }
            }
            process.close_process(false);
            process.inner.listeners.lock().clear();
            process.inner.executor.shutdown();
        });
        if scheduled.is_err() {
            // The command thread is already gone (stopped); nothing left to
            // detach from.
            self.inner.listeners.lock().clear();
            if !self.is_detached() {
                self.inner.vm.write().take();
                self.set_state(ProcessState::Detached);
            }
        }
    }
}

fn execute_resume(vm: &dyn VirtualMachineProxy, command: &ResumeCommand) -> Result<(), VmError> {
    let thread = command.context_thread();
    match command.action() {
        ResumeAction::Resume => {}
        ResumeAction::Step(kind) => match thread {
            Some(thread) => vm.step(thread, *kind)?,
            None => return Err(VmError::Other("step requires a thread".to_string())),
        },
        ResumeAction::RunToLine { class_name, line } => vm.run_to_line(thread, class_name, *line)?,
        ResumeAction::Custom(action) => action(vm, thread)?,
    }

    let policy = command
        .suspend_context()
        .map(|context| context.policy())
        .unwrap_or(SuspendPolicy::All);
    match (policy, command.suspend_context().and_then(|c| c.thread())) {
        (SuspendPolicy::EventThread, Some(thread)) => vm.resume_thread(thread),
        _ => vm.resume(),
    }
}

impl fmt::Debug for DebugProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugProcess")
            .field("connection", &self.inner.connection)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
