use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{
    Connector, RedefinitionErrorKind, ReferenceType, ReferenceTypeId, RemoteConnection,
    StackFrameInfo, StepKind, ThreadId, ThreadRef, ThreadStatus, VirtualMachineProxy, VmError,
};

/// Scripted state for one thread of a [`MockVirtualMachine`].
#[derive(Debug, Clone)]
pub struct MockThread {
    pub thread: ThreadRef,
    pub status: ThreadStatus,
    pub suspended: bool,
    /// Number of `is_suspended` queries answered with `false` after a
    /// suspend, emulating VMs that report a thread as running for a short
    /// while after `VirtualMachine.suspend()`.
    pub suspend_lag: u32,
    pub frames: Vec<StackFrameInfo>,
    pub frames_collected: bool,
}

impl MockThread {
    pub fn new(id: ThreadId, name: impl Into<String>) -> Self {
        Self {
            thread: ThreadRef::new(id, name),
            status: ThreadStatus::Running,
            suspended: false,
            suspend_lag: 0,
            frames: Vec::new(),
            frames_collected: false,
        }
    }

    pub fn status(mut self, status: ThreadStatus) -> Self {
        self.status = status;
        self
    }

    pub fn suspended(mut self, suspended: bool) -> Self {
        self.suspended = suspended;
        self
    }

    pub fn suspend_lag(mut self, polls: u32) -> Self {
        self.suspend_lag = polls;
        self
    }

    pub fn frames(mut self, frames: Vec<StackFrameInfo>) -> Self {
        self.frames = frames;
        self
    }
}

#[derive(Default)]
struct MockState {
    threads: Vec<MockThread>,
    classes: BTreeMap<String, Vec<ReferenceType>>,
    redefine_failures: HashMap<ReferenceTypeId, (RedefinitionErrorKind, String)>,
    redefine_calls: Vec<Vec<ReferenceTypeId>>,
    redefined: HashMap<ReferenceTypeId, Vec<u8>>,
    cannot_redefine: bool,
    step_calls: Vec<(ThreadId, StepKind)>,
    run_to_calls: Vec<(String, u32)>,
    resumed_threads: Vec<ThreadId>,
    suspend_calls: usize,
    resume_calls: usize,
    disposed: bool,
    exit_code: Option<i32>,
}

/// Deterministic, in-memory virtual machine used by debugger tests.
#[derive(Default)]
pub struct MockVirtualMachine {
    state: Mutex<MockState>,
    suspended_queries: AtomicUsize,
}

impl MockVirtualMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_thread(&self, thread: MockThread) {
        self.state.lock().threads.push(thread);
    }

    pub fn set_frames(&self, thread_id: ThreadId, frames: Vec<StackFrameInfo>) {
        self.thread_mut(thread_id, |t| t.frames = frames);
    }

    /// Make frame queries for `thread_id` fail as if the thread object had
    /// been garbage collected.
    pub fn collect_thread(&self, thread_id: ThreadId) {
        self.thread_mut(thread_id, |t| t.frames_collected = true);
    }

    pub fn set_suspended(&self, thread_id: ThreadId, suspended: bool) {
        self.thread_mut(thread_id, |t| t.suspended = suspended);
    }

    pub fn load_class(&self, name: &str, id: ReferenceTypeId) -> ReferenceType {
        self.load_class_with_loader(name, id, None)
    }

    pub fn load_class_with_loader(
        &self,
        name: &str,
        id: ReferenceTypeId,
        class_loader: Option<u64>,
    ) -> ReferenceType {
        let ty = ReferenceType {
            id,
            name: name.to_string(),
            class_loader,
        };
        self.state
            .lock()
            .classes
            .entry(name.to_string())
            .or_default()
            .push(ty.clone());
        ty
    }

    /// Any redefinition request that includes `type_id` fails with `kind`.
    pub fn fail_redefinition(
        &self,
        type_id: ReferenceTypeId,
        kind: RedefinitionErrorKind,
        message: impl Into<String>,
    ) {
        self.state
            .lock()
            .redefine_failures
            .insert(type_id, (kind, message.into()));
    }

    pub fn set_can_redefine_classes(&self, can_redefine: bool) {
        self.state.lock().cannot_redefine = !can_redefine;
    }

    /// Every `redefine_classes` request, in call order, as the list of type ids.
    pub fn redefine_calls(&self) -> Vec<Vec<ReferenceTypeId>> {
        self.state.lock().redefine_calls.clone()
    }

    pub fn redefined_bytes(&self, type_id: ReferenceTypeId) -> Option<Vec<u8>> {
        self.state.lock().redefined.get(&type_id).cloned()
    }

    pub fn step_calls(&self) -> Vec<(ThreadId, StepKind)> {
        self.state.lock().step_calls.clone()
    }

    pub fn run_to_calls(&self) -> Vec<(String, u32)> {
        self.state.lock().run_to_calls.clone()
    }

    pub fn resumed_threads(&self) -> Vec<ThreadId> {
        self.state.lock().resumed_threads.clone()
    }

    pub fn suspend_calls(&self) -> usize {
        self.state.lock().suspend_calls
    }

    pub fn resume_calls(&self) -> usize {
        self.state.lock().resume_calls
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state.lock().exit_code
    }

    pub fn suspended_queries(&self) -> usize {
        self.suspended_queries.load(Ordering::SeqCst)
    }

    fn thread_mut<R>(&self, thread_id: ThreadId, f: impl FnOnce(&mut MockThread) -> R) -> Option<R> {
        let mut state = self.state.lock();
        state
            .threads
            .iter_mut()
            .find(|t| t.thread.id == thread_id)
            .map(f)
    }

    fn check_live(state: &MockState) -> Result<(), VmError> {
        if state.disposed || state.exit_code.is_some() {
            return Err(VmError::Disconnected);
        }
        Ok(())
    }
}

impl VirtualMachineProxy for MockVirtualMachine {
    fn description(&self) -> String {
        "Mock VM".to_string()
    }

    fn all_threads(&self) -> Result<Vec<ThreadRef>, VmError> {
        let state = self.state.lock();
        Self::check_live(&state)?;
        Ok(state.threads.iter().map(|t| t.thread.clone()).collect())
    }

    fn thread_status(&self, thread: &ThreadRef) -> Result<ThreadStatus, VmError> {
        let state = self.state.lock();
        state
            .threads
            .iter()
            .find(|t| t.thread.id == thread.id)
            .map(|t| t.status)
            .ok_or(VmError::ObjectCollected)
    }

    fn is_suspended(&self, thread: &ThreadRef) -> Result<bool, VmError> {
        self.suspended_queries.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let thread = state
            .threads
            .iter_mut()
            .find(|t| t.thread.id == thread.id)
            .ok_or(VmError::ObjectCollected)?;
        if thread.suspend_lag > 0 {
            thread.suspend_lag -= 1;
            return Ok(false);
        }
        Ok(thread.suspended)
    }

    fn frames(&self, thread: &ThreadRef) -> Result<Vec<StackFrameInfo>, VmError> {
        let state = self.state.lock();
        Self::check_live(&state)?;
        let mock = state
            .threads
            .iter()
            .find(|t| t.thread.id == thread.id)
            .ok_or(VmError::ObjectCollected)?;
        if mock.frames_collected {
            return Err(VmError::ObjectCollected);
        }
        if !mock.suspended {
            return Err(VmError::IncompatibleThreadState(thread.id));
        }
        Ok(mock.frames.clone())
    }

    fn classes_by_name(&self, name: &str) -> Result<Vec<ReferenceType>, VmError> {
        let state = self.state.lock();
        Self::check_live(&state)?;
        Ok(state.classes.get(name).cloned().unwrap_or_default())
    }

    fn can_redefine_classes(&self) -> bool {
        !self.state.lock().cannot_redefine
    }

    fn redefine_classes(&self, classes: &[(ReferenceType, Vec<u8>)]) -> Result<(), VmError> {
        let mut state = self.state.lock();
        Self::check_live(&state)?;
        tracing::debug!(target: "tether.vm", classes = classes.len(), "mock redefine_classes");
        state
            .redefine_calls
            .push(classes.iter().map(|(ty, _)| ty.id).collect());

        if state.cannot_redefine {
            return Err(VmError::Redefinition {
                kind: RedefinitionErrorKind::UnsupportedOperation,
                message: "target VM does not support class redefinition".to_string(),
            });
        }

        // The JVM applies a redefinition request atomically: one bad class
        // rejects the whole request.
        if let Some((kind, message)) = classes
            .iter()
            .find_map(|(ty, _)| state.redefine_failures.get(&ty.id))
            .cloned()
        {
            return Err(VmError::Redefinition { kind, message });
        }

        for (ty, bytes) in classes {
            state.redefined.insert(ty.id, bytes.clone());
        }
        Ok(())
    }

    fn suspend(&self) -> Result<(), VmError> {
        let mut state = self.state.lock();
        Self::check_live(&state)?;
        state.suspend_calls += 1;
        for thread in &mut state.threads {
            thread.suspended = true;
        }
        Ok(())
    }

    fn resume(&self) -> Result<(), VmError> {
        let mut state = self.state.lock();
        Self::check_live(&state)?;
        state.resume_calls += 1;
        for thread in &mut state.threads {
            thread.suspended = false;
        }
        Ok(())
    }

    fn resume_thread(&self, thread: &ThreadRef) -> Result<(), VmError> {
        let mut state = self.state.lock();
        Self::check_live(&state)?;
        state.resumed_threads.push(thread.id);
        if let Some(mock) = state.threads.iter_mut().find(|t| t.thread.id == thread.id) {
            mock.suspended = false;
        }
        Ok(())
    }

    fn step(&self, thread: &ThreadRef, kind: StepKind) -> Result<(), VmError> {
        let mut state = self.state.lock();
        Self::check_live(&state)?;
        state.step_calls.push((thread.id, kind));
        Ok(())
    }

    fn run_to_line(
        &self,
        _thread: Option<&ThreadRef>,
        class_name: &str,
        line: u32,
    ) -> Result<(), VmError> {
        let mut state = self.state.lock();
        Self::check_live(&state)?;
        state.run_to_calls.push((class_name.to_string(), line));
        Ok(())
    }

    fn dispose(&self) -> Result<(), VmError> {
        let mut state = self.state.lock();
        Self::check_live(&state)?;
        state.disposed = true;
        Ok(())
    }

    fn exit(&self, exit_code: i32) -> Result<(), VmError> {
        let mut state = self.state.lock();
        Self::check_live(&state)?;
        state.exit_code = Some(exit_code);
        Ok(())
    }
}

/// Connector handing out a shared [`MockVirtualMachine`].
pub struct MockConnector {
    vm: Arc<MockVirtualMachine>,
    open_failure: Option<String>,
    attach_failure: Option<String>,
    opened: AtomicUsize,
    attached: AtomicUsize,
}

impl MockConnector {
    pub fn new(vm: Arc<MockVirtualMachine>) -> Self {
        Self {
            vm,
            open_failure: None,
            attach_failure: None,
            opened: AtomicUsize::new(0),
            attached: AtomicUsize::new(0),
        }
    }

    /// `open` fails with `message` (for example a port already in use).
    pub fn failing_open(mut self, message: impl Into<String>) -> Self {
        self.open_failure = Some(message.into());
        self
    }

    /// `attach` fails with `message` (for example a connection refused).
    pub fn failing_attach(mut self, message: impl Into<String>) -> Self {
        self.attach_failure = Some(message.into());
        self
    }

    pub fn vm(&self) -> &Arc<MockVirtualMachine> {
        &self.vm
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn attach_count(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn open(&self, connection: &RemoteConnection) -> Result<(), VmError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        match &self.open_failure {
            Some(message) => Err(VmError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("{message} ({})", connection.address_display_name()),
            ))),
            None => Ok(()),
        }
    }

    fn attach(
        &self,
        connection: &RemoteConnection,
        _timeout: Duration,
    ) -> Result<Arc<dyn VirtualMachineProxy>, VmError> {
        self.attached.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(target: "tether.vm", address = %connection.address_display_name(), "mock attach");
        match &self.attach_failure {
            Some(message) => Err(VmError::Other(message.clone())),
            None => Ok(self.vm.clone() as Arc<dyn VirtualMachineProxy>),
        }
    }
}
