use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tether_config::TetherConfig;
use tether_scheduler::{CancellationToken, SerialExecutor};
use tether_vm::Connector;

use crate::context::DebuggerContext;
use crate::environment::{Environment, ProcessKey};
use crate::process::DebugProcess;
use crate::session::{DebuggerSession, Event, SessionListener, State, StepCommandFactory};
use crate::{DebuggerError, DebuggerResult};

/// Session lifecycle notifications, delivered synchronously to every
/// registered listener in registration order.
#[allow(unused_variables)]
pub trait DebuggerManagerListener: Send + Sync {
    fn session_created(&self, session: &Arc<DebuggerSession>) {}
    fn session_attached(&self, session: &Arc<DebuggerSession>) {}
    fn session_detached(&self, session: &Arc<DebuggerSession>) {}
    fn session_removed(&self, session: &Arc<DebuggerSession>) {}
    fn session_disposed(&self, session: &Arc<DebuggerSession>) {}
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<ProcessKey, Arc<DebuggerSession>>,
    listeners: Vec<Arc<dyn DebuggerManagerListener>>,
}

/// Workspace-wide registry of debugger sessions keyed by the debuggee
/// process.
pub struct DebuggerManager {
    this: Weak<DebuggerManager>,
    config: TetherConfig,
    dispatcher: SerialExecutor,
    workspace_token: CancellationToken,
    registry: Mutex<Registry>,
    step_providers: Mutex<Vec<Arc<dyn StepCommandFactory>>>,
    disposed: AtomicBool,
}

impl DebuggerManager {
    /// Create a manager with its own dispatch thread.
    pub fn new(config: TetherConfig) -> DebuggerResult<Arc<Self>> {
        let dispatcher = SerialExecutor::spawn("tether-dispatch").map_err(DebuggerError::Spawn)?;
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            dispatcher,
            workspace_token: CancellationToken::new(),
            registry: Mutex::new(Registry::default()),
            step_providers: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    /// The dispatch thread all session-level UI work runs on.
    pub fn dispatcher(&self) -> &SerialExecutor {
        &self.dispatcher
    }

    /// Cancelled when the manager is disposed.
    pub fn workspace_token(&self) -> &CancellationToken {
        &self.workspace_token
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn add_listener(&self, listener: Arc<dyn DebuggerManagerListener>) {
        self.registry.lock().listeners.push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn DebuggerManagerListener>) {
        self.registry
            .lock()
            .listeners
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    /// Providers consulted, in registration order, before the default step
    /// commands of sessions created afterwards.
    pub fn register_step_command_factory(&self, factory: Arc<dyn StepCommandFactory>) {
        self.step_providers.lock().push(factory);
    }

    pub fn session_for(&self, key: ProcessKey) -> Option<Arc<DebuggerSession>> {
        self.registry.lock().sessions.get(&key).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<DebuggerSession>> {
        self.registry.lock().sessions.values().cloned().collect()
    }

    fn fire(&self, f: impl Fn(&dyn DebuggerManagerListener)) {
        let listeners = self.registry.lock().listeners.clone();
        for listener in &listeners {
            f(listener.as_ref());
        }
    }

    /// Connect a debugger to the process described by `environment`.
    ///
    /// Returns `Ok(None)` when there is no process to debug or the process
    /// went away while the session was being set up.
    pub fn attach_virtual_machine(
        &self,
        environment: Environment,
        connector: Arc<dyn Connector>,
    ) -> DebuggerResult<Option<Arc<DebuggerSession>>> {
        if self.is_disposed() {
            return Err(DebuggerError::SessionDisposed);
        }
        let Some(handle) = environment.process_handle.clone() else {
            tracing::debug!(target: "tether.manager", session = %environment.session_name, "no process to attach to");
            return Ok(None);
        };
        let key = handle.key();
        let is_remote = environment.is_remote;

        let process = DebugProcess::new(
            environment.connection.clone(),
            connector,
            self.config.debugger.clone(),
        )?;
        let step_providers = self.step_providers.lock().clone();
        let session = DebuggerSession::new(
            environment,
            process.clone(),
            self.dispatcher.clone(),
            step_providers,
            self.workspace_token.clone(),
        );
        session.add_listener(Arc::new(ManagerSessionListener {
            manager: self.this.clone(),
            session: Arc::downgrade(&session),
            key,
        }));

        if let Err(err) = session.attach() {
            tracing::warn!(target: "tether.manager", key = %key, error = %err, "attach failed");
            session.dispose();
            return Err(err);
        }

        if let Some(previous) = self.registry.lock().sessions.insert(key, session.clone()) {
            tracing::warn!(target: "tether.manager", key = %key, previous = previous.id(), "replacing registered session");
        }

        let stop_timeout = self.config.debugger.stop_timeout();
        let dispatcher = self.dispatcher.clone();
        let terminating = Arc::downgrade(&session);
        handle.add_termination_listener(Box::new(move |will_be_destroyed| {
            let Some(session) = terminating.upgrade() else {
                return;
            };
            // Remote debuggees are torn down by their own handler.
            if is_remote {
                session.dispose();
                return;
            }
            let process = session.process().clone();
            let force = will_be_destroyed && !process.is_command_thread();
            if let Err(err) = process.stop(force) {
                tracing::debug!(target: "tether.manager", error = %err, "stop not scheduled");
            }

            if process.is_command_thread() {
                session.dispose();
            } else if dispatcher.is_current() {
                let waiter = std::thread::Builder::new()
                    .name("tether-stop-wait".to_string())
                    .spawn({
                        let session = session.clone();
                        move || {
                            wait_for_stop(&session, stop_timeout);
                            session.dispose();
                        }
                    });
                if let Err(err) = waiter {
                    tracing::warn!(target: "tether.manager", error = %err, "failed to spawn stop waiter");
                    session.dispose();
                }
            } else {
                wait_for_stop(&session, stop_timeout);
                session.dispose();
            }
        }));

        tracing::debug!(target: "tether.manager", key = %key, session = %session.name(), "session created");
        self.fire(|listener| listener.session_created(&session));

        if process.is_detached() || process.is_detaching() {
            session.dispose();
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Detach the debugger from `key`'s process, leaving the process running.
    pub fn detach(&self, key: ProcessKey) -> DebuggerResult<()> {
        match self.session_for(key) {
            Some(session) => session.process().stop(false),
            None => Ok(()),
        }
    }

    /// Cancel outstanding work, dispose every session and stop the dispatch
    /// thread once pending notifications were delivered.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.workspace_token.cancel();
        for session in self.sessions() {
            session.dispose();
        }
        self.dispatcher.flush();
        self.dispatcher.shutdown();
    }

    fn on_session_event(&self, session: &Arc<DebuggerSession>, key: ProcessKey, event: Event) {
        match event {
            Event::Attached => self.fire(|listener| listener.session_attached(session)),
            Event::Detached => self.fire(|listener| listener.session_detached(session)),
            Event::Dispose => {
                let removed = {
                    let mut registry = self.registry.lock();
                    match registry.sessions.get(&key) {
                        Some(registered) if Arc::ptr_eq(registered, session) => {
                            registry.sessions.remove(&key)
                        }
                        _ => None,
                    }
                };
                if removed.is_some() {
                    tracing::debug!(target: "tether.manager", key = %key, "session removed");
                    self.fire(|listener| listener.session_removed(session));
                    self.fire(|listener| listener.session_disposed(session));
                }
            }
            _ => {}
        }
    }
}

fn wait_for_stop(session: &DebuggerSession, timeout: std::time::Duration) {
    if !session.process().wait_for(timeout) {
        tracing::warn!(
            target: "tether.manager",
            session = %session.name(),
            ?timeout,
            "debug process did not stop in time"
        );
    }
}

/// Translates session transitions into manager lifecycle notifications.
struct ManagerSessionListener {
    manager: Weak<DebuggerManager>,
    session: Weak<DebuggerSession>,
    key: ProcessKey,
}

impl SessionListener for ManagerSessionListener {
    fn state_changed(
        &self,
        _session: &DebuggerSession,
        _context: &DebuggerContext,
        _state: State,
        event: Event,
    ) {
        let (Some(manager), Some(session)) = (self.manager.upgrade(), self.session.upgrade()) else {
            return;
        };
        manager.on_session_event(&session, self.key, event);
    }
}

impl Drop for DebuggerManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
