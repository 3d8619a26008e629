use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tether_scheduler::{CancellationToken, Priority};

use crate::process::DebugProcess;

type Action = Box<dyn FnOnce(&CancellationToken) + Send>;
type OnCancel = Box<dyn FnOnce() + Send>;

/// Runs one sub-command per debug process, each on its own command thread,
/// and waits for all of them. A single token cancels the whole batch.
pub struct MultiProcessCommand {
    token: CancellationToken,
    commands: Vec<(DebugProcess, Action, OnCancel)>,
}

impl MultiProcessCommand {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            commands: Vec::new(),
        }
    }

    /// `on_cancel` runs instead of `action` when the batch is cancelled
    /// before the sub-command starts, or when the process can no longer run
    /// it.
    pub fn add_command(
        &mut self,
        process: DebugProcess,
        action: impl FnOnce(&CancellationToken) + Send + 'static,
        on_cancel: impl FnOnce() + Send + 'static,
    ) {
        self.commands
            .push((process, Box::new(action), Box::new(on_cancel)));
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Run every sub-command and block until all of them finished or were
    /// cancelled.
    pub fn run(self) {
        let completion = Arc::new(Completion {
            remaining: Mutex::new(self.commands.len()),
            done: Condvar::new(),
        });

        for (process, action, on_cancel) in self.commands {
            let sub_command = SubCommand {
                token: self.token.clone(),
                action: Some(action),
                on_cancel: Some(on_cancel),
                _guard: CompletionGuard(Arc::clone(&completion)),
            };

            if process.is_command_thread() {
                sub_command.run();
                continue;
            }
            if let Err(err) = process.schedule(Priority::Normal, move |_| sub_command.run()) {
                // The rejected job was dropped, which already ran `on_cancel`.
                tracing::debug!(target: "tether.hotswap", error = %err, "sub-command rejected");
            }
        }

        let mut remaining = completion.remaining.lock();
        while *remaining > 0 {
            completion.done.wait(&mut remaining);
        }
    }
}

struct Completion {
    remaining: Mutex<usize>,
    done: Condvar,
}

struct CompletionGuard(Arc<Completion>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let mut remaining = self.0.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.0.done.notify_all();
        }
    }
}

struct SubCommand {
    token: CancellationToken,
    action: Option<Action>,
    on_cancel: Option<OnCancel>,
    _guard: CompletionGuard,
}

impl SubCommand {
    fn run(mut self) {
        if self.token.is_cancelled() {
            return;
        }
        self.on_cancel = None;
        if let Some(action) = self.action.take() {
            action(&self.token);
        }
    }
}

// A sub-command that never ran (cancelled, rejected, or dropped by a
// shutting-down executor) still reports through `on_cancel`.
impl Drop for SubCommand {
    fn drop(&mut self) {
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
    }
}
