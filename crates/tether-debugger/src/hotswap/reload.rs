use std::sync::Arc;

use serde::Serialize;
use tether_config::HotSwapConfig;
use tether_scheduler::Priority;
use tether_vm::{ReferenceType, VirtualMachineProxy, VmError};

use crate::hotswap::{HotSwapFile, HotSwapProgress, MessageSeverity, ModifiedClasses};
use crate::session::DebuggerSession;
use crate::{DebuggerError, DebuggerResult};

/// Counts reported by one [`ReloadClassesWorker::reload_classes`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadOutcome {
    pub processed: usize,
    pub partially_redefined: usize,
    pub cancelled: bool,
}

/// Redefines the modified classes of one session. Runs on the session's
/// debug process command thread.
pub struct ReloadClassesWorker<'a> {
    session: &'a Arc<DebuggerSession>,
    progress: &'a HotSwapProgress,
    config: &'a HotSwapConfig,
}

impl<'a> ReloadClassesWorker<'a> {
    pub fn new(
        session: &'a Arc<DebuggerSession>,
        progress: &'a HotSwapProgress,
        config: &'a HotSwapConfig,
    ) -> Self {
        Self {
            session,
            progress,
            config,
        }
    }

    pub fn reload_classes(&self, classes: &ModifiedClasses) -> ReloadOutcome {
        let mut outcome = ReloadOutcome::default();
        if classes.is_empty() {
            self.progress.add_message(
                self.session,
                MessageSeverity::Info,
                "Loaded classes are up to date. Nothing to reload.",
            );
            return outcome;
        }

        let process = self.session.process();
        let vm = match process.require_vm() {
            Ok(vm) => vm,
            Err(err) => {
                self.progress
                    .add_message(self.session, MessageSeverity::Error, err.to_string());
                return outcome;
            }
        };
        if !vm.can_redefine_classes() {
            self.progress.add_message(
                self.session,
                MessageSeverity::Error,
                "Hot swap is not supported by the target VM",
            );
            return outcome;
        }

        let muted = self.config.reload_with_breakpoints_disabled;
        if muted {
            process.breakpoint_manager().disable_breakpoints();
        }

        let mut processor = RedefineProcessor::new(vm.as_ref(), self.config.redefinition_chunk_size);
        let total = classes.len();
        for (index, (qualified_name, file)) in classes.iter().enumerate() {
            if process.is_detached() || process.is_detaching() {
                break;
            }
            // Once a class went through, finish the batch.
            if processor.processed == 0 && self.progress.is_cancelled() {
                break;
            }

            self.progress.set_text(qualified_name.as_str());
            self.progress.set_fraction((index + 1) as f64 / total as f64);
            if let Err(err) = processor.process_class(qualified_name, file) {
                self.report_problem(qualified_name, &err);
            }
            if processor.is_chunk_full() {
                if let Err(failure) = processor.process_chunk() {
                    self.report_chunk_failure(failure);
                }
            }
        }

        if processor.processed == 0 && self.progress.is_cancelled() {
            outcome.cancelled = true;
            self.progress
                .add_message(self.session, MessageSeverity::Info, "Hot swap cancelled");
        } else {
            if let Err(failure) = processor.process_pending() {
                self.report_chunk_failure(failure);
            }
            self.progress.set_fraction(1.0);
            outcome.processed = processor.processed;
            outcome.partially_redefined = processor.partially_redefined;
            self.report_summary(&outcome);
        }

        self.restore_breakpoints(muted);
        tracing::debug!(
            target: "tether.hotswap",
            session = %self.session.name(),
            processed = outcome.processed,
            partially_redefined = outcome.partially_redefined,
            cancelled = outcome.cancelled,
            "classes reloaded"
        );
        outcome
    }

    fn report_summary(&self, outcome: &ReloadOutcome) {
        if outcome.partially_redefined == 0 {
            self.progress.add_message(
                self.session,
                MessageSeverity::Info,
                format!("{} reloaded", classes(outcome.processed)),
            );
        } else {
            self.progress.add_message(
                self.session,
                MessageSeverity::Warning,
                format!(
                    "{} reloaded, {} partially redefined: not every loaded version was updated",
                    classes(outcome.processed),
                    classes(outcome.partially_redefined)
                ),
            );
        }
    }

    fn report_problem(&self, qualified_name: &str, err: &DebuggerError) {
        let error_kind = match err {
            DebuggerError::Vm(err) => err.redefinition_kind(),
            _ => None,
        };
        self.progress
            .add_error(self.session, format!("{qualified_name}: {err}"), error_kind);
    }

    fn report_chunk_failure(&self, failure: ChunkFailure) {
        self.progress.add_error(
            self.session,
            format!("Failed to redefine {}: {}", classes(failure.classes), failure.error),
            failure.error.redefinition_kind(),
        );
    }

    /// Undo this run's `disable_breakpoints`, then drop stale breakpoint
    /// warnings and refresh the session on the dispatcher.
    ///
    /// The refresh is posted rather than waited for: the thread that started
    /// the reload may be the dispatcher itself, blocked until this worker
    /// returns.
    fn restore_breakpoints(&self, muted: bool) {
        let session = Arc::clone(self.session);
        if muted {
            session.process().breakpoint_manager().enable_breakpoints();
        }
        if session.workspace_token().is_cancelled() {
            return;
        }

        let target = Arc::clone(&session);
        let scheduled = session.dispatcher().schedule(Priority::Normal, move || {
            if target.workspace_token().is_cancelled() {
                return;
            }
            target.process().breakpoint_manager().clear_invalid();
            target.refresh(false);
        });
        if let Err(err) = scheduled {
            tracing::warn!(target: "tether.hotswap", session = %session.name(), error = %err, "failed to refresh session after reload");
        }
    }
}

fn classes(count: usize) -> String {
    if count == 1 {
        "1 class".to_string()
    } else {
        format!("{count} classes")
    }
}

/// A redefinition request for a whole chunk that the VM rejected.
struct ChunkFailure {
    classes: usize,
    error: VmError,
}

/// Batches single-version classes into redefinition requests of at most
/// `chunk_size` classes; classes loaded by several class loaders are
/// redefined one version at a time.
struct RedefineProcessor<'vm> {
    vm: &'vm dyn VirtualMachineProxy,
    chunk_size: usize,
    pending: Vec<(ReferenceType, Vec<u8>)>,
    processed: usize,
    partially_redefined: usize,
}

impl<'vm> RedefineProcessor<'vm> {
    fn new(vm: &'vm dyn VirtualMachineProxy, chunk_size: usize) -> Self {
        Self {
            vm,
            chunk_size: chunk_size.max(1),
            pending: Vec::new(),
            processed: 0,
            partially_redefined: 0,
        }
    }

    /// Queue a single-version class, or redefine every version of a class
    /// loaded more than once. Returns the first failure when no version
    /// could be redefined.
    fn process_class(&mut self, qualified_name: &str, file: &HotSwapFile) -> DebuggerResult<()> {
        let types = self.vm.classes_by_name(qualified_name)?;
        if types.is_empty() {
            return Ok(());
        }
        let bytes = std::fs::read(&file.path).map_err(|source| DebuggerError::Io {
            path: file.path.clone(),
            source,
        })?;

        if let [ty] = types.as_slice() {
            self.pending.push((ty.clone(), bytes));
            self.processed += 1;
            return Ok(());
        }

        let mut redefined = 0;
        let mut first_error: Option<VmError> = None;
        for ty in &types {
            match self.vm.redefine_classes(&[(ty.clone(), bytes.clone())]) {
                Ok(()) => redefined += 1,
                Err(err) => {
                    tracing::debug!(target: "tether.hotswap", class = %qualified_name, loader = ?ty.class_loader, error = %err, "version not redefined");
                    first_error.get_or_insert(err);
                }
            }
        }
        if redefined == 0 {
            if let Some(err) = first_error {
                return Err(err.into());
            }
        }
        if redefined < types.len() {
            self.partially_redefined += 1;
        }
        self.processed += 1;
        Ok(())
    }

    fn is_chunk_full(&self) -> bool {
        self.pending.len() >= self.chunk_size
    }

    /// Redefine every queued class in one request. The VM applies a request
    /// atomically, so a failure takes the whole chunk out of the processed
    /// count.
    fn process_chunk(&mut self) -> Result<(), ChunkFailure> {
        let chunk = std::mem::take(&mut self.pending);
        tracing::trace!(target: "tether.hotswap", classes = chunk.len(), "redefining chunk");
        self.vm.redefine_classes(&chunk).map_err(|error| {
            self.processed -= chunk.len();
            ChunkFailure {
                classes: chunk.len(),
                error,
            }
        })
    }

    fn process_pending(&mut self) -> Result<(), ChunkFailure> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.process_chunk()
    }
}
