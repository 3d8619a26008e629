use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tether_config::HotSwapConfig;
use tether_scheduler::{Cancelled, CancellationToken};
use walkdir::WalkDir;

use crate::hotswap::{
    HotSwapFile, HotSwapProgress, ModifiedClasses, ReloadClassesWorker, ReloadOutcome,
};
use crate::manager::{DebuggerManager, DebuggerManagerListener};
use crate::multi_process::MultiProcessCommand;
use crate::session::{DebuggerSession, SessionId};

const CLASS_EXTENSION: &str = "class";

type SessionResults<T> = Arc<Mutex<Vec<(Arc<DebuggerSession>, T)>>>;

/// Tracks, per session, when classes were last reloaded and finds the
/// classes compiled since.
pub struct HotSwapManager {
    config: HotSwapConfig,
    timestamps: Mutex<HashMap<SessionId, SystemTime>>,
}

impl HotSwapManager {
    pub fn new(config: HotSwapConfig) -> Self {
        Self {
            config,
            timestamps: Mutex::new(HashMap::new()),
        }
    }

    /// Create a hot swap manager that follows the sessions of `manager`.
    pub fn install(manager: &DebuggerManager) -> Arc<Self> {
        let hot_swap = Arc::new(Self::new(manager.config().hot_swap.clone()));
        manager.add_listener(hot_swap.clone());
        hot_swap
    }

    pub fn config(&self) -> &HotSwapConfig {
        &self.config
    }

    /// Time of the last reload of `session`, or of its creation.
    pub fn timestamp(&self, session: &DebuggerSession) -> Option<SystemTime> {
        self.timestamps.lock().get(&session.id()).copied()
    }

    pub fn set_timestamp(&self, session: &DebuggerSession, timestamp: SystemTime) {
        self.timestamps.lock().insert(session.id(), timestamp);
    }

    fn baseline(&self, session: &DebuggerSession) -> SystemTime {
        self.timestamp(session).unwrap_or(SystemTime::UNIX_EPOCH)
    }

    /// Walk the output roots of every attached session, each on its own
    /// command thread, and collect class files newer than the session's
    /// baseline. Sessions without changes are left out.
    ///
    /// A cancelled scan returns nothing and marks the sessions as needing a
    /// rescan.
    ///
    /// Blocks the calling thread until every session finished scanning. Safe
    /// to call from the dispatcher: the scan never waits on it.
    pub fn scan_for_modified_classes(
        &self,
        sessions: &[Arc<DebuggerSession>],
        progress: &HotSwapProgress,
    ) -> Vec<(Arc<DebuggerSession>, ModifiedClasses)> {
        let results: SessionResults<ModifiedClasses> = Arc::default();
        let mut command = MultiProcessCommand::new(progress.token());

        for session in sessions.iter().filter(|session| session.is_attached()) {
            let baseline = self.baseline(session);
            let scanned = Arc::clone(session);
            let results = Arc::clone(&results);
            let progress = progress.clone();
            command.add_command(
                session.process().clone(),
                move |token| {
                    match scan_session(&scanned, baseline, token, &progress) {
                        Ok(classes) if !classes.is_empty() => {
                            results.lock().push((scanned, classes));
                        }
                        Ok(_) => {}
                        Err(Cancelled) => scanned.set_modified_classes_scan_required(true),
                    }
                },
                || {},
            );
        }
        command.run();

        if progress.is_cancelled() {
            for session in sessions {
                session.set_modified_classes_scan_required(true);
            }
            return Vec::new();
        }
        take_results(results)
    }

    /// Match class files reported by a build against every attached
    /// session's baseline, without walking the output roots. `generated`
    /// maps an output root to the root-relative paths the build wrote.
    pub fn find_modified_classes(
        &self,
        sessions: &[Arc<DebuggerSession>],
        generated: &BTreeMap<PathBuf, Vec<PathBuf>>,
    ) -> Vec<(Arc<DebuggerSession>, ModifiedClasses)> {
        let baselines: Vec<(Arc<DebuggerSession>, SystemTime)> = sessions
            .iter()
            .filter(|session| session.is_attached())
            .map(|session| (Arc::clone(session), self.baseline(session)))
            .collect();
        let mut modified: Vec<ModifiedClasses> = vec![ModifiedClasses::new(); baselines.len()];

        for (root, relative_paths) in generated {
            for relative in relative_paths {
                let Some(qualified_name) = qualified_class_name(relative) else {
                    continue;
                };
                let path = root.join(relative);
                let Some(modified_at) = modified_time(&path) else {
                    continue;
                };
                for ((_, baseline), classes) in baselines.iter().zip(modified.iter_mut()) {
                    if modified_at > *baseline {
                        classes.insert(
                            qualified_name.clone(),
                            HotSwapFile { path: path.clone() },
                        );
                    }
                }
            }
        }

        baselines
            .into_iter()
            .zip(modified)
            .filter(|(_, classes)| !classes.is_empty())
            .map(|((session, _), classes)| (session, classes))
            .collect()
    }

    /// Redefine the given classes, each session on its own command thread.
    ///
    /// The reload time of a session advances once its worker ran, whether or
    /// not every class was redefined. Sessions whose reload was cancelled
    /// keep their baseline and are marked as needing a rescan.
    ///
    /// Blocks the calling thread until every worker returned. Session
    /// refreshes triggered by the reload are posted to the dispatcher, so
    /// when called from the dispatcher they run after this returns.
    pub fn reload_classes(
        self: &Arc<Self>,
        modified: Vec<(Arc<DebuggerSession>, ModifiedClasses)>,
        progress: &HotSwapProgress,
    ) -> Vec<(Arc<DebuggerSession>, ReloadOutcome)> {
        let results: SessionResults<ReloadOutcome> = Arc::default();
        let mut command = MultiProcessCommand::new(progress.token());

        for (session, classes) in modified {
            let previous = self.timestamp(&session);
            let cancelled_session = Arc::clone(&session);
            let manager = Arc::clone(self);
            let results = Arc::clone(&results);
            let progress = progress.clone();
            command.add_command(
                session.process().clone(),
                move |_token| {
                    let reload_time = next_reload_time(previous);
                    let outcome =
                        ReloadClassesWorker::new(&session, &progress, &manager.config)
                            .reload_classes(&classes);
                    if progress.is_cancelled() {
                        session.set_modified_classes_scan_required(true);
                    } else {
                        manager.set_timestamp(&session, reload_time);
                    }
                    results.lock().push((session, outcome));
                },
                move || cancelled_session.set_modified_classes_scan_required(true),
            );
        }
        command.run();
        take_results(results)
    }
}

impl DebuggerManagerListener for HotSwapManager {
    fn session_created(&self, session: &Arc<DebuggerSession>) {
        self.set_timestamp(session, SystemTime::now());
    }

    fn session_removed(&self, session: &Arc<DebuggerSession>) {
        self.timestamps.lock().remove(&session.id());
    }
}

fn take_results<T>(results: SessionResults<T>) -> Vec<(Arc<DebuggerSession>, T)> {
    std::mem::take(&mut *results.lock())
}

/// Strictly later than `previous`, even if the clock did not advance.
fn next_reload_time(previous: Option<SystemTime>) -> SystemTime {
    let now = SystemTime::now();
    match previous {
        Some(previous) if now <= previous => previous + Duration::from_nanos(1),
        _ => now,
    }
}

fn scan_session(
    session: &DebuggerSession,
    baseline: SystemTime,
    token: &CancellationToken,
    progress: &HotSwapProgress,
) -> Result<ModifiedClasses, Cancelled> {
    let mut classes = ModifiedClasses::new();
    for root in session.environment().output_roots() {
        collect_modified_classes(&root, baseline, token, progress, &mut classes)?;
    }
    tracing::debug!(
        target: "tether.hotswap",
        session = %session.name(),
        classes = classes.len(),
        "scanned output roots"
    );
    Ok(classes)
}

fn collect_modified_classes(
    root: &Path,
    baseline: SystemTime,
    token: &CancellationToken,
    progress: &HotSwapProgress,
    classes: &mut ModifiedClasses,
) -> Result<(), Cancelled> {
    for entry in WalkDir::new(root).sort_by_file_name() {
        if token.is_cancelled() {
            return Err(Cancelled);
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(target: "tether.hotswap", root = %root.display(), error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let Some(qualified_name) = qualified_class_name(relative) else {
            continue;
        };
        let newer = entry
            .metadata()
            .ok()
            .and_then(|metadata| metadata.modified().ok())
            .is_some_and(|modified| modified > baseline);
        if newer {
            progress.set_text(format!("Scanning {}", entry.path().display()));
            classes.insert(
                qualified_name,
                HotSwapFile {
                    path: entry.into_path(),
                },
            );
        }
    }
    Ok(())
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
}

/// `com/example/Foo$Bar.class` becomes `com.example.Foo$Bar`.
fn qualified_class_name(relative: &Path) -> Option<String> {
    if relative.extension().and_then(|ext| ext.to_str()) != Some(CLASS_EXTENSION) {
        return None;
    }
    let without_extension = relative.with_extension("");
    let segments: Vec<String> = without_extension
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("."))
}
