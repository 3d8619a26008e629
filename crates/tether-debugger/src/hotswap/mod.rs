//! Hot swap: find classes recompiled since a session's last reload and
//! redefine them in the target VM.

mod manager;
mod progress;
mod reload;

use std::collections::BTreeMap;
use std::path::PathBuf;

pub use manager::HotSwapManager;
pub use progress::{HotSwapMessage, HotSwapProgress, MessageSeverity};
pub use reload::{ReloadClassesWorker, ReloadOutcome};

/// A compiled class file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotSwapFile {
    pub path: PathBuf,
}

/// Dotted qualified class name to class file, for one session.
pub type ModifiedClasses = BTreeMap<String, HotSwapFile>;
