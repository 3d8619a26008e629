use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tether_vm::{Location, RemoteConnection};

/// Identity of the OS process a debug session is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProcessKey(pub u64);

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process#{}", self.0)
    }
}

/// Called when the debuggee process is about to terminate. The argument is
/// `true` when the process is being destroyed (killed) rather than exiting on
/// its own.
pub type TerminationListener = Box<dyn Fn(bool) + Send + Sync>;

/// Handle to the launched (or remote) debuggee process, owned by the process
/// launcher.
pub trait ProcessHandle: Send + Sync {
    fn key(&self) -> ProcessKey;

    fn add_termination_listener(&self, listener: TerminationListener);

    fn is_terminated(&self) -> bool;

    /// Status text meant for the process console.
    fn notify_text(&self, _text: &str) {}
}

/// A source location resolved for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcePosition {
    pub file: PathBuf,
    /// 1-based line number.
    pub line: u32,
    /// `true` when no source file was found and `file` points at the
    /// compiled class instead.
    pub compiled: bool,
}

impl SourcePosition {
    pub fn source(file: impl Into<PathBuf>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
            compiled: false,
        }
    }

    pub fn compiled(file: impl Into<PathBuf>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
            compiled: true,
        }
    }

    pub fn file_name(&self) -> String {
        self.file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file.display().to_string())
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_name(), self.line)
    }
}

/// Maps VM locations to source positions.
pub trait PositionResolver: Send + Sync {
    fn resolve(&self, location: &Location) -> Option<SourcePosition>;
}

/// Source roots searched when resolving positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchScope {
    pub source_roots: Vec<PathBuf>,
}

impl SearchScope {
    pub fn new(source_roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            source_roots: source_roots.into_iter().collect(),
        }
    }

    fn resolve_in(&self, extra_roots: &[PathBuf], location: &Location) -> SourcePosition {
        let relative = source_relative_path(location);
        let found = self
            .source_roots
            .iter()
            .chain(extra_roots)
            .map(|root| root.join(&relative))
            .find(|candidate| candidate.is_file());

        match found {
            Some(file) => SourcePosition::source(file, location.line),
            None => SourcePosition::compiled(class_relative_path(&location.class_name), location.line),
        }
    }
}

impl PositionResolver for SearchScope {
    fn resolve(&self, location: &Location) -> Option<SourcePosition> {
        Some(self.resolve_in(&[], location))
    }
}

/// `com/example/Outer.java` for `com.example.Outer$Inner`, honouring the
/// `SourceFile` attribute when present.
fn source_relative_path(location: &Location) -> PathBuf {
    let outer = location
        .class_name
        .split('$')
        .next()
        .unwrap_or(&location.class_name);
    let mut segments: Vec<&str> = outer.split('.').collect();
    let simple_name = segments.pop().unwrap_or(outer);

    let mut path: PathBuf = segments.iter().collect();
    match &location.source_name {
        Some(source_name) => path.push(source_name),
        None => path.push(format!("{simple_name}.java")),
    }
    path
}

fn class_relative_path(class_name: &str) -> PathBuf {
    let mut path: PathBuf = class_name.split('.').collect();
    path.set_extension("class");
    path
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sdk {
    pub name: String,
    pub home: PathBuf,
    pub source_roots: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClasspathEntryKind {
    /// Compiler output of the workspace. Only these roots are scanned for
    /// hot swap.
    Output,
    Library,
    Sdk,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClasspathEntry {
    pub path: PathBuf,
    pub kind: ClasspathEntryKind,
}

impl ClasspathEntry {
    pub fn output(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: ClasspathEntryKind::Output,
        }
    }

    pub fn library(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: ClasspathEntryKind::Library,
        }
    }
}

/// Everything the process launcher hands over when a debug session is
/// started. The debugger core only reads from it.
#[derive(Clone)]
pub struct Environment {
    pub session_name: String,
    pub connection: RemoteConnection,
    pub search_scope: SearchScope,
    pub alternative_jre: Option<Sdk>,
    pub run_jre: Option<Sdk>,
    pub classpath: Vec<ClasspathEntry>,
    /// Upper bound for the attach handshake.
    pub poll_timeout: Duration,
    pub is_remote: bool,
    /// `None` when launching produced no process to debug.
    pub process_handle: Option<Arc<dyn ProcessHandle>>,
    pub position_resolver: Option<Arc<dyn PositionResolver>>,
}

impl Environment {
    pub fn new(session_name: impl Into<String>, connection: RemoteConnection) -> Self {
        Self {
            session_name: session_name.into(),
            connection,
            search_scope: SearchScope::default(),
            alternative_jre: None,
            run_jre: None,
            classpath: Vec::new(),
            poll_timeout: Duration::from_secs(10),
            is_remote: false,
            process_handle: None,
            position_resolver: None,
        }
    }

    pub fn with_process_handle(mut self, handle: Arc<dyn ProcessHandle>) -> Self {
        self.process_handle = Some(handle);
        self
    }

    pub fn with_classpath(mut self, classpath: impl IntoIterator<Item = ClasspathEntry>) -> Self {
        self.classpath.extend(classpath);
        self
    }

    pub fn with_search_scope(mut self, search_scope: SearchScope) -> Self {
        self.search_scope = search_scope;
        self
    }

    pub fn with_position_resolver(mut self, resolver: Arc<dyn PositionResolver>) -> Self {
        self.position_resolver = Some(resolver);
        self
    }

    pub fn remote(mut self, is_remote: bool) -> Self {
        self.is_remote = is_remote;
        self
    }

    pub fn output_roots(&self) -> Vec<PathBuf> {
        self.classpath
            .iter()
            .filter(|entry| entry.kind == ClasspathEntryKind::Output)
            .map(|entry| entry.path.clone())
            .collect()
    }

    /// The JRE used for class lookups: the alternative JRE when configured,
    /// else the one the debuggee runs on.
    pub fn effective_jre(&self) -> Option<&Sdk> {
        self.alternative_jre.as_ref().or(self.run_jre.as_ref())
    }

    pub fn resolve_position(&self, location: &Location) -> Option<SourcePosition> {
        if let Some(resolver) = &self.position_resolver {
            return resolver.resolve(location);
        }
        let jre_roots = self
            .effective_jre()
            .map(|sdk| sdk.source_roots.as_slice())
            .unwrap_or_default();
        Some(self.search_scope.resolve_in(jre_roots, location))
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("session_name", &self.session_name)
            .field("connection", &self.connection)
            .field("is_remote", &self.is_remote)
            .field("classpath", &self.classpath)
            .finish_non_exhaustive()
    }
}
