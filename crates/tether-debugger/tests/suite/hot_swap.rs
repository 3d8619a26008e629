use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tempfile::TempDir;
use tether_debugger::hotswap::{
    HotSwapFile, HotSwapManager, HotSwapMessage, HotSwapProgress, MessageSeverity,
    ModifiedClasses, ReloadClassesWorker, ReloadOutcome,
};
use tether_debugger::{BreakpointKind, ClasspathEntry, DebuggerManager, DebuggerSession, Event};
use tether_scheduler::{Priority, ProgressSender};
use tether_vm::{MockVirtualMachine, RedefinitionErrorKind};

use super::support::{launch, tether_config, Debuggee, Launch, Recorder};

const FRESH: Duration = Duration::from_secs(1);
const STALE: Duration = Duration::from_secs(20);

/// Write a class file under `root` and backdate it by `age`.
fn write_class(root: &Path, relative: &str, age: Duration) -> PathBuf {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, relative.as_bytes()).unwrap();
    std::fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(SystemTime::now() - age)
        .unwrap();
    path
}

fn progress() -> HotSwapProgress {
    HotSwapProgress::new(&ProgressSender::default(), "Reload classes")
}

fn texts(messages: &[HotSwapMessage]) -> Vec<(MessageSeverity, String)> {
    messages
        .iter()
        .map(|message| (message.severity, message.text.clone()))
        .collect()
}

struct HotSwapFixture {
    manager: Arc<DebuggerManager>,
    hot_swap: Arc<HotSwapManager>,
    output: TempDir,
    library: TempDir,
    debuggee: Debuggee,
    baseline: SystemTime,
}

impl HotSwapFixture {
    fn new(vm: Arc<MockVirtualMachine>) -> Self {
        let manager = DebuggerManager::new(tether_config()).unwrap();
        let hot_swap = HotSwapManager::install(&manager);
        let output = tempfile::tempdir().unwrap();
        let library = tempfile::tempdir().unwrap();
        let debuggee = launch(
            &manager,
            Launch::new(1).vm(vm).classpath([
                ClasspathEntry::output(output.path()),
                ClasspathEntry::library(library.path()),
            ]),
        );
        assert!(hot_swap.timestamp(&debuggee.session).is_some());

        let baseline = SystemTime::now() - Duration::from_secs(10);
        hot_swap.set_timestamp(&debuggee.session, baseline);
        Self {
            manager,
            hot_swap,
            output,
            library,
            debuggee,
            baseline,
        }
    }

    fn session(&self) -> &Arc<DebuggerSession> {
        &self.debuggee.session
    }

    fn compile(&self, relative: &str) -> PathBuf {
        write_class(self.output.path(), relative, FRESH)
    }

    fn scan(&self, progress: &HotSwapProgress) -> Vec<(Arc<DebuggerSession>, ModifiedClasses)> {
        self.hot_swap
            .scan_for_modified_classes(&[self.session().clone()], progress)
    }

    /// Scan, then reload whatever the scan found.
    fn scan_and_reload(&self, progress: &HotSwapProgress) -> ReloadOutcome {
        let modified = self.scan(progress);
        assert_eq!(modified.len(), 1, "nothing to reload");
        let mut outcomes = self.hot_swap.reload_classes(modified, progress);
        assert_eq!(outcomes.len(), 1);
        outcomes.remove(0).1
    }
}

impl Drop for HotSwapFixture {
    fn drop(&mut self) {
        self.manager.dispose();
    }
}

#[test]
fn scan_finds_classes_compiled_since_the_last_reload() {
    let fixture = HotSwapFixture::new(Arc::new(MockVirtualMachine::new()));
    let main = fixture.compile("com/example/A.class");
    fixture.compile("com/example/B$Inner.class");
    write_class(fixture.output.path(), "com/example/Old.class", STALE);
    write_class(fixture.output.path(), "com/example/A.java", FRESH);
    write_class(fixture.library.path(), "org/lib/Dependency.class", FRESH);

    let modified = fixture.scan(&progress());

    assert_eq!(modified.len(), 1);
    let (session, classes) = &modified[0];
    assert!(Arc::ptr_eq(session, fixture.session()));
    let names: Vec<&str> = classes.keys().map(String::as_str).collect();
    assert_eq!(names, ["com.example.A", "com.example.B$Inner"]);
    assert_eq!(classes["com.example.A"].path, main);
}

#[test]
fn sessions_without_changes_are_left_out() {
    let fixture = HotSwapFixture::new(Arc::new(MockVirtualMachine::new()));
    write_class(fixture.output.path(), "com/example/Old.class", STALE);

    assert!(fixture.scan(&progress()).is_empty());
    assert!(!fixture.session().is_modified_classes_scan_required());
}

#[test]
fn reload_counts_partially_redefined_classes() {
    let vm = Arc::new(MockVirtualMachine::new());
    vm.load_class("com.example.A", 1);
    vm.load_class("com.example.B", 2);
    vm.load_class_with_loader("com.example.C", 3, Some(1));
    vm.load_class_with_loader("com.example.C", 4, Some(2));
    vm.fail_redefinition(4, RedefinitionErrorKind::Verify, "inconsistent stack map");
    let fixture = HotSwapFixture::new(vm);
    let a = fixture.compile("com/example/A.class");
    fixture.compile("com/example/B.class");
    fixture.compile("com/example/C.class");
    let progress = progress();

    let outcome = fixture.scan_and_reload(&progress);

    assert_eq!(outcome.processed, 3);
    assert_eq!(outcome.partially_redefined, 1);
    assert!(!outcome.cancelled);
    let calls = fixture.debuggee.vm.redefine_calls();
    assert!(calls.contains(&vec![1, 2]), "{calls:?}");
    assert!(calls.contains(&vec![3]), "{calls:?}");
    assert_eq!(fixture.debuggee.vm.redefined_bytes(1), Some(std::fs::read(a).unwrap()));
    assert_eq!(fixture.debuggee.vm.redefined_bytes(4), None);

    let messages = progress.messages_for(fixture.session());
    assert_eq!(
        texts(&messages).last(),
        Some(&(
            MessageSeverity::Warning,
            "3 classes reloaded, 1 class partially redefined: not every loaded version was updated"
                .to_string()
        ))
    );
}

#[test]
fn reload_advances_the_session_timestamp() {
    let vm = Arc::new(MockVirtualMachine::new());
    vm.load_class("com.example.A", 1);
    let fixture = HotSwapFixture::new(vm);
    fixture.compile("com/example/A.class");

    let outcome = fixture.scan_and_reload(&progress());
    assert_eq!(outcome.processed, 1);

    let reloaded_at = fixture.hot_swap.timestamp(fixture.session()).unwrap();
    assert!(reloaded_at > fixture.baseline);
    assert!(fixture.scan(&progress()).is_empty());

    // A second reload moves the timestamp forward again.
    let modified = vec![(
        fixture.session().clone(),
        ModifiedClasses::from([(
            "com.example.A".to_string(),
            HotSwapFile {
                path: fixture.output.path().join("com/example/A.class"),
            },
        )]),
    )];
    fixture.hot_swap.reload_classes(modified, &progress());
    assert!(fixture.hot_swap.timestamp(fixture.session()).unwrap() > reloaded_at);
}

#[test]
fn classes_are_redefined_in_chunks() {
    let vm = Arc::new(MockVirtualMachine::new());
    for id in 0..250u64 {
        vm.load_class(&format!("com.example.C{id:03}"), id);
    }
    let fixture = HotSwapFixture::new(vm);
    for id in 0..250u64 {
        fixture.compile(&format!("com/example/C{id:03}.class"));
    }
    let progress = progress();

    let outcome = fixture.scan_and_reload(&progress);

    assert_eq!(outcome.processed, 250);
    let sizes: Vec<usize> = fixture
        .debuggee
        .vm
        .redefine_calls()
        .iter()
        .map(Vec::len)
        .collect();
    assert_eq!(sizes, vec![100, 100, 50]);
    assert_eq!(
        texts(&progress.messages()).last(),
        Some(&(MessageSeverity::Info, "250 classes reloaded".to_string()))
    );
}

#[test]
fn class_failing_in_every_version_is_reported_and_not_counted() {
    let vm = Arc::new(MockVirtualMachine::new());
    vm.load_class("com.example.A", 1);
    vm.load_class_with_loader("com.example.D", 2, Some(1));
    vm.load_class_with_loader("com.example.D", 3, Some(2));
    vm.fail_redefinition(2, RedefinitionErrorKind::ClassFormat, "truncated class file");
    vm.fail_redefinition(3, RedefinitionErrorKind::ClassFormat, "truncated class file");
    let fixture = HotSwapFixture::new(vm);
    fixture.compile("com/example/A.class");
    fixture.compile("com/example/D.class");
    let progress = progress();

    let outcome = fixture.scan_and_reload(&progress);

    assert_eq!(outcome.processed, 1);
    assert_eq!(outcome.partially_redefined, 0);
    let messages = progress.messages_for(fixture.session());
    let error = messages
        .iter()
        .find(|message| message.severity == MessageSeverity::Error)
        .unwrap();
    assert!(error.text.starts_with("com.example.D: "), "{}", error.text);
    assert_eq!(error.error_kind, Some(RedefinitionErrorKind::ClassFormat));
    assert_eq!(
        texts(&messages).last(),
        Some(&(MessageSeverity::Info, "1 class reloaded".to_string()))
    );
}

#[test]
fn rejected_chunk_reports_every_class_in_it() {
    let vm = Arc::new(MockVirtualMachine::new());
    vm.load_class("com.example.A", 1);
    vm.load_class("com.example.B", 2);
    vm.fail_redefinition(2, RedefinitionErrorKind::UnsupportedClassVersion, "major 99");
    let fixture = HotSwapFixture::new(vm);
    fixture.compile("com/example/A.class");
    fixture.compile("com/example/B.class");
    let progress = progress();

    let outcome = fixture.scan_and_reload(&progress);

    assert_eq!(outcome.processed, 0);
    let messages = progress.messages_for(fixture.session());
    let error = messages
        .iter()
        .find(|message| message.severity == MessageSeverity::Error)
        .unwrap();
    assert!(
        error.text.starts_with("Failed to redefine 2 classes: "),
        "{}",
        error.text
    );
    assert_eq!(
        error.error_kind,
        Some(RedefinitionErrorKind::UnsupportedClassVersion)
    );
    assert_eq!(fixture.debuggee.vm.redefined_bytes(1), None);
    // The worker ran, so the baseline still moves on.
    assert!(fixture.hot_swap.timestamp(fixture.session()).unwrap() > fixture.baseline);
}

#[test]
fn breakpoints_are_restored_and_the_session_refreshed() {
    let vm = Arc::new(MockVirtualMachine::new());
    vm.load_class("com.example.A", 1);
    let fixture = HotSwapFixture::new(vm);
    fixture.compile("com/example/A.class");
    let breakpoints = fixture.session().process().breakpoint_manager();
    let id = breakpoints.add(BreakpointKind::Line, "com.example.A", None);
    breakpoints.set_invalid(id, "Line numbers changed");
    let recorder = Arc::new(Recorder::default());
    fixture.session().add_listener(recorder.clone());

    fixture.scan_and_reload(&progress());
    fixture.manager.dispatcher().flush();

    assert!(breakpoints.are_enabled());
    assert_eq!(breakpoints.invalid_reason(id), None);
    assert!(recorder.count(Event::Refresh) >= 1);
}

#[test]
fn breakpoints_muted_before_a_reload_stay_muted() {
    let vm = Arc::new(MockVirtualMachine::new());
    vm.load_class("com.example.A", 1);
    let fixture = HotSwapFixture::new(vm);
    fixture.compile("com/example/A.class");
    let breakpoints = fixture.session().process().breakpoint_manager();
    breakpoints.disable_breakpoints();

    let outcome = fixture.scan_and_reload(&progress());
    fixture.manager.dispatcher().flush();

    assert_eq!(outcome.processed, 1);
    assert!(!breakpoints.are_enabled());
    assert!(breakpoints.enable_breakpoints());
    assert!(breakpoints.are_enabled());
}

#[test]
fn reload_started_on_the_dispatcher_does_not_wait_for_it() {
    let vm = Arc::new(MockVirtualMachine::new());
    vm.load_class("com.example.A", 1);
    let fixture = HotSwapFixture::new(vm);
    fixture.compile("com/example/A.class");
    let modified = fixture.scan(&progress());
    assert_eq!(modified.len(), 1);
    let recorder = Arc::new(Recorder::default());
    fixture.session().add_listener(recorder.clone());

    let hot_swap = fixture.hot_swap.clone();
    let progress = progress();
    let started = Instant::now();
    let outcomes = fixture
        .manager
        .dispatcher()
        .invoke_and_wait(Priority::Normal, Some(Duration::from_secs(30)), move || {
            hot_swap.reload_classes(modified, &progress)
        })
        .unwrap();

    assert!(
        started.elapsed() < Duration::from_secs(2),
        "reload took {:?}",
        started.elapsed()
    );
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].1.processed, 1);

    fixture.manager.dispatcher().flush();
    assert!(recorder.count(Event::Refresh) >= 1);
    assert!(fixture
        .session()
        .process()
        .breakpoint_manager()
        .are_enabled());
}

#[test]
fn target_without_redefinition_support_is_reported() {
    let vm = Arc::new(MockVirtualMachine::new());
    vm.load_class("com.example.A", 1);
    vm.set_can_redefine_classes(false);
    let fixture = HotSwapFixture::new(vm);
    fixture.compile("com/example/A.class");
    let progress = progress();

    let outcome = fixture.scan_and_reload(&progress);

    assert_eq!(outcome.processed, 0);
    assert_eq!(
        texts(&progress.messages_for(fixture.session())),
        vec![(
            MessageSeverity::Error,
            "Hot swap is not supported by the target VM".to_string()
        )]
    );
    assert!(fixture.debuggee.vm.redefine_calls().is_empty());
}

#[test]
fn cancelled_reload_keeps_the_baseline() {
    let vm = Arc::new(MockVirtualMachine::new());
    vm.load_class("com.example.A", 1);
    let fixture = HotSwapFixture::new(vm);
    fixture.compile("com/example/A.class");
    let modified = fixture.scan(&progress());
    assert_eq!(modified.len(), 1);
    assert!(!fixture.session().is_modified_classes_scan_required());

    let cancelled = progress();
    cancelled.cancel();
    let outcomes = fixture.hot_swap.reload_classes(modified, &cancelled);

    assert!(outcomes.is_empty());
    assert!(fixture.session().is_modified_classes_scan_required());
    assert_eq!(
        fixture.hot_swap.timestamp(fixture.session()),
        Some(fixture.baseline)
    );
    assert!(fixture.debuggee.vm.redefine_calls().is_empty());
}

#[test]
fn cancelled_scan_returns_nothing() {
    let fixture = HotSwapFixture::new(Arc::new(MockVirtualMachine::new()));
    fixture.compile("com/example/A.class");
    let cancelled = progress();
    cancelled.cancel();

    assert!(fixture.scan(&cancelled).is_empty());
    assert!(fixture.session().is_modified_classes_scan_required());
}

#[test]
fn worker_stops_before_the_first_class_when_cancelled() {
    let vm = Arc::new(MockVirtualMachine::new());
    vm.load_class("com.example.A", 1);
    let fixture = HotSwapFixture::new(vm);
    fixture.compile("com/example/A.class");
    let classes = fixture.scan(&progress()).remove(0).1;
    let cancelled = progress();
    cancelled.cancel();

    let outcome = ReloadClassesWorker::new(fixture.session(), &cancelled, fixture.hot_swap.config())
        .reload_classes(&classes);

    assert!(outcome.cancelled);
    assert_eq!(outcome.processed, 0);
    assert_eq!(
        texts(&cancelled.messages()),
        vec![(MessageSeverity::Info, "Hot swap cancelled".to_string())]
    );
    assert!(fixture.debuggee.vm.redefine_calls().is_empty());
}

#[test]
fn nothing_to_reload_is_reported() {
    let fixture = HotSwapFixture::new(Arc::new(MockVirtualMachine::new()));
    let progress = progress();

    let outcome = ReloadClassesWorker::new(fixture.session(), &progress, fixture.hot_swap.config())
        .reload_classes(&ModifiedClasses::new());

    assert_eq!(outcome.processed, 0);
    assert_eq!(
        texts(&progress.messages()),
        vec![(
            MessageSeverity::Info,
            "Loaded classes are up to date. Nothing to reload.".to_string()
        )]
    );
}

#[test]
fn build_output_is_matched_against_each_session_baseline() {
    let fixture = HotSwapFixture::new(Arc::new(MockVirtualMachine::new()));
    let late = launch(&fixture.manager, Launch::new(2));
    fixture
        .hot_swap
        .set_timestamp(&late.session, SystemTime::now() - Duration::from_secs(2));
    let root = fixture.output.path().to_path_buf();
    write_class(&root, "com/example/A.class", Duration::from_secs(5));
    write_class(&root, "com/example/notes.txt", FRESH);
    let generated = BTreeMap::from([(
        root.clone(),
        vec![
            PathBuf::from("com/example/A.class"),
            PathBuf::from("com/example/notes.txt"),
            PathBuf::from("com/example/Missing.class"),
        ],
    )]);

    let modified = fixture
        .hot_swap
        .find_modified_classes(&[fixture.session().clone(), late.session.clone()], &generated);

    assert_eq!(modified.len(), 1);
    let (session, classes) = &modified[0];
    assert!(Arc::ptr_eq(session, fixture.session()));
    assert_eq!(classes.len(), 1);
    assert_eq!(
        classes["com.example.A"].path,
        root.join("com/example/A.class")
    );
}

#[test]
fn removed_sessions_forget_their_timestamp() {
    let fixture = HotSwapFixture::new(Arc::new(MockVirtualMachine::new()));
    let session = fixture.session().clone();

    session.dispose();
    fixture.manager.dispatcher().flush();

    assert_eq!(fixture.hot_swap.timestamp(&session), None);
}
