use std::sync::Arc;
use std::time::Duration;

use tether_debugger::{DebuggerError, Event, ProcessState, State};
use tether_vm::{
    MockConnector, MockThread, MockVirtualMachine, RemoteConnection, SuspendPolicy,
    VirtualMachineProxy, VmEvent,
};

use super::support::{breakpoint_hit, stopped_thread, thread, FixtureOptions, SessionFixture};

const LISTENING: &str = "address: '5005', transport: 'socket'";

#[test]
fn attach_reports_waiting_then_running() {
    let fixture = SessionFixture::new(
        Arc::new(MockVirtualMachine::new()),
        FixtureOptions::default(),
    );
    assert_eq!(fixture.session.state(), State::Stopped);
    assert_eq!(fixture.session.event(), None);

    fixture.session.attach().unwrap();
    fixture.wait_for_state(State::Running);

    assert_eq!(
        fixture.recorder.events(),
        vec![
            (State::WaitingAttach, Event::StartWaitAttach),
            (State::WaitingAttach, Event::StartWaitAttach),
            (State::Running, Event::Attached),
        ]
    );
    let transitions = fixture.recorder.transitions();
    assert_eq!(
        transitions[0].description.as_deref(),
        Some(format!("Listening to the target VM, {LISTENING}").as_str())
    );
    let connected = format!("Connected to the target VM, {LISTENING}");
    assert_eq!(fixture.session.state_description(), Some(connected.clone()));
    assert_eq!(fixture.handle.texts(), vec![connected]);

    assert!(fixture.session.is_attached());
    assert_eq!(fixture.process.state(), ProcessState::Attached);
    assert_eq!(fixture.connector.open_count(), 1);
    assert_eq!(fixture.connector.attach_count(), 1);
    fixture.recorder.assert_context_invariant();
}

#[test]
fn connecting_to_a_remote_address_says_so() {
    let options = FixtureOptions {
        connection: RemoteConnection::socket("build-agent", 8000),
        ..FixtureOptions::default()
    };
    let fixture = SessionFixture::attached_with(Arc::new(MockVirtualMachine::new()), options);

    let first = &fixture.recorder.transitions()[0];
    assert_eq!(
        first.description.as_deref(),
        Some("Connecting to the target VM, address: 'build-agent:8000', transport: 'socket'")
    );
}

#[test]
fn failing_to_open_the_transport_returns_an_error() {
    let vm = Arc::new(MockVirtualMachine::new());
    let options = FixtureOptions {
        connector: Some(MockConnector::new(vm.clone()).failing_open("port in use")),
        ..FixtureOptions::default()
    };
    let fixture = SessionFixture::new(vm, options);

    let err = fixture.session.attach().unwrap_err();
    match err {
        DebuggerError::Attach { address, message } => {
            assert_eq!(address, "5005");
            assert!(message.contains("port in use"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    fixture.settle();
    assert_eq!(fixture.session.state(), State::Stopped);
    assert!(fixture.recorder.events().is_empty());
    assert!(fixture.process.is_detached());
    assert_eq!(fixture.connector.attach_count(), 0);
}

#[test]
fn failing_to_attach_stops_the_session() {
    let vm = Arc::new(MockVirtualMachine::new());
    let options = FixtureOptions {
        connector: Some(MockConnector::new(vm.clone()).failing_attach("connection refused")),
        ..FixtureOptions::default()
    };
    let fixture = SessionFixture::new(vm, options);

    fixture.session.attach().unwrap();
    assert!(fixture.process.wait_for(Duration::from_secs(5)));
    fixture.settle();

    let last = fixture.recorder.last().unwrap();
    assert_eq!((last.state, last.event), (State::Stopped, Event::Detached));
    let description = last.description.unwrap();
    assert!(
        description.starts_with(&format!("Unable to connect to the target VM, {LISTENING}")),
        "{description}"
    );
    assert!(description.ends_with("connection refused"), "{description}");
    assert_eq!(fixture.recorder.count(Event::Detached), 1);
    assert!(fixture.handle.texts().contains(&description));
    assert!(!fixture.session.is_attached());
}

#[test]
fn detaching_reports_disconnected() {
    let fixture = SessionFixture::attached(Arc::new(MockVirtualMachine::new()));

    fixture.process.stop(false).unwrap();
    assert!(fixture.process.wait_for(Duration::from_secs(5)));
    fixture.settle();

    assert_eq!(fixture.session.state(), State::Stopped);
    assert_eq!(fixture.session.event(), Some(Event::Detached));
    assert_eq!(
        fixture.session.state_description(),
        Some(format!("Disconnected from the target VM, {LISTENING}"))
    );
    assert!(fixture.vm.is_disposed());
    assert_eq!(fixture.vm.exit_code(), None);
    assert!(fixture.process.vm().is_none());
}

#[test]
fn forced_stop_terminates_the_target() {
    let fixture = SessionFixture::attached(Arc::new(MockVirtualMachine::new()));

    fixture.process.stop(true).unwrap();
    assert!(fixture.process.wait_for(Duration::from_secs(5)));

    assert_eq!(fixture.vm.exit_code(), Some(-1));
    assert!(!fixture.vm.is_disposed());
}

#[test]
fn vm_disconnect_stops_the_session() {
    let vm = Arc::new(MockVirtualMachine::new());
    vm.add_thread(stopped_thread(1, "main", 10));
    let fixture = SessionFixture::attached(vm);

    fixture.dispatch(breakpoint_hit(&thread(1, "main"), SuspendPolicy::EventThread, 1, 10));
    assert_eq!(fixture.session.state(), State::Paused);

    fixture.dispatch(VmEvent::Disconnected);
    assert_eq!(fixture.session.state(), State::Stopped);
    assert!(fixture.session.suspend_context().is_none());
    assert!(fixture.process.suspend_manager().paused_contexts().is_empty());
    fixture.recorder.assert_context_invariant();
}

#[test]
fn dispose_is_terminal() {
    let vm = Arc::new(MockVirtualMachine::new());
    vm.add_thread(stopped_thread(1, "main", 10));
    let fixture = SessionFixture::attached(vm);
    fixture.dispatch(breakpoint_hit(&thread(1, "main"), SuspendPolicy::EventThread, 1, 10));
    let suspended = fixture.session.suspend_context().unwrap();

    fixture.session.dispose();
    fixture.session.dispose();
    fixture.wait_for_state(State::Disposed);

    assert!(fixture.session.is_disposed());
    assert_eq!(fixture.recorder.count(Event::Dispose), 1);
    let recorded = fixture.recorder.transitions().len();

    fixture.session.refresh(true);
    fixture.session.switch_context(&suspended);
    assert!(matches!(
        fixture.session.attach(),
        Err(DebuggerError::SessionDisposed)
    ));
    assert!(matches!(
        fixture.session.pause(),
        Err(DebuggerError::SessionDisposed)
    ));
    assert!(matches!(
        fixture.session.step_over(),
        Err(DebuggerError::SessionDisposed)
    ));
    fixture.settle();

    assert_eq!(fixture.session.state(), State::Disposed);
    assert_eq!(fixture.recorder.transitions().len(), recorded);
    assert!(fixture.vm.is_disposed());
    assert!(fixture.process.is_disposed());
    fixture.recorder.assert_context_invariant();
}

#[test]
fn dispose_detaches_even_when_the_vm_is_already_gone() {
    let fixture = SessionFixture::attached(Arc::new(MockVirtualMachine::new()));
    fixture.vm.dispose().unwrap();

    fixture.session.dispose();
    fixture.wait_for_state(State::Disposed);

    assert!(fixture.process.is_disposed());
    assert!(fixture.process.wait_for(Duration::from_secs(5)));
    assert!(fixture.process.vm().is_none());
    assert_eq!(fixture.recorder.count(Event::Dispose), 1);
}

#[test]
fn nothing_is_published_after_dispose() {
    let vm = Arc::new(MockVirtualMachine::new());
    vm.add_thread(stopped_thread(1, "main", 10));
    vm.add_thread(MockThread::new(2, "worker"));
    let fixture = SessionFixture::attached(vm);

    let main = thread(1, "main");
    fixture
        .process
        .dispatch_event(breakpoint_hit(&main, SuspendPolicy::EventThread, 1, 10))
        .unwrap();
    fixture
        .process
        .dispatch_event(VmEvent::ThreadStarted(thread(2, "worker")))
        .unwrap();
    fixture.session.dispose();
    fixture.wait_for_state(State::Disposed);

    let transitions = fixture.recorder.transitions();
    let dispose_at = transitions
        .iter()
        .position(|transition| transition.event == Event::Dispose)
        .unwrap();
    assert_eq!(dispose_at, transitions.len() - 1, "{transitions:?}");
}

#[test]
fn thread_start_and_death_refresh_the_thread_list() {
    let fixture = SessionFixture::attached(Arc::new(MockVirtualMachine::new()));
    fixture.recorder.clear();

    fixture.dispatch(VmEvent::ThreadStarted(thread(7, "pool-1-thread-1")));
    assert!(fixture.recorder.count(Event::ThreadsRefresh) >= 1);
    let refresh = fixture.recorder.last_with(Event::ThreadsRefresh).unwrap();
    assert_eq!(refresh.state, State::Running);

    fixture.recorder.clear();
    fixture.dispatch(VmEvent::ThreadDeath(thread(7, "pool-1-thread-1")));
    assert!(fixture.recorder.count(Event::ThreadsRefresh) >= 1);

    assert_eq!(fixture.session.state(), State::Running);
    assert_eq!(fixture.session.event(), Some(Event::Attached));
}

#[test]
fn refresh_republishes_the_current_context() {
    let vm = Arc::new(MockVirtualMachine::new());
    vm.add_thread(stopped_thread(1, "main", 10));
    let fixture = SessionFixture::attached(vm);
    fixture.dispatch(breakpoint_hit(&thread(1, "main"), SuspendPolicy::EventThread, 1, 10));
    let paused = fixture.recorder.last().unwrap();

    fixture.session.refresh(true);
    fixture.settle();

    let refreshed = fixture.recorder.last().unwrap();
    assert_eq!(
        (refreshed.state, refreshed.event),
        (State::Paused, Event::RefreshWithStack)
    );
    assert_eq!(refreshed.suspend_context, paused.suspend_context);
    assert_eq!(refreshed.thread, Some(1));
    assert!(refreshed.has_frame);
}

#[test]
fn status_serializes_for_clients() {
    let fixture = SessionFixture::attached(Arc::new(MockVirtualMachine::new()));

    let status = serde_json::to_value(fixture.session.status()).unwrap();
    assert_eq!(status["name"], "app");
    assert_eq!(status["state"], "RUNNING");
    assert_eq!(status["event"], "ATTACHED");
    assert_eq!(
        status["description"],
        format!("Connected to the target VM, {LISTENING}")
    );
}
