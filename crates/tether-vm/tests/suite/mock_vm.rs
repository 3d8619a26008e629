use std::sync::Arc;
use std::time::Duration;

use tether_vm::{
    Connector, Location, MockConnector, MockThread, MockVirtualMachine, RedefinitionErrorKind,
    RemoteConnection, StackFrameInfo, StepKind, ThreadRef, ThreadStatus, VirtualMachineProxy,
    VmError,
};

fn frame(id: u64, class_name: &str, line: u32) -> StackFrameInfo {
    StackFrameInfo {
        id,
        location: Location::new(class_name, "run", line),
    }
}

#[test]
fn suspend_lag_reports_running_until_exhausted() {
    let vm = MockVirtualMachine::new();
    vm.add_thread(MockThread::new(1, "main").suspend_lag(2));
    vm.suspend().unwrap();

    let main = ThreadRef::new(1, "main");
    assert!(!vm.is_suspended(&main).unwrap());
    assert!(!vm.is_suspended(&main).unwrap());
    assert!(vm.is_suspended(&main).unwrap());
    assert_eq!(vm.suspended_queries(), 3);
    assert_eq!(vm.suspend_calls(), 1);
}

#[test]
fn frames_require_a_suspended_thread() {
    let vm = MockVirtualMachine::new();
    vm.add_thread(
        MockThread::new(1, "main")
            .status(ThreadStatus::Running)
            .frames(vec![frame(10, "com.example.Main", 7)]),
    );
    let main = ThreadRef::new(1, "main");

    assert!(matches!(
        vm.frames(&main),
        Err(VmError::IncompatibleThreadState(1))
    ));

    vm.set_suspended(1, true);
    assert_eq!(vm.frame_count(&main).unwrap(), 1);

    vm.collect_thread(1);
    let err = vm.frames(&main).unwrap_err();
    assert!(err.is_transient());
}

#[test]
fn one_failing_class_rejects_the_whole_request() {
    let vm = MockVirtualMachine::new();
    let a = vm.load_class("com.example.A", 100);
    let b = vm.load_class("com.example.B", 200);
    vm.fail_redefinition(200, RedefinitionErrorKind::UnsupportedOperation, "schema change");

    let err = vm
        .redefine_classes(&[(a.clone(), vec![1]), (b, vec![2])])
        .unwrap_err();
    assert_eq!(
        err.redefinition_kind(),
        Some(RedefinitionErrorKind::UnsupportedOperation)
    );
    assert_eq!(vm.redefined_bytes(100), None);

    vm.redefine_classes(&[(a, vec![3])]).unwrap();
    assert_eq!(vm.redefined_bytes(100), Some(vec![3]));
    assert_eq!(vm.redefine_calls(), vec![vec![100, 200], vec![100]]);
}

#[test]
fn classes_loaded_by_several_loaders_share_a_name() {
    let vm = MockVirtualMachine::new();
    vm.load_class_with_loader("com.example.A", 1, Some(11));
    vm.load_class_with_loader("com.example.A", 2, Some(12));

    let types = vm.classes_by_name("com.example.A").unwrap();
    assert_eq!(types.len(), 2);
    assert!(vm.classes_by_name("com.example.Missing").unwrap().is_empty());
}

#[test]
fn exited_vm_rejects_further_commands() {
    let vm = MockVirtualMachine::new();
    vm.add_thread(MockThread::new(1, "main"));
    vm.step(&ThreadRef::new(1, "main"), StepKind::Over).unwrap();
    vm.exit(0).unwrap();

    assert_eq!(vm.exit_code(), Some(0));
    assert!(matches!(vm.all_threads(), Err(VmError::Disconnected)));
    assert_eq!(vm.step_calls(), vec![(1, StepKind::Over)]);
}

#[test]
fn connector_scripts_open_and_attach_failures() {
    let vm = Arc::new(MockVirtualMachine::new());
    let remote = RemoteConnection::socket("localhost", 5005);

    let ok = MockConnector::new(vm.clone());
    ok.open(&remote).unwrap();
    let attached = ok.attach(&remote, Duration::from_secs(1)).unwrap();
    assert_eq!(attached.description(), "Mock VM");
    assert_eq!((ok.open_count(), ok.attach_count()), (1, 1));

    let refused = MockConnector::new(vm.clone()).failing_attach("Connection refused");
    refused.open(&remote).unwrap();
    let err = refused
        .attach(&remote, Duration::from_secs(1))
        .err()
        .expect("attach should fail");
    assert_eq!(err.to_string(), "Connection refused");

    let busy = MockConnector::new(vm).failing_open("Address already in use");
    let err = busy.open(&remote).unwrap_err();
    assert!(err.to_string().contains("localhost:5005"));
}
