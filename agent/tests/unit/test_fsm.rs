//! FSM unit tests

use dt_agent::deploy::fsm::{TaskEvent, TaskFsm, TaskState};
use tokio_test::{assert_err, assert_ok};

#[test]
fn test_fsm_initial_state() {
    let fsm = TaskFsm::announced();
    assert_eq!(fsm.state(), TaskState::Announced);
    assert!(fsm.error().is_none());
}

#[test]
fn test_fsm_deploy_without_install() {
    let mut fsm = TaskFsm::received();

    // Received -> Transferring -> Running
    fsm.process(TaskEvent::Transfer).unwrap();
    fsm.process(TaskEvent::Run).unwrap();
    assert_eq!(fsm.state(), TaskState::Running);

    fsm.process(TaskEvent::Stop).unwrap();
    assert_eq!(fsm.state(), TaskState::Stopped);
}

#[test]
fn test_fsm_build_flow() {
    let mut fsm = TaskFsm::received();

    assert_ok!(fsm.process(TaskEvent::Transfer));
    assert_ok!(fsm.process(TaskEvent::Build));
    assert_eq!(fsm.state(), TaskState::Building);

    fsm.process(TaskEvent::Succeed).unwrap();
    assert_eq!(fsm.state(), TaskState::Completed);
    assert!(fsm.state().is_terminal());
}

#[test]
fn test_fsm_restart_after_reboot() {
    let mut fsm = TaskFsm::from_state(TaskState::Completed);
    fsm.process(TaskEvent::Restart).unwrap();
    assert_eq!(fsm.state(), TaskState::Running);

    let mut failed = TaskFsm::from_state(TaskState::Failed);
    assert_err!(failed.process(TaskEvent::Restart));
}

#[test]
fn test_fsm_invalid_transition() {
    let mut fsm = TaskFsm::received();

    // Cannot run before the transfer
    assert_err!(fsm.process(TaskEvent::Run));
    assert_eq!(fsm.state(), TaskState::Received);
}

#[test]
fn test_fsm_state_serialization() {
    assert_eq!(
        serde_json::to_string(&TaskState::Announced).unwrap(),
        "\"announced\""
    );
    let state: TaskState = serde_json::from_str("\"stopped\"").unwrap();
    assert_eq!(state, TaskState::Stopped);
}
