//! Finite State Machine for task processing

use serde::{Deserialize, Serialize};

/// Task state, persisted in the task history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Announcement accepted, payload not received yet
    Announced,

    /// Payload accepted
    Received,

    /// Unpacking artifacts
    Transferring,

    /// Running install commands in order
    Installing,

    /// Running build commands in order
    Building,

    /// Run commands executing in parallel
    Running,

    Completed,

    Failed,

    /// Cancelled by a newer task, a stop request or shutdown
    Stopped,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Stopped
        )
    }
}

/// Task event
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// Task payload arrived
    Receive,

    /// Start unpacking artifacts
    Transfer,

    /// Start the install stage
    Install,

    /// Start the build stage
    Build,

    /// Start the run stage
    Run,

    /// Restart the run stage of a previously installed task
    Restart,

    /// All stages finished successfully
    Succeed,

    /// A stage failed
    Fail(String),

    /// Cancelled
    Stop,
}

/// Task FSM
#[derive(Debug, Clone)]
pub struct TaskFsm {
    state: TaskState,
    error: Option<String>,
}

impl TaskFsm {
    /// A task whose announcement was accepted
    pub fn announced() -> Self {
        Self::from_state(TaskState::Announced)
    }

    /// A task whose payload arrived without announcement
    pub fn received() -> Self {
        Self::from_state(TaskState::Received)
    }

    pub fn from_state(state: TaskState) -> Self {
        Self { state, error: None }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: TaskEvent) -> Result<TaskState, String> {
        let new_state = match (&self.state, &event) {
            (TaskState::Announced, TaskEvent::Receive) => TaskState::Received,

            (TaskState::Received, TaskEvent::Transfer) => TaskState::Transferring,

            // From Transferring
            (TaskState::Transferring, TaskEvent::Install) => TaskState::Installing,
            (TaskState::Transferring, TaskEvent::Build) => TaskState::Building,
            (TaskState::Transferring, TaskEvent::Run) => TaskState::Running,
            (TaskState::Transferring, TaskEvent::Succeed) => TaskState::Completed,

            // From Installing
            (TaskState::Installing, TaskEvent::Run) => TaskState::Running,
            (TaskState::Installing, TaskEvent::Succeed) => TaskState::Completed,

            (TaskState::Building, TaskEvent::Succeed) => TaskState::Completed,
            (TaskState::Running, TaskEvent::Succeed) => TaskState::Completed,

            // Autostart after a reboot
            (
                TaskState::Running | TaskState::Completed | TaskState::Stopped,
                TaskEvent::Restart,
            ) => TaskState::Running,

            (state, TaskEvent::Fail(err)) if !state.is_terminal() => {
                self.error = Some(err.clone());
                TaskState::Failed
            }
            (state, TaskEvent::Stop) if !state.is_terminal() => TaskState::Stopped,

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_transitions() {
        let mut fsm = TaskFsm::announced();
        fsm.process(TaskEvent::Receive).unwrap();
        fsm.process(TaskEvent::Transfer).unwrap();
        fsm.process(TaskEvent::Install).unwrap();
        assert_eq!(fsm.state(), TaskState::Installing);
        fsm.process(TaskEvent::Run).unwrap();
        assert_eq!(fsm.state(), TaskState::Running);
        fsm.process(TaskEvent::Succeed).unwrap();
        assert_eq!(fsm.state(), TaskState::Completed);
    }

    #[test]
    fn test_failure_is_terminal() {
        let mut fsm = TaskFsm::received();
        fsm.process(TaskEvent::Transfer).unwrap();
        fsm.process(TaskEvent::Fail("bad archive".to_string()))
            .unwrap();

        assert_eq!(fsm.state(), TaskState::Failed);
        assert_eq!(fsm.error(), Some("bad archive"));
        assert!(fsm.process(TaskEvent::Stop).is_err());
        assert!(fsm.process(TaskEvent::Restart).is_err());
    }

    #[test]
    fn test_stages_cannot_be_skipped() {
        let mut fsm = TaskFsm::announced();
        assert!(fsm.process(TaskEvent::Install).is_err());
        assert_eq!(fsm.state(), TaskState::Announced);
    }
}
