use thiserror::Error;

use crate::models::TaskStatus;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Closed set of failure kinds for the coordination core.
///
/// Every interface boundary returns one of these; nothing else crosses it.
/// Transient kinds (`ProviderUnavailable`, `Timeout`, `Conflict`) are retried
/// internally with bounded backoff before surfacing. `kind_code()` is the
/// wire identifier carried in the response envelope and `retryable()` the
/// hint handed to callers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Reference to a task that does not exist.
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// Reference to an agent that never registered.
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// The state machine refused the requested status change.
    #[error("Invalid transition from {from} to {to} for task {task}")]
    InvalidTransition { task: String, from: TaskStatus, to: TaskStatus },

    /// The caller does not hold the task it is reporting on.
    #[error("Agent {agent} is not the holder of task {task}")]
    NotHolder { task: String, agent: String },

    /// Lease renewal attempted by a non-owner.
    #[error("Lease on task {task} is held by {holder}, not {agent}")]
    WrongLeaseHolder { task: String, holder: String, agent: String },

    /// The lease is no longer valid; the agent must request a fresh task.
    #[error("Lease on task {0} has expired")]
    LeaseExpired(String),

    /// A dependency edit would introduce a hard cycle.
    #[error("Adding dependency {from} -> {to} would form a hard cycle")]
    CycleWouldForm { from: String, to: String },

    /// No ready task fits the caller's capabilities.
    #[error("No ready task matches the capabilities of agent {0}")]
    CapabilityMismatch(String),

    /// Transient kanban backend failure.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Durable write failed; not retryable at the caller level.
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// Oracle or provider deadline elapsed.
    #[error("Deadline elapsed while waiting on {0}")]
    Timeout(String),

    /// Optimistic reservation lost a race; retried internally.
    #[error("Reservation conflict on task {0}")]
    Conflict(String),

    /// Invalid input that maps onto no other kind.
    #[error("Validation error: {0}")]
    Validation(String),
}

impl CoreError {
    pub fn unknown_task(id: impl Into<String>) -> Self {
        Self::UnknownTask(id.into())
    }

    pub fn unknown_agent(id: impl Into<String>) -> Self {
        Self::UnknownAgent(id.into())
    }

    pub fn invalid_transition(task: impl Into<String>, from: TaskStatus, to: TaskStatus) -> Self {
        Self::InvalidTransition { task: task.into(), from, to }
    }

    pub fn not_holder(task: impl Into<String>, agent: impl Into<String>) -> Self {
        Self::NotHolder { task: task.into(), agent: agent.into() }
    }

    /// Stable identifier carried as `error_kind` in response envelopes.
    pub fn kind_code(&self) -> &'static str {
        match self {
            CoreError::UnknownTask(_) => "UnknownTask",
            CoreError::UnknownAgent(_) => "UnknownAgent",
            CoreError::InvalidTransition { .. } => "InvalidTransition",
            CoreError::NotHolder { .. } => "NotHolder",
            CoreError::WrongLeaseHolder { .. } => "WrongLeaseHolder",
            CoreError::LeaseExpired(_) => "LeaseExpired",
            CoreError::CycleWouldForm { .. } => "CycleWouldForm",
            CoreError::CapabilityMismatch(_) => "CapabilityMismatch",
            CoreError::ProviderUnavailable(_) => "ProviderUnavailable",
            CoreError::PersistenceFailure(_) => "PersistenceFailure",
            CoreError::Timeout(_) => "Timeout",
            CoreError::Conflict(_) => "Conflict",
            CoreError::Validation(_) => "Validation",
        }
    }

    /// Whether the caller may usefully retry the same request.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            CoreError::ProviderUnavailable(_) | CoreError::Timeout(_) | CoreError::Conflict(_)
        )
    }

    /// Whether the kind is transient and retried internally before surfacing.
    pub fn is_transient(&self) -> bool {
        self.retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(CoreError::unknown_task("t-9").kind_code(), "UnknownTask");
        assert_eq!(
            CoreError::invalid_transition("t-1", TaskStatus::Todo, TaskStatus::Done).kind_code(),
            "InvalidTransition"
        );
        assert_eq!(CoreError::Conflict("t-1".into()).kind_code(), "Conflict");
    }

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(CoreError::ProviderUnavailable("503".into()).retryable());
        assert!(CoreError::Timeout("oracle".into()).retryable());
        assert!(CoreError::Conflict("t-1".into()).retryable());

        assert!(!CoreError::unknown_task("t-1").retryable());
        assert!(!CoreError::LeaseExpired("t-1".into()).retryable());
        assert!(!CoreError::PersistenceFailure("disk".into()).retryable());
    }

    #[test]
    fn display_names_the_offending_entities() {
        let err = CoreError::WrongLeaseHolder {
            task: "t-1".into(),
            holder: "agent-a".into(),
            agent: "agent-b".into(),
        };
        let text = err.to_string();
        assert!(text.contains("t-1"));
        assert!(text.contains("agent-a"));
        assert!(text.contains("agent-b"));
    }
}
