use marcus_core::models::{
    ArtifactKind, BlockerSeverity, DependencyKind, NewTask, ProgressStatus, Role,
};
use serde::{Deserialize, Serialize};

/// Parameters for `register_agent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgentParams {
    pub agent_id: String,
    #[serde(default = "default_agent_role")]
    pub role: Role,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_agent_role() -> Role {
    Role::Agent
}

/// Parameters for `request_next_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestNextTaskParams {
    pub agent_id: String,
}

/// Parameters for `report_task_progress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportProgressParams {
    pub agent_id: String,
    pub task_id: String,
    pub status: ProgressStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub message: String,
}

/// Parameters for `report_blocker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportBlockerParams {
    pub agent_id: String,
    pub task_id: String,
    pub description: String,
    #[serde(default = "default_severity")]
    pub severity: BlockerSeverity,
}

fn default_severity() -> BlockerSeverity {
    BlockerSeverity::Medium
}

/// Parameters for `abandon_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbandonTaskParams {
    pub agent_id: String,
    pub task_id: String,
    #[serde(default)]
    pub reason: String,
}

/// Parameters for `agent_heartbeat` and `get_agent_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdParams {
    pub agent_id: String,
}

/// Parameters for task-keyed reads and admin operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIdParams {
    pub task_id: String,
}

/// Parameters for `log_decision`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDecisionParams {
    pub agent_id: String,
    pub task_id: String,
    pub text: String,
}

/// Parameters for `log_artifact`. `content_ref` is where the agent already
/// put the payload; the core records metadata and the canonical location
/// only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogArtifactParams {
    pub task_id: String,
    pub agent_id: String,
    pub filename: String,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    #[serde(default)]
    pub content_ref: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

/// Parameters for `create_task`: the task fields, flattened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskParams {
    #[serde(flatten)]
    pub task: NewTask,
}

/// Parameters for `add_dependency`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddDependencyParams {
    pub task_id: String,
    pub depends_on: String,
    #[serde(default = "default_dependency_kind")]
    pub kind: DependencyKind,
}

fn default_dependency_kind() -> DependencyKind {
    DependencyKind::Hard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_defaults_to_the_agent_role() {
        let params: RegisterAgentParams =
            serde_json::from_str(r#"{"agent_id": "worker-1"}"#).unwrap();
        assert_eq!(params.role, Role::Agent);
        assert!(params.capabilities.is_empty());
    }

    #[test]
    fn progress_status_uses_wire_names() {
        let params: ReportProgressParams = serde_json::from_str(
            r#"{"agent_id": "a", "task_id": "t", "status": "in_progress", "progress": 40}"#,
        )
        .unwrap();
        assert_eq!(params.status, ProgressStatus::InProgress);
        assert_eq!(params.progress, 40);
        assert!(params.message.is_empty());
    }

    #[test]
    fn artifact_type_field_is_named_type_on_the_wire() {
        let params: LogArtifactParams = serde_json::from_str(
            r#"{"task_id": "t", "agent_id": "a", "filename": "api.yaml", "type": "api"}"#,
        )
        .unwrap();
        assert_eq!(params.kind, ArtifactKind::Api);
        assert!(params.location.is_none());
    }

    #[test]
    fn create_task_accepts_flattened_task_fields() {
        let params: CreateTaskParams = serde_json::from_str(
            r#"{"id": "t-1", "name": "Build", "priority": "high", "dependencies": []}"#,
        )
        .unwrap();
        assert_eq!(params.task.id, "t-1");
        assert_eq!(params.task.priority, marcus_core::Priority::High);
    }
}
