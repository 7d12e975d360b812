use std::sync::Arc;
use std::time::Duration;

use marcus_core::core::Core;
use marcus_core::error::{CoreError, Result};
use marcus_core::models::Role;
use marcus_core::registry::Registration;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::envelope::Envelope;
use crate::params::*;
use crate::roles::{permits, required_access};

/// Dispatches authenticated, role-tagged calls onto the core.
///
/// Handler futures run on their own task so a caller deadline can stop the
/// wait without cancelling a mutation midway; a deadline that has already
/// elapsed aborts before anything runs. Panics inside a handler are caught
/// at the join and converted to an error envelope.
#[derive(Clone)]
pub struct ToolHandler {
    core: Arc<Core>,
}

impl ToolHandler {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    pub fn core(&self) -> Arc<Core> {
        self.core.clone()
    }

    pub async fn dispatch(
        &self,
        role: Role,
        method: &str,
        params: Value,
        deadline: Option<Duration>,
    ) -> Envelope {
        let Some(access) = required_access(method) else {
            return Envelope::error(&CoreError::Validation(format!("unknown method: {method}")));
        };
        if !permits(role, access) {
            tracing::warn!(?role, method, "call refused by role table");
            return Envelope::error(&CoreError::Validation(format!(
                "role {role:?} may not call {method}"
            )));
        }
        if matches!(deadline, Some(d) if d.is_zero()) {
            return Envelope::error(&CoreError::Timeout(method.to_string()));
        }

        let handle = tokio::spawn(route(self.core.clone(), method.to_string(), params));
        let joined = match deadline {
            Some(d) => match tokio::time::timeout(d, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    // The handler task keeps running; only the wait ends.
                    tracing::warn!(method, "caller deadline elapsed");
                    return Envelope::error(&CoreError::Timeout(method.to_string()));
                }
            },
            None => handle.await,
        };
        match joined {
            Ok(result) => result.into(),
            Err(join_err) if join_err.is_panic() => {
                tracing::error!(method, "handler panicked");
                Envelope::error(&CoreError::PersistenceFailure(format!(
                    "internal panic in {method}"
                )))
            }
            Err(_) => Envelope::error(&CoreError::PersistenceFailure(format!(
                "handler for {method} was cancelled"
            ))),
        }
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| CoreError::Validation(format!("invalid parameters: {e}")))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| CoreError::PersistenceFailure(format!("response encoding failed: {e}")))
}

async fn route(core: Arc<Core>, method: String, params: Value) -> Result<Value> {
    match method.as_str() {
        "register_agent" => {
            let p: RegisterAgentParams = parse(params)?;
            let registration = core.register_agent(&p.agent_id, p.role, p.capabilities).await?;
            Ok(json!({ "created": registration == Registration::Created }))
        }
        "request_next_task" => {
            let p: RequestNextTaskParams = parse(params)?;
            let assignment = core.request_next_task(&p.agent_id).await?;
            to_value(assignment)
        }
        "report_task_progress" => {
            let p: ReportProgressParams = parse(params)?;
            let ack = core
                .report_progress(&p.agent_id, &p.task_id, p.status, p.progress, &p.message)
                .await?;
            to_value(ack)
        }
        "report_blocker" => {
            let p: ReportBlockerParams = parse(params)?;
            let suggestions = core
                .report_blocker(&p.agent_id, &p.task_id, &p.description, p.severity)
                .await?;
            Ok(json!({ "suggestions": suggestions }))
        }
        "abandon_task" => {
            let p: AbandonTaskParams = parse(params)?;
            core.abandon_task(&p.agent_id, &p.task_id, &p.reason).await?;
            Ok(json!({ "abandoned": true }))
        }
        "agent_heartbeat" => {
            let p: AgentIdParams = parse(params)?;
            core.agent_heartbeat(&p.agent_id).await?;
            Ok(json!({ "alive": true }))
        }
        "get_task_context" => {
            let p: TaskIdParams = parse(params)?;
            to_value(core.get_task_context(&p.task_id).await?)
        }
        "check_task_dependencies" => {
            let p: TaskIdParams = parse(params)?;
            to_value(core.check_task_dependencies(&p.task_id).await?)
        }
        "log_decision" => {
            let p: LogDecisionParams = parse(params)?;
            to_value(core.log_decision(&p.agent_id, &p.task_id, &p.text).await?)
        }
        "log_artifact" => {
            let p: LogArtifactParams = parse(params)?;
            if let Some(content_ref) = &p.content_ref {
                tracing::debug!(task_id = %p.task_id, content_ref, "artifact content stays external");
            }
            let artifact = core
                .log_artifact(&p.agent_id, &p.task_id, &p.filename, p.kind, p.location)
                .await?;
            Ok(json!({ "canonical_location": artifact.location, "artifact": artifact }))
        }
        "list_agents" => to_value(core.list_agents().await),
        "get_agent_status" => {
            let p: AgentIdParams = parse(params)?;
            to_value(core.get_agent_status(&p.agent_id).await?)
        }
        "project_status" => to_value(core.project_status().await),
        "board_health" => to_value(core.board_health().await),
        "diagnose" => to_value(core.diagnose().await),
        "create_task" => {
            let p: CreateTaskParams = parse(params)?;
            to_value(core.create_task(p.task).await?)
        }
        "delete_task" => {
            let p: TaskIdParams = parse(params)?;
            core.delete_task(&p.task_id).await?;
            Ok(json!({ "deleted": true }))
        }
        "cancel_task" => {
            let p: TaskIdParams = parse(params)?;
            core.cancel_task(&p.task_id).await?;
            Ok(json!({ "cancelled": true }))
        }
        "add_dependency" => {
            let p: AddDependencyParams = parse(params)?;
            core.add_dependency(&p.task_id, &p.depends_on, p.kind).await?;
            Ok(json!({ "added": true }))
        }
        "infer_dependencies" => to_value(core.infer_dependencies().await?),
        other => Err(CoreError::Validation(format!("unknown method: {other}"))),
    }
}
