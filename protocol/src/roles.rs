use marcus_core::models::Role;

/// Access tiers for the tool surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Open to observer and above: status, context, diagnostics.
    Read,
    /// Agent-lifecycle writes: restricted to agent and admin.
    AgentWrite,
    /// Board curation: task CRUD and dependency edits.
    Curate,
}

/// Access tier per method name. Unknown methods get no tier and are refused
/// before dispatch.
pub fn required_access(method: &str) -> Option<Access> {
    let access = match method {
        "list_agents" | "get_agent_status" | "project_status" | "board_health" | "diagnose"
        | "get_task_context" | "check_task_dependencies" => Access::Read,
        "register_agent" | "request_next_task" | "report_task_progress" | "report_blocker"
        | "abandon_task" | "agent_heartbeat" | "log_decision" | "log_artifact" => {
            Access::AgentWrite
        }
        "create_task" | "delete_task" | "cancel_task" | "add_dependency"
        | "infer_dependencies" => Access::Curate,
        _ => return None,
    };
    Some(access)
}

/// Role table: reads are open to everyone authenticated, agent-lifecycle
/// writes to agents and admins, curation to developers and admins.
pub fn permits(role: Role, access: Access) -> bool {
    match access {
        Access::Read => true,
        Access::AgentWrite => matches!(role, Role::Agent | Role::Admin),
        Access::Curate => matches!(role, Role::Developer | Role::Admin),
    }
}
