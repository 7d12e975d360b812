//! Tool-surface tests: role gating, envelope shape, and error mapping, with
//! faults injected through the mocks.

use std::sync::Arc;

use marcus_core::core::Core;
use marcus_core::models::Role;
use marcus_core::store::MemoryStore;
use marcus_core::CoreConfig;
use marcus_mocks::{RecordingProvider, ScriptedOracle};
use marcus_protocol::ToolHandler;
use serde_json::{json, Value};

fn handler_with(provider: Arc<RecordingProvider>, oracle: ScriptedOracle) -> ToolHandler {
    let core = Core::new(
        CoreConfig::default(),
        Arc::new(MemoryStore::new()),
        provider,
        Arc::new(oracle),
    )
    .expect("valid config");
    ToolHandler::new(Arc::new(core))
}

fn handler() -> ToolHandler {
    handler_with(Arc::new(RecordingProvider::new()), ScriptedOracle::new())
}

async fn call(handler: &ToolHandler, role: Role, method: &str, params: Value) -> marcus_protocol::Envelope {
    handler.dispatch(role, method, params, None).await
}

#[tokio::test]
async fn full_agent_round_trip_over_the_surface() {
    let handler = handler();

    let env = call(
        &handler,
        Role::Developer,
        "create_task",
        json!({"id": "t-1", "name": "Build it"}),
    )
    .await;
    assert!(env.ok, "create_task failed: {:?}", env.message);

    let env = call(
        &handler,
        Role::Agent,
        "register_agent",
        json!({"agent_id": "worker-1", "capabilities": ["rust"]}),
    )
    .await;
    assert!(env.ok);
    assert_eq!(env.data.as_ref().unwrap()["created"], json!(true));

    // Idempotent by agent id.
    let env = call(
        &handler,
        Role::Agent,
        "register_agent",
        json!({"agent_id": "worker-1", "capabilities": ["rust", "sql"]}),
    )
    .await;
    assert_eq!(env.data.as_ref().unwrap()["created"], json!(false));

    let env = call(
        &handler,
        Role::Agent,
        "request_next_task",
        json!({"agent_id": "worker-1"}),
    )
    .await;
    assert!(env.ok);
    let data = env.data.unwrap();
    assert_eq!(data["task"]["id"], json!("t-1"));
    assert!(data["lease"]["expires_at"].is_string());

    let env = call(
        &handler,
        Role::Agent,
        "report_task_progress",
        json!({"agent_id": "worker-1", "task_id": "t-1", "status": "completed", "progress": 100, "message": "done"}),
    )
    .await;
    assert!(env.ok);
    assert_eq!(env.data.unwrap()["completed"], json!(true));

    let env = call(&handler, Role::Observer, "project_status", json!({})).await;
    assert!(env.ok);
    assert_eq!(env.data.unwrap()["counts_by_status"]["done"], json!(1));
}

#[tokio::test]
async fn role_table_refuses_out_of_tier_calls() {
    let handler = handler();
    let env = call(
        &handler,
        Role::Observer,
        "register_agent",
        json!({"agent_id": "sneaky"}),
    )
    .await;
    assert!(!env.ok);
    assert_eq!(env.error_kind.as_deref(), Some("Validation"));

    let env = call(
        &handler,
        Role::Agent,
        "create_task",
        json!({"id": "t-9", "name": "Agents cannot curate"}),
    )
    .await;
    assert!(!env.ok);

    // Reads stay open to everyone.
    let env = call(&handler, Role::Observer, "diagnose", json!({})).await;
    assert!(env.ok);
}

#[tokio::test]
async fn unknown_methods_and_bad_params_are_validation_errors() {
    let handler = handler();
    let env = call(&handler, Role::Admin, "frobnicate", json!({})).await;
    assert!(!env.ok);
    assert_eq!(env.error_kind.as_deref(), Some("Validation"));

    let env = call(&handler, Role::Agent, "request_next_task", json!({"agent": 42})).await;
    assert!(!env.ok);
    assert_eq!(env.error_kind.as_deref(), Some("Validation"));
    assert_eq!(env.retryable, Some(false));
}

#[tokio::test]
async fn elapsed_deadline_aborts_before_any_work() {
    let handler = handler();
    let env = handler
        .dispatch(
            Role::Agent,
            "register_agent",
            json!({"agent_id": "worker-1"}),
            Some(std::time::Duration::ZERO),
        )
        .await;
    assert!(!env.ok);
    assert_eq!(env.error_kind.as_deref(), Some("Timeout"));
    assert_eq!(env.retryable, Some(true));

    // Nothing registered.
    let env = handler
        .dispatch(Role::Observer, "list_agents", json!({}), None)
        .await;
    assert_eq!(env.data.unwrap(), json!([]));
}

#[tokio::test]
async fn provider_outage_surfaces_retryable_after_internal_retries() {
    let provider = Arc::new(RecordingProvider::new());
    // More failures than the internal retry bound can absorb.
    provider.inject_outage(8);
    let handler = handler_with(provider.clone(), ScriptedOracle::new());

    let env = call(
        &handler,
        Role::Developer,
        "create_task",
        json!({"id": "t-1", "name": "Doomed"}),
    )
    .await;
    assert!(!env.ok);
    assert_eq!(env.error_kind.as_deref(), Some("ProviderUnavailable"));
    assert_eq!(env.retryable, Some(true));

    // Rollback: the task does not exist locally.
    let env = call(&handler, Role::Observer, "get_task_context", json!({"task_id": "t-1"})).await;
    assert_eq!(env.error_kind.as_deref(), Some("UnknownTask"));
}

#[tokio::test]
async fn blocker_suggestions_come_from_the_oracle_when_it_answers() {
    let provider = Arc::new(RecordingProvider::new());
    let oracle = ScriptedOracle::new().suggesting(&["rotate the token", "ask an operator"]);
    let handler = handler_with(provider, oracle);

    assert!(call(&handler, Role::Developer, "create_task", json!({"id": "t-1", "name": "x"})).await.ok);
    assert!(call(&handler, Role::Agent, "register_agent", json!({"agent_id": "w"})).await.ok);
    assert!(call(&handler, Role::Agent, "request_next_task", json!({"agent_id": "w"})).await.ok);

    let env = call(
        &handler,
        Role::Agent,
        "report_blocker",
        json!({"agent_id": "w", "task_id": "t-1", "description": "expired token", "severity": "high"}),
    )
    .await;
    assert!(env.ok);
    let suggestions = env.data.unwrap()["suggestions"].clone();
    assert_eq!(suggestions, json!(["rotate the token", "ask an operator"]));
}

#[tokio::test]
async fn artifact_log_returns_the_canonical_location() {
    let handler = handler();
    assert!(call(&handler, Role::Developer, "create_task", json!({"id": "t-1", "name": "x"})).await.ok);
    assert!(call(&handler, Role::Agent, "register_agent", json!({"agent_id": "w"})).await.ok);

    let env = call(
        &handler,
        Role::Agent,
        "log_artifact",
        json!({"task_id": "t-1", "agent_id": "w", "filename": "auth.md", "type": "design", "content_ref": "blob://abc"}),
    )
    .await;
    assert!(env.ok);
    assert_eq!(
        env.data.unwrap()["canonical_location"],
        json!("docs/design/auth.md")
    );
}
