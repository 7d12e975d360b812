//! End-to-end scenarios against a full `Core` wired with the in-memory
//! provider and store.

use std::collections::BTreeSet;
use std::sync::Arc;

use marcus_core::core::{Assignment, Core};
use marcus_core::diagnostics::EmptyReason;
use marcus_core::models::{
    BlockerSeverity, Dependency, NewTask, ProgressStatus, Role, TaskStatus,
};
use marcus_core::oracle::HeuristicOracle;
use marcus_core::provider::InMemoryProvider;
use marcus_core::store::MemoryStore;
use marcus_core::CoreConfig;

fn build_core(config: CoreConfig) -> (Arc<Core>, Arc<InMemoryProvider>, Arc<MemoryStore>) {
    let provider = Arc::new(InMemoryProvider::new());
    let store = Arc::new(MemoryStore::new());
    let core = Core::new(
        config,
        store.clone(),
        provider.clone(),
        Arc::new(HeuristicOracle::default()),
    )
    .expect("default config is valid");
    (Arc::new(core), provider, store)
}

fn caps(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

async fn register(core: &Core, agent: &str, capabilities: &[&str]) {
    core.register_agent(agent, Role::Agent, caps(capabilities)).await.unwrap();
}

async fn complete(core: &Core, agent: &str, task: &str) {
    core.report_progress(agent, task, ProgressStatus::Completed, 100, "done")
        .await
        .unwrap();
}

fn assigned_task(assignment: &Assignment) -> String {
    assignment.payload().expect("expected an assignment").task.id.clone()
}

#[tokio::test]
async fn linear_chain_is_served_in_dependency_order() {
    let (core, _, _) = build_core(CoreConfig::default());
    register(&core, "agent-x", &["build"]).await;

    core.create_task(NewTask::new("a", "Task A")).await.unwrap();
    let mut b = NewTask::new("b", "Task B");
    b.dependencies = vec![Dependency::hard("a")];
    core.create_task(b).await.unwrap();
    let mut c = NewTask::new("c", "Task C");
    c.dependencies = vec![Dependency::hard("b")];
    core.create_task(c).await.unwrap();

    for expected in ["a", "b", "c"] {
        let assignment = core.request_next_task("agent-x").await.unwrap();
        assert_eq!(assigned_task(&assignment), expected);
        complete(&core, "agent-x", expected).await;
    }

    let empty = core.request_next_task("agent-x").await.unwrap();
    match empty {
        Assignment::Empty { diagnostics, .. } => {
            assert_eq!(diagnostics.reason, Some(EmptyReason::NoReadyTasks));
        }
        Assignment::Assigned(payload) => panic!("unexpected assignment: {}", payload.task.id),
    }
}

#[tokio::test]
async fn concurrent_agents_never_share_a_task() {
    let (core, _, _) = build_core(CoreConfig::default());
    register(&core, "agent-x", &[]).await;
    register(&core, "agent-y", &[]).await;
    core.create_task(NewTask::new("p1", "Parallel 1")).await.unwrap();
    core.create_task(NewTask::new("p2", "Parallel 2")).await.unwrap();

    let (a, b) = tokio::join!(
        core.request_next_task("agent-x"),
        core.request_next_task("agent-y"),
    );
    let first = assigned_task(&a.unwrap());
    let second = assigned_task(&b.unwrap());
    assert_ne!(first, second);
    let mut got = [first, second];
    got.sort();
    assert_eq!(got, ["p1".to_string(), "p2".to_string()]);
}

#[tokio::test]
async fn contested_single_task_has_exactly_one_winner() {
    let (core, _, _) = build_core(CoreConfig::default());
    for agent in ["agent-1", "agent-2", "agent-3"] {
        register(&core, agent, &[]).await;
    }
    core.create_task(NewTask::new("only", "The only task")).await.unwrap();

    let (r1, r2, r3) = tokio::join!(
        core.request_next_task("agent-1"),
        core.request_next_task("agent-2"),
        core.request_next_task("agent-3"),
    );
    let results = [r1.unwrap(), r2.unwrap(), r3.unwrap()];
    let winners: Vec<&Assignment> = results.iter().filter(|a| !a.is_empty()).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(assigned_task(winners[0]), "only");
    for loser in results.iter().filter(|a| a.is_empty()) {
        let Assignment::Empty { diagnostics, .. } = loser else { unreachable!() };
        assert!(matches!(
            diagnostics.reason,
            Some(EmptyReason::ConcurrentLostRace) | Some(EmptyReason::NoReadyTasks)
        ));
    }
}

#[tokio::test]
async fn expired_lease_is_recovered_and_reassignable() {
    let mut config = CoreConfig::default();
    config.lease_duration_secs = 1;
    let (core, _, _) = build_core(config);
    register(&core, "agent-x", &[]).await;
    register(&core, "agent-y", &[]).await;
    core.create_task(NewTask::new("t", "Orphanable")).await.unwrap();

    let assignment = core.request_next_task("agent-x").await.unwrap();
    assert_eq!(assigned_task(&assignment), "t");
    core.report_progress("agent-x", "t", ProgressStatus::InProgress, 25, "started")
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(1_200)).await;
    let recovered = core.sweep_expired_leases().await.unwrap();
    assert_eq!(recovered, vec!["t".to_string()]);

    let task = core.get_task("t").await.unwrap();
    assert_eq!(task.status, TaskStatus::Todo);
    assert!(task.assignee.is_none());
    assert!(task
        .worklog
        .iter()
        .any(|e| e.kind == marcus_core::models::WorklogKind::Recovery));

    // The orphaned agent's next report tells it to re-request.
    let err = core
        .report_progress("agent-x", "t", ProgressStatus::InProgress, 30, "late")
        .await
        .unwrap_err();
    assert_eq!(err.kind_code(), "LeaseExpired");

    let reassigned = core.request_next_task("agent-y").await.unwrap();
    assert_eq!(assigned_task(&reassigned), "t");
}

#[tokio::test]
async fn parent_rolls_up_when_the_last_child_completes() {
    let (core, provider, _) = build_core(CoreConfig::default());
    register(&core, "agent-x", &[]).await;

    core.create_task(NewTask::new("q", "Feature Q")).await.unwrap();
    let mut previous: Option<String> = None;
    for (id, order) in [("q1", 1u32), ("q2", 2), ("q3", 3)] {
        let mut child = NewTask::new(id, format!("Step {order}"));
        child.parent = Some("q".into());
        child.order_index = Some(order);
        if let Some(prev) = &previous {
            child.dependencies = vec![Dependency::hard(prev.clone())];
        }
        core.create_task(child).await.unwrap();
        previous = Some(id.to_string());
    }

    for id in ["q1", "q2", "q3"] {
        let assignment = core.request_next_task("agent-x").await.unwrap();
        assert_eq!(assigned_task(&assignment), id);
        complete(&core, "agent-x", id).await;
    }

    let parent = core.get_task("q").await.unwrap();
    assert_eq!(parent.status, TaskStatus::Done);
    let rollup = parent
        .worklog
        .iter()
        .find(|e| e.kind == marcus_core::models::WorklogKind::Rollup)
        .expect("rollup note");
    for name in ["Step 1", "Step 2", "Step 3"] {
        assert!(rollup.text.contains(name), "rollup should list {name}");
    }
    // The board got the summary comment too.
    assert!(provider.comments("q").iter().any(|c| c.contains("Step 3")));
}

#[tokio::test]
async fn cycle_via_dependency_edit_is_rejected_without_state_change() {
    let (core, _, _) = build_core(CoreConfig::default());
    for id in ["a", "b", "c"] {
        core.create_task(NewTask::new(id, id)).await.unwrap();
    }
    core.add_dependency("b", "a", marcus_core::DependencyKind::Hard).await.unwrap();
    core.add_dependency("c", "b", marcus_core::DependencyKind::Hard).await.unwrap();

    let err = core
        .add_dependency("a", "c", marcus_core::DependencyKind::Hard)
        .await
        .unwrap_err();
    assert_eq!(err.kind_code(), "CycleWouldForm");
    let a = core.get_task("a").await.unwrap();
    assert!(a.dependencies.is_empty());
    let report = core.check_task_dependencies("a").await.unwrap();
    assert!(report.cycles.is_empty());
}

#[tokio::test]
async fn blocker_keeps_ownership_and_returns_suggestions() {
    let (core, _, _) = build_core(CoreConfig::default());
    register(&core, "agent-x", &[]).await;
    core.create_task(NewTask::new("t", "OAuth integration")).await.unwrap();

    let assignment = core.request_next_task("agent-x").await.unwrap();
    assert_eq!(assigned_task(&assignment), "t");

    let suggestions = core
        .report_blocker("agent-x", "t", "missing OAuth creds", BlockerSeverity::High)
        .await
        .unwrap();
    assert!(!suggestions.is_empty());

    let task = core.get_task("t").await.unwrap();
    assert_eq!(task.status, TaskStatus::Blocked);
    assert_eq!(task.assignee.as_deref(), Some("agent-x"));

    // Idempotent: the blocked holder gets its own task back, not new work.
    core.create_task(NewTask::new("other", "Other work")).await.unwrap();
    let again = core.request_next_task("agent-x").await.unwrap();
    assert_eq!(assigned_task(&again), "t");
}

#[tokio::test]
async fn restart_recovers_assignments_from_the_store() {
    let provider = Arc::new(InMemoryProvider::new());
    let store = Arc::new(MemoryStore::new());
    let oracle = Arc::new(HeuristicOracle::default());

    {
        let core = Core::new(
            CoreConfig::default(),
            store.clone(),
            provider.clone(),
            oracle.clone(),
        )
        .unwrap();
        core.register_agent("agent-x", Role::Agent, caps(&[])).await.unwrap();
        core.create_task(NewTask::new("t", "Persistent task")).await.unwrap();
        let assignment = core.request_next_task("agent-x").await.unwrap();
        assert_eq!(assigned_task(&assignment), "t");
    }

    // A fresh core over the same store sees the in-flight assignment.
    let core =
        Core::new(CoreConfig::default(), store, provider, oracle).unwrap();
    core.recover().await.unwrap();
    let task = core.get_task("t").await.unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.assignee.as_deref(), Some("agent-x"));

    // The holder continues exactly where it was.
    core.report_progress("agent-x", "t", ProgressStatus::InProgress, 50, "resuming")
        .await
        .unwrap();
    complete(&core, "agent-x", "t").await;
    assert_eq!(core.get_task("t").await.unwrap().status, TaskStatus::Done);
}

#[tokio::test]
async fn capability_mismatch_is_explained_not_errored() {
    let (core, _, _) = build_core(CoreConfig::default());
    register(&core, "generalist", &[]).await;
    let mut t = NewTask::new("gpu", "Needs CUDA");
    t.required_capabilities = BTreeSet::from(["cuda".to_string()]);
    core.create_task(t).await.unwrap();

    let result = core.request_next_task("generalist").await.unwrap();
    let Assignment::Empty { diagnostics, .. } = result else {
        panic!("generalist must not receive the cuda task");
    };
    assert_eq!(diagnostics.reason, Some(EmptyReason::NoCapabilityFit));
    assert!(diagnostics
        .issues
        .iter()
        .any(|i| i.kind == marcus_core::IssueKind::NoFit));
}

#[tokio::test]
async fn decisions_and_artifacts_flow_to_dependents() {
    let (core, _, _) = build_core(CoreConfig::default());
    register(&core, "agent-x", &[]).await;
    core.create_task(NewTask::new("api", "Build API")).await.unwrap();
    let mut ui = NewTask::new("ui", "Build UI");
    ui.dependencies = vec![Dependency::hard("api")];
    core.create_task(ui).await.unwrap();

    let assignment = core.request_next_task("agent-x").await.unwrap();
    assert_eq!(assigned_task(&assignment), "api");
    core.log_decision("agent-x", "api", "Tokens are JWTs, 15 minute expiry")
        .await
        .unwrap();
    let artifact = core
        .log_artifact("agent-x", "api", "openapi.yaml", marcus_core::ArtifactKind::Api, None)
        .await
        .unwrap();
    assert_eq!(artifact.location, "docs/api/openapi.yaml");
    complete(&core, "agent-x", "api").await;

    let assignment = core.request_next_task("agent-x").await.unwrap();
    assert_eq!(assigned_task(&assignment), "ui");
    let payload = assignment.payload().unwrap();
    let dep = payload
        .context
        .dependencies
        .iter()
        .find(|d| d.task == "api")
        .expect("api appears in context");
    assert_eq!(dep.artifacts.len(), 1);
    assert_eq!(dep.artifacts[0].location, "docs/api/openapi.yaml");
    assert_eq!(dep.decisions.len(), 1);
    assert!(dep.decisions[0].text.contains("JWT"));
    assert!(payload.context.predictions.is_some());
}
