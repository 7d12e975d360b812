use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{CoreConfig, MonotonicPolicy};
use crate::error::{CoreError, Result};
use crate::graph::TaskGraph;
use crate::lease::LeaseManager;
use crate::models::{
    BlockerRecord, BlockerSeverity, Lease, ProgressStatus, TaskId, TaskStatus, WorklogEntry,
    WorklogKind,
};
use crate::registry::AgentRegistry;

/// Result of one progress/blocker/completion application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProgressAck {
    /// Renewed lease, absent once the task completed.
    pub lease: Option<Lease>,
    pub completed: bool,
    /// Parent task auto-completed by rollup, if any.
    pub parent_completed: Option<TaskId>,
    /// The report moved the task out of BLOCKED.
    pub unblocked: bool,
}

/// Verify the caller may report on the task.
///
/// The current lease holder passes; a live lease held by someone else is
/// `WrongLeaseHolder`; an agent whose lease lapsed (or was already swept)
/// gets `LeaseExpired` so it knows to request a fresh task; everyone else is
/// `NotHolder`. Completion passes `allow_expired` because the current holder
/// may always finish regardless of lease remaining.
fn verify_holder(
    graph: &TaskGraph,
    leases: &LeaseManager,
    task_id: &str,
    agent: &str,
    now: DateTime<Utc>,
    allow_expired: bool,
) -> Result<()> {
    let task = graph.task(task_id)?;
    match leases.lease(task_id) {
        Some(lease) if lease.agent != agent => Err(CoreError::WrongLeaseHolder {
            task: task_id.to_string(),
            holder: lease.agent.clone(),
            agent: agent.to_string(),
        }),
        Some(lease) if lease.is_expired(now) && !allow_expired => {
            Err(CoreError::LeaseExpired(task_id.to_string()))
        }
        Some(_) => Ok(()),
        None => {
            let was_recovered_from = task
                .worklog
                .iter()
                .rev()
                .find(|e| e.kind == WorklogKind::Recovery)
                .map(|e| e.author.as_deref() == Some(agent))
                .unwrap_or(false);
            if task.assignee.as_deref() == Some(agent) || was_recovered_from {
                // The sweeper got here first; the agent must re-request.
                Err(CoreError::LeaseExpired(task_id.to_string()))
            } else {
                Err(CoreError::not_holder(task_id, agent))
            }
        }
    }
}

/// Apply one progress report. Renews the lease on every accepted report;
/// progress 100 or an explicit `completed` status routes to completion.
#[allow(clippy::too_many_arguments)]
pub fn apply_progress(
    graph: &mut TaskGraph,
    leases: &mut LeaseManager,
    registry: &mut AgentRegistry,
    config: &CoreConfig,
    agent: &str,
    task_id: &str,
    status: ProgressStatus,
    progress: u8,
    message: &str,
    now: DateTime<Utc>,
) -> Result<ProgressAck> {
    let current = graph.task(task_id)?.status;
    if current.is_terminal() {
        return Err(CoreError::invalid_transition(task_id, current, TaskStatus::InProgress));
    }
    verify_holder(graph, leases, task_id, agent, now, status == ProgressStatus::Completed)?;

    match status {
        ProgressStatus::Completed => {
            complete(graph, leases, registry, agent, task_id, message, now)
        }
        ProgressStatus::Blocked => {
            if current == TaskStatus::InProgress {
                graph.transition(task_id, TaskStatus::Blocked, now)?;
            }
            graph.set_blocker(
                task_id,
                Some(BlockerRecord {
                    severity: BlockerSeverity::Medium,
                    description: message.to_string(),
                    reported_by: agent.to_string(),
                    reported_at: now,
                }),
                now,
            )?;
            graph.append_worklog(
                task_id,
                WorklogEntry::new(now, Some(agent.to_string()), WorklogKind::Blocker, message),
            )?;
            let lease = leases.renew(task_id, agent, now, config.lease_duration())?;
            Ok(ProgressAck { lease: Some(lease), ..Default::default() })
        }
        ProgressStatus::Paused => {
            graph.append_worklog(
                task_id,
                WorklogEntry::new(
                    now,
                    Some(agent.to_string()),
                    WorklogKind::Note,
                    format!("paused: {message}"),
                ),
            )?;
            let lease = leases.renew(task_id, agent, now, config.lease_duration())?;
            Ok(ProgressAck { lease: Some(lease), ..Default::default() })
        }
        ProgressStatus::InProgress => {
            let mut unblocked = false;
            if current == TaskStatus::Blocked {
                graph.transition(task_id, TaskStatus::InProgress, now)?;
                graph.set_blocker(task_id, None, now)?;
                unblocked = true;
            }
            let previous = graph.task(task_id)?.progress;
            let effective = if progress < previous {
                match config.progress_monotonic_policy {
                    MonotonicPolicy::Reject => {
                        return Err(CoreError::Validation(format!(
                            "non-monotonic progress on {task_id}: {progress} after {previous}"
                        )));
                    }
                    MonotonicPolicy::Clamp => previous,
                }
            } else {
                progress.min(100)
            };
            graph.set_progress(task_id, effective, now)?;
            graph.append_worklog(
                task_id,
                WorklogEntry::new(
                    now,
                    Some(agent.to_string()),
                    WorklogKind::Progress,
                    format!("{effective}%: {message}"),
                ),
            )?;
            if effective == 100 {
                let mut ack = complete(graph, leases, registry, agent, task_id, message, now)?;
                ack.unblocked = unblocked;
                return Ok(ack);
            }
            let lease = leases.renew(task_id, agent, now, config.lease_duration())?;
            Ok(ProgressAck { lease: Some(lease), unblocked, ..Default::default() })
        }
    }
}

/// Completion: DONE, dependents re-evaluate naturally on the next ready
/// snapshot, and the parent may roll up.
fn complete(
    graph: &mut TaskGraph,
    leases: &mut LeaseManager,
    registry: &mut AgentRegistry,
    agent: &str,
    task_id: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<ProgressAck> {
    let current = graph.task(task_id)?.status;
    if !current.can_transition_to(TaskStatus::Done) {
        return Err(CoreError::invalid_transition(task_id, current, TaskStatus::Done));
    }
    graph.transition(task_id, TaskStatus::Done, now)?;
    graph.set_progress(task_id, 100, now)?;
    graph.set_blocker(task_id, None, now)?;
    graph.set_assignee(task_id, None, now)?;
    graph.append_worklog(
        task_id,
        WorklogEntry::new(
            now,
            Some(agent.to_string()),
            WorklogKind::Progress,
            format!("completed: {message}"),
        ),
    )?;
    leases.release(task_id);

    let labels = graph.task(task_id)?.labels.clone();
    if let Ok(profile) = registry.agent_mut(agent) {
        profile.assignment = None;
        profile.performance.record_completed(&labels);
        profile.last_heartbeat = now;
    }

    let mut parent_completed = None;
    if let Some(parent_id) = graph.task(task_id)?.parent.clone() {
        if graph.rollup_parent(&parent_id, now)? {
            parent_completed = Some(parent_id);
        }
    }

    tracing::info!(task_id = %task_id, agent_id = %agent, "task completed");
    Ok(ProgressAck { lease: None, completed: true, parent_completed, unblocked: false })
}

/// Record a blocker without releasing the lease; the agent still owns the
/// task until it completes or surrenders.
pub fn apply_blocker(
    graph: &mut TaskGraph,
    leases: &mut LeaseManager,
    config: &CoreConfig,
    agent: &str,
    task_id: &str,
    description: &str,
    severity: BlockerSeverity,
    now: DateTime<Utc>,
) -> Result<()> {
    let current = graph.task(task_id)?.status;
    if current.is_terminal() {
        return Err(CoreError::invalid_transition(task_id, current, TaskStatus::Blocked));
    }
    verify_holder(graph, leases, task_id, agent, now, false)?;
    if current == TaskStatus::InProgress {
        graph.transition(task_id, TaskStatus::Blocked, now)?;
    }
    graph.set_blocker(
        task_id,
        Some(BlockerRecord {
            severity,
            description: description.to_string(),
            reported_by: agent.to_string(),
            reported_at: now,
        }),
        now,
    )?;
    graph.append_worklog(
        task_id,
        WorklogEntry::new(
            now,
            Some(agent.to_string()),
            WorklogKind::Blocker,
            format!("{severity:?}: {description}"),
        ),
    )?;
    leases.renew(task_id, agent, now, config.lease_duration())?;
    tracing::warn!(task_id = %task_id, agent_id = %agent, ?severity, "blocker reported");
    Ok(())
}

/// Explicit surrender: the task returns to the pool immediately.
pub fn apply_abandon(
    graph: &mut TaskGraph,
    leases: &mut LeaseManager,
    registry: &mut AgentRegistry,
    agent: &str,
    task_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let current = graph.task(task_id)?.status;
    if current != TaskStatus::InProgress {
        return Err(CoreError::invalid_transition(task_id, current, TaskStatus::Todo));
    }
    verify_holder(graph, leases, task_id, agent, now, true)?;
    graph.transition(task_id, TaskStatus::Todo, now)?;
    graph.set_assignee(task_id, None, now)?;
    graph.set_progress(task_id, 0, now)?;
    graph.append_worklog(
        task_id,
        WorklogEntry::new(
            now,
            Some(agent.to_string()),
            WorklogKind::Surrender,
            format!("surrendered: {reason}"),
        ),
    )?;
    leases.release(task_id);
    if let Ok(profile) = registry.agent_mut(agent) {
        profile.assignment = None;
        profile.performance.abandoned += 1;
    }
    tracing::info!(task_id = %task_id, agent_id = %agent, "task surrendered");
    Ok(())
}

/// Sweeper pass: return orphaned IN_PROGRESS tasks to TODO. BLOCKED tasks
/// keep their holder; the state machine has no blocked-to-todo edge.
pub fn recover_expired(
    graph: &mut TaskGraph,
    leases: &mut LeaseManager,
    registry: &mut AgentRegistry,
    now: DateTime<Utc>,
) -> Vec<TaskId> {
    let mut recovered = Vec::new();
    for lease in leases.expired(now) {
        let status = match graph.get(&lease.task) {
            Some(task) => task.status,
            None => {
                leases.release(&lease.task);
                continue;
            }
        };
        if status != TaskStatus::InProgress {
            continue;
        }
        let result: Result<()> = (|| {
            graph.transition(&lease.task, TaskStatus::Todo, now)?;
            graph.set_assignee(&lease.task, None, now)?;
            graph.set_progress(&lease.task, 0, now)?;
            graph.append_worklog(
                &lease.task,
                WorklogEntry::new(
                    now,
                    Some(lease.agent.clone()),
                    WorklogKind::Recovery,
                    format!("lease held by {} expired; returned to queue", lease.agent),
                ),
            )?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                leases.release(&lease.task);
                if let Ok(profile) = registry.agent_mut(&lease.agent) {
                    profile.assignment = None;
                    profile.performance.recovered += 1;
                }
                tracing::warn!(
                    event = "orphan_recovered",
                    task_id = %lease.task,
                    agent_id = %lease.agent,
                    lease_version = lease.version,
                    "expired lease recovered"
                );
                recovered.push(lease.task.clone());
            }
            Err(err) => {
                tracing::error!(task_id = %lease.task, error = %err, "orphan recovery failed");
            }
        }
    }
    recovered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewTask, Role};
    use std::collections::BTreeSet;

    struct Fixture {
        graph: TaskGraph,
        leases: LeaseManager,
        registry: AgentRegistry,
        config: CoreConfig,
        now: DateTime<Utc>,
    }

    /// One task assigned to worker-1, lease live.
    fn fixture() -> Fixture {
        let mut graph = TaskGraph::new();
        let mut leases = LeaseManager::new();
        let mut registry = AgentRegistry::new();
        let config = CoreConfig::default();
        let now = Utc::now();

        graph.insert(NewTask::new("t-1", "The task"), now).unwrap();
        registry.register("worker-1", Role::Agent, BTreeSet::new(), now).unwrap();
        graph.transition("t-1", TaskStatus::InProgress, now).unwrap();
        graph.set_assignee("t-1", Some("worker-1".into()), now).unwrap();
        registry.set_assignment("worker-1", Some("t-1".into())).unwrap();
        leases.grant("t-1", "worker-1", now, config.lease_duration()).unwrap();

        Fixture { graph, leases, registry, config, now }
    }

    fn progress(f: &mut Fixture, agent: &str, pct: u8) -> Result<ProgressAck> {
        apply_progress(
            &mut f.graph,
            &mut f.leases,
            &mut f.registry,
            &f.config,
            agent,
            "t-1",
            ProgressStatus::InProgress,
            pct,
            "working",
            f.now,
        )
    }

    #[test]
    fn progress_renews_the_lease_and_appends_worklog() {
        let mut f = fixture();
        let ack = progress(&mut f, "worker-1", 25).unwrap();
        let lease = ack.lease.unwrap();
        assert_eq!(lease.renewals, 1);
        assert!(!ack.completed);
        let task = f.graph.task("t-1").unwrap();
        assert_eq!(task.progress, 25);
        assert!(task.worklog.iter().any(|e| e.kind == WorklogKind::Progress));
    }

    #[test]
    fn non_holder_and_stranger_are_told_apart() {
        let mut f = fixture();
        let err = progress(&mut f, "worker-2", 10).unwrap_err();
        assert!(matches!(err, CoreError::WrongLeaseHolder { .. }));
    }

    #[test]
    fn non_monotonic_progress_rejected_by_default_clamped_on_request() {
        let mut f = fixture();
        progress(&mut f, "worker-1", 50).unwrap();
        let err = progress(&mut f, "worker-1", 30).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        f.config.progress_monotonic_policy = MonotonicPolicy::Clamp;
        progress(&mut f, "worker-1", 30).unwrap();
        assert_eq!(f.graph.task("t-1").unwrap().progress, 50);
    }

    #[test]
    fn hundred_percent_routes_to_completion() {
        let mut f = fixture();
        let ack = progress(&mut f, "worker-1", 100).unwrap();
        assert!(ack.completed);
        assert!(ack.lease.is_none());
        let task = f.graph.task("t-1").unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert!(task.assignee.is_none());
        assert!(f.leases.lease("t-1").is_none());
        assert_eq!(f.registry.agent("worker-1").unwrap().performance.completed, 1);
        assert!(f.registry.agent("worker-1").unwrap().assignment.is_none());
    }

    #[test]
    fn progress_after_completion_is_an_invalid_transition() {
        let mut f = fixture();
        progress(&mut f, "worker-1", 100).unwrap();
        let err = progress(&mut f, "worker-1", 100).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[test]
    fn completion_succeeds_for_holder_even_after_lease_expiry() {
        let mut f = fixture();
        let late = f.now + chrono::Duration::seconds(f.config.lease_duration_secs as i64 + 60);
        // A plain progress report at this point is LeaseExpired...
        let err = apply_progress(
            &mut f.graph,
            &mut f.leases,
            &mut f.registry,
            &f.config,
            "worker-1",
            "t-1",
            ProgressStatus::InProgress,
            80,
            "late",
            late,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::LeaseExpired(_)));
        // ...but completion still lands for the current holder.
        let ack = apply_progress(
            &mut f.graph,
            &mut f.leases,
            &mut f.registry,
            &f.config,
            "worker-1",
            "t-1",
            ProgressStatus::Completed,
            100,
            "done",
            late,
        )
        .unwrap();
        assert!(ack.completed);
    }

    #[test]
    fn blocker_keeps_lease_and_holder() {
        let mut f = fixture();
        apply_blocker(
            &mut f.graph,
            &mut f.leases,
            &f.config,
            "worker-1",
            "t-1",
            "missing OAuth creds",
            BlockerSeverity::High,
            f.now,
        )
        .unwrap();
        let task = f.graph.task("t-1").unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.assignee.as_deref(), Some("worker-1"));
        assert!(f.leases.is_holder("t-1", "worker-1", f.now));
        assert_eq!(
            task.open_blocker.as_ref().map(|b| b.severity),
            Some(BlockerSeverity::High)
        );
    }

    #[test]
    fn in_progress_report_unblocks_a_blocked_task() {
        let mut f = fixture();
        apply_blocker(
            &mut f.graph,
            &mut f.leases,
            &f.config,
            "worker-1",
            "t-1",
            "waiting",
            BlockerSeverity::Low,
            f.now,
        )
        .unwrap();
        let ack = progress(&mut f, "worker-1", 60).unwrap();
        assert!(ack.unblocked);
        let task = f.graph.task("t-1").unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.open_blocker.is_none());
    }

    #[test]
    fn surrender_returns_the_task_to_the_pool() {
        let mut f = fixture();
        progress(&mut f, "worker-1", 40).unwrap();
        apply_abandon(
            &mut f.graph,
            &mut f.leases,
            &mut f.registry,
            "worker-1",
            "t-1",
            "context exhausted",
            f.now,
        )
        .unwrap();
        let task = f.graph.task("t-1").unwrap();
        assert_eq!(task.status, TaskStatus::Todo);
        assert!(task.assignee.is_none());
        assert_eq!(task.progress, 0);
        assert!(f.leases.lease("t-1").is_none());
        assert_eq!(f.registry.agent("worker-1").unwrap().performance.abandoned, 1);
    }

    #[test]
    fn sweeper_recovers_only_expired_in_progress_tasks() {
        let mut f = fixture();
        // A second, still-live assignment.
        f.graph.insert(NewTask::new("t-2", "other"), f.now).unwrap();
        f.registry.register("worker-2", Role::Agent, BTreeSet::new(), f.now).unwrap();
        f.graph.transition("t-2", TaskStatus::InProgress, f.now).unwrap();
        f.graph.set_assignee("t-2", Some("worker-2".into()), f.now).unwrap();
        let later = f.now + chrono::Duration::seconds(200);
        f.leases.grant("t-2", "worker-2", later, f.config.lease_duration()).unwrap();

        let sweep_at = f.now + chrono::Duration::seconds(f.config.lease_duration_secs as i64 + 5);
        let recovered = recover_expired(&mut f.graph, &mut f.leases, &mut f.registry, sweep_at);
        assert_eq!(recovered, vec!["t-1"]);

        let task = f.graph.task("t-1").unwrap();
        assert_eq!(task.status, TaskStatus::Todo);
        assert!(task.assignee.is_none());
        assert!(task.worklog.iter().any(|e| e.kind == WorklogKind::Recovery));
        assert_eq!(f.registry.agent("worker-1").unwrap().performance.recovered, 1);
        // The live lease was untouched.
        assert!(f.leases.lease("t-2").is_some());
    }

    #[test]
    fn blocked_tasks_are_not_swept() {
        let mut f = fixture();
        apply_blocker(
            &mut f.graph,
            &mut f.leases,
            &f.config,
            "worker-1",
            "t-1",
            "waiting on access",
            BlockerSeverity::Medium,
            f.now,
        )
        .unwrap();
        let sweep_at = f.now + chrono::Duration::seconds(f.config.lease_duration_secs as i64 * 3);
        let recovered = recover_expired(&mut f.graph, &mut f.leases, &mut f.registry, sweep_at);
        assert!(recovered.is_empty());
        assert_eq!(f.graph.task("t-1").unwrap().status, TaskStatus::Blocked);
        assert_eq!(f.graph.task("t-1").unwrap().assignee.as_deref(), Some("worker-1"));
    }
}
