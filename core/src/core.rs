use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::assigner::{self, FilterVerdict};
use crate::config::CoreConfig;
use crate::context::{self, TaskContext};
use crate::dependency::{self, DependencyEngine, InferenceOutcome, InferredEdge};
use crate::diagnostics::{self, DiagnosticReport, EmptyReason};
use crate::error::{CoreError, Result};
use crate::graph::TaskGraph;
use crate::lease::LeaseManager;
use crate::models::{
    AgentProfile, Artifact, AssignmentRecord, BlockerSeverity, Decision, DependencyKind, Lease,
    NewTask, Predictions, ProgressStatus, Role, Task, TaskId, TaskStatus,
};
use crate::oracle::{with_deadline, HeuristicOracle, Oracle};
use crate::progress::{self, ProgressAck};
use crate::provider::{IdempotencyKey, Provider, RetryingProvider};
use crate::registry::{AgentRegistry, Registration};
use crate::store::{self, keys, StateStore};

/// Mutable state behind the serialization point: the task graph, the agent
/// registry, the lease table, and the inference gate. Everything here is
/// mutated only while holding the write half of the lock.
struct CoreState {
    graph: TaskGraph,
    registry: AgentRegistry,
    leases: LeaseManager,
    engine: DependencyEngine,
}

/// A granted assignment: the task, its lease, and a self-contained context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentPayload {
    pub task: Task,
    pub lease: Lease,
    pub context: TaskContext,
}

/// Outcome of `request_next_task`: either work or an explanation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Assignment {
    Assigned(Box<AssignmentPayload>),
    Empty { empty: bool, diagnostics: DiagnosticReport },
}

impl Assignment {
    fn empty(diagnostics: DiagnosticReport) -> Self {
        Assignment::Empty { empty: true, diagnostics }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Assignment::Empty { .. })
    }

    pub fn payload(&self) -> Option<&AssignmentPayload> {
        match self {
            Assignment::Assigned(payload) => Some(payload),
            Assignment::Empty { .. } => None,
        }
    }
}

/// Upstream/downstream view of one task's dependency neighborhood.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DependencyReport {
    pub task: TaskId,
    pub upstream: Vec<TaskId>,
    pub downstream: Vec<TaskId>,
    pub cycles: Vec<Vec<TaskId>>,
    pub critical_path: Vec<TaskId>,
}

/// Roll-up numbers for operators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectStatus {
    pub total_tasks: usize,
    pub counts_by_status: BTreeMap<String, usize>,
    pub completion_percent: f64,
    pub in_flight: Vec<InFlightRef>,
    pub registered_agents: usize,
}

/// One currently-held task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InFlightRef {
    pub task: TaskId,
    pub name: String,
    pub assignee: Option<String>,
    pub progress: u8,
    pub status: TaskStatus,
}

/// Diagnostics folded into a single score plus counts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoardHealth {
    pub health_score: u8,
    pub counts_by_status: BTreeMap<String, usize>,
    pub issues: Vec<diagnostics::Issue>,
}

/// An agent as `get_agent_status` reports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStatusView {
    pub agent: AgentProfile,
    pub lease: Option<Lease>,
}

/// Result of one reconciliation pass against the provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    pub cards_examined: usize,
    pub statuses_repaired: usize,
    pub cards_created: usize,
}

/// The coordination core: one explicit value constructed at startup and
/// threaded through handlers, no hidden globals.
///
/// Reads take the shared half of the lock and may proceed concurrently;
/// mutations take the exclusive half, so the re-check-then-reserve step of
/// assignment is an atomic critical section. Provider and oracle calls run
/// outside the lock; durable writes complete before a mutation returns.
pub struct Core {
    state: RwLock<CoreState>,
    store: Arc<dyn StateStore>,
    provider: RetryingProvider<Arc<dyn Provider>>,
    oracle: Arc<dyn Oracle>,
    fallback: HeuristicOracle,
    config: CoreConfig,
}

impl Core {
    pub fn new(
        config: CoreConfig,
        store: Arc<dyn StateStore>,
        provider: Arc<dyn Provider>,
        oracle: Arc<dyn Oracle>,
    ) -> Result<Self> {
        config.validate()?;
        let fallback = HeuristicOracle::new(config.fit_weights);
        let engine = DependencyEngine::new(config.ai_confidence_threshold);
        Ok(Self {
            state: RwLock::new(CoreState {
                graph: TaskGraph::new(),
                registry: AgentRegistry::new(),
                leases: LeaseManager::new(),
                engine,
            }),
            provider: RetryingProvider::new(provider, config.provider_retry_bound),
            store,
            oracle,
            fallback,
            config,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Replay durable state after a restart. Leases already expired at load
    /// time are left for the first sweep.
    pub async fn recover(&self) -> Result<()> {
        let tasks: Vec<Task> = store::scan_json(self.store.as_ref(), keys::TASKS).await?;
        let agents: Vec<AgentProfile> = store::scan_json(self.store.as_ref(), keys::AGENTS).await?;
        let leases: Vec<Lease> = store::scan_json(self.store.as_ref(), keys::LEASES).await?;
        let decisions: Vec<Decision> =
            store::scan_json(self.store.as_ref(), keys::DECISIONS).await?;
        let artifacts: Vec<Artifact> =
            store::scan_json(self.store.as_ref(), keys::ARTIFACTS).await?;

        let mut state = self.state.write().await;
        let restored_tasks = tasks.len();
        for task in tasks {
            state.graph.restore(task);
        }
        for agent in agents {
            state.registry.restore(agent);
        }
        for lease in leases {
            state.leases.restore(lease);
        }
        for decision in decisions {
            state.graph.restore_decision(decision);
        }
        for artifact in artifacts {
            state.graph.restore_artifact(artifact);
        }
        tracing::info!(
            tasks = restored_tasks,
            agents = state.registry.len(),
            leases = state.leases.active_count(),
            "state recovered from store"
        );
        Ok(())
    }

    // ---- task lifecycle ------------------------------------------------

    /// Create a task. Local first, durable, then reflected to the provider;
    /// a failed provider write rolls the creation back so the local store
    /// stays authoritative.
    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        if new.id.contains('/') {
            return Err(CoreError::Validation("task id must not contain '/'".into()));
        }
        let now = Utc::now();
        let task = {
            let mut state = self.state.write().await;
            let task = state.graph.insert(new, now)?.clone();
            if let Err(err) =
                store::put_json(self.store.as_ref(), &keys::task(&task.id), &task).await
            {
                state.graph.remove(&task.id)?;
                return Err(err);
            }
            // A subtask mutates its parent's child list; keep that durable.
            if let Some(parent_id) = &task.parent {
                let parent = state.graph.task(parent_id)?.clone();
                store::put_json(self.store.as_ref(), &keys::task(parent_id), &parent).await?;
            }
            task
        };

        let key = IdempotencyKey::derive("create", &task.id, 0);
        if let Err(err) = self.provider.create_card(&key, &task).await {
            let mut state = self.state.write().await;
            state.graph.remove(&task.id)?;
            self.store.delete(&keys::task(&task.id)).await?;
            if let Some(parent_id) = &task.parent {
                if let Some(parent) = state.graph.get(parent_id).cloned() {
                    store::put_json(self.store.as_ref(), &keys::task(parent_id), &parent).await?;
                }
            }
            return Err(err);
        }
        Ok(task)
    }

    /// Explicit deletion; the only way a task leaves the graph.
    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        let parent = {
            let mut state = self.state.write().await;
            let removed = state.graph.remove(task_id)?;
            state.leases.release(task_id);
            match &removed.parent {
                Some(parent_id) => state.graph.get(parent_id).cloned(),
                None => None,
            }
        };
        self.store.delete(&keys::task(task_id)).await?;
        self.store.delete(&keys::lease(task_id)).await?;
        if let Some(parent) = parent {
            store::put_json(self.store.as_ref(), &keys::task(&parent.id), &parent).await?;
        }
        // Decisions and artifacts die with their task.
        for prefix in [format!("decisions/{task_id}/"), format!("artifacts/{task_id}/")] {
            for (key, _) in self.store.scan_prefix(&prefix).await? {
                self.store.delete(&key).await?;
            }
        }
        let key = IdempotencyKey::derive("delete", task_id, 0);
        if let Err(err) = self.provider.delete_card(&key, task_id).await {
            tracing::warn!(task_id, error = %err, "board delete failed; reconciliation will retry");
        }
        Ok(())
    }

    /// Cancel a TODO task. Local wins; the board is updated best-effort.
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        let now = Utc::now();
        let task = {
            let mut state = self.state.write().await;
            state.graph.transition(task_id, TaskStatus::Cancelled, now)?;
            state.leases.release(task_id);
            state.graph.task(task_id)?.clone()
        };
        store::put_json(self.store.as_ref(), &keys::task(task_id), &task).await?;
        let key = IdempotencyKey::derive("cancel", task_id, 0);
        if let Err(err) = self.provider.set_status(&key, task_id, TaskStatus::Cancelled).await {
            tracing::warn!(task_id, error = %err, "board cancel failed; reconciliation will retry");
        }
        Ok(())
    }

    /// Add a dependency edge between existing tasks.
    pub async fn add_dependency(
        &self,
        from: &str,
        on: &str,
        kind: DependencyKind,
    ) -> Result<()> {
        let now = Utc::now();
        let task = {
            let mut state = self.state.write().await;
            state.graph.add_dependency(from, on, kind, now)?;
            state.graph.task(from)?.clone()
        };
        store::put_json(self.store.as_ref(), &keys::task(from), &task).await
    }

    /// One inference round: consult the oracle under its deadline, fall back
    /// to the pattern rules, then gate every proposal through validation and
    /// the confidence threshold.
    pub async fn infer_dependencies(&self) -> Result<InferenceOutcome> {
        let snapshot: Vec<Task> = {
            let state = self.state.read().await;
            state.graph.all_tasks().cloned().collect()
        };
        let proposals: Vec<InferredEdge> = match with_deadline(
            self.config.ai_deadline(),
            "infer_dependencies",
            self.oracle.infer_dependencies(&snapshot),
        )
        .await
        {
            Ok(edges) => edges,
            Err(err) => {
                tracing::debug!(error = %err, "oracle inference unavailable, using pattern rules");
                self.fallback.infer_dependencies(&snapshot).await?
            }
        };

        let now = Utc::now();
        let (outcome, touched) = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let outcome = state.engine.apply_inferred(&mut state.graph, proposals, now);
            let touched: Vec<Task> = outcome
                .applied
                .iter()
                .filter_map(|e| state.graph.get(&e.from).cloned())
                .collect();
            (outcome, touched)
        };
        for task in touched {
            store::put_json(self.store.as_ref(), &keys::task(&task.id), &task).await?;
        }
        Ok(outcome)
    }

    // ---- agents --------------------------------------------------------

    /// Idempotent agent registration.
    pub async fn register_agent(
        &self,
        agent_id: &str,
        role: Role,
        capabilities: impl IntoIterator<Item = String>,
    ) -> Result<Registration> {
        if agent_id.contains('/') {
            return Err(CoreError::Validation("agent id must not contain '/'".into()));
        }
        let now = Utc::now();
        let (registration, profile) = {
            let mut state = self.state.write().await;
            let registration =
                state.registry.register(agent_id, role, capabilities.into_iter().collect(), now)?;
            (registration, state.registry.agent(agent_id)?.clone())
        };
        store::put_json(self.store.as_ref(), &keys::agent(agent_id), &profile).await?;
        Ok(registration)
    }

    /// Liveness ping outside the progress path.
    pub async fn agent_heartbeat(&self, agent_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.registry.heartbeat(agent_id, Utc::now())
    }

    pub async fn list_agents(&self) -> Vec<AgentProfile> {
        let state = self.state.read().await;
        let mut agents: Vec<AgentProfile> = state.registry.all().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub async fn get_agent_status(&self, agent_id: &str) -> Result<AgentStatusView> {
        let state = self.state.read().await;
        let agent = state.registry.agent(agent_id)?.clone();
        let lease = agent.assignment.as_deref().and_then(|t| state.leases.lease(t)).cloned();
        Ok(AgentStatusView { agent, lease })
    }

    // ---- the hot path --------------------------------------------------

    /// Hand the agent its next task, or explain why there is none.
    ///
    /// Holding agents get an idempotent view of their open assignment with a
    /// refreshed lease. Otherwise: snapshot the ready set, filter by
    /// capability, score (oracle with fallback), and reserve the winner under
    /// the write lock, re-checking readiness before committing. Loses of the
    /// re-check race retry up to the configured bound.
    pub async fn request_next_task(&self, agent_id: &str) -> Result<Assignment> {
        let now = Utc::now();

        if let Some(assignment) = self.idempotent_view(agent_id, now).await? {
            return Ok(Assignment::Assigned(Box::new(assignment)));
        }

        let mut lost_race = false;
        for attempt in 0..self.config.assignment_retry_bound {
            // Snapshot outside any exclusive section.
            let (agent, candidates, verdict) = {
                let state = self.state.read().await;
                let agent = state.registry.agent(agent_id)?.clone();
                let ready = state.graph.ready_tasks();
                let (candidates, verdict) = assigner::filter_candidates(&ready, &agent);
                let candidates: Vec<Task> = candidates.into_iter().cloned().collect();
                (agent, candidates, verdict)
            };

            match verdict {
                FilterVerdict::NothingReady => {
                    let reason = if lost_race {
                        EmptyReason::ConcurrentLostRace
                    } else {
                        EmptyReason::NoReadyTasks
                    };
                    return Ok(Assignment::empty(self.diagnose_with(Some(reason)).await));
                }
                FilterVerdict::NothingFits => {
                    tracing::info!(agent_id, "capability mismatch: ready work fits other agents");
                    return Ok(Assignment::empty(
                        self.diagnose_with(Some(EmptyReason::NoCapabilityFit)).await,
                    ));
                }
                FilterVerdict::Candidates => {}
            }

            let scored = self.score_candidates(&agent, &candidates).await;
            let refs: Vec<(&Task, f64)> =
                candidates.iter().zip(scored.iter().copied()).collect();
            let Some(best) = assigner::best_candidate(&refs) else {
                return Ok(Assignment::empty(
                    self.diagnose_with(Some(EmptyReason::NoReadyTasks)).await,
                ));
            };
            let task_id = best.id.clone();

            match self.reserve(agent_id, &task_id, now).await? {
                Some(payload) => {
                    if let Err(err) = self.reflect_assignment(&payload).await {
                        self.rollback_reservation(agent_id, &task_id).await?;
                        return Err(err);
                    }
                    return Ok(Assignment::Assigned(Box::new(payload)));
                }
                None => {
                    // Somebody else took it between snapshot and reserve.
                    lost_race = true;
                    tracing::debug!(agent_id, task_id = %task_id, attempt, "reservation lost race");
                    continue;
                }
            }
        }
        Ok(Assignment::empty(
            self.diagnose_with(Some(EmptyReason::ConcurrentLostRace)).await,
        ))
    }

    /// The existing assignment, with a refreshed lease, if the agent holds
    /// one. The handout is what grants ownership, so an expired-but-unswept
    /// lease is replaced rather than refused here.
    async fn idempotent_view(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AssignmentPayload>> {
        let mut state = self.state.write().await;
        let Some(task_id) = state.registry.agent(agent_id)?.assignment.clone() else {
            return Ok(None);
        };
        let lease = match state.leases.lease(&task_id) {
            Some(l) if l.agent == agent_id && !l.is_expired(now) => {
                state.leases.renew(&task_id, agent_id, now, self.config.lease_duration())?
            }
            _ => {
                state.leases.release(&task_id);
                state.leases.grant(&task_id, agent_id, now, self.config.lease_duration())?
            }
        };
        let task = state.graph.task(&task_id)?.clone();
        let mut ctx = context::assemble(&state.graph, &task_id)?;
        let agent = state.registry.agent(agent_id)?.clone();
        drop(state);

        ctx.predictions = Some(self.predict(&agent, &task).await);
        store::put_json(self.store.as_ref(), &keys::lease(&task_id), &lease).await?;
        tracing::debug!(agent_id, task_id = %task_id, "idempotent assignment view");
        Ok(Some(AssignmentPayload { task, lease, context: ctx }))
    }

    /// Score every candidate in one oracle round bounded by the deadline;
    /// fall back to the closed-form combination on timeout or error.
    async fn score_candidates(&self, agent: &AgentProfile, candidates: &[Task]) -> Vec<f64> {
        let oracle_scores = with_deadline(self.config.ai_deadline(), "score_fit", async {
            let mut scores = Vec::with_capacity(candidates.len());
            for task in candidates {
                scores.push(self.oracle.score_fit(agent, task).await?);
            }
            Ok(scores)
        })
        .await;
        match oracle_scores {
            Ok(scores) => scores,
            Err(err) => {
                tracing::debug!(error = %err, "oracle scoring unavailable, using fallback");
                candidates.iter().map(|t| self.fallback.fit_score(agent, t)).collect()
            }
        }
    }

    /// The atomic re-check-then-reserve step. Returns `None` when the task
    /// is no longer assignable (lost race), leaving state untouched.
    async fn reserve(
        &self,
        agent_id: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AssignmentPayload>> {
        let mut state = self.state.write().await;

        let still_assignable = state
            .graph
            .get(task_id)
            .map(|t| {
                t.status == TaskStatus::Todo
                    && t.open_blocker.is_none()
                    && !t.is_container()
                    && state.graph.hard_predecessors_done(t)
            })
            .unwrap_or(false);
        if !still_assignable || state.registry.agent(agent_id)?.assignment.is_some() {
            return Ok(None);
        }

        state.graph.transition(task_id, TaskStatus::InProgress, now)?;
        state.graph.set_assignee(task_id, Some(agent_id.to_string()), now)?;
        let lease = match state.leases.grant(task_id, agent_id, now, self.config.lease_duration())
        {
            Ok(lease) => lease,
            Err(_) => {
                // A lease we did not expect; undo and report the race.
                state.graph.transition(task_id, TaskStatus::Todo, now)?;
                state.graph.set_assignee(task_id, None, now)?;
                return Ok(None);
            }
        };
        let labels = state.graph.task(task_id)?.labels.clone();
        {
            let profile = state.registry.agent_mut(agent_id)?;
            profile.assignment = Some(task_id.to_string());
            profile.performance.record_assigned(&labels);
            profile.last_heartbeat = now;
        }

        let record = AssignmentRecord {
            task: task_id.to_string(),
            agent: agent_id.to_string(),
            lease_version: lease.version,
            granted_at: now,
        };
        let task = state.graph.task(task_id)?.clone();
        let profile = state.registry.agent(agent_id)?.clone();

        // Durable before the lock is released; the assignment record lands
        // before the provider hears anything.
        let persisted: Result<()> = async {
            store::put_json(self.store.as_ref(), &keys::assignment(agent_id), &record).await?;
            store::put_json(self.store.as_ref(), &keys::lease(task_id), &lease).await?;
            store::put_json(self.store.as_ref(), &keys::task(task_id), &task).await?;
            store::put_json(self.store.as_ref(), &keys::agent(agent_id), &profile).await?;
            Ok(())
        }
        .await;
        if let Err(err) = persisted {
            state.graph.transition(task_id, TaskStatus::Todo, now)?;
            state.graph.set_assignee(task_id, None, now)?;
            state.leases.release(task_id);
            state.registry.agent_mut(agent_id)?.assignment = None;
            return Err(err);
        }

        let mut ctx = context::assemble(&state.graph, task_id)?;
        drop(state);

        ctx.predictions = Some(self.predict(&profile, &task).await);
        tracing::info!(agent_id, task_id, lease_version = lease.version, "task assigned");
        Ok(Some(AssignmentPayload { task, lease, context: ctx }))
    }

    /// Tell the board. Called after the reservation is durable.
    async fn reflect_assignment(&self, payload: &AssignmentPayload) -> Result<()> {
        let task_id = &payload.task.id;
        let key = IdempotencyKey::derive("assign", task_id, payload.lease.version);
        self.provider.set_status(&key, task_id, TaskStatus::InProgress).await?;
        let comment_key = IdempotencyKey::derive("assign-note", task_id, payload.lease.version);
        self.provider
            .append_comment(
                &comment_key,
                task_id,
                &format!("Assigned to {}", payload.lease.agent),
            )
            .await
    }

    /// Undo a reservation whose provider reflection failed.
    async fn rollback_reservation(&self, agent_id: &str, task_id: &str) -> Result<()> {
        let now = Utc::now();
        {
            let mut state = self.state.write().await;
            let still_holder = state
                .leases
                .lease(task_id)
                .map(|l| l.agent == agent_id)
                .unwrap_or(false);
            if still_holder {
                state.graph.transition(task_id, TaskStatus::Todo, now)?;
                state.graph.set_assignee(task_id, None, now)?;
                state.leases.release(task_id);
                state.registry.agent_mut(agent_id)?.assignment = None;
            }
        }
        self.store.delete(&keys::assignment(agent_id)).await?;
        self.store.delete(&keys::lease(task_id)).await?;
        tracing::warn!(agent_id, task_id, "assignment rolled back after provider failure");
        Ok(())
    }

    async fn predict(&self, agent: &AgentProfile, task: &Task) -> Predictions {
        match with_deadline(
            self.config.ai_deadline(),
            "predict",
            self.oracle.predict(agent, task),
        )
        .await
        {
            Ok(predictions) => predictions,
            Err(_) => {
                // The fallback is deterministic and cannot fail.
                self.fallback.predict(agent, task).await.unwrap_or(Predictions {
                    success_probability: 0.5,
                    expected_hours: 4.0,
                    blockage_risk: 0.5,
                })
            }
        }
    }

    // ---- progress ------------------------------------------------------

    /// Progress, pause, block, or completion from the holding agent.
    pub async fn report_progress(
        &self,
        agent_id: &str,
        task_id: &str,
        status: ProgressStatus,
        progress_value: u8,
        message: &str,
    ) -> Result<ProgressAck> {
        let now = Utc::now();
        let (ack, task, parent) = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let ack = progress::apply_progress(
                &mut state.graph,
                &mut state.leases,
                &mut state.registry,
                &self.config,
                agent_id,
                task_id,
                status,
                progress_value,
                message,
                now,
            )?;
            let task = state.graph.task(task_id)?.clone();
            let parent = match &ack.parent_completed {
                Some(parent_id) => Some(state.graph.task(parent_id)?.clone()),
                None => None,
            };

            store::put_json(self.store.as_ref(), &keys::task(task_id), &task).await?;
            match &ack.lease {
                Some(lease) => {
                    store::put_json(self.store.as_ref(), &keys::lease(task_id), lease).await?
                }
                None => {
                    self.store.delete(&keys::lease(task_id)).await?;
                    self.store.delete(&keys::assignment(agent_id)).await?;
                }
            }
            if let Some(parent) = &parent {
                store::put_json(self.store.as_ref(), &keys::task(&parent.id), parent).await?;
            }
            if ack.completed {
                let profile = state.registry.agent(agent_id)?.clone();
                store::put_json(self.store.as_ref(), &keys::agent(agent_id), &profile).await?;
            }
            (ack, task, parent)
        };

        // Board reflection is local-wins: failures are logged and repaired by
        // reconciliation, never unwound.
        self.reflect_progress(agent_id, &task, &ack, parent.as_ref()).await;
        Ok(ack)
    }

    async fn reflect_progress(
        &self,
        agent_id: &str,
        task: &Task,
        ack: &ProgressAck,
        parent: Option<&Task>,
    ) {
        let discriminant = task.worklog.len() as u64;
        let status_key = IdempotencyKey::derive("status", &task.id, discriminant);
        let result = if ack.completed {
            self.provider.set_status(&status_key, &task.id, TaskStatus::Done).await
        } else if task.status == TaskStatus::Blocked {
            self.provider.set_status(&status_key, &task.id, TaskStatus::Blocked).await
        } else if ack.unblocked {
            self.provider.set_status(&status_key, &task.id, TaskStatus::InProgress).await
        } else {
            Ok(())
        };
        if let Err(err) = result {
            tracing::warn!(task_id = %task.id, error = %err, "board status update failed");
        }
        if ack.completed {
            let key = IdempotencyKey::derive("done-note", &task.id, discriminant);
            if let Err(err) = self
                .provider
                .append_comment(&key, &task.id, &format!("Completed by {agent_id}"))
                .await
            {
                tracing::warn!(task_id = %task.id, error = %err, "completion comment failed");
            }
        }
        if let Some(parent) = parent {
            let discriminant = parent.worklog.len() as u64;
            let status_key = IdempotencyKey::derive("rollup-status", &parent.id, discriminant);
            let note_key = IdempotencyKey::derive("rollup-note", &parent.id, discriminant);
            let summary = parent
                .worklog
                .last()
                .map(|e| e.text.clone())
                .unwrap_or_else(|| "All subtasks complete".to_string());
            if let Err(err) = self
                .provider
                .set_status(&status_key, &parent.id, TaskStatus::Done)
                .await
                .and(self.provider.append_comment(&note_key, &parent.id, &summary).await)
            {
                tracing::warn!(task_id = %parent.id, error = %err, "rollup reflection failed");
            }
        }
    }

    /// Blocker report: the task blocks, the agent keeps it, suggestions come
    /// back from the oracle or the rule book.
    pub async fn report_blocker(
        &self,
        agent_id: &str,
        task_id: &str,
        description: &str,
        severity: BlockerSeverity,
    ) -> Result<Vec<String>> {
        let now = Utc::now();
        let task = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            progress::apply_blocker(
                &mut state.graph,
                &mut state.leases,
                &self.config,
                agent_id,
                task_id,
                description,
                severity,
                now,
            )?;
            let task = state.graph.task(task_id)?.clone();
            store::put_json(self.store.as_ref(), &keys::task(task_id), &task).await?;
            if let Some(lease) = state.leases.lease(task_id) {
                store::put_json(self.store.as_ref(), &keys::lease(task_id), lease).await?;
            }
            task
        };

        let key = IdempotencyKey::derive("blocked", task_id, task.worklog.len() as u64);
        if let Err(err) = self.provider.set_status(&key, task_id, TaskStatus::Blocked).await {
            tracing::warn!(task_id, error = %err, "board blocker update failed");
        }

        let suggestions = match with_deadline(
            self.config.ai_deadline(),
            "suggest_mitigations",
            self.oracle.suggest_mitigations(&task, description, severity),
        )
        .await
        {
            Ok(suggestions) if !suggestions.is_empty() => suggestions,
            _ => self.fallback.suggest_mitigations(&task, description, severity).await?,
        };
        Ok(suggestions)
    }

    /// Explicit surrender of the held task.
    pub async fn abandon_task(&self, agent_id: &str, task_id: &str, reason: &str) -> Result<()> {
        let now = Utc::now();
        let task = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            progress::apply_abandon(
                &mut state.graph,
                &mut state.leases,
                &mut state.registry,
                agent_id,
                task_id,
                reason,
                now,
            )?;
            let task = state.graph.task(task_id)?.clone();
            store::put_json(self.store.as_ref(), &keys::task(task_id), &task).await?;
            self.store.delete(&keys::lease(task_id)).await?;
            self.store.delete(&keys::assignment(agent_id)).await?;
            task
        };
        let key = IdempotencyKey::derive("surrender", task_id, task.worklog.len() as u64);
        if let Err(err) = self.provider.set_status(&key, task_id, TaskStatus::Todo).await {
            tracing::warn!(task_id, error = %err, "board surrender update failed");
        }
        Ok(())
    }

    // ---- decisions and artifacts --------------------------------------

    pub async fn log_decision(
        &self,
        agent_id: &str,
        task_id: &str,
        text: &str,
    ) -> Result<Decision> {
        let now = Utc::now();
        let decision = {
            let mut state = self.state.write().await;
            state.registry.agent(agent_id)?;
            let decision = state.graph.log_decision(task_id, agent_id, text.to_string(), now)?;
            store::put_json(
                self.store.as_ref(),
                &keys::decision(task_id, decision.id),
                &decision,
            )
            .await?;
            decision
        };
        let key = IdempotencyKey::derive("decision", task_id, decision.id);
        if let Err(err) = self
            .provider
            .append_comment(&key, task_id, &format!("Decision: {text}"))
            .await
        {
            tracing::warn!(task_id, error = %err, "decision comment failed");
        }
        Ok(decision)
    }

    pub async fn log_artifact(
        &self,
        agent_id: &str,
        task_id: &str,
        filename: &str,
        kind: crate::models::ArtifactKind,
        location: Option<String>,
    ) -> Result<Artifact> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let artifact =
            state.graph.log_artifact(task_id, agent_id, filename.to_string(), kind, location, now)?;
        store::put_json(
            self.store.as_ref(),
            &keys::artifact(task_id, artifact.id),
            &artifact,
        )
        .await?;
        Ok(artifact)
    }

    // ---- read surface --------------------------------------------------

    /// Full self-contained context for a task, predictions included when an
    /// assignee exists to predict for.
    pub async fn get_task_context(&self, task_id: &str) -> Result<TaskContext> {
        let (mut ctx, pair) = {
            let state = self.state.read().await;
            let ctx = context::assemble(&state.graph, task_id)?;
            let pair = ctx.task.assignee.as_deref().and_then(|a| {
                state.registry.get(a).map(|profile| (profile.clone(), ctx.task.clone()))
            });
            (ctx, pair)
        };
        if let Some((agent, task)) = pair {
            ctx.predictions = Some(self.predict(&agent, &task).await);
        }
        Ok(ctx)
    }

    pub async fn check_task_dependencies(&self, task_id: &str) -> Result<DependencyReport> {
        let state = self.state.read().await;
        state.graph.task(task_id)?;
        Ok(DependencyReport {
            task: task_id.to_string(),
            upstream: dependency::upstream_of(&state.graph, task_id),
            downstream: dependency::downstream_of(&state.graph, task_id),
            cycles: dependency::find_hard_cycles(&state.graph),
            critical_path: dependency::critical_path_through(&state.graph, task_id),
        })
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        let state = self.state.read().await;
        Ok(state.graph.task(task_id)?.clone())
    }

    pub async fn project_status(&self) -> ProjectStatus {
        let state = self.state.read().await;
        let counts = state.graph.counts_by_status();
        let total = state.graph.len();
        let done = counts.get("done").copied().unwrap_or(0);
        let cancelled = counts.get("cancelled").copied().unwrap_or(0);
        let denominator = total.saturating_sub(cancelled);
        let completion_percent = if denominator == 0 {
            100.0
        } else {
            done as f64 * 100.0 / denominator as f64
        };
        let mut in_flight: Vec<InFlightRef> = state
            .graph
            .all_tasks()
            .filter(|t| matches!(t.status, TaskStatus::InProgress | TaskStatus::Blocked))
            .map(|t| InFlightRef {
                task: t.id.clone(),
                name: t.name.clone(),
                assignee: t.assignee.clone(),
                progress: t.progress,
                status: t.status,
            })
            .collect();
        in_flight.sort_by(|a, b| a.task.cmp(&b.task));
        ProjectStatus {
            total_tasks: total,
            counts_by_status: counts,
            completion_percent,
            in_flight,
            registered_agents: state.registry.len(),
        }
    }

    pub async fn board_health(&self) -> BoardHealth {
        let report = self.diagnose_with(None).await;
        let state = self.state.read().await;
        BoardHealth {
            health_score: report.health_score,
            counts_by_status: state.graph.counts_by_status(),
            issues: report.issues,
        }
    }

    pub async fn diagnose(&self) -> DiagnosticReport {
        self.diagnose_with(None).await
    }

    async fn diagnose_with(&self, reason: Option<EmptyReason>) -> DiagnosticReport {
        let state = self.state.read().await;
        diagnostics::analyze(
            &state.graph,
            &state.registry,
            &self.config,
            state.engine.suggested(),
            reason,
            Utc::now(),
        )
    }

    // ---- background workers -------------------------------------------

    /// One sweeper pass: recover orphaned IN_PROGRESS tasks whose lease
    /// lapsed. Local commit first; the board hears about it best-effort.
    pub async fn sweep_expired_leases(&self) -> Result<Vec<TaskId>> {
        let now = Utc::now();
        let (recovered, tasks) = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let recovered = progress::recover_expired(
                &mut state.graph,
                &mut state.leases,
                &mut state.registry,
                now,
            );
            let tasks: Vec<Task> =
                recovered.iter().filter_map(|id| state.graph.get(id).cloned()).collect();
            for task in &tasks {
                store::put_json(self.store.as_ref(), &keys::task(&task.id), task).await?;
                self.store.delete(&keys::lease(&task.id)).await?;
            }
            (recovered, tasks)
        };

        // Assignment records of recovered tasks are dropped by agent key.
        let records: Vec<AssignmentRecord> =
            store::scan_json(self.store.as_ref(), keys::ASSIGNMENTS).await?;
        for record in records {
            if recovered.contains(&record.task) {
                self.store.delete(&keys::assignment(&record.agent)).await?;
            }
        }

        for task in &tasks {
            let discriminant = task.worklog.len() as u64;
            let status_key = IdempotencyKey::derive("recover-status", &task.id, discriminant);
            let note_key = IdempotencyKey::derive("recover-note", &task.id, discriminant);
            let note = "Lease expired; task returned to queue";
            if let Err(err) = self
                .provider
                .set_status(&status_key, &task.id, TaskStatus::Todo)
                .await
                .and(self.provider.append_comment(&note_key, &task.id, note).await)
            {
                tracing::warn!(task_id = %task.id, error = %err, "recovery reflection failed");
            }
        }
        Ok(recovered)
    }

    /// Cross-check the board against local state, repairing divergence
    /// provider-side. Local wins, always.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let board = self.provider.list_board().await?;
        let mut report = ReconcileReport { cards_examined: board.len(), ..Default::default() };

        let local: Vec<Task> = {
            let state = self.state.read().await;
            state.graph.all_tasks().cloned().collect()
        };
        let by_id: BTreeMap<&str, &Task> = local.iter().map(|t| (t.id.as_str(), t)).collect();

        for card in &board {
            match by_id.get(card.id.as_str()) {
                Some(task) if task.status != card.status => {
                    tracing::warn!(
                        task_id = %task.id,
                        local = %task.status,
                        board = %card.status,
                        "board diverged from local state; repairing"
                    );
                    let key = IdempotencyKey::derive(
                        "reconcile",
                        &task.id,
                        task.worklog.len() as u64,
                    );
                    self.provider.set_status(&key, &task.id, task.status).await?;
                    report.statuses_repaired += 1;
                }
                Some(_) => {}
                None => {
                    tracing::warn!(card_id = %card.id, "board carries a card unknown locally");
                }
            }
        }

        let on_board: std::collections::HashSet<&str> =
            board.iter().map(|c| c.id.as_str()).collect();
        for task in &local {
            if !on_board.contains(task.id.as_str()) {
                let key = IdempotencyKey::derive("reconcile-create", &task.id, 0);
                self.provider.create_card(&key, task).await?;
                report.cards_created += 1;
            }
        }
        Ok(report)
    }
}
