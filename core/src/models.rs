use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable opaque identifier of a task.
pub type TaskId = String;

/// Stable identifier of a registered agent.
pub type AgentId = String;

/// Core task representation.
///
/// A task is the primary unit of work tracked by the coordination server.
/// Subtasks are ordinary tasks with `parent` set, a per-parent `order_index`,
/// and a free-text `provides`/`requires` interface contract. Decomposition is
/// single-level: a subtask's parent is never itself a subtask.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Stable opaque id.
    pub id: TaskId,
    /// Brief task title.
    pub name: String,
    /// Detailed task requirements.
    pub description: String,
    /// Free-form labels ("backend", "human-only", ...).
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
    /// Estimated effort in fractional hours, if known.
    pub estimated_hours: Option<f64>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Agent currently holding the task, if any.
    pub assignee: Option<AgentId>,
    /// Capabilities an agent must declare to receive this task.
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// Predecessors this task waits on, in insertion order.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Parent task when this is a subtask.
    pub parent: Option<TaskId>,
    /// Subtasks of this task, in decomposition order.
    #[serde(default)]
    pub children: Vec<TaskId>,
    /// Position among siblings when this is a subtask.
    pub order_index: Option<u32>,
    /// Interface this subtask provides downstream ("POST /login returns {token}").
    pub provides: Option<String>,
    /// Interface this subtask expects from upstream.
    pub requires: Option<String>,
    /// Shared conventions stored with a parent (base path, naming, formats).
    pub conventions: Option<String>,
    /// Last reported progress, 0..=100.
    #[serde(default)]
    pub progress: u8,
    /// Blocker currently open against this task, if any.
    pub open_blocker: Option<BlockerRecord>,
    /// Append-only worklog: progress notes, recovery notes, rollup summaries.
    #[serde(default)]
    pub worklog: Vec<WorklogEntry>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a task from creation input. Status starts at `Todo`.
    pub fn from_new(new: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            name: new.name,
            description: new.description,
            labels: new.labels,
            priority: new.priority,
            estimated_hours: new.estimated_hours,
            status: TaskStatus::Todo,
            assignee: None,
            required_capabilities: new.required_capabilities,
            dependencies: new.dependencies,
            parent: new.parent,
            children: Vec::new(),
            order_index: new.order_index,
            provides: new.provides,
            requires: new.requires,
            conventions: new.conventions,
            progress: 0,
            open_blocker: None,
            worklog: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this task is a subtask of another.
    pub fn is_subtask(&self) -> bool {
        self.parent.is_some()
    }

    /// Whether this task has been decomposed into subtasks.
    ///
    /// Container tasks are never assigned directly; they complete through
    /// parent rollup once every child is done.
    pub fn is_container(&self) -> bool {
        !self.children.is_empty()
    }

    /// Hard predecessors of this task.
    pub fn hard_dependencies(&self) -> impl Iterator<Item = &TaskId> {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Hard)
            .map(|d| &d.on)
    }

    /// Soft predecessors of this task.
    pub fn soft_dependencies(&self) -> impl Iterator<Item = &TaskId> {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Soft)
            .map(|d| &d.on)
    }

    /// Check if the task may move to the given status.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        self.status.can_transition_to(next)
    }

    /// Append a worklog entry and bump `updated_at`.
    pub fn log(&mut self, entry: WorklogEntry) {
        self.updated_at = entry.at;
        self.worklog.push(entry);
    }
}

/// Task lifecycle statuses.
///
/// ```text
/// TODO ── assign ──► IN_PROGRESS
/// IN_PROGRESS ── block ──► BLOCKED
/// IN_PROGRESS ── complete ──► DONE
/// IN_PROGRESS ── lease_expire ──► TODO
/// BLOCKED ── unblock ──► IN_PROGRESS
/// BLOCKED ── complete ──► DONE          (operator override)
/// TODO ── cancel ──► CANCELLED
/// ```
///
/// DONE and CANCELLED are terminal. Parent rollup is the one extra edge:
/// a container task whose children are all DONE moves to DONE directly via
/// [`crate::graph::TaskGraph::rollup_parent`], regardless of its own status.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Blocked,
    Done,
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transitions are permitted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }

    /// Check the state machine for a single edge.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (*self, next) {
            (current, new) if current == new => false,
            (Todo, InProgress | Cancelled) => true,
            (InProgress, Blocked | Done | Todo) => true,
            (Blocked, InProgress | Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Scheduling priority, lowest to highest.
#[derive(
    Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    /// Weight used by the fallback fit score, 0.25..=1.0.
    pub fn weight(&self) -> f64 {
        match self {
            Priority::Low => 0.25,
            Priority::Medium => 0.5,
            Priority::High => 0.75,
            Priority::Urgent => 1.0,
        }
    }
}

/// Dependency edge kinds.
///
/// Hard edges gate readiness and must stay acyclic; soft edges are
/// informational and attach to context as mockable contracts.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Hard,
    Soft,
}

/// A predecessor edge: the owning task waits on `on`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dependency {
    pub on: TaskId,
    pub kind: DependencyKind,
}

impl Dependency {
    pub fn hard(on: impl Into<TaskId>) -> Self {
        Self { on: on.into(), kind: DependencyKind::Hard }
    }

    pub fn soft(on: impl Into<TaskId>) -> Self {
        Self { on: on.into(), kind: DependencyKind::Soft }
    }
}

/// Creation input for a task, supplied by the project-creation collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub priority: Priority,
    pub estimated_hours: Option<f64>,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    pub parent: Option<TaskId>,
    pub order_index: Option<u32>,
    pub provides: Option<String>,
    pub requires: Option<String>,
    pub conventions: Option<String>,
}

impl NewTask {
    /// Minimal constructor used by tests and fixtures.
    pub fn new(id: impl Into<TaskId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            labels: BTreeSet::new(),
            priority: Priority::default(),
            estimated_hours: None,
            required_capabilities: BTreeSet::new(),
            dependencies: Vec::new(),
            parent: None,
            order_index: None,
            provides: None,
            requires: None,
            conventions: None,
        }
    }
}

/// A time-bounded claim by an agent over a task.
///
/// Exactly one active lease exists per task and per agent. Renewal extends
/// `expires_at` by the configured lease duration and increments `version`;
/// the version is monotonically increasing per task across grants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub task: TaskId,
    pub agent: AgentId,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewals: u32,
    pub version: u64,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Durable binding of (task, agent, lease), persisted before the provider is
/// told about the assignment so restarts can recover in-flight work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentRecord {
    pub task: TaskId,
    pub agent: AgentId,
    pub lease_version: u64,
    pub granted_at: DateTime<Utc>,
}

/// A recorded architectural or technical choice, visible to dependents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub id: u64,
    pub task: TaskId,
    pub agent: AgentId,
    pub at: DateTime<Utc>,
    pub text: String,
}

/// Artifact classification, driving the canonical storage directory.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Specification,
    Design,
    Api,
    Documentation,
    Architecture,
    Other,
}

impl ArtifactKind {
    /// Default directory for artifacts of this kind.
    pub fn canonical_dir(&self) -> &'static str {
        match self {
            ArtifactKind::Specification => "docs/specifications/",
            ArtifactKind::Design => "docs/design/",
            ArtifactKind::Api => "docs/api/",
            ArtifactKind::Documentation => "docs/",
            ArtifactKind::Architecture => "docs/architecture/",
            ArtifactKind::Other => "docs/",
        }
    }

    /// Resolve the storage location: an explicit override wins, otherwise
    /// the filename lands under the kind's canonical directory.
    pub fn canonical_location(&self, filename: &str, explicit: Option<&str>) -> String {
        match explicit {
            Some(loc) => loc.to_string(),
            None => format!("{}{}", self.canonical_dir(), filename),
        }
    }
}

/// A named, typed file produced by an agent. Content lives wherever
/// `location` points; the core stores metadata only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: u64,
    pub task: TaskId,
    pub agent: AgentId,
    pub filename: String,
    pub kind: ArtifactKind,
    pub location: String,
    pub at: DateTime<Utc>,
}

/// Blocker severity reported by agents.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BlockerSeverity {
    Low,
    Medium,
    High,
}

/// A blocker currently open against a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockerRecord {
    pub severity: BlockerSeverity,
    pub description: String,
    pub reported_by: AgentId,
    pub reported_at: DateTime<Utc>,
}

/// Worklog entry categories.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorklogKind {
    Progress,
    Blocker,
    Recovery,
    Surrender,
    Rollup,
    Note,
}

/// One append-only audit line on a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorklogEntry {
    pub at: DateTime<Utc>,
    pub author: Option<AgentId>,
    pub kind: WorklogKind,
    pub text: String,
}

impl WorklogEntry {
    pub fn new(
        at: DateTime<Utc>,
        author: Option<AgentId>,
        kind: WorklogKind,
        text: impl Into<String>,
    ) -> Self {
        Self { at, author, kind, text: text.into() }
    }
}

/// Client roles recognized on inbound calls.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Agent,
    Developer,
    Observer,
    Admin,
}

/// A registered agent with capabilities and a rolling performance window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    pub id: AgentId,
    pub role: Role,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Task currently held (IN_PROGRESS or BLOCKED), at most one.
    pub assignment: Option<TaskId>,
    #[serde(default)]
    pub performance: PerformanceWindow,
}

/// Rolling completion statistics, overall and per label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PerformanceWindow {
    pub assigned: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub recovered: u64,
    #[serde(default)]
    pub by_label: std::collections::BTreeMap<String, LabelStats>,
}

/// Per-label assignment outcomes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LabelStats {
    pub assigned: u64,
    pub completed: u64,
}

impl PerformanceWindow {
    /// Fraction of assignments completed successfully for tasks sharing any
    /// of the given labels. Falls back to the overall ratio when the agent
    /// has no history for these labels, and to a neutral 0.5 with no history
    /// at all.
    pub fn success_ratio(&self, labels: &BTreeSet<String>) -> f64 {
        let (mut assigned, mut completed) = (0u64, 0u64);
        for label in labels {
            if let Some(stats) = self.by_label.get(label) {
                assigned += stats.assigned;
                completed += stats.completed;
            }
        }
        if assigned == 0 {
            assigned = self.assigned;
            completed = self.completed;
        }
        if assigned == 0 {
            return 0.5;
        }
        completed as f64 / assigned as f64
    }

    pub fn record_assigned(&mut self, labels: &BTreeSet<String>) {
        self.assigned += 1;
        for label in labels {
            self.by_label.entry(label.clone()).or_default().assigned += 1;
        }
    }

    pub fn record_completed(&mut self, labels: &BTreeSet<String>) {
        self.completed += 1;
        for label in labels {
            self.by_label.entry(label.clone()).or_default().completed += 1;
        }
    }
}

/// Oracle predictions attached to an assignment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Predictions {
    /// Probability the assigned agent completes the task, 0..=1.
    pub success_probability: f64,
    /// Expected wall-clock duration in hours.
    pub expected_hours: f64,
    /// Probability the task hits a blocker before completion, 0..=1.
    pub blockage_risk: f64,
}

/// Agent-reported status accompanying a progress report.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    InProgress,
    Blocked,
    Paused,
    Completed,
}
