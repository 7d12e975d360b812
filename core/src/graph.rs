use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::dependency;
use crate::error::{CoreError, Result};
use crate::models::{
    AgentId, Artifact, ArtifactKind, BlockerRecord, Decision, DependencyKind, NewTask, Task,
    TaskId, TaskStatus, WorklogEntry, WorklogKind,
};

/// In-memory model of all tasks, with secondary indexes by status and label.
///
/// The graph owns every task while it is alive. All mutations run under the
/// core's serialization point; the graph itself only enforces local
/// invariants (existing references, acyclic hard edges, guarded status
/// transitions, single-level decomposition).
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: HashMap<TaskId, Task>,
    by_status: HashMap<TaskStatus, BTreeSet<TaskId>>,
    by_label: HashMap<String, BTreeSet<TaskId>>,
    /// Reverse dependency index: task -> tasks that wait on it.
    dependents: HashMap<TaskId, BTreeSet<TaskId>>,
    decisions: HashMap<TaskId, Vec<Decision>>,
    artifacts: HashMap<TaskId, Vec<Artifact>>,
    next_decision_id: u64,
    next_artifact_id: u64,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Insert a task created by the project-creation collaborator.
    ///
    /// Dependencies must reference existing tasks; a parent must exist and
    /// must not itself be a subtask. A fresh task has no dependents, so no
    /// cycle can form here.
    pub fn insert(&mut self, new: NewTask, now: DateTime<Utc>) -> Result<&Task> {
        if new.id.trim().is_empty() {
            return Err(CoreError::Validation("task id cannot be empty".into()));
        }
        if self.tasks.contains_key(&new.id) {
            return Err(CoreError::Validation(format!("task id already exists: {}", new.id)));
        }
        for dep in &new.dependencies {
            if !self.tasks.contains_key(&dep.on) {
                return Err(CoreError::unknown_task(&dep.on));
            }
        }
        if let Some(parent_id) = &new.parent {
            let parent = self
                .tasks
                .get(parent_id)
                .ok_or_else(|| CoreError::unknown_task(parent_id))?;
            if parent.is_subtask() {
                return Err(CoreError::Validation(format!(
                    "parent {parent_id} is itself a subtask; decomposition is single-level"
                )));
            }
        }

        let task = Task::from_new(new, now);
        let id = task.id.clone();
        let parent_id = task.parent.clone();
        for dep in &task.dependencies {
            self.dependents.entry(dep.on.clone()).or_default().insert(id.clone());
        }
        for label in &task.labels {
            self.by_label.entry(label.clone()).or_default().insert(id.clone());
        }
        self.by_status.entry(task.status).or_default().insert(id.clone());
        self.tasks.insert(id.clone(), task);

        // Keep siblings in decomposition order when order indexes are given.
        if let Some(parent_id) = parent_id {
            let mut children = match self.tasks.get(&parent_id) {
                Some(parent) => parent.children.clone(),
                None => Vec::new(),
            };
            children.push(id.clone());
            let orders: HashMap<TaskId, u32> = children
                .iter()
                .filter_map(|c| {
                    self.tasks.get(c).and_then(|t| t.order_index.map(|o| (c.clone(), o)))
                })
                .collect();
            if !orders.is_empty() {
                children.sort_by_key(|c| orders.get(c).copied().unwrap_or(u32::MAX));
            }
            if let Some(parent) = self.tasks.get_mut(&parent_id) {
                parent.children = children;
            }
        }
        self.task(&id)
    }

    /// Remove a task entirely. Edges pointing at it from other tasks are left
    /// in place and surface as dangling dependencies in diagnostics.
    pub fn remove(&mut self, id: &str) -> Result<Task> {
        let task = self.tasks.remove(id).ok_or_else(|| CoreError::unknown_task(id))?;
        self.by_status.entry(task.status).or_default().remove(id);
        for label in &task.labels {
            if let Some(set) = self.by_label.get_mut(label) {
                set.remove(id);
            }
        }
        for dep in &task.dependencies {
            if let Some(set) = self.dependents.get_mut(&dep.on) {
                set.remove(id);
            }
        }
        self.dependents.remove(id);
        if let Some(parent_id) = &task.parent {
            if let Some(parent) = self.tasks.get_mut(parent_id) {
                parent.children.retain(|c| c != id);
            }
        }
        self.decisions.remove(id);
        self.artifacts.remove(id);
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Fetch a task or fail with `UnknownTask`.
    pub fn task(&self, id: &str) -> Result<&Task> {
        self.tasks.get(id).ok_or_else(|| CoreError::unknown_task(id))
    }

    pub(crate) fn task_mut(&mut self, id: &str) -> Result<&mut Task> {
        self.tasks.get_mut(id).ok_or_else(|| CoreError::unknown_task(id))
    }

    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.by_status
            .get(&status)
            .map(|ids| ids.iter().filter_map(|id| self.tasks.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn tasks_with_label(&self, label: &str) -> Vec<&Task> {
        self.by_label
            .get(label)
            .map(|ids| ids.iter().filter_map(|id| self.tasks.get(id)).collect())
            .unwrap_or_default()
    }

    /// Apply a guarded status transition.
    pub fn transition(&mut self, id: &str, to: TaskStatus, now: DateTime<Utc>) -> Result<()> {
        let task = self.tasks.get_mut(id).ok_or_else(|| CoreError::unknown_task(id))?;
        let from = task.status;
        if !from.can_transition_to(to) {
            return Err(CoreError::invalid_transition(id, from, to));
        }
        task.status = to;
        task.updated_at = now;
        self.by_status.entry(from).or_default().remove(id);
        self.by_status.entry(to).or_default().insert(id.to_string());
        tracing::debug!(task_id = %id, %from, %to, "task transitioned");
        Ok(())
    }

    /// Parent rollup: once every child is DONE the container itself moves to
    /// DONE, whatever its own status, and a summary line is appended.
    /// Returns false when children are still outstanding.
    pub fn rollup_parent(&mut self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let task = self.task(id)?;
        if !task.is_container() {
            return Err(CoreError::Validation(format!("task {id} has no children to roll up")));
        }
        if task.status.is_terminal() {
            return Ok(false);
        }
        let children = task.children.clone();
        let all_done = children
            .iter()
            .all(|c| self.tasks.get(c).map(|t| t.status == TaskStatus::Done).unwrap_or(false));
        if !all_done {
            return Ok(false);
        }
        let from = task.status;
        let names: Vec<String> = children
            .iter()
            .filter_map(|c| self.tasks.get(c).map(|t| t.name.clone()))
            .collect();
        let task = self.task_mut(id)?;
        task.status = TaskStatus::Done;
        task.progress = 100;
        task.log(WorklogEntry::new(
            now,
            None,
            WorklogKind::Rollup,
            format!("All {} subtasks complete: {}", names.len(), names.join(", ")),
        ));
        self.by_status.entry(from).or_default().remove(id);
        self.by_status.entry(TaskStatus::Done).or_default().insert(id.to_string());
        tracing::info!(task_id = %id, children = names.len(), "parent rolled up to done");
        Ok(true)
    }

    pub fn set_assignee(
        &mut self,
        id: &str,
        assignee: Option<AgentId>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let task = self.task_mut(id)?;
        task.assignee = assignee;
        task.updated_at = now;
        Ok(())
    }

    pub fn set_progress(&mut self, id: &str, progress: u8, now: DateTime<Utc>) -> Result<()> {
        let task = self.task_mut(id)?;
        task.progress = progress.min(100);
        task.updated_at = now;
        Ok(())
    }

    pub fn set_blocker(
        &mut self,
        id: &str,
        blocker: Option<BlockerRecord>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let task = self.task_mut(id)?;
        task.open_blocker = blocker;
        task.updated_at = now;
        Ok(())
    }

    pub fn append_worklog(&mut self, id: &str, entry: WorklogEntry) -> Result<()> {
        self.task_mut(id)?.log(entry);
        Ok(())
    }

    /// Add a dependency edge. Hard edges are refused when they would close a
    /// cycle over the hard subgraph; soft edges may form cycles.
    pub fn add_dependency(
        &mut self,
        from: &str,
        on: &str,
        kind: DependencyKind,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.tasks.contains_key(from) {
            return Err(CoreError::unknown_task(from));
        }
        if !self.tasks.contains_key(on) {
            return Err(CoreError::unknown_task(on));
        }
        if from == on {
            return Err(CoreError::CycleWouldForm { from: from.into(), to: on.into() });
        }
        let task = self.task(from)?;
        if task.dependencies.iter().any(|d| d.on == on) {
            return Err(CoreError::Validation(format!(
                "task {from} already depends on {on}"
            )));
        }
        if kind == DependencyKind::Hard && dependency::would_form_hard_cycle(self, from, on) {
            return Err(CoreError::CycleWouldForm { from: from.into(), to: on.into() });
        }
        let task = self.task_mut(from)?;
        task.dependencies.push(crate::models::Dependency { on: on.to_string(), kind });
        task.updated_at = now;
        self.dependents.entry(on.to_string()).or_default().insert(from.to_string());
        Ok(())
    }

    /// Tasks ready for assignment: TODO, not a container, every hard
    /// predecessor DONE. Blocker and label filtering is the assigner's job.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.tasks_with_status(TaskStatus::Todo)
            .into_iter()
            .filter(|t| !t.is_container())
            .filter(|t| self.hard_predecessors_done(t))
            .collect()
    }

    pub(crate) fn hard_predecessors_done(&self, task: &Task) -> bool {
        task.hard_dependencies().all(|dep| {
            self.tasks.get(dep).map(|t| t.status == TaskStatus::Done).unwrap_or(false)
        })
    }

    /// Tasks that wait on the given task, directly.
    pub fn dependents_of(&self, id: &str) -> Vec<&Task> {
        self.dependents
            .get(id)
            .map(|ids| ids.iter().filter_map(|d| self.tasks.get(d)).collect())
            .unwrap_or_default()
    }

    /// Subtasks of the given task, in decomposition order.
    pub fn children_of(&self, id: &str) -> Vec<&Task> {
        self.tasks
            .get(id)
            .map(|t| t.children.iter().filter_map(|c| self.tasks.get(c)).collect())
            .unwrap_or_default()
    }

    /// Record a decision against a task. Append-only.
    pub fn log_decision(
        &mut self,
        task: &str,
        agent: &str,
        text: String,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        if !self.tasks.contains_key(task) {
            return Err(CoreError::unknown_task(task));
        }
        self.next_decision_id += 1;
        let decision = Decision {
            id: self.next_decision_id,
            task: task.to_string(),
            agent: agent.to_string(),
            at: now,
            text,
        };
        self.decisions.entry(task.to_string()).or_default().push(decision.clone());
        Ok(decision)
    }

    /// Record an artifact. Two logs of the same (task, filename, kind) yield
    /// two records unless the caller supplies the same explicit location, in
    /// which case the second overwrites the first record's metadata.
    pub fn log_artifact(
        &mut self,
        task: &str,
        agent: &str,
        filename: String,
        kind: ArtifactKind,
        explicit_location: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Artifact> {
        if !self.tasks.contains_key(task) {
            return Err(CoreError::unknown_task(task));
        }
        let location = kind.canonical_location(&filename, explicit_location.as_deref());
        let entries = self.artifacts.entry(task.to_string()).or_default();
        if explicit_location.is_some() {
            if let Some(existing) = entries
                .iter_mut()
                .find(|a| a.filename == filename && a.kind == kind && a.location == location)
            {
                existing.agent = agent.to_string();
                existing.at = now;
                return Ok(existing.clone());
            }
        }
        self.next_artifact_id += 1;
        let artifact = Artifact {
            id: self.next_artifact_id,
            task: task.to_string(),
            agent: agent.to_string(),
            filename,
            kind,
            location,
            at: now,
        };
        entries.push(artifact.clone());
        Ok(artifact)
    }

    pub fn decisions_for(&self, task: &str) -> &[Decision] {
        self.decisions.get(task).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn artifacts_for(&self, task: &str) -> &[Artifact] {
        self.artifacts.get(task).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Live task counts per status.
    pub fn counts_by_status(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for status in [
            TaskStatus::Todo,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Done,
            TaskStatus::Cancelled,
        ] {
            let n = self.by_status.get(&status).map(BTreeSet::len).unwrap_or(0);
            counts.insert(status.to_string(), n);
        }
        counts
    }

    /// Restore a task loaded from the durable store, rebuilding indexes.
    /// Skips invariant checks; the record was validated when first created.
    pub(crate) fn restore(&mut self, task: Task) {
        let id = task.id.clone();
        self.by_status.entry(task.status).or_default().insert(id.clone());
        for label in &task.labels {
            self.by_label.entry(label.clone()).or_default().insert(id.clone());
        }
        for dep in &task.dependencies {
            self.dependents.entry(dep.on.clone()).or_default().insert(id.clone());
        }
        self.tasks.insert(id, task);
    }

    pub(crate) fn restore_decision(&mut self, decision: Decision) {
        self.next_decision_id = self.next_decision_id.max(decision.id);
        self.decisions.entry(decision.task.clone()).or_default().push(decision);
    }

    pub(crate) fn restore_artifact(&mut self, artifact: Artifact) {
        self.next_artifact_id = self.next_artifact_id.max(artifact.id);
        self.artifacts.entry(artifact.task.clone()).or_default().push(artifact);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Dependency;

    fn graph_with(ids: &[&str]) -> TaskGraph {
        let mut graph = TaskGraph::new();
        let now = Utc::now();
        for id in ids {
            graph.insert(NewTask::new(*id, format!("Task {id}")), now).unwrap();
        }
        graph
    }

    #[test]
    fn insert_rejects_duplicate_ids_and_unknown_references() {
        let mut graph = graph_with(&["a"]);
        let now = Utc::now();
        assert!(matches!(
            graph.insert(NewTask::new("a", "dup"), now),
            Err(CoreError::Validation(_))
        ));

        let mut new = NewTask::new("b", "depends on ghost");
        new.dependencies = vec![Dependency::hard("ghost")];
        assert!(matches!(graph.insert(new, now), Err(CoreError::UnknownTask(_))));

        let mut new = NewTask::new("c", "child of ghost");
        new.parent = Some("ghost".into());
        assert!(matches!(graph.insert(new, now), Err(CoreError::UnknownTask(_))));
    }

    #[test]
    fn decomposition_is_single_level() {
        let mut graph = graph_with(&["p"]);
        let now = Utc::now();
        let mut child = NewTask::new("p1", "child");
        child.parent = Some("p".into());
        graph.insert(child, now).unwrap();

        let mut grandchild = NewTask::new("p1a", "grandchild");
        grandchild.parent = Some("p1".into());
        assert!(matches!(graph.insert(grandchild, now), Err(CoreError::Validation(_))));
    }

    #[test]
    fn children_keep_order_index_order() {
        let mut graph = graph_with(&["p"]);
        let now = Utc::now();
        for (id, order) in [("p2", 2), ("p1", 1), ("p3", 3)] {
            let mut child = NewTask::new(id, id);
            child.parent = Some("p".into());
            child.order_index = Some(order);
            graph.insert(child, now).unwrap();
        }
        let ids: Vec<_> = graph.children_of("p").iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn transition_guards_the_state_machine() {
        let mut graph = graph_with(&["a"]);
        let now = Utc::now();
        assert!(matches!(
            graph.transition("a", TaskStatus::Done, now),
            Err(CoreError::InvalidTransition { .. })
        ));
        graph.transition("a", TaskStatus::InProgress, now).unwrap();
        graph.transition("a", TaskStatus::Done, now).unwrap();
        assert!(graph.transition("a", TaskStatus::Todo, now).is_err());
        assert_eq!(graph.tasks_with_status(TaskStatus::Done).len(), 1);
    }

    #[test]
    fn ready_excludes_gated_tasks_and_containers() {
        let mut graph = graph_with(&["a"]);
        let now = Utc::now();
        let mut b = NewTask::new("b", "waits on a");
        b.dependencies = vec![Dependency::hard("a")];
        graph.insert(b, now).unwrap();
        let mut c = NewTask::new("c", "soft on a");
        c.dependencies = vec![Dependency::soft("a")];
        graph.insert(c, now).unwrap();
        let mut child = NewTask::new("p1", "child");
        // "a" becomes a container once it has a child; containers are not ready.
        child.parent = Some("a".into());
        graph.insert(child, now).unwrap();

        let ready: BTreeSet<_> = graph.ready_tasks().iter().map(|t| t.id.clone()).collect();
        // a is a container; b waits on a (not done); c's soft edge does not gate.
        assert_eq!(ready, BTreeSet::from(["c".to_string(), "p1".to_string()]));
    }

    #[test]
    fn hard_cycle_is_refused_soft_cycle_is_not() {
        let mut graph = graph_with(&["a", "b", "c"]);
        let now = Utc::now();
        graph.add_dependency("b", "a", DependencyKind::Hard, now).unwrap();
        graph.add_dependency("c", "b", DependencyKind::Hard, now).unwrap();
        let err = graph.add_dependency("a", "c", DependencyKind::Hard, now).unwrap_err();
        assert!(matches!(err, CoreError::CycleWouldForm { .. }));
        // Graph unchanged by the refused edge.
        assert!(graph.task("a").unwrap().dependencies.is_empty());
        // The same edge as soft is informational and allowed.
        graph.add_dependency("a", "c", DependencyKind::Soft, now).unwrap();
    }

    #[test]
    fn rollup_waits_for_all_children() {
        let mut graph = graph_with(&["p"]);
        let now = Utc::now();
        for id in ["p1", "p2"] {
            let mut child = NewTask::new(id, id);
            child.parent = Some("p".into());
            graph.insert(child, now).unwrap();
        }
        graph.transition("p1", TaskStatus::InProgress, now).unwrap();
        graph.transition("p1", TaskStatus::Done, now).unwrap();
        assert!(!graph.rollup_parent("p", now).unwrap());

        graph.transition("p2", TaskStatus::InProgress, now).unwrap();
        graph.transition("p2", TaskStatus::Done, now).unwrap();
        assert!(graph.rollup_parent("p", now).unwrap());
        let parent = graph.task("p").unwrap();
        assert_eq!(parent.status, TaskStatus::Done);
        assert!(parent.worklog.iter().any(|e| e.kind == WorklogKind::Rollup));
        // Idempotent once terminal.
        assert!(!graph.rollup_parent("p", now).unwrap());
    }

    #[test]
    fn artifact_dedup_only_on_same_explicit_location() {
        let mut graph = graph_with(&["a"]);
        let now = Utc::now();
        graph
            .log_artifact("a", "x", "api.yaml".into(), ArtifactKind::Api, None, now)
            .unwrap();
        graph
            .log_artifact("a", "x", "api.yaml".into(), ArtifactKind::Api, None, now)
            .unwrap();
        assert_eq!(graph.artifacts_for("a").len(), 2);

        graph
            .log_artifact("a", "x", "api.yaml".into(), ArtifactKind::Api, Some("v2/api.yaml".into()), now)
            .unwrap();
        graph
            .log_artifact("a", "y", "api.yaml".into(), ArtifactKind::Api, Some("v2/api.yaml".into()), now)
            .unwrap();
        let with_explicit: Vec<_> = graph
            .artifacts_for("a")
            .iter()
            .filter(|a| a.location == "v2/api.yaml")
            .collect();
        assert_eq!(with_explicit.len(), 1);
        assert_eq!(with_explicit[0].agent, "y");
    }

    #[test]
    fn remove_leaves_dangling_edges_for_diagnostics() {
        let mut graph = graph_with(&["a", "b"]);
        let now = Utc::now();
        graph.add_dependency("b", "a", DependencyKind::Hard, now).unwrap();
        graph.remove("a").unwrap();
        assert!(graph.get("a").is_none());
        let b = graph.task("b").unwrap();
        assert_eq!(b.dependencies.len(), 1);
        assert!(graph.ready_tasks().is_empty());
    }
}
