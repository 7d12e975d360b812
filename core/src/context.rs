use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::graph::TaskGraph;
use crate::models::{
    ArtifactKind, Decision, DependencyKind, Predictions, Task, TaskId, TaskStatus,
};

/// Everything an agent needs to execute a task without further dialogue.
///
/// Assembled at assignment time and on demand. Artifact payloads are never
/// inlined; only metadata and locations travel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskContext {
    /// The task itself, all fields.
    pub task: Task,
    /// One entry per predecessor, hard and soft.
    pub dependencies: Vec<DependencyContext>,
    /// Direct downstream consumers, so the agent knows who it is building for.
    pub dependents: Vec<DependentRef>,
    /// Present when the task is a subtask.
    pub parent: Option<ParentContext>,
    /// Oracle (or fallback) predictions, attached at assignment.
    pub predictions: Option<Predictions>,
}

/// A predecessor with the artifacts and decisions logged against it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DependencyContext {
    pub task: TaskId,
    pub name: String,
    pub status: TaskStatus,
    /// Interface contract when the predecessor is a subtask.
    pub provides: Option<String>,
    /// True for soft edges: the contract may be mocked while the
    /// predecessor is unfinished.
    pub mockable: bool,
    pub artifacts: Vec<ArtifactRef>,
    pub decisions: Vec<Decision>,
}

/// Artifact metadata only; content lives at `location`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRef {
    pub filename: String,
    pub kind: ArtifactKind,
    pub location: String,
    pub at: DateTime<Utc>,
}

/// A direct dependent of the task being handed out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DependentRef {
    pub task: TaskId,
    pub name: String,
    pub kind: DependencyKind,
    /// What the dependent expects, when declared.
    pub requires: Option<String>,
}

/// Parent view for subtasks: the shared frame the siblings work within.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParentContext {
    pub task: TaskId,
    pub name: String,
    pub description: String,
    pub conventions: Option<String>,
    pub siblings: Vec<SiblingRef>,
}

/// A sibling subtask and what it provides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiblingRef {
    pub task: TaskId,
    pub name: String,
    pub order_index: Option<u32>,
    pub provides: Option<String>,
    pub status: TaskStatus,
}

/// Assemble the self-contained context for a task.
///
/// Predictions are attached by the caller when an oracle round has run;
/// the structure is complete without them.
pub fn assemble(graph: &TaskGraph, task_id: &str) -> Result<TaskContext> {
    let task = graph.task(task_id)?.clone();

    let mut dependencies = Vec::with_capacity(task.dependencies.len());
    for dep in &task.dependencies {
        // Dangling edges are a diagnostics concern; context skips them.
        let Some(predecessor) = graph.get(&dep.on) else { continue };
        dependencies.push(DependencyContext {
            task: predecessor.id.clone(),
            name: predecessor.name.clone(),
            status: predecessor.status,
            provides: predecessor.provides.clone(),
            mockable: dep.kind == DependencyKind::Soft,
            artifacts: graph
                .artifacts_for(&dep.on)
                .iter()
                .map(|a| ArtifactRef {
                    filename: a.filename.clone(),
                    kind: a.kind,
                    location: a.location.clone(),
                    at: a.at,
                })
                .collect(),
            decisions: graph.decisions_for(&dep.on).to_vec(),
        });
    }

    let mut dependents: Vec<DependentRef> = graph
        .dependents_of(task_id)
        .into_iter()
        .filter_map(|d| {
            d.dependencies
                .iter()
                .find(|edge| edge.on == task_id)
                .map(|edge| DependentRef {
                    task: d.id.clone(),
                    name: d.name.clone(),
                    kind: edge.kind,
                    requires: d.requires.clone(),
                })
        })
        .collect();
    dependents.sort_by(|a, b| a.task.cmp(&b.task));

    let parent = match &task.parent {
        Some(parent_id) => {
            let parent_task = graph.task(parent_id)?;
            let siblings = graph
                .children_of(parent_id)
                .into_iter()
                .filter(|s| s.id != task.id)
                .map(|s| SiblingRef {
                    task: s.id.clone(),
                    name: s.name.clone(),
                    order_index: s.order_index,
                    provides: s.provides.clone(),
                    status: s.status,
                })
                .collect();
            Some(ParentContext {
                task: parent_task.id.clone(),
                name: parent_task.name.clone(),
                description: parent_task.description.clone(),
                conventions: parent_task.conventions.clone(),
                siblings,
            })
        }
        None => None,
    };

    Ok(TaskContext { task, dependencies, dependents, parent, predictions: None })
}
