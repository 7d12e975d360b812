use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::TaskGraph;
use crate::models::{DependencyKind, Task, TaskId};

/// Check whether adding the hard edge `from -> on` would close a cycle over
/// the hard subgraph: true iff `from` is already reachable from `on` by
/// following hard dependency edges.
pub fn would_form_hard_cycle(graph: &TaskGraph, from: &str, on: &str) -> bool {
    if from == on {
        return true;
    }
    let mut stack = vec![on.to_string()];
    let mut seen: HashSet<TaskId> = HashSet::new();
    while let Some(current) = stack.pop() {
        if current == from {
            return true;
        }
        if !seen.insert(current.clone()) {
            continue;
        }
        if let Some(task) = graph.get(&current) {
            for dep in task.hard_dependencies() {
                stack.push(dep.clone());
            }
        }
    }
    false
}

/// Find cycles in the existing hard subgraph. The guarded mutation API keeps
/// this empty; diagnostics still scans so that restored or hand-edited state
/// is reported instead of silently wedging assignment.
///
/// DFS 3-color; returns one witness path per cycle found.
pub fn find_hard_cycles(graph: &TaskGraph) -> Vec<Vec<TaskId>> {
    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;

    let mut color: HashMap<TaskId, u8> = HashMap::new();
    let mut cycles = Vec::new();

    fn visit(
        graph: &TaskGraph,
        id: &TaskId,
        color: &mut HashMap<TaskId, u8>,
        path: &mut Vec<TaskId>,
        cycles: &mut Vec<Vec<TaskId>>,
    ) {
        color.insert(id.clone(), GRAY);
        path.push(id.clone());
        if let Some(task) = graph.get(id) {
            for dep in task.hard_dependencies() {
                if graph.get(dep).is_none() {
                    continue;
                }
                match color.get(dep).copied().unwrap_or(WHITE) {
                    GRAY => {
                        // Back edge: the cycle is the path suffix from `dep`.
                        if let Some(start) = path.iter().position(|p| p == dep) {
                            cycles.push(path[start..].to_vec());
                        }
                    }
                    WHITE => visit(graph, dep, color, path, cycles),
                    _ => {}
                }
            }
        }
        path.pop();
        color.insert(id.clone(), BLACK);
    }

    let ids: Vec<TaskId> = graph.all_tasks().map(|t| t.id.clone()).collect();
    for id in ids {
        if color.get(&id).copied().unwrap_or(WHITE) == WHITE {
            let mut path = Vec::new();
            visit(graph, &id, &mut color, &mut path, &mut cycles);
        }
    }
    cycles
}

/// Deterministic ordering for ready candidates: priority descending, then
/// estimated effort ascending (unknown effort last), then creation time, then
/// id. Stable across calls by construction.
pub fn candidate_order(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| {
            let ea = a.estimated_hours.unwrap_or(f64::INFINITY);
            let eb = b.estimated_hours.unwrap_or(f64::INFINITY);
            ea.total_cmp(&eb)
        })
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Tasks directly or transitively upstream of `id` (what it waits on),
/// following every edge kind.
pub fn upstream_of(graph: &TaskGraph, id: &str) -> Vec<TaskId> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![id.to_string()];
    while let Some(current) = stack.pop() {
        if let Some(task) = graph.get(&current) {
            for dep in &task.dependencies {
                if seen.insert(dep.on.clone()) {
                    out.push(dep.on.clone());
                    stack.push(dep.on.clone());
                }
            }
        }
    }
    out.sort();
    out
}

/// Tasks directly or transitively downstream of `id` (what waits on it).
pub fn downstream_of(graph: &TaskGraph, id: &str) -> Vec<TaskId> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![id.to_string()];
    while let Some(current) = stack.pop() {
        for dependent in graph.dependents_of(&current) {
            if seen.insert(dependent.id.clone()) {
                out.push(dependent.id.clone());
                stack.push(dependent.id.clone());
            }
        }
    }
    out.sort();
    out
}

/// Length (in edges) of the longest hard chain ending at `id`. Memoized
/// walk; hard cycles would already have been refused, dangling edges count
/// for nothing.
pub fn hard_depth(graph: &TaskGraph, id: &str, memo: &mut HashMap<TaskId, usize>) -> usize {
    if let Some(depth) = memo.get(id) {
        return *depth;
    }
    // Mark before recursing so a rogue cycle terminates instead of spinning.
    memo.insert(id.to_string(), 0);
    let depth = graph
        .get(id)
        .map(|task| {
            task.hard_dependencies()
                .filter(|dep| graph.get(dep).is_some())
                .map(|dep| hard_depth(graph, dep, memo) + 1)
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    memo.insert(id.to_string(), depth);
    depth
}

/// The longest hard-dependency path running through `id`: the deepest chain
/// of predecessors, `id` itself, then the deepest chain of dependents.
pub fn critical_path_through(graph: &TaskGraph, id: &str) -> Vec<TaskId> {
    fn deepest_upstream(graph: &TaskGraph, id: &str, seen: &mut HashSet<TaskId>) -> Vec<TaskId> {
        if !seen.insert(id.to_string()) {
            return Vec::new();
        }
        let best = graph
            .get(id)
            .into_iter()
            .flat_map(|t| t.hard_dependencies())
            .filter(|dep| graph.get(dep).is_some())
            .map(|dep| deepest_upstream(graph, dep, &mut seen.clone()))
            .max_by_key(Vec::len)
            .unwrap_or_default();
        let mut path = best;
        path.push(id.to_string());
        path
    }

    fn deepest_downstream(graph: &TaskGraph, id: &str, seen: &mut HashSet<TaskId>) -> Vec<TaskId> {
        if !seen.insert(id.to_string()) {
            return Vec::new();
        }
        let best = graph
            .dependents_of(id)
            .into_iter()
            .filter(|t| t.dependencies.iter().any(|d| d.on == id && d.kind == DependencyKind::Hard))
            .map(|t| deepest_downstream(graph, &t.id, &mut seen.clone()))
            .max_by_key(Vec::len)
            .unwrap_or_default();
        let mut path = vec![id.to_string()];
        path.extend(best);
        path
    }

    let mut up = deepest_upstream(graph, id, &mut HashSet::new());
    let down = deepest_downstream(graph, id, &mut HashSet::new());
    up.pop(); // id is the head of the downstream half
    up.extend(down);
    up
}

/// A candidate edge proposed by the external inferer (pattern rules or AI).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferredEdge {
    /// Task that would wait.
    pub from: TaskId,
    /// Task it would wait on.
    pub on: TaskId,
    pub kind: DependencyKind,
    /// Inferer confidence, 0..=1.
    pub confidence: f64,
    /// Short rationale, carried into diagnostics.
    pub reason: String,
}

/// Why a proposed edge was recorded as suggested instead of applied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionReason {
    BelowThreshold,
    WouldFormCycle,
    UnknownTask,
    Duplicate,
}

/// An edge held back from the graph, kept for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuggestedEdge {
    pub edge: InferredEdge,
    pub reason: SuggestionReason,
    pub at: DateTime<Utc>,
}

/// Outcome of one inference round.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferenceOutcome {
    pub applied: Vec<InferredEdge>,
    pub suggested: Vec<SuggestedEdge>,
}

/// Dependency engine: static validation plus the inference acceptance gate.
///
/// Proposed edges are applied only when they pass static validation and meet
/// the confidence threshold; everything else is recorded as suggested and
/// surfaces through diagnostics, never through assignment.
#[derive(Debug)]
pub struct DependencyEngine {
    confidence_threshold: f64,
    suggested: Vec<SuggestedEdge>,
}

impl DependencyEngine {
    pub fn new(confidence_threshold: f64) -> Self {
        Self { confidence_threshold, suggested: Vec::new() }
    }

    /// Edges recorded as suggested-only so far.
    pub fn suggested(&self) -> &[SuggestedEdge] {
        &self.suggested
    }

    /// Run one batch of proposed edges against the graph.
    pub fn apply_inferred(
        &mut self,
        graph: &mut TaskGraph,
        proposals: Vec<InferredEdge>,
        now: DateTime<Utc>,
    ) -> InferenceOutcome {
        let mut outcome = InferenceOutcome::default();
        for edge in proposals {
            let reason = if graph.get(&edge.from).is_none() || graph.get(&edge.on).is_none() {
                Some(SuggestionReason::UnknownTask)
            } else if graph
                .get(&edge.from)
                .map(|t| t.dependencies.iter().any(|d| d.on == edge.on))
                .unwrap_or(false)
            {
                Some(SuggestionReason::Duplicate)
            } else if edge.confidence < self.confidence_threshold {
                Some(SuggestionReason::BelowThreshold)
            } else if edge.kind == DependencyKind::Hard
                && would_form_hard_cycle(graph, &edge.from, &edge.on)
            {
                Some(SuggestionReason::WouldFormCycle)
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    tracing::debug!(
                        from = %edge.from,
                        on = %edge.on,
                        confidence = edge.confidence,
                        ?reason,
                        "inferred edge recorded as suggestion"
                    );
                    let suggested = SuggestedEdge { edge, reason, at: now };
                    self.suggested.push(suggested.clone());
                    outcome.suggested.push(suggested);
                }
                None => match graph.add_dependency(&edge.from, &edge.on, edge.kind, now) {
                    Ok(()) => outcome.applied.push(edge),
                    Err(_) => {
                        let suggested = SuggestedEdge {
                            edge,
                            reason: SuggestionReason::WouldFormCycle,
                            at: now,
                        };
                        self.suggested.push(suggested.clone());
                        outcome.suggested.push(suggested);
                    }
                },
            }
        }
        outcome
    }
}
