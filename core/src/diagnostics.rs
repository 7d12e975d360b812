use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CoreConfig;
use crate::dependency::{self, SuggestedEdge};
use crate::graph::TaskGraph;
use crate::registry::AgentRegistry;
use crate::models::{TaskId, TaskStatus};

/// Issue severities, highest first.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Info,
}

/// Structural problems the analyzer looks for.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    HardCycle,
    DanglingDependency,
    Bottleneck,
    LongChain,
    AllBlocked,
    NoFit,
}

/// One finding: what, how bad, which tasks, and what an operator should do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub tasks: Vec<TaskId>,
    pub recommendation: String,
}

/// Why an assignment attempt came back empty.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmptyReason {
    NoReadyTasks,
    NoCapabilityFit,
    ConcurrentLostRace,
}

/// Structured explanation of board state, produced on every empty assignment
/// and on demand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticReport {
    pub generated_at: DateTime<Utc>,
    /// Set when the report accompanies an empty assignment.
    pub reason: Option<EmptyReason>,
    pub issues: Vec<Issue>,
    /// Inferred edges held back from the graph.
    pub suggested_edges: Vec<SuggestedEdge>,
    /// 0 (wedged) ..= 100 (healthy), severity-weighted.
    pub health_score: u8,
}

impl DiagnosticReport {
    pub fn issues_of(&self, kind: IssueKind) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(move |i| i.kind == kind)
    }
}

/// Run every analysis pass over the current board.
pub fn analyze(
    graph: &TaskGraph,
    registry: &AgentRegistry,
    config: &CoreConfig,
    suggested_edges: &[SuggestedEdge],
    reason: Option<EmptyReason>,
    now: DateTime<Utc>,
) -> DiagnosticReport {
    let mut issues = Vec::new();

    for cycle in dependency::find_hard_cycles(graph) {
        issues.push(Issue {
            kind: IssueKind::HardCycle,
            severity: Severity::Critical,
            recommendation: format!(
                "Remove one hard edge among {} to restore an executable order",
                cycle.join(" -> ")
            ),
            tasks: cycle,
        });
    }

    let mut dangling: Vec<(TaskId, TaskId)> = Vec::new();
    for task in graph.all_tasks() {
        for dep in &task.dependencies {
            if graph.get(&dep.on).is_none() {
                dangling.push((task.id.clone(), dep.on.clone()));
            }
        }
    }
    if !dangling.is_empty() {
        dangling.sort();
        let pairs: Vec<String> =
            dangling.iter().map(|(from, on)| format!("{from} -> {on}")).collect();
        issues.push(Issue {
            kind: IssueKind::DanglingDependency,
            severity: Severity::High,
            tasks: dangling.into_iter().map(|(from, _)| from).collect(),
            recommendation: format!(
                "Delete or repoint edges referencing removed tasks: {}",
                pairs.join(", ")
            ),
        });
    }

    // Bottlenecks: an unfinished task that is the sole unfinished hard
    // predecessor of many TODO tasks.
    let mut gate_counts: HashMap<TaskId, usize> = HashMap::new();
    for task in graph.tasks_with_status(TaskStatus::Todo) {
        let unfinished: Vec<&TaskId> = task
            .hard_dependencies()
            .filter(|dep| {
                graph.get(dep).map(|t| t.status != TaskStatus::Done).unwrap_or(false)
            })
            .collect();
        if let [sole] = unfinished.as_slice() {
            *gate_counts.entry((*sole).clone()).or_default() += 1;
        }
    }
    let mut bottlenecks: Vec<(TaskId, usize)> = gate_counts
        .into_iter()
        .filter(|(_, n)| *n >= config.bottleneck_threshold)
        .collect();
    bottlenecks.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    for (id, gated) in bottlenecks {
        let name = graph.get(&id).map(|t| t.name.clone()).unwrap_or_else(|| id.clone());
        issues.push(Issue {
            kind: IssueKind::Bottleneck,
            severity: Severity::Medium,
            tasks: vec![id],
            recommendation: format!("Prioritize completing '{name}' to unblock {gated} tasks"),
        });
    }

    // Long chains, reported once for the deepest offender of each tail task.
    let mut memo = HashMap::new();
    let mut long_chains: Vec<(TaskId, usize)> = graph
        .all_tasks()
        .map(|t| (t.id.clone(), dependency::hard_depth(graph, &t.id, &mut memo)))
        .filter(|(_, depth)| *depth > config.long_chain_depth)
        .collect();
    long_chains.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    for (id, depth) in long_chains {
        issues.push(Issue {
            kind: IssueKind::LongChain,
            severity: Severity::Info,
            tasks: vec![id.clone()],
            recommendation: format!(
                "Hard-dependency chain of depth {depth} ends at '{id}'; consider splitting \
                 independent strands to raise parallelism"
            ),
        });
    }

    // All-blocked: not an error, just an explanation of why nothing is ready.
    let todo = graph.tasks_with_status(TaskStatus::Todo);
    let in_progress = graph.tasks_with_status(TaskStatus::InProgress);
    if !todo.is_empty() && !in_progress.is_empty() && graph.ready_tasks().is_empty() {
        issues.push(Issue {
            kind: IssueKind::AllBlocked,
            severity: Severity::Info,
            tasks: todo.iter().map(|t| t.id.clone()).collect(),
            recommendation: format!(
                "All {} TODO tasks wait on the {} in-progress ones; new assignments resume \
                 as those complete",
                todo.len(),
                in_progress.len()
            ),
        });
    }

    // No-fit: ready work no registered agent can take.
    let mut no_fit: Vec<TaskId> = Vec::new();
    for task in graph.ready_tasks() {
        let fits_someone = registry.all().any(|agent| {
            task.required_capabilities.iter().all(|c| agent.capabilities.contains(c))
        });
        if !fits_someone {
            no_fit.push(task.id.clone());
        }
    }
    if !no_fit.is_empty() {
        no_fit.sort();
        issues.push(Issue {
            kind: IssueKind::NoFit,
            severity: Severity::Medium,
            recommendation: format!(
                "{} ready tasks fit no registered agent; register an agent with the missing \
                 capabilities or relax the requirements",
                no_fit.len()
            ),
            tasks: no_fit,
        });
    }

    let health_score = score(&issues);
    DiagnosticReport {
        generated_at: now,
        reason,
        issues,
        suggested_edges: suggested_edges.to_vec(),
        health_score,
    }
}

fn score(issues: &[Issue]) -> u8 {
    let deductions: u32 = issues
        .iter()
        .map(|i| match i.severity {
            Severity::Critical => 30,
            Severity::High => 15,
            Severity::Medium => 7,
            Severity::Info => 2,
        })
        .sum();
    100u32.saturating_sub(deductions) as u8
}
