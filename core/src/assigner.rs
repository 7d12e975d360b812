use crate::dependency::candidate_order;
use crate::models::{AgentProfile, Task};

/// Labels that mark a task as not executable by autonomous agents.
pub const AGENT_INCOMPATIBLE_LABELS: &[&str] = &["human-only", "manual", "needs-human"];

/// Why the candidate set came up empty for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// The ready set itself was empty.
    NothingReady,
    /// Ready work exists, but none of it fits this agent.
    NothingFits,
    /// At least one candidate survived.
    Candidates,
}

/// Assignment-time filter over the ready snapshot: the task's capability set
/// must be covered by the agent's, agent-incompatible labels exclude, and
/// tasks carrying an open blocker are skipped.
pub fn filter_candidates<'a>(
    ready: &[&'a Task],
    agent: &AgentProfile,
) -> (Vec<&'a Task>, FilterVerdict) {
    if ready.is_empty() {
        return (Vec::new(), FilterVerdict::NothingReady);
    }
    let candidates: Vec<&Task> = ready
        .iter()
        .copied()
        .filter(|t| t.required_capabilities.iter().all(|c| agent.capabilities.contains(c)))
        .filter(|t| !t.labels.iter().any(|l| AGENT_INCOMPATIBLE_LABELS.contains(&l.as_str())))
        .filter(|t| t.open_blocker.is_none())
        .collect();
    let verdict = if candidates.is_empty() {
        FilterVerdict::NothingFits
    } else {
        FilterVerdict::Candidates
    };
    (candidates, verdict)
}

/// Pick the highest-scoring candidate; ties fall back to the deterministic
/// ordering (priority, effort, age, id) so concurrent callers agree.
pub fn best_candidate<'a>(scored: &[(&'a Task, f64)]) -> Option<&'a Task> {
    scored
        .iter()
        .max_by(|(a, sa), (b, sb)| sa.total_cmp(sb).then_with(|| candidate_order(b, a)))
        .map(|(task, _)| *task)
}
