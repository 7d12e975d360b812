use std::future::Future;

use async_trait::async_trait;

use crate::config::FitWeights;
use crate::dependency::InferredEdge;
use crate::error::{CoreError, Result};
use crate::models::{
    AgentProfile, BlockerSeverity, DependencyKind, Predictions, Task,
};

/// Effort assumed for tasks with no estimate, in hours.
const DEFAULT_EFFORT_HOURS: f64 = 4.0;

/// The AI inference service, seen from the core.
///
/// Consulted for fit scoring, dependency inference, blocker mitigation, and
/// predictions. Every call is bounded by the configured deadline via
/// [`with_deadline`]; on timeout or error the core falls back to the
/// deterministic [`HeuristicOracle`]. Implementations are thread-safe
/// clients with their own connection handling.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Score how well a task fits an agent, 0..=1.
    async fn score_fit(&self, agent: &AgentProfile, task: &Task) -> Result<f64>;

    /// Propose dependency edges for the given tasks.
    async fn infer_dependencies(&self, tasks: &[Task]) -> Result<Vec<InferredEdge>>;

    /// Suggest mitigations for a reported blocker.
    async fn suggest_mitigations(
        &self,
        task: &Task,
        description: &str,
        severity: BlockerSeverity,
    ) -> Result<Vec<String>>;

    /// Predict assignment outcome for an (agent, task) pair.
    async fn predict(&self, agent: &AgentProfile, task: &Task) -> Result<Predictions>;
}

/// Run an oracle call under a deadline, mapping elapsed time to `Timeout`.
pub async fn with_deadline<T, F>(
    deadline: std::time::Duration,
    what: &'static str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>> + Send,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(call = what, deadline_ms = deadline.as_millis() as u64, "oracle deadline elapsed");
            Err(CoreError::Timeout(what.into()))
        }
    }
}

/// Deterministic oracle used as the fallback and as the default when no AI
/// service is wired in. Same inputs, same outputs, no I/O.
#[derive(Debug, Clone)]
pub struct HeuristicOracle {
    weights: FitWeights,
}

impl HeuristicOracle {
    pub fn new(weights: FitWeights) -> Self {
        Self { weights }
    }

    /// Fraction of the task's required capabilities the agent declares.
    /// A task with no requirements fits everyone.
    fn skill_overlap(agent: &AgentProfile, task: &Task) -> f64 {
        if task.required_capabilities.is_empty() {
            return 1.0;
        }
        let held = task
            .required_capabilities
            .iter()
            .filter(|c| agent.capabilities.contains(*c))
            .count();
        held as f64 / task.required_capabilities.len() as f64
    }

    /// The closed-form fit combination. Weights are normalized so the score
    /// stays within 0..=1 whatever the configuration.
    pub fn fit_score(&self, agent: &AgentProfile, task: &Task) -> f64 {
        let w = &self.weights;
        let total = w.skill + w.history + w.priority + w.speed;
        let skill = Self::skill_overlap(agent, task);
        let history = agent.performance.success_ratio(&task.labels);
        let priority = task.priority.weight();
        let speed = 1.0 / (1.0 + task.estimated_hours.unwrap_or(DEFAULT_EFFORT_HOURS));
        (w.skill * skill + w.history * history + w.priority * priority + w.speed * speed) / total
    }
}

impl Default for HeuristicOracle {
    fn default() -> Self {
        Self::new(FitWeights::default())
    }
}

#[async_trait]
impl Oracle for HeuristicOracle {
    async fn score_fit(&self, agent: &AgentProfile, task: &Task) -> Result<f64> {
        Ok(self.fit_score(agent, task))
    }

    /// Pattern rules, no AI: sequential siblings depend on each other, and a
    /// subtask whose `requires` matches a sibling's `provides` waits on it.
    async fn infer_dependencies(&self, tasks: &[Task]) -> Result<Vec<InferredEdge>> {
        let mut edges = Vec::new();
        for task in tasks {
            let Some(parent) = &task.parent else { continue };
            let Some(order) = task.order_index else { continue };
            // Closest earlier sibling by order index.
            let previous = tasks
                .iter()
                .filter(|s| s.parent.as_ref() == Some(parent) && s.id != task.id)
                .filter(|s| s.order_index.map(|o| o < order).unwrap_or(false))
                .max_by_key(|s| s.order_index);
            if let Some(previous) = previous {
                edges.push(InferredEdge {
                    from: task.id.clone(),
                    on: previous.id.clone(),
                    kind: DependencyKind::Hard,
                    confidence: 0.75,
                    reason: format!("sequential subtask after '{}'", previous.name),
                });
            }
            if let (Some(requires), true) = (&task.requires, task.dependencies.is_empty()) {
                for sibling in tasks
                    .iter()
                    .filter(|s| s.parent.as_ref() == Some(parent) && s.id != task.id)
                {
                    if sibling.provides.as_deref() == Some(requires.as_str()) {
                        edges.push(InferredEdge {
                            from: task.id.clone(),
                            on: sibling.id.clone(),
                            kind: DependencyKind::Hard,
                            confidence: 0.9,
                            reason: format!("requires interface provided by '{}'", sibling.name),
                        });
                    }
                }
            }
        }
        Ok(edges)
    }

    /// Static rule book keyed on the blocker description. Always non-empty.
    async fn suggest_mitigations(
        &self,
        task: &Task,
        description: &str,
        severity: BlockerSeverity,
    ) -> Result<Vec<String>> {
        let lower = description.to_lowercase();
        let mut suggestions = Vec::new();
        if ["credential", "auth", "token", "secret", "password"]
            .iter()
            .any(|k| lower.contains(k))
        {
            suggestions.push(
                "Check the project secret store for the missing credentials and request access \
                 from an operator if absent"
                    .to_string(),
            );
            suggestions.push("Mock the authenticated dependency and record the assumption as a decision".to_string());
        }
        if ["missing", "not found", "unavailable", "404"].iter().any(|k| lower.contains(k)) {
            suggestions.push(
                "Verify the upstream task that provides this input is complete; its artifacts \
                 are listed in your task context"
                    .to_string(),
            );
        }
        if ["timeout", "network", "connection", "refused"].iter().any(|k| lower.contains(k)) {
            suggestions.push("Retry with backoff; if the endpoint stays down, log a decision and mock it".to_string());
        }
        if ["permission", "denied", "forbidden", "403"].iter().any(|k| lower.contains(k)) {
            suggestions.push("Request elevated access from an operator; note the blocked path".to_string());
        }
        if suggestions.is_empty() {
            suggestions.push(format!(
                "Document the blocker on task '{}' and continue any unblocked portion",
                task.name
            ));
        }
        if severity >= BlockerSeverity::High {
            suggestions.push("Escalate to a human operator; high-severity blockers pause downstream planning".to_string());
        }
        Ok(suggestions)
    }

    /// Predictions from the agent's label history and the task estimate.
    async fn predict(&self, agent: &AgentProfile, task: &Task) -> Result<Predictions> {
        let success = agent.performance.success_ratio(&task.labels);
        let base_hours = task.estimated_hours.unwrap_or(DEFAULT_EFFORT_HOURS);
        // Struggling agents historically overrun; scale expected duration.
        let expected_hours = base_hours * (1.0 + (1.0 - success));
        let dependency_pressure = (task.dependencies.len() as f64 * 0.05).min(0.3);
        let blockage_risk = ((1.0 - success) * 0.5 + dependency_pressure).clamp(0.0, 1.0);
        Ok(Predictions { success_probability: success, expected_hours, blockage_risk })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewTask, Priority, Role};
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn agent(capabilities: &[&str]) -> AgentProfile {
        let now = Utc::now();
        AgentProfile {
            id: "worker-1".into(),
            role: Role::Agent,
            capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
            registered_at: now,
            last_heartbeat: now,
            assignment: None,
            performance: Default::default(),
        }
    }

    fn task_with(req: &[&str], priority: Priority, hours: Option<f64>) -> Task {
        let mut new = NewTask::new("t-1", "Fit test");
        new.required_capabilities = req.iter().map(|s| s.to_string()).collect();
        new.priority = priority;
        new.estimated_hours = hours;
        Task::from_new(new, Utc::now())
    }

    #[tokio::test]
    async fn fit_score_prefers_matching_skills_and_short_tasks() {
        let oracle = HeuristicOracle::default();
        let full_match = task_with(&["rust"], Priority::Medium, Some(1.0));
        let no_match = task_with(&["haskell"], Priority::Medium, Some(1.0));
        let agent = agent(&["rust"]);

        let hit = oracle.score_fit(&agent, &full_match).await.unwrap();
        let miss = oracle.score_fit(&agent, &no_match).await.unwrap();
        assert!(hit > miss);

        let quick = task_with(&["rust"], Priority::Medium, Some(0.5));
        let slow = task_with(&["rust"], Priority::Medium, Some(40.0));
        let quick_score = oracle.score_fit(&agent, &quick).await.unwrap();
        let slow_score = oracle.score_fit(&agent, &slow).await.unwrap();
        assert!(quick_score > slow_score);

        for score in [hit, miss, quick_score, slow_score] {
            assert!((0.0..=1.0).contains(&score));
        }
    }

    #[tokio::test]
    async fn sibling_order_rule_infers_sequential_edges() {
        let oracle = HeuristicOracle::default();
        let now = Utc::now();
        let mut parent = NewTask::new("p", "parent");
        parent.description = "container".into();
        let parent = Task::from_new(parent, now);

        let mk = |id: &str, order: u32| {
            let mut new = NewTask::new(id, id);
            new.parent = Some("p".into());
            new.order_index = Some(order);
            Task::from_new(new, now)
        };
        let tasks = vec![parent, mk("p1", 1), mk("p2", 2), mk("p3", 3)];
        let edges = oracle.infer_dependencies(&tasks).await.unwrap();
        assert!(edges.iter().any(|e| e.from == "p2" && e.on == "p1"));
        assert!(edges.iter().any(|e| e.from == "p3" && e.on == "p2"));
        assert!(!edges.iter().any(|e| e.from == "p1"));
    }

    #[tokio::test]
    async fn mitigation_rule_book_is_never_empty() {
        let oracle = HeuristicOracle::default();
        let task = task_with(&[], Priority::Medium, None);
        for (description, severity) in [
            ("missing OAuth creds", BlockerSeverity::High),
            ("connection refused by staging", BlockerSeverity::Medium),
            ("something entirely novel", BlockerSeverity::Low),
        ] {
            let suggestions = oracle
                .suggest_mitigations(&task, description, severity)
                .await
                .unwrap();
            assert!(!suggestions.is_empty(), "no suggestions for {description:?}");
        }
    }

    #[tokio::test]
    async fn predictions_reflect_history() {
        let oracle = HeuristicOracle::default();
        let labels: BTreeSet<String> = ["backend".to_string()].into();
        let mut strong = agent(&["rust"]);
        for _ in 0..4 {
            strong.performance.record_assigned(&labels);
            strong.performance.record_completed(&labels);
        }
        let mut task = task_with(&[], Priority::Medium, Some(2.0));
        task.labels = labels;

        let p = oracle.predict(&strong, &task).await.unwrap();
        assert!(p.success_probability > 0.9);
        assert!((p.expected_hours - 2.0).abs() < 0.01);
        assert!(p.blockage_risk < 0.1);
    }

    #[tokio::test]
    async fn deadline_maps_to_timeout() {
        let slow = async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(1.0_f64)
        };
        let result = with_deadline(std::time::Duration::from_millis(10), "score_fit", slow).await;
        assert!(matches!(result, Err(CoreError::Timeout(_))));
    }
}
