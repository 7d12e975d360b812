use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use marcus_core::dependency::InferredEdge;
use marcus_core::error::{CoreError, Result};
use marcus_core::models::{AgentProfile, BlockerSeverity, Predictions, Task};
use marcus_core::oracle::Oracle;

/// Scripted oracle: answers come from tables the test fills in, with an
/// optional artificial delay to exercise the deadline fallback.
#[derive(Default)]
pub struct ScriptedOracle {
    fit_scores: Mutex<HashMap<String, f64>>,
    suggestions: Mutex<Vec<String>>,
    edges: Mutex<Vec<InferredEdge>>,
    delay: Mutex<Option<std::time::Duration>>,
    fail: Mutex<bool>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the fit score for a task id.
    pub fn score(self, task_id: &str, score: f64) -> Self {
        self.fit_scores.lock().insert(task_id.to_string(), score);
        self
    }

    pub fn suggesting(self, suggestions: &[&str]) -> Self {
        *self.suggestions.lock() = suggestions.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn proposing(self, edges: Vec<InferredEdge>) -> Self {
        *self.edges.lock() = edges;
        self
    }

    /// Delay every answer, e.g. past the configured deadline.
    pub fn slow(self, delay: std::time::Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    /// Make every call fail, forcing the fallback path.
    pub fn failing(self) -> Self {
        *self.fail.lock() = true;
        self
    }

    async fn gate(&self) -> Result<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail.lock() {
            return Err(CoreError::Timeout("scripted oracle".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn score_fit(&self, _agent: &AgentProfile, task: &Task) -> Result<f64> {
        self.gate().await?;
        Ok(self.fit_scores.lock().get(&task.id).copied().unwrap_or(0.5))
    }

    async fn infer_dependencies(&self, _tasks: &[Task]) -> Result<Vec<InferredEdge>> {
        self.gate().await?;
        Ok(self.edges.lock().clone())
    }

    async fn suggest_mitigations(
        &self,
        _task: &Task,
        _description: &str,
        _severity: BlockerSeverity,
    ) -> Result<Vec<String>> {
        self.gate().await?;
        Ok(self.suggestions.lock().clone())
    }

    async fn predict(&self, _agent: &AgentProfile, task: &Task) -> Result<Predictions> {
        self.gate().await?;
        let score = self.fit_scores.lock().get(&task.id).copied().unwrap_or(0.5);
        Ok(Predictions {
            success_probability: score,
            expected_hours: task.estimated_hours.unwrap_or(4.0),
            blockage_risk: 1.0 - score,
        })
    }
}
