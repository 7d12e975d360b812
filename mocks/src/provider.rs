use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use marcus_core::error::{CoreError, Result};
use marcus_core::models::{Task, TaskStatus};
use marcus_core::provider::{BoardCard, IdempotencyKey, InMemoryProvider, Provider};

/// Provider wrapper with error injection and call tracking.
///
/// Wraps the in-memory provider so successful calls still behave; injected
/// errors are consumed one per call, in order.
#[derive(Debug)]
pub struct RecordingProvider {
    inner: InMemoryProvider,
    injected: Mutex<VecDeque<CoreError>>,
    calls: Mutex<Vec<String>>,
}

impl Default for RecordingProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self {
            inner: InMemoryProvider::new(),
            injected: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue an error for the next provider call.
    pub fn inject_error(&self, error: CoreError) {
        self.injected.lock().push_back(error);
    }

    /// Queue the same transient error n times, for retry-path tests.
    pub fn inject_outage(&self, n: usize) {
        let mut queue = self.injected.lock();
        for _ in 0..n {
            queue.push_back(CoreError::ProviderUnavailable("injected outage".into()));
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn assert_called(&self, method: &str) {
        let calls = self.calls.lock();
        assert!(
            calls.iter().any(|c| c.starts_with(method)),
            "expected a call to {method}; calls were {calls:?}"
        );
    }

    pub fn assert_not_called(&self, method: &str) {
        let calls = self.calls.lock();
        assert!(
            !calls.iter().any(|c| c.starts_with(method)),
            "unexpected call to {method}; calls were {calls:?}"
        );
    }

    /// Comments recorded against a task.
    pub fn comments(&self, task_id: &str) -> Vec<String> {
        self.inner.comments(task_id)
    }

    fn record(&self, method: &str, detail: &str) -> Result<()> {
        self.calls.lock().push(format!("{method}({detail})"));
        match self.injected.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Provider for RecordingProvider {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn create_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()> {
        self.record("create_card", &task.id)?;
        self.inner.create_card(key, task).await
    }

    async fn update_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()> {
        self.record("update_card", &task.id)?;
        self.inner.update_card(key, task).await
    }

    async fn delete_card(&self, key: &IdempotencyKey, task_id: &str) -> Result<()> {
        self.record("delete_card", task_id)?;
        self.inner.delete_card(key, task_id).await
    }

    async fn set_status(
        &self,
        key: &IdempotencyKey,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<()> {
        self.record("set_status", &format!("{task_id}:{status}"))?;
        self.inner.set_status(key, task_id, status).await
    }

    async fn append_comment(&self, key: &IdempotencyKey, task_id: &str, text: &str) -> Result<()> {
        self.record("append_comment", task_id)?;
        self.inner.append_comment(key, task_id, text).await
    }

    async fn list_board(&self) -> Result<Vec<BoardCard>> {
        self.record("list_board", "")?;
        self.inner.list_board().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use marcus_core::models::NewTask;

    #[tokio::test]
    async fn injected_errors_are_consumed_in_order() {
        let provider = RecordingProvider::new();
        provider.inject_outage(1);
        let task = Task::from_new(NewTask::new("t-1", "t"), Utc::now());
        let key = IdempotencyKey::derive("create", "t-1", 0);

        let err = provider.create_card(&key, &task).await.unwrap_err();
        assert!(matches!(err, CoreError::ProviderUnavailable(_)));
        // Queue drained: the retry succeeds.
        let key = IdempotencyKey::derive("create", "t-1", 1);
        provider.create_card(&key, &task).await.unwrap();
        provider.assert_called("create_card");
    }
}
