use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{AgentId, Task, TaskId, TaskStatus};

/// Client-generated key making provider writes idempotent on retry.
///
/// Providers without compare-and-set semantics deduplicate on this key; the
/// core derives one per logical mutation, so replaying a failed write cannot
/// double-apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(operation: &str, task: &str, discriminant: u64) -> Self {
        Self(format!("{operation}:{task}:{discriminant}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A task as the kanban board sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoardCard {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub assignee: Option<AgentId>,
}

/// Narrow interface over the kanban backend.
///
/// The core performs its authoritative bookkeeping locally first and then
/// reflects state here; a failed write triggers rollback of the local change,
/// so the local store stays the source of truth. Implementations must be
/// idempotent on retry for the same key.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    async fn create_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()>;

    async fn update_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()>;

    async fn delete_card(&self, key: &IdempotencyKey, task_id: &str) -> Result<()>;

    async fn set_status(
        &self,
        key: &IdempotencyKey,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<()>;

    async fn append_comment(&self, key: &IdempotencyKey, task_id: &str, text: &str) -> Result<()>;

    async fn list_board(&self) -> Result<Vec<BoardCard>>;
}

#[async_trait]
impl<P: Provider + ?Sized> Provider for std::sync::Arc<P> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn create_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()> {
        (**self).create_card(key, task).await
    }

    async fn update_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()> {
        (**self).update_card(key, task).await
    }

    async fn delete_card(&self, key: &IdempotencyKey, task_id: &str) -> Result<()> {
        (**self).delete_card(key, task_id).await
    }

    async fn set_status(
        &self,
        key: &IdempotencyKey,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<()> {
        (**self).set_status(key, task_id, status).await
    }

    async fn append_comment(&self, key: &IdempotencyKey, task_id: &str, text: &str) -> Result<()> {
        (**self).append_comment(key, task_id, text).await
    }

    async fn list_board(&self) -> Result<Vec<BoardCard>> {
        (**self).list_board().await
    }
}

#[derive(Debug, Default)]
struct BoardState {
    cards: HashMap<TaskId, BoardCard>,
    comments: HashMap<TaskId, Vec<String>>,
    seen_keys: HashSet<IdempotencyKey>,
}

/// Process-local provider for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    state: Mutex<BoardState>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BoardState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Comments recorded against a task, for assertions in tests.
    pub fn comments(&self, task_id: &str) -> Vec<String> {
        self.with_state(|s| s.comments.get(task_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn create_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()> {
        self.with_state(|s| {
            if !s.seen_keys.insert(key.clone()) {
                return Ok(());
            }
            s.cards.insert(
                task.id.clone(),
                BoardCard {
                    id: task.id.clone(),
                    name: task.name.clone(),
                    status: task.status,
                    assignee: task.assignee.clone(),
                },
            );
            Ok(())
        })
    }

    async fn update_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()> {
        self.create_card(key, task).await
    }

    async fn delete_card(&self, key: &IdempotencyKey, task_id: &str) -> Result<()> {
        self.with_state(|s| {
            if !s.seen_keys.insert(key.clone()) {
                return Ok(());
            }
            s.cards.remove(task_id);
            s.comments.remove(task_id);
            Ok(())
        })
    }

    async fn set_status(
        &self,
        key: &IdempotencyKey,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<()> {
        self.with_state(|s| {
            if !s.seen_keys.insert(key.clone()) {
                return Ok(());
            }
            match s.cards.get_mut(task_id) {
                Some(card) => {
                    card.status = status;
                    Ok(())
                }
                None => {
                    // The board may lag task creation; materialize a stub so
                    // status still lands.
                    s.cards.insert(
                        task_id.to_string(),
                        BoardCard {
                            id: task_id.to_string(),
                            name: task_id.to_string(),
                            status,
                            assignee: None,
                        },
                    );
                    Ok(())
                }
            }
        })
    }

    async fn append_comment(&self, key: &IdempotencyKey, task_id: &str, text: &str) -> Result<()> {
        self.with_state(|s| {
            if !s.seen_keys.insert(key.clone()) {
                return Ok(());
            }
            s.comments.entry(task_id.to_string()).or_default().push(text.to_string());
            Ok(())
        })
    }

    async fn list_board(&self) -> Result<Vec<BoardCard>> {
        self.with_state(|s| {
            let mut cards: Vec<BoardCard> = s.cards.values().cloned().collect();
            cards.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(cards)
        })
    }
}

/// Wraps a provider with bounded exponential backoff for transient failures.
/// Non-transient errors surface immediately.
#[derive(Debug)]
pub struct RetryingProvider<P> {
    inner: P,
    retry_bound: u32,
    base_delay: std::time::Duration,
}

impl<P: Provider> RetryingProvider<P> {
    pub fn new(inner: P, retry_bound: u32) -> Self {
        Self { inner, retry_bound, base_delay: std::time::Duration::from_millis(100) }
    }

    #[cfg(test)]
    fn with_base_delay(mut self, base_delay: std::time::Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    async fn retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>> + Send,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.retry_bound => {
                    let delay = self.base_delay * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    tracing::warn!(
                        provider = self.inner.name(),
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient provider failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        tracing::error!(
                            provider = self.inner.name(),
                            operation,
                            attempts = attempt + 1,
                            error = %err,
                            "provider still failing after retries"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl<P: Provider> Provider for RetryingProvider<P> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn create_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()> {
        self.retry("create_card", || self.inner.create_card(key, task)).await
    }

    async fn update_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()> {
        self.retry("update_card", || self.inner.update_card(key, task)).await
    }

    async fn delete_card(&self, key: &IdempotencyKey, task_id: &str) -> Result<()> {
        self.retry("delete_card", || self.inner.delete_card(key, task_id)).await
    }

    async fn set_status(
        &self,
        key: &IdempotencyKey,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<()> {
        self.retry("set_status", || self.inner.set_status(key, task_id, status)).await
    }

    async fn append_comment(&self, key: &IdempotencyKey, task_id: &str, text: &str) -> Result<()> {
        self.retry("append_comment", || self.inner.append_comment(key, task_id, text)).await
    }

    async fn list_board(&self) -> Result<Vec<BoardCard>> {
        self.retry("list_board", || self.inner.list_board()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::models::NewTask;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn task(id: &str) -> Task {
        Task::from_new(NewTask::new(id, format!("Task {id}")), Utc::now())
    }

    #[tokio::test]
    async fn same_key_applies_once() {
        let provider = InMemoryProvider::new();
        let key = IdempotencyKey::derive("comment", "t-1", 1);
        provider.append_comment(&key, "t-1", "hello").await.unwrap();
        provider.append_comment(&key, "t-1", "hello").await.unwrap();
        assert_eq!(provider.comments("t-1").len(), 1);

        let other = IdempotencyKey::derive("comment", "t-1", 2);
        provider.append_comment(&other, "t-1", "again").await.unwrap();
        assert_eq!(provider.comments("t-1").len(), 2);
    }

    #[tokio::test]
    async fn board_reflects_card_lifecycle() {
        let provider = InMemoryProvider::new();
        let t = task("t-1");
        provider
            .create_card(&IdempotencyKey::derive("create", "t-1", 0), &t)
            .await
            .unwrap();
        provider
            .set_status(&IdempotencyKey::derive("status", "t-1", 1), "t-1", TaskStatus::InProgress)
            .await
            .unwrap();
        let board = provider.list_board().await.unwrap();
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].status, TaskStatus::InProgress);

        provider
            .delete_card(&IdempotencyKey::derive("delete", "t-1", 2), "t-1")
            .await
            .unwrap();
        assert!(provider.list_board().await.unwrap().is_empty());
    }

    #[derive(Debug)]
    struct Flaky {
        inner: InMemoryProvider,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl Provider for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn create_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()> {
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
                return Err(CoreError::ProviderUnavailable("simulated outage".into()));
            }
            self.inner.create_card(key, task).await
        }

        async fn update_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()> {
            self.inner.update_card(key, task).await
        }

        async fn delete_card(&self, key: &IdempotencyKey, task_id: &str) -> Result<()> {
            self.inner.delete_card(key, task_id).await
        }

        async fn set_status(
            &self,
            key: &IdempotencyKey,
            task_id: &str,
            status: TaskStatus,
        ) -> Result<()> {
            self.inner.set_status(key, task_id, status).await
        }

        async fn append_comment(
            &self,
            key: &IdempotencyKey,
            task_id: &str,
            text: &str,
        ) -> Result<()> {
            self.inner.append_comment(key, task_id, text).await
        }

        async fn list_board(&self) -> Result<Vec<BoardCard>> {
            self.inner.list_board().await
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_the_bound() {
        let flaky = Flaky { inner: InMemoryProvider::new(), failures_left: AtomicU32::new(2) };
        let provider =
            RetryingProvider::new(flaky, 3).with_base_delay(std::time::Duration::from_millis(1));
        let t = task("t-1");
        provider
            .create_card(&IdempotencyKey::derive("create", "t-1", 0), &t)
            .await
            .unwrap();
        assert_eq!(provider.list_board().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let flaky = Flaky { inner: InMemoryProvider::new(), failures_left: AtomicU32::new(10) };
        let provider =
            RetryingProvider::new(flaky, 2).with_base_delay(std::time::Duration::from_millis(1));
        let t = task("t-1");
        let err = provider
            .create_card(&IdempotencyKey::derive("create", "t-1", 0), &t)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ProviderUnavailable(_)));
    }
}
