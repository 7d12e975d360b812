use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use marcus_core::error::{CoreError, Result};
use marcus_core::models::{Task, TaskStatus};
use marcus_core::provider::{BoardCard, IdempotencyKey, Provider};

use crate::common::{check_status, http_client, parse_marker, task_marker, transport_err, ReplayGuard};

/// Planka board provider. Each task status maps to one configured list;
/// moving a card between lists is the status change.
#[derive(Debug)]
pub struct PlankaProvider {
    client: reqwest::Client,
    base: String,
    token: String,
    board_id: String,
    /// status wire name -> list id.
    lists: BTreeMap<String, String>,
    /// task id -> card id, learned on create and rebuilt from markers.
    index: Mutex<HashMap<String, String>>,
    guard: ReplayGuard,
}

#[derive(Debug, Deserialize)]
struct BoardResponse {
    included: BoardIncluded,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoardIncluded {
    #[serde(default)]
    cards: Vec<Card>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Card {
    id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    list_id: String,
}

impl PlankaProvider {
    pub fn new(
        base: String,
        token: String,
        board_id: String,
        lists: &BTreeMap<String, String>,
    ) -> Result<Self> {
        for status in ["todo", "in_progress", "blocked", "done", "cancelled"] {
            if !lists.contains_key(status) {
                return Err(CoreError::Validation(format!(
                    "planka provider requires a list id for status `{status}`"
                )));
            }
        }
        Ok(Self {
            client: http_client()?,
            base: base.trim_end_matches('/').to_string(),
            token,
            board_id,
            lists: lists.clone(),
            index: Mutex::new(HashMap::new()),
            guard: ReplayGuard::default(),
        })
    }

    fn list_for(&self, status: TaskStatus) -> Result<&str> {
        self.lists
            .get(&status.to_string())
            .map(String::as_str)
            .ok_or_else(|| CoreError::Validation(format!("no planka list for status {status}")))
    }

    fn status_for(&self, list_id: &str) -> TaskStatus {
        for (status, id) in &self.lists {
            if id == list_id {
                return match status.as_str() {
                    "in_progress" => TaskStatus::InProgress,
                    "blocked" => TaskStatus::Blocked,
                    "done" => TaskStatus::Done,
                    "cancelled" => TaskStatus::Cancelled,
                    _ => TaskStatus::Todo,
                };
            }
        }
        TaskStatus::Todo
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.bearer_auth(&self.token)
    }

    async fn fetch_cards(&self) -> Result<Vec<Card>> {
        let url = format!("{}/api/boards/{}", self.base, self.board_id);
        let response = self
            .auth(self.client.get(url))
            .send()
            .await
            .map_err(|e| transport_err("planka fetch board", e))?;
        let response = check_status("planka fetch board", response).await?;
        let board: BoardResponse = response
            .json()
            .await
            .map_err(|e| transport_err("planka decode board", e))?;
        Ok(board.included.cards)
    }

    async fn card_id(&self, task_id: &str) -> Result<String> {
        if let Some(id) = self.index.lock().unwrap_or_else(|e| e.into_inner()).get(task_id) {
            return Ok(id.clone());
        }
        let cards = self.fetch_cards().await?;
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        for card in &cards {
            if let Some(id) = card.description.as_deref().and_then(parse_marker) {
                index.insert(id.to_string(), card.id.clone());
            }
        }
        index
            .get(task_id)
            .cloned()
            .ok_or_else(|| CoreError::ProviderUnavailable(format!("no card for task {task_id}")))
    }
}

#[async_trait]
impl Provider for PlankaProvider {
    fn name(&self) -> &'static str {
        "planka"
    }

    async fn create_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()> {
        if !self.guard.first_use(key) {
            return Ok(());
        }
        let list_id = self.list_for(task.status)?;
        let url = format!("{}/api/lists/{}/cards", self.base, list_id);
        let body = json!({
            "name": task.name,
            "description": format!("{}\n\n{}", task.description, task_marker(&task.id)),
            "position": 65535,
        });
        let response = self
            .auth(self.client.post(url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_err("planka create card", e))?;
        let response = check_status("planka create card", response).await?;
        #[derive(Deserialize)]
        struct Created {
            item: Card,
        }
        let created: Created = response
            .json()
            .await
            .map_err(|e| transport_err("planka decode card", e))?;
        self.index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.id.clone(), created.item.id);
        Ok(())
    }

    async fn update_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()> {
        if !self.guard.first_use(key) {
            return Ok(());
        }
        let card_id = self.card_id(&task.id).await?;
        let url = format!("{}/api/cards/{}", self.base, card_id);
        let body = json!({
            "name": task.name,
            "description": format!("{}\n\n{}", task.description, task_marker(&task.id)),
        });
        let response = self
            .auth(self.client.patch(url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_err("planka update card", e))?;
        check_status("planka update card", response).await?;
        Ok(())
    }

    async fn delete_card(&self, key: &IdempotencyKey, task_id: &str) -> Result<()> {
        if !self.guard.first_use(key) {
            return Ok(());
        }
        let card_id = self.card_id(task_id).await?;
        let url = format!("{}/api/cards/{}", self.base, card_id);
        let response = self
            .auth(self.client.delete(url))
            .send()
            .await
            .map_err(|e| transport_err("planka delete card", e))?;
        check_status("planka delete card", response).await?;
        self.index.lock().unwrap_or_else(|e| e.into_inner()).remove(task_id);
        Ok(())
    }

    async fn set_status(
        &self,
        key: &IdempotencyKey,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<()> {
        if !self.guard.first_use(key) {
            return Ok(());
        }
        let card_id = self.card_id(task_id).await?;
        let list_id = self.list_for(status)?;
        let url = format!("{}/api/cards/{}", self.base, card_id);
        let response = self
            .auth(self.client.patch(url))
            .json(&json!({ "listId": list_id }))
            .send()
            .await
            .map_err(|e| transport_err("planka move card", e))?;
        check_status("planka move card", response).await?;
        Ok(())
    }

    async fn append_comment(&self, key: &IdempotencyKey, task_id: &str, text: &str) -> Result<()> {
        if !self.guard.first_use(key) {
            return Ok(());
        }
        let card_id = self.card_id(task_id).await?;
        let url = format!("{}/api/cards/{}/comment-actions", self.base, card_id);
        let response = self
            .auth(self.client.post(url))
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| transport_err("planka comment", e))?;
        check_status("planka comment", response).await?;
        Ok(())
    }

    async fn list_board(&self) -> Result<Vec<BoardCard>> {
        let cards = self.fetch_cards().await?;
        let mut out = Vec::new();
        for card in cards {
            let Some(task_id) = card.description.as_deref().and_then(parse_marker) else {
                continue;
            };
            out.push(BoardCard {
                id: task_id.to_string(),
                name: card.name.clone(),
                status: self.status_for(&card.list_id),
                assignee: None,
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lists() -> BTreeMap<String, String> {
        [
            ("todo", "l-1"),
            ("in_progress", "l-2"),
            ("blocked", "l-3"),
            ("done", "l-4"),
            ("cancelled", "l-5"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn requires_a_list_per_status() {
        let mut partial = lists();
        partial.remove("blocked");
        let err = PlankaProvider::new(
            "https://planka.local".into(),
            "token".into(),
            "b-1".into(),
            &partial,
        )
        .unwrap_err();
        assert_eq!(err.kind_code(), "Validation");
    }

    #[test]
    fn list_ids_map_both_directions() {
        let provider = PlankaProvider::new(
            "https://planka.local".into(),
            "token".into(),
            "b-1".into(),
            &lists(),
        )
        .unwrap();
        assert_eq!(provider.list_for(TaskStatus::InProgress).unwrap(), "l-2");
        assert_eq!(provider.status_for("l-4"), TaskStatus::Done);
        assert_eq!(provider.status_for("unknown"), TaskStatus::Todo);
    }
}
