use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use marcus_core::error::{CoreError, Result};
use marcus_core::models::{Task, TaskStatus};
use marcus_core::provider::{BoardCard, IdempotencyKey, Provider};

use crate::common::{check_status, http_client, parse_marker, task_marker, transport_err, ReplayGuard};

/// Linear provider over the GraphQL API. Task statuses map to configured
/// workflow state ids.
#[derive(Debug)]
pub struct LinearProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    team_id: String,
    /// status wire name -> workflow state id.
    states: BTreeMap<String, String>,
    /// task id -> issue id.
    index: Mutex<HashMap<String, String>>,
    guard: ReplayGuard,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<Value>,
    errors: Option<Vec<Value>>,
}

impl LinearProvider {
    pub fn new(
        endpoint: String,
        api_key: String,
        team_id: String,
        states: &BTreeMap<String, String>,
    ) -> Result<Self> {
        for status in ["todo", "in_progress", "blocked", "done", "cancelled"] {
            if !states.contains_key(status) {
                return Err(CoreError::Validation(format!(
                    "linear provider requires a workflow state id for status `{status}`"
                )));
            }
        }
        Ok(Self {
            client: http_client()?,
            endpoint,
            api_key,
            team_id,
            states: states.clone(),
            index: Mutex::new(HashMap::new()),
            guard: ReplayGuard::default(),
        })
    }

    fn state_for(&self, status: TaskStatus) -> Result<&str> {
        self.states
            .get(&status.to_string())
            .map(String::as_str)
            .ok_or_else(|| CoreError::Validation(format!("no linear state for status {status}")))
    }

    fn status_for(&self, state_id: &str) -> TaskStatus {
        for (status, id) in &self.states {
            if id == state_id {
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

    async fn graphql(&self, context: &str, query: &str, variables: Value) -> Result<Value> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", &self.api_key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| transport_err(context, e))?;
        let response = check_status(context, response).await?;
        let body: GraphQlResponse = response
            .json()
            .await
            .map_err(|e| transport_err(context, e))?;
        if let Some(errors) = body.errors {
            return Err(CoreError::ProviderUnavailable(format!(
                "{context}: {}",
                serde_json::to_string(&errors).unwrap_or_default()
            )));
        }
        body.data
            .ok_or_else(|| CoreError::ProviderUnavailable(format!("{context}: empty response")))
    }

    async fn issue_id(&self, task_id: &str) -> Result<String> {
        if let Some(id) = self.index.lock().unwrap_or_else(|e| e.into_inner()).get(task_id) {
            return Ok(id.clone());
        }
        let data = self
            .graphql(
                "linear list issues",
                r#"query($teamId: ID!) {
                    issues(filter: { team: { id: { eq: $teamId } } }, first: 250) {
                        nodes { id description }
                    }
                }"#,
                json!({ "teamId": self.team_id }),
            )
            .await?;
        let nodes = data["issues"]["nodes"].as_array().cloned().unwrap_or_default();
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        for node in &nodes {
            let description = node["description"].as_str().unwrap_or_default();
            if let (Some(task), Some(id)) = (parse_marker(description), node["id"].as_str()) {
                index.insert(task.to_string(), id.to_string());
            }
        }
        index
            .get(task_id)
            .cloned()
            .ok_or_else(|| CoreError::ProviderUnavailable(format!("no issue for task {task_id}")))
    }
}

#[async_trait]
impl Provider for LinearProvider {
    fn name(&self) -> &'static str {
        "linear"
    }

    async fn create_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()> {
        if !self.guard.first_use(key) {
            return Ok(());
        }
        let data = self
            .graphql(
                "linear create issue",
                r#"mutation($input: IssueCreateInput!) {
                    issueCreate(input: $input) { issue { id } }
                }"#,
                json!({
                    "input": {
                        "teamId": self.team_id,
                        "title": task.name,
                        "description": format!("{}\n\n{}", task.description, task_marker(&task.id)),
                        "stateId": self.state_for(task.status)?,
                    }
                }),
            )
            .await?;
        if let Some(id) = data["issueCreate"]["issue"]["id"].as_str() {
            self.index
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(task.id.clone(), id.to_string());
        }
        Ok(())
    }

    async fn update_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()> {
        if !self.guard.first_use(key) {
            return Ok(());
        }
        let issue_id = self.issue_id(&task.id).await?;
        self.graphql(
            "linear update issue",
            r#"mutation($id: String!, $input: IssueUpdateInput!) {
                issueUpdate(id: $id, input: $input) { success }
            }"#,
            json!({
                "id": issue_id,
                "input": {
                    "title": task.name,
                    "description": format!("{}\n\n{}", task.description, task_marker(&task.id)),
                }
            }),
        )
        .await?;
        Ok(())
    }

    async fn delete_card(&self, key: &IdempotencyKey, task_id: &str) -> Result<()> {
        if !self.guard.first_use(key) {
            return Ok(());
        }
        let issue_id = self.issue_id(task_id).await?;
        self.graphql(
            "linear archive issue",
            r#"mutation($id: String!) { issueArchive(id: $id) { success } }"#,
            json!({ "id": issue_id }),
        )
        .await?;
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
        let issue_id = self.issue_id(task_id).await?;
        let state_id = self.state_for(status)?;
        self.graphql(
            "linear move issue",
            r#"mutation($id: String!, $input: IssueUpdateInput!) {
                issueUpdate(id: $id, input: $input) { success }
            }"#,
            json!({ "id": issue_id, "input": { "stateId": state_id } }),
        )
        .await?;
        Ok(())
    }

    async fn append_comment(&self, key: &IdempotencyKey, task_id: &str, text: &str) -> Result<()> {
        if !self.guard.first_use(key) {
            return Ok(());
        }
        let issue_id = self.issue_id(task_id).await?;
        self.graphql(
            "linear comment",
            r#"mutation($input: CommentCreateInput!) {
                commentCreate(input: $input) { success }
            }"#,
            json!({ "input": { "issueId": issue_id, "body": text } }),
        )
        .await?;
        Ok(())
    }

    async fn list_board(&self) -> Result<Vec<BoardCard>> {
        let data = self
            .graphql(
                "linear list issues",
                r#"query($teamId: ID!) {
                    issues(filter: { team: { id: { eq: $teamId } } }, first: 250) {
                        nodes {
                            id title description
                            state { id }
                            assignee { name }
                        }
                    }
                }"#,
                json!({ "teamId": self.team_id }),
            )
            .await?;
        let nodes = data["issues"]["nodes"].as_array().cloned().unwrap_or_default();
        let mut cards = Vec::new();
        for node in nodes {
            let description = node["description"].as_str().unwrap_or_default();
            let Some(task_id) = parse_marker(description) else { continue };
            cards.push(BoardCard {
                id: task_id.to_string(),
                name: node["title"].as_str().unwrap_or_default().to_string(),
                status: self.status_for(node["state"]["id"].as_str().unwrap_or_default()),
                assignee: node["assignee"]["name"].as_str().map(String::from),
            });
        }
        cards.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(cards)
    }
}
