use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use marcus_core::error::{CoreError, Result};
use marcus_core::models::{Task, TaskStatus};
use marcus_core::provider::{BoardCard, IdempotencyKey, Provider};

use crate::common::{check_status, http_client, parse_marker, task_marker, transport_err, ReplayGuard};

/// Label identifying issues managed by this server.
const MANAGED_LABEL: &str = "marcus";

/// GitHub issues as the kanban board. Status travels as a `status:<name>`
/// label; DONE and CANCELLED also close the issue. Issues cannot be deleted
/// through the API, so `delete_card` closes and labels instead.
#[derive(Debug)]
pub struct GithubProvider {
    client: reqwest::Client,
    base: String,
    owner: String,
    repo: String,
    token: String,
    /// task id -> issue number, learned on create and rebuilt from body
    /// markers on demand.
    index: Mutex<HashMap<String, u64>>,
    guard: ReplayGuard,
}

#[derive(Debug, Deserialize)]
struct Issue {
    number: u64,
    title: String,
    body: Option<String>,
    state: String,
    labels: Vec<Label>,
    assignee: Option<Assignee>,
}

#[derive(Debug, Deserialize)]
struct Label {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Assignee {
    login: String,
}

fn status_label(status: TaskStatus) -> String {
    format!("status:{status}")
}

fn status_from_labels(labels: &[Label], state: &str) -> TaskStatus {
    for label in labels {
        if let Some(name) = label.name.strip_prefix("status:") {
            return match name {
                "todo" => TaskStatus::Todo,
                "in_progress" => TaskStatus::InProgress,
                "blocked" => TaskStatus::Blocked,
                "done" => TaskStatus::Done,
                "cancelled" => TaskStatus::Cancelled,
                _ => continue,
            };
        }
    }
    if state == "closed" {
        TaskStatus::Done
    } else {
        TaskStatus::Todo
    }
}

impl GithubProvider {
    pub fn new(base: String, owner: String, repo: String, token: String) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            base: base.trim_end_matches('/').to_string(),
            owner,
            repo,
            token,
            index: Mutex::new(HashMap::new()),
            guard: ReplayGuard::default(),
        })
    }

    fn issues_url(&self) -> String {
        format!("{}/repos/{}/{}/issues", self.base, self.owner, self.repo)
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
    }

    async fn fetch_issues(&self) -> Result<Vec<Issue>> {
        let response = self
            .auth(self.client.get(self.issues_url()))
            .query(&[("labels", MANAGED_LABEL), ("state", "all"), ("per_page", "100")])
            .send()
            .await
            .map_err(|e| transport_err("github list issues", e))?;
        let response = check_status("github list issues", response).await?;
        response
            .json::<Vec<Issue>>()
            .await
            .map_err(|e| transport_err("github decode issues", e))
    }

    /// Resolve the issue number for a task, consulting the body markers when
    /// the in-process index is cold (e.g. after a restart).
    async fn issue_number(&self, task_id: &str) -> Result<u64> {
        if let Some(number) = self.index.lock().unwrap_or_else(|e| e.into_inner()).get(task_id) {
            return Ok(*number);
        }
        let issues = self.fetch_issues().await?;
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        for issue in &issues {
            if let Some(id) = issue.body.as_deref().and_then(parse_marker) {
                index.insert(id.to_string(), issue.number);
            }
        }
        index
            .get(task_id)
            .copied()
            .ok_or_else(|| CoreError::ProviderUnavailable(format!("no issue for task {task_id}")))
    }

    async fn patch_issue(&self, number: u64, body: serde_json::Value) -> Result<()> {
        let url = format!("{}/{}", self.issues_url(), number);
        let response = self
            .auth(self.client.patch(url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_err("github patch issue", e))?;
        check_status("github patch issue", response).await?;
        Ok(())
    }
}

#[async_trait]
impl Provider for GithubProvider {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn create_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()> {
        if !self.guard.first_use(key) {
            return Ok(());
        }
        let body = json!({
            "title": task.name,
            "body": format!("{}\n\n{}", task.description, task_marker(&task.id)),
            "labels": [MANAGED_LABEL, status_label(task.status)],
        });
        let response = self
            .auth(self.client.post(self.issues_url()))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_err("github create issue", e))?;
        let response = check_status("github create issue", response).await?;
        let issue: Issue = response
            .json()
            .await
            .map_err(|e| transport_err("github decode issue", e))?;
        self.index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.id.clone(), issue.number);
        Ok(())
    }

    async fn update_card(&self, key: &IdempotencyKey, task: &Task) -> Result<()> {
        if !self.guard.first_use(key) {
            return Ok(());
        }
        let number = self.issue_number(&task.id).await?;
        self.patch_issue(
            number,
            json!({
                "title": task.name,
                "body": format!("{}\n\n{}", task.description, task_marker(&task.id)),
            }),
        )
        .await
    }

    async fn delete_card(&self, key: &IdempotencyKey, task_id: &str) -> Result<()> {
        if !self.guard.first_use(key) {
            return Ok(());
        }
        let number = self.issue_number(task_id).await?;
        self.patch_issue(number, json!({ "state": "closed", "labels": [MANAGED_LABEL, "archived"] }))
            .await
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
        let number = self.issue_number(task_id).await?;
        let state = if status.is_terminal() { "closed" } else { "open" };
        self.patch_issue(
            number,
            json!({ "state": state, "labels": [MANAGED_LABEL, status_label(status)] }),
        )
        .await
    }

    async fn append_comment(&self, key: &IdempotencyKey, task_id: &str, text: &str) -> Result<()> {
        if !self.guard.first_use(key) {
            return Ok(());
        }
        let number = self.issue_number(task_id).await?;
        let url = format!("{}/{}/comments", self.issues_url(), number);
        let response = self
            .auth(self.client.post(url))
            .json(&json!({ "body": text }))
            .send()
            .await
            .map_err(|e| transport_err("github comment", e))?;
        check_status("github comment", response).await?;
        Ok(())
    }

    async fn list_board(&self) -> Result<Vec<BoardCard>> {
        let issues = self.fetch_issues().await?;
        let mut cards = Vec::new();
        for issue in issues {
            let Some(task_id) = issue.body.as_deref().and_then(parse_marker) else {
                continue;
            };
            cards.push(BoardCard {
                id: task_id.to_string(),
                name: issue.title.clone(),
                status: status_from_labels(&issue.labels, &issue.state),
                assignee: issue.assignee.as_ref().map(|a| a.login.clone()),
            });
        }
        cards.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(cards)
    }
}
