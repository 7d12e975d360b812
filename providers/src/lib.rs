//! Kanban providers behind the core's `Provider` trait.
//!
//! Thin HTTP clients for Planka, GitHub issues, and Linear, plus the
//! re-exported in-memory provider. The core does its authoritative
//! bookkeeping locally; these clients only mirror it, so each one is a
//! mapping layer, not a second source of truth.

mod common;
mod github;
mod linear;
mod planka;

use std::sync::Arc;

pub use github::GithubProvider;
pub use linear::LinearProvider;
pub use planka::PlankaProvider;

use marcus_core::config::ProviderKind;
use marcus_core::error::{CoreError, Result};
use marcus_core::provider::{InMemoryProvider, Provider};
use serde::{Deserialize, Serialize};

/// Connection settings for the HTTP providers. Which fields are required
/// depends on the selected backend; `open_provider` validates per kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderSettings {
    /// API base URL. Defaults per provider when empty.
    pub base_url: Option<String>,
    /// Bearer token / API key.
    pub token: Option<String>,
    /// GitHub: repository owner.
    pub owner: Option<String>,
    /// GitHub: repository name.
    pub repo: Option<String>,
    /// Planka: board id.
    pub board: Option<String>,
    /// Planka: list id per task status, keyed by the status wire name.
    pub lists: std::collections::BTreeMap<String, String>,
    /// Linear: team id.
    pub team: Option<String>,
    /// Linear: workflow state id per task status, keyed by the wire name.
    pub states: std::collections::BTreeMap<String, String>,
}

fn require(field: Option<&String>, name: &str, provider: &str) -> Result<String> {
    field
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| CoreError::Validation(format!("{provider} provider requires `{name}`")))
}

/// Build the configured provider.
pub fn open_provider(kind: ProviderKind, settings: &ProviderSettings) -> Result<Arc<dyn Provider>> {
    match kind {
        ProviderKind::InMemory => Ok(Arc::new(InMemoryProvider::new())),
        ProviderKind::Github => {
            let provider = GithubProvider::new(
                settings
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.github.com".to_string()),
                require(settings.owner.as_ref(), "owner", "github")?,
                require(settings.repo.as_ref(), "repo", "github")?,
                require(settings.token.as_ref(), "token", "github")?,
            )?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Planka => {
            let provider = PlankaProvider::new(
                require(settings.base_url.as_ref(), "base_url", "planka")?,
                require(settings.token.as_ref(), "token", "planka")?,
                require(settings.board.as_ref(), "board", "planka")?,
                &settings.lists,
            )?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Linear => {
            let provider = LinearProvider::new(
                settings
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.linear.app/graphql".to_string()),
                require(settings.token.as_ref(), "token", "linear")?,
                require(settings.team.as_ref(), "team", "linear")?,
                &settings.states,
            )?;
            Ok(Arc::new(provider))
        }
    }
}
