use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::error::{CoreError, Result};
use crate::models::{AgentId, AgentProfile, Role, TaskId};

/// Outcome of a registration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// The agent was already known; capabilities were refreshed.
    Updated,
}

/// Registry of agents known to this process, with liveness and a rolling
/// performance window. Registration is idempotent by agent id.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentId, AgentProfile>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or re-register an agent. Re-registration replaces role and
    /// capabilities but keeps history and any current assignment.
    pub fn register(
        &mut self,
        id: &str,
        role: Role,
        capabilities: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<Registration> {
        if id.trim().is_empty() {
            return Err(CoreError::Validation("agent id cannot be empty".into()));
        }
        match self.agents.get_mut(id) {
            Some(agent) => {
                agent.role = role;
                agent.capabilities = capabilities;
                agent.last_heartbeat = now;
                tracing::debug!(agent_id = %id, "agent re-registered");
                Ok(Registration::Updated)
            }
            None => {
                self.agents.insert(
                    id.to_string(),
                    AgentProfile {
                        id: id.to_string(),
                        role,
                        capabilities,
                        registered_at: now,
                        last_heartbeat: now,
                        assignment: None,
                        performance: Default::default(),
                    },
                );
                tracing::info!(agent_id = %id, ?role, "agent registered");
                Ok(Registration::Created)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&AgentProfile> {
        self.agents.get(id)
    }

    /// Fetch an agent or fail with `UnknownAgent`.
    pub fn agent(&self, id: &str) -> Result<&AgentProfile> {
        self.agents.get(id).ok_or_else(|| CoreError::unknown_agent(id))
    }

    pub(crate) fn agent_mut(&mut self, id: &str) -> Result<&mut AgentProfile> {
        self.agents.get_mut(id).ok_or_else(|| CoreError::unknown_agent(id))
    }

    /// Refresh liveness independent of task progress.
    pub fn heartbeat(&mut self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.agent_mut(id)?.last_heartbeat = now;
        Ok(())
    }

    pub fn set_assignment(&mut self, id: &str, assignment: Option<TaskId>) -> Result<()> {
        self.agent_mut(id)?.assignment = assignment;
        Ok(())
    }

    /// Agents currently holding no task.
    pub fn idle_agents(&self) -> Vec<&AgentProfile> {
        self.agents.values().filter(|a| a.assignment.is_none()).collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &AgentProfile> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Reinstall a profile loaded from the durable store.
    pub(crate) fn restore(&mut self, profile: AgentProfile) {
        self.agents.insert(profile.id.clone(), profile);
    }
}
