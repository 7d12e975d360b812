use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::error::{CoreError, Result};
use crate::models::{AgentId, Lease, TaskId};

/// Grants, renews, and expires the time-bounded claims agents hold on tasks.
///
/// At most one active lease per task and one per agent. Versions are
/// monotonically increasing per task across grants and renewals, so a stale
/// holder can always be distinguished from the current one.
#[derive(Debug, Default)]
pub struct LeaseManager {
    leases: HashMap<TaskId, Lease>,
    by_agent: HashMap<AgentId, TaskId>,
    /// High-water version per task, surviving release and re-grant.
    versions: HashMap<TaskId, u64>,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a fresh lease. Refused while any lease on the task or by the
    /// agent is still registered.
    pub fn grant(
        &mut self,
        task: &str,
        agent: &str,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Lease> {
        if self.leases.contains_key(task) {
            return Err(CoreError::Conflict(task.to_string()));
        }
        if let Some(held) = self.by_agent.get(agent) {
            return Err(CoreError::Validation(format!(
                "agent {agent} already holds a lease on task {held}"
            )));
        }
        let version = self.versions.entry(task.to_string()).or_insert(0);
        *version += 1;
        let lease = Lease {
            task: task.to_string(),
            agent: agent.to_string(),
            granted_at: now,
            expires_at: now + duration,
            renewals: 0,
            version: *version,
        };
        self.leases.insert(task.to_string(), lease.clone());
        self.by_agent.insert(agent.to_string(), task.to_string());
        tracing::debug!(task_id = %task, agent_id = %agent, version = lease.version, "lease granted");
        Ok(lease)
    }

    /// Renew the holder's lease, extending expiry by the full duration.
    /// A non-holder gets `WrongLeaseHolder`; a missing or already-expired
    /// lease gets `LeaseExpired` and the agent must request a fresh task.
    pub fn renew(
        &mut self,
        task: &str,
        agent: &str,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Lease> {
        let lease = self
            .leases
            .get_mut(task)
            .ok_or_else(|| CoreError::LeaseExpired(task.to_string()))?;
        if lease.agent != agent {
            return Err(CoreError::WrongLeaseHolder {
                task: task.to_string(),
                holder: lease.agent.clone(),
                agent: agent.to_string(),
            });
        }
        if lease.is_expired(now) {
            return Err(CoreError::LeaseExpired(task.to_string()));
        }
        lease.expires_at = now + duration;
        lease.renewals += 1;
        lease.version += 1;
        self.versions.insert(task.to_string(), lease.version);
        Ok(lease.clone())
    }

    /// Drop the lease on completion, surrender, cancellation, or recovery.
    pub fn release(&mut self, task: &str) -> Option<Lease> {
        let lease = self.leases.remove(task)?;
        self.by_agent.remove(&lease.agent);
        Some(lease)
    }

    /// Current lease on a task, expired or not.
    pub fn lease(&self, task: &str) -> Option<&Lease> {
        self.leases.get(task)
    }

    /// Whether `agent` currently holds the live lease on `task`.
    pub fn is_holder(&self, task: &str, agent: &str, now: DateTime<Utc>) -> bool {
        self.leases
            .get(task)
            .map(|l| l.agent == agent && !l.is_expired(now))
            .unwrap_or(false)
    }

    /// Task currently leased by the agent, if any.
    pub fn task_of(&self, agent: &str) -> Option<&TaskId> {
        self.by_agent.get(agent)
    }

    /// Leases past their deadline, for the sweeper.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<Lease> {
        self.leases.values().filter(|l| l.is_expired(now)).cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.leases.len()
    }

    /// Reinstall a lease loaded from the durable store.
    pub(crate) fn restore(&mut self, lease: Lease) {
        let version = self.versions.entry(lease.task.clone()).or_insert(0);
        *version = (*version).max(lease.version);
        self.by_agent.insert(lease.agent.clone(), lease.task.clone());
        self.leases.insert(lease.task.clone(), lease);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: i64 = 300;

    fn mgr() -> (LeaseManager, DateTime<Utc>, Duration) {
        (LeaseManager::new(), Utc::now(), Duration::seconds(LEASE))
    }

    #[test]
    fn one_lease_per_task_and_per_agent() {
        let (mut leases, now, dur) = mgr();
        leases.grant("t-1", "a", now, dur).unwrap();
        assert!(matches!(leases.grant("t-1", "b", now, dur), Err(CoreError::Conflict(_))));
        assert!(matches!(leases.grant("t-2", "a", now, dur), Err(CoreError::Validation(_))));
        leases.release("t-1");
        leases.grant("t-2", "a", now, dur).unwrap();
    }

    #[test]
    fn renewal_extends_and_versions_monotonically() {
        let (mut leases, now, dur) = mgr();
        let granted = leases.grant("t-1", "a", now, dur).unwrap();
        let later = now + Duration::seconds(60);
        let renewed = leases.renew("t-1", "a", later, dur).unwrap();
        assert_eq!(renewed.renewals, 1);
        assert!(renewed.version > granted.version);
        assert_eq!(renewed.expires_at, later + dur);
    }

    #[test]
    fn renewal_by_non_holder_is_rejected() {
        let (mut leases, now, dur) = mgr();
        leases.grant("t-1", "a", now, dur).unwrap();
        assert!(matches!(
            leases.renew("t-1", "b", now, dur),
            Err(CoreError::WrongLeaseHolder { .. })
        ));
    }

    #[test]
    fn renewal_after_expiry_is_rejected() {
        let (mut leases, now, dur) = mgr();
        leases.grant("t-1", "a", now, dur).unwrap();
        let after = now + Duration::seconds(LEASE + 1);
        assert!(matches!(
            leases.renew("t-1", "a", after, dur),
            Err(CoreError::LeaseExpired(_))
        ));
        // A task never leased reports the same kind.
        assert!(matches!(
            leases.renew("t-9", "a", now, dur),
            Err(CoreError::LeaseExpired(_))
        ));
    }

    #[test]
    fn versions_survive_release_and_regrant() {
        let (mut leases, now, dur) = mgr();
        let first = leases.grant("t-1", "a", now, dur).unwrap();
        leases.release("t-1");
        let second = leases.grant("t-1", "b", now, dur).unwrap();
        assert!(second.version > first.version);
    }

    #[test]
    fn expired_scan_finds_only_lapsed_leases() {
        let (mut leases, now, dur) = mgr();
        leases.grant("t-1", "a", now, dur).unwrap();
        leases.grant("t-2", "b", now + Duration::seconds(200), dur).unwrap();
        let sweep_at = now + Duration::seconds(LEASE + 10);
        let expired = leases.expired(sweep_at);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].task, "t-1");
        assert!(leases.is_holder("t-2", "b", sweep_at));
        assert!(!leases.is_holder("t-1", "a", sweep_at));
    }
}
