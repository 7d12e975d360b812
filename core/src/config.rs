use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Typed configuration for the coordination core.
///
/// One record, every knob named; unknown keys are rejected at deserialization
/// so a typo in a config file fails loudly instead of silently defaulting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct CoreConfig {
    /// Lease lifetime in seconds; each progress report renews by this much.
    pub lease_duration_secs: u64,
    /// Reservation retries after losing a re-check race.
    pub assignment_retry_bound: u32,
    /// Oracle deadline in milliseconds before the deterministic fallback.
    pub ai_deadline_ms: u64,
    /// Minimum confidence for an inferred dependency edge to be applied.
    pub ai_confidence_threshold: f64,
    /// Lease sweeper period in seconds.
    pub sweeper_interval_secs: u64,
    /// Provider reconciliation period in seconds.
    pub reconciliation_interval_secs: u64,
    /// IN_PROGRESS tasks gating at least this many TODO tasks are bottlenecks.
    pub bottleneck_threshold: usize,
    /// Hard-dependency chains longer than this are reported informationally.
    pub long_chain_depth: usize,
    /// How to treat a progress report lower than the last one.
    pub progress_monotonic_policy: MonotonicPolicy,
    /// Kanban backend selection.
    pub provider: ProviderKind,
    /// Durable store selection.
    pub persistence_backend: PersistenceBackend,
    /// Provider retries for transient failures, with exponential backoff.
    pub provider_retry_bound: u32,
    /// Weights of the deterministic fit-score fallback.
    pub fit_weights: FitWeights,
}

/// Policy for non-monotonic progress reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MonotonicPolicy {
    /// Refuse the report with `Validation`.
    Reject,
    /// Accept the report but keep the previous high-water mark.
    Clamp,
}

/// Supported kanban backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Planka,
    Github,
    Linear,
    InMemory,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderKind::Planka => "planka",
            ProviderKind::Github => "github",
            ProviderKind::Linear => "linear",
            ProviderKind::InMemory => "in-memory",
        };
        write!(f, "{s}")
    }
}

/// Supported durable store backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PersistenceBackend {
    EmbeddedKv,
    Sql,
}

/// Weights for the closed-form fit score:
/// `skill·overlap + history·success_ratio + priority·weight + speed·1/(1+hours)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct FitWeights {
    pub skill: f64,
    pub history: f64,
    pub priority: f64,
    pub speed: f64,
}

impl Default for FitWeights {
    fn default() -> Self {
        Self { skill: 0.4, history: 0.3, priority: 0.2, speed: 0.1 }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            lease_duration_secs: 300,
            assignment_retry_bound: 3,
            ai_deadline_ms: 2_000,
            ai_confidence_threshold: 0.6,
            sweeper_interval_secs: 10,
            reconciliation_interval_secs: 300,
            bottleneck_threshold: 3,
            long_chain_depth: 6,
            progress_monotonic_policy: MonotonicPolicy::Reject,
            provider: ProviderKind::InMemory,
            persistence_backend: PersistenceBackend::EmbeddedKv,
            provider_retry_bound: 3,
            fit_weights: FitWeights::default(),
        }
    }
}

impl CoreConfig {
    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_duration_secs as i64)
    }

    pub fn ai_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ai_deadline_ms)
    }

    pub fn sweeper_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweeper_interval_secs)
    }

    pub fn reconciliation_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reconciliation_interval_secs)
    }

    /// Validate field ranges. Called once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.lease_duration_secs == 0 {
            return Err(CoreError::Validation("lease_duration_secs must be positive".into()));
        }
        if self.sweeper_interval_secs == 0 {
            return Err(CoreError::Validation("sweeper_interval_secs must be positive".into()));
        }
        if self.assignment_retry_bound == 0 {
            return Err(CoreError::Validation("assignment_retry_bound must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.ai_confidence_threshold) {
            return Err(CoreError::Validation(
                "ai_confidence_threshold must be within 0.0..=1.0".into(),
            ));
        }
        let w = &self.fit_weights;
        for (name, value) in [
            ("skill", w.skill),
            ("history", w.history),
            ("priority", w.priority),
            ("speed", w.speed),
        ] {
            if value < 0.0 {
                return Err(CoreError::Validation(format!(
                    "fit_weights.{name} must not be negative"
                )));
            }
        }
        if w.skill + w.history + w.priority + w.speed <= 0.0 {
            return Err(CoreError::Validation("fit_weights must not sum to zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.lease_duration_secs, 300);
        assert_eq!(config.assignment_retry_bound, 3);
        assert_eq!(config.ai_deadline_ms, 2_000);
        assert!((config.ai_confidence_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.sweeper_interval_secs, 10);
        assert_eq!(config.reconciliation_interval_secs, 300);
        assert_eq!(config.bottleneck_threshold, 3);
        assert_eq!(config.long_chain_depth, 6);
        assert_eq!(config.progress_monotonic_policy, MonotonicPolicy::Reject);
        assert_eq!(config.provider, ProviderKind::InMemory);
        assert_eq!(config.persistence_backend, PersistenceBackend::EmbeddedKv);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: std::result::Result<CoreConfig, _> =
            serde_json::from_str(r#"{"lease_duration_secs": 60, "surprise": true}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn kebab_case_variants_round_trip() {
        let json = r#"{"provider": "in-memory", "persistence_backend": "embedded-kv"}"#;
        let config: CoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.provider, ProviderKind::InMemory);
        assert_eq!(config.persistence_backend, PersistenceBackend::EmbeddedKv);
    }

    #[test]
    fn out_of_range_values_fail_validation() {
        let mut config = CoreConfig::default();
        config.ai_confidence_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.lease_duration_secs = 0;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.fit_weights = FitWeights { skill: 0.0, history: 0.0, priority: 0.0, speed: 0.0 };
        assert!(config.validate().is_err());
    }
}
