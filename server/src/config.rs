use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use marcus_core::CoreConfig;
use marcus_providers::ProviderSettings;
use serde::{Deserialize, Serialize};
use std::env;

/// Full server configuration: the typed core record plus the server-side
/// concerns around it.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub core: CoreConfig,
    pub provider: ProviderSettings,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Directory for the embedded store, database URL for SQL.
    pub location: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Log format (pretty, json, compact).
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl Config {
    /// Load configuration: embedded defaults, then an optional file, then
    /// MARCUS_-prefixed environment variables.
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder().add_source(File::from_str(
            include_str!("../config/default.toml"),
            FileFormat::Toml,
        ));

        let file = config_file
            .map(String::from)
            .or_else(|| env::var("CONFIG_FILE").ok());
        if let Some(file) = file {
            builder = builder
                .add_source(File::with_name(&file).required(true).format(FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("MARCUS")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("failed to build configuration")?;
        let config: Config = config
            .try_deserialize()
            .context("failed to deserialize configuration")?;
        Ok(config)
    }

    /// Validate everything validatable up front.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                anyhow::bail!(
                    "invalid log level: {other}. Must be one of: trace, debug, info, warn, error"
                );
            }
        }
        if self.storage.location.trim().is_empty() {
            anyhow::bail!("storage.location cannot be empty");
        }
        self.core
            .validate()
            .map_err(|e| anyhow::anyhow!("core configuration invalid: {e}"))?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            provider: ProviderSettings::default(),
            storage: StorageConfig { location: "./marcus-data".to_string() },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Pretty },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marcus_core::{PersistenceBackend, ProviderKind};

    #[test]
    fn embedded_defaults_parse_and_validate() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.core.provider, ProviderKind::InMemory);
        assert_eq!(config.core.persistence_backend, PersistenceBackend::EmbeddedKv);
        assert_eq!(config.core.lease_duration_secs, 300);
        config.validate().unwrap();
    }

    #[test]
    fn file_overrides_land_on_top_of_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marcus.toml");
        std::fs::write(
            &path,
            r#"
            [core]
            lease_duration_secs = 60
            provider = "github"

            [provider]
            owner = "acme"
            repo = "project"
            token = "ghp_x"
            "#,
        )
        .unwrap();

        let config = Config::load(path.to_str()).unwrap();
        assert_eq!(config.core.lease_duration_secs, 60);
        assert_eq!(config.core.provider, ProviderKind::Github);
        assert_eq!(config.provider.owner.as_deref(), Some("acme"));
        // Untouched defaults persist.
        assert_eq!(config.core.sweeper_interval_secs, 10);
    }

    #[test]
    fn unknown_core_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marcus.toml");
        std::fs::write(
            &path,
            r#"
            [core]
            lease_duration_sec = 60
            "#,
        )
        .unwrap();
        assert!(Config::load(path.to_str()).is_err());
    }

    #[test]
    fn bad_log_level_fails_validation() {
        let mut config = Config::default();
        config.logging.level = "verbose".into();
        assert!(config.validate().is_err());
    }
}
