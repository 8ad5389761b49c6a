// ABOUTME: ReplicatorConfig - optional TOML settings for the CLI
// ABOUTME: Every field has a default so an empty or missing file is valid
//
// ```toml
// log_schema = "replication"          # schema holding currentlog and the log tables
// guarded_tables = ["main.accounts"]  # SQLite tables writable only in daemon mode
// checkpoint_path = ".trigger-replicator/replay-checkpoint.json"
// connect_retries = 3
// ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::change::QualifiedName;

fn default_log_schema() -> String {
    "replication".to_string()
}

fn default_connect_retries() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    #[serde(default = "default_log_schema")]
    pub log_schema: String,

    /// `schema.table` names
    #[serde(default)]
    pub guarded_tables: Vec<String>,

    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,

    /// Connection attempts after the first before giving up
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            log_schema: default_log_schema(),
            guarded_tables: Vec::new(),
            checkpoint_path: None,
            connect_retries: default_connect_retries(),
        }
    }
}

impl ReplicatorConfig {
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to load config file {:?}", path))
    }

    /// Load `path` when given, otherwise the defaults.
    pub async fn load_optional(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path).await,
            None => Ok(Self::default()),
        }
    }

    pub fn guarded(&self) -> Result<Vec<QualifiedName>> {
        self.guarded_tables
            .iter()
            .map(|name| {
                QualifiedName::parse(name)
                    .with_context(|| format!("Invalid guarded table '{}'", name))
            })
            .collect()
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_path
            .clone()
            .unwrap_or_else(crate::replay::ReplayCheckpoint::default_path)
    }

    fn validate(&self) -> Result<()> {
        if self.log_schema.trim().is_empty() {
            anyhow::bail!("log_schema cannot be empty");
        }
        self.guarded()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = ReplicatorConfig::from_toml("").unwrap();
        assert_eq!(config, ReplicatorConfig::default());
        assert_eq!(config.log_schema, "replication");
        assert_eq!(config.connect_retries, 3);
        assert_eq!(
            config.checkpoint_path(),
            PathBuf::from(".trigger-replicator/replay-checkpoint.json")
        );
    }

    #[test]
    fn parses_all_fields() {
        let config = ReplicatorConfig::from_toml(
            r#"
            log_schema = "capture"
            guarded_tables = ["main.accounts", "main.orders"]
            checkpoint_path = "/tmp/cp.json"
            connect_retries = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.log_schema, "capture");
        assert_eq!(config.guarded().unwrap()[1], QualifiedName::new("main", "orders"));
        assert_eq!(config.checkpoint_path(), PathBuf::from("/tmp/cp.json"));
        assert_eq!(config.connect_retries, 0);
    }

    #[test]
    fn rejects_unqualified_guarded_table() {
        let err = ReplicatorConfig::from_toml(r#"guarded_tables = ["accounts"]"#).unwrap_err();
        assert!(format!("{:#}", err).contains("accounts"));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ReplicatorConfig::load(&dir.path().join("nope.toml")).await.is_err());
        assert_eq!(
            ReplicatorConfig::load_optional(None).await.unwrap(),
            ReplicatorConfig::default()
        );
    }
}
