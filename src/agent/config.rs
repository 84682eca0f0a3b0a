//! Agent Configuration
//!
//! Loaded from a JSON file at startup; everything except the catalog
//! endpoint, token and device id has a default. Durations are stored as
//! seconds in the file and exposed as `Duration` accessors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid config format: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("config field {0} must not be empty")]
    EmptyField(&'static str),
    #[error("signature_required is set but signing_public_key_pem is missing")]
    MissingPublicKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub catalog_base_url: String,
    pub catalog_bearer_token: String,
    pub device_id: String,

    /// Seconds between manifest checks.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Wall-clock timeout for a manifest fetch.
    #[serde(default = "default_manifest_timeout")]
    pub manifest_timeout_secs: u64,
    /// Wall-clock timeout for an artifact fetch.
    #[serde(default = "default_artifact_timeout")]
    pub artifact_timeout_secs: u64,

    /// Hard upper bound on artifact size, in bytes.
    #[serde(default = "default_max_artifact_size")]
    pub max_artifact_size: usize,
    /// Registry capacity: how many modules may be loaded at once.
    #[serde(default = "default_max_modules")]
    pub max_modules: usize,

    /// Refuse updates whose manifest entry carries no signature.
    #[serde(default)]
    pub signature_required: bool,
    /// PEM-encoded RSA public key; required iff `signature_required`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_public_key_pem: Option<String>,

    /// How long the backup slot is retained after a successful commit.
    #[serde(default = "default_post_commit_grace")]
    pub post_commit_grace_secs: u64,
    /// Download attempts per update before giving up.
    #[serde(default = "default_download_retries")]
    pub download_retries: u32,
    /// How long the safe window may stay closed mid-download before the
    /// update is cancelled.
    #[serde(default = "default_cancel_threshold")]
    pub cancel_threshold_secs: u64,
    /// How long the failure status is held before returning to idle.
    #[serde(default = "default_failure_display")]
    pub failure_display_secs: u64,

    /// Root directory for staged modules and module data.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
}

fn default_check_interval() -> u64 {
    30
}

fn default_manifest_timeout() -> u64 {
    10
}

fn default_artifact_timeout() -> u64 {
    30
}

fn default_max_artifact_size() -> usize {
    64 * 1024
}

fn default_max_modules() -> usize {
    8
}

fn default_post_commit_grace() -> u64 {
    30
}

fn default_download_retries() -> u32 {
    3
}

fn default_cancel_threshold() -> u64 {
    5
}

fn default_failure_display() -> u64 {
    8
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./ota-data")
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: AgentConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.catalog_base_url.is_empty() {
            return Err(ConfigError::EmptyField("catalog_base_url"));
        }
        if self.device_id.is_empty() {
            return Err(ConfigError::EmptyField("device_id"));
        }
        if self.signature_required && self.signing_public_key_pem.is_none() {
            return Err(ConfigError::MissingPublicKey);
        }
        Ok(())
    }

    /// A config with required fields filled in and defaults elsewhere.
    pub fn for_device(base_url: &str, token: &str, device_id: &str) -> Self {
        Self {
            catalog_base_url: base_url.to_string(),
            catalog_bearer_token: token.to_string(),
            device_id: device_id.to_string(),
            check_interval_secs: default_check_interval(),
            manifest_timeout_secs: default_manifest_timeout(),
            artifact_timeout_secs: default_artifact_timeout(),
            max_artifact_size: default_max_artifact_size(),
            max_modules: default_max_modules(),
            signature_required: false,
            signing_public_key_pem: None,
            post_commit_grace_secs: default_post_commit_grace(),
            download_retries: default_download_retries(),
            cancel_threshold_secs: default_cancel_threshold(),
            failure_display_secs: default_failure_display(),
            storage_root: default_storage_root(),
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn manifest_timeout(&self) -> Duration {
        Duration::from_secs(self.manifest_timeout_secs)
    }

    pub fn artifact_timeout(&self) -> Duration {
        Duration::from_secs(self.artifact_timeout_secs)
    }

    pub fn post_commit_grace(&self) -> Duration {
        Duration::from_secs(self.post_commit_grace_secs)
    }

    pub fn cancel_threshold(&self) -> Duration {
        Duration::from_secs(self.cancel_threshold_secs)
    }

    pub fn failure_display(&self) -> Duration {
        Duration::from_secs(self.failure_display_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::for_device("https://ota.example", "tok", "dev-1");
        assert_eq!(config.check_interval(), Duration::from_secs(30));
        assert_eq!(config.manifest_timeout(), Duration::from_secs(10));
        assert_eq!(config.artifact_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_artifact_size, 65536);
        assert_eq!(config.max_modules, 8);
        assert!(!config.signature_required);
        assert_eq!(config.download_retries, 3);
        assert_eq!(config.failure_display(), Duration::from_secs(8));
        config.validate().unwrap();
    }

    #[test]
    fn test_minimal_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.config.json");
        std::fs::write(
            &path,
            r#"{"catalog_base_url": "https://ota.example",
                "catalog_bearer_token": "tok",
                "device_id": "veh-42",
                "check_interval_secs": 5}"#,
        )
        .unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.device_id, "veh-42");
        assert_eq!(config.check_interval_secs, 5);
        assert_eq!(config.max_modules, 8);

        config.save(&path).unwrap();
        let reloaded = AgentConfig::load(&path).unwrap();
        assert_eq!(reloaded.check_interval_secs, 5);
    }

    #[test]
    fn test_signature_requires_key() {
        let mut config = AgentConfig::for_device("https://ota.example", "tok", "dev-1");
        config.signature_required = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingPublicKey)
        ));

        config.signing_public_key_pem = Some("-----BEGIN PUBLIC KEY-----".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            AgentConfig::load(Path::new("/nonexistent/agent.json")),
            Err(ConfigError::NotFound(_))
        ));
    }
}
