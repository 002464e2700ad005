//! Configuration loader and validator for the field sync daemon.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub backend: Backend,
    pub recognition: Recognition,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub sync_interval_secs: u64,
    pub batch_size: u32,
    pub max_retries: i32,
    pub connectivity_poll_secs: u64,
}

/// Remote backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Backend {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
}

/// Recognition queue housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recognition {
    pub cleanup_after_days: i64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` and the
    /// pending-images subdirectory if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.images_dir())
    }

    /// Directory holding raw captures awaiting classification.
    pub fn images_dir(&self) -> std::path::PathBuf {
        Path::new(&self.app.data_dir).join("pending_images")
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.sync_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.sync_interval_secs must be > 0"));
    }
    if cfg.app.batch_size == 0 {
        return Err(ConfigError::Invalid("app.batch_size must be > 0"));
    }
    if cfg.app.max_retries <= 0 {
        return Err(ConfigError::Invalid("app.max_retries must be > 0"));
    }
    if cfg.app.connectivity_poll_secs == 0 {
        return Err(ConfigError::Invalid(
            "app.connectivity_poll_secs must be > 0",
        ));
    }

    if cfg.backend.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("backend.base_url must be non-empty"));
    }
    if cfg.backend.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("backend.api_key must be non-empty"));
    }
    if cfg.backend.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "backend.request_timeout_secs must be > 0",
        ));
    }

    if cfg.recognition.cleanup_after_days <= 0 {
        return Err(ConfigError::Invalid(
            "recognition.cleanup_after_days must be > 0",
        ));
    }

    Ok(())
}

/// Canonical example configuration, also used by tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  sync_interval_secs: 300
  batch_size: 50
  max_retries: 5
  connectivity_poll_secs: 30

backend:
  base_url: "https://api.agroscout.example/"
  api_key: "YOUR_BACKEND_API_KEY"
  request_timeout_secs: 30

recognition:
  cleanup_after_days: 14
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_api_key() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.backend.api_key = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("backend.api_key")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_intervals() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.sync_interval_secs = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.batch_size = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.max_retries = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.recognition.cleanup_after_days = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_images_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.join("pending_images").exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.batch_size, 50);
        assert_eq!(cfg.backend.request_timeout_secs, 30);
    }
}
