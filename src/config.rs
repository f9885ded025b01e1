//! Configuration loader and validator for orgsync.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::github::GITHUB_API_BASE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub github: GitHub,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Pause between page requests.
    #[serde(default)]
    pub interval_ms: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Session document location; empty selects the per-user default.
    #[serde(default)]
    pub session_path: String,
}

/// Directory API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitHub {
    #[serde(default)]
    pub token: String,
    pub org: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
}

fn default_page_size() -> u32 {
    crate::fetch::DEFAULT_PAGE_SIZE
}

fn default_api_base_url() -> String {
    GITHUB_API_BASE.to_string()
}

impl App {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// SQLite URL; `DATABASE_URL` wins over the data directory default.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/orgsync.db", self.data_dir))
    }

    pub fn session_path(&self) -> Option<PathBuf> {
        let trimmed = self.session_path.trim();
        (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Fills an empty `github.token` from `GITHUB_TOKEN`.
    fn apply_env(&mut self) {
        if self.github.token.trim().is_empty() {
            if let Ok(token) = std::env::var("GITHUB_TOKEN") {
                self.github.token = token;
            }
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.page_size == 0 || cfg.app.page_size > 100 {
        return Err(ConfigError::Invalid("app.page_size must be between 1 and 100"));
    }

    if cfg.github.token.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "github.token must be non-empty (or set GITHUB_TOKEN)",
        ));
    }
    if cfg.github.org.trim().is_empty() {
        return Err(ConfigError::Invalid("github.org must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.github.api_base_url).is_err() {
        return Err(ConfigError::Invalid("github.api_base_url must be a valid URL"));
    }

    Ok(())
}

/// Returns the example YAML shipped with the docs.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  interval_ms: 250
  page_size: 100
  session_path: ""

github:
  token: "YOUR_GITHUB_TOKEN"
  org: "your-org"
  api_base_url: "https://api.github.com/"
"#
}
