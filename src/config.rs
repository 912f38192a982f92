//! Application configuration.
//!
//! Loaded from a TOML file where every field has a default, then overridden
//! from the environment (a `.env` file is read first). `validate` rejects
//! settings the core cannot run with.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::ai::RetryPolicy;
use crate::error::{Error, Result};
use crate::execution::LockPolicy;
use crate::validation::snapshot::MAX_SNAPSHOT_ENTRIES;

pub const ENV_ROOT: &str = "AUTOMANAGER_ROOT";
pub const ENV_OLLAMA_URL: &str = "AUTOMANAGER_OLLAMA_URL";
pub const ENV_MODEL: &str = "AUTOMANAGER_MODEL";
pub const ENV_LOG: &str = "AUTOMANAGER_LOG";
pub const ENV_HOLDING_DIR: &str = "AUTOMANAGER_HOLDING_DIR";

const APP_DIR: &str = "automanager";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Permitted root; nothing outside it is ever touched
    pub root: PathBuf,
    /// Initial working directory, defaults to the root
    pub working_directory: Option<PathBuf>,
    pub model: ModelConfig,
    pub context: ContextConfig,
    pub holding: HoldingConfig,
    pub ledger: LedgerConfig,
    pub locking: LockPolicy,
    pub workers: usize,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub context_window: u32,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_listing_entries: usize,
    pub history_len: usize,
    /// Cap on entries the validator records while walking source folders
    pub max_snapshot_entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HoldingConfig {
    pub dir: PathBuf,
    pub retention_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub persist: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

fn default_workers() -> usize {
    num_cpus::get().clamp(2, 8)
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            root: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
            working_directory: None,
            model: ModelConfig::default(),
            context: ContextConfig::default(),
            holding: HoldingConfig::default(),
            ledger: LedgerConfig::default(),
            locking: LockPolicy::Queue { timeout_ms: 5_000 },
            workers: default_workers(),
            log: LogConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "gemma3:4b".to_string(),
            timeout_secs: 60,
            temperature: 0.3,
            context_window: 4096,
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_listing_entries: 200,
            history_len: 10,
            max_snapshot_entries: MAX_SNAPSHOT_ENTRIES,
        }
    }
}

impl Default for HoldingConfig {
    fn default() -> Self {
        Self {
            dir: data_dir().join("holding"),
            retention_days: 30,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            persist: true,
            path: data_dir().join("ledger.jsonl"),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl AppConfig {
    /// Default location of the config file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(data_dir)
            .join(APP_DIR)
            .join("config.toml")
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            Error::Config(format!("failed to read config '{}': {err}", path.display()))
        })?;
        Self::from_toml(&content).map_err(|err| match err {
            Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|err| Error::Config(format!("failed to parse config: {err}")))
    }

    /// Load `path` (or the default file when it exists), apply `.env` and
    /// environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let default = Self::default_path();
                if default.is_file() {
                    Self::load_from_file(&default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(root) = lookup(ENV_ROOT) {
            self.root = PathBuf::from(root);
        }
        if let Some(url) = lookup(ENV_OLLAMA_URL) {
            self.model.base_url = url;
        }
        if let Some(model) = lookup(ENV_MODEL) {
            self.model.model = model;
        }
        if let Some(level) = lookup(ENV_LOG) {
            self.log.level = level;
        }
        if let Some(dir) = lookup(ENV_HOLDING_DIR) {
            self.holding.dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root.is_absolute() {
            return Err(Error::Config(format!(
                "root '{}' must be an absolute path",
                self.root.display()
            )));
        }
        if let Some(cwd) = &self.working_directory {
            let cwd = if cwd.is_absolute() {
                cwd.clone()
            } else {
                self.root.join(cwd)
            };
            if !crate::security::normalize_path(&cwd).starts_with(&self.root) {
                return Err(Error::Config(format!(
                    "working directory '{}' is outside root '{}'",
                    cwd.display(),
                    self.root.display()
                )));
            }
        }
        if self.root.starts_with(&self.holding.dir) {
            return Err(Error::Config(format!(
                "root '{}' cannot be inside the holding area '{}'",
                self.root.display(),
                self.holding.dir.display()
            )));
        }
        if self.ledger.persist && self.ledger.path.parent().is_none() {
            return Err(Error::Config(format!(
                "ledger path '{}' has no parent directory",
                self.ledger.path.display()
            )));
        }

        let model = &self.model;
        if !(model.base_url.starts_with("http://") || model.base_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "model.base_url '{}' must be an http(s) URL",
                model.base_url
            )));
        }
        if model.model.trim().is_empty() {
            return Err(Error::Config("model.model cannot be empty".to_string()));
        }
        if model.timeout_secs == 0 {
            return Err(Error::Config("model.timeout_secs must be positive".to_string()));
        }
        if !(0.0..=2.0).contains(&model.temperature) {
            return Err(Error::Config(format!(
                "model.temperature {} is outside 0.0..=2.0",
                model.temperature
            )));
        }
        if model.retry.base_delay_ms > model.retry.max_delay_ms {
            return Err(Error::Config(
                "model.retry.base_delay_ms cannot exceed max_delay_ms".to_string(),
            ));
        }

        if self.context.max_listing_entries == 0 {
            return Err(Error::Config(
                "context.max_listing_entries must be positive".to_string(),
            ));
        }
        if self.context.max_snapshot_entries == 0 {
            return Err(Error::Config(
                "context.max_snapshot_entries must be positive".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be positive".to_string()));
        }
        if self.log.level.trim().is_empty() {
            return Err(Error::Config("log.level cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Paths inside the root that belong to the core and must never be touched by a plan
    pub fn reserved_paths(&self) -> Vec<PathBuf> {
        let mut reserved = vec![self.holding.dir.clone()];
        if self.ledger.persist {
            reserved.push(self.ledger.path.clone());
        }
        if let Some(file) = &self.log.file {
            reserved.push(file.clone());
        }
        reserved
    }

    /// The working directory to start a session in
    pub fn initial_directory(&self) -> PathBuf {
        match &self.working_directory {
            Some(cwd) if cwd.is_absolute() => cwd.clone(),
            Some(cwd) => self.root.join(cwd),
            None => self.root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_at(root: &str) -> AppConfig {
        AppConfig {
            root: PathBuf::from(root),
            holding: HoldingConfig {
                dir: PathBuf::from("/var/tmp/am/holding"),
                retention_days: 30,
            },
            ledger: LedgerConfig {
                persist: true,
                path: PathBuf::from("/var/tmp/am/ledger.jsonl"),
            },
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = config_at("/home/user");
        config.validate().unwrap();
        assert_eq!(config.model.base_url, "http://localhost:11434");
        assert_eq!(config.holding.retention_days, 30);
        assert!((2..=8).contains(&config.workers));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
root = "/srv/files"
workers = 3

[model]
model = "llama3.2"

[locking]
mode = "reject"
"#,
        )
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/files"));
        assert_eq!(config.workers, 3);
        assert_eq!(config.model.model, "llama3.2");
        assert_eq!(config.model.timeout_secs, 60);
        assert_eq!(config.locking, LockPolicy::Reject);
        assert_eq!(config.context.history_len, 10);
        assert_eq!(config.context.max_snapshot_entries, MAX_SNAPSHOT_ENTRIES);
    }

    #[test]
    fn test_queue_policy_from_toml() {
        let config = AppConfig::from_toml("[locking]\nmode = \"queue\"\ntimeout_ms = 250\n").unwrap();
        assert_eq!(config.locking, LockPolicy::Queue { timeout_ms: 250 });
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = AppConfig::from_toml("workers = \"many\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_ROOT, "/data"),
            (ENV_MODEL, "qwen2.5"),
            (ENV_LOG, "debug"),
            (ENV_OLLAMA_URL, ""),
        ]
        .into_iter()
        .collect();
        let mut config = config_at("/home/user");
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.root, PathBuf::from("/data"));
        assert_eq!(config.model.model, "qwen2.5");
        assert_eq!(config.log.level, "debug");
        // Blank values do not override
        assert_eq!(config.model.base_url, "http://localhost:11434");
    }

    #[test]
    fn test_validate_rejects_inconsistent_settings() {
        let mut config = config_at("/home/user/holding/inner");
        config.holding.dir = PathBuf::from("/home/user/holding");
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = config_at("/home/user");
        config.working_directory = Some(PathBuf::from("../elsewhere"));
        assert!(config.validate().is_err());

        let config = config_at("relative/root");
        assert!(config.validate().is_err());

        let mut config = config_at("/home/user");
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = config_at("/home/user");
        config.context.max_snapshot_entries = 0;
        assert!(config.validate().is_err());

        let mut config = config_at("/home/user");
        config.model.base_url = "localhost:11434".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reserved_paths_cover_state_files() {
        let mut config = config_at("/home/user");
        config.log.file = Some(PathBuf::from("/home/user/.automanager.log"));
        let reserved = config.reserved_paths();
        assert!(reserved.contains(&PathBuf::from("/var/tmp/am/holding")));
        assert!(reserved.contains(&PathBuf::from("/var/tmp/am/ledger.jsonl")));
        assert!(reserved.contains(&PathBuf::from("/home/user/.automanager.log")));

        config.ledger.persist = false;
        assert_eq!(config.reserved_paths().len(), 2);
    }

    #[test]
    fn test_initial_directory_resolves_relative() {
        let mut config = config_at("/home/user");
        assert_eq!(config.initial_directory(), PathBuf::from("/home/user"));
        config.working_directory = Some(PathBuf::from("Downloads"));
        assert_eq!(config.initial_directory(), PathBuf::from("/home/user/Downloads"));
    }
}
