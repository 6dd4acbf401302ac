use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::models::{download::RetryPolicy, registry::RegistrySource};

const CONFIG_FILE: &str = "config.json";
const REGISTRY_FILE: &str = "registry.json";

pub const ENV_MODELS_DIR: &str = "YARN_MODELS_DIR";
pub const ENV_MAX_DOWNLOADS: &str = "YARN_MODELS_MAX_DOWNLOADS";
pub const ENV_REGISTRY: &str = "YARN_MODELS_REGISTRY";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct DownloadSettings {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub connect_timeout_secs: u64,
    pub stall_timeout_secs: u64,
    pub progress_interval_ms: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_ms: 500,
            max_backoff_ms: 8_000,
            connect_timeout_secs: 15,
            stall_timeout_secs: 30,
            progress_interval_ms: 250,
        }
    }
}

impl DownloadSettings {
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.base_backoff_ms)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagerConfig {
    pub models_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub registry_url: Option<String>,
    pub backup_retention: usize,
    pub backup_headroom_bytes: u64,
    pub download: DownloadSettings,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            max_concurrent_downloads: 2,
            registry_url: None,
            backup_retention: 3,
            backup_headroom_bytes: 64 * 1024 * 1024,
            download: DownloadSettings::default(),
        }
    }
}

impl ManagerConfig {
    /// A default configuration rooted at `models_dir`.
    pub fn with_models_dir(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            ..Self::default()
        }
    }

    /// Reads `path` (or the platform config file) and applies environment overrides once.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => resolve_config_path()?,
        };
        let mut config = load_settings(&path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn persist(&self, path: Option<&Path>) -> Result<()> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => resolve_config_path()?,
        };
        persist_settings(&path, self)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = env::var(ENV_MODELS_DIR) {
            if !dir.trim().is_empty() {
                self.models_dir = PathBuf::from(dir);
            }
        }
        if let Ok(raw) = env::var(ENV_MAX_DOWNLOADS) {
            match raw.trim().parse::<usize>() {
                Ok(value) if value > 0 => self.max_concurrent_downloads = value,
                _ => tracing::warn!("Ignoring invalid {ENV_MAX_DOWNLOADS} value {raw:?}"),
            }
        }
        if let Ok(registry) = env::var(ENV_REGISTRY) {
            if !registry.trim().is_empty() {
                self.registry_url = Some(registry);
            }
        }
    }

    #[must_use]
    pub fn registry_source(&self) -> RegistrySource {
        match &self.registry_url {
            Some(value) => RegistrySource::parse(value),
            None => RegistrySource::File(self.models_dir.join(REGISTRY_FILE)),
        }
    }

    #[must_use]
    pub fn download_slots(&self) -> usize {
        self.max_concurrent_downloads.max(1)
    }
}

pub fn resolve_config_path() -> Result<PathBuf> {
    let project_dirs = project_dirs()?;
    let dir = project_dirs.config_dir();
    fs::create_dir_all(dir).context("creating config directory failed")?;
    Ok(dir.join(CONFIG_FILE))
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "ProjectYarn", "ProjectYarn").context("missing project directories")
}

fn default_models_dir() -> PathBuf {
    match project_dirs() {
        Ok(dirs) => dirs.data_dir().join("models"),
        Err(_) => PathBuf::from("models"),
    }
}

fn load_settings(path: &Path) -> Result<ManagerConfig> {
    if !path.exists() {
        return Ok(ManagerConfig::default());
    }
    let bytes = fs::read(path).with_context(|| format!("failed reading {path:?}"))?;
    serde_json::from_slice(&bytes).context("config json could not be parsed")
}

fn persist_settings(path: &Path, config: &ManagerConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
    }
    let serialized = serde_json::to_vec_pretty(config).context("serialize config to json failed")?;
    fs::write(path, serialized).with_context(|| format!("write config to {path:?}"))?;
    Ok(())
}
