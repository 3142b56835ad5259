use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MementoConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub retention: RetentionConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Vector index database. Kept in its own file so it can be dropped and rebuilt.
    pub vector_db_path: String,
    pub default_project: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `"local"` or `"none"` (structured search only).
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetentionConfig {
    /// Project-scoped observations kept per project.
    pub max_observations_per_project: usize,
    /// Global-scoped observations kept across all projects.
    pub max_global_observations: usize,
    /// User prompts kept across all sessions.
    pub max_prompts: usize,
    pub eviction_timeout_secs: u64,
    /// Jaccard threshold used to suppress near-duplicate observation writes.
    pub write_dedup_threshold: f64,
    /// How many recent observations a new one is compared against.
    pub write_dedup_window: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    /// Vector candidates requested per result slot.
    pub candidate_multiplier: usize,
    /// Jaccard threshold for collapsing near-duplicate observations in results.
    pub dedup_threshold: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let dir = default_memento_dir();
        Self {
            db_path: dir.join("memento.db").to_string_lossy().into_owned(),
            vector_db_path: dir.join("vectors.db").to_string_lossy().into_owned(),
            default_project: "default".into(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_memento_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_observations_per_project: 100,
            max_global_observations: 100,
            max_prompts: 500,
            eviction_timeout_secs: 10,
            write_dedup_threshold: 0.8,
            write_dedup_window: 50,
        }
    }
}

impl RetentionConfig {
    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_secs(self.eviction_timeout_secs)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            max_limit: 100,
            candidate_multiplier: 2,
            dedup_threshold: 0.8,
        }
    }
}

/// Returns `~/.memento/`, or `./.memento` when no home directory is available.
pub fn default_memento_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".memento")
}

/// Returns the default config file path: `~/.memento/config.toml`
pub fn default_config_path() -> PathBuf {
    default_memento_dir().join("config.toml")
}

impl MementoConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MementoConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (MEMENTO_DB, MEMENTO_VECTOR_DB, MEMENTO_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEMENTO_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("MEMENTO_VECTOR_DB") {
            self.storage.vector_db_path = val;
        }
        if let Ok(val) = std::env::var("MEMENTO_LOG_LEVEL") {
            self.server.log_level = val;
        }
    }

    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    pub fn resolved_vector_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.vector_db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = MementoConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.retention.max_observations_per_project, 100);
        assert_eq!(config.retention.max_prompts, 500);
        assert_eq!(config.retention.eviction_timeout(), Duration::from_secs(10));
        assert_eq!(config.search.default_limit, 20);
        assert_eq!(config.search.max_limit, 100);
        assert!(config.storage.db_path.ends_with("memento.db"));
        assert!(config.storage.vector_db_path.ends_with("vectors.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"

[storage]
db_path = "/tmp/test.db"

[retention]
max_observations_per_project = 10
"#;
        let config: MementoConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.retention.max_observations_per_project, 10);
        // defaults still apply for unset fields
        assert_eq!(config.retention.max_prompts, 500);
        assert_eq!(config.search.candidate_multiplier, 2);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = MementoConfig::default();
        std::env::set_var("MEMENTO_DB", "/tmp/override.db");
        std::env::set_var("MEMENTO_VECTOR_DB", "/tmp/override-vec.db");
        std::env::set_var("MEMENTO_LOG_LEVEL", "trace");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.storage.vector_db_path, "/tmp/override-vec.db");
        assert_eq!(config.server.log_level, "trace");

        std::env::remove_var("MEMENTO_DB");
        std::env::remove_var("MEMENTO_VECTOR_DB");
        std::env::remove_var("MEMENTO_LOG_LEVEL");
    }

    #[test]
    fn expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/var/db.sqlite"), PathBuf::from("/var/db.sqlite"));
    }
}
