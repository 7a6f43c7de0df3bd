use serde::Deserialize;

use crate::error::Result;
use crate::persist::PersistenceMode;
use crate::request::Limits;

/// Default file looked up when no configuration path is given. The extension
/// is left to the `config` crate, so `lexbulk.toml`, `lexbulk.yaml` etc. work.
pub const DEFAULT_CONFIG_NAME: &str = "lexbulk";
pub const ENV_PREFIX: &str = "LEXBULK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    pub mode: StoreMode,
    /// SQLite file; an in-memory database when absent.
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "127.0.0.1:8088".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads used while applying actions.
    pub concurrency: usize,
    pub max_condition_depth: usize,
    /// Upper bound on leaf actions in one request, pipelines included.
    pub max_actions: usize,
    /// Largest list index an action may write to.
    pub max_list_index: usize,
    pub log_level: String,
    pub server: ServerConfig,
    pub store: StoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_condition_depth: 32,
            max_actions: 256,
            max_list_index: 1024,
            log_level: "info".into(),
            server: ServerConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Layers the environment (`LEXBULK_CONCURRENCY`, `LEXBULK_SERVER__BIND`,
    /// ...) over an optional file. A file named explicitly must exist.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path.unwrap_or(DEFAULT_CONFIG_NAME)).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_condition_depth: self.max_condition_depth,
            max_actions: self.max_actions,
            max_list_index: self.max_list_index,
        }
    }

    pub fn persistence_mode(&self) -> PersistenceMode {
        match &self.store.path {
            Some(path) => PersistenceMode::File(path.clone()),
            None => PersistenceMode::InMemory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_override_defaults() {
        let path = "test_lexbulk_config.toml";
        std::fs::write(
            path,
            "concurrency = 4\nmax_list_index = 64\n[store]\nmode = \"sqlite\"\npath = \"entries.db\"\n",
        )
        .unwrap();
        let loaded = EngineConfig::load(Some(path));
        let _ = std::fs::remove_file(path);
        let config = loaded.unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_condition_depth, 32);
        assert_eq!(config.limits().max_list_index, 64);
        assert_eq!(config.store.mode, StoreMode::Sqlite);
        assert_eq!(config.persistence_mode(), PersistenceMode::File("entries.db".into()));
        assert_eq!(config.server, ServerConfig::default());
    }

    #[test]
    fn default_limits_agree() {
        assert_eq!(EngineConfig::default().limits(), Limits::default());
    }

    #[test]
    fn named_file_must_exist() {
        assert!(EngineConfig::load(Some("no_such_lexbulk_config.toml")).is_err());
    }
}
