use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, Result};

pub const DEFAULT_CHANGE_TOPIC: &str = "chain";
pub const DEFAULT_TRANSACTION_TOPIC: &str = "chain-tx";
pub const DEFAULT_DEDUP_CAPACITY: usize = 128;
pub const DEFAULT_PENDING_CAPACITY: usize = 512;
pub const DEFAULT_VALUE_CACHE_SIZE: usize = 4096;

/// Process-level configuration for a replica: where the substrate lives and
/// which topics feed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub data_dir: PathBuf,
    pub brokers: Vec<String>,
    pub change_topic: String,
    pub transaction_topic: String,
    pub dedup_capacity: usize,
    pub pending_capacity: usize,
    pub value_cache_size: usize,
    pub sync_interval_secs: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./replica"),
            brokers: vec!["localhost:9092".to_string()],
            change_topic: DEFAULT_CHANGE_TOPIC.to_string(),
            transaction_topic: DEFAULT_TRANSACTION_TOPIC.to_string(),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            value_cache_size: DEFAULT_VALUE_CACHE_SIZE,
            sync_interval_secs: 30,
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = env::current_dir().map_err(|err| ArchiveError::Config(err.to_string()))?;
    path.push(".stranddb");
    path.push("config.toml");
    Ok(path)
}

/// Load the configuration, writing defaults on first run.
pub fn load_or_default(path: Option<PathBuf>) -> Result<(ReplicaConfig, PathBuf)> {
    let config_path = if let Some(path) = path {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        path
    } else {
        default_config_path()?
    };

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let config: ReplicaConfig = toml::from_str(&contents)?;
        config.ensure_data_dir()?;
        Ok((config, config_path))
    } else {
        let config = ReplicaConfig::default();
        config.ensure_data_dir()?;
        config.save(&config_path)?;
        Ok((config, config_path))
    }
}

impl ReplicaConfig {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn archive_path(&self) -> PathBuf {
        self.data_dir.join("archive")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}
