use anyhow::{Context, Result};
use casebook_engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CasebookConfig {
    pub database: Option<PathBuf>,
    pub engine: EngineConfig,
    pub completion: CompletionConfig,
}

/// External program that turns one request (JSON on stdin) into one JSON
/// object of field values on stdout.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompletionConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
}

pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = env::var("CASEBOOK_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::config_dir().map(|dir| dir.join("casebook").join("config.toml"))
}

/// A missing file is an empty config; a malformed one is an error.
pub fn load_config(path: Option<&Path>) -> Result<CasebookConfig> {
    let Some(path) = path else {
        return Ok(CasebookConfig::default());
    };
    if !path.exists() {
        return Ok(CasebookConfig::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config {}", path.display()))
}

pub fn database_path(config: &CasebookConfig, explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(path) = config.database.as_ref() {
        return path.clone();
    }
    dirs::data_dir()
        .map(|dir| dir.join("casebook").join("casebook.db"))
        .unwrap_or_else(|| PathBuf::from("casebook.db"))
}
