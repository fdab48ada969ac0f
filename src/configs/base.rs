use serde::{Deserialize, Serialize};

use crate::{common::types::AnyResult, configs::*, format::StreamParams};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub surface: SurfaceConfig,
    #[serde(default)]
    pub stream: StreamParams,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn load() -> AnyResult<Self> {
        let config_path = if std::path::Path::new("config.toml").exists() {
            "config.toml"
        } else if std::path::Path::new("config.default.toml").exists() {
            "config.default.toml"
        } else {
            return Err("config.toml or config.default.toml not found".into());
        };

        println!("Loading configuration from: {}", config_path);

        let config_str = std::fs::read_to_string(config_path)?;
        Self::from_toml(&config_str).map_err(|e| format!("{}: {}", config_path, e).into())
    }

    pub fn from_toml(source: &str) -> AnyResult<Self> {
        if source.trim().is_empty() {
            return Err("configuration is empty".into());
        }
        Ok(toml::from_str(source)?)
    }
}
