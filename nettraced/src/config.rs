//! Daemon configuration: API bind host/port, CORS flag, logging level.
//! TOML, matching how the rest of this workspace's ambient stack handles
//! config files.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 10032,
            cors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads config from `path`. A missing or unparseable file silently
    /// falls back to defaults rather than failing daemon startup.
    pub fn load_file(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|err| {
                tracing::warn!(%err, path, "failed to parse config file; using defaults");
                Config::default()
            }),
            Err(_) => Config::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_file("/nonexistent/path/nettraced.toml");
        assert_eq!(config.api.port, 10032);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let dir = std::env::temp_dir();
        let path = dir.join("nettraced-test-config.toml");
        std::fs::write(&path, "[api]\nport = 9000\n").unwrap();
        let config = Config::load_file(path.to_str().unwrap());
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.api.host, "0.0.0.0");
        let _ = std::fs::remove_file(&path);
    }
}
