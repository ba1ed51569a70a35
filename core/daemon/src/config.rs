//! Daemon configuration (`~/.botfleet/config.toml`).
//!
//! Every field has a default, so a missing file or a partial file is valid.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FleetError, Result};

pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 10;
const CONFIG_RELATIVE_PATH: &str = ".botfleet/config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval_secs(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_java")]
    pub java: String,
    #[serde(default = "default_client_jar")]
    pub client_jar: PathBuf,
    #[serde(default = "default_world")]
    pub world: String,
    #[serde(default = "default_extra_flags")]
    pub extra_flags: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            java: default_java(),
            client_jar: default_client_jar(),
            world: default_world(),
            extra_flags: default_extra_flags(),
        }
    }
}

fn default_monitor_interval_secs() -> u64 {
    DEFAULT_MONITOR_INTERVAL_SECS
}

fn default_java() -> String {
    "java".to_string()
}

fn default_client_jar() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join("DreamBot")
        .join("BotData")
        .join("client.jar")
}

fn default_world() -> String {
    "f2p".to_string()
}

fn default_extra_flags() -> Vec<String> {
    vec!["-covert".to_string(), "-fresh".to_string()]
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_RELATIVE_PATH))
}

pub fn load_config(path: Option<PathBuf>) -> Result<FleetConfig> {
    let config_path = match path.or_else(default_config_path) {
        Some(path) => path,
        None => return Ok(FleetConfig::default()),
    };

    if !config_path.exists() {
        return Ok(FleetConfig::default());
    }

    let content = fs_err::read_to_string(&config_path)
        .map_err(|err| FleetError::io("Failed to read fleet config", err))?;
    parse_config(&config_path, &content)
}

fn parse_config(path: &Path, content: &str) -> Result<FleetConfig> {
    let mut config = toml::from_str::<FleetConfig>(content).map_err(|err| FleetError::Config {
        path: path.to_path_buf(),
        details: err.to_string(),
    })?;
    config.client.client_jar = expand_home(&config.client.client_jar);
    Ok(config)
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(Some(temp_dir.path().join("absent.toml"))).expect("load");
        assert_eq!(config.monitor.interval_secs, DEFAULT_MONITOR_INTERVAL_SECS);
        assert_eq!(config.client.world, "f2p");
        assert_eq!(config.client.extra_flags, vec!["-covert", "-fresh"]);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = parse_config(
            Path::new("config.toml"),
            "[monitor]\ninterval_secs = 3\n\n[client]\nworld = \"members\"\n",
        )
        .expect("parse");
        assert_eq!(config.monitor.interval(), Duration::from_secs(3));
        assert_eq!(config.client.world, "members");
        assert_eq!(config.client.java, "java");
    }

    #[test]
    fn zero_interval_is_clamped() {
        let config =
            parse_config(Path::new("config.toml"), "[monitor]\ninterval_secs = 0\n").expect("parse");
        assert_eq!(config.monitor.interval(), Duration::from_secs(1));
    }

    #[test]
    fn malformed_file_is_config_error() {
        let err = parse_config(Path::new("config.toml"), "[monitor\n").expect_err("malformed");
        assert!(matches!(err, FleetError::Config { .. }));
    }

    #[test]
    fn tilde_jar_path_is_expanded() {
        let config = parse_config(
            Path::new("config.toml"),
            "[client]\nclient_jar = \"~/bots/client.jar\"\n",
        )
        .expect("parse");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.client.client_jar, home.join("bots/client.jar"));
        }
    }
}
