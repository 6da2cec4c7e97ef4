//! Server configuration, loaded from TOML and merged with CLI flags.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level server config, loaded from TOML.
///
/// Every field is optional; CLI flags take precedence over file values and
/// built-in defaults fill the rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    /// Address for the HTTP/WebSocket listener.
    pub bind: Option<SocketAddr>,
    /// Maximum size of a single received frame, in bytes.
    pub receive_buffer_size: Option<usize>,
    /// Seconds between transport keep-alive pings.
    pub keep_alive_secs: Option<u64>,
    /// Subprotocols offered to clients, in preference order.
    #[serde(default)]
    pub subprotocols: Vec<String>,
}

impl FileConfig {
    /// Load config from a TOML file path. Returns `None` if the file
    /// doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {0}: {1}")]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("sockhub-config-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).expect("failed to write temp config");
        path
    }

    #[test]
    fn load_missing_file_returns_none() {
        let path = std::env::temp_dir().join("sockhub-config-does-not-exist.toml");
        assert!(FileConfig::load(&path).unwrap().is_none());
    }

    #[test]
    fn load_parses_all_fields() {
        let path = temp_config(
            r#"
bind = "0.0.0.0:9000"
receive_buffer_size = 8192
keep_alive_secs = 30
subprotocols = ["chat.v2", "chat.v1"]
"#,
        );
        let config = FileConfig::load(&path).unwrap().expect("config should load");
        std::fs::remove_file(&path).ok();

        assert_eq!(config.bind, Some("0.0.0.0:9000".parse().unwrap()));
        assert_eq!(config.receive_buffer_size, Some(8192));
        assert_eq!(config.keep_alive_secs, Some(30));
        assert_eq!(config.subprotocols, vec!["chat.v2", "chat.v1"]);
    }

    #[test]
    fn load_tolerates_missing_fields() {
        let path = temp_config("bind = \"127.0.0.1:1234\"\n");
        let config = FileConfig::load(&path).unwrap().expect("config should load");
        std::fs::remove_file(&path).ok();

        assert!(config.receive_buffer_size.is_none());
        assert!(config.subprotocols.is_empty());
    }

    #[test]
    fn load_rejects_invalid_toml() {
        let path = temp_config("bind = not-an-address");
        let err = FileConfig::load(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, ConfigError::ParseFailed(..)));
    }
}
