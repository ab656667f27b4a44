//! Configuration for the torrxfer client and server.
//!
//! The client is configured from a JSON file:
//!
//! ```json
//! {
//!   "Servers": [{"Address": "nas.local", "Port": 9650, "Secure": true, "CertFile": "nas.pem"}],
//!   "WatchedDirectories": [{"Directory": "/downloads/complete", "MediaRoot": "/downloads"}],
//!   "DeleteFileOnComplete": false
//! }
//! ```
//!
//! The server is configured from the environment with the
//! `TORRXFER_SERVER_` prefix: `ADDRESS`, `PORT`, `MEDIADIR`, `LOGFILE`,
//! `CERTFILE`, `KEYFILE`, `DBDIR`, `DEBUG`, `TRACE`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{DEFAULT_ADDRESS, DEFAULT_PORT};

/// One remote server entry in the client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Server host name or IP
    #[serde(rename = "Address")]
    pub address: String,
    /// Server port
    #[serde(rename = "Port", default = "default_port")]
    pub port: u16,
    /// Connect over TLS
    #[serde(rename = "Secure", default)]
    pub secure: bool,
    /// PEM certificate to pin when `Secure` is set
    #[serde(rename = "CertFile", default)]
    pub cert_file: Option<PathBuf>,
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

/// One watched directory entry in the client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedDirectory {
    /// Directory to watch recursively
    #[serde(rename = "Directory")]
    pub directory: PathBuf,
    /// Media root whose sub-path is preserved on the server. Must be an
    /// ancestor of `Directory`.
    #[serde(rename = "MediaRoot")]
    pub media_root: PathBuf,
}

/// Client configuration, parsed from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Servers to transfer to
    #[serde(rename = "Servers")]
    pub servers: Vec<ServerEntry>,
    /// Directories to watch
    #[serde(rename = "WatchedDirectories")]
    pub watched_directories: Vec<WatchedDirectory>,
    /// Remove the local file once every server reports completion
    #[serde(rename = "DeleteFileOnComplete", default)]
    pub delete_on_complete: bool,
}

impl ClientConfig {
    /// Parse a configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::ConfigError(format!("invalid config: {e}")))
    }

    /// Read and parse a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&data)
    }
}

/// Server configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address
    pub address: String,
    /// Bind port
    pub port: u16,
    /// Root directory that received files are written beneath
    pub media_dir: PathBuf,
    /// Log file path, empty for stderr
    pub log_file: Option<PathBuf>,
    /// PEM certificate for TLS; TLS is enabled when both this and
    /// `key_file` are set
    pub cert_file: Option<PathBuf>,
    /// PEM private key for TLS
    pub key_file: Option<PathBuf>,
    /// Directory for the progress database, temp dir when unset
    pub db_dir: Option<PathBuf>,
    /// Debug-level logging
    pub debug: bool,
    /// Trace-level logging
    pub trace: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            media_dir: PathBuf::from("."),
            log_file: None,
            cert_file: None,
            key_file: None,
            db_dir: None,
            debug: false,
            trace: false,
        }
    }
}

const ENV_PREFIX: &str = "TORRXFER_SERVER_";

impl ServerConfig {
    /// Build a configuration from `TORRXFER_SERVER_*` environment variables,
    /// falling back to defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns an error if a set variable fails to parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(address) = env_var("ADDRESS") {
            config.address = address;
        }
        if let Some(port) = env_var("PORT") {
            config.port = port
                .parse()
                .map_err(|e| Error::ConfigError(format!("invalid {ENV_PREFIX}PORT: {e}")))?;
        }
        if let Some(dir) = env_var("MEDIADIR") {
            config.media_dir = PathBuf::from(dir);
        }
        config.log_file = env_var("LOGFILE").map(PathBuf::from);
        config.cert_file = env_var("CERTFILE").map(PathBuf::from);
        config.key_file = env_var("KEYFILE").map(PathBuf::from);
        config.db_dir = env_var("DBDIR").map(PathBuf::from);
        if let Some(debug) = env_var("DEBUG") {
            config.debug = parse_bool("DEBUG", &debug)?;
        }
        if let Some(trace) = env_var("TRACE") {
            config.trace = parse_bool("TRACE", &trace)?;
        }

        Ok(config)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|v| !v.is_empty())
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(Error::ConfigError(format!(
            "invalid {ENV_PREFIX}{name}: '{other}' is not a boolean"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_client_config() {
        let json = r#"{
            "Servers": [
                {"Address": "nas.local", "Port": 9650, "Secure": true, "CertFile": "/etc/torrxfer/nas.pem"},
                {"Address": "127.0.0.1", "Port": 9700}
            ],
            "WatchedDirectories": [
                {"Directory": "/downloads/complete/tv", "MediaRoot": "/downloads/complete"}
            ],
            "DeleteFileOnComplete": true
        }"#;

        let config = ClientConfig::from_json(json).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].address, "nas.local");
        assert!(config.servers[0].secure);
        assert!(!config.servers[1].secure);
        assert_eq!(config.servers[1].port, 9700);
        assert_eq!(config.watched_directories.len(), 1);
        assert!(config.delete_on_complete);
    }

    #[test]
    fn delete_flag_defaults_off() {
        let json = r#"{
            "Servers": [{"Address": "localhost"}],
            "WatchedDirectories": []
        }"#;
        let config = ClientConfig::from_json(json).unwrap();
        assert!(!config.delete_on_complete);
        assert_eq!(config.servers[0].port, DEFAULT_PORT);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(ClientConfig::from_json("{not json").is_err());
    }

    #[test]
    fn bool_parsing() {
        assert!(parse_bool("DEBUG", "true").unwrap());
        assert!(parse_bool("DEBUG", "1").unwrap());
        assert!(!parse_bool("DEBUG", "no").unwrap());
        assert!(parse_bool("DEBUG", "maybe").is_err());
    }

    #[test]
    fn server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.address, "localhost");
        assert_eq!(config.port, 9650);
        assert_eq!(config.media_dir, PathBuf::from("."));
        assert!(!config.debug);
    }
}
