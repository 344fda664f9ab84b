//! Session settings
//!
//! Where the OpenVPN binary lives, where its generated config and log go,
//! and which optional helpers are enabled. Loadable from TOML or JSON:
//!
//! ```toml
//! openvpn_binary = "/usr/sbin/openvpn"
//! config_path = "/var/run/ovpn-session/client.ovpn"
//! log_path = "/var/log/ovpn-session/openvpn.log"
//! obfsproxy = true
//! obfsproxy_start_script = "/usr/lib/ovpn-session/obfsproxy.sh"
//! extra_parameters = "mssfix 1300"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Settings for one connection object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// OpenVPN executable
    #[serde(default = "default_binary")]
    pub openvpn_binary: PathBuf,
    /// Generated client configuration file
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,
    /// OpenVPN log file (empty disables the `log` directive)
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    /// Run obfsproxy in front of OpenVPN
    #[serde(default)]
    pub obfsproxy: bool,
    /// Script that launches obfsproxy
    #[serde(default)]
    pub obfsproxy_start_script: Option<PathBuf>,
    /// User-defined OpenVPN directives appended to the config
    #[serde(default)]
    pub extra_parameters: String,
    /// DNS helper script used by the platform hooks (macOS)
    #[serde(default)]
    pub dns_script: Option<PathBuf>,
}

fn default_binary() -> PathBuf {
    PathBuf::from("openvpn")
}

fn runtime_dir() -> PathBuf {
    std::env::temp_dir().join("ovpn-session")
}

fn default_config_path() -> PathBuf {
    runtime_dir().join("client.ovpn")
}

fn default_log_path() -> PathBuf {
    runtime_dir().join("openvpn.log")
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            openvpn_binary: default_binary(),
            config_path: default_config_path(),
            log_path: default_log_path(),
            obfsproxy: false,
            obfsproxy_start_script: None,
            extra_parameters: String::new(),
            dns_script: None,
        }
    }
}

impl SessionSettings {
    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        toml::from_str(content).map_err(|e| SettingsError::ParseError(e.to_string()))
    }

    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::IoError(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        serde_json::from_str(content).map_err(|e| SettingsError::ParseError(e.to_string()))
    }

    /// Load from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::IoError(e.to_string()))?;
        Self::from_json(&content)
    }

    /// Load from a file, picking the format from its extension, and validate
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let settings = match ext {
            "toml" => Self::from_toml_file(path)?,
            "json" => Self::from_json_file(path)?,
            _ => return Err(SettingsError::UnsupportedFormat),
        };
        settings.validate()?;

        info!("Loaded session settings from {}", path.display());
        Ok(settings)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(|e| SettingsError::ParseError(e.to_string()))
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.openvpn_binary.as_os_str().is_empty() {
            return Err(SettingsError::MissingBinary);
        }
        if self.config_path.as_os_str().is_empty() {
            return Err(SettingsError::MissingConfigPath);
        }
        if self.obfsproxy && self.obfsproxy_start_script.is_none() {
            return Err(SettingsError::MissingObfsproxyScript);
        }
        Ok(())
    }

    /// Obfsproxy start script, or an empty path when none is configured
    pub fn obfsproxy_script(&self) -> &Path {
        self.obfsproxy_start_script
            .as_deref()
            .unwrap_or_else(|| Path::new(""))
    }
}

/// Settings errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unsupported settings format")]
    UnsupportedFormat,

    #[error("OpenVPN binary path is empty")]
    MissingBinary,

    #[error("Config file path is empty")]
    MissingConfigPath,

    #[error("Obfsproxy enabled without a start script")]
    MissingObfsproxyScript,
}
