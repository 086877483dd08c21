// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration management for Rotor
//!
//! Settings come from an optional TOML file. File locations can additionally
//! be overridden through environment variables; the lookup is injected so
//! nothing below `main` reads the process environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, RotorError};

/// Main configuration structure for Rotor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// File locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Secret generation settings
    #[serde(default)]
    pub generator: GeneratorConfig,

    /// haproxy patching settings
    #[serde(default)]
    pub patcher: PatcherConfig,

    /// Public address lookup settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// File locations. Unset entries are derived from `root`, `data_dir` and
/// `config_dir`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Base directory (`APP_ROOT`)
    pub root: Option<PathBuf>,
    /// Runtime data directory (`APP_DATA`)
    pub data_dir: Option<PathBuf>,
    /// Configuration directory (`APP_CFG`)
    pub config_dir: Option<PathBuf>,
    /// SQLite audit database (`SQLITE_PATH`)
    pub sqlite: Option<PathBuf>,
    /// Service-definition document (`SERVER_JSON_PATH`)
    pub server_json: Option<PathBuf>,
    /// Masquerade domain pool (`MASQ_LIST_PATH`)
    pub masquerade_pool: Option<PathBuf>,
    /// IP to domain list (`SERVER_LIST_PATH`)
    pub server_list: Option<PathBuf>,
    /// haproxy configuration (`HAP_PATH`)
    pub haproxy: Option<PathBuf>,
    /// Change-set side file (`CHANGES_PATH`)
    pub changes: Option<PathBuf>,
    /// Selected-domain side file (`DOMAIN_PATH`)
    pub selected_domains: Option<PathBuf>,
    /// Primary domain file (`DOMAIN_TXT_PATH`)
    pub domain_txt: Option<PathBuf>,
    /// Server identity record (`SERVER_CONF_JSON`)
    pub server_identity: Option<PathBuf>,
}

/// Fully resolved file locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPaths {
    pub root: PathBuf,
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub sqlite: PathBuf,
    pub server_json: PathBuf,
    pub masquerade_pool: PathBuf,
    pub server_list: PathBuf,
    pub haproxy: PathBuf,
    pub changes: PathBuf,
    pub selected_domains: PathBuf,
    pub domain_txt: PathBuf,
    pub server_identity: PathBuf,
}

impl PathsConfig {
    /// Resolve every location.
    ///
    /// Precedence for each entry is: variable returned by `lookup`, then the
    /// value from the configuration file, then the default derived from the
    /// base directories.
    pub fn resolve<F>(&self, lookup: F) -> ResolvedPaths
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |var: &str, configured: &Option<PathBuf>, default: PathBuf| -> PathBuf {
            lookup(var)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
                .or_else(|| configured.clone())
                .unwrap_or(default)
        };

        let root = pick("APP_ROOT", &self.root, PathBuf::from(DEFAULT_ROOT));
        let data_dir = pick("APP_DATA", &self.data_dir, root.join("data"));
        let config_dir = pick("APP_CFG", &self.config_dir, root.join("config"));

        ResolvedPaths {
            sqlite: pick("SQLITE_PATH", &self.sqlite, data_dir.join("bd").join("bd.db")),
            server_json: pick(
                "SERVER_JSON_PATH",
                &self.server_json,
                config_dir.join("server.json"),
            ),
            masquerade_pool: pick(
                "MASQ_LIST_PATH",
                &self.masquerade_pool,
                config_dir.join("masq_domain_list.json"),
            ),
            server_list: pick(
                "SERVER_LIST_PATH",
                &self.server_list,
                config_dir.join("serverlist.json"),
            ),
            haproxy: pick(
                "HAP_PATH",
                &self.haproxy,
                config_dir.join("haproxy").join("haproxy.cfg"),
            ),
            changes: pick("CHANGES_PATH", &self.changes, data_dir.join("changes_dict.json")),
            selected_domains: pick(
                "DOMAIN_PATH",
                &self.selected_domains,
                data_dir.join("msq_domain_list_vibork.json"),
            ),
            domain_txt: pick("DOMAIN_TXT_PATH", &self.domain_txt, data_dir.join("domain.txt")),
            server_identity: pick(
                "SERVER_CONF_JSON",
                &self.server_identity,
                data_dir.join("server_configuration.json"),
            ),
            root,
            data_dir,
            config_dir,
        }
    }
}

/// Secret generation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Length of random path and service-name tokens
    #[serde(default = "default_token_length")]
    pub token_length: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            token_length: default_token_length(),
        }
    }
}

/// haproxy patching settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatcherConfig {
    /// Literal decoy domain in haproxy.cfg replaced by the reality domain
    #[serde(default = "default_reality_placeholder")]
    pub reality_placeholder: String,

    /// Literal decoy domain in haproxy.cfg replaced by the shadow-TLS domain
    #[serde(default = "default_shadowtls_placeholder")]
    pub shadowtls_placeholder: String,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        Self {
            reality_placeholder: default_reality_placeholder(),
            shadowtls_placeholder: default_shadowtls_placeholder(),
        }
    }
}

/// Public address lookup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Endpoint answering with the caller's address as plain text
    #[serde(default = "default_ip_endpoint")]
    pub ip_endpoint: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip_endpoint: default_ip_endpoint(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(RotorError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path).map_err(|e| RotorError::io(path, e))?;
        let config: Config = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.generator.token_length < MIN_TOKEN_LENGTH {
            return Err(RotorError::invalid_config(format!(
                "generator.token_length must be at least {}, got {}",
                MIN_TOKEN_LENGTH, self.generator.token_length
            )));
        }

        if self.patcher.reality_placeholder.trim().is_empty()
            || self.patcher.shadowtls_placeholder.trim().is_empty()
        {
            return Err(RotorError::invalid_config(
                "patcher placeholders cannot be empty",
            ));
        }

        if self.patcher.reality_placeholder.trim() == self.patcher.shadowtls_placeholder.trim() {
            return Err(RotorError::invalid_config(
                "patcher placeholders must differ",
            ));
        }

        if self.network.timeout_secs == 0 {
            return Err(RotorError::invalid_config(
                "network.timeout_secs must be greater than zero",
            ));
        }

        match self.logging.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(RotorError::invalid_config(format!(
                "unknown logging.format '{}', expected 'text' or 'json'",
                other
            ))),
        }
    }
}

const DEFAULT_ROOT: &str = "/app";
const MIN_TOKEN_LENGTH: usize = 8;

// Default value functions

fn default_token_length() -> usize {
    22
}

fn default_reality_placeholder() -> String {
    "www.habbo.com".to_string()
}

fn default_shadowtls_placeholder() -> String {
    "www.shamela.ws".to_string()
}

fn default_ip_endpoint() -> String {
    "https://api.ipify.org?format=text".to_string()
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}
