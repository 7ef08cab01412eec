//! Configuration for Multi Talk, read from `.multitalk/multitalk.toml`.
//!
//! Values are layered: defaults, then the file, then environment variables
//! (`MULTITALK_DB_PATH`, `MULTITALK_PORT`, optionally from a `.env` file),
//! then CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! dev_mode = false
//!
//! [database]
//! path = ".multitalk/leads.db"
//!
//! [pipeline]
//! request_timeout_secs = 10
//! reload_after_transition = false
//!
//! [currency]
//! code = "BRL"
//! decimal_separator = ","
//!
//! [logging]
//! json = false
//! dir = ".multitalk/logs"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crm::controller::PipelineSettings;
use crate::crm::validation::CurrencyFormat;

pub const CONFIG_DIR: &str = ".multitalk";
pub const CONFIG_FILE: &str = "multitalk.toml";

pub const ENV_DB_PATH: &str = "MULTITALK_DB_PATH";
pub const ENV_PORT: &str = "MULTITALK_PORT";

/// Directory holding the config file and, by default, the database.
pub fn config_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_DIR)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for a locally served front end.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// Relative paths are resolved against the project directory.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("leads.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub reload_after_transition: bool,
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            reload_after_transition: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub json: bool,
    /// Write daily-rolling log files here instead of stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// The complete multitalk.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultitalkToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub currency: CurrencyFormat,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl MultitalkToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse multitalk.toml")
    }

    /// Load from `<config_dir>/multitalk.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize multitalk.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `MULTITALK_DB_PATH` and `MULTITALK_PORT` from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup(ENV_DB_PATH).filter(|p| !p.trim().is_empty()) {
            self.database.path = PathBuf::from(path.trim());
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid {} value '{}'", ENV_PORT, port))?;
        }
        Ok(())
    }

    /// Database path, resolved against `project_dir` when relative.
    pub fn database_path(&self, project_dir: &Path) -> PathBuf {
        resolve(project_dir, &self.database.path)
    }

    pub fn log_dir(&self, project_dir: &Path) -> Option<PathBuf> {
        self.logging.dir.as_ref().map(|dir| resolve(project_dir, dir))
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            request_timeout: Duration::from_secs(self.pipeline.request_timeout_secs),
            reload_after_transition: self.pipeline.reload_after_transition,
            currency: self.currency.clone(),
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.host.trim().is_empty() {
            warnings.push("server.host is empty".to_string());
        }
        if self.server.port == 0 {
            warnings.push("server.port is 0; the OS will pick a random port".to_string());
        }
        if self.database.path.as_os_str().is_empty() {
            warnings.push("database.path is empty".to_string());
        }
        if self.pipeline.request_timeout_secs == 0 {
            warnings.push(
                "pipeline.request_timeout_secs is 0; every store request will time out".to_string(),
            );
        } else if self.pipeline.request_timeout_secs > 300 {
            warnings.push(format!(
                "pipeline.request_timeout_secs is {}; failed stage changes will take that long to revert",
                self.pipeline.request_timeout_secs
            ));
        }

        let code = &self.currency.code;
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_uppercase()) {
            warnings.push(format!(
                "currency.code '{}' is not a three-letter ISO code",
                code
            ));
        }
        let sep = self.currency.decimal_separator;
        if sep.is_ascii_digit() || sep == '-' {
            warnings.push(format!("currency.decimal_separator '{}' is not usable", sep));
        }

        warnings
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
