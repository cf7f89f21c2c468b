//! Configuration loading and root folder resolution
//!
//! Root folder priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`CASEFLOW_ROOT_FOLDER`, then `CASEFLOW_ROOT`)
//! 3. TOML config file (`root_folder`)
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing or unreadable TOML file is never fatal: a warning is logged and
//! compiled defaults are used.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "CASEFLOW_ROOT_FOLDER";

/// Alternative environment variable naming the root folder
pub const ROOT_ENV: &str = "CASEFLOW_ROOT";

/// Database file name inside the root folder
pub const DATABASE_FILE_NAME: &str = "caseflow.db";

/// Grouping key used when repairing persisted duplicate groups
///
/// `PerClient` groups by `(case number, client code)`, matching the uniqueness
/// rule for canonical records. `Global` groups by case number alone, so the
/// same case number filed under two clients competes for one canonical slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupScope {
    #[default]
    PerClient,
    Global,
}

impl DedupScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupScope::PerClient => "per-client",
            DedupScope::Global => "global",
        }
    }
}

impl fmt::Display for DedupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DedupScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "per-client" => Ok(DedupScope::PerClient),
            "global" => Ok(DedupScope::Global),
            other => Err(Error::Config(format!(
                "Unknown dedup scope '{}' (expected 'per-client' or 'global')",
                other
            ))),
        }
    }
}

/// Logging section of the TOML config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing filter directive (overridden by `RUST_LOG`)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Consolidation section of the TOML config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Grouping key for the in-store repair pass
    pub dedup_scope: DedupScope,
    /// Records fetched per store round trip by the projector
    pub projector_page_size: i64,
    /// Client used when none is given on the command line
    pub default_client: String,
    /// Raw source fields every imported record must preserve
    pub required_raw_fields: Vec<String>,
    /// SQLite busy timeout applied to every connection
    pub busy_timeout_ms: u64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            dedup_scope: DedupScope::PerClient,
            projector_page_size: 500,
            default_client: "IKE".to_string(),
            required_raw_fields: vec![
                "numero".to_string(),
                "cliente".to_string(),
                "fechaRegistro".to_string(),
            ],
            busy_timeout_ms: 5000,
        }
    }
}

/// Contents of `config.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TomlConfig {
    pub root_folder: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
}

impl TomlConfig {
    /// Parse a config file, failing if it is missing or malformed
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid config file {}: {}", path.display(), e)))
    }

    /// Load the config file, falling back to defaults when it is unavailable
    ///
    /// An explicit path is used as given; otherwise the platform config
    /// directory is searched. Nothing is logged here because the config
    /// decides the log level; report the returned [`ConfigOrigin`] once
    /// tracing is installed.
    pub fn load_or_default(explicit: Option<&Path>) -> (Self, ConfigOrigin) {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path(),
        };

        let Some(path) = path else {
            return (Self::default(), ConfigOrigin::NoConfigDir);
        };

        if !path.exists() {
            return (Self::default(), ConfigOrigin::Missing(path));
        }

        match Self::load(&path) {
            Ok(config) => (config, ConfigOrigin::File(path)),
            Err(e) => {
                let reason = e.to_string();
                (Self::default(), ConfigOrigin::Rejected { path, reason })
            }
        }
    }
}

/// Where [`TomlConfig::load_or_default`] took its values from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    File(PathBuf),
    /// No file at the path; compiled defaults used
    Missing(PathBuf),
    /// Platform config directory unknown; compiled defaults used
    NoConfigDir,
    /// File present but unreadable or malformed; compiled defaults used
    Rejected { path: PathBuf, reason: String },
}

impl ConfigOrigin {
    pub fn is_default(&self) -> bool {
        !matches!(self, ConfigOrigin::File(_))
    }

    /// Log the origin at info, or warn when defaults were used
    pub fn log(&self) {
        match self {
            ConfigOrigin::File(path) => info!("Loaded config from {}", path.display()),
            ConfigOrigin::Missing(path) => {
                warn!("Config file not found at {}, using compiled defaults", path.display())
            }
            ConfigOrigin::NoConfigDir => warn!("Could not determine config directory, using compiled defaults"),
            ConfigOrigin::Rejected { path, reason } => {
                warn!("Ignoring config file {}: {}", path.display(), reason)
            }
        }
    }
}

/// Get default configuration file path for the platform
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("caseflow").join("config.toml"))
}

/// OS-dependent compiled defaults
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub root_folder: PathBuf,
    pub log_level: String,
}

impl CompiledDefaults {
    pub fn for_current_platform() -> Self {
        Self {
            root_folder: default_root_folder(),
            log_level: default_log_level(),
        }
    }
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/caseflow (or /var/lib/caseflow for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("caseflow"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/caseflow"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("caseflow"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/caseflow"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("caseflow"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\caseflow"))
    } else {
        PathBuf::from("./caseflow_data")
    }
}

/// Resolves the root folder holding the database
pub struct RootFolderResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
    toml_root: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            cli_arg: None,
            toml_root: None,
        }
    }

    /// Command-line override
    pub fn with_cli_arg(mut self, cli_arg: Option<PathBuf>) -> Self {
        self.cli_arg = cli_arg;
        self
    }

    /// Root folder from an already-loaded config file
    pub fn with_config(mut self, config: &TomlConfig) -> Self {
        self.toml_root = config.root_folder.clone();
        self
    }

    pub fn resolve(&self) -> PathBuf {
        // Priority 1: Command-line argument
        if let Some(path) = &self.cli_arg {
            debug!(module = %self.module_name, "Root folder from command line");
            return path.clone();
        }

        // Priority 2: Environment variables
        for var in [ROOT_FOLDER_ENV, ROOT_ENV] {
            if let Ok(path) = std::env::var(var) {
                if !path.trim().is_empty() {
                    debug!(module = %self.module_name, var, "Root folder from environment");
                    return PathBuf::from(path);
                }
            }
        }

        // Priority 3: TOML config file
        if let Some(path) = &self.toml_root {
            debug!(module = %self.module_name, "Root folder from config file");
            return path.clone();
        }

        // Priority 4: OS-dependent compiled default
        CompiledDefaults::for_current_platform().root_folder
    }
}

/// Prepares the resolved root folder
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root_folder)?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE_NAME)
    }

    pub fn database_exists(&self) -> bool {
        self.database_path().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_scope_parse() {
        assert_eq!("per-client".parse::<DedupScope>().unwrap(), DedupScope::PerClient);
        assert_eq!("PER_CLIENT".parse::<DedupScope>().unwrap(), DedupScope::PerClient);
        assert_eq!("global".parse::<DedupScope>().unwrap(), DedupScope::Global);
        assert!("everything".parse::<DedupScope>().is_err());
    }

    #[test]
    fn test_consolidation_defaults() {
        let config = ConsolidationConfig::default();
        assert_eq!(config.dedup_scope, DedupScope::PerClient);
        assert_eq!(config.projector_page_size, 500);
        assert_eq!(config.default_client, "IKE");
        assert_eq!(config.required_raw_fields.len(), 3);
    }
}
