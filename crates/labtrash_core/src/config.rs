//! Runtime configuration.
//!
//! # Responsibility
//! - Load `Config` from an optional TOML file.
//! - Apply `LABTRASH_*` environment overrides on top of file values.
//!
//! # Invariants
//! - Missing keys fall back to defaults; unknown keys are rejected.
//! - Invalid override values are ignored with a warning, never fatal.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_DATABASE: &str = "LABTRASH_DB";
pub const ENV_LOG_LEVEL: &str = "LABTRASH_LOG_LEVEL";
pub const ENV_LOG_DIR: &str = "LABTRASH_LOG_DIR";
pub const ENV_BUSY_TIMEOUT_MS: &str = "LABTRASH_BUSY_TIMEOUT_MS";

const DEFAULT_DATABASE_PATH: &str = "labtrash.db";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Process configuration shared by the library and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database_path: PathBuf,
    pub log_level: String,
    /// Rolling log directory. Logging stays off when unset.
    pub log_dir: Option<PathBuf>,
    pub busy_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            log_level: crate::logging::default_log_level().to_string(),
            log_dir: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl Config {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Configuration loading failure.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            Self::Parse { path, source } => {
                write!(f, "failed to parse {}: {source}", path.display())
            }
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
        }
    }
}

/// Reads one TOML config file without applying overrides.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("event=config_load module=config status=ok source=file");
    Ok(config)
}

/// Loads `path` when given (defaults otherwise) and applies environment
/// overrides.
pub fn load_config_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Applies overrides resolved through `lookup`; blank values are ignored.
pub fn apply_overrides_from<F>(config: &mut Config, mut lookup: F)
where
    F: FnMut(&str) -> Option<String>,
{
    let mut value_of = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };

    if let Some(path) = value_of(ENV_DATABASE) {
        config.database_path = PathBuf::from(path);
    }
    if let Some(level) = value_of(ENV_LOG_LEVEL) {
        config.log_level = level;
    }
    if let Some(dir) = value_of(ENV_LOG_DIR) {
        config.log_dir = Some(PathBuf::from(dir));
    }
    if let Some(raw) = value_of(ENV_BUSY_TIMEOUT_MS) {
        match raw.parse::<u64>() {
            Ok(value) => config.busy_timeout_ms = value,
            Err(err) => warn!(
                "event=config_override module=config status=error key={ENV_BUSY_TIMEOUT_MS} error={err}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        apply_overrides_from, load_config, load_config_or_default, Config, ConfigError,
        ENV_BUSY_TIMEOUT_MS, ENV_DATABASE, ENV_LOG_DIR,
    };
    use std::collections::HashMap;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn missing_keys_take_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "database_path = \"/var/lib/labtrash/store.db\"").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/var/lib/labtrash/store.db"));
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
        assert_eq!(config.log_dir, None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "database = \"x.db\"").unwrap();

        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config_or_default(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn overrides_replace_file_values_and_skip_bad_numbers() {
        let env = HashMap::from([
            (ENV_DATABASE, " /tmp/override.db "),
            (ENV_LOG_DIR, ""),
            (ENV_BUSY_TIMEOUT_MS, "soon"),
        ]);
        let mut config = Config::default();
        apply_overrides_from(&mut config, |key| env.get(key).map(|value| value.to_string()));

        assert_eq!(config.database_path, PathBuf::from("/tmp/override.db"));
        assert_eq!(config.log_dir, None);
        assert_eq!(config.busy_timeout_ms, 5_000);
    }

    #[test]
    fn busy_timeout_override_parses() {
        let mut config = Config::default();
        apply_overrides_from(&mut config, |key| {
            (key == ENV_BUSY_TIMEOUT_MS).then(|| "250".to_string())
        });
        assert_eq!(config.busy_timeout(), Duration::from_millis(250));
    }
}
