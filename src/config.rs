//! Configuration for splice-reward
//!
//! Read from TOML, by default ~/.config/splice-reward/config.toml. Every
//! section has defaults, so a missing file or section is fine.

use crate::error::ConfigurationError;
use crate::merge::CommandFormatter;
use crate::reward::RewardConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const FORMATTER_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub reward: RewardConfig,
    pub sandbox: SandboxConfig,
    pub merge: MergeConfig,
    /// Seed for candidate tie-breaking; ambient randomness when unset
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub python: String,
    /// Wall-clock limit per test case
    pub timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            timeout_secs: 5,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Formatter argv, e.g. `["black", "-q"]`
    pub formatter: Option<Vec<String>>,
}

impl MergeConfig {
    pub fn formatter(&self) -> Option<CommandFormatter> {
        let argv = self.formatter.as_ref()?;
        CommandFormatter::from_argv(argv, Duration::from_secs(FORMATTER_TIMEOUT_SECS))
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("splice-reward"))
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load config from `path`, or from the default location.
    ///
    /// An explicit path must exist and parse. The default location is
    /// optional and a corrupt file there only produces a warning.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            return Self::from_toml(&content)
                .with_context(|| format!("Failed to parse config {}", path.display()));
        }

        let Some(path) = Self::default_path() else {
            return Ok(Self::default());
        };
        let Ok(content) = fs::read_to_string(&path) else {
            return Ok(Self::default());
        };
        match Self::from_toml(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                eprintln!(
                    "  Warning: Config file {} is invalid ({}). Defaults were loaded.",
                    path.display(),
                    err
                );
                Ok(Self::default())
            }
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.reward.validate()?;
        if self.sandbox.timeout_secs == 0 {
            return Err(ConfigurationError::InvalidConfig(
                "sandbox.timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.sandbox.python.trim().is_empty() {
            return Err(ConfigurationError::InvalidConfig(
                "sandbox.python must name an interpreter".to_string(),
            ));
        }
        if matches!(&self.merge.formatter, Some(argv) if argv.is_empty()) {
            return Err(ConfigurationError::InvalidConfig(
                "merge.formatter must not be an empty command".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reward::BalanceStrategy;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sandbox.python, "python3");
        assert_eq!(config.sandbox.timeout(), Duration::from_secs(5));
        assert_eq!(config.reward.balance_strategy, BalanceStrategy::Quadratic);
        assert!(config.merge.formatter().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = Config::from_toml(
            "seed = 7\n\n[reward]\nbalance_strategy = \"msd\"\n\n[merge]\nformatter = [\"black\", \"-q\"]\n",
        )
        .unwrap();
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.reward.balance_strategy, BalanceStrategy::Msd);
        assert_eq!(config.reward.tests_max, 4.0);
        assert_eq!(config.sandbox.timeout_secs, 5);
        let formatter = config.merge.formatter().unwrap();
        assert_eq!(formatter.program, "black");
        assert_eq!(formatter.args, vec!["-q".to_string()]);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Config::from_toml("[sandbox]\ntimeout_secs = 0\n").is_err());
        assert!(Config::from_toml("[reward]\ncomponents_max = -1.0\n").is_err());
        assert!(Config::from_toml("[merge]\nformatter = []\n").is_err());
        assert!(Config::from_toml("[reward\n").is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sandbox]\ntimeout_secs = 9").unwrap();
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.sandbox.timeout_secs, 9);

        let missing = file.path().with_extension("missing");
        assert!(Config::load(Some(&missing)).is_err());
    }
}
