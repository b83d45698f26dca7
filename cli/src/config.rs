//! Configuration management for the spkexport CLI.
//!
//! Configuration is stored in ~/.spkexport/config.yaml and holds named
//! conversion profiles:
//!
//! ```yaml
//! current_profile: cosyvoice
//! profiles:
//!   cosyvoice:
//!     expected_dim: 192
//!     verify: true
//! ```
//!
//! The file is only ever read.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use spkexport::{ErrorPolicy, ExportOptions, InputFormat};

use crate::paths::Paths;

/// CLI configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Name of the profile used when `--profile` is not given.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_profile: String,

    /// Map of profile name to conversion preset.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub profiles: HashMap<String, Profile>,

    /// Path the config was loaded from (not serialized).
    #[serde(skip)]
    config_path: PathBuf,
}

/// A conversion preset. Unset fields fall through to the next layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<InputFormat>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_dim: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_policy: Option<ErrorPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<bool>,
}

impl Config {
    /// Gets the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        Paths::new().ok().map(|p| p.config_file())
    }

    /// Returns the config file path. Empty if no file was read.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Gets a specific profile.
    pub fn get_profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// Resolves the profile by name, or the current profile if none is
    /// given. Naming a profile that does not exist is an error.
    pub fn resolve_profile(&self, name: Option<&str>) -> anyhow::Result<Option<&Profile>> {
        let name = match name {
            Some(n) if !n.is_empty() => n,
            _ if !self.current_profile.is_empty() => self.current_profile.as_str(),
            _ => return Ok(None),
        };
        match self.get_profile(name) {
            Some(p) => Ok(Some(p)),
            None => {
                let mut known = self.list_profiles();
                known.sort_unstable();
                anyhow::bail!(
                    "profile '{}' not found in {} (known: {})",
                    name,
                    self.config_path.display(),
                    if known.is_empty() { "none".to_string() } else { known.join(", ") }
                )
            }
        }
    }

    /// Lists all profile names.
    pub fn list_profiles(&self) -> Vec<&str> {
        self.profiles.keys().map(|s| s.as_str()).collect()
    }
}

impl Profile {
    /// Fills every unset field from `fallback`.
    pub fn or(&self, fallback: &Profile) -> Profile {
        Profile {
            format: self.format.or(fallback.format),
            expected_dim: self.expected_dim.or(fallback.expected_dim),
            error_policy: self.error_policy.or(fallback.error_policy),
            verify: self.verify.or(fallback.verify),
        }
    }

    /// Converts to export options, taking built-in defaults for unset fields.
    pub fn to_options(&self) -> ExportOptions {
        let defaults = ExportOptions::default();
        ExportOptions {
            format: self.format.unwrap_or(defaults.format),
            expected_dim: self.expected_dim.or(defaults.expected_dim),
            error_policy: self.error_policy.unwrap_or(defaults.error_policy),
            verify: self.verify.unwrap_or(defaults.verify),
        }
    }
}

/// Loads configuration.
///
/// With `custom_path`, the file must exist. Without it, the default path
/// is used and a missing file yields an empty config.
pub fn load_config(custom_path: Option<&str>) -> anyhow::Result<Config> {
    let (config_path, required) = match custom_path {
        Some(p) => (PathBuf::from(p), true),
        None => match Config::default_config_path() {
            Some(p) => (p, false),
            None => return Ok(Config::default()),
        },
    };

    if !config_path.exists() {
        if required {
            anyhow::bail!("config file not found: {}", config_path.display());
        }
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(&config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let mut cfg: Config = if content.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(&content)
            .with_context(|| format!("invalid config file {}", config_path.display()))?
    };
    cfg.config_path = config_path;
    Ok(cfg)
}
