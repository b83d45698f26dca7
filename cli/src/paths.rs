//! Path utilities for spkexport.

use std::io;
use std::path::PathBuf;

/// Default base configuration directory name.
pub const DEFAULT_BASE_DIR: &str = ".spkexport";

/// Default configuration filename.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Provides access to the spkexport directory structure.
#[derive(Debug, Clone)]
pub struct Paths {
    /// User's home directory.
    pub home_dir: PathBuf,
}

impl Paths {
    /// Creates a new Paths instance rooted at the user's home directory.
    pub fn new() -> io::Result<Self> {
        let home_dir = dirs::home_dir().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "could not find home directory")
        })?;
        Ok(Self::with_home(home_dir))
    }

    /// Creates a Paths instance rooted at `home_dir`.
    pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
        }
    }

    /// Returns the base directory (~/.spkexport).
    pub fn base_dir(&self) -> PathBuf {
        self.home_dir.join(DEFAULT_BASE_DIR)
    }

    /// Returns the config file path (~/.spkexport/config.yaml).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir().join(DEFAULT_CONFIG_FILE)
    }
}
