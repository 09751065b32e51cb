//! Package manager configuration
//!
//! ```toml
//! unzip_to_file = true
//! temp_dir = "/var/tmp/update"
//! max_nesting_depth = 4
//! buffer_size = 65536
//! ```

use crate::error::{PkgError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default nesting limit for recursive package loads
pub const DEFAULT_MAX_NESTING_DEPTH: usize = 4;

/// Default read buffer for whole-file digests
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Settings for a [`PackageManager`](crate::manager::PackageManager)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Extract nested packages to plain files instead of memory maps
    pub unzip_to_file: bool,

    /// Directory for extracted nested packages; the package's directory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,

    /// How deep nested packages are followed
    pub max_nesting_depth: usize,

    /// Read buffer size for digests
    pub buffer_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            unzip_to_file: false,
            temp_dir: None,
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ManagerConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            PkgError::InvalidFile(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(PkgError::InvalidParam(
                "buffer_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
