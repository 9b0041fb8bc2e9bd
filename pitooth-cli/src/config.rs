use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const DEFAULT_ALIAS: &str = "PiToothDevice";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_CONNECTION_WINDOW: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CliConfig {
    pub alias: String,
    pub log_level: String,
    pub obex_path: Option<PathBuf>,
    /// Seconds; non-positive means the default window.
    pub connection_window: i64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            alias: DEFAULT_ALIAS.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            obex_path: None,
            connection_window: DEFAULT_CONNECTION_WINDOW,
        }
    }
}

impl CliConfig {
    /// A missing file yields the defaults; an unreadable or malformed one is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)
                .with_context(|| format!("malformed config file {}", path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }
}
