//! Data directory resolution.
//!
//! Resolved once at startup from: CLI `--data-dir` > `CHATSYNC_DATA_DIR` env > `~/.chatsync`.
//! The engine itself persists nothing; the directory only holds the
//! optional `config.toml` and log files.

use std::io;
use std::path::{Path, PathBuf};

use crate::error::SyncError;

pub const DATA_DIR_ENV: &str = "CHATSYNC_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Priority: `explicit` arg > `CHATSYNC_DATA_DIR` env > `~/.chatsync` default.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, SyncError> {
        let root = if let Some(p) = explicit {
            p.to_path_buf()
        } else if let Ok(env_val) = std::env::var(DATA_DIR_ENV) {
            PathBuf::from(env_val)
        } else {
            dirs::home_dir()
                .ok_or_else(|| SyncError::Config("HOME directory not found".into()))?
                .join(".chatsync")
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Create all required subdirectories under the data dir.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}
