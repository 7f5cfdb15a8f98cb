//! Daemon configuration

use crate::error::DaemonError;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 7468;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address the IPC listener binds to
    pub listen: SocketAddr,
    /// Repository served by this daemon
    pub repo: PathBuf,
    /// Executable running deploy, pull-deploy, diff and update-kernel
    pub helper: PathBuf,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            repo: PathBuf::from("/var/lib/arbor/repo"),
            helper: PathBuf::from("arbor-admin-helper"),
            max_body_size: 1024 * 1024, // 1 MB
        }
    }
}

impl DaemonConfig {
    /// Load a TOML config file; missing keys keep their defaults
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, DaemonError> {
        toml::from_str(text).map_err(|e| DaemonError::Config(e.to_string()))
    }
}
