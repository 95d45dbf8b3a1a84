//! SSH endpoint configuration.

use crate::error::{PmError, Result};
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 22;

/// Where to connect and which credentials to use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub hostname: String,
    pub user: String,
    pub port: u16,
    /// Private key used for public-key authentication
    pub identity_file: PathBuf,
    /// OpenSSH known_hosts file used for strict host-key checking
    pub known_hosts: PathBuf,
}

impl SshConfig {
    pub fn new(
        hostname: impl Into<String>,
        user: impl Into<String>,
        identity_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            user: user.into(),
            port: DEFAULT_PORT,
            identity_file: identity_file.into(),
            known_hosts: default_known_hosts(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = path.into();
        self
    }

    /// `host:port` as dialed
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.user.trim().is_empty() {
            return Err(PmError::Config("SSH user is not set (PM_SSH_USER)".into()));
        }
        if self.hostname.trim().is_empty() {
            return Err(PmError::Config("SSH host is not set (PM_SSH_HOST)".into()));
        }
        if self.port == 0 {
            return Err(PmError::Config(
                "SSH port must be between 1 and 65535 (PM_SSH_PORT)".into(),
            ));
        }
        if self.identity_file.as_os_str().is_empty() {
            return Err(PmError::Config("SSH key is not set (PM_SSH_KEY)".into()));
        }
        Ok(())
    }
}

/// `~/.ssh/known_hosts`, or a relative `.ssh/known_hosts` when there is no
/// home directory.
pub fn default_known_hosts() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
        .join("known_hosts")
}
