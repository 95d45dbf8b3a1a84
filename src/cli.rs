//! Command-line interface.
//!
//! Connection settings come from flags or their `PM_SSH_*` environment
//! variables; the subcommand picks the flow and names the manifest.

use crate::ssh::config::{SshConfig, DEFAULT_PORT};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "pm")]
#[command(version, about = "Build versioned packages and move them over SSH")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Remote user
    #[arg(long, env = "PM_SSH_USER", global = true, hide_env_values = true)]
    pub user: Option<String>,

    /// Remote host
    #[arg(long, env = "PM_SSH_HOST", global = true)]
    pub host: Option<String>,

    /// Remote SSH port
    #[arg(
        long,
        env = "PM_SSH_PORT",
        global = true,
        default_value_t = DEFAULT_PORT,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub port: u16,

    /// Private key used to authenticate
    #[arg(long, env = "PM_SSH_KEY", global = true)]
    pub key: Option<PathBuf>,

    /// known_hosts file used to verify the server [default: ~/.ssh/known_hosts]
    #[arg(long, env = "PM_SSH_KNOWN_HOSTS", global = true)]
    pub known_hosts: Option<PathBuf>,

    /// Directory targets are resolved against and packages are unpacked into
    #[arg(long, global = true, default_value = ".")]
    pub workdir: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Archive the manifest's targets and upload the package
    Create {
        /// Package manifest (.json, .yaml or .yml)
        manifest: PathBuf,
    },
    /// Download and unpack every package the manifest lists
    Update {
        /// Update manifest (.json, .yaml or .yml)
        manifest: PathBuf,
    },
}

impl Cli {
    /// Connection settings; missing values surface from `SshConfig::validate`.
    pub fn ssh_config(&self) -> SshConfig {
        let mut config = SshConfig::new(
            self.host.clone().unwrap_or_default(),
            self.user.clone().unwrap_or_default(),
            self.key.clone().unwrap_or_default(),
        )
        .with_port(self.port);

        if let Some(known_hosts) = &self.known_hosts {
            config = config.with_known_hosts(known_hosts);
        }
        config
    }

    /// Default log filter when `RUST_LOG` is unset
    pub fn log_level(&self) -> &'static str {
        if self.verbose {
            "pkgship=debug,pm=debug"
        } else {
            "pkgship=info,pm=info"
        }
    }
}
