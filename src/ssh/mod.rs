//! SSH configuration and the shared connection.

pub mod config;
pub mod connection;

pub use config::SshConfig;
pub use connection::{PrivateKey, SshConnection};
