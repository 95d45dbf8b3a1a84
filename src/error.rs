use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Boxed source for errors raised by third-party libraries (ssh2, zip, serde).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum PmError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read SSH key {path}: {source}")]
    KeyRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse SSH key {path}: {reason}")]
    KeyParse { path: PathBuf, reason: String },

    #[error("Failed to read known_hosts file {path}: {source}")]
    KnownHosts {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("SSH handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: BoxError,
    },

    #[error("Host key for {host} is not in known_hosts")]
    HostKeyUnknown { host: String },

    #[error("Host key for {host} does not match known_hosts (possible MITM)")]
    HostKeyMismatch { host: String },

    #[error("Public key authentication failed for {user}@{host}: {reason}")]
    Auth {
        user: String,
        host: String,
        reason: String,
    },

    #[error("Failed to open SSH channel for `{command}`: {source}")]
    Channel {
        command: String,
        #[source]
        source: BoxError,
    },

    #[error("Failed to read manifest {path}: {source}")]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Unsupported manifest format: {0:?}")]
    UnsupportedFormat(String),

    #[error("Failed to parse manifest {path}: {source}")]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("Failed to finalize archive: {source}")]
    ArchiveFinalize {
        #[source]
        source: BoxError,
    },

    #[error("Failed to open archive {name}: {source}")]
    ArchiveOpen {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("Remote command `{command}` exited with status {status}{}", fmt_remote_message(.message))]
    RemoteCommand {
        command: String,
        status: i32,
        message: Option<String>,
    },

    #[error("Protocol error transferring {name}: {reason}")]
    Protocol { name: String, reason: String },

    #[error("Pipe error transferring {name}: {source}")]
    Pipe {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn fmt_remote_message(message: &Option<String>) -> String {
    match message {
        Some(m) => format!(": {}", m),
        None => String::new(),
    }
}

impl PmError {
    /// Wrap a pipe failure with the name of the payload being moved.
    pub fn pipe(name: &str, source: io::Error) -> Self {
        PmError::Pipe {
            name: name.to_string(),
            source,
        }
    }

    pub fn protocol(name: &str, reason: impl Into<String>) -> Self {
        PmError::Protocol {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors raised before any network or file action took place.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            PmError::Config(_)
                | PmError::KeyRead { .. }
                | PmError::KeyParse { .. }
                | PmError::KnownHosts { .. }
        )
    }
}

impl From<tokio::task::JoinError> for PmError {
    fn from(e: tokio::task::JoinError) -> Self {
        PmError::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PmError>;
