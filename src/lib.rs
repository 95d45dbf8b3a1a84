//! pkgship: build versioned zip packages from a manifest and move them to and
//! from a remote host over SSH using the scp protocol.

pub mod archive;
pub mod cli;
pub mod error;
pub mod manager;
pub mod manifest;
pub mod ssh;
pub mod transport;

pub use archive::{ArchiveBuilder, ArchiveExtractor};
pub use error::{PmError, Result};
pub use manager::{CreateReport, PackageManager, PackageOutcome, PackageStatus, UpdateReport};
pub use manifest::{CreateManifest, PackageRef, Target, UpdateManifest};
pub use ssh::{SshConfig, SshConnection};
pub use transport::{PackageStore, RemoteShell, ScpTransfer, SshShell};
