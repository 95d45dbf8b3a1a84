//! Remote transport.
//!
//! Two seams:
//! - [`RemoteShell`] runs one command on the remote host and hands back its
//!   stdin/stdout as async pipes plus a future for the exit status.
//! - [`PackageStore`] moves whole named payloads to and from the remote side.
//!
//! [`scp::ScpTransfer`] implements the store on top of any shell using the
//! scp sink/source protocol; [`ssh::SshShell`] is the shell backed by a
//! reusable ssh2 session.

pub mod scp;
pub mod ssh;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

pub use scp::ScpTransfer;
pub use ssh::SshShell;

/// A command started on the remote host
pub struct RemoteProcess {
    /// Command's stdin; shutting it down signals end-of-input
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Command's stdout; reaches EOF once the command stops writing
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Resolves to the exit status once the command has finished
    pub exit: BoxFuture<'static, Result<i32>>,
}

impl std::fmt::Debug for RemoteProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcess").finish_non_exhaustive()
    }
}

/// Runs commands on a remote host
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Start `command` on a fresh channel.
    async fn exec(&self, command: &str) -> Result<RemoteProcess>;

    /// Tear down the underlying connection, if any.
    fn close(&self) {}
}

/// Moves named payloads to and from the remote side
#[async_trait]
pub trait PackageStore: Send + Sync {
    /// Store `payload` remotely under `name`. All-or-nothing.
    async fn upload(&self, name: &str, payload: Bytes) -> Result<()>;

    /// Fetch the payload stored remotely under `name`.
    async fn download(&self, name: &str) -> Result<Bytes>;

    /// Release any held connection.
    async fn close(&self) {}
}
