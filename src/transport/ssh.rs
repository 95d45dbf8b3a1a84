//! [`RemoteShell`] backed by a shared ssh2 session.
//!
//! ssh2 channels are blocking, so each command runs in a pump on the
//! blocking pool. The pump forwards stdin from an in-memory duplex pipe
//! until EOF, then sends EOF to the remote side. Output that arrived while
//! writing is moved to the stdout pipe after every input chunk, and the rest
//! is read once input is done. Finally the pump waits for the channel to
//! close and reports the exit status.
//!
//! libssh2 only accepts as much output as its receive window holds. A
//! command that fills that window and stops reading its input before the
//! next chunk is written can still stall the pump.

use crate::error::{PmError, Result};
use crate::ssh::SshConnection;
use crate::transport::{RemoteProcess, RemoteShell};
use async_trait::async_trait;
use futures::FutureExt;
use ssh2::{ExtendedData, Session};
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::runtime::Handle;
use tracing::debug;

/// Buffer size of the in-memory pipes between the pump and the caller
const PIPE_CAPACITY: usize = 256 * 1024;

/// Chunk size used when moving data through a channel
const PUMP_CHUNK_SIZE: usize = 32 * 1024;

/// Runs commands over the session held by an [`SshConnection`]
#[derive(Clone)]
pub struct SshShell {
    connection: Arc<SshConnection>,
}

impl SshShell {
    pub fn new(connection: Arc<SshConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, command: &str) -> Result<RemoteProcess> {
        let connection = Arc::clone(&self.connection);
        let session = tokio::task::spawn_blocking(move || connection.acquire()).await??;

        let (local_stdin, remote_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (remote_stdout, local_stdout) = tokio::io::duplex(PIPE_CAPACITY);

        let command = command.to_string();
        let handle = Handle::current();
        let pump = tokio::task::spawn_blocking(move || {
            run_channel(session, &command, remote_stdin, remote_stdout, handle)
        });

        let exit = async move { pump.await? }.boxed();

        Ok(RemoteProcess {
            stdin: Box::new(local_stdin),
            stdout: Box::new(local_stdout),
            exit,
        })
    }

    fn close(&self) {
        self.connection.release();
    }
}

/// Drive one command to completion on a new channel.
///
/// Runs on the blocking pool; `handle` is used to move bytes through the
/// async pipes.
fn run_channel(
    session: Session,
    command: &str,
    mut stdin: DuplexStream,
    mut stdout: DuplexStream,
    handle: Handle,
) -> Result<i32> {
    let channel_error = |e: ssh2::Error| PmError::Channel {
        command: command.to_string(),
        source: Box::new(e),
    };

    let mut channel = session.channel_session().map_err(channel_error)?;
    // stderr is not part of the protocol; dropping it keeps the window open
    channel
        .handle_extended_data(ExtendedData::Ignore)
        .map_err(channel_error)?;
    channel.exec(command).map_err(channel_error)?;
    debug!("Started `{}`", command);

    let mut buf = vec![0u8; PUMP_CHUNK_SIZE];

    loop {
        let n = handle.block_on(stdin.read(&mut buf))?;
        if n == 0 {
            break;
        }
        if let Err(e) = channel.write_all(&buf[..n]) {
            // The command stopped reading; its exit status tells why
            debug!("Write to `{}` failed: {}", command, e);
            break;
        }
        drain_pending(&mut channel, &mut stdout, &mut buf, &handle)?;
    }
    drop(stdin);

    if let Err(e) = channel.send_eof() {
        debug!("Failed to send EOF to `{}`: {}", command, e);
    }

    loop {
        let n = channel.read(&mut buf)?;
        if n == 0 {
            break;
        }
        // Reader may have gone away; keep draining so the channel can close
        let _ = handle.block_on(stdout.write_all(&buf[..n]));
    }
    drop(stdout);

    channel.wait_close().map_err(channel_error)?;
    let status = channel.exit_status().map_err(channel_error)?;
    debug!("`{}` exited with status {}", command, status);
    Ok(status)
}

/// Forward output that already arrived without blocking on the channel.
fn drain_pending(
    channel: &mut ssh2::Channel,
    stdout: &mut DuplexStream,
    buf: &mut [u8],
    handle: &Handle,
) -> Result<()> {
    while channel.read_window().available > 0 {
        let n = channel.read(buf)?;
        if n == 0 {
            break;
        }
        let _ = handle.block_on(stdout.write_all(&buf[..n]));
    }
    Ok(())
}
