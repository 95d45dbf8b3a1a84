//! scp sink/source protocol over a [`RemoteShell`].
//!
//! Push runs `scp -t .` (sink) and feeds it:
//!
//! ```text
//! C0644 <length> <name>\n
//! <length raw bytes>
//! \0
//! ```
//!
//! Pull runs `scp -f <name>` (source), acknowledges each step with a NUL and
//! decodes the same framing from the command's output.
//!
//! In both directions stdin is fed from one task while stdout is drained by
//! another, and the exit status is awaited separately, so a remote command
//! that writes while we are still writing cannot stall either side.

use crate::error::{PmError, Result};
use crate::transport::{PackageStore, RemoteProcess, RemoteShell};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Mode announced in the control line
pub const FILE_MODE: &str = "0644";

/// Terminates a pushed payload; also the "ok" acknowledgement byte
pub const END_MARKER: u8 = 0x00;

/// Leading byte of a warning line from the remote scp
const REMOTE_WARNING: u8 = 0x01;

/// Leading byte of a fatal error line from the remote scp
const REMOTE_FATAL: u8 = 0x02;

/// Remote directory packages are pushed to
pub const REMOTE_DIR: &str = ".";

/// Acknowledgements a source expects: before the header, before the data,
/// and after its trailing status byte.
const SOURCE_ACKS: [u8; 3] = [END_MARKER; 3];

/// Format the header sent ahead of a pushed payload.
pub fn control_line(name: &str, length: u64) -> String {
    format!("C{} {} {}\n", FILE_MODE, length, name)
}

/// Parsed `C<mode> <length> <name>` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlLine {
    pub mode: u32,
    pub length: u64,
    pub name: String,
}

impl ControlLine {
    /// Parse a header line without its trailing newline.
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix('C')?;
        let mut parts = rest.splitn(3, ' ');
        let mode = parts.next()?;
        let length = parts.next()?;
        let name = parts.next()?;

        if mode.len() != 4 || name.is_empty() {
            return None;
        }

        Some(Self {
            mode: u32::from_str_radix(mode, 8).ok()?,
            length: length.parse().ok()?,
            name: name.to_string(),
        })
    }
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Extract the first warning/error line the remote scp wrote, if any.
pub fn remote_message(output: &[u8]) -> Option<String> {
    let start = output
        .iter()
        .position(|&b| b == REMOTE_WARNING || b == REMOTE_FATAL)?;
    let line = &output[start + 1..];
    let end = line.iter().position(|&b| b == b'\n').unwrap_or(line.len());
    let message = String::from_utf8_lossy(&line[..end]).trim().to_string();
    Some(message)
}

/// Decode the payload a source sent for `name`.
pub fn decode_payload(name: &str, output: Bytes) -> Result<Bytes> {
    let mut pos = 0;

    loop {
        match output.get(pos) {
            None => return Err(PmError::protocol(name, "remote sent no file header")),
            Some(&REMOTE_WARNING) | Some(&REMOTE_FATAL) => {
                let message = remote_message(&output[pos..]).unwrap_or_default();
                return Err(PmError::protocol(name, format!("remote error: {}", message)));
            }
            // Timestamps are only sent with -p; skip them if present
            Some(&b'T') => {
                let end = find_newline(&output, pos)
                    .ok_or_else(|| PmError::protocol(name, "truncated time header"))?;
                pos = end + 1;
            }
            Some(&b'C') => break,
            Some(other) => {
                return Err(PmError::protocol(
                    name,
                    format!("unexpected header byte 0x{:02x}", other),
                ))
            }
        }
    }

    let end = find_newline(&output, pos)
        .ok_or_else(|| PmError::protocol(name, "truncated file header"))?;
    let line = String::from_utf8_lossy(&output[pos..end]);
    let header = ControlLine::parse(&line)
        .ok_or_else(|| PmError::protocol(name, format!("malformed file header {:?}", line)))?;
    debug!("Remote header for {}: {:?}", name, header);

    let start = end + 1;
    let length = usize::try_from(header.length)
        .map_err(|_| PmError::protocol(name, "announced length too large"))?;
    let data_end = start
        .checked_add(length)
        .ok_or_else(|| PmError::protocol(name, "announced length too large"))?;

    if output.len() < data_end {
        return Err(PmError::protocol(
            name,
            format!(
                "payload truncated: expected {} bytes, got {}",
                length,
                output.len() - start
            ),
        ));
    }

    match output.get(data_end) {
        Some(&END_MARKER) => Ok(output.slice(start..data_end)),
        Some(&REMOTE_WARNING) | Some(&REMOTE_FATAL) => {
            let message = remote_message(&output[data_end..]).unwrap_or_default();
            Err(PmError::protocol(name, format!("remote error: {}", message)))
        }
        Some(other) => Err(PmError::protocol(
            name,
            format!("bad end marker 0x{:02x}", other),
        )),
        None => Err(PmError::protocol(name, "missing end marker")),
    }
}

fn find_newline(data: &[u8], from: usize) -> Option<usize> {
    data[from..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| from + i)
}

async fn drain(mut stdout: Box<dyn AsyncRead + Send + Unpin>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    stdout.read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn write_payload<R>(
    mut stdin: Box<dyn AsyncWrite + Send + Unpin>,
    header: String,
    payload: R,
    length: u64,
) -> io::Result<u64>
where
    R: AsyncRead + Send + Unpin,
{
    stdin.write_all(header.as_bytes()).await?;

    let mut limited = payload.take(length);
    let copied = tokio::io::copy(&mut limited, &mut stdin).await?;
    if copied != length {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("payload ended after {} of {} bytes", copied, length),
        ));
    }

    stdin.write_all(&[END_MARKER]).await?;
    stdin.shutdown().await?;
    Ok(copied)
}

/// scp-based transfer engine
pub struct ScpTransfer<S> {
    shell: S,
}

impl<S: RemoteShell> ScpTransfer<S> {
    pub fn new(shell: S) -> Self {
        Self { shell }
    }

    pub fn shell(&self) -> &S {
        &self.shell
    }

    /// Stream exactly `length` bytes of `payload` to the remote directory as
    /// `name`.
    pub async fn push<R>(&self, name: &str, payload: R, length: u64) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        if name.is_empty() || name.contains('/') || name.contains('\n') {
            return Err(PmError::protocol(name, "invalid remote file name"));
        }

        let command = format!("scp -t {}", REMOTE_DIR);
        debug!("Starting `{}` for {} ({} bytes)", command, name, length);

        let RemoteProcess {
            stdin,
            stdout,
            exit,
        } = self.shell.exec(&command).await?;

        let writer = tokio::spawn(write_payload(
            stdin,
            control_line(name, length),
            payload,
            length,
        ));
        let reader = tokio::spawn(drain(stdout));

        let status = match exit.await {
            Ok(status) => status,
            Err(e) => {
                writer.abort();
                reader.abort();
                return Err(e);
            }
        };

        let written = writer.await?;
        let output = reader.await?;

        if status != 0 {
            let message = output.as_deref().ok().and_then(remote_message);
            return Err(PmError::RemoteCommand {
                command,
                status,
                message,
            });
        }

        let written = written.map_err(|e| PmError::pipe(name, e))?;
        let output = output.map_err(|e| PmError::pipe(name, e))?;
        if let Some(message) = remote_message(&output) {
            return Err(PmError::protocol(name, format!("remote error: {}", message)));
        }

        info!("Uploaded {} ({} bytes)", name, written);
        Ok(())
    }

    /// Fetch the remote file `name` into memory.
    pub async fn pull(&self, name: &str) -> Result<Bytes> {
        if name.is_empty() || name.contains('\n') {
            return Err(PmError::protocol(name, "invalid remote file name"));
        }

        let command = format!("scp -f {}", shell_quote(name));
        debug!("Starting `{}`", command);

        let RemoteProcess {
            mut stdin,
            stdout,
            exit,
        } = self.shell.exec(&command).await?;

        let reader = tokio::spawn(drain(stdout));

        // The acks fit in any pipe buffer, so queue them all up front and
        // close stdin; the source consumes one per step.
        let acked = async {
            stdin.write_all(&SOURCE_ACKS).await?;
            stdin.shutdown().await
        }
        .await;
        drop(stdin);
        if let Err(e) = &acked {
            debug!("Failed to queue acknowledgements for {}: {}", name, e);
        }

        let status = match exit.await {
            Ok(status) => status,
            Err(e) => {
                reader.abort();
                return Err(e);
            }
        };
        let output = reader.await?;

        if status != 0 {
            let message = output.as_deref().ok().and_then(remote_message);
            return Err(PmError::RemoteCommand {
                command,
                status,
                message,
            });
        }

        let output = output.map_err(|e| PmError::pipe(name, e))?;
        let payload = decode_payload(name, Bytes::from(output))?;

        info!("Downloaded {} ({} bytes)", name, payload.len());
        Ok(payload)
    }
}

#[async_trait]
impl<S: RemoteShell> PackageStore for ScpTransfer<S> {
    async fn upload(&self, name: &str, payload: Bytes) -> Result<()> {
        let length = payload.len() as u64;
        self.push(name, io::Cursor::new(payload), length).await
    }

    async fn download(&self, name: &str) -> Result<Bytes> {
        self.pull(name).await
    }

    async fn close(&self) {
        self.shell.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_line() {
        assert_eq!(control_line("x.zip", 5), "C0644 5 x.zip\n");
        assert_eq!(control_line("app-.zip", 0), "C0644 0 app-.zip\n");
    }

    #[test]
    fn test_parse_control_line() {
        assert_eq!(
            ControlLine::parse("C0644 5 x.zip"),
            Some(ControlLine {
                mode: 0o644,
                length: 5,
                name: "x.zip".to_string()
            })
        );
        assert_eq!(
            ControlLine::parse("C0755 12 name with spaces.zip").map(|c| c.name),
            Some("name with spaces.zip".to_string())
        );
        assert_eq!(ControlLine::parse("D0755 0 dir"), None);
        assert_eq!(ControlLine::parse("C644 5 x.zip"), None);
        assert_eq!(ControlLine::parse("C0644 five x.zip"), None);
        assert_eq!(ControlLine::parse("C0644 5"), None);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("app-1.0.zip"), "'app-1.0.zip'");
        assert_eq!(shell_quote("it's.zip"), "'it'\\''s.zip'");
    }

    #[test]
    fn test_remote_message() {
        assert_eq!(
            remote_message(b"\x01scp: x.zip: No such file or directory\n"),
            Some("scp: x.zip: No such file or directory".to_string())
        );
        assert_eq!(remote_message(b"\0\0\0"), None);
    }

    #[test]
    fn test_decode_payload() {
        let output = Bytes::from_static(b"C0644 5 x.zip\nhello\0");
        assert_eq!(decode_payload("x.zip", output).unwrap(), "hello");

        let output = Bytes::from_static(b"T1700000000 0 1700000000 0\nC0644 2 x.zip\nhi\0");
        assert_eq!(decode_payload("x.zip", output).unwrap(), "hi");

        // Payload may itself contain NULs and newlines
        let output = Bytes::from_static(b"C0644 3 x.zip\n\0\n\0\0");
        assert_eq!(decode_payload("x.zip", output).unwrap(), &b"\0\n\0"[..]);
    }

    #[test]
    fn test_decode_payload_errors() {
        let cases: &[&[u8]] = &[
            b"",
            b"\x01scp: x.zip: No such file or directory\n",
            b"C0644 10 x.zip\nshort\0",
            b"C0644 5 x.zip\nhello",
            b"C0644 5 x.zip\nhelloX",
            b"garbage",
            b"C0644 5 x.zip",
        ];
        for case in cases {
            let err = decode_payload("x.zip", Bytes::copy_from_slice(case)).unwrap_err();
            assert!(
                matches!(err, PmError::Protocol { .. }),
                "expected protocol error for {:?}, got {:?}",
                case,
                err
            );
        }
    }
}
