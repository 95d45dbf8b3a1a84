//! Reusable SSH connection.
//!
//! [`SshConnection`] owns at most one authenticated ssh2 [`Session`]. The
//! first [`SshConnection::acquire`] connects; later calls check the cached
//! session by opening and closing a channel and reconnect if that fails.
//! Host keys are checked strictly against the configured known_hosts file.

use crate::error::{PmError, Result};
use crate::ssh::config::SshConfig;
use base64::Engine;
use ssh2::{CheckResult, HostKeyType, KnownHostFileKind, KnownHosts, Session};
use std::fs;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// A private key read from disk and sanity-checked
pub struct PrivateKey {
    path: PathBuf,
    pem: String,
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl PrivateKey {
    pub fn load(path: &Path) -> Result<Self> {
        let pem = fs::read_to_string(path).map_err(|source| PmError::KeyRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, pem)
    }

    /// Decode the key and reject passphrase-protected ones.
    ///
    /// Accepts OpenSSH keys and unencrypted PKCS#1, PKCS#8 and SEC1 PEM
    /// files.
    pub fn parse(path: &Path, pem: String) -> Result<Self> {
        let fail = |reason: &str| PmError::KeyParse {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let mut lines = pem.lines().map(str::trim).filter(|l| !l.is_empty());
        let begin = lines.next().ok_or_else(|| fail("key file is empty"))?;
        let label = begin
            .strip_prefix("-----BEGIN ")
            .and_then(|l| l.strip_suffix("-----"))
            .filter(|l| l.ends_with("PRIVATE KEY"))
            .ok_or_else(|| fail("not a PEM private key"))?;

        if label == "ENCRYPTED PRIVATE KEY" {
            return Err(fail("passphrase-protected keys are not supported"));
        }

        let mut body = String::new();
        let mut closed = false;
        for line in lines {
            if line == format!("-----END {}-----", label) {
                closed = true;
                break;
            }
            if line.starts_with("Proc-Type:") && line.contains("ENCRYPTED") {
                return Err(fail("passphrase-protected keys are not supported"));
            }
            // Skip legacy PEM headers such as DEK-Info
            if line.contains(':') {
                continue;
            }
            body.push_str(line);
        }
        if !closed {
            return Err(fail("missing END marker"));
        }

        let der = base64::engine::general_purpose::STANDARD
            .decode(body.as_bytes())
            .map_err(|_| fail("key body is not valid base64"))?;

        match label {
            "OPENSSH PRIVATE KEY" => {
                let key = ssh_key::PrivateKey::from_openssh(pem.as_bytes())
                    .map_err(|e| fail(&format!("malformed OpenSSH key: {}", e)))?;
                if key.is_encrypted() {
                    return Err(fail("passphrase-protected keys are not supported"));
                }
            }
            "RSA PRIVATE KEY" => {
                pkcs1::RsaPrivateKey::try_from(der.as_slice())
                    .map_err(|e| fail(&format!("malformed PKCS#1 key: {}", e)))?;
            }
            "PRIVATE KEY" => {
                pkcs8::PrivateKeyInfo::try_from(der.as_slice())
                    .map_err(|e| fail(&format!("malformed PKCS#8 key: {}", e)))?;
            }
            "EC PRIVATE KEY" => {
                sec1::EcPrivateKey::try_from(der.as_slice())
                    .map_err(|e| fail(&format!("malformed SEC1 key: {}", e)))?;
            }
            other => return Err(fail(&format!("unsupported key type {}", other))),
        }

        Ok(Self {
            path: path.to_path_buf(),
            pem,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }
}

/// Owner of the single cached SSH session
pub struct SshConnection {
    config: SshConfig,
    session: Mutex<Option<Session>>,
}

impl SshConnection {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Return a live session, connecting or reconnecting as needed.
    ///
    /// Blocking: call from a blocking context.
    pub fn acquire(&self) -> Result<Session> {
        let mut cached = self.lock();
        let addr = self.config.address();

        reuse_or_connect(
            &mut *cached,
            &addr,
            is_alive,
            |stale| {
                let _ = stale.disconnect(None, "stale session", None);
            },
            || self.connect(),
        )
    }

    /// Check settings and credentials without touching the network.
    pub fn preflight(&self) -> Result<()> {
        self.config.validate()?;
        PrivateKey::load(&self.config.identity_file)?;

        let known_hosts = &self.config.known_hosts;
        fs::metadata(known_hosts).map_err(|e| PmError::KnownHosts {
            path: known_hosts.clone(),
            source: Box::new(e),
        })?;
        Ok(())
    }

    /// Disconnect and forget the cached session, if any.
    pub fn release(&self) {
        if let Some(session) = self.lock().take() {
            if let Err(e) = session.disconnect(None, "closing", None) {
                debug!("Error while disconnecting: {}", e);
            }
            info!("Closed SSH connection to {}", self.config.address());
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn connect(&self) -> Result<Session> {
        self.config.validate()?;

        let key = PrivateKey::load(&self.config.identity_file)?;
        let addr = self.config.address();

        let mut session = Session::new().map_err(|e| PmError::Handshake {
            addr: addr.clone(),
            source: Box::new(e),
        })?;

        let known_hosts = load_known_hosts(&session, &self.config.known_hosts)?;

        debug!("Connecting to {}", addr);
        let tcp = TcpStream::connect(&addr).map_err(|source| PmError::Connect {
            addr: addr.clone(),
            source,
        })?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| PmError::Handshake {
            addr: addr.clone(),
            source: Box::new(e),
        })?;

        verify_host_key(&known_hosts, &self.config, session.host_key())?;
        authenticate(&session, &key, &self.config)?;

        info!("Connected to {}@{}", self.config.user, addr);
        Ok(session)
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        self.release();
    }
}

/// Open and immediately close a channel.
fn is_alive(session: &Session) -> bool {
    match session.channel_session() {
        Ok(mut channel) => {
            let _ = channel.close();
            true
        }
        Err(e) => {
            debug!("Cached session is dead: {}", e);
            false
        }
    }
}

fn load_known_hosts(session: &Session, path: &Path) -> Result<KnownHosts> {
    let fail = |source: ssh2::Error| PmError::KnownHosts {
        path: path.to_path_buf(),
        source: Box::new(source),
    };

    let mut known_hosts = session.known_hosts().map_err(fail)?;
    let count = known_hosts
        .read_file(path, KnownHostFileKind::OpenSSH)
        .map_err(fail)?;
    debug!("Loaded {} known host entries from {}", count, path.display());
    Ok(known_hosts)
}

/// Hand out the cached session if it passes `is_usable`; otherwise discard it
/// and cache a fresh one from `connect`.
fn reuse_or_connect<T, P, D, C>(
    cached: &mut Option<T>,
    addr: &str,
    is_usable: P,
    discard: D,
    connect: C,
) -> Result<T>
where
    T: Clone,
    P: Fn(&T) -> bool,
    D: FnOnce(T),
    C: FnOnce() -> Result<T>,
{
    if let Some(session) = cached.as_ref() {
        if is_usable(session) {
            debug!("Reusing SSH session to {}", addr);
            return Ok(session.clone());
        }
        warn!("SSH session to {} is no longer usable, reconnecting", addr);
        if let Some(stale) = cached.take() {
            discard(stale);
        }
    }

    let session = connect()?;
    *cached = Some(session.clone());
    Ok(session)
}

/// Check the server's raw host key against `known_hosts`.
fn verify_host_key(
    known_hosts: &KnownHosts,
    config: &SshConfig,
    host_key: Option<(&[u8], HostKeyType)>,
) -> Result<()> {
    let (key, kind) = host_key.ok_or_else(|| PmError::HostKeyUnknown {
        host: config.hostname.clone(),
    })?;
    debug!("Server host key type: {:?}", kind);

    match known_hosts.check_port(&config.hostname, config.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => Err(PmError::HostKeyUnknown {
            host: config.hostname.clone(),
        }),
        CheckResult::Mismatch => Err(PmError::HostKeyMismatch {
            host: config.hostname.clone(),
        }),
        CheckResult::Failure => Err(PmError::KnownHosts {
            path: config.known_hosts.clone(),
            source: format!("host key check for {} failed", config.hostname).into(),
        }),
    }
}

fn authenticate(session: &Session, key: &PrivateKey, config: &SshConfig) -> Result<()> {
    let fail = |reason: String| PmError::Auth {
        user: config.user.clone(),
        host: config.hostname.clone(),
        reason,
    };

    #[cfg(unix)]
    let result = session.userauth_pubkey_memory(&config.user, None, key.pem(), None);
    #[cfg(not(unix))]
    let result = session.userauth_pubkey_file(&config.user, None, key.path(), None);

    result.map_err(|e| fail(e.to_string()))?;

    if !session.authenticated() {
        return Err(fail("server rejected the key".to_string()));
    }
    Ok(())
}
