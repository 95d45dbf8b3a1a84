//! Archive extractor.
//!
//! Recreates the tree stored in a zip container under a destination root.
//! Entry names that would escape the root are refused.

use crate::archive::{Skipped, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
use crate::error::{PmError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::ZipArchive;

/// Kept on directories while their entries are written
const OWNER_RWX: u32 = 0o700;

/// Outcome of one extraction
#[derive(Debug, Default, Clone)]
pub struct ExtractReport {
    /// Directories created (or already present)
    pub dirs: Vec<PathBuf>,
    /// Files written
    pub files: Vec<PathBuf>,
    /// Entries that failed and were skipped
    pub failed: Vec<Skipped>,
}

impl ExtractReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Unpacks zip containers under a root directory
pub struct ArchiveExtractor {
    root: PathBuf,
}

impl Default for ArchiveExtractor {
    fn default() -> Self {
        Self::new(".")
    }
}

impl ArchiveExtractor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Extract every entry of `bytes` under the root.
    ///
    /// `name` is only used for messages. Fails only if the container itself
    /// cannot be read; per-entry failures end up in the report.
    pub fn extract(&self, name: &str, bytes: &[u8]) -> Result<ExtractReport> {
        let mut archive =
            ZipArchive::new(Cursor::new(bytes)).map_err(|e| PmError::ArchiveOpen {
                name: name.to_string(),
                source: Box::new(e),
            })?;

        let mut report = ExtractReport::default();
        // Stored directory modes, applied once every entry is written
        let mut pending_modes: Vec<(PathBuf, u32)> = Vec::new();

        for index in 0..archive.len() {
            let mut entry = match archive.by_index(index) {
                Ok(e) => e,
                Err(e) => {
                    warn!("Failed to read entry #{} of {}: {}", index, name, e);
                    report
                        .failed
                        .push(Skipped::new(format!("#{}", index), e));
                    continue;
                }
            };

            let entry_name = entry.name().to_string();
            let relative = match entry.enclosed_name() {
                Some(p) => p.to_path_buf(),
                None => {
                    warn!("Refusing unsafe entry name {:?} in {}", entry_name, name);
                    report
                        .failed
                        .push(Skipped::new(entry_name, "path escapes destination"));
                    continue;
                }
            };
            let path = self.root.join(&relative);

            if entry.is_dir() {
                let mode = entry.unix_mode().map_or(DEFAULT_DIR_MODE, |m| m & 0o7777);
                match create_dir(&path, mode | OWNER_RWX) {
                    Ok(()) => {
                        debug!("Created directory {}", path.display());
                        pending_modes.push((path.clone(), mode));
                        report.dirs.push(path);
                    }
                    Err(e) => {
                        warn!("Failed to create directory {}: {}", path.display(), e);
                        report.failed.push(Skipped::new(entry_name, e));
                    }
                }
                continue;
            }

            if let Some(parent) = path.parent() {
                if let Err(e) = create_dir_all(parent, DEFAULT_DIR_MODE) {
                    warn!("Failed to create directory {}: {}", parent.display(), e);
                    report.failed.push(Skipped::new(entry_name, e));
                    continue;
                }
            }

            let mode = entry
                .unix_mode()
                .map_or(DEFAULT_FILE_MODE, |m| m & 0o7777);
            let mut file = match open_output(&path, mode) {
                Ok(f) => f,
                Err(e) => {
                    warn!("Failed to create file {}: {}", path.display(), e);
                    report.failed.push(Skipped::new(entry_name, e));
                    continue;
                }
            };

            if let Err(e) = io::copy(&mut entry, &mut file) {
                warn!("Failed to extract {}: {}", entry_name, e);
                report.failed.push(Skipped::new(entry_name, e));
                continue;
            }

            debug!("Extracted {}", path.display());
            report.files.push(path);
        }

        // Deepest first so a read-only parent never blocks its children
        pending_modes.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
        for (path, mode) in pending_modes {
            if let Err(e) = set_mode(&path, mode) {
                warn!("Failed to set mode on {}: {}", path.display(), e);
                report
                    .failed
                    .push(Skipped::new(path.display().to_string(), e));
            }
        }

        info!(
            "Extracted {}: {} files, {} directories, {} failed",
            name,
            report.files.len(),
            report.dirs.len(),
            report.failed.len()
        );

        Ok(report)
    }
}

#[cfg(unix)]
fn create_dir_all(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(mode).create(path)
}

#[cfg(not(unix))]
fn create_dir_all(path: &Path, _mode: u32) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Create a directory and apply `mode`, even if it already existed.
fn create_dir(path: &Path, mode: u32) -> io::Result<()> {
    create_dir_all(path, mode)?;
    set_mode(path, mode)
}

#[cfg(unix)]
fn open_output(path: &Path, mode: u32) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    // A read-only file left by an earlier extraction
    if path.is_file() {
        set_mode(path, mode | 0o200)?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    // mode() only applies on creation
    set_mode(path, mode)?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_output(path: &Path, _mode: u32) -> io::Result<File> {
    if let Ok(metadata) = fs::metadata(path) {
        let mut permissions = metadata.permissions();
        if permissions.readonly() {
            permissions.set_readonly(false);
            fs::set_permissions(path, permissions)?;
        }
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
