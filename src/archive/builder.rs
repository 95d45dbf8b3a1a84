//! Archive builder.
//!
//! Expands each target's glob under the working root, applies the base-name
//! exclusion to every match and every walked descendant, and writes a
//! deflate-compressed zip into memory. Output is deterministic: matches and
//! directory walks are sorted by name, and all entries carry the DOS epoch
//! timestamp.

use crate::archive::Skipped;
use crate::error::{PmError, Result};
use crate::manifest::Target;
use glob::{MatchOptions, Pattern};
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// What ended up in (and out of) a built archive
#[derive(Debug, Default, Clone)]
pub struct BuildReport {
    /// Entry names in archive order (directories end with `/`)
    pub entries: Vec<String>,
    /// Matches skipped because of an exclusion pattern
    pub excluded: Vec<String>,
    /// Patterns or entries skipped because of an error
    pub skipped: Vec<Skipped>,
}

/// A finished container held in memory
#[derive(Debug)]
pub struct BuiltArchive {
    pub bytes: Vec<u8>,
    pub report: BuildReport,
}

impl BuiltArchive {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Builds zip archives from manifest targets
pub struct ArchiveBuilder {
    root: PathBuf,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new(".")
    }
}

impl ArchiveBuilder {
    /// Create a builder whose globs are resolved under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Build an archive from `targets`.
    ///
    /// Only a failure to finalize the container is an error; everything else
    /// is logged and recorded in the report.
    pub fn build(&self, targets: &[Target]) -> Result<BuiltArchive> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let mut report = BuildReport::default();

        for target in targets {
            self.add_target(&mut writer, target, &mut report);
        }

        let cursor = writer.finish().map_err(|e| PmError::ArchiveFinalize {
            source: Box::new(e),
        })?;
        let bytes = cursor.into_inner();

        info!(
            "Archive built: {} entries, {} bytes",
            report.entries.len(),
            bytes.len()
        );

        Ok(BuiltArchive { bytes, report })
    }

    fn add_target(
        &self,
        writer: &mut ZipWriter<Cursor<Vec<u8>>>,
        target: &Target,
        report: &mut BuildReport,
    ) {
        let exclude = match target.exclude_pattern.as_deref().map(Pattern::new) {
            None => None,
            Some(Ok(pattern)) => Some(pattern),
            Some(Err(e)) => {
                warn!(
                    "Invalid exclude pattern {:?} for {}: {}",
                    target.exclude_pattern, target.path_pattern, e
                );
                report.skipped.push(Skipped::new(
                    target.path_pattern.clone(),
                    format!("invalid exclude pattern: {}", e),
                ));
                return;
            }
        };

        let pattern = self.resolve_pattern(&target.path_pattern);
        let paths = match glob::glob_with(&pattern, glob_options()) {
            Ok(paths) => paths,
            Err(e) => {
                warn!("Invalid pattern {}: {}", target.path_pattern, e);
                report
                    .skipped
                    .push(Skipped::new(target.path_pattern.clone(), e));
                return;
            }
        };

        let mut matches = Vec::new();
        for entry in paths {
            match entry {
                Ok(path) => matches.push(path),
                Err(e) => {
                    warn!("Failed to read match for {}: {}", target.path_pattern, e);
                    report
                        .skipped
                        .push(Skipped::new(e.path().display().to_string(), e.error()));
                }
            }
        }
        matches.sort();

        if matches.is_empty() {
            warn!("No files match {}", target.path_pattern);
            report
                .skipped
                .push(Skipped::new(target.path_pattern.clone(), "no matches"));
            return;
        }

        for path in matches {
            let metadata = match fs::metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Failed to stat {}: {}", path.display(), e);
                    report
                        .skipped
                        .push(Skipped::new(path.display().to_string(), e));
                    continue;
                }
            };

            let name = self.entry_name(&path);

            if is_excluded(exclude.as_ref(), &path) {
                info!("Excluding {}", path.display());
                report.excluded.push(name);
                continue;
            }

            if metadata.is_dir() {
                self.add_dir(writer, &path, &name, exclude.as_ref(), report);
            } else {
                add_file(writer, &path, name, file_mode(&metadata), report);
            }
        }
    }

    /// Walk `dir` and add everything not pruned by `exclude`.
    ///
    /// `name` is the archive name of `dir` itself; descendants are named
    /// `name/<path below dir>`.
    fn add_dir(
        &self,
        writer: &mut ZipWriter<Cursor<Vec<u8>>>,
        dir: &Path,
        name: &str,
        exclude: Option<&Pattern>,
        report: &mut BuildReport,
    ) {
        let walker = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                // The matched directory itself was checked by the caller
                if e.depth() == 0 || !is_excluded(exclude, e.path()) {
                    return true;
                }
                info!("Excluding {}", e.path().display());
                false
            });

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let path = e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| dir.display().to_string());
                    warn!("Failed to walk {}: {}", path, e);
                    report.skipped.push(Skipped::new(path, e));
                    continue;
                }
            };

            let rel = match entry.path().strip_prefix(dir) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let entry_name = if rel.as_os_str().is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", name, slash_path(rel))
            };

            let metadata = match fs::metadata(entry.path()) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Failed to stat {}: {}", entry.path().display(), e);
                    report
                        .skipped
                        .push(Skipped::new(entry.path().display().to_string(), e));
                    continue;
                }
            };

            if metadata.is_dir() && entry.depth() > 0 && entry.path_is_symlink() {
                // The walker does not descend into it
                warn!(
                    "Skipping {}: symlinked directory not followed",
                    entry.path().display()
                );
                report.skipped.push(Skipped::new(
                    entry.path().display().to_string(),
                    "symlinked directory not followed",
                ));
                continue;
            }

            if metadata.is_dir() {
                add_directory(writer, entry_name, dir_mode(&metadata), report);
            } else {
                add_file(
                    writer,
                    entry.path(),
                    entry_name,
                    file_mode(&metadata),
                    report,
                );
            }
        }
    }

    fn resolve_pattern(&self, pattern: &str) -> String {
        if self.root == Path::new(".") || Path::new(pattern).is_absolute() {
            pattern.to_string()
        } else {
            self.root.join(pattern).to_string_lossy().into_owned()
        }
    }

    /// Archive name for a top-level match.
    ///
    /// Matches below the root keep their path relative to it (`./data/a.txt`
    /// becomes `data/a.txt`); absolute or `..` matches are named relative to
    /// their parent directory.
    pub(crate) fn entry_name(&self, path: &Path) -> String {
        let rel = if self.root == Path::new(".") {
            path
        } else {
            path.strip_prefix(&self.root).unwrap_or(path)
        };

        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));

        let name = if escapes {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            slash_path(rel)
        };

        if name.is_empty() {
            // A pattern that resolves to the root itself
            path.canonicalize()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| ".".to_string())
        } else {
            name
        }
    }
}

fn glob_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// Exclusion is checked against the base name only, so patterns containing
/// a separator never match.
fn is_excluded(exclude: Option<&Pattern>, path: &Path) -> bool {
    match (exclude, path.file_name()) {
        (Some(pattern), Some(base)) => pattern.matches(&base.to_string_lossy()),
        _ => false,
    }
}

/// Join normal components with `/`, dropping `.` components.
fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn entry_options(mode: u32) -> FileOptions {
    FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(mode)
}

fn add_directory(
    writer: &mut ZipWriter<Cursor<Vec<u8>>>,
    name: String,
    mode: u32,
    report: &mut BuildReport,
) {
    let name = format!("{}/", name.trim_end_matches('/'));
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(mode);

    match writer.add_directory(name.clone(), options) {
        Ok(()) => {
            debug!("Added directory {}", name);
            report.entries.push(name);
        }
        Err(e) => {
            warn!("Failed to add directory {} to archive: {}", name, e);
            report.skipped.push(Skipped::new(name, e));
        }
    }
}

fn add_file(
    writer: &mut ZipWriter<Cursor<Vec<u8>>>,
    path: &Path,
    name: String,
    mode: u32,
    report: &mut BuildReport,
) {
    // Read before starting the entry so a failed read leaves no partial entry
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            report
                .skipped
                .push(Skipped::new(path.display().to_string(), e));
            return;
        }
    };

    if let Err(e) = writer.start_file(name.clone(), entry_options(mode)) {
        warn!("Failed to create archive entry for {}: {}", path.display(), e);
        report.skipped.push(Skipped::new(name, e));
        return;
    }

    if let Err(e) = writer.write_all(&data) {
        warn!("Failed to write {} into archive: {}", path.display(), e);
        report.skipped.push(Skipped::new(name, e));
        return;
    }

    debug!("Added file {} ({} bytes)", name, data.len());
    report.entries.push(name);
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> u32 {
    crate::archive::DEFAULT_FILE_MODE
}

#[cfg(unix)]
fn dir_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn dir_mode(_metadata: &fs::Metadata) -> u32 {
    crate::archive::DEFAULT_DIR_MODE
}
