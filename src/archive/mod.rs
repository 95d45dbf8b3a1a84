//! Zip packaging for manifests.
//!
//! The builder turns a list of include/exclude targets into an in-memory zip
//! container; the extractor unpacks such a container under a root directory.
//! Both follow a partial-failure policy: one bad file or entry is logged,
//! recorded in the returned report and skipped.

pub mod builder;
pub mod extractor;

pub use builder::{ArchiveBuilder, BuildReport, BuiltArchive};
pub use extractor::{ArchiveExtractor, ExtractReport};

/// Mode used for parent directories that are not stored in the archive.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Mode used for files when the archive carries no permission bits.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// An entry that was left out, and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub path: String,
    pub reason: String,
}

impl Skipped {
    pub fn new(path: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
