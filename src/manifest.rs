//! Manifest models and decoding.
//!
//! Two manifests drive the tool: a create manifest (what to pack, under which
//! name and version) and an update manifest (which packages to fetch). Both
//! can be written as JSON or YAML; the format is picked from the file
//! extension.

use crate::error::{PmError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

/// Build the remote archive name shared by push and pull.
///
/// An empty version is kept as-is, so `("app", "")` gives `app-.zip`.
pub fn archive_name(name: &str, version: &str) -> String {
    format!("{}-{}.zip", name, version)
}

/// Manifest for `pm create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateManifest {
    pub name: String,

    #[serde(rename = "ver", alias = "version", default)]
    pub version: String,

    #[serde(default)]
    pub targets: Vec<Target>,
}

impl CreateManifest {
    pub fn archive_name(&self) -> String {
        archive_name(&self.name, &self.version)
    }
}

/// One include/exclude pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Glob expanded against the working root
    #[serde(rename = "path")]
    pub path_pattern: String,

    /// Glob matched against base names only
    #[serde(
        rename = "exclude",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub exclude_pattern: Option<String>,
}

impl Target {
    pub fn new(path_pattern: impl Into<String>) -> Self {
        Self {
            path_pattern: path_pattern.into(),
            exclude_pattern: None,
        }
    }

    pub fn excluding(mut self, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        self.exclude_pattern = if pattern.is_empty() {
            None
        } else {
            Some(pattern)
        };
        self
    }
}

/// Manifest for `pm update`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManifest {
    #[serde(default)]
    pub packages: Vec<PackageRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRef {
    pub name: String,

    #[serde(rename = "ver", alias = "version", default)]
    pub version: String,
}

impl PackageRef {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn archive_name(&self) -> String {
        archive_name(&self.name, &self.version)
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

/// Supported manifest encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Json,
    Yaml,
}

impl ManifestFormat {
    /// Pick the decoder from the file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "json" => Ok(ManifestFormat::Json),
            "yaml" | "yml" => Ok(ManifestFormat::Yaml),
            _ => Err(PmError::UnsupportedFormat(ext)),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, path: &Path, data: &str) -> Result<T> {
        let parsed = match self {
            ManifestFormat::Json => {
                serde_json::from_str(data).map_err(|e| -> crate::error::BoxError { e.into() })
            }
            ManifestFormat::Yaml => {
                serde_yaml::from_str(data).map_err(|e| -> crate::error::BoxError { e.into() })
            }
        };

        parsed.map_err(|source| PmError::ManifestParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Read and decode a manifest file.
///
/// The extension is checked before the file is read, so an unsupported
/// format is reported even when the file does not exist.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let format = ManifestFormat::from_path(path)?;
    let data = std::fs::read_to_string(path).map_err(|source| PmError::ManifestRead {
        path: path.to_path_buf(),
        source,
    })?;
    format.decode(path, &data)
}
