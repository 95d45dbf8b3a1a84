//! Package manager: sequences manifests, archives and transfers.
//!
//! Create: manifest -> archive build -> upload as `{name}-{version}.zip`.
//! Update: for each package, download `{name}-{version}.zip` -> extract.
//! A failed package in an update is recorded and the batch continues.

use crate::archive::{ArchiveBuilder, ArchiveExtractor, BuildReport, ExtractReport};
use crate::error::Result;
use crate::manifest::{self, CreateManifest, UpdateManifest};
use crate::transport::PackageStore;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Result of `create`
#[derive(Debug, Clone)]
pub struct CreateReport {
    pub archive_name: String,
    pub archive_size: usize,
    pub build: BuildReport,
}

/// Outcome for one package of an update
#[derive(Debug, Clone)]
pub enum PackageStatus {
    Extracted(ExtractReport),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct PackageOutcome {
    pub archive_name: String,
    pub status: PackageStatus,
}

impl PackageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, PackageStatus::Extracted(_))
    }
}

/// Result of `update`, one outcome per package in manifest order
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    pub outcomes: Vec<PackageOutcome>,
}

impl UpdateReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = &PackageOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }
}

pub struct PackageManager<S> {
    store: S,
    workdir: PathBuf,
}

impl<S: PackageStore> PackageManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            workdir: PathBuf::from("."),
        }
    }

    /// Resolve globs and extract packages under `workdir` instead of `.`.
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Load a create manifest, build its archive and upload it.
    pub async fn create(&self, manifest_path: &Path) -> Result<CreateReport> {
        let manifest: CreateManifest = manifest::load(manifest_path)?;
        self.create_from(manifest).await
    }

    pub async fn create_from(&self, manifest: CreateManifest) -> Result<CreateReport> {
        info!(
            "Creating package {} version {}",
            manifest.name, manifest.version
        );

        let archive_name = manifest.archive_name();
        let builder = ArchiveBuilder::new(self.workdir.clone());
        let targets = manifest.targets;
        let built = tokio::task::spawn_blocking(move || builder.build(&targets)).await??;

        if built.report.entries.is_empty() {
            warn!("Package {} is empty", archive_name);
        }

        let archive_size = built.len();
        self.store
            .upload(&archive_name, Bytes::from(built.bytes))
            .await?;

        info!("Package {} uploaded ({} bytes)", archive_name, archive_size);
        Ok(CreateReport {
            archive_name,
            archive_size,
            build: built.report,
        })
    }

    /// Load an update manifest, then download and extract every package.
    pub async fn update(&self, manifest_path: &Path) -> Result<UpdateReport> {
        let manifest: UpdateManifest = manifest::load(manifest_path)?;
        Ok(self.update_from(manifest).await)
    }

    pub async fn update_from(&self, manifest: UpdateManifest) -> UpdateReport {
        info!("Updating {} packages", manifest.packages.len());

        let mut report = UpdateReport::default();
        for package in &manifest.packages {
            let archive_name = package.archive_name();
            info!("Fetching {}", archive_name);

            let status = match self.fetch(&archive_name).await {
                Ok(extracted) => {
                    info!("Package {} unpacked", package.name);
                    PackageStatus::Extracted(extracted)
                }
                Err(e) => {
                    warn!("Failed to update {}: {}", archive_name, e);
                    PackageStatus::Failed(e.to_string())
                }
            };

            report.outcomes.push(PackageOutcome {
                archive_name,
                status,
            });
        }
        report
    }

    async fn fetch(&self, archive_name: &str) -> Result<ExtractReport> {
        let payload = self.store.download(archive_name).await?;

        let extractor = ArchiveExtractor::new(self.workdir.clone());
        let name = archive_name.to_string();
        tokio::task::spawn_blocking(move || extractor.extract(&name, &payload)).await?
    }

    /// Release the store's connection.
    pub async fn shutdown(&self) {
        self.store.close().await;
    }
}
