//! Integration tests for the create and update flows
//!
//! The remote side is an in-memory store keyed by archive name.

use async_trait::async_trait;
use bytes::Bytes;
use pkgship::archive::ArchiveBuilder;
use pkgship::error::{PmError, Result};
use pkgship::manager::{PackageManager, PackageStatus};
use pkgship::manifest::{CreateManifest, PackageRef, Target, UpdateManifest};
use pkgship::transport::PackageStore;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

#[derive(Default)]
struct MemoryStore {
    objects: Mutex<HashMap<String, Bytes>>,
    downloads: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MemoryStore {
    fn with(self, name: &str, payload: impl Into<Bytes>) -> Self {
        self.objects
            .lock()
            .unwrap()
            .insert(name.to_string(), payload.into());
        self
    }

    fn get(&self, name: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.objects.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl PackageStore for MemoryStore {
    async fn upload(&self, name: &str, payload: Bytes) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(name.to_string(), payload);
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<Bytes> {
        self.downloads.lock().unwrap().push(name.to_string());
        self.get(name).ok_or_else(|| PmError::RemoteCommand {
            command: format!("scp -f '{}'", name),
            status: 1,
            message: Some(format!("scp: {}: No such file or directory", name)),
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Zip holding a single `name` -> `content` file
fn package_with(dir: &Path, name: &str, content: &str) -> Vec<u8> {
    fs::write(dir.join(name), content).unwrap();
    ArchiveBuilder::new(dir)
        .build(&[Target::new(name)])
        .unwrap()
        .bytes
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn test_create_uploads_named_archive() -> anyhow::Result<()> {
    let work = TempDir::new()?;
    fs::create_dir(work.path().join("data"))?;
    fs::write(work.path().join("data/a.txt"), "alpha")?;
    fs::write(work.path().join("data/b.tmp"), "scratch")?;

    let manifest = work.path().join("package.yaml");
    fs::write(
        &manifest,
        "name: demo\nver: \"1.0\"\ntargets:\n  - path: ./data/*\n    exclude: \"*.tmp\"\n",
    )?;

    let manager = PackageManager::new(MemoryStore::default()).with_workdir(work.path());
    let report = manager.create(&manifest).await?;

    assert_eq!(report.archive_name, "demo-1.0.zip");
    assert_eq!(report.build.entries, vec!["data/a.txt"]);
    assert_eq!(report.build.excluded, vec!["data/b.tmp"]);

    let stored = manager.store().get("demo-1.0.zip").expect("archive uploaded");
    assert_eq!(stored.len(), report.archive_size);

    // What was uploaded unpacks to the selected files only
    let dest = TempDir::new()?;
    let unpack = PackageManager::new(MemoryStore::default().with("demo-1.0.zip", stored))
        .with_workdir(dest.path());
    let update = unpack
        .update_from(UpdateManifest {
            packages: vec![PackageRef::new("demo", "1.0")],
        })
        .await;

    assert_eq!(update.succeeded(), 1);
    assert_eq!(fs::read_to_string(dest.path().join("data/a.txt"))?, "alpha");
    assert!(!dest.path().join("data/b.tmp").exists());
    Ok(())
}

#[tokio::test]
async fn test_create_with_no_matches_uploads_empty_archive() -> anyhow::Result<()> {
    let work = TempDir::new()?;
    let manager = PackageManager::new(MemoryStore::default()).with_workdir(work.path());

    let report = manager
        .create_from(CreateManifest {
            name: "empty".to_string(),
            version: "0.1".to_string(),
            targets: vec![Target::new("missing/*")],
        })
        .await?;

    assert!(report.build.entries.is_empty());
    assert_eq!(report.build.skipped.len(), 1);
    assert_eq!(manager.store().names(), vec!["empty-0.1.zip"]);
    Ok(())
}

#[tokio::test]
async fn test_create_manifest_errors() {
    let work = TempDir::new().unwrap();
    let manager = PackageManager::new(MemoryStore::default()).with_workdir(work.path());

    let txt = work.path().join("package.txt");
    fs::write(&txt, "name: demo").unwrap();
    assert!(matches!(
        manager.create(&txt).await,
        Err(PmError::UnsupportedFormat(ext)) if ext == "txt"
    ));

    let broken = work.path().join("package.json");
    fs::write(&broken, "{\"name\": ").unwrap();
    assert!(matches!(
        manager.create(&broken).await,
        Err(PmError::ManifestParse { .. })
    ));

    let missing = work.path().join("absent.yml");
    assert!(matches!(
        manager.create(&missing).await,
        Err(PmError::ManifestRead { .. })
    ));

    assert!(manager.store().names().is_empty());
}

// =============================================================================
// Update
// =============================================================================

#[tokio::test]
async fn test_update_continues_after_failed_package() -> anyhow::Result<()> {
    let source = TempDir::new()?;
    let beta = package_with(source.path(), "beta.txt", "beta contents");

    let store = MemoryStore::default().with("beta-2.0.zip", beta);
    let dest = TempDir::new()?;
    let manifest = dest.path().join("update.json");
    fs::write(
        &manifest,
        r#"{"packages": [{"name": "alpha", "ver": "1.0"}, {"name": "beta", "version": "2.0"}]}"#,
    )?;

    let manager = PackageManager::new(store).with_workdir(dest.path());
    let report = manager.update(&manifest).await?;

    assert_eq!(
        manager.store().downloads(),
        vec!["alpha-1.0.zip", "beta-2.0.zip"]
    );
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 1);

    let failed: Vec<_> = report.failures().map(|o| o.archive_name.as_str()).collect();
    assert_eq!(failed, vec!["alpha-1.0.zip"]);
    match &report.outcomes[0].status {
        PackageStatus::Failed(reason) => assert!(reason.contains("No such file")),
        other => panic!("expected failure, got {:?}", other),
    }

    assert_eq!(
        fs::read_to_string(dest.path().join("beta.txt"))?,
        "beta contents"
    );
    Ok(())
}

#[tokio::test]
async fn test_update_skips_corrupt_archive() -> anyhow::Result<()> {
    let source = TempDir::new()?;
    let good = package_with(source.path(), "good.txt", "ok");

    let store = MemoryStore::default()
        .with("broken-1.zip", Bytes::from_static(b"not a zip"))
        .with("empty-1.zip", Bytes::new())
        .with("good-1.zip", good);
    let dest = TempDir::new()?;
    let manager = PackageManager::new(store).with_workdir(dest.path());

    let report = manager
        .update_from(UpdateManifest {
            packages: vec![
                PackageRef::new("broken", "1"),
                PackageRef::new("empty", "1"),
                PackageRef::new("good", "1"),
            ],
        })
        .await;

    assert_eq!(report.failed(), 2);
    assert!(report.outcomes[2].is_success());
    assert!(dest.path().join("good.txt").exists());
    Ok(())
}

#[tokio::test]
async fn test_update_empty_version() -> anyhow::Result<()> {
    let dest = TempDir::new()?;
    let manifest = dest.path().join("update.yaml");
    fs::write(&manifest, "packages:\n  - name: app\n")?;

    let manager = PackageManager::new(MemoryStore::default()).with_workdir(dest.path());
    let report = manager.update(&manifest).await?;

    assert_eq!(manager.store().downloads(), vec!["app-.zip"]);
    assert_eq!(report.failed(), 1);
    Ok(())
}

#[tokio::test]
async fn test_update_bad_manifest_is_fatal() {
    let dest = TempDir::new().unwrap();
    let manifest = dest.path().join("update.yaml");
    fs::write(&manifest, "packages: [: nope").unwrap();

    let manager = PackageManager::new(MemoryStore::default()).with_workdir(dest.path());
    assert!(matches!(
        manager.update(&manifest).await,
        Err(PmError::ManifestParse { .. })
    ));
    assert!(manager.store().downloads().is_empty());
}

#[tokio::test]
async fn test_shutdown_closes_store() {
    let manager = PackageManager::new(MemoryStore::default());
    manager.shutdown().await;
    assert!(manager.store().closed.load(Ordering::SeqCst));
}
