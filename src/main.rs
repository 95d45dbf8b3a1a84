use anyhow::{Context, Result};
use clap::Parser;
use pkgship::cli::{Cli, Command};
use pkgship::{PackageManager, PackageStatus, ScpTransfer, SshConnection, SshShell};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    // Credentials are checked up front; the session itself is opened lazily
    let connection = Arc::new(SshConnection::new(cli.ssh_config()));
    connection.preflight()?;

    let store = ScpTransfer::new(SshShell::new(Arc::clone(&connection)));
    let manager = PackageManager::new(store).with_workdir(&cli.workdir);

    let outcome = run(&manager, &cli.command).await;
    manager.shutdown().await;
    outcome
}

async fn run(manager: &PackageManager<ScpTransfer<SshShell>>, command: &Command) -> Result<()> {
    match command {
        Command::Create { manifest } => {
            let report = manager
                .create(manifest)
                .await
                .with_context(|| format!("Failed to create package from {}", manifest.display()))?;

            for skipped in &report.build.skipped {
                tracing::warn!("Skipped {}: {}", skipped.path, skipped.reason);
            }
            tracing::info!(
                "Created {} with {} entries ({} bytes)",
                report.archive_name,
                report.build.entries.len(),
                report.archive_size
            );
        }
        Command::Update { manifest } => {
            let report = manager
                .update(manifest)
                .await
                .with_context(|| format!("Failed to update from {}", manifest.display()))?;

            for outcome in &report.outcomes {
                if let PackageStatus::Extracted(extracted) = &outcome.status {
                    for failed in &extracted.failed {
                        tracing::warn!(
                            "{}: could not unpack {}: {}",
                            outcome.archive_name,
                            failed.path,
                            failed.reason
                        );
                    }
                }
            }
            tracing::info!(
                "Update finished: {} extracted, {} failed",
                report.succeeded(),
                report.failed()
            );
        }
    }
    Ok(())
}
