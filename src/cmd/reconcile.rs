//! One-shot status reconciliation: `runway reconcile`.

use std::sync::Arc;

use anyhow::{Context, Result};
use runway::config::RunwayConfig;
use runway::runtime::{DockerRuntime, LifecycleManager, ProjectResolver, RuntimeStore, reconcile};

pub async fn cmd_reconcile(config: RunwayConfig) -> Result<()> {
    config.validate()?;
    let store = RuntimeStore::open(&config.server.db_path).with_context(|| {
        format!(
            "Failed to open runtime database {}",
            config.server.db_path.display()
        )
    })?;
    let runtime = DockerRuntime::connect(&config.container, &config.exec)
        .context("Failed to connect to Docker")?;
    let lifecycle = LifecycleManager::new(
        store,
        Arc::new(runtime),
        ProjectResolver::new(config.projects.root.clone()),
        config.container.clone(),
    );

    let report = reconcile(&lifecycle).await;
    println!(
        "checked {} runtime(s): {} updated, {} failed",
        report.checked, report.updated, report.failed
    );
    Ok(())
}
