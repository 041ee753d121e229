use runway_common::RuntimeStatus;
use serde::Serialize;
use tracing::{info, warn};

use super::lifecycle::LifecycleManager;

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Bring every persisted status in line with the container runtime.
///
/// Never fails: a project whose container cannot be inspected (or whose
/// record cannot be updated) is logged, counted, and left at its previous
/// status while the remaining projects are still processed.
pub async fn reconcile(lifecycle: &LifecycleManager) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    let records = match lifecycle.list().await {
        Ok(records) => records,
        Err(e) => {
            warn!(error = %e, "Reconciliation skipped: cannot list runtime records");
            report.failed += 1;
            return report;
        }
    };

    for record in records {
        report.checked += 1;
        let project = &record.project_name;

        let actual = match lifecycle.is_running(&record.container_name).await {
            Ok(running) => RuntimeStatus::from_running(running),
            Err(e) => {
                warn!(project = %project, error = %e, "Cannot inspect container; keeping recorded status");
                report.failed += 1;
                continue;
            }
        };
        if actual == record.status {
            continue;
        }

        match lifecycle.store().update_status(project, actual).await {
            Ok(()) => {
                info!(project = %project, from = %record.status, to = %actual, "Reconciled runtime status");
                report.updated += 1;
            }
            Err(e) => {
                warn!(project = %project, error = %e, "Cannot update runtime status");
                report.failed += 1;
            }
        }
    }

    info!(
        checked = report.checked,
        updated = report.updated,
        failed = report.failed,
        "Reconciliation complete"
    );
    report
}
