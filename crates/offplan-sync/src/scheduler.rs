use std::sync::Arc;

use anyhow::{Context, Result};
use offplan_adapters::ListingSource;
use offplan_storage::CatalogStore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::SyncEngine;

/// Cron jobs for the incremental check and the reference-data sync.
///
/// `None` when the scheduler is disabled. The caller starts the returned scheduler.
pub async fn build_scheduler<S, C>(
    engine: Arc<SyncEngine<S, C>>,
    config: &SyncConfig,
    cancel: CancellationToken,
) -> Result<Option<JobScheduler>>
where
    S: ListingSource + 'static,
    C: CatalogStore + 'static,
{
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let incremental_engine = Arc::clone(&engine);
    let incremental_cancel = cancel.clone();
    let cron = config.incremental_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let engine = Arc::clone(&incremental_engine);
        let cancel = incremental_cancel.clone();
        Box::pin(async move {
            match engine.incremental(&cancel).await {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    checked = report.checked,
                    escalated = report.escalated(),
                    "scheduled incremental check finished"
                ),
                Err(SyncError::AlreadyRunning) => {
                    warn!("scheduled incremental check skipped; a run is in progress")
                }
                Err(err) => error!(error = %err, "scheduled incremental check failed"),
            }
        })
    })
    .with_context(|| format!("creating incremental job for cron {cron}"))?;
    sched.add(job).await.context("adding incremental job")?;

    let reference_engine = Arc::clone(&engine);
    let cron = config.reference_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let engine = Arc::clone(&reference_engine);
        Box::pin(async move {
            match engine.sync_references().await {
                Ok(counts) => info!(
                    upserted = counts.total_upserted(),
                    pruned = counts.total_pruned(),
                    "scheduled reference sync finished"
                ),
                Err(err) => error!(error = %err, "scheduled reference sync failed"),
            }
        })
    })
    .with_context(|| format!("creating reference job for cron {cron}"))?;
    sched.add(job).await.context("adding reference job")?;

    info!(
        incremental = %config.incremental_cron,
        reference = %config.reference_cron,
        "scheduler configured"
    );
    Ok(Some(sched))
}
