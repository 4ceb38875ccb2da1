//! Sync engine for the off-plan catalog: full passes, incremental checks, the
//! deletion sweep and reference-data sync.

use offplan_adapters::ListingSource;
use offplan_storage::{CatalogStore, ReferenceSyncCounts};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

pub mod config;
pub mod error;
mod full_pass;
pub mod incremental;
pub mod reconcile;
pub mod reference;
pub mod scheduler;
pub mod summary;
pub mod sweep;
#[cfg(test)]
mod testing;

pub use config::{ConfigError, DatabaseConfig, SyncConfig};
pub use error::{ListingError, ListingStage, SyncError};
pub use incremental::{DriftReason, DriftSignal};
pub use reconcile::{classify, fetch_listing, reconcile_listing};
pub use reference::sync_reference_data;
pub use scheduler::build_scheduler;
pub use summary::{IncrementalReport, ListingFailure, RunMode, SyncRunSummary};
pub use sweep::{sweep_missing, CompleteEnumeration, SweepOutcome};

pub const CRATE_NAME: &str = "offplan-sync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Detail fetches in flight within one page.
    pub detail_concurrency: usize,
    pub fallback_search: bool,
    /// Stop enumerating after this many pages. A capped pass never sweeps.
    pub max_pages: Option<u32>,
    pub delete_missing: bool,
    pub sample_size: usize,
    pub unchanged_threshold: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            detail_concurrency: 4,
            fallback_search: true,
            max_pages: None,
            delete_missing: true,
            sample_size: 60,
            unchanged_threshold: 60,
        }
    }
}

/// Owns the upstream source and the store. At most one full or incremental run
/// executes at a time; a second caller gets [`SyncError::AlreadyRunning`].
pub struct SyncEngine<S, C> {
    source: S,
    store: C,
    options: EngineOptions,
    run_lock: Mutex<()>,
}

impl<S, C> SyncEngine<S, C>
where
    S: ListingSource,
    C: CatalogStore,
{
    pub fn new(source: S, store: C, options: EngineOptions) -> Self {
        Self {
            source,
            store,
            options,
            run_lock: Mutex::new(()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub async fn full_sync(&self, cancel: &CancellationToken) -> Result<SyncRunSummary, SyncError> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning)?;
        self.run_full(RunMode::Full, cancel).await
    }

    /// Samples recent listings and runs a full pass only when one of them drifted.
    pub async fn incremental(
        &self,
        cancel: &CancellationToken,
    ) -> Result<IncrementalReport, SyncError> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning)?;

        let mut report = IncrementalReport::new();
        let span = info_span!("incremental", run_id = %report.run_id);
        let drift = incremental::detect_drift(
            &self.source,
            &self.store,
            &self.options,
            cancel,
            &mut report,
        )
        .instrument(span.clone())
        .await?;

        if let Some(signal) = drift {
            span.in_scope(|| {
                info!(
                    listing_id = signal.listing_id,
                    reason = ?signal.reason,
                    "drift detected; escalating to a full pass"
                )
            });
            report.drift = Some(signal);
            report.full_pass = Some(self.run_full(RunMode::Incremental, cancel).await?);
        } else {
            span.in_scope(|| {
                info!(
                    checked = report.checked,
                    unchanged = report.unchanged,
                    skipped = report.skipped.len(),
                    "no drift in sample"
                )
            });
        }

        report.finished_at = Some(chrono::Utc::now());
        Ok(report)
    }

    pub async fn sync_references(&self) -> Result<ReferenceSyncCounts, SyncError> {
        sync_reference_data(&self.source, &self.store)
            .instrument(info_span!("reference_sync"))
            .await
    }

    async fn run_full(
        &self,
        mode: RunMode,
        cancel: &CancellationToken,
    ) -> Result<SyncRunSummary, SyncError> {
        let mut summary = SyncRunSummary::new(mode);
        let span = info_span!("full_pass", run_id = %summary.run_id, mode = ?mode);

        async {
            let enumeration = match full_pass::run_full_pass(
                &self.source,
                &self.store,
                &self.options,
                cancel,
                &mut summary,
            )
            .await
            {
                Ok(enumeration) => enumeration,
                Err(err) => {
                    warn!(
                        pages = summary.pages,
                        written = summary.written(),
                        failed = summary.failed.len(),
                        error = %err,
                        "full pass aborted; no deletion sweep"
                    );
                    return Err(err);
                }
            };

            if let Some(enumeration) = enumeration {
                summary.sweep =
                    Some(sweep_missing(&self.store, enumeration, self.options.delete_missing).await?);
            }

            info!(
                pages = summary.pages,
                new = summary.new,
                changed = summary.changed,
                unchanged = summary.unchanged,
                partial_units_changed = summary.partial_units_changed,
                not_found = summary.not_found,
                failed = summary.failed.len(),
                deleted = summary.deleted(),
                "full pass finished"
            );
            Ok::<(), SyncError>(())
        }
        .instrument(span)
        .await?;

        Ok(summary.finish())
    }
}
