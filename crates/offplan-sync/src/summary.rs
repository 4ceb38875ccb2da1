use chrono::{DateTime, Utc};
use offplan_core::{Classification, ListingId};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ListingError, ListingStage};
use crate::incremental::DriftSignal;
use crate::sweep::SweepOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListingFailure {
    pub listing_id: ListingId,
    pub stage: ListingStage,
    pub message: String,
}

impl ListingFailure {
    pub fn new(listing_id: ListingId, err: &ListingError) -> Self {
        Self {
            listing_id,
            stage: err.stage(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pages: u32,
    pub listings_seen: usize,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub partial_units_changed: usize,
    /// Enumerated upstream but the detail endpoint had nothing for them.
    pub not_found: usize,
    pub units_removed: usize,
    pub failed: Vec<ListingFailure>,
    /// `None` when enumeration stopped early (page cap) and no sweep was attempted.
    pub sweep: Option<SweepOutcome>,
}

impl SyncRunSummary {
    pub fn new(mode: RunMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            started_at: Utc::now(),
            finished_at: None,
            pages: 0,
            listings_seen: 0,
            new: 0,
            changed: 0,
            unchanged: 0,
            partial_units_changed: 0,
            not_found: 0,
            units_removed: 0,
            failed: Vec::new(),
            sweep: None,
        }
    }

    pub fn record(&mut self, classification: Classification) {
        let slot = match classification {
            Classification::New => &mut self.new,
            Classification::Changed => &mut self.changed,
            Classification::Unchanged => &mut self.unchanged,
            Classification::PartialUnitsChanged => &mut self.partial_units_changed,
        };
        *slot += 1;
    }

    pub fn record_failure(&mut self, listing_id: ListingId, err: &ListingError) {
        self.failed.push(ListingFailure::new(listing_id, err));
    }

    pub fn written(&self) -> usize {
        self.new + self.changed + self.partial_units_changed
    }

    pub fn deleted(&self) -> usize {
        match &self.sweep {
            Some(SweepOutcome::Deleted { ids }) => ids.len(),
            _ => 0,
        }
    }

    pub(crate) fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }
}

/// Result of one incremental check.
#[derive(Debug, Clone, Serialize)]
pub struct IncrementalReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub sampled: usize,
    pub checked: usize,
    pub unchanged: usize,
    pub skipped: Vec<ListingFailure>,
    pub drift: Option<DriftSignal>,
    /// Present when drift escalated into a full pass.
    pub full_pass: Option<SyncRunSummary>,
}

impl IncrementalReport {
    pub(crate) fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            sampled: 0,
            checked: 0,
            unchanged: 0,
            skipped: Vec::new(),
            drift: None,
            full_pass: None,
        }
    }

    pub fn escalated(&self) -> bool {
        self.full_pass.is_some()
    }
}
