use offplan_adapters::{FetchError, RecordError};
use offplan_storage::StorageError;
use serde::Serialize;
use thiserror::Error;

/// Errors that end a run. Per-listing problems are [`ListingError`]s and only
/// end up in the run summary.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("listing enumeration failed at page {page}: {source}")]
    Enumeration {
        page: u32,
        #[source]
        source: FetchError,
    },
    #[error("upstream refused the run: {0}")]
    Upstream(#[from] FetchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("run cancelled")]
    Cancelled,
    #[error("another sync run is in progress")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStage {
    Fetch,
    Decode,
    Persist,
}

#[derive(Debug, Error)]
pub enum ListingError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed record: {0}")]
    Malformed(#[from] RecordError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ListingError {
    pub fn stage(&self) -> ListingStage {
        match self {
            ListingError::Fetch(_) => ListingStage::Fetch,
            ListingError::Malformed(_) => ListingStage::Decode,
            ListingError::Storage(_) => ListingStage::Persist,
        }
    }
}
