//! Durable state and HTTP fetch utilities for Radar: the retrying fetcher,
//! the JSONL journals kept under the state directory and the run lock.

use std::path::{Path, PathBuf};

pub mod http;
pub mod journal;
pub mod lock;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use journal::{FailedPageRecord, JournalError, JsonlJournal, RejectedRecord, RejectionKind};
pub use lock::{LockError, RunLock};

pub const CRATE_NAME: &str = "radar-storage";

const FAILED_PAGES_FILE: &str = "failed_pages.jsonl";
const DEAD_LETTER_FILE: &str = "failed_pages_dead.jsonl";
const REJECTIONS_FILE: &str = "rejected_records.jsonl";
const LOCK_FILE: &str = "sync.lock";

/// Directory holding the journals and the run lock shared by sync,
/// reprocess and status refresh.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn failed_pages(&self) -> JsonlJournal<FailedPageRecord> {
        JsonlJournal::new(self.root.join(FAILED_PAGES_FILE))
    }

    pub fn dead_letter(&self) -> JsonlJournal<FailedPageRecord> {
        JsonlJournal::new(self.root.join(DEAD_LETTER_FILE))
    }

    pub fn rejections(&self) -> JsonlJournal<RejectedRecord> {
        JsonlJournal::new(self.root.join(REJECTIONS_FILE))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn acquire_run_lock(&self) -> Result<RunLock, LockError> {
        RunLock::try_acquire(self.lock_path())
    }
}
