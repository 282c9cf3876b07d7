//! Database view models used by repositories.

use crate::model::{RunOutcome, RunSummary};
use chrono::{DateTime, Utc};

/// Last-run columns of a pairing row. Survives restarts, unlike the in-memory job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRecord {
    pub last_run_id: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<RunOutcome>,
    pub last_error: Option<String>,
    pub last_published: i64,
    pub last_skipped: i64,
    pub last_reposted_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn summary(&self) -> Option<RunSummary> {
        Some(RunSummary {
            run_id: self.last_run_id.clone()?,
            finished_at: self.last_run_at?,
            outcome: self.last_outcome?,
            published: u32::try_from(self.last_published).unwrap_or(0),
            skipped: u32::try_from(self.last_skipped).unwrap_or(0),
            error: self.last_error.clone(),
        })
    }
}
