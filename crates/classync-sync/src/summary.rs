use chrono::{DateTime, NaiveDate, Utc};
use classync_core::SyncSummary;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reconcile::LessonChanges;

/// Counters collected over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub fetched_records: usize,
    pub dropped_records: usize,
    pub out_of_scope: usize,
    pub candidates: usize,
    pub duplicate_keys: usize,
    pub scraped_groups: usize,
    pub unchanged_groups: usize,
    pub created_entities: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub start_sync_day: NaiveDate,
    pub stats: SyncStats,
    pub summary: SyncSummary,
}

impl SyncReport {
    pub fn brief_markdown(&self) -> String {
        let s = &self.stats;
        format!(
            "# Lesson Sync Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Sync window from: {}\n\n## Input\n- scraped groups: {}\n- unchanged groups: {}\n- fetched records: {}\n- dropped records: {}\n- out of scope: {}\n- candidates: {}\n- duplicate keys: {}\n- created entities: {}\n\n## Changes\n- added: {}\n- updated: {}\n- removed: {}\n",
            self.run_id,
            self.started_at,
            self.finished_at,
            self.start_sync_day,
            s.scraped_groups,
            s.unchanged_groups,
            s.fetched_records,
            s.dropped_records,
            s.out_of_scope,
            s.candidates,
            s.duplicate_keys,
            s.created_entities,
            s.added,
            s.updated,
            s.removed,
        )
    }
}

/// Collects stats during a run and turns the final changes into a report.
#[derive(Debug, Clone)]
pub struct SyncSummaryBuilder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    start_sync_day: NaiveDate,
    pub stats: SyncStats,
}

impl SyncSummaryBuilder {
    pub fn new(run_id: Uuid, start_sync_day: NaiveDate) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            start_sync_day,
            stats: SyncStats::default(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn finish(mut self, changes: &LessonChanges) -> SyncReport {
        self.stats.added = changes.added.len();
        self.stats.updated = changes.updated.len();
        self.stats.removed = changes.removed.len();
        self.stats.duplicate_keys = changes.duplicate_keys;
        SyncReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            start_sync_day: self.start_sync_day,
            stats: self.stats,
            summary: changes.to_summary(),
        }
    }

    /// Report for a run that found nothing to sync.
    pub fn finish_empty(self) -> SyncReport {
        self.finish(&LessonChanges::default())
    }
}
