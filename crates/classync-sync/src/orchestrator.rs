//! One lesson sync run: snapshot in, committed changes and summary out.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::Utc;
use classync_adapters::normalize_all;
use classync_core::{keys, EntityId, RawLesson, ScrapedLessonRecord, SyncSummary};
use classync_storage::{set_json, EntityStore, LessonStore, RunLock, SnapshotStore};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::apply::ChangeApplier;
use crate::candidates::LessonCandidateBuilder;
use crate::config::SyncConfig;
use crate::hooks::PeriodTimes;
use crate::reconcile::{LessonChanges, ReconciliationEngine};
use crate::summary::{SyncReport, SyncSummaryBuilder};
use crate::SyncError;

pub const PAGE_HASH_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const SYNCED_GROUPS_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const SCHEDULE_CHANGES_TTL: Duration = Duration::from_secs(60 * 60);

/// Hand-off read from the snapshot store. Missing keys read as empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotInput {
    pub records: Vec<ScrapedLessonRecord>,
    pub scraped_groups: BTreeMap<EntityId, String>,
    pub unchanged_groups: BTreeSet<EntityId>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GroupIdValue {
    Int(EntityId),
    Text(String),
}

pub struct LessonsSync<S, K> {
    store: S,
    snapshot: K,
    config: SyncConfig,
    period_hook: PeriodTimes,
}

impl<S, K> LessonsSync<S, K>
where
    S: EntityStore + LessonStore,
    K: SnapshotStore,
{
    pub fn new(store: S, snapshot: K, config: SyncConfig) -> Self {
        let period_hook = PeriodTimes::new(config.period_timetable.clone());
        Self {
            store,
            snapshot,
            config,
            period_hook,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn snapshot(&self) -> &K {
        &self.snapshot
    }

    /// Run one sync and return only the diff summary.
    pub async fn update_schedule(&self) -> Result<SyncSummary, SyncError> {
        Ok(self.run().await?.summary)
    }

    pub async fn run(&self) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id)
            .instrument(info_span!("lessons_sync", %run_id))
            .await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<SyncReport, SyncError> {
        let start_sync_day = self.config.start_day();
        let mut report = SyncSummaryBuilder::new(run_id, start_sync_day);

        let input = self.fetch_snapshot().await?;
        report.stats.fetched_records = input.records.len();
        report.stats.scraped_groups = input.scraped_groups.len();
        report.stats.unchanged_groups = input.unchanged_groups.len();
        if input.scraped_groups.is_empty() {
            info!("no scraped groups, nothing to sync");
            return Ok(report.finish_empty());
        }

        let lock = if self.config.run_lock {
            Some(self.store.acquire_run_lock().await?)
        } else {
            None
        };
        let result = self.sync_groups(&input, &mut report).await;
        release(lock).await;
        let changes = result?;

        let report = report.finish(&changes);
        self.write_bookkeeping(&input, &report.summary).await;
        info!(
            added = report.stats.added,
            updated = report.stats.updated,
            removed = report.stats.removed,
            "lesson sync finished"
        );
        Ok(report)
    }

    async fn sync_groups(
        &self,
        input: &SnapshotInput,
        report: &mut SyncSummaryBuilder,
    ) -> Result<LessonChanges, SyncError> {
        let start_sync_day = self.config.start_day();
        let normalized = normalize_all(input.records.iter().cloned().map(RawLesson::from));
        report.stats.dropped_records = normalized.dropped.len();

        let scope: BTreeSet<EntityId> = input.scraped_groups.keys().copied().collect();
        let mut builder = LessonCandidateBuilder::new(&self.store, &self.period_hook);
        let batch = builder
            .build(&normalized.lessons, &scope, start_sync_day, Utc::now())
            .await?;
        report.stats.candidates = batch.candidates.len();
        report.stats.out_of_scope = batch.out_of_scope;
        report.stats.created_entities = builder.created_entities();

        let group_ids: Vec<EntityId> = scope.iter().copied().collect();
        let existing = self.store.find_active(&group_ids, start_sync_day).await?;

        let engine = ReconciliationEngine::new(&self.config.comparison);
        let mut changes = engine.reconcile(batch.candidates, existing, &scope);

        ChangeApplier::new(self.config.batch_size(), self.config.comparison.update_fields())
            .apply(&self.store, &mut changes)
            .await?;
        Ok(changes)
    }

    pub async fn fetch_snapshot(&self) -> Result<SnapshotInput, SyncError> {
        let records: Vec<ScrapedLessonRecord> =
            self.read_json(keys::SCRAPED_LESSONS).await?.unwrap_or_default();
        let scraped_groups: BTreeMap<EntityId, String> =
            self.read_json(keys::SCRAPED_GROUPS).await?.unwrap_or_default();
        let unchanged: Vec<GroupIdValue> =
            self.read_json(keys::UNCHANGED_GROUPS).await?.unwrap_or_default();
        let unchanged_groups = unchanged
            .into_iter()
            .map(|value| match value {
                GroupIdValue::Int(id) => Ok(id),
                GroupIdValue::Text(text) => {
                    text.trim().parse().map_err(|_| SyncError::Snapshot {
                        key: keys::UNCHANGED_GROUPS,
                        detail: format!("group id {text:?} is not an integer"),
                    })
                }
            })
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok(SnapshotInput {
            records,
            scraped_groups,
            unchanged_groups,
        })
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &'static str) -> Result<Option<T>, SyncError> {
        let Some(raw) = self.snapshot.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| SyncError::Snapshot {
                key,
                detail: e.to_string(),
            })
    }

    /// Hashes, synced-group set and change cache for the next run. Failures
    /// are logged and dropped; the lesson data is already committed.
    /// The main-page hash is read at write time, not at fetch time.
    async fn write_bookkeeping(&self, input: &SnapshotInput, summary: &SyncSummary) {
        let hashes: Vec<(String, String)> = input
            .scraped_groups
            .iter()
            .filter(|(_, hash)| !hash.is_empty())
            .map(|(id, hash)| (keys::page_hash(id), hash.clone()))
            .collect();
        if !hashes.is_empty() {
            if let Err(error) = self.snapshot.set_many_ex(&hashes, PAGE_HASH_TTL).await {
                warn!(%error, "could not store page hashes");
            }
        }

        let main_hash = match self.snapshot.get(keys::MAIN_PAGE_HASH).await {
            Ok(hash) => hash.filter(|hash| !hash.is_empty()),
            Err(error) => {
                warn!(%error, "could not read the main page hash");
                None
            }
        };
        if let Some(main_hash) = main_hash {
            let key = keys::synced_groups(&main_hash);
            let members: Vec<String> = input
                .scraped_groups
                .keys()
                .chain(input.unchanged_groups.iter())
                .map(|id| id.to_string())
                .collect();
            let stored = match self.snapshot.sadd(&key, &members).await {
                Ok(_) => self.snapshot.expire(&key, SYNCED_GROUPS_TTL).await.map(|_| ()),
                Err(error) => Err(error),
            };
            if let Err(error) = stored {
                warn!(%error, key = %key, "could not store synced groups");
            }
        }

        if let Err(error) = set_json(
            &self.snapshot,
            keys::SCHEDULE_CHANGES,
            summary,
            Some(SCHEDULE_CHANGES_TTL),
        )
        .await
        {
            warn!(%error, "could not cache schedule changes");
        }
    }
}

async fn release(lock: Option<Box<dyn RunLock>>) {
    if let Some(lock) = lock {
        if let Err(error) = lock.release().await {
            warn!(%error, "could not release run lock");
        }
    }
}
