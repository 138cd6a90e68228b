//! Writes one run's lesson changes in a single transaction.

use classync_core::{EntityId, LessonField};
use classync_storage::LessonStore;
use tracing::info;

use crate::reconcile::LessonChanges;
use crate::SyncError;

#[derive(Debug, Clone)]
pub struct ChangeApplier {
    batch_size: usize,
    update_fields: Vec<LessonField>,
}

impl ChangeApplier {
    pub fn new(batch_size: usize, update_fields: Vec<LessonField>) -> Self {
        Self {
            batch_size: batch_size.max(1),
            update_fields,
        }
    }

    /// Delete, then update, then insert, all in one transaction.
    ///
    /// Added rows get their new ids. On error the transaction is dropped
    /// uncommitted and nothing is visible.
    pub async fn apply<S>(&self, store: &S, changes: &mut LessonChanges) -> Result<(), SyncError>
    where
        S: LessonStore + ?Sized,
    {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = store.begin().await?;

        let removed_ids: Vec<EntityId> = changes.removed.iter().filter_map(|l| l.id).collect();
        let mut deleted = 0;
        for chunk in removed_ids.chunks(self.batch_size) {
            deleted += tx.delete_by_ids(chunk).await?;
        }

        let mut updated = 0;
        for chunk in changes.updated.chunks(self.batch_size) {
            updated += tx.bulk_update(chunk, &self.update_fields).await?;
        }

        let mut new_ids = Vec::with_capacity(changes.added.len());
        for chunk in changes.added.chunks(self.batch_size) {
            new_ids.extend(tx.bulk_insert(chunk).await?);
        }

        tx.commit().await?;

        for (lesson, id) in changes.added.iter_mut().zip(new_ids) {
            lesson.id = Some(id);
        }
        info!(
            deleted,
            updated,
            inserted = changes.added.len(),
            batch_size = self.batch_size,
            "lesson changes committed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{NaiveDate, TimeZone, Utc};
    use classync_core::{Lesson, PeriodKey, PERIOD};
    use classync_storage::MemoryStore;

    use super::*;
    use crate::config::ComparisonConfig;
    use crate::reconcile::ReconciliationEngine;

    fn lesson(period_id: EntityId, subgroup: &str) -> Lesson {
        Lesson {
            id: None,
            group_id: 5,
            period_id,
            subject_id: 1,
            teacher_id: 1,
            classroom_id: 1,
            subgroup: subgroup.to_string(),
            is_active: true,
            created_at: None,
            updated_at: Utc.with_ymd_and_hms(2026, 10, 19, 6, 0, 0).unwrap(),
        }
    }

    async fn period(store: &MemoryStore, n: u8) -> EntityId {
        store
            .seed_entity(
                &PERIOD,
                PeriodKey {
                    date: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
                    lesson_number: n,
                }
                .natural_key(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn inserts_in_small_batches_and_assigns_ids() {
        let store = MemoryStore::new();
        let mut changes = LessonChanges::default();
        for n in 1..=5 {
            changes.added.push(lesson(period(&store, n).await, "0"));
        }
        let applier = ChangeApplier::new(2, ComparisonConfig::default().update_fields());
        applier.apply(&store, &mut changes).await.unwrap();

        assert!(changes.added.iter().all(|l| l.id.is_some()));
        assert_eq!(store.lessons().await.len(), 5);
    }

    #[tokio::test]
    async fn failed_insert_rolls_back_deletes_and_updates() {
        let store = MemoryStore::new();
        let p1 = period(&store, 1).await;
        let p2 = period(&store, 2).await;
        store.seed_lesson(lesson(p1, "0")).await.unwrap();
        let before = store.lessons().await;

        let engine = ReconciliationEngine::default();
        let mut changes = engine.reconcile(
            vec![lesson(p2, "1")],
            store
                .find_active(&[5], NaiveDate::from_ymd_opt(2026, 10, 19).unwrap())
                .await
                .unwrap(),
            &BTreeSet::from([5]),
        );
        assert_eq!(changes.removed.len(), 1);

        store.fail_lesson_inserts(true);
        let applier = ChangeApplier::new(1000, ComparisonConfig::default().update_fields());
        assert!(applier.apply(&store, &mut changes).await.is_err());
        assert_eq!(store.lessons().await, before);
    }
}
