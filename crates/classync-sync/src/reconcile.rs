//! Three-way diff of candidate lessons against stored active lessons.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use classync_core::{EntityId, Lesson, LessonField, LessonKey, SyncSummary};
use tracing::{info, warn};

use crate::config::ComparisonConfig;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LessonChanges {
    pub added: Vec<Lesson>,
    /// Stored rows already carrying the new field values and timestamp.
    pub updated: Vec<Lesson>,
    pub removed: Vec<Lesson>,
    pub duplicate_keys: usize,
}

impl LessonChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn to_summary(&self) -> SyncSummary {
        SyncSummary {
            added: self.added.iter().map(Lesson::to_dict).collect(),
            updated: self.updated.iter().map(Lesson::to_dict).collect(),
            removed: self.removed.iter().map(Lesson::to_dict).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    compare_fields: Vec<LessonField>,
    update_fields: Vec<LessonField>,
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new(&ComparisonConfig::default())
    }
}

impl ReconciliationEngine {
    pub fn new(comparison: &ComparisonConfig) -> Self {
        Self {
            compare_fields: comparison.effective_fields(),
            update_fields: comparison.update_fields(),
        }
    }

    pub fn compare_fields(&self) -> &[LessonField] {
        &self.compare_fields
    }

    /// Match candidates to `existing` by `(group_id, period_id, subgroup)`.
    ///
    /// Stored rows whose group is not in `scope_groups` are left alone.
    /// A key repeated among the candidates keeps its last occurrence. When
    /// storage already holds several active rows for one key, the lowest id
    /// is matched and the rest are removed.
    pub fn reconcile(
        &self,
        candidates: Vec<Lesson>,
        existing: Vec<Lesson>,
        scope_groups: &BTreeSet<EntityId>,
    ) -> LessonChanges {
        let mut changes = LessonChanges::default();

        let mut by_key: BTreeMap<LessonKey, Lesson> = BTreeMap::new();
        for candidate in candidates {
            let key = candidate.key();
            if by_key.insert(key.clone(), candidate).is_some() {
                warn!(
                    group_id = key.group_id,
                    period_id = key.period_id,
                    subgroup = %key.subgroup,
                    "duplicate candidate key, keeping the last one"
                );
                changes.duplicate_keys += 1;
            }
        }

        let mut existing: Vec<Lesson> = existing
            .into_iter()
            .filter(|l| scope_groups.contains(&l.group_id))
            .collect();
        existing.sort_by_key(|l| l.id);

        let mut matched: HashSet<LessonKey> = HashSet::new();
        for mut row in existing {
            let key = row.key();
            if matched.contains(&key) {
                warn!(id = ?row.id, group_id = key.group_id, "extra active row for one slot");
                changes.removed.push(row);
                continue;
            }
            match by_key.get(&key) {
                Some(candidate) => {
                    matched.insert(key);
                    if self.differs(&row, candidate) {
                        for field in &self.update_fields {
                            row.copy_field_from(candidate, *field);
                        }
                        changes.updated.push(row);
                    }
                }
                None => changes.removed.push(row),
            }
        }

        changes.added = by_key
            .into_iter()
            .filter(|(key, _)| !matched.contains(key))
            .map(|(_, lesson)| lesson)
            .collect();

        info!(
            added = changes.added.len(),
            updated = changes.updated.len(),
            removed = changes.removed.len(),
            duplicate_keys = changes.duplicate_keys,
            "lessons reconciled"
        );
        changes
    }

    fn differs(&self, stored: &Lesson, candidate: &Lesson) -> bool {
        self.compare_fields
            .iter()
            .any(|field| stored.id_field(*field) != candidate.id_field(*field))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, hour, 0, 0).unwrap()
    }

    fn lesson(id: Option<EntityId>, group_id: EntityId, period_id: EntityId, subject_id: EntityId) -> Lesson {
        Lesson {
            id,
            group_id,
            period_id,
            subject_id,
            teacher_id: 10,
            classroom_id: 20,
            subgroup: "0".to_string(),
            is_active: true,
            created_at: id.map(|_| at(1)),
            updated_at: if id.is_some() { at(1) } else { at(9) },
        }
    }

    #[test]
    fn changed_subject_updates_the_stored_row_in_place() {
        let engine = ReconciliationEngine::default();
        let changes = engine.reconcile(
            vec![lesson(None, 5, 100, 2)],
            vec![lesson(Some(1), 5, 100, 1)],
            &BTreeSet::from([5]),
        );
        assert!(changes.added.is_empty() && changes.removed.is_empty());
        let row = &changes.updated[0];
        assert_eq!(row.id, Some(1));
        assert_eq!(row.subject_id, 2);
        assert_eq!(row.updated_at, at(9));
        assert_eq!(row.created_at, Some(at(1)));
    }

    #[test]
    fn timestamps_alone_do_not_count_as_changes() {
        let engine = ReconciliationEngine::default();
        let changes = engine.reconcile(
            vec![lesson(None, 5, 100, 1)],
            vec![lesson(Some(1), 5, 100, 1)],
            &BTreeSet::from([5]),
        );
        assert!(changes.is_empty());
    }

    #[test]
    fn ignored_fields_are_not_compared() {
        let engine = ReconciliationEngine::new(&ComparisonConfig {
            ignore_fields: vec![LessonField::SubjectId],
            ..ComparisonConfig::default()
        });
        let changes = engine.reconcile(
            vec![lesson(None, 5, 100, 2)],
            vec![lesson(Some(1), 5, 100, 1)],
            &BTreeSet::from([5]),
        );
        assert!(changes.is_empty());
    }

    #[test]
    fn rows_outside_scope_are_never_removed() {
        let engine = ReconciliationEngine::default();
        let changes = engine.reconcile(
            vec![lesson(None, 7, 200, 1)],
            vec![lesson(Some(1), 5, 100, 1), lesson(Some(2), 6, 100, 1)],
            &BTreeSet::from([5, 7]),
        );
        assert_eq!(changes.removed.len(), 1);
        assert_eq!(changes.removed[0].id, Some(1));
        assert_eq!(changes.added.len(), 1);
        assert_eq!(changes.added[0].group_id, 7);
    }

    #[test]
    fn duplicate_candidates_keep_the_last_one() {
        let engine = ReconciliationEngine::default();
        let changes = engine.reconcile(
            vec![lesson(None, 5, 100, 1), lesson(None, 5, 100, 3)],
            Vec::new(),
            &BTreeSet::from([5]),
        );
        assert_eq!(changes.duplicate_keys, 1);
        assert_eq!(changes.added.len(), 1);
        assert_eq!(changes.added[0].subject_id, 3);
    }

    #[test]
    fn extra_stored_rows_for_one_slot_are_removed() {
        let engine = ReconciliationEngine::default();
        let changes = engine.reconcile(
            vec![lesson(None, 5, 100, 1)],
            vec![lesson(Some(8), 5, 100, 1), lesson(Some(3), 5, 100, 1)],
            &BTreeSet::from([5]),
        );
        assert!(changes.added.is_empty() && changes.updated.is_empty());
        assert_eq!(changes.removed.len(), 1);
        assert_eq!(changes.removed[0].id, Some(8));
    }

    #[test]
    fn summary_lists_flat_dicts() {
        let engine = ReconciliationEngine::default();
        let changes = engine.reconcile(
            Vec::new(),
            vec![lesson(Some(4), 5, 100, 1)],
            &BTreeSet::from([5]),
        );
        let summary = changes.to_summary();
        assert_eq!(summary.removed.len(), 1);
        assert_eq!(summary.removed[0].id, Some(4));
        assert!(summary.added.is_empty() && summary.updated.is_empty());
    }
}
