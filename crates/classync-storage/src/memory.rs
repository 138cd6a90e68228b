//! In-process store used by tests and by `sync --memory`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use classync_core::{EntityId, EntitySpec, Lesson, LessonField, LessonKey, NaturalKey, SqlValue};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::lookup::LookupPlan;
use crate::ports::{EntityStore, LessonStore, LessonTx, NewEntity, RunLock};
use crate::StoreError;

#[derive(Debug, Clone, Default)]
struct EntityTable {
    rows: BTreeMap<NaturalKey, StoredEntity>,
}

#[derive(Debug, Clone)]
struct StoredEntity {
    id: EntityId,
    extra: Vec<(&'static str, SqlValue)>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    entities: HashMap<&'static str, EntityTable>,
    lessons: BTreeMap<EntityId, Lesson>,
    next_id: EntityId,
}

impl MemoryState {
    fn allocate_id(&mut self) -> EntityId {
        self.next_id += 1;
        self.next_id
    }

    fn period_dates(&self) -> HashMap<EntityId, NaiveDate> {
        self.entities
            .get("period")
            .map(|table| {
                table
                    .rows
                    .iter()
                    .filter_map(|(key, row)| match key.values().first() {
                        Some(SqlValue::Date(date)) => Some((row.id, *date)),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn check_active_keys(&self) -> Result<(), StoreError> {
        let mut seen = HashSet::<LessonKey>::new();
        for lesson in self.lessons.values().filter(|l| l.is_active) {
            let key = lesson.key();
            if !seen.insert(key.clone()) {
                return Err(StoreError::UniqueViolation {
                    table: "lesson".to_string(),
                    detail: format!(
                        "active lesson ({}, {}, {}) already exists",
                        key.group_id, key.period_id, key.subgroup
                    ),
                });
            }
        }
        Ok(())
    }
}

/// `EntityStore` + `LessonStore` over shared in-memory tables.
///
/// Clones share state. Entity natural keys and active lesson keys are unique
/// just as the PostgreSQL schema enforces them.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    run_lock: Arc<Mutex<()>>,
    lookup_queries: Arc<AtomicUsize>,
    fail_lesson_inserts: Arc<AtomicBool>,
    fail_entity_inserts: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lookup queries an SQL backend would have issued so far.
    pub fn lookup_queries(&self) -> usize {
        self.lookup_queries.load(Ordering::SeqCst)
    }

    /// Make every following `bulk_insert` fail until switched off.
    pub fn fail_lesson_inserts(&self, fail: bool) {
        self.fail_lesson_inserts.store(fail, Ordering::SeqCst);
    }

    /// Make every following `insert_entities` fail with a unique violation,
    /// as when another writer inserted the same natural key first.
    pub fn fail_entity_inserts(&self, fail: bool) {
        self.fail_entity_inserts.store(fail, Ordering::SeqCst);
    }

    pub async fn seed_entity(
        &self,
        spec: &EntitySpec,
        key: NaturalKey,
    ) -> Result<EntityId, StoreError> {
        let mut state = self.state.lock().await;
        insert_entity(&mut state, spec, NewEntity::new(key))
    }

    /// Insert a lesson as if written by an earlier run; returns its id.
    pub async fn seed_lesson(&self, mut lesson: Lesson) -> Result<EntityId, StoreError> {
        let mut state = self.state.lock().await;
        let id = match lesson.id {
            Some(id) => {
                state.next_id = state.next_id.max(id);
                id
            }
            None => state.allocate_id(),
        };
        lesson.id = Some(id);
        if lesson.created_at.is_none() {
            lesson.created_at = Some(lesson.updated_at);
        }
        state.lessons.insert(id, lesson);
        Ok(id)
    }

    /// Every stored lesson, active or not, ordered by id.
    pub async fn lessons(&self) -> Vec<Lesson> {
        self.state.lock().await.lessons.values().cloned().collect()
    }

    pub async fn entity_count(&self, spec: &EntitySpec) -> usize {
        self.state
            .lock()
            .await
            .entities
            .get(spec.table)
            .map_or(0, |t| t.rows.len())
    }

    /// Derived columns stored alongside a natural key, if the row exists.
    pub async fn entity_extra(
        &self,
        spec: &EntitySpec,
        key: &NaturalKey,
    ) -> Option<Vec<(&'static str, SqlValue)>> {
        self.state
            .lock()
            .await
            .entities
            .get(spec.table)
            .and_then(|t| t.rows.get(key))
            .map(|row| row.extra.clone())
    }
}

fn insert_entity(
    state: &mut MemoryState,
    spec: &EntitySpec,
    row: NewEntity,
) -> Result<EntityId, StoreError> {
    if !row.key.conforms_to(spec) {
        return Err(StoreError::KeyShape {
            table: spec.table,
            key: row.key.to_string(),
        });
    }
    if state
        .entities
        .get(spec.table)
        .is_some_and(|t| t.rows.contains_key(&row.key))
    {
        return Err(StoreError::UniqueViolation {
            table: spec.table.to_string(),
            detail: format!("key {} already exists", row.key),
        });
    }
    let id = state.allocate_id();
    state.entities.entry(spec.table).or_default().rows.insert(
        row.key,
        StoredEntity {
            id,
            extra: row.extra,
        },
    );
    Ok(id)
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn find_ids(
        &self,
        spec: &EntitySpec,
        keys: &[NaturalKey],
    ) -> Result<HashMap<NaturalKey, EntityId>, StoreError> {
        if let Some(bad) = keys.iter().find(|k| !k.conforms_to(spec)) {
            return Err(StoreError::KeyShape {
                table: spec.table,
                key: bad.to_string(),
            });
        }
        self.lookup_queries.fetch_add(
            LookupPlan::for_key_count(keys.len()).query_count(),
            Ordering::SeqCst,
        );

        let state = self.state.lock().await;
        let Some(table) = state.entities.get(spec.table) else {
            return Ok(HashMap::new());
        };
        Ok(keys
            .iter()
            .filter_map(|key| table.rows.get(key).map(|row| (key.clone(), row.id)))
            .collect())
    }

    async fn insert_entities(
        &self,
        spec: &EntitySpec,
        rows: &[NewEntity],
    ) -> Result<u64, StoreError> {
        if self.fail_entity_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::UniqueViolation {
                table: spec.table.to_string(),
                detail: "key inserted concurrently (injected)".to_string(),
            });
        }
        let mut state = self.state.lock().await;
        // All-or-nothing, like the single INSERT transaction on PostgreSQL.
        let mut staged = state.clone();
        for row in rows {
            insert_entity(&mut staged, spec, row.clone())?;
        }
        *state = staged;
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl LessonStore for MemoryStore {
    async fn find_active(
        &self,
        group_ids: &[EntityId],
        date_from: NaiveDate,
    ) -> Result<Vec<Lesson>, StoreError> {
        let state = self.state.lock().await;
        let dates = state.period_dates();
        Ok(state
            .lessons
            .values()
            .filter(|l| l.is_active && group_ids.contains(&l.group_id))
            .filter(|l| dates.get(&l.period_id).is_some_and(|d| *d >= date_from))
            .cloned()
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn LessonTx>, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            staged,
            fail_inserts: self.fail_lesson_inserts.load(Ordering::SeqCst),
        }))
    }

    async fn acquire_run_lock(&self) -> Result<Box<dyn RunLock>, StoreError> {
        let guard = Arc::clone(&self.run_lock).lock_owned().await;
        Ok(Box::new(MemoryRunLock { _guard: guard }))
    }
}

/// Writes go to a staged copy; `commit` swaps it in, drop discards it.
struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
    fail_inserts: bool,
}

#[async_trait]
impl LessonTx for MemoryTx {
    async fn delete_by_ids(&mut self, ids: &[EntityId]) -> Result<u64, StoreError> {
        let mut deleted = 0;
        for id in ids {
            if self.staged.lessons.remove(id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn bulk_update(
        &mut self,
        rows: &[Lesson],
        fields: &[LessonField],
    ) -> Result<u64, StoreError> {
        let mut updated = 0;
        for row in rows {
            let id = row.id.ok_or(StoreError::MissingId { entity: "Lesson" })?;
            let Some(stored) = self.staged.lessons.get_mut(&id) else {
                continue;
            };
            for field in fields.iter().filter(|f| **f != LessonField::CreatedAt) {
                stored.copy_field_from(row, *field);
            }
            updated += 1;
        }
        self.staged.check_active_keys()?;
        Ok(updated)
    }

    async fn bulk_insert(&mut self, rows: &[Lesson]) -> Result<Vec<EntityId>, StoreError> {
        if self.fail_inserts {
            return Err(StoreError::Unavailable(
                "lesson insert failed (injected)".to_string(),
            ));
        }
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id = self.staged.allocate_id();
            let mut lesson = row.clone();
            lesson.id = Some(id);
            lesson.created_at = Some(row.updated_at);
            self.staged.lessons.insert(id, lesson);
            ids.push(id);
        }
        self.staged.check_active_keys()?;
        Ok(ids)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTx {
            mut guard, staged, ..
        } = *self;
        *guard = staged;
        Ok(())
    }
}

struct MemoryRunLock {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl RunLock for MemoryRunLock {
    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use classync_core::{PeriodKey, TEACHER, PERIOD};

    fn period_key(day: u32, n: u8) -> NaturalKey {
        PeriodKey {
            date: NaiveDate::from_ymd_opt(2026, 10, day).unwrap(),
            lesson_number: n,
        }
        .natural_key()
    }

    fn lesson(group_id: EntityId, period_id: EntityId, subject_id: EntityId) -> Lesson {
        Lesson {
            id: None,
            group_id,
            period_id,
            subject_id,
            teacher_id: 1,
            classroom_id: 1,
            subgroup: "0".to_string(),
            is_active: true,
            created_at: None,
            updated_at: Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn duplicate_natural_key_is_a_unique_violation() {
        let store = MemoryStore::new();
        let key = NaturalKey::single(SqlValue::text("Петров Пётр Петрович"));
        store.seed_entity(&TEACHER, key.clone()).await.unwrap();

        let err = store
            .insert_entities(&TEACHER, &[NewEntity::new(key)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { .. }));
        assert_eq!(store.entity_count(&TEACHER).await, 1);
    }

    #[tokio::test]
    async fn find_active_filters_by_group_and_period_date() {
        let store = MemoryStore::new();
        let early = store.seed_entity(&PERIOD, period_key(5, 1)).await.unwrap();
        let late = store.seed_entity(&PERIOD, period_key(20, 1)).await.unwrap();
        store.seed_lesson(lesson(5, early, 1)).await.unwrap();
        let kept = store.seed_lesson(lesson(5, late, 1)).await.unwrap();
        store.seed_lesson(lesson(6, late, 1)).await.unwrap();

        let found = store
            .find_active(&[5], NaiveDate::from_ymd_opt(2026, 10, 19).unwrap())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, Some(kept));
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_state_untouched() {
        let store = MemoryStore::new();
        let period = store.seed_entity(&PERIOD, period_key(20, 2)).await.unwrap();
        let id = store.seed_lesson(lesson(5, period, 1)).await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            assert_eq!(tx.delete_by_ids(&[id]).await.unwrap(), 1);
        }
        assert_eq!(store.lessons().await.len(), 1);

        let mut tx = store.begin().await.unwrap();
        tx.delete_by_ids(&[id]).await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.lessons().await.is_empty());
    }

    #[tokio::test]
    async fn second_active_lesson_for_a_slot_is_rejected() {
        let store = MemoryStore::new();
        let period = store.seed_entity(&PERIOD, period_key(20, 2)).await.unwrap();
        store.seed_lesson(lesson(5, period, 1)).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = tx.bulk_insert(&[lesson(5, period, 2)]).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { .. }));
    }

    #[test]
    fn lookups_are_counted_by_plan() {
        let store = MemoryStore::new();
        let keys = (1..=25)
            .map(|i| NaturalKey::single(SqlValue::text(format!("teacher {i}"))))
            .collect::<Vec<_>>();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            store.find_ids(&TEACHER, &keys[..3]).await.unwrap();
            store.find_ids(&TEACHER, &keys).await.unwrap();
            store.find_ids(&TEACHER, &[]).await.unwrap();
        });
        assert_eq!(store.lookup_queries(), 2);
    }
}
