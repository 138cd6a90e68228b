//! Storage ports the sync pipeline is written against.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use classync_core::{EntityId, EntitySpec, Lesson, LessonField, NaturalKey, SqlValue};

use crate::StoreError;

/// A natural-key row to create, with any derived columns filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntity {
    pub key: NaturalKey,
    pub extra: Vec<(&'static str, SqlValue)>,
}

impl NewEntity {
    pub fn new(key: NaturalKey) -> Self {
        Self {
            key,
            extra: Vec::new(),
        }
    }
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Look up surrogate ids for `keys`; keys without a row are absent from the map.
    async fn find_ids(
        &self,
        spec: &EntitySpec,
        keys: &[NaturalKey],
    ) -> Result<HashMap<NaturalKey, EntityId>, StoreError>;

    /// Insert rows; a natural key that already exists is a `UniqueViolation`.
    async fn insert_entities(&self, spec: &EntitySpec, rows: &[NewEntity])
        -> Result<u64, StoreError>;
}

#[async_trait]
pub trait LessonStore: Send + Sync {
    /// Active lessons of `group_ids` whose period date is on or after `date_from`.
    async fn find_active(
        &self,
        group_ids: &[EntityId],
        date_from: NaiveDate,
    ) -> Result<Vec<Lesson>, StoreError>;

    /// Open a write transaction. Dropping it without `commit` rolls back.
    async fn begin(&self) -> Result<Box<dyn LessonTx>, StoreError>;

    /// Block until this process holds the single sync-run lock.
    async fn acquire_run_lock(&self) -> Result<Box<dyn RunLock>, StoreError>;
}

#[async_trait]
pub trait LessonTx: Send {
    async fn delete_by_ids(&mut self, ids: &[EntityId]) -> Result<u64, StoreError>;

    /// Write only `fields` of each row, matched by id.
    async fn bulk_update(
        &mut self,
        rows: &[Lesson],
        fields: &[LessonField],
    ) -> Result<u64, StoreError>;

    /// Insert rows and return their new ids in input order.
    async fn bulk_insert(&mut self, rows: &[Lesson]) -> Result<Vec<EntityId>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RunLock: Send {
    async fn release(self: Box<Self>) -> Result<(), StoreError>;
}
