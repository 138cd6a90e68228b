//! Runs against a live PostgreSQL when `DATABASE_URL` is set; each test
//! migrates and then drops its own schema.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::NaiveDate;
use classync_core::{EntityId, NaturalKey, PeriodKey, SqlValue, PERIOD, TEACHER};
use classync_storage::{EntityStore, NewEntity, PgStore, StoreError, SMALL_LOOKUP_LIMIT};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use uuid::Uuid;

struct Scratch {
    store: PgStore,
    admin: PgPool,
    schema: String,
}

impl Scratch {
    async fn open() -> Option<Self> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL is not set; skipping");
            return None;
        };
        let schema = format!("classync_test_{}", Uuid::new_v4().simple());
        let admin = PgPool::connect(&url).await.unwrap();
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&admin)
            .await
            .unwrap();
        let options = PgConnectOptions::from_str(&url)
            .unwrap()
            .options([("search_path", schema.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .unwrap();
        let store = PgStore::from_pool(pool);
        store.migrate().await.unwrap();
        Some(Self {
            store,
            admin,
            schema,
        })
    }

    async fn close(self) {
        self.store.pool().close().await;
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&self.admin)
            .await
            .unwrap();
    }
}

fn teacher_keys(count: usize) -> Vec<NaturalKey> {
    (0..count)
        .map(|i| NaturalKey::single(SqlValue::text(format!("Преподаватель {i:04}"))))
        .collect()
}

fn period_keys() -> Vec<NaturalKey> {
    [19, 20]
        .into_iter()
        .flat_map(|d| {
            (1..=9).map(move |n| {
                PeriodKey {
                    date: NaiveDate::from_ymd_opt(2026, 10, d).unwrap(),
                    lesson_number: n,
                }
                .natural_key()
            })
        })
        .collect()
}

fn subset(
    ids: &HashMap<NaturalKey, EntityId>,
    keys: &[NaturalKey],
) -> HashMap<NaturalKey, EntityId> {
    keys.iter()
        .filter_map(|k| ids.get(k).map(|id| (k.clone(), *id)))
        .collect()
}

#[tokio::test]
async fn or_filter_and_unnest_lookups_agree() {
    let Some(scratch) = Scratch::open().await else {
        return;
    };
    let store = &scratch.store;

    // Past one insert chunk and one lookup chunk.
    let teachers = teacher_keys(1500);
    let rows = teachers.iter().cloned().map(NewEntity::new).collect::<Vec<_>>();
    assert_eq!(store.insert_entities(&TEACHER, &rows).await.unwrap(), 1500);

    let small = store
        .find_ids(&TEACHER, &teachers[..SMALL_LOOKUP_LIMIT])
        .await
        .unwrap();
    let large = store.find_ids(&TEACHER, &teachers).await.unwrap();
    assert_eq!(small.len(), SMALL_LOOKUP_LIMIT);
    assert_eq!(large.len(), 1500);
    assert_eq!(small, subset(&large, &teachers[..SMALL_LOOKUP_LIMIT]));

    let periods = period_keys();
    let rows = periods.iter().cloned().map(NewEntity::new).collect::<Vec<_>>();
    store.insert_entities(&PERIOD, &rows).await.unwrap();
    let small = store.find_ids(&PERIOD, &periods[..4]).await.unwrap();
    let large = store.find_ids(&PERIOD, &periods).await.unwrap();
    assert_eq!(large.len(), periods.len());
    assert_eq!(small, subset(&large, &periods[..4]));

    scratch.close().await;
}

#[tokio::test]
async fn unknown_keys_are_absent_and_duplicates_violate_uniqueness() {
    let Some(scratch) = Scratch::open().await else {
        return;
    };
    let store = &scratch.store;
    let keys = teacher_keys(12);
    let rows = keys[..6].iter().cloned().map(NewEntity::new).collect::<Vec<_>>();
    store.insert_entities(&TEACHER, &rows).await.unwrap();

    let found = store.find_ids(&TEACHER, &keys).await.unwrap();
    assert_eq!(found.len(), 6);
    assert!(keys[6..].iter().all(|k| !found.contains_key(k)));

    let err = store
        .insert_entities(&TEACHER, &[NewEntity::new(keys[0].clone())])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UniqueViolation { .. }));
    assert!(err.is_retryable());

    scratch.close().await;
}
