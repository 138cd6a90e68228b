//! Full sync runs against a live PostgreSQL when `DATABASE_URL` is set.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::NaiveDate;
use classync_core::{
    keys, EntityId, NaturalKey, NormalizedLesson, PeriodKey, ScrapedLessonRecord, SqlValue,
    SyncSummary, TeacherKey, TitleKey, SUBJECT, TEACHER,
};
use classync_storage::{set_json, EntityStore, LessonStore, MemorySnapshotStore, PgStore};
use classync_sync::{LessonsSync, SyncConfig};
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

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
}

fn record(group_id: EntityId, d: u32, n: u8, subject: &str) -> NormalizedLesson {
    NormalizedLesson {
        group_id,
        period: PeriodKey {
            date: day(d),
            lesson_number: n,
        },
        subject: TitleKey {
            title: subject.to_string(),
        },
        classroom: TitleKey {
            title: "214".to_string(),
        },
        teacher: TeacherKey {
            full_name: "Иванов Иван Иванович".to_string(),
        },
        subgroup: 0,
    }
}

async fn hand_off(snapshot: &MemorySnapshotStore, records: &[NormalizedLesson]) {
    let scraped: Vec<ScrapedLessonRecord> = records.iter().map(ScrapedLessonRecord::from).collect();
    let groups = BTreeMap::from([(5 as EntityId, "hash-5".to_string())]);
    set_json(snapshot, keys::SCRAPED_LESSONS, &scraped, None)
        .await
        .unwrap();
    set_json(snapshot, keys::SCRAPED_GROUPS, &groups, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn sync_against_postgres_is_idempotent_and_applies_every_change_kind() {
    let Some(scratch) = Scratch::open().await else {
        return;
    };
    let snapshot = MemorySnapshotStore::new();
    let sync = LessonsSync::new(
        scratch.store.clone(),
        snapshot.clone(),
        SyncConfig {
            start_sync_day: Some(day(19)),
            ..SyncConfig::default()
        },
    );

    // Twelve periods puts the period lookup on the unnest path.
    let mut records = (1..=9)
        .map(|n| record(5, 19, n, "Математика"))
        .chain((1..=3).map(|n| record(5, 20, n, "Физика")))
        .collect::<Vec<_>>();
    hand_off(&snapshot, &records).await;

    let first = sync.update_schedule().await.unwrap();
    assert_eq!(first.added.len(), 12);
    assert!(first.added.iter().all(|l| l.id.is_some()));
    assert_eq!(sync.update_schedule().await.unwrap(), SyncSummary::empty());

    let teacher = NaturalKey::single(SqlValue::text("Иванов Иван Иванович"));
    let teachers = scratch.store.find_ids(&TEACHER, &[teacher]).await.unwrap();
    assert_eq!(teachers.len(), 1);

    records[0] = record(5, 19, 1, "Химия");
    records.pop();
    hand_off(&snapshot, &records).await;
    let second = sync.update_schedule().await.unwrap();
    assert_eq!(second.added.len(), 0);
    assert_eq!(second.updated.len(), 1);
    assert_eq!(second.removed.len(), 1);

    let chemistry = scratch
        .store
        .find_ids(&SUBJECT, &[NaturalKey::single(SqlValue::text("Химия"))])
        .await
        .unwrap();
    let active = scratch.store.find_active(&[5], day(19)).await.unwrap();
    assert_eq!(active.len(), 11);
    assert_eq!(
        active
            .iter()
            .filter(|l| chemistry.values().any(|id| *id == l.subject_id))
            .count(),
        1
    );
    assert_eq!(sync.update_schedule().await.unwrap(), SyncSummary::empty());

    scratch.close().await;
}
