//! Turns normalized records into lesson rows ready for comparison.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use classync_core::{EntityId, Lesson, NormalizedLesson, CLASSROOM, PERIOD, SUBJECT, TEACHER};
use classync_storage::EntityStore;
use tracing::info;

use crate::hooks::{NewEntityHook, PlainInsert, TeacherShortName};
use crate::resolver::EntityResolver;
use crate::SyncError;

static PLAIN_INSERT: PlainInsert = PlainInsert;
static TEACHER_SHORT_NAME: TeacherShortName = TeacherShortName;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateBatch {
    pub candidates: Vec<Lesson>,
    /// Records outside the scraped groups or before the start day.
    pub out_of_scope: usize,
}

pub struct LessonCandidateBuilder<'a> {
    teachers: EntityResolver<'a>,
    classrooms: EntityResolver<'a>,
    subjects: EntityResolver<'a>,
    periods: EntityResolver<'a>,
}

impl<'a> LessonCandidateBuilder<'a> {
    pub fn new(store: &'a dyn EntityStore, period_hook: &'a dyn NewEntityHook) -> Self {
        Self {
            teachers: EntityResolver::new(TEACHER, store, &TEACHER_SHORT_NAME),
            classrooms: EntityResolver::new(CLASSROOM, store, &PLAIN_INSERT),
            subjects: EntityResolver::new(SUBJECT, store, &PLAIN_INSERT),
            periods: EntityResolver::new(PERIOD, store, period_hook),
        }
    }

    /// Entity rows created while building, over all four kinds.
    pub fn created_entities(&self) -> usize {
        self.teachers.created()
            + self.classrooms.created()
            + self.subjects.created()
            + self.periods.created()
    }

    /// Build one candidate per in-scope record.
    ///
    /// All keys are queued first and each resolver runs once, so every
    /// lookup and insert for a kind happens in a single pass. Every candidate
    /// carries the same `updated_at`.
    pub async fn build(
        &mut self,
        records: &[NormalizedLesson],
        scraped_groups: &BTreeSet<EntityId>,
        start_sync_day: NaiveDate,
        updated_at: DateTime<Utc>,
    ) -> Result<CandidateBatch, SyncError> {
        let kept: Vec<&NormalizedLesson> = records
            .iter()
            .filter(|r| scraped_groups.contains(&r.group_id) && r.period.date >= start_sync_day)
            .collect();
        let out_of_scope = records.len() - kept.len();

        for record in &kept {
            self.teachers.add(record.teacher.natural_key())?;
            self.classrooms.add(record.classroom.natural_key())?;
            self.subjects.add(record.subject.natural_key())?;
            self.periods.add(record.period.natural_key())?;
        }
        self.teachers.resolve_pending().await?;
        self.classrooms.resolve_pending().await?;
        self.subjects.resolve_pending().await?;
        self.periods.resolve_pending().await?;

        let mut candidates = Vec::with_capacity(kept.len());
        for record in kept {
            candidates.push(Lesson {
                id: None,
                group_id: record.group_id,
                period_id: self.periods.id_for(&record.period.natural_key()).await?,
                subject_id: self.subjects.id_for(&record.subject.natural_key()).await?,
                teacher_id: self.teachers.id_for(&record.teacher.natural_key()).await?,
                classroom_id: self.classrooms.id_for(&record.classroom.natural_key()).await?,
                subgroup: record.subgroup.to_string(),
                is_active: true,
                created_at: None,
                updated_at,
            });
        }

        info!(
            candidates = candidates.len(),
            out_of_scope,
            created_entities = self.created_entities(),
            "lesson candidates built"
        );
        Ok(CandidateBatch {
            candidates,
            out_of_scope,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use classync_core::{PeriodKey, TeacherKey, TitleKey};
    use classync_storage::MemoryStore;

    use super::*;

    fn record(group_id: EntityId, day: u32, n: u8, subject: &str) -> NormalizedLesson {
        NormalizedLesson {
            group_id,
            period: PeriodKey {
                date: NaiveDate::from_ymd_opt(2026, 10, day).unwrap(),
                lesson_number: n,
            },
            subject: TitleKey { title: subject.to_string() },
            classroom: TitleKey { title: "214".to_string() },
            teacher: TeacherKey { full_name: "Иванов Иван Иванович".to_string() },
            subgroup: 1,
        }
    }

    #[tokio::test]
    async fn keeps_scraped_groups_from_the_start_day_on() {
        let store = MemoryStore::new();
        let mut builder = LessonCandidateBuilder::new(&store, &PLAIN_INSERT);
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 6, 0, 0).unwrap();
        let records = vec![
            record(5, 19, 1, "Математика"),
            record(5, 20, 2, "Физика"),
            record(5, 18, 1, "Химия"),
            record(9, 19, 1, "История"),
        ];

        let batch = builder
            .build(
                &records,
                &BTreeSet::from([5]),
                NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
                at,
            )
            .await
            .unwrap();

        assert_eq!(batch.candidates.len(), 2);
        assert_eq!(batch.out_of_scope, 2);
        assert!(batch.candidates.iter().all(|c| c.updated_at == at && c.subgroup == "1"));
        assert_eq!(batch.candidates[0].teacher_id, batch.candidates[1].teacher_id);
        assert_ne!(batch.candidates[0].period_id, batch.candidates[1].period_id);
        assert_eq!(store.entity_count(&SUBJECT).await, 2);
        // teacher + classroom + 2 subjects + 2 periods
        assert_eq!(builder.created_entities(), 6);
    }
}
