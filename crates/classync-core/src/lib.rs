//! Core domain model for the lesson sync pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "classync-core";

pub type EntityId = i64;

pub const SUBJECT_DEFAULT_TITLE: &str = "Не указано";
pub const TEACHER_DEFAULT_NAME: &str = "Не указано";
pub const CLASSROOM_DEFAULT_TITLE: &str = "(дист)";
pub const SUBGROUP_DEFAULT: u8 = 0;

pub const MAX_SUBJECT_TITLE_LENGTH: usize = 255;
pub const MAX_CLASSROOM_TITLE_LENGTH: usize = 10;
pub const MAX_TEACHER_FULLNAME_LENGTH: usize = 64;

pub const LESSON_NUMBER_MIN: i64 = 1;
pub const LESSON_NUMBER_MAX: i64 = 9;
pub const SUBGROUP_MIN: i64 = 0;
pub const SUBGROUP_MAX: i64 = 9;

/// Keys shared between the scraper hand-off and the sync bookkeeping.
pub mod keys {
    pub const SCRAPED_LESSONS: &str = "scraped_lessons";
    pub const SCRAPED_GROUPS: &str = "scraped_groups";
    pub const UNCHANGED_GROUPS: &str = "unchanged_groups";
    pub const MAIN_PAGE_HASH: &str = "main_page_hash";
    pub const SCHEDULE_CHANGES: &str = "schedule_changes";
    pub const SCRAPE_SUMMARY: &str = "scrape_summary";
    pub const PAGE_HASH_PREFIX: &str = "page_hash:";
    pub const SYNCED_GROUPS_PREFIX: &str = "synced_groups:";

    pub fn page_hash(group_id: impl std::fmt::Display) -> String {
        format!("{PAGE_HASH_PREFIX}{group_id}")
    }

    pub fn synced_groups(main_page_hash: &str) -> String {
        format!("{SYNCED_GROUPS_PREFIX}{main_page_hash}")
    }
}

/// A single column value of a natural key or of an auto-created row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SqlValue {
    Int(i64),
    Date(NaiveDate),
    Time(NaiveTime),
    Text(String),
    Null,
}

impl SqlValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Self::Int(_) => Some(FieldType::Int),
            Self::Date(_) => Some(FieldType::Date),
            Self::Time(_) => Some(FieldType::Time),
            Self::Text(_) => Some(FieldType::Text),
            Self::Null => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Self::Time(v) => write!(f, "{}", v.format("%H:%M")),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Null => f.write_str("NULL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int,
    Date,
    Time,
    Text,
}

impl FieldType {
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Int => "bigint",
            Self::Date => "date",
            Self::Time => "time",
            Self::Text => "text",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyField {
    pub name: &'static str,
    pub ty: FieldType,
}

/// Describes a natural-key entity table: which columns identify a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySpec {
    pub name: &'static str,
    pub table: &'static str,
    pub key_fields: &'static [KeyField],
}

impl EntitySpec {
    pub fn arity(&self) -> usize {
        self.key_fields.len()
    }
}

pub const TEACHER: EntitySpec = EntitySpec {
    name: "Teacher",
    table: "teacher",
    key_fields: &[KeyField {
        name: "full_name",
        ty: FieldType::Text,
    }],
};

pub const CLASSROOM: EntitySpec = EntitySpec {
    name: "Classroom",
    table: "classroom",
    key_fields: &[KeyField {
        name: "title",
        ty: FieldType::Text,
    }],
};

pub const SUBJECT: EntitySpec = EntitySpec {
    name: "Subject",
    table: "subject",
    key_fields: &[KeyField {
        name: "title",
        ty: FieldType::Text,
    }],
};

pub const PERIOD: EntitySpec = EntitySpec {
    name: "Period",
    table: "period",
    key_fields: &[
        KeyField {
            name: "date",
            ty: FieldType::Date,
        },
        KeyField {
            name: "lesson_number",
            ty: FieldType::Int,
        },
    ],
};

/// Ordered tuple of key values, one per `EntitySpec::key_fields` entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey(Vec<SqlValue>);

impl NaturalKey {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self(values)
    }

    pub fn single(value: SqlValue) -> Self {
        Self(vec![value])
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.0
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    /// True when every value matches the declared column type of `spec`.
    pub fn conforms_to(&self, spec: &EntitySpec) -> bool {
        self.arity() == spec.arity()
            && self
                .0
                .iter()
                .zip(spec.key_fields)
                .all(|(value, field)| value.field_type() == Some(field.ty))
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str(")")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeriodKey {
    pub date: NaiveDate,
    pub lesson_number: u8,
}

impl PeriodKey {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(vec![
            SqlValue::Date(self.date),
            SqlValue::Int(i64::from(self.lesson_number)),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TitleKey {
    pub title: String,
}

impl TitleKey {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::single(SqlValue::text(self.title.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TeacherKey {
    pub full_name: String,
}

impl TeacherKey {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::single(SqlValue::text(self.full_name.clone()))
    }
}

/// Canonical lesson-candidate shape produced by normalization.
///
/// Serializes to the nested `{group_id, period{..}, subject{..}, classroom{..},
/// teacher{..}, subgroup}` layout the scraper hand-off uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedLesson {
    pub group_id: EntityId,
    pub period: PeriodKey,
    pub subject: TitleKey,
    pub classroom: TitleKey,
    pub teacher: TeacherKey,
    pub subgroup: u8,
}

/// Loosely typed scalar as it arrives from scraped pages, exports or JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    Text(String),
}

impl RawValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// Flat, unvalidated lesson record (one HTML table row or one CSV row).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawLesson {
    #[serde(default)]
    pub group_id: Option<RawValue>,
    #[serde(default)]
    pub date: Option<RawValue>,
    #[serde(default)]
    pub lesson_number: Option<RawValue>,
    #[serde(default)]
    pub subject_title: Option<RawValue>,
    #[serde(default)]
    pub classroom_title: Option<RawValue>,
    #[serde(default)]
    pub teacher_fullname: Option<RawValue>,
    #[serde(default)]
    pub subgroup: Option<RawValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapedPeriod {
    #[serde(default)]
    pub date: Option<RawValue>,
    #[serde(default)]
    pub lesson_number: Option<RawValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapedTitle {
    #[serde(default)]
    pub title: Option<RawValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapedTeacher {
    #[serde(default)]
    pub full_name: Option<RawValue>,
}

/// Nested record as stored under `scraped_lessons` in the snapshot store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapedLessonRecord {
    #[serde(default)]
    pub group_id: Option<RawValue>,
    #[serde(default)]
    pub period: ScrapedPeriod,
    #[serde(default)]
    pub subject: ScrapedTitle,
    #[serde(default)]
    pub classroom: ScrapedTitle,
    #[serde(default)]
    pub teacher: ScrapedTeacher,
    #[serde(default)]
    pub subgroup: Option<RawValue>,
}

impl From<ScrapedLessonRecord> for RawLesson {
    fn from(record: ScrapedLessonRecord) -> Self {
        Self {
            group_id: record.group_id,
            date: record.period.date,
            lesson_number: record.period.lesson_number,
            subject_title: record.subject.title,
            classroom_title: record.classroom.title,
            teacher_fullname: record.teacher.full_name,
            subgroup: record.subgroup,
        }
    }
}

impl From<&NormalizedLesson> for ScrapedLessonRecord {
    fn from(lesson: &NormalizedLesson) -> Self {
        Self {
            group_id: Some(RawValue::Int(lesson.group_id)),
            period: ScrapedPeriod {
                date: Some(RawValue::Date(lesson.period.date)),
                lesson_number: Some(RawValue::Int(i64::from(lesson.period.lesson_number))),
            },
            subject: ScrapedTitle {
                title: Some(RawValue::text(lesson.subject.title.clone())),
            },
            classroom: ScrapedTitle {
                title: Some(RawValue::text(lesson.classroom.title.clone())),
            },
            teacher: ScrapedTeacher {
                full_name: Some(RawValue::text(lesson.teacher.full_name.clone())),
            },
            subgroup: Some(RawValue::Int(i64::from(lesson.subgroup))),
        }
    }
}

/// Composite natural key of a lesson slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LessonKey {
    pub group_id: EntityId,
    pub period_id: EntityId,
    pub subgroup: String,
}

/// Non-key lesson columns that reconciliation can compare or persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonField {
    SubjectId,
    ClassroomId,
    TeacherId,
    UpdatedAt,
    CreatedAt,
}

impl LessonField {
    pub const ALL: [LessonField; 5] = [
        Self::SubjectId,
        Self::ClassroomId,
        Self::TeacherId,
        Self::UpdatedAt,
        Self::CreatedAt,
    ];

    pub fn column(self) -> &'static str {
        match self {
            Self::SubjectId => "subject_id",
            Self::ClassroomId => "classroom_id",
            Self::TeacherId => "teacher_id",
            Self::UpdatedAt => "updated_at",
            Self::CreatedAt => "created_at",
        }
    }

    pub fn is_timestamp(self) -> bool {
        matches!(self, Self::UpdatedAt | Self::CreatedAt)
    }
}

impl fmt::Display for LessonField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for LessonField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|field| field.column() == s.trim())
            .ok_or_else(|| format!("unknown lesson field: {s}"))
    }
}

/// One scheduled class occurrence for a group, subgroup and period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: Option<EntityId>,
    pub group_id: EntityId,
    pub period_id: EntityId,
    pub subject_id: EntityId,
    pub teacher_id: EntityId,
    pub classroom_id: EntityId,
    pub subgroup: String,
    pub is_active: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Lesson {
    pub fn key(&self) -> LessonKey {
        LessonKey {
            group_id: self.group_id,
            period_id: self.period_id,
            subgroup: self.subgroup.clone(),
        }
    }

    /// Id-valued field, `None` for timestamps.
    pub fn id_field(&self, field: LessonField) -> Option<EntityId> {
        match field {
            LessonField::SubjectId => Some(self.subject_id),
            LessonField::ClassroomId => Some(self.classroom_id),
            LessonField::TeacherId => Some(self.teacher_id),
            LessonField::UpdatedAt | LessonField::CreatedAt => None,
        }
    }

    pub fn copy_field_from(&mut self, other: &Lesson, field: LessonField) {
        match field {
            LessonField::SubjectId => self.subject_id = other.subject_id,
            LessonField::ClassroomId => self.classroom_id = other.classroom_id,
            LessonField::TeacherId => self.teacher_id = other.teacher_id,
            LessonField::UpdatedAt => self.updated_at = other.updated_at,
            LessonField::CreatedAt => self.created_at = other.created_at,
        }
    }

    pub fn to_dict(&self) -> LessonDict {
        LessonDict {
            id: self.id,
            group_id: self.group_id,
            period_id: self.period_id,
            subject_id: self.subject_id,
            teacher_id: self.teacher_id,
            classroom_id: self.classroom_id,
            subgroup: self.subgroup.clone(),
        }
    }
}

/// Flat projection of a lesson handed to notification consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonDict {
    pub id: Option<EntityId>,
    pub group_id: EntityId,
    pub period_id: EntityId,
    pub subject_id: EntityId,
    pub teacher_id: EntityId,
    pub classroom_id: EntityId,
    pub subgroup: String,
}

/// Diff summary of one sync run. All three keys are always serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    #[serde(default)]
    pub added: Vec<LessonDict>,
    #[serde(default)]
    pub updated: Vec<LessonDict>,
    #[serde(default)]
    pub removed: Vec<LessonDict>,
}

impl SyncSummary {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_summary_serializes_all_three_keys() {
        let json = serde_json::to_value(SyncSummary::empty()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"added": [], "updated": [], "removed": []})
        );
    }

    #[test]
    fn scraped_record_accepts_mixed_scalar_types() {
        let record: ScrapedLessonRecord = serde_json::from_value(serde_json::json!({
            "group_id": 5,
            "period": {"date": "2026-10-19", "lesson_number": "3"},
            "subject": {"title": "Математика"},
            "classroom": {"title": ""},
            "teacher": {"full_name": "Иванов Иван Иванович"},
            "subgroup": "0"
        }))
        .unwrap();
        let raw = RawLesson::from(record);
        assert_eq!(raw.group_id, Some(RawValue::Int(5)));
        assert_eq!(
            raw.date,
            Some(RawValue::Date(NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()))
        );
        assert_eq!(raw.lesson_number, Some(RawValue::text("3")));
        assert_eq!(raw.classroom_title, Some(RawValue::text("")));
    }

    #[test]
    fn period_key_conforms_to_period_spec() {
        let key = PeriodKey {
            date: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
            lesson_number: 2,
        }
        .natural_key();
        assert!(key.conforms_to(&PERIOD));
        assert!(!key.conforms_to(&TEACHER));
        assert_eq!(key.to_string(), "(2026-10-19, 2)");
    }

    #[test]
    fn lesson_field_parses_from_column_name() {
        assert_eq!("teacher_id".parse::<LessonField>(), Ok(LessonField::TeacherId));
        assert!("subgroup".parse::<LessonField>().is_err());
        assert!(LessonField::UpdatedAt.is_timestamp());
    }
}
