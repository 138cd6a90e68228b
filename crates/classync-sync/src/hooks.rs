//! Per-entity hooks run on natural keys before new rows are inserted.

use classync_core::{NaturalKey, SqlValue, TEACHER_DEFAULT_NAME};
use classync_storage::NewEntity;

use crate::config::PeriodTimetable;

pub trait NewEntityHook: Send + Sync {
    fn prepare(&self, key: &NaturalKey) -> NewEntity;
}

/// Inserts the natural key columns only.
#[derive(Debug, Default)]
pub struct PlainInsert;

impl NewEntityHook for PlainInsert {
    fn prepare(&self, key: &NaturalKey) -> NewEntity {
        NewEntity::new(key.clone())
    }
}

/// Fills `teacher.short_name` from the full name.
#[derive(Debug, Default)]
pub struct TeacherShortName;

impl NewEntityHook for TeacherShortName {
    fn prepare(&self, key: &NaturalKey) -> NewEntity {
        let short = match key.values().first() {
            Some(SqlValue::Text(full_name)) => short_name(full_name),
            _ => String::new(),
        };
        NewEntity {
            key: key.clone(),
            extra: vec![("short_name", SqlValue::Text(short))],
        }
    }
}

/// `"Иванов Иван Иванович"` → `"Иванов И.И."`.
pub fn short_name(full_name: &str) -> String {
    let trimmed = full_name.trim();
    if trimmed.is_empty() || trimmed == TEACHER_DEFAULT_NAME {
        return TEACHER_DEFAULT_NAME.to_string();
    }
    let mut parts = trimmed.split_whitespace();
    let Some(surname) = parts.next() else {
        return trimmed.to_string();
    };
    let initials: String = parts
        .filter_map(|part| part.chars().next())
        .map(|c| format!("{c}."))
        .collect();
    if initials.is_empty() {
        surname.to_string()
    } else {
        format!("{surname} {initials}")
    }
}

/// Fills `period.start_time` / `period.end_time` from the weekday timetable.
#[derive(Debug, Default)]
pub struct PeriodTimes {
    timetable: PeriodTimetable,
}

impl PeriodTimes {
    pub fn new(timetable: PeriodTimetable) -> Self {
        Self { timetable }
    }
}

impl NewEntityHook for PeriodTimes {
    fn prepare(&self, key: &NaturalKey) -> NewEntity {
        let slot = match key.values() {
            [SqlValue::Date(date), SqlValue::Int(number)] => u8::try_from(*number)
                .ok()
                .and_then(|n| self.timetable.slot(*date, n)),
            _ => None,
        };
        let (start, end) = match slot {
            Some(slot) => (SqlValue::Time(slot.start), SqlValue::Time(slot.end)),
            None => (SqlValue::Null, SqlValue::Null),
        };
        NewEntity {
            key: key.clone(),
            extra: vec![("start_time", start), ("end_time", end)],
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{NaiveDate, NaiveTime, Weekday};
    use classync_core::PeriodKey;

    use super::*;
    use crate::config::LessonSlot;

    #[test]
    fn short_names_use_initials() {
        assert_eq!(short_name("Иванов Иван Иванович"), "Иванов И.И.");
        assert_eq!(short_name("  Петрова Анна "), "Петрова А.");
        assert_eq!(short_name("Сидоров"), "Сидоров");
        assert_eq!(short_name(""), TEACHER_DEFAULT_NAME);
        assert_eq!(short_name(TEACHER_DEFAULT_NAME), TEACHER_DEFAULT_NAME);
    }

    #[test]
    fn period_times_come_from_the_weekday_template() {
        let hook = PeriodTimes::new(PeriodTimetable::new(HashMap::from([(
            Weekday::Mon,
            vec![LessonSlot {
                lesson_number: 2,
                start: NaiveTime::from_hms_opt(10, 10, 0).unwrap(),
                end: NaiveTime::from_hms_opt(11, 40, 0).unwrap(),
            }],
        )])));
        let monday = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();

        let known = hook.prepare(&PeriodKey { date: monday, lesson_number: 2 }.natural_key());
        assert_eq!(
            known.extra,
            vec![
                ("start_time", SqlValue::Time(NaiveTime::from_hms_opt(10, 10, 0).unwrap())),
                ("end_time", SqlValue::Time(NaiveTime::from_hms_opt(11, 40, 0).unwrap())),
            ]
        );

        let unknown = hook.prepare(&PeriodKey { date: monday, lesson_number: 7 }.natural_key());
        assert_eq!(
            unknown.extra,
            vec![("start_time", SqlValue::Null), ("end_time", SqlValue::Null)]
        );
    }
}
