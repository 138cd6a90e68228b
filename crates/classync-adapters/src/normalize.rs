//! Raw lesson record validation and normalization.

use chrono::NaiveDate;
use classync_core::{
    NormalizedLesson, PeriodKey, RawLesson, RawValue, TeacherKey, TitleKey,
    CLASSROOM_DEFAULT_TITLE, LESSON_NUMBER_MAX, LESSON_NUMBER_MIN, MAX_CLASSROOM_TITLE_LENGTH,
    MAX_SUBJECT_TITLE_LENGTH, MAX_TEACHER_FULLNAME_LENGTH, SUBGROUP_DEFAULT, SUBGROUP_MAX,
    SUBGROUP_MIN, SUBJECT_DEFAULT_TITLE, TEACHER_DEFAULT_NAME,
};
use thiserror::Error;
use tracing::warn;

const DATE_FORMATS: [&str; 2] = ["%d.%m.%Y", "%Y-%m-%d"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Missing { field: &'static str },
    #[error("{field} value {value:?} is not an integer")]
    NotInteger { field: &'static str, value: String },
    #[error("{field} value {value} is outside the valid range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("{field} value {value} must be >= 0")]
    Negative { field: &'static str, value: i64 },
    #[error("date value {value:?} matches neither DD.MM.YYYY nor YYYY-MM-DD")]
    BadDate { value: String },
}

/// A record rejected during normalization, by position in the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedRecord {
    pub index: usize,
    pub error: ValidationError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedBatch {
    pub lessons: Vec<NormalizedLesson>,
    pub dropped: Vec<DroppedRecord>,
}

/// Turn one raw record into the canonical candidate shape.
///
/// `group_id`, `date` and `lesson_number` are required. Text fields are
/// stripped, truncated to their column width and defaulted when blank;
/// a blank subgroup means the whole group.
pub fn normalize_lesson(raw: &RawLesson) -> Result<NormalizedLesson, ValidationError> {
    let group_id = parse_int("group_id", required("group_id", raw.group_id.as_ref())?)?;
    if group_id < 0 {
        return Err(ValidationError::Negative {
            field: "group_id",
            value: group_id,
        });
    }
    let date = parse_date(required("date", raw.date.as_ref())?)?;
    let lesson_number = bounded_int(
        "lesson_number",
        required("lesson_number", raw.lesson_number.as_ref())?,
        LESSON_NUMBER_MIN,
        LESSON_NUMBER_MAX,
    )?;
    let subgroup = match present(raw.subgroup.as_ref()) {
        Some(value) => bounded_int("subgroup", value, SUBGROUP_MIN, SUBGROUP_MAX)?,
        None => i64::from(SUBGROUP_DEFAULT),
    };

    Ok(NormalizedLesson {
        group_id,
        period: PeriodKey {
            date,
            lesson_number: lesson_number as u8,
        },
        subject: TitleKey {
            title: text_or_default(
                raw.subject_title.as_ref(),
                SUBJECT_DEFAULT_TITLE,
                MAX_SUBJECT_TITLE_LENGTH,
            ),
        },
        classroom: TitleKey {
            title: text_or_default(
                raw.classroom_title.as_ref(),
                CLASSROOM_DEFAULT_TITLE,
                MAX_CLASSROOM_TITLE_LENGTH,
            ),
        },
        teacher: TeacherKey {
            full_name: text_or_default(
                raw.teacher_fullname.as_ref(),
                TEACHER_DEFAULT_NAME,
                MAX_TEACHER_FULLNAME_LENGTH,
            ),
        },
        subgroup: subgroup as u8,
    })
}

/// Normalize every record, dropping malformed ones with a warning.
pub fn normalize_all<I>(records: I) -> NormalizedBatch
where
    I: IntoIterator<Item = RawLesson>,
{
    let mut batch = NormalizedBatch::default();
    for (index, raw) in records.into_iter().enumerate() {
        match normalize_lesson(&raw) {
            Ok(lesson) => batch.lessons.push(lesson),
            Err(error) => {
                warn!(record = index, %error, "dropping malformed lesson record");
                batch.dropped.push(DroppedRecord { index, error });
            }
        }
    }
    batch
}

/// Parse a date cell: an already-typed date, `DD.MM.YYYY`, `YYYY-MM-DD`, or
/// text containing a `D.M.YYYY` substring.
pub fn parse_date(value: &RawValue) -> Result<NaiveDate, ValidationError> {
    match value {
        RawValue::Date(date) => Ok(*date),
        RawValue::Text(text) => {
            let text = text.trim();
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
                .or_else(|| {
                    find_dotted_date(text)
                        .and_then(|found| NaiveDate::parse_from_str(found, "%d.%m.%Y").ok())
                })
                .ok_or_else(|| ValidationError::BadDate {
                    value: text.to_string(),
                })
        }
        other => Err(ValidationError::BadDate {
            value: other.to_string(),
        }),
    }
}

/// First `D.M.YYYY`-shaped substring (1-2 digit day and month) not glued to other digits.
pub fn find_dotted_date(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    (0..bytes.len()).find_map(|start| {
        if start > 0 && bytes[start - 1].is_ascii_digit() {
            return None;
        }
        let stop = start + match_dotted_date(&bytes[start..])?;
        if bytes.get(stop).is_some_and(u8::is_ascii_digit) {
            return None;
        }
        Some(&text[start..stop])
    })
}

fn match_dotted_date(bytes: &[u8]) -> Option<usize> {
    let mut pos = 0;
    for (part, (min, max)) in [(1, 2), (1, 2), (4, 4)].into_iter().enumerate() {
        let digits = bytes[pos..].iter().take_while(|b| b.is_ascii_digit()).count();
        if digits < min || digits > max {
            return None;
        }
        pos += digits;
        if part < 2 {
            if bytes.get(pos) != Some(&b'.') {
                return None;
            }
            pos += 1;
        }
    }
    Some(pos)
}

/// Value if present and not blank text.
fn present(value: Option<&RawValue>) -> Option<&RawValue> {
    value.filter(|v| !matches!(v, RawValue::Text(s) if s.trim().is_empty()))
}

fn required<'a>(
    field: &'static str,
    value: Option<&'a RawValue>,
) -> Result<&'a RawValue, ValidationError> {
    present(value).ok_or(ValidationError::Missing { field })
}

fn parse_int(field: &'static str, value: &RawValue) -> Result<i64, ValidationError> {
    let not_integer = || ValidationError::NotInteger {
        field,
        value: value.to_string(),
    };
    match value {
        RawValue::Int(v) => Ok(*v),
        RawValue::Float(v) if v.fract() == 0.0 && v.is_finite() => Ok(*v as i64),
        RawValue::Text(text) => text.trim().parse::<i64>().map_err(|_| not_integer()),
        _ => Err(not_integer()),
    }
}

fn bounded_int(
    field: &'static str,
    value: &RawValue,
    min: i64,
    max: i64,
) -> Result<i64, ValidationError> {
    let parsed = parse_int(field, value)?;
    if (min..=max).contains(&parsed) {
        Ok(parsed)
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value: parsed,
            min,
            max,
        })
    }
}

fn text_or_default(value: Option<&RawValue>, default: &str, max_chars: usize) -> String {
    let text = match value {
        Some(RawValue::Text(text)) => text.trim().to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let truncated = text.chars().take(max_chars).collect::<String>();
    let truncated = truncated.trim_end();
    if truncated.is_empty() {
        default.to_string()
    } else {
        truncated.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawLesson {
        RawLesson {
            group_id: Some(RawValue::Int(5)),
            date: Some(RawValue::text("19.10.2026")),
            lesson_number: Some(RawValue::text(" 2 ")),
            subject_title: Some(RawValue::text("  Математика ")),
            classroom_title: Some(RawValue::text("")),
            teacher_fullname: None,
            subgroup: Some(RawValue::text("")),
        }
    }

    #[test]
    fn blanks_become_defaults_and_text_is_stripped() {
        let lesson = normalize_lesson(&raw()).unwrap();
        assert_eq!(lesson.group_id, 5);
        assert_eq!(lesson.period.date, NaiveDate::from_ymd_opt(2026, 10, 19).unwrap());
        assert_eq!(lesson.period.lesson_number, 2);
        assert_eq!(lesson.subject.title, "Математика");
        assert_eq!(lesson.classroom.title, CLASSROOM_DEFAULT_TITLE);
        assert_eq!(lesson.teacher.full_name, TEACHER_DEFAULT_NAME);
        assert_eq!(lesson.subgroup, 0);
    }

    #[test]
    fn lesson_number_out_of_range_names_the_range() {
        let mut record = raw();
        record.lesson_number = Some(RawValue::Int(12));
        let err = normalize_lesson(&record).unwrap_err();
        assert_eq!(
            err,
            ValidationError::OutOfRange {
                field: "lesson_number",
                value: 12,
                min: 1,
                max: 9
            }
        );
        assert_eq!(
            err.to_string(),
            "lesson_number value 12 is outside the valid range 1..=9"
        );
    }

    #[test]
    fn required_fields_and_negative_group_are_rejected() {
        let mut record = raw();
        record.date = Some(RawValue::text("   "));
        assert_eq!(
            normalize_lesson(&record),
            Err(ValidationError::Missing { field: "date" })
        );

        let mut record = raw();
        record.group_id = Some(RawValue::Int(-1));
        assert!(matches!(
            normalize_lesson(&record),
            Err(ValidationError::Negative { field: "group_id", .. })
        ));

        let mut record = raw();
        record.subgroup = Some(RawValue::text("a"));
        assert!(matches!(
            normalize_lesson(&record),
            Err(ValidationError::NotInteger { field: "subgroup", .. })
        ));
    }

    #[test]
    fn dates_accept_several_shapes() {
        let expected = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        for value in [
            RawValue::text("19.10.2026"),
            RawValue::text("2026-10-19"),
            RawValue::text("Понедельник 19.10.2026"),
            RawValue::Date(expected),
        ] {
            assert_eq!(parse_date(&value), Ok(expected), "{value}");
        }
        assert!(matches!(
            parse_date(&RawValue::text("19/10/2026")),
            Err(ValidationError::BadDate { .. })
        ));
        assert!(parse_date(&RawValue::Int(20261019)).is_err());
    }

    #[test]
    fn long_titles_are_truncated_by_characters() {
        let mut record = raw();
        record.classroom_title = Some(RawValue::text("Спортивный зал"));
        let lesson = normalize_lesson(&record).unwrap();
        assert_eq!(lesson.classroom.title, "Спортивный");
    }

    #[test]
    fn integral_floats_and_numeric_titles_are_accepted() {
        let mut record = raw();
        record.lesson_number = Some(RawValue::Float(3.0));
        record.classroom_title = Some(RawValue::Int(214));
        let lesson = normalize_lesson(&record).unwrap();
        assert_eq!(lesson.period.lesson_number, 3);
        assert_eq!(lesson.classroom.title, "214");

        record.lesson_number = Some(RawValue::Float(3.5));
        assert!(normalize_lesson(&record).is_err());
    }

    #[test]
    fn batch_keeps_going_past_bad_records() {
        let mut bad = raw();
        bad.lesson_number = None;
        let batch = normalize_all(vec![raw(), bad, raw()]);
        assert_eq!(batch.lessons.len(), 2);
        assert_eq!(batch.dropped.len(), 1);
        assert_eq!(batch.dropped[0].index, 1);
    }

    #[test]
    fn dotted_date_search_ignores_longer_numbers() {
        assert_eq!(find_dotted_date("на 19.10.2026 г."), Some("19.10.2026"));
        assert_eq!(find_dotted_date("119.10.2026"), None);
        assert_eq!(find_dotted_date("1.2.20261"), None);
        assert_eq!(find_dotted_date("1.2.2026"), Some("1.2.2026"));
    }
}
