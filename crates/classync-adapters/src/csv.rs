//! Spreadsheet export import (`group;date;lesson_number;subject;cabinet;teacher;subgroup`).

use std::collections::{BTreeSet, HashMap};
use std::mem::take;

use classync_core::{EntityId, NormalizedLesson, RawLesson, RawValue};
use tracing::{info, warn};

use crate::normalize::normalize_lesson;
use crate::publish::ScrapeSummary;
use crate::AdapterError;

/// Quote- and CRLF-tolerant delimited text parser. Blank lines are skipped.
pub fn parse_rows(text: &str, sep: char) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut field = String::new();
    let mut row = Vec::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                if in_quotes && matches!(chars.peek(), Some('"')) {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = !in_quotes;
                }
            }
            c if c == sep && !in_quotes => row.push(take(&mut field)),
            '\n' | '\r' if !in_quotes => {
                if ch == '\r' && matches!(chars.peek(), Some('\n')) {
                    chars.next();
                }
                row.push(take(&mut field));
                if row.len() == 1 && row[0].trim().is_empty() {
                    row.clear();
                } else {
                    rows.push(take(&mut row));
                }
            }
            _ => field.push(ch),
        }
    }

    row.push(field);
    if !(row.len() == 1 && row[0].trim().is_empty()) {
        rows.push(row);
    }
    rows
}

/// `;` when the header line uses it and has no comma, otherwise `,`.
pub fn detect_delimiter(text: &str) -> char {
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.contains(';') && !first_line.contains(',') {
        ';'
    } else {
        ','
    }
}

/// Letters and digits only, lowercased, for matching group titles across sources.
pub fn normalize_group_name(name: &str) -> String {
    name.chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_ascii_alphanumeric() || ('а'..='я').contains(c) || *c == 'ё')
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvImport {
    pub lessons: Vec<NormalizedLesson>,
    /// Groups with at least one listed or parsed row and no failed rows.
    pub groups: BTreeSet<EntityId>,
    pub failed_groups: BTreeSet<EntityId>,
    pub skipped_rows: usize,
    pub summary: ScrapeSummary,
}

struct Columns {
    group: usize,
    date: usize,
    lesson_number: usize,
    subject: Option<usize>,
    classroom: Option<usize>,
    teacher: Option<usize>,
    subgroup: Option<usize>,
}

impl Columns {
    fn from_header(header: &[String]) -> Result<Self, AdapterError> {
        let position = |name: &str| {
            header
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
        };
        let required = |name: &'static str| position(name).ok_or(AdapterError::MissingColumn(name));
        Ok(Self {
            group: required("group")?,
            date: required("date")?,
            lesson_number: required("lesson_number")?,
            subject: position("subject"),
            classroom: position("cabinet").or_else(|| position("classroom")),
            teacher: position("teacher"),
            subgroup: position("subgroup"),
        })
    }
}

/// Maps export rows onto known groups and teachers.
#[derive(Debug, Clone, Default)]
pub struct CsvImporter {
    groups: HashMap<String, EntityId>,
    teachers: HashMap<String, String>,
}

impl CsvImporter {
    /// `groups` pairs a group title with its id; `teachers` maps short names to full names.
    pub fn new<G>(groups: G, teachers: HashMap<String, String>) -> Self
    where
        G: IntoIterator<Item = (String, EntityId)>,
    {
        Self {
            groups: groups
                .into_iter()
                .map(|(title, id)| (normalize_group_name(&title), id))
                .filter(|(title, _)| !title.is_empty())
                .collect(),
            teachers,
        }
    }

    pub fn group_id(&self, title: &str) -> Option<EntityId> {
        self.groups.get(&normalize_group_name(title)).copied()
    }

    /// Import an export file.
    ///
    /// When `listed_groups` is given, those titles define the processed groups
    /// (so a listed group with no rows still counts as synced and empty);
    /// otherwise every known group seen in the rows does. Rows for unknown
    /// groups are skipped; a row that fails to parse fails its whole group.
    pub fn import(
        &self,
        text: &str,
        listed_groups: Option<&[String]>,
    ) -> Result<CsvImport, AdapterError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut rows = parse_rows(text, detect_delimiter(text)).into_iter();
        let header = rows.next().ok_or(AdapterError::MissingColumn("group"))?;
        let columns = Columns::from_header(&header)?;

        let mut out = CsvImport {
            summary: ScrapeSummary {
                total_groups: self.groups.len(),
                ..ScrapeSummary::default()
            },
            ..CsvImport::default()
        };

        let mut processed = BTreeSet::new();
        if let Some(listed) = listed_groups {
            for (line, title) in listed.iter().enumerate() {
                if normalize_group_name(title).is_empty() {
                    continue;
                }
                match self.group_id(title) {
                    Some(id) => {
                        processed.insert(id);
                    }
                    None => {
                        warn!(line = line + 1, title = %title.trim(), "listed group is unknown");
                        out.summary.skipped += 1;
                    }
                }
            }
        }

        let mut lessons = Vec::new();
        for (index, row) in rows.enumerate() {
            let row_number = index + 1;
            let cell = |idx: usize| row.get(idx).map(|s| s.trim()).unwrap_or_default();
            let title = cell(columns.group);
            let Some(group_id) = self.group_id(title) else {
                warn!(row = row_number, group = %title, "row group is unknown, skipping");
                out.skipped_rows += 1;
                continue;
            };
            if listed_groups.is_none() {
                processed.insert(group_id);
            }

            match normalize_lesson(&self.raw_lesson(&row, &columns, group_id)) {
                Ok(lesson) => lessons.push(lesson),
                Err(error) => {
                    warn!(row = row_number, group_id, %error, "row failed, group marked failed");
                    out.failed_groups.insert(group_id);
                }
            }
        }

        if processed.is_empty() {
            return Err(AdapterError::NoGroups);
        }
        out.groups = processed.difference(&out.failed_groups).copied().collect();
        if out.groups.is_empty() {
            return Err(AdapterError::NoValidGroups);
        }
        out.lessons = lessons
            .into_iter()
            .filter(|l| out.groups.contains(&l.group_id))
            .collect();

        out.summary.parsed = out.groups.len();
        out.summary.errors = out.failed_groups.len();
        out.summary.error_groups = out.failed_groups.iter().map(|id| id.to_string()).collect();
        out.summary.total_lessons = out.lessons.len();
        out.summary.closing_reason = "csv_import_finished".to_string();
        info!(
            lessons = out.lessons.len(),
            groups = out.groups.len(),
            failed = out.failed_groups.len(),
            "csv export imported"
        );
        Ok(out)
    }

    fn raw_lesson(&self, row: &[String], columns: &Columns, group_id: EntityId) -> RawLesson {
        let text = |idx: Option<usize>| {
            idx.and_then(|i| row.get(i))
                .map(|s| RawValue::text(s.trim()))
        };
        let teacher = text(columns.teacher).map(|value| match value {
            RawValue::Text(short) => {
                RawValue::Text(self.teachers.get(&short).cloned().unwrap_or(short))
            }
            other => other,
        });
        RawLesson {
            group_id: Some(RawValue::Int(group_id)),
            date: text(Some(columns.date)),
            lesson_number: text(Some(columns.lesson_number)),
            subject_title: text(columns.subject),
            classroom_title: text(columns.classroom),
            teacher_fullname: teacher,
            subgroup: text(columns.subgroup),
        }
    }
}
