//! Group timetable page extraction.

use classync_core::{EntityId, RawLesson, RawValue};
use scraper::{ElementRef, Html, Selector};

use crate::normalize::find_dotted_date;
use crate::AdapterError;

const DATE_ROW_LENGTH: usize = 1;
const LESSON_ROW_LENGTH: usize = 5;

/// Pulls raw lesson rows out of one group's schedule page.
///
/// The page is a table of `tr.shadow` rows: a single-cell row opens a date,
/// five-cell rows that follow are that date's lessons in
/// `lesson_number, subject, classroom, teacher, subgroup` order.
#[derive(Debug, Clone)]
pub struct SchedulePageExtractor {
    rows: Selector,
    cells: Selector,
}

impl SchedulePageExtractor {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            rows: parse_selector("tr.shadow")?,
            cells: parse_selector("td")?,
        })
    }

    /// Extract every lesson row; any malformed row rejects the whole page.
    pub fn extract(&self, html: &str, group_id: EntityId) -> Result<Vec<RawLesson>, AdapterError> {
        let document = Html::parse_document(html);
        let mut lessons = Vec::new();
        let mut current_date: Option<String> = None;
        let mut previous: Option<(String, i64)> = None;
        let mut saw_row = false;

        for (row_index, row) in document.select(&self.rows).enumerate() {
            saw_row = true;
            let cells = row.select(&self.cells).map(cell_text).collect::<Vec<_>>();
            match cells.len() {
                DATE_ROW_LENGTH => {
                    let date = find_dotted_date(&cells[0]).ok_or_else(|| AdapterError::NoDate {
                        row: row_index,
                        text: cells[0].clone(),
                    })?;
                    current_date = Some(date.to_string());
                }
                LESSON_ROW_LENGTH => {
                    let Some(date) = current_date.clone() else {
                        return Err(AdapterError::LessonBeforeDate { row: row_index });
                    };
                    let lesson_number = cells[0].parse::<i64>().map_err(|_| {
                        AdapterError::BadLessonNumber {
                            row: row_index,
                            value: cells[0].clone(),
                        }
                    })?;
                    if let Some((previous_date, previous_number)) = &previous {
                        if *previous_date == date && lesson_number <= *previous_number {
                            return Err(AdapterError::LessonOrder {
                                row: row_index,
                                date,
                                lesson_number,
                                previous: *previous_number,
                            });
                        }
                    }
                    previous = Some((date.clone(), lesson_number));

                    let mut cells = cells.into_iter();
                    let mut next_text = || cells.next().map(RawValue::Text);
                    let lesson_number = next_text();
                    lessons.push(RawLesson {
                        group_id: Some(RawValue::Int(group_id)),
                        date: Some(RawValue::Text(date)),
                        lesson_number,
                        subject_title: next_text(),
                        classroom_title: next_text(),
                        teacher_fullname: next_text(),
                        subgroup: next_text(),
                    });
                }
                other => {
                    return Err(AdapterError::RowShape {
                        row: row_index,
                        cells: other,
                    })
                }
            }
        }

        if !saw_row {
            return Err(AdapterError::EmptyPage);
        }
        Ok(lessons)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(rows: &str) -> String {
        format!("<html><body><table>{rows}</table></body></html>")
    }

    const DATE_ROW: &str = r#"<tr class="shadow"><td colspan="5">Понедельник - 19.10.2026</td></tr>"#;

    fn lesson_row(n: u8, subject: &str) -> String {
        format!(
            r#"<tr class="shadow"><td>{n}</td><td>{subject}</td><td>214</td><td>Иванов Иван Иванович</td><td></td></tr>"#
        )
    }

    #[test]
    fn lesson_rows_take_the_preceding_date() {
        let html = page(&format!(
            "{DATE_ROW}{}{}",
            lesson_row(1, "Математика"),
            lesson_row(3, "Физика")
        ));
        let lessons = SchedulePageExtractor::new().unwrap().extract(&html, 7).unwrap();
        assert_eq!(lessons.len(), 2);
        assert_eq!(lessons[0].group_id, Some(RawValue::Int(7)));
        assert_eq!(lessons[0].date, Some(RawValue::text("19.10.2026")));
        assert_eq!(lessons[1].lesson_number, Some(RawValue::text("3")));
        assert_eq!(lessons[1].subject_title, Some(RawValue::text("Физика")));
        assert_eq!(lessons[1].subgroup, Some(RawValue::text("")));
    }

    #[test]
    fn lessons_out_of_order_reject_the_page() {
        let html = page(&format!(
            "{DATE_ROW}{}{}",
            lesson_row(2, "Математика"),
            lesson_row(2, "Физика")
        ));
        let err = SchedulePageExtractor::new().unwrap().extract(&html, 7).unwrap_err();
        assert!(matches!(err, AdapterError::LessonOrder { lesson_number: 2, previous: 2, .. }));
    }

    #[test]
    fn numbering_restarts_with_each_date() {
        let second_date = DATE_ROW.replace("19.10.2026", "20.10.2026");
        let html = page(&format!(
            "{DATE_ROW}{}{second_date}{}",
            lesson_row(2, "Математика"),
            lesson_row(1, "Физика")
        ));
        let lessons = SchedulePageExtractor::new().unwrap().extract(&html, 7).unwrap();
        assert_eq!(lessons.len(), 2);
    }

    #[test]
    fn unexpected_shapes_are_errors() {
        let extractor = SchedulePageExtractor::new().unwrap();
        assert!(matches!(
            extractor.extract(&page(&lesson_row(1, "Математика")), 7),
            Err(AdapterError::LessonBeforeDate { row: 0 })
        ));
        assert!(matches!(
            extractor.extract(&page(r#"<tr class="shadow"><td>a</td><td>b</td></tr>"#), 7),
            Err(AdapterError::RowShape { cells: 2, .. })
        ));
        assert!(matches!(
            extractor.extract("<html><body><p>maintenance</p></body></html>", 7),
            Err(AdapterError::EmptyPage)
        ));
    }
}
