//! Raw lesson sources (schedule pages, spreadsheet exports) and the normalizer.

use classync_storage::StoreError;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod csv;
pub mod html;
pub mod normalize;
pub mod publish;

pub use csv::{CsvImport, CsvImporter};
pub use html::SchedulePageExtractor;
pub use normalize::{normalize_all, normalize_lesson, NormalizedBatch, ValidationError};
pub use publish::{publish, scrape_pages, ScrapeBatch, SchedulePage, ScrapeSummary};

pub const CRATE_NAME: &str = "classync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("page has no schedule rows")]
    EmptyPage,
    #[error("row {row} has {cells} cells, expected 1 (date) or 5 (lesson)")]
    RowShape { row: usize, cells: usize },
    #[error("lesson row {row} comes before any date row")]
    LessonBeforeDate { row: usize },
    #[error("date row {row} has no DD.MM.YYYY date: {text:?}")]
    NoDate { row: usize, text: String },
    #[error("lesson number {value:?} in row {row} is not an integer")]
    BadLessonNumber { row: usize, value: String },
    #[error("lesson {lesson_number} in row {row} follows lesson {previous} on {date}")]
    LessonOrder {
        row: usize,
        date: String,
        lesson_number: i64,
        previous: i64,
    },
    #[error("export has no {0} column")]
    MissingColumn(&'static str),
    #[error("no known group in the import")]
    NoGroups,
    #[error("every imported group failed")]
    NoValidGroups,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Hex SHA-256 of page content, used for change detection between runs.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
