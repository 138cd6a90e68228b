//! Lesson reconciliation: entity resolution, diffing, transactional apply,
//! and the run orchestrator that ties them to the snapshot store.

pub mod apply;
pub mod candidates;
pub mod config;
mod error;
pub mod hooks;
pub mod orchestrator;
pub mod reconcile;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod summary;

pub use apply::ChangeApplier;
pub use candidates::{CandidateBatch, LessonCandidateBuilder};
pub use config::{ComparisonConfig, ConfigOverlay, LessonSlot, PeriodTimetable, SyncConfig};
pub use error::SyncError;
pub use hooks::{NewEntityHook, PeriodTimes, PlainInsert, TeacherShortName};
pub use orchestrator::{LessonsSync, SnapshotInput};
pub use reconcile::{LessonChanges, ReconciliationEngine};
pub use report::{report_markdown, write_report};
pub use resolver::EntityResolver;
pub use retry::run_with_retry;
pub use summary::{SyncReport, SyncStats, SyncSummaryBuilder};

pub const CRATE_NAME: &str = "classync-sync";
