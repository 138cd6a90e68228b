use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Datelike, Local, NaiveDate, NaiveTime, Weekday};
use classync_core::LessonField;
use serde::{Deserialize, Deserializer};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Which lesson fields decide that an existing row is "updated".
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ComparisonConfig {
    #[serde(default = "default_compare_fields")]
    pub compare_fields: Vec<LessonField>,
    #[serde(default = "default_ignore_fields")]
    pub ignore_fields: Vec<LessonField>,
}

fn default_compare_fields() -> Vec<LessonField> {
    vec![
        LessonField::SubjectId,
        LessonField::ClassroomId,
        LessonField::TeacherId,
    ]
}

fn default_ignore_fields() -> Vec<LessonField> {
    vec![LessonField::UpdatedAt, LessonField::CreatedAt]
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            compare_fields: default_compare_fields(),
            ignore_fields: default_ignore_fields(),
        }
    }
}

impl ComparisonConfig {
    /// Compared fields minus ignored ones; timestamps never take part.
    pub fn effective_fields(&self) -> Vec<LessonField> {
        let mut out = Vec::new();
        for field in &self.compare_fields {
            if !field.is_timestamp() && !self.ignore_fields.contains(field) && !out.contains(field)
            {
                out.push(*field);
            }
        }
        out
    }

    /// Fields written back for an updated row: the compared ones plus `updated_at`.
    pub fn update_fields(&self) -> Vec<LessonField> {
        let mut out = self.effective_fields();
        out.push(LessonField::UpdatedAt);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LessonSlot {
    pub lesson_number: u8,
    #[serde(deserialize_with = "deserialize_clock")]
    pub start: NaiveTime,
    #[serde(deserialize_with = "deserialize_clock")]
    pub end: NaiveTime,
}

fn deserialize_clock<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_clock(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid time {raw:?}")))
}

fn parse_clock(raw: &str) -> Option<NaiveTime> {
    ["%H:%M", "%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(raw.trim(), fmt).ok())
}

/// Standard lesson start/end times per weekday, used when creating periods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct PeriodTimetable(HashMap<Weekday, Vec<LessonSlot>>);

impl PeriodTimetable {
    pub fn new(slots: HashMap<Weekday, Vec<LessonSlot>>) -> Self {
        Self(slots)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    pub fn slot(&self, date: NaiveDate, lesson_number: u8) -> Option<&LessonSlot> {
        self.0
            .get(&date.weekday())?
            .iter()
            .find(|slot| slot.lesson_number == lesson_number)
    }
}

/// Optional YAML overlay named by `CLASSYNC_CONFIG`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigOverlay {
    pub start_sync_day: Option<NaiveDate>,
    pub batch_size: Option<usize>,
    pub compare_fields: Option<Vec<LessonField>>,
    pub ignore_fields: Option<Vec<LessonField>>,
    pub run_lock: Option<bool>,
    pub period_timetable: Option<PeriodTimetable>,
}

impl ConfigOverlay {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub snapshot_dir: PathBuf,
    pub reports_dir: PathBuf,
    /// First day of the sync window; `None` means today.
    pub start_sync_day: Option<NaiveDate>,
    pub batch_size: usize,
    pub run_lock: bool,
    pub max_retries: usize,
    pub comparison: ComparisonConfig,
    pub period_timetable: PeriodTimetable,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            snapshot_dir: PathBuf::from("./snapshot"),
            reports_dir: PathBuf::from("./reports"),
            start_sync_day: None,
            batch_size: DEFAULT_BATCH_SIZE,
            run_lock: true,
            max_retries: 3,
            comparison: ComparisonConfig::default(),
            period_timetable: PeriodTimetable::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; missing or blank values keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let mut config = Self {
            database_url: var("DATABASE_URL"),
            snapshot_dir: var("SNAPSHOT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.snapshot_dir),
            reports_dir: var("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            start_sync_day: var("CLASSYNC_START_SYNC_DAY")
                .map(|v| {
                    NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d")
                        .with_context(|| format!("CLASSYNC_START_SYNC_DAY={v} is not YYYY-MM-DD"))
                })
                .transpose()?,
            batch_size: var("CLASSYNC_BATCH_SIZE")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.batch_size),
            run_lock: var("CLASSYNC_RUN_LOCK")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.run_lock),
            max_retries: var("CLASSYNC_MAX_RETRIES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.max_retries),
            comparison: defaults.comparison,
            period_timetable: defaults.period_timetable,
        };

        if let Some(path) = var("CLASSYNC_CONFIG") {
            config.apply_overlay(ConfigOverlay::load(Path::new(&path))?);
        }
        Ok(config)
    }

    pub fn apply_overlay(&mut self, overlay: ConfigOverlay) {
        if let Some(day) = overlay.start_sync_day {
            self.start_sync_day = Some(day);
        }
        if let Some(size) = overlay.batch_size {
            self.batch_size = size;
        }
        if let Some(fields) = overlay.compare_fields {
            self.comparison.compare_fields = fields;
        }
        if let Some(fields) = overlay.ignore_fields {
            self.comparison.ignore_fields = fields;
        }
        if let Some(lock) = overlay.run_lock {
            self.run_lock = lock;
        }
        if let Some(timetable) = overlay.period_timetable {
            self.period_timetable = timetable;
        }
    }

    pub fn start_day(&self) -> NaiveDate {
        self.start_sync_day
            .unwrap_or_else(|| Local::now().date_naive())
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}
