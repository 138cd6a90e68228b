//! Scraper hand-off: turns scraped pages or imports into snapshot store keys.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use classync_core::{keys, EntityId, NormalizedLesson, RawLesson, ScrapedLessonRecord};
use classync_storage::{set_json, SnapshotStore};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::csv::CsvImport;
use crate::html::SchedulePageExtractor;
use crate::normalize::normalize_lesson;
use crate::{content_hash, AdapterError};

pub const MAIN_PAGE_HASH_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// Main-page hash recorded for spreadsheet imports, which have no main page.
pub const CSV_MAIN_PAGE_HASH: &str = "csv-import";

/// Per-run scrape counters, stored next to the hand-off for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeSummary {
    pub total_groups: usize,
    pub parsed: usize,
    pub skipped: usize,
    pub no_change: usize,
    pub errors: usize,
    pub error_groups: Vec<String>,
    pub total_lessons: usize,
    pub closing_reason: String,
}

/// Everything one scrape hands to the sync run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapeBatch {
    pub records: Vec<ScrapedLessonRecord>,
    /// Successfully scraped group id → content hash of its page.
    pub scraped_groups: BTreeMap<EntityId, String>,
    pub unchanged_groups: BTreeSet<EntityId>,
    pub main_page_hash: Option<String>,
    pub summary: ScrapeSummary,
}

impl ScrapeBatch {
    pub fn from_csv(import: CsvImport) -> Self {
        Self {
            records: import.lessons.iter().map(ScrapedLessonRecord::from).collect(),
            scraped_groups: import
                .groups
                .iter()
                .map(|id| (*id, String::new()))
                .collect(),
            unchanged_groups: BTreeSet::new(),
            main_page_hash: Some(CSV_MAIN_PAGE_HASH.to_string()),
            summary: import.summary,
        }
    }
}

/// One group's fetched schedule page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulePage {
    pub group_id: EntityId,
    pub body: String,
}

/// Extract group pages into a batch.
///
/// Groups already synced under the current main page hash are skipped and a
/// page whose hash equals the stored `page_hash:{id}` is reported unchanged
/// without being parsed. A page that fails to parse is left out of
/// `scraped_groups` so its stored lessons stay untouched.
pub async fn scrape_pages<S>(
    store: &S,
    main_page: Option<&str>,
    pages: Vec<SchedulePage>,
) -> Result<ScrapeBatch, AdapterError>
where
    S: SnapshotStore + ?Sized,
{
    let extractor = SchedulePageExtractor::new()?;
    let main_page_hash = main_page.map(|body| content_hash(body.as_bytes()));
    let already_synced = match &main_page_hash {
        Some(hash) => store.smembers(&keys::synced_groups(hash)).await?,
        None => BTreeSet::new(),
    };

    let mut batch = ScrapeBatch {
        main_page_hash,
        summary: ScrapeSummary {
            total_groups: pages.len(),
            ..ScrapeSummary::default()
        },
        ..ScrapeBatch::default()
    };

    for page in pages {
        if already_synced.contains(&page.group_id.to_string()) {
            batch.summary.skipped += 1;
            continue;
        }
        if page.body.trim().is_empty() {
            warn!(group_id = page.group_id, "empty schedule page");
            batch.summary.errors += 1;
            batch.summary.error_groups.push(page.group_id.to_string());
            continue;
        }

        let hash = content_hash(page.body.as_bytes());
        if store.get(&keys::page_hash(page.group_id)).await?.as_deref() == Some(hash.as_str()) {
            info!(group_id = page.group_id, "schedule page unchanged");
            batch.summary.no_change += 1;
            batch.unchanged_groups.insert(page.group_id);
            continue;
        }

        match extract_page(&extractor, &page) {
            Ok(lessons) => {
                batch.summary.parsed += 1;
                batch.summary.total_lessons += lessons.len();
                batch
                    .records
                    .extend(lessons.iter().map(ScrapedLessonRecord::from));
                batch.scraped_groups.insert(page.group_id, hash);
            }
            Err(error) => {
                warn!(group_id = page.group_id, %error, "schedule page rejected");
                batch.summary.errors += 1;
                batch.summary.error_groups.push(page.group_id.to_string());
            }
        }
    }

    batch.summary.closing_reason = "finished".to_string();
    Ok(batch)
}

fn extract_page(
    extractor: &SchedulePageExtractor,
    page: &SchedulePage,
) -> Result<Vec<NormalizedLesson>, AdapterError> {
    extractor
        .extract(&page.body, page.group_id)?
        .iter()
        .map(|raw: &RawLesson| normalize_lesson(raw).map_err(AdapterError::from))
        .collect()
}

/// Write the hand-off keys the sync run reads.
pub async fn publish<S>(store: &S, batch: &ScrapeBatch) -> Result<(), AdapterError>
where
    S: SnapshotStore + ?Sized,
{
    set_json(store, keys::SCRAPED_LESSONS, &batch.records, None).await?;
    set_json(store, keys::SCRAPED_GROUPS, &batch.scraped_groups, None).await?;
    set_json(store, keys::UNCHANGED_GROUPS, &batch.unchanged_groups, None).await?;
    set_json(store, keys::SCRAPE_SUMMARY, &batch.summary, None).await?;
    if let Some(hash) = &batch.main_page_hash {
        store
            .set_ex(keys::MAIN_PAGE_HASH, hash, MAIN_PAGE_HASH_TTL)
            .await?;
    }
    info!(
        records = batch.records.len(),
        groups = batch.scraped_groups.len(),
        unchanged = batch.unchanged_groups.len(),
        "scrape hand-off published"
    );
    Ok(())
}
