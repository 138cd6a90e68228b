use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use classync_adapters::csv::{detect_delimiter, parse_rows};
use classync_adapters::{publish, scrape_pages, CsvImporter, ScrapeBatch, SchedulePage};
use classync_core::EntityId;
use classync_storage::{
    BackoffPolicy, EntityStore, FileSnapshotStore, LessonStore, MemoryStore, PgStore,
    SnapshotStore,
};
use classync_sync::{report_markdown, run_with_retry, write_report, LessonsSync, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

const MAIN_PAGE_FILE: &str = "index.html";

#[derive(Debug, Parser)]
#[command(name = "classync")]
#[command(about = "Class schedule sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the current snapshot against the lesson store.
    Sync {
        /// Use the in-process store instead of DATABASE_URL.
        #[arg(long)]
        memory: bool,
        /// First day of the sync window (YYYY-MM-DD).
        #[arg(long)]
        start_day: Option<NaiveDate>,
    },
    Migrate,
    /// Extract `<group_id>.html` pages (plus optional `index.html`) into the snapshot.
    ImportHtml {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Import a spreadsheet export into the snapshot.
    ImportCsv {
        #[arg(long)]
        lessons: PathBuf,
        /// One group title per line; defines the processed groups.
        #[arg(long)]
        groups: Option<PathBuf>,
        /// `title;id` rows mapping group titles to ids.
        #[arg(long)]
        group_map: PathBuf,
        /// `short_name;full_name` rows.
        #[arg(long)]
        teacher_map: Option<PathBuf>,
    },
    /// Summarize the latest run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync {
        memory: false,
        start_day: None,
    }) {
        Commands::Sync { memory, start_day } => {
            if start_day.is_some() {
                config.start_sync_day = start_day;
            }
            let snapshot = FileSnapshotStore::new(config.snapshot_dir.clone());
            if memory {
                run_sync(MemoryStore::new(), snapshot, config).await?;
            } else {
                let store = connect(&config).await?;
                run_sync(store, snapshot, config).await?;
            }
        }
        Commands::Migrate => {
            connect(&config).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::ImportHtml { dir } => {
            let snapshot = FileSnapshotStore::new(config.snapshot_dir.clone());
            let (main_page, pages) = load_pages(&dir)?;
            let batch = scrape_pages(&snapshot, main_page.as_deref(), pages).await?;
            publish_batch(&snapshot, &batch).await?;
        }
        Commands::ImportCsv {
            lessons,
            groups,
            group_map,
            teacher_map,
        } => {
            let snapshot = FileSnapshotStore::new(config.snapshot_dir.clone());
            let group_ids = read_pairs(&group_map)?
                .into_iter()
                .map(|(title, id)| {
                    let id: EntityId = id
                        .trim()
                        .parse()
                        .with_context(|| format!("group {title:?} has a non-integer id {id:?}"))?;
                    Ok((title, id))
                })
                .collect::<Result<Vec<_>>>()?;
            let teachers: HashMap<String, String> = match teacher_map {
                Some(path) => read_pairs(&path)?.into_iter().collect(),
                None => HashMap::new(),
            };
            let listed = match groups {
                Some(path) => Some(
                    read_text(&path)?
                        .lines()
                        .map(str::to_string)
                        .collect::<Vec<_>>(),
                ),
                None => None,
            };

            let import = CsvImporter::new(group_ids, teachers)
                .import(&read_text(&lessons)?, listed.as_deref())?;
            publish_batch(&snapshot, &ScrapeBatch::from_csv(import)).await?;
        }
        Commands::Report { runs } => {
            println!("{}", report_markdown(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<PgStore> {
    let Some(url) = config.database_url.as_deref() else {
        bail!("DATABASE_URL is not set (use `sync --memory` for a dry run)");
    };
    PgStore::connect(url, 5)
        .await
        .context("connecting to DATABASE_URL")
}

async fn run_sync<S, K>(store: S, snapshot: K, config: SyncConfig) -> Result<()>
where
    S: EntityStore + LessonStore,
    K: SnapshotStore,
{
    let policy = BackoffPolicy::with_max_retries(config.max_retries);
    let reports_dir = config.reports_dir.clone();
    let sync = LessonsSync::new(store, snapshot, config);
    let sync = &sync;
    let report = run_with_retry(policy, move |_| sync.run()).await?;
    let run_dir = write_report(&report, &reports_dir).await?;
    println!(
        "sync complete: run_id={} added={} updated={} removed={} reports={}",
        report.run_id,
        report.stats.added,
        report.stats.updated,
        report.stats.removed,
        run_dir.display()
    );
    Ok(())
}

async fn publish_batch<K: SnapshotStore>(snapshot: &K, batch: &ScrapeBatch) -> Result<()> {
    publish(snapshot, batch).await?;
    info!(
        parsed = batch.summary.parsed,
        no_change = batch.summary.no_change,
        errors = batch.summary.errors,
        "import finished"
    );
    println!(
        "snapshot updated: groups={} unchanged={} lessons={} errors={}",
        batch.scraped_groups.len(),
        batch.unchanged_groups.len(),
        batch.records.len(),
        batch.summary.error_groups.join(",")
    );
    Ok(())
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

/// Two-column delimited file, header-less; blank and short rows are skipped.
fn read_pairs(path: &Path) -> Result<Vec<(String, String)>> {
    let text = read_text(path)?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
    Ok(parse_rows(text, detect_delimiter(text))
        .into_iter()
        .filter_map(|row| match row.as_slice() {
            [a, b, ..] if !a.trim().is_empty() => {
                Some((a.trim().to_string(), b.trim().to_string()))
            }
            _ => None,
        })
        .collect())
}

fn load_pages(dir: &Path) -> Result<(Option<String>, Vec<SchedulePage>)> {
    let mut main_page = None;
    let mut pages = Vec::new();
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("html") {
            continue;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if name == MAIN_PAGE_FILE {
            main_page = Some(read_text(&path)?);
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let Ok(group_id) = stem.parse::<EntityId>() else {
            info!(file = %path.display(), "skipping page without a group id name");
            continue;
        };
        pages.push(SchedulePage {
            group_id,
            body: read_text(&path)?,
        });
    }
    pages.sort_by_key(|p| p.group_id);
    Ok((main_page, pages))
}
