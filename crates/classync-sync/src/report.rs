//! Per-run report files under `<reports_dir>/<run_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::summary::SyncReport;

pub const DELTA_FILE: &str = "lessons_delta.json";
pub const BRIEF_FILE: &str = "sync_brief.md";

pub async fn write_report(report: &SyncReport, reports_dir: &Path) -> Result<PathBuf> {
    let run_dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    fs::write(run_dir.join(BRIEF_FILE), report.brief_markdown())
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;

    let delta = serde_json::to_vec_pretty(report).context("serializing lessons delta")?;
    fs::write(run_dir.join(DELTA_FILE), delta)
        .await
        .with_context(|| format!("writing {DELTA_FILE}"))?;

    Ok(run_dir)
}

/// Markdown overview of the latest `runs` reports, newest first.
pub fn report_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join(DELTA_FILE).exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# Lesson Sync Report".to_string(), String::new()];
    for dir in dirs {
        let delta_path = dir.path().join(DELTA_FILE);
        let report: SyncReport = serde_json::from_str(
            &std::fs::read_to_string(&delta_path)
                .with_context(|| format!("reading {}", delta_path.display()))?,
        )
        .with_context(|| format!("parsing {}", delta_path.display()))?;

        lines.push(format!("## Run `{}`", report.run_id));
        lines.push(format!("- finished: {}", report.finished_at));
        lines.push(format!("- sync window from: {}", report.start_sync_day));
        lines.push(format!(
            "- added / updated / removed: {} / {} / {}",
            report.stats.added, report.stats.updated, report.stats.removed
        ));
        lines.push(format!(
            "- groups: {} scraped, {} unchanged",
            report.stats.scraped_groups, report.stats.unchanged_groups
        ));
        if report.stats.dropped_records > 0 {
            lines.push(format!("- dropped records: {}", report.stats.dropped_records));
        }
        lines.push(format!("- delta: `{}`", delta_path.display()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
