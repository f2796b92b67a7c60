use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::orchestrator::CycleSummary;

pub fn daily_brief_markdown(summary: &CycleSummary) -> String {
    let mut lines = vec![
        "# Jobfeed Daily Brief".to_string(),
        String::new(),
        format!("- Cycle ID: `{}`", summary.cycle_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!(
            "- Sources: {} succeeded, {} failed",
            summary.succeeded_sources.len(),
            summary.failed_sources.len()
        ),
        format!(
            "- Items: {} processed, {} merged ({} new, {} updated), {} errors",
            summary.total_processed,
            summary.total_success,
            summary.total_inserted,
            summary.total_updated,
            summary.total_errors
        ),
        String::new(),
        "## Sources".to_string(),
    ];
    for source in &summary.sources {
        lines.push(format!(
            "- {}: {:?}, {} pages, {} processed, {} errors, {} live",
            source.source_name,
            source.outcome,
            source.pages,
            source.processed,
            source.errors,
            source.live_count
        ));
    }
    if !summary.failed_sources.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        for failed in &summary.failed_sources {
            lines.push(format!("- {}: {}", failed.source_name, failed.error));
        }
    }
    if let Some(cleanup) = &summary.cleanup {
        lines.push(String::new());
        lines.push("## Cleanup".to_string());
        lines.push(format!(
            "- expired removed: {} of {}",
            cleanup.expired_deleted, cleanup.expired_found
        ));
        lines.push(format!(
            "- duplicates removed: {} of {} ({} groups)",
            cleanup.duplicates_deleted, cleanup.duplicates_found, cleanup.duplicate_groups
        ));
        for error in &cleanup.errors {
            lines.push(format!("- error: {error}"));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes `<reports_dir>/<cycle_id>/{cycle_summary.json,daily_brief.md}` and returns the
/// cycle directory.
pub async fn write_cycle_report(reports_dir: &Path, summary: &CycleSummary) -> Result<PathBuf> {
    let cycle_dir = reports_dir.join(summary.cycle_id.to_string());
    fs::create_dir_all(&cycle_dir)
        .await
        .with_context(|| format!("creating {}", cycle_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing cycle summary")?;
    fs::write(cycle_dir.join("cycle_summary.json"), json)
        .await
        .context("writing cycle_summary.json")?;
    fs::write(cycle_dir.join("daily_brief.md"), daily_brief_markdown(summary))
        .await
        .context("writing daily_brief.md")?;
    Ok(cycle_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{FailedSource, SourceRunReport};
    use chrono::{TimeZone, Utc};
    use jobfeed_core::RunOutcome;
    use uuid::Uuid;

    fn summary() -> CycleSummary {
        let at = Utc.with_ymd_and_hms(2026, 7, 1, 6, 0, 0).unwrap();
        CycleSummary {
            cycle_id: Uuid::new_v4(),
            started_at: at,
            finished_at: at,
            succeeded_sources: vec!["undp".into()],
            failed_sources: vec![FailedSource {
                source_name: "wfp".into(),
                error: "HTTP 503".into(),
            }],
            total_processed: 12,
            total_success: 10,
            total_errors: 2,
            total_inserted: 4,
            total_updated: 6,
            sources: vec![SourceRunReport {
                source_name: "undp".into(),
                run_id: Some(1),
                outcome: RunOutcome::Success,
                pages: 2,
                processed: 12,
                success: 10,
                errors: 2,
                inserted: 4,
                updated: 6,
                live_count: 40,
                error_message: None,
                duration_ms: 1200,
            }],
            cache_invalidated: true,
            cleanup: None,
            status_write_failures: 0,
        }
    }

    #[test]
    fn brief_lists_sources_and_failures() {
        let brief = daily_brief_markdown(&summary());
        assert!(brief.contains("- Sources: 1 succeeded, 1 failed"));
        assert!(brief.contains("- undp: Success, 2 pages, 12 processed, 2 errors, 40 live"));
        assert!(brief.contains("- wfp: HTTP 503"));
        assert!(!brief.contains("## Cleanup"));
    }

    #[tokio::test]
    async fn report_files_land_in_the_cycle_directory() {
        let dir = tempfile::tempdir().unwrap();
        let summary = summary();
        let cycle_dir = write_cycle_report(dir.path(), &summary).await.unwrap();
        assert_eq!(cycle_dir, dir.path().join(summary.cycle_id.to_string()));

        let json: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(cycle_dir.join("cycle_summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(json["total_processed"], 12);
        assert_eq!(json["failed_sources"][0]["source_name"], "wfp");
        assert!(cycle_dir.join("daily_brief.md").exists());
    }
}
