pub mod compute_scores;
pub mod export_market_data;
pub mod generate_signals;
pub mod import_market_data;
pub mod run_all;
pub mod show_signal;

use crate::context::{AppContext, EngineContext, MarketDataFilters};
use crate::pipeline::{RunWindow, ScoreRunSummary, SignalRunSummary};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use log::{info, warn};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};

const LOG_SOURCE: &str = "engine";

/// Options shared by the commands that run the pipeline.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub data_file: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub max_workers: Option<usize>,
}

impl RunOptions {
    pub fn window(&self) -> Result<RunWindow> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(anyhow!("--from {} is after --to {}", from, to));
            }
        }
        Ok(RunWindow {
            from: self.from,
            to: self.to,
        })
    }
}

async fn ensure_snapshot_exists(path: &Path) -> Result<()> {
    if tokio::fs::metadata(path).await.is_ok() {
        return Ok(());
    }
    Err(anyhow!(
        "Market data snapshot not found at {}. Create one with `export-market-data` first.",
        path.display()
    ))
}

pub(crate) async fn open_context(app: &AppContext, options: &RunOptions) -> Result<EngineContext> {
    let mut context = match options.data_file.as_deref() {
        Some(data_file) => {
            ensure_snapshot_exists(data_file).await?;
            info!("Using market data snapshot from {}", data_file.display());
            let filters = MarketDataFilters {
                end_date: options.to,
            };
            app.engine_context_from_file(data_file, Some(filters)).await?
        }
        None => app.engine_context().await?,
    };
    if let Some(max_workers) = options.max_workers {
        context.settings_mut().max_workers = max_workers.max(1);
    }
    Ok(context)
}

pub(crate) async fn log_signal_summary(context: &EngineContext, summary: &SignalRunSummary) {
    for problem in summary.problems() {
        context
            .log_event(
                LOG_SOURCE,
                "warn",
                format!(
                    "{} {} signal run {:?}: {}",
                    problem.symbol,
                    problem.timeframe,
                    problem.outcome,
                    problem.error.as_deref().unwrap_or("unknown error")
                ),
                json!({
                    "runId": summary.run_id,
                    "symbol": problem.symbol,
                    "timeframe": problem.timeframe.as_str(),
                    "outcome": problem.outcome,
                    "errorKind": problem.error_kind,
                }),
            )
            .await;
    }

    let level = if summary.failed + summary.skipped + summary.timed_out > 0 {
        "warn"
    } else {
        "info"
    };
    context
        .log_event(
            LOG_SOURCE,
            level,
            format!(
                "{} signal run finished: {}/{} completed",
                summary.timeframe, summary.completed, summary.total
            ),
            json!({
                "runId": summary.run_id,
                "timeframe": summary.timeframe.as_str(),
                "total": summary.total,
                "completed": summary.completed,
                "failed": summary.failed,
                "skipped": summary.skipped,
                "timedOut": summary.timed_out,
            }),
        )
        .await;
}

pub(crate) async fn log_score_summary(context: &EngineContext, summary: &ScoreRunSummary) {
    for report in summary.reports.iter().filter(|r| r.error.is_some()) {
        context
            .log_event(
                LOG_SOURCE,
                "warn",
                format!(
                    "Composite scores for {} not written: {}",
                    report.date,
                    report.error.as_deref().unwrap_or("unknown error")
                ),
                json!({ "runId": summary.run_id, "date": report.date }),
            )
            .await;
    }

    context
        .log_event(
            LOG_SOURCE,
            if summary.dates_failed > 0 { "warn" } else { "info" },
            format!(
                "Composite scoring finished: {} dates, {} symbol scores",
                summary.dates_scored, summary.symbols_scored
            ),
            json!({
                "runId": summary.run_id,
                "datesScored": summary.dates_scored,
                "datesFailed": summary.dates_failed,
                "symbolsScored": summary.symbols_scored,
            }),
        )
        .await;
}

#[derive(Serialize)]
struct OutputDocument<'a, T: Serialize> {
    summary: &'a T,
    #[serde(skip_serializing_if = "Option::is_none")]
    results: Option<crate::providers::StoredOutputs>,
}

/// Writes the run summary, plus the stored results of snapshot runs, as JSON.
pub(crate) fn write_output<T: Serialize>(
    path: &Path,
    context: &EngineContext,
    summary: &T,
) -> Result<()> {
    let document = OutputDocument {
        summary,
        results: context.stored_outputs(),
    };
    if document.results.is_none() {
        warn!("Database-backed run; --output holds the run summary only");
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create output directory {}", parent.display()))?;
        }
    }
    let json = serde_json::to_string_pretty(&document).context("Failed to encode run output")?;
    fs::write(path, json)
        .with_context(|| format!("Failed to write run output to {}", path.display()))?;
    info!("Run output written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_rejects_reversed_range() {
        let options = RunOptions {
            from: NaiveDate::from_ymd_opt(2024, 5, 1),
            to: NaiveDate::from_ymd_opt(2024, 4, 1),
            ..Default::default()
        };
        assert!(options.window().is_err());

        let options = RunOptions {
            to: NaiveDate::from_ymd_opt(2024, 4, 1),
            ..Default::default()
        };
        let window = options.window().unwrap();
        assert_eq!(window.from, None);
        assert_eq!(window.to, NaiveDate::from_ymd_opt(2024, 4, 1));
    }
}
