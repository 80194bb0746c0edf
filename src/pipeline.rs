use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::bar_utils::validate_bars;
use crate::config::{EngineSettings, IndicatorWindows, SignalConfig};
use crate::error::{EngineError, EngineResult};
use crate::factors::{derive_price_factors, merge_factor_values};
use crate::indicators::compute_snapshots;
use crate::models::{
    Bar, DataQualityWarning, RawFactorValue, SignalPhase, SignalState, SignalTransition, Timeframe,
};
use crate::providers::{BarHistoryProvider, FactorProvider, OutputSink};
use crate::retry::{retry_db_operation, retry_with_backoff};
use crate::run_status::RunStatus;
use crate::scoring::{score_dates, FactorCatalog};
use crate::signals::replay;

/// Date bounds of a run. Signals always replay the full history up to `to`;
/// scores are produced for dates within the window, or for the latest
/// available date when `from` is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunWindow {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolOutcome {
    Completed,
    Failed,
    Skipped,
    TimedOut,
}

impl SymbolOutcome {
    fn from_error(err: &EngineError) -> Self {
        match err {
            EngineError::ProviderUnavailable { .. } => SymbolOutcome::Skipped,
            EngineError::Timeout { .. } => SymbolOutcome::TimedOut,
            _ => SymbolOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolReport {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub outcome: SymbolOutcome,
    pub phase: Option<SignalPhase>,
    pub as_of_date: Option<NaiveDate>,
    pub transitions: usize,
    pub warnings: usize,
    pub error_kind: Option<&'static str>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalRunSummary {
    pub run_id: Uuid,
    pub timeframe: Timeframe,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub timed_out: usize,
    pub reports: Vec<SymbolReport>,
}

impl SignalRunSummary {
    pub fn report(&self, symbol: &str) -> Option<&SymbolReport> {
        self.reports.iter().find(|report| report.symbol == symbol)
    }

    pub fn problems(&self) -> impl Iterator<Item = &SymbolReport> {
        self.reports
            .iter()
            .filter(|report| report.outcome != SymbolOutcome::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateReport {
    pub date: NaiveDate,
    pub symbols: usize,
    pub scored: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreRunSummary {
    pub run_id: Uuid,
    pub dates_scored: usize,
    pub dates_failed: usize,
    pub symbols_scored: usize,
    pub reports: Vec<DateReport>,
}

/// Everything one symbol run produced; written as a unit or not at all.
#[derive(Debug, Clone)]
pub struct SymbolComputation {
    pub state: SignalState,
    pub transitions: Vec<SignalTransition>,
    pub warnings: Vec<DataQualityWarning>,
    pub price_factors: Vec<RawFactorValue>,
}

/// Validates a series and replays it through the state machine. Daily runs
/// also derive the price-based factors from the same validated bars, from
/// `factor_since` on, or for the last bar only when it is `None`.
pub fn compute_symbol(
    symbol: &str,
    timeframe: Timeframe,
    bars: Vec<Bar>,
    config: &SignalConfig,
    factor_since: Option<NaiveDate>,
) -> EngineResult<SymbolComputation> {
    let validated = validate_bars(symbol, timeframe, bars, config.max_missing_sessions)?;
    let snapshots = compute_snapshots(&validated.bars, &IndicatorWindows::for_timeframe(timeframe));
    let trace = replay(symbol, timeframe, &validated.bars, &snapshots, config);

    let since = factor_since.or_else(|| validated.bars.last().map(|bar| bar.date));
    let price_factors = match since {
        Some(since) if timeframe == Timeframe::Daily => {
            derive_price_factors(symbol, &validated.bars, since)
        }
        _ => Vec::new(),
    };

    Ok(SymbolComputation {
        state: trace.final_state,
        transitions: trace.transitions,
        warnings: validated.warnings,
        price_factors,
    })
}

pub struct Pipeline {
    bars: Arc<dyn BarHistoryProvider>,
    factors: Arc<dyn FactorProvider>,
    sink: Arc<dyn OutputSink>,
    settings: EngineSettings,
    catalog: FactorCatalog,
    symbol_timeout: Duration,
    status: RunStatus,
    price_factors: DashMap<String, Vec<RawFactorValue>>,
    // Window the cached price factors were derived for.
    price_factor_window: Mutex<Option<RunWindow>>,
}

impl Pipeline {
    pub fn new(
        bars: Arc<dyn BarHistoryProvider>,
        factors: Arc<dyn FactorProvider>,
        sink: Arc<dyn OutputSink>,
        settings: EngineSettings,
    ) -> Self {
        let symbol_timeout = Duration::from_secs(settings.symbol_timeout_secs.max(1));
        Self {
            bars,
            factors,
            sink,
            settings,
            catalog: FactorCatalog::default(),
            symbol_timeout,
            status: RunStatus::new(),
            price_factors: DashMap::new(),
            price_factor_window: Mutex::new(None),
        }
    }

    pub fn with_catalog(mut self, catalog: FactorCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_symbol_timeout(mut self, timeout: Duration) -> Self {
        self.symbol_timeout = timeout;
        self
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Per-symbol pass: fetch, validate, replay and write every symbol of the
    /// timeframe on a bounded worker pool. One symbol's failure never stops
    /// the others.
    pub async fn run_signals(
        &self,
        timeframe: Timeframe,
        window: RunWindow,
    ) -> Result<SignalRunSummary> {
        let run_id = Uuid::new_v4();
        if timeframe == Timeframe::Daily {
            self.price_factors.clear();
            if let Ok(mut cached) = self.price_factor_window.lock() {
                *cached = Some(window);
            }
        }
        let symbols = retry_with_backoff(
            &format!("{} symbol list", timeframe),
            &self.settings.provider_retry,
            || self.bars.list_symbols(timeframe),
        )
        .await
        .with_context(|| format!("failed to list {} symbols", timeframe))?;

        let total = symbols.len();
        self.status
            .start(format!("Generating {} signals", timeframe), total);
        if symbols.is_empty() {
            warn!("No {} symbols available; skipping signal generation", timeframe);
            self.status.set_phase("Idle");
            return Ok(SignalRunSummary {
                run_id,
                timeframe,
                total: 0,
                completed: 0,
                failed: 0,
                skipped: 0,
                timed_out: 0,
                reports: Vec::new(),
            });
        }

        let worker_limit = self.settings.max_workers.max(1).min(total);
        info!(
            "Launching {} signal generation for {} symbols with {} concurrent worker{}",
            timeframe,
            total,
            worker_limit,
            if worker_limit == 1 { "" } else { "s" }
        );

        let mut pending = symbols.into_iter();
        let mut in_flight = FuturesUnordered::new();
        for _ in 0..worker_limit {
            if let Some(symbol) = pending.next() {
                in_flight.push(self.timed_symbol_job(symbol, timeframe, window));
            }
        }

        let mut reports = Vec::with_capacity(total);
        while let Some((symbol, result)) = in_flight.next().await {
            reports.push(self.finish_symbol(symbol, timeframe, result).await);
            if let Some(symbol) = pending.next() {
                in_flight.push(self.timed_symbol_job(symbol, timeframe, window));
            }
        }
        reports.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let count = |outcome: SymbolOutcome| reports.iter().filter(|r| r.outcome == outcome).count();
        let summary = SignalRunSummary {
            run_id,
            timeframe,
            total,
            completed: count(SymbolOutcome::Completed),
            failed: count(SymbolOutcome::Failed),
            skipped: count(SymbolOutcome::Skipped),
            timed_out: count(SymbolOutcome::TimedOut),
            reports,
        };
        self.status.set_phase("Idle");
        info!(
            "{} signal generation finished: {} completed, {} failed, {} skipped, {} timed out",
            timeframe, summary.completed, summary.failed, summary.skipped, summary.timed_out
        );
        Ok(summary)
    }

    async fn timed_symbol_job(
        &self,
        symbol: String,
        timeframe: Timeframe,
        window: RunWindow,
    ) -> (String, EngineResult<Option<SymbolComputation>>) {
        let job = self.symbol_job(&symbol, timeframe, window);
        let result = match tokio::time::timeout(self.symbol_timeout, job).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                symbol: symbol.clone(),
                seconds: self.symbol_timeout.as_secs(),
            }),
        };
        (symbol, result)
    }

    async fn symbol_job(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        window: RunWindow,
    ) -> EngineResult<Option<SymbolComputation>> {
        let bars = retry_with_backoff(
            &format!("{} {} bars", symbol, timeframe),
            &self.settings.provider_retry,
            || self.bars.get_bars(symbol, timeframe, None, window.to),
        )
        .await?;
        if bars.is_empty() {
            return Ok(None);
        }

        let config = self.settings.signal_config(timeframe);
        let owned_symbol = symbol.to_string();
        tokio::task::spawn_blocking(move || {
            compute_symbol(&owned_symbol, timeframe, bars, &config, window.from)
        })
        .await
        .map_err(|err| EngineError::Worker {
            symbol: symbol.to_string(),
            message: err.to_string(),
        })?
        .map(Some)
    }

    async fn finish_symbol(
        &self,
        symbol: String,
        timeframe: Timeframe,
        result: EngineResult<Option<SymbolComputation>>,
    ) -> SymbolReport {
        let mut report = SymbolReport {
            symbol,
            timeframe,
            outcome: SymbolOutcome::Completed,
            phase: None,
            as_of_date: None,
            transitions: 0,
            warnings: 0,
            error_kind: None,
            error: None,
        };

        let computation = match result {
            Ok(Some(computation)) => computation,
            Ok(None) => {
                debug!("No {} bars for {}; nothing to do", timeframe, report.symbol);
                report.outcome = SymbolOutcome::Skipped;
                report.error = Some("no bars available".to_string());
                self.status.record_skipped(format!("{}: no bars", report.symbol));
                return report;
            }
            Err(err) => return self.fail_symbol(report, err),
        };

        let SymbolComputation {
            state,
            transitions,
            warnings,
            price_factors,
        } = computation;
        for warning in &warnings {
            warn!(
                "Rejected {} {} bar on {}: {}",
                warning.symbol, warning.timeframe, warning.date, warning.reason
            );
        }

        let context = format!("writing {} {} signal state", report.symbol, timeframe);
        let written: EngineResult<()> =
            retry_db_operation!(context, &self.settings.provider_retry, async {
                if !warnings.is_empty() {
                    self.sink.record_data_quality(&warnings).await?;
                }
                self.sink.upsert_signal_state(&state, &transitions).await
            });
        if let Err(err) = written {
            return self.fail_symbol(report, err);
        }

        if !price_factors.is_empty() {
            self.price_factors
                .insert(report.symbol.clone(), price_factors);
        }
        report.phase = Some(state.phase);
        report.as_of_date = state.as_of_date;
        report.transitions = transitions.len();
        report.warnings = warnings.len();
        self.status.record_completed();
        report
    }

    fn fail_symbol(&self, mut report: SymbolReport, err: EngineError) -> SymbolReport {
        report.outcome = SymbolOutcome::from_error(&err);
        report.error_kind = Some(err.kind());
        report.error = Some(err.to_string());
        match report.outcome {
            SymbolOutcome::Skipped => {
                warn!("Skipping {}: {}", report.symbol, err);
                self.status.record_skipped(err.to_string());
            }
            _ => {
                warn!("Signal run for {} failed: {}", report.symbol, err);
                self.status.record_failed(err.to_string());
            }
        }
        report
    }

    /// Cross-sectional pass. Waits for the full universe of a date before
    /// ranking it, then scores dates in parallel and writes each date as one batch.
    pub async fn run_scores(&self, window: RunWindow) -> Result<ScoreRunSummary> {
        let run_id = Uuid::new_v4();
        let cached_window = self
            .price_factor_window
            .lock()
            .ok()
            .and_then(|mut cached| cached.take());
        if cached_window != Some(window) {
            self.price_factors.clear();
            self.collect_price_factors(window).await?;
        }

        let mut derived_by_date: BTreeMap<NaiveDate, Vec<RawFactorValue>> = BTreeMap::new();
        for entry in self.price_factors.iter() {
            for value in entry.value() {
                derived_by_date
                    .entry(value.date)
                    .or_default()
                    .push(value.clone());
            }
        }
        self.price_factors.clear();

        let provider_dates = retry_with_backoff(
            "factor dates",
            &self.settings.provider_retry,
            || self.factors.factor_dates(window.from, window.to),
        )
        .await
        .context("failed to list factor dates")?;

        let mut dates: BTreeSet<NaiveDate> = provider_dates.into_iter().collect();
        dates.extend(derived_by_date.keys().copied());
        dates.retain(|date| {
            window.from.map_or(true, |from| *date >= from) && window.to.map_or(true, |to| *date <= to)
        });
        if window.from.is_none() {
            let latest = dates.iter().next_back().copied();
            dates = latest.into_iter().collect();
        }

        self.status.start("Computing composite scores", dates.len());
        let mut reports = Vec::with_capacity(dates.len());
        let mut raw_by_date = BTreeMap::new();
        for date in dates {
            let provided = retry_with_backoff(
                &format!("factors for {}", date),
                &self.settings.provider_retry,
                || self.factors.get_raw_factors_for_date(date),
            )
            .await;
            match provided {
                Ok(provided) => {
                    let derived = derived_by_date.remove(&date).unwrap_or_default();
                    raw_by_date.insert(date, merge_factor_values(derived, provided));
                }
                Err(err) => {
                    warn!("Skipping scores for {}: {}", date, err);
                    self.status.record_skipped(err.to_string());
                    reports.push(DateReport {
                        date,
                        symbols: 0,
                        scored: 0,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        let catalog = self.catalog.clone();
        let config = self.settings.scoring.clone();
        let cross_sections =
            tokio::task::spawn_blocking(move || score_dates(&raw_by_date, &catalog, &config))
                .await
                .context("scoring worker failed")?;

        for section in cross_sections {
            let context = format!("writing composite scores for {}", section.date);
            let written: EngineResult<()> =
                retry_db_operation!(context, &self.settings.provider_retry, async {
                    self.sink
                        .upsert_composite_scores(section.date, &section.scores, &section.normalized)
                        .await
                });
            let scored = section.scores.iter().filter(|s| s.overall.is_some()).count();
            match written {
                Ok(()) => {
                    self.status.record_completed();
                    reports.push(DateReport {
                        date: section.date,
                        symbols: section.scores.len(),
                        scored,
                        error: None,
                    });
                }
                Err(err) => {
                    warn!("Failed to write scores for {}: {}", section.date, err);
                    self.status.record_failed(err.to_string());
                    reports.push(DateReport {
                        date: section.date,
                        symbols: section.scores.len(),
                        scored: 0,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        reports.sort_by_key(|report| report.date);

        let summary = ScoreRunSummary {
            run_id,
            dates_scored: reports.iter().filter(|r| r.error.is_none()).count(),
            dates_failed: reports.iter().filter(|r| r.error.is_some()).count(),
            symbols_scored: reports.iter().map(|r| r.scored).sum(),
            reports,
        };
        self.status.set_phase("Idle");
        info!(
            "Composite scoring finished: {} dates scored, {} failed, {} symbol scores",
            summary.dates_scored, summary.dates_failed, summary.symbols_scored
        );
        Ok(summary)
    }

    /// Derives price factors for the daily universe when no daily signal pass
    /// over the same window preceded this scoring pass. Symbols that fail
    /// validation contribute nothing.
    async fn collect_price_factors(&self, window: RunWindow) -> Result<()> {
        let symbols = retry_with_backoff(
            "daily symbol list",
            &self.settings.provider_retry,
            || self.bars.list_symbols(Timeframe::Daily),
        )
        .await
        .context("failed to list daily symbols")?;
        if symbols.is_empty() {
            return Ok(());
        }

        let worker_limit = self.settings.max_workers.max(1).min(symbols.len());
        let mut pending = symbols.into_iter();
        let mut in_flight = FuturesUnordered::new();
        for _ in 0..worker_limit {
            if let Some(symbol) = pending.next() {
                in_flight.push(self.timed_symbol_job(symbol, Timeframe::Daily, window));
            }
        }
        while let Some((symbol, result)) = in_flight.next().await {
            match result {
                Ok(Some(computation)) if !computation.price_factors.is_empty() => {
                    self.price_factors.insert(symbol, computation.price_factors);
                }
                Ok(_) => {}
                Err(err) => warn!("No price factors for {}: {}", symbol, err),
            }
            if let Some(symbol) = pending.next() {
                in_flight.push(self.timed_symbol_job(symbol, Timeframe::Daily, window));
            }
        }
        Ok(())
    }

    /// Signals for every timeframe, then the scoring pass.
    pub async fn run_all(
        &self,
        timeframes: &[Timeframe],
        window: RunWindow,
    ) -> Result<(Vec<SignalRunSummary>, ScoreRunSummary)> {
        let mut signal_summaries = Vec::with_capacity(timeframes.len());
        for timeframe in timeframes {
            signal_summaries.push(self.run_signals(*timeframe, window).await?);
        }
        let scores = self.run_scores(window).await?;
        Ok((signal_summaries, scores))
    }
}
