use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate};
use engine::bar_utils::weekday_calendar;
use engine::config::{EngineSettings, RetryPolicy};
use engine::data_context::MarketData;
use engine::database::Database;
use engine::error::{EngineError, EngineResult};
use engine::models::{
    Bar, Category, CompositeScore, ExitKind, NormalizedFactor, RawFactorValue, SignalPhase,
    SignalState, SignalTransition, Timeframe,
};
use engine::pipeline::{Pipeline, RunWindow, SymbolOutcome};
use engine::providers::{BarHistoryProvider, FactorProvider, MemoryStore, OutputSink};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static LOGGER: Once = Once::new();

fn init_logging() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn daily_series(symbol: &str, count: usize, drift: f64) -> Vec<Bar> {
    weekday_calendar(date(2023, 1, 2), count)
        .into_iter()
        .enumerate()
        .map(|(i, day)| {
            let close = 40.0 + (i as f64 * 0.2).sin() * 2.0 + i as f64 * drift;
            Bar {
                symbol: symbol.to_string(),
                timeframe: Timeframe::Daily,
                date: day,
                open: close - 0.1,
                high: close + 0.6,
                low: close - 0.6,
                close,
                volume: 5_000.0 + (i % 7) as f64 * 100.0,
            }
        })
        .collect()
}

fn fast_settings() -> EngineSettings {
    EngineSettings {
        max_workers: 2,
        provider_retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        },
        ..EngineSettings::default()
    }
}

fn memory_pipeline(store: &Arc<MemoryStore>) -> Pipeline {
    Pipeline::new(store.clone(), store.clone(), store.clone(), fast_settings())
}

/// Bar provider that fails or stalls for selected symbols.
struct FaultyBars {
    inner: Arc<MemoryStore>,
    unavailable: HashSet<String>,
    stalled: HashSet<String>,
    calls: AtomicU32,
}

impl FaultyBars {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            unavailable: HashSet::new(),
            stalled: HashSet::new(),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl BarHistoryProvider for FaultyBars {
    async fn list_symbols(&self, timeframe: Timeframe) -> EngineResult<Vec<String>> {
        self.inner.list_symbols(timeframe).await
    }

    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> EngineResult<Vec<Bar>> {
        if self.unavailable.contains(symbol) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            return Err(EngineError::ProviderUnavailable {
                context: symbol.to_string(),
                attempts: 1,
                message: "connection reset".to_string(),
            });
        }
        if self.stalled.contains(symbol) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.inner.get_bars(symbol, timeframe, from, to).await
    }
}

#[tokio::test]
async fn data_gap_fails_symbol_and_keeps_prior_state() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    store.insert_bars(daily_series("AAA", 120, 0.05));
    store.insert_bars(daily_series("GAP", 120, 0.03));
    let pipeline = memory_pipeline(&store);

    let first = pipeline
        .run_signals(Timeframe::Daily, RunWindow::default())
        .await
        .unwrap();
    assert_eq!(first.completed, 2);
    let before = store.signal_state("GAP", Timeframe::Daily).unwrap();

    let mut gapped = daily_series("GAP", 130, 0.03);
    gapped.drain(100..103);
    store.insert_bars(gapped);

    let second = pipeline
        .run_signals(Timeframe::Daily, RunWindow::default())
        .await
        .unwrap();
    let report = second.report("GAP").unwrap();
    assert_eq!(report.outcome, SymbolOutcome::Failed);
    assert_eq!(report.error_kind, Some("data_gap"));
    assert_eq!(second.report("AAA").unwrap().outcome, SymbolOutcome::Completed);
    assert_eq!(second.failed, 1);
    assert_eq!(store.signal_state("GAP", Timeframe::Daily), Some(before));
}

#[tokio::test]
async fn invariant_violations_are_dropped_with_a_warning() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let mut bars = daily_series("BAD", 90, 0.02);
    bars[45].high = bars[45].low - 1.0;
    let bad_date = bars[45].date;
    store.insert_bars(bars);

    let summary = memory_pipeline(&store)
        .run_signals(Timeframe::Daily, RunWindow::default())
        .await
        .unwrap();
    let report = summary.report("BAD").unwrap();
    assert_eq!(report.outcome, SymbolOutcome::Completed);
    assert_eq!(report.warnings, 1);

    let outputs = store.outputs();
    assert_eq!(outputs.data_quality_warnings.len(), 1);
    assert_eq!(outputs.data_quality_warnings[0].date, bad_date);
    assert!(outputs.data_quality_warnings[0].reason.contains("below low"));
    assert!(store.signal_state("BAD", Timeframe::Daily).is_some());
}

#[tokio::test]
async fn provider_outage_skips_symbol_after_bounded_retries() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    store.insert_bars(daily_series("UP", 80, 0.02));
    store.insert_bars(daily_series("DOWN", 80, 0.02));
    let mut bars = FaultyBars::new(store.clone());
    bars.unavailable.insert("DOWN".to_string());
    let bars = Arc::new(bars);

    let pipeline = Pipeline::new(bars.clone(), store.clone(), store.clone(), fast_settings());
    let summary = pipeline
        .run_signals(Timeframe::Daily, RunWindow::default())
        .await
        .unwrap();

    let report = summary.report("DOWN").unwrap();
    assert_eq!(report.outcome, SymbolOutcome::Skipped);
    assert_eq!(report.error_kind, Some("provider_unavailable"));
    assert_eq!(bars.calls.load(Ordering::SeqCst), 3);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.completed, 1);
    assert!(store.signal_state("DOWN", Timeframe::Daily).is_none());
    assert_eq!(pipeline.status().snapshot().skipped, 1);
}

#[tokio::test]
async fn timed_out_symbol_writes_nothing() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    store.insert_bars(daily_series("FAST", 60, 0.02));
    store.insert_bars(daily_series("SLOW", 60, 0.02));
    let mut bars = FaultyBars::new(store.clone());
    bars.stalled.insert("SLOW".to_string());

    let pipeline = Pipeline::new(Arc::new(bars), store.clone(), store.clone(), fast_settings())
        .with_symbol_timeout(Duration::from_millis(200));
    let summary = pipeline
        .run_signals(Timeframe::Daily, RunWindow::default())
        .await
        .unwrap();

    assert_eq!(summary.report("SLOW").unwrap().outcome, SymbolOutcome::TimedOut);
    assert_eq!(summary.timed_out, 1);
    assert!(store.signal_state("SLOW", Timeframe::Daily).is_none());
    assert!(store.transitions_for("SLOW", Timeframe::Daily).is_empty());
    assert!(store.signal_state("FAST", Timeframe::Daily).is_some());
}

#[tokio::test]
async fn rerunning_overwrites_by_key() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    for symbol in ["AAA", "BBB", "CCC"] {
        store.insert_bars(daily_series(symbol, 150, 0.04));
    }
    let pipeline = memory_pipeline(&store);

    pipeline
        .run_signals(Timeframe::Daily, RunWindow::default())
        .await
        .unwrap();
    let first = store.outputs();
    pipeline
        .run_signals(Timeframe::Daily, RunWindow::default())
        .await
        .unwrap();
    let second = store.outputs();

    assert_eq!(first.signal_states.len(), 3);
    assert_eq!(first.signal_states, second.signal_states);
    assert_eq!(first.transitions, second.transitions);
}

#[tokio::test]
async fn replay_with_corrected_history_drops_stale_transitions() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let bars = daily_series("AAA", 120, 0.03);
    let stale_date = bars[60].date;
    store.insert_bars(bars);
    let mut stale_state = SignalState::empty("AAA", Timeframe::Daily);
    stale_state.phase = SignalPhase::BaseForming;
    store
        .upsert_signal_state(
            &stale_state,
            &[SignalTransition {
                symbol: "AAA".to_string(),
                timeframe: Timeframe::Daily,
                date: stale_date,
                bar_index: 60,
                from: SignalPhase::None,
                to: SignalPhase::BaseForming,
                reason: "base detected".to_string(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(store.transitions_for("AAA", Timeframe::Daily).len(), 1);

    let summary = memory_pipeline(&store)
        .run_signals(Timeframe::Daily, RunWindow::default())
        .await
        .unwrap();
    let report = summary.report("AAA").unwrap();
    assert_eq!(report.outcome, SymbolOutcome::Completed);

    let stored = store.transitions_for("AAA", Timeframe::Daily);
    assert_eq!(stored.len(), report.transitions);
    assert!(stored
        .iter()
        .all(|t| !(t.date == stale_date && t.reason == "base detected")));
}

#[tokio::test]
async fn replay_window_bounds_the_as_of_date() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let bars = daily_series("AAA", 100, 0.02);
    let cutoff = bars[79].date;
    store.insert_bars(bars);

    memory_pipeline(&store)
        .run_signals(
            Timeframe::Daily,
            RunWindow {
                from: None,
                to: Some(cutoff),
            },
        )
        .await
        .unwrap();
    let state = store.signal_state("AAA", Timeframe::Daily).unwrap();
    assert_eq!(state.as_of_date, Some(cutoff));
}

fn factor(symbol: &str, day: NaiveDate, name: &str, value: Option<f64>) -> RawFactorValue {
    RawFactorValue {
        symbol: symbol.to_string(),
        date: day,
        factor: name.to_string(),
        value,
    }
}

#[tokio::test]
async fn scores_latest_date_when_window_is_open() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let early = date(2024, 3, 28);
    let latest = date(2024, 3, 29);
    let pe = [("S1", 10.0), ("S2", 20.0), ("S3", 30.0), ("S4", 40.0), ("S5", 50.0)];
    for (symbol, value) in pe {
        store.insert_factors(vec![
            factor(symbol, early, "pe_ratio", Some(value)),
            factor(symbol, latest, "pe_ratio", Some(value)),
        ]);
    }
    store.insert_factors(vec![factor("S6", latest, "pe_ratio", None)]);

    let summary = memory_pipeline(&store)
        .run_scores(RunWindow::default())
        .await
        .unwrap();
    assert_eq!(summary.dates_scored, 1);
    assert_eq!(summary.reports[0].date, latest);
    assert_eq!(summary.symbols_scored, 5);
    assert!(store.composite_score("S1", early).is_none());

    let best = store.composite_score("S1", latest).unwrap();
    assert_eq!(best.subscore(Category::Value), Some(100.0));
    assert_eq!(best.overall, Some(100.0));
    assert_eq!(best.category_weights_used.len(), 1);
    let worst = store.composite_score("S5", latest).unwrap();
    assert_eq!(worst.overall, Some(0.0));

    let missing = store.composite_score("S6", latest).unwrap();
    assert_eq!(missing.overall, None);
    let normalized = store.normalized_factor("S6", latest, "pe_ratio").unwrap();
    assert_eq!(normalized.percentile, None);
}

#[tokio::test]
async fn scoring_rederives_price_factors_for_a_new_window() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    for (symbol, drift) in [("AAA", 0.05), ("BBB", 0.01), ("CCC", -0.02)] {
        store.insert_bars(daily_series(symbol, 200, drift));
    }
    let bars = daily_series("AAA", 200, 0.05);
    let cutoff = bars[150].date;
    let latest = bars[199].date;
    let pipeline = memory_pipeline(&store);

    pipeline
        .run_signals(
            Timeframe::Daily,
            RunWindow {
                from: None,
                to: Some(cutoff),
            },
        )
        .await
        .unwrap();
    let summary = pipeline.run_scores(RunWindow::default()).await.unwrap();

    assert_eq!(summary.dates_scored, 1);
    assert_eq!(summary.reports[0].date, latest);
    assert!(store.composite_score("AAA", cutoff).is_none());
    let score = store.composite_score("AAA", latest).unwrap();
    assert!(score.subscore(Category::Momentum).is_some());
}

#[tokio::test]
async fn momentum_and_value_blend_by_category_weight() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let day = date(2024, 6, 28);
    let rows = [
        ("A", 5.0, 30.0),
        ("B", 10.0, 20.0),
        ("C", 15.0, 10.0),
    ];
    for (symbol, momentum, pe) in rows {
        store.insert_factors(vec![
            factor(symbol, day, "return_3m", Some(momentum)),
            factor(symbol, day, "pe_ratio", Some(pe)),
        ]);
    }

    let pipeline = memory_pipeline(&store);
    pipeline
        .run_scores(RunWindow {
            from: Some(day),
            to: Some(day),
        })
        .await
        .unwrap();

    let weights = &pipeline.settings().scoring;
    let (wm, wv) = (
        weights.category_weight(Category::Momentum),
        weights.category_weight(Category::Value),
    );
    let score: CompositeScore = store.composite_score("C", day).unwrap();
    let momentum = score.subscore(Category::Momentum).unwrap();
    let value = score.subscore(Category::Value).unwrap();
    assert_eq!((momentum, value), (100.0, 100.0));

    let middle = store.composite_score("B", day).unwrap();
    let expected = (wm * 50.0 + wv * 50.0) / (wm + wv);
    assert!((middle.overall.unwrap() - expected).abs() < 1e-9);
    let used: f64 = middle.category_weights_used.values().sum();
    assert!((used - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn snapshot_run_all_produces_signals_and_scores() {
    init_logging();
    let mut bars = Vec::new();
    for (symbol, drift) in [("AAA", 0.05), ("BBB", 0.01), ("CCC", -0.02), ("DDD", 0.03)] {
        bars.extend(daily_series(symbol, 300, drift));
    }
    let last = bars.iter().map(|bar| bar.date).max().unwrap();
    let factors = vec![
        factor("AAA", last, "roe", Some(0.25)),
        factor("BBB", last, "roe", Some(0.10)),
        factor("CCC", last, "roe", Some(0.05)),
        factor("DDD", last, "roe", None),
    ];
    let symbols = vec!["AAA", "BBB", "CCC", "DDD"]
        .into_iter()
        .map(str::to_string)
        .collect();
    let mut settings = HashMap::new();
    settings.insert("MAX_WORKERS".to_string(), "2".to_string());
    let data = MarketData::from_components(symbols, bars, factors, settings).unwrap();
    let store = Arc::new(data.to_memory_store());

    let pipeline = memory_pipeline(&store);
    let (signals, scores) = pipeline
        .run_all(&[Timeframe::Daily], RunWindow::default())
        .await
        .unwrap();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].completed, 4);
    assert_eq!(scores.dates_scored, 1);
    assert_eq!(scores.reports[0].date, last);

    let leader = store.composite_score("AAA", last).unwrap();
    let laggard = store.composite_score("CCC", last).unwrap();
    assert!(leader.subscore(Category::Momentum).unwrap() > laggard.subscore(Category::Momentum).unwrap());
    assert!(leader.subscore(Category::Quality).is_some());
    assert!(store.composite_score("DDD", last).unwrap().subscore(Category::Quality).is_none());
    assert!(store.composite_score("DDD", last).unwrap().overall.is_some());
}

/// Round trip against a real database. Runs only when `TEST_DATABASE_URL` is set.
#[tokio::test]
async fn postgres_round_trip() {
    init_logging();
    dotenvy::dotenv().ok();
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        return;
    };
    let db = Database::new(&url).await.unwrap();
    db.apply_schema().await.unwrap();

    let symbol = format!("T{}", &uuid::Uuid::new_v4().simple().to_string()[..8]).to_uppercase();
    let day = date(2024, 2, 1);

    let mut state = SignalState::empty(&symbol, Timeframe::Weekly);
    state.phase = SignalPhase::Exited;
    state.as_of_date = Some(day);
    state.exit_reason = Some(ExitKind::TrailingStop);
    state.exit_price = Some(42.5);
    let transitions = vec![SignalTransition {
        symbol: symbol.clone(),
        timeframe: Timeframe::Weekly,
        date: day,
        bar_index: 57,
        from: SignalPhase::InPosition,
        to: SignalPhase::Exited,
        reason: "trailing stop hit".to_string(),
    }];
    db.upsert_signal_state(&state, &transitions).await.unwrap();
    db.upsert_signal_state(&state, &transitions).await.unwrap();
    assert_eq!(
        db.get_signal_state(&symbol, Timeframe::Weekly).await.unwrap(),
        Some(state.clone())
    );
    assert_eq!(
        db.get_transitions(&symbol, Timeframe::Weekly).await.unwrap(),
        transitions
    );
    db.upsert_signal_state(&state, &[]).await.unwrap();
    assert!(db.get_transitions(&symbol, Timeframe::Weekly).await.unwrap().is_empty());

    let score = CompositeScore {
        symbol: symbol.clone(),
        date: day,
        subscores: BTreeMap::from([(Category::Value, Some(80.0))]),
        overall: Some(80.0),
        category_weights_used: BTreeMap::from([(Category::Value, 1.0)]),
        contributing_factors: 1,
    };
    let normalized = vec![NormalizedFactor {
        symbol: symbol.clone(),
        date: day,
        factor: "pe_ratio".to_string(),
        percentile: Some(80.0),
    }];
    db.upsert_composite_scores(day, &[score], &normalized)
        .await
        .unwrap();
    assert_eq!(db.get_overall_score(&symbol, day).await.unwrap(), Some(80.0));

    let next_day = day + ChronoDuration::days(1);
    let bars = vec![Bar {
        symbol: symbol.clone(),
        timeframe: Timeframe::Daily,
        date: next_day,
        open: 10.0,
        high: 11.0,
        low: 9.0,
        close: 10.5,
        volume: 100.0,
    }];
    db.upsert_bars(&bars).await.unwrap();
    let loaded = db
        .get_bars(&symbol, Timeframe::Daily, Some(next_day), None)
        .await
        .unwrap();
    assert_eq!(loaded, bars);

    db.upsert_raw_factors(&[factor(&symbol, next_day, "beta", Some(1.2))])
        .await
        .unwrap();
    db.upsert_raw_factors(&[factor(&symbol, next_day, "beta", Some(0.9))])
        .await
        .unwrap();
    assert_eq!(
        db.get_raw_factor(&symbol, next_day, "beta").await.unwrap(),
        Some(0.9)
    );
}
