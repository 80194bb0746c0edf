use crate::error::EngineResult;
use crate::models::{
    Bar, CompositeScore, DataQualityWarning, NormalizedFactor, RawFactorValue, SignalState,
    SignalTransition, Timeframe,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Source of ascending, per-(symbol, timeframe) OHLCV history.
#[async_trait]
pub trait BarHistoryProvider: Send + Sync {
    async fn list_symbols(&self, timeframe: Timeframe) -> EngineResult<Vec<String>>;

    /// Bars dated within `[from, to]` (either bound open when `None`), ascending.
    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> EngineResult<Vec<Bar>>;
}

/// Source of fundamental and sentiment readings. A missing reading is `None`.
#[async_trait]
pub trait FactorProvider: Send + Sync {
    async fn get_raw_factor(
        &self,
        symbol: &str,
        date: NaiveDate,
        factor: &str,
    ) -> EngineResult<Option<f64>>;

    async fn get_raw_factors_for_date(&self, date: NaiveDate) -> EngineResult<Vec<RawFactorValue>>;

    async fn factor_dates(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> EngineResult<Vec<NaiveDate>>;
}

/// Keyed store for engine results. Every write overwrites by key, so
/// recomputing a unit of work replaces what an earlier run wrote.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Writes the latest state keyed by (symbol, timeframe) and replaces the
    /// stored transitions of that pair with `transitions`.
    async fn upsert_signal_state(
        &self,
        state: &SignalState,
        transitions: &[SignalTransition],
    ) -> EngineResult<()>;

    async fn upsert_composite_scores(
        &self,
        date: NaiveDate,
        scores: &[CompositeScore],
        normalized: &[NormalizedFactor],
    ) -> EngineResult<()>;

    async fn record_data_quality(&self, warnings: &[DataQualityWarning]) -> EngineResult<()>;
}

fn in_range(date: NaiveDate, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
    from.map_or(true, |from| date >= from) && to.map_or(true, |to| date <= to)
}

/// Everything a run wrote, in key order. Used for `--output` dumps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredOutputs {
    pub signal_states: Vec<SignalState>,
    pub transitions: Vec<SignalTransition>,
    pub composite_scores: Vec<CompositeScore>,
    pub normalized_factors: Vec<NormalizedFactor>,
    pub data_quality_warnings: Vec<DataQualityWarning>,
}

/// In-process provider and sink backed by concurrent maps. Serves offline
/// snapshot runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    bars: DashMap<(String, Timeframe), Vec<Bar>>,
    factors: DashMap<(NaiveDate, String, String), Option<f64>>,
    signal_states: DashMap<(String, Timeframe), SignalState>,
    transitions: DashMap<(String, Timeframe, NaiveDate), SignalTransition>,
    scores: DashMap<(String, NaiveDate), CompositeScore>,
    normalized: DashMap<(String, NaiveDate, String), NormalizedFactor>,
    warnings: DashMap<(String, Timeframe, NaiveDate), DataQualityWarning>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stored history of every (symbol, timeframe) present in `bars`.
    pub fn insert_bars(&self, bars: Vec<Bar>) {
        let mut grouped: BTreeMap<(String, Timeframe), Vec<Bar>> =
            BTreeMap::new();
        for bar in bars {
            grouped
                .entry((bar.symbol.clone(), bar.timeframe))
                .or_default()
                .push(bar);
        }
        for (key, series) in grouped {
            self.bars.insert(key, series);
        }
    }

    pub fn insert_factors(&self, values: Vec<RawFactorValue>) {
        for value in values {
            self.factors
                .insert((value.date, value.symbol, value.factor), value.value);
        }
    }

    pub fn signal_state(&self, symbol: &str, timeframe: Timeframe) -> Option<SignalState> {
        self.signal_states
            .get(&(symbol.to_string(), timeframe))
            .map(|entry| entry.value().clone())
    }

    pub fn transitions_for(&self, symbol: &str, timeframe: Timeframe) -> Vec<SignalTransition> {
        let mut transitions: Vec<SignalTransition> = self
            .transitions
            .iter()
            .filter(|entry| entry.key().0 == symbol && entry.key().1 == timeframe)
            .map(|entry| entry.value().clone())
            .collect();
        transitions.sort_by_key(|t| t.date);
        transitions
    }

    pub fn composite_score(&self, symbol: &str, date: NaiveDate) -> Option<CompositeScore> {
        self.scores
            .get(&(symbol.to_string(), date))
            .map(|entry| entry.value().clone())
    }

    pub fn normalized_factor(
        &self,
        symbol: &str,
        date: NaiveDate,
        factor: &str,
    ) -> Option<NormalizedFactor> {
        self.normalized
            .get(&(symbol.to_string(), date, factor.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Copies every stored result out, sorted by key.
    pub fn outputs(&self) -> StoredOutputs {
        let mut outputs = StoredOutputs {
            signal_states: self.signal_states.iter().map(|e| e.value().clone()).collect(),
            transitions: self.transitions.iter().map(|e| e.value().clone()).collect(),
            composite_scores: self.scores.iter().map(|e| e.value().clone()).collect(),
            normalized_factors: self.normalized.iter().map(|e| e.value().clone()).collect(),
            data_quality_warnings: self.warnings.iter().map(|e| e.value().clone()).collect(),
        };
        outputs
            .signal_states
            .sort_by(|a, b| (&a.symbol, a.timeframe).cmp(&(&b.symbol, b.timeframe)));
        outputs
            .transitions
            .sort_by(|a, b| (&a.symbol, a.timeframe, a.date).cmp(&(&b.symbol, b.timeframe, b.date)));
        outputs
            .composite_scores
            .sort_by(|a, b| (a.date, &a.symbol).cmp(&(b.date, &b.symbol)));
        outputs.normalized_factors.sort_by(|a, b| {
            (a.date, &a.symbol, &a.factor).cmp(&(b.date, &b.symbol, &b.factor))
        });
        outputs.data_quality_warnings.sort_by(|a, b| {
            (&a.symbol, a.timeframe, a.date).cmp(&(&b.symbol, b.timeframe, b.date))
        });
        outputs
    }
}

#[async_trait]
impl BarHistoryProvider for MemoryStore {
    async fn list_symbols(&self, timeframe: Timeframe) -> EngineResult<Vec<String>> {
        let symbols: BTreeSet<String> = self
            .bars
            .iter()
            .filter(|entry| entry.key().1 == timeframe)
            .map(|entry| entry.key().0.clone())
            .collect();
        Ok(symbols.into_iter().collect())
    }

    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> EngineResult<Vec<Bar>> {
        Ok(self
            .bars
            .get(&(symbol.to_string(), timeframe))
            .map(|series| {
                series
                    .iter()
                    .filter(|bar| in_range(bar.date, from, to))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl FactorProvider for MemoryStore {
    async fn get_raw_factor(
        &self,
        symbol: &str,
        date: NaiveDate,
        factor: &str,
    ) -> EngineResult<Option<f64>> {
        Ok(self
            .factors
            .get(&(date, symbol.to_string(), factor.to_string()))
            .and_then(|entry| *entry.value()))
    }

    async fn get_raw_factors_for_date(&self, date: NaiveDate) -> EngineResult<Vec<RawFactorValue>> {
        let mut values: Vec<RawFactorValue> = self
            .factors
            .iter()
            .filter(|entry| entry.key().0 == date)
            .map(|entry| {
                let (date, symbol, factor) = entry.key().clone();
                RawFactorValue {
                    symbol,
                    date,
                    factor,
                    value: *entry.value(),
                }
            })
            .collect();
        values.sort_by(|a, b| (&a.symbol, &a.factor).cmp(&(&b.symbol, &b.factor)));
        Ok(values)
    }

    async fn factor_dates(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> EngineResult<Vec<NaiveDate>> {
        let dates: BTreeSet<NaiveDate> = self
            .factors
            .iter()
            .map(|entry| entry.key().0)
            .filter(|date| in_range(*date, from, to))
            .collect();
        Ok(dates.into_iter().collect())
    }
}

#[async_trait]
impl OutputSink for MemoryStore {
    async fn upsert_signal_state(
        &self,
        state: &SignalState,
        transitions: &[SignalTransition],
    ) -> EngineResult<()> {
        self.signal_states
            .insert((state.symbol.clone(), state.timeframe), state.clone());
        self.transitions.retain(|(symbol, timeframe, _), _| {
            !(symbol == &state.symbol && *timeframe == state.timeframe)
        });
        for transition in transitions {
            self.transitions.insert(
                (
                    transition.symbol.clone(),
                    transition.timeframe,
                    transition.date,
                ),
                transition.clone(),
            );
        }
        Ok(())
    }

    async fn upsert_composite_scores(
        &self,
        date: NaiveDate,
        scores: &[CompositeScore],
        normalized: &[NormalizedFactor],
    ) -> EngineResult<()> {
        for score in scores {
            self.scores
                .insert((score.symbol.clone(), date), score.clone());
        }
        for value in normalized {
            self.normalized.insert(
                (value.symbol.clone(), date, value.factor.clone()),
                value.clone(),
            );
        }
        Ok(())
    }

    async fn record_data_quality(&self, warnings: &[DataQualityWarning]) -> EngineResult<()> {
        for warning in warnings {
            self.warnings.insert(
                (warning.symbol.clone(), warning.timeframe, warning.date),
                warning.clone(),
            );
        }
        Ok(())
    }
}
