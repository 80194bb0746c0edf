use anyhow::anyhow;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    Daily,
    Weekly,
    Monthly,
}

impl Timeframe {
    pub const ALL: [Timeframe; 3] = [Timeframe::Daily, Timeframe::Weekly, Timeframe::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Daily => "daily",
            Timeframe::Weekly => "weekly",
            Timeframe::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "daily" | "d" | "1d" => Ok(Timeframe::Daily),
            "weekly" | "w" | "1w" => Ok(Timeframe::Weekly),
            "monthly" | "m" | "1m" => Ok(Timeframe::Monthly),
            other => Err(anyhow!("Unknown timeframe '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Per-bar technical readings. A field is `None` whenever its full lookback
/// window is unavailable or its value is undefined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub date: Option<NaiveDate>,
    pub rsi: Option<f64>,
    pub adx: Option<f64>,
    pub atr: Option<f64>,
    /// Percent distance of the close from each moving average, keyed by period.
    pub ma_distance_pct: BTreeMap<usize, Option<f64>>,
    pub avg_volume: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub range_pct: Option<f64>,
}

impl IndicatorSnapshot {
    pub fn ma_distance(&self, period: usize) -> Option<f64> {
        self.ma_distance_pct.get(&period).copied().flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalPhase {
    None,
    BaseForming,
    BreakoutPending,
    InPosition,
    Exited,
}

impl SignalPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalPhase::None => "none",
            SignalPhase::BaseForming => "base_forming",
            SignalPhase::BreakoutPending => "breakout_pending",
            SignalPhase::InPosition => "in_position",
            SignalPhase::Exited => "exited",
        }
    }
}

impl FromStr for SignalPhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(SignalPhase::None),
            "base_forming" => Ok(SignalPhase::BaseForming),
            "breakout_pending" => Ok(SignalPhase::BreakoutPending),
            "in_position" => Ok(SignalPhase::InPosition),
            "exited" => Ok(SignalPhase::Exited),
            other => Err(anyhow!("Unknown signal phase '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaseType {
    TightRange,
    FlatBase,
    Consolidation,
}

impl BaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaseType::TightRange => "tight_range",
            BaseType::FlatBase => "flat_base",
            BaseType::Consolidation => "consolidation",
        }
    }
}

impl FromStr for BaseType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tight_range" => Ok(BaseType::TightRange),
            "flat_base" => Ok(BaseType::FlatBase),
            "consolidation" => Ok(BaseType::Consolidation),
            other => Err(anyhow!("Unknown base type '{}'", other)),
        }
    }
}

/// Exit triggers in their evaluation priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExitKind {
    HardStop,
    TrailingStop,
    Target,
    Time,
}

impl ExitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitKind::HardStop => "hard_stop",
            ExitKind::TrailingStop => "trailing_stop",
            ExitKind::Target => "target",
            ExitKind::Time => "time",
        }
    }
}

impl FromStr for ExitKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hard_stop" => Ok(ExitKind::HardStop),
            "trailing_stop" => Ok(ExitKind::TrailingStop),
            "target" => Ok(ExitKind::Target),
            "time" => Ok(ExitKind::Time),
            other => Err(anyhow!("Unknown exit reason '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitCondition {
    LowAtOrBelow,
    HighAtOrAbove,
    BarsHeldAtLeast,
}

impl ExitCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitCondition::LowAtOrBelow => "low_at_or_below",
            ExitCondition::HighAtOrAbove => "high_at_or_above",
            ExitCondition::BarsHeldAtLeast => "bars_held_at_least",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitTrigger {
    pub kind: ExitKind,
    pub level: f64,
    pub condition: ExitCondition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalState {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub phase: SignalPhase,
    pub as_of_date: Option<NaiveDate>,
    pub pivot_price: Option<f64>,
    pub buy_zone_start: Option<f64>,
    pub buy_zone_end: Option<f64>,
    pub base_low: Option<f64>,
    pub base_type: Option<BaseType>,
    pub base_start_date: Option<NaiveDate>,
    pub base_length_days: Option<i64>,
    pub entry_price: Option<f64>,
    pub entry_date: Option<NaiveDate>,
    pub initial_stop: Option<f64>,
    pub trailing_stop: Option<f64>,
    pub target_price: Option<f64>,
    pub risk_reward: Option<f64>,
    pub exit_triggers: Vec<ExitTrigger>,
    pub days_in_position: Option<i64>,
    pub current_gain_pct: Option<f64>,
    pub exit_reason: Option<ExitKind>,
    pub exit_date: Option<NaiveDate>,
    pub exit_price: Option<f64>,
}

impl SignalState {
    pub fn empty(symbol: &str, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            phase: SignalPhase::None,
            as_of_date: None,
            pivot_price: None,
            buy_zone_start: None,
            buy_zone_end: None,
            base_low: None,
            base_type: None,
            base_start_date: None,
            base_length_days: None,
            entry_price: None,
            entry_date: None,
            initial_stop: None,
            trailing_stop: None,
            target_price: None,
            risk_reward: None,
            exit_triggers: Vec::new(),
            days_in_position: None,
            current_gain_pct: None,
            exit_reason: None,
            exit_date: None,
            exit_price: None,
        }
    }

    /// Clears everything but the key and the as-of date.
    pub fn reset(&mut self) {
        let as_of_date = self.as_of_date;
        *self = Self::empty(&self.symbol, self.timeframe);
        self.as_of_date = as_of_date;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalTransition {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub date: NaiveDate,
    pub bar_index: usize,
    pub from: SignalPhase,
    pub to: SignalPhase,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQualityWarning {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub date: NaiveDate,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFactorValue {
    pub symbol: String,
    pub date: NaiveDate,
    pub factor: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedFactor {
    pub symbol: String,
    pub date: NaiveDate,
    pub factor: String,
    pub percentile: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    Momentum,
    Value,
    Quality,
    Growth,
    Positioning,
    Sentiment,
    Stability,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Momentum,
        Category::Value,
        Category::Quality,
        Category::Growth,
        Category::Positioning,
        Category::Sentiment,
        Category::Stability,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Momentum => "momentum",
            Category::Value => "value",
            Category::Quality => "quality",
            Category::Growth => "growth",
            Category::Positioning => "positioning",
            Category::Sentiment => "sentiment",
            Category::Stability => "stability",
        }
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Category::ALL
            .iter()
            .copied()
            .find(|category| category.as_str() == normalized)
            .ok_or_else(|| anyhow!("Unknown factor category '{}'", normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeScore {
    pub symbol: String,
    pub date: NaiveDate,
    pub subscores: BTreeMap<Category, Option<f64>>,
    pub overall: Option<f64>,
    /// Renormalized weights of the categories that contributed to `overall`.
    pub category_weights_used: BTreeMap<Category, f64>,
    pub contributing_factors: usize,
}

impl CompositeScore {
    pub fn subscore(&self, category: Category) -> Option<f64> {
        self.subscores.get(&category).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_and_phase_round_trip_through_strings() {
        for timeframe in Timeframe::ALL {
            assert_eq!(timeframe.as_str().parse::<Timeframe>().unwrap(), timeframe);
        }
        assert_eq!(
            "BREAKOUT_PENDING".parse::<SignalPhase>().unwrap(),
            SignalPhase::BreakoutPending
        );
        assert!("sideways".parse::<SignalPhase>().is_err());
    }

    #[test]
    fn reset_keeps_key_and_as_of_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut state = SignalState::empty("ABC", Timeframe::Weekly);
        state.phase = SignalPhase::Exited;
        state.as_of_date = Some(date);
        state.exit_reason = Some(ExitKind::Target);

        state.reset();

        assert_eq!(state.symbol, "ABC");
        assert_eq!(state.timeframe, Timeframe::Weekly);
        assert_eq!(state.phase, SignalPhase::None);
        assert_eq!(state.as_of_date, Some(date));
        assert!(state.exit_reason.is_none());
    }

    #[test]
    fn exit_kinds_sort_in_priority_order() {
        let mut kinds = vec![
            ExitKind::Time,
            ExitKind::Target,
            ExitKind::HardStop,
            ExitKind::TrailingStop,
        ];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                ExitKind::HardStop,
                ExitKind::TrailingStop,
                ExitKind::Target,
                ExitKind::Time
            ]
        );
    }
}
