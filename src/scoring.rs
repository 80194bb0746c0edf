use crate::config::ScoringConfig;
use crate::factors;
use crate::models::{Category, CompositeScore, NormalizedFactor, RawFactorValue};
use crate::normalizer::{normalize_cross_section, Direction};
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct FactorSpec {
    pub name: String,
    pub category: Category,
    pub weight: f64,
    pub direction: Direction,
}

impl FactorSpec {
    fn new(name: &str, category: Category, weight: f64, direction: Direction) -> Self {
        Self {
            name: name.to_string(),
            category,
            weight,
            direction,
        }
    }
}

/// The candidate factors of every category with their in-category weights.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorCatalog {
    factors: Vec<FactorSpec>,
}

impl Default for FactorCatalog {
    fn default() -> Self {
        use Category::*;
        use Direction::*;
        let factors = vec![
            FactorSpec::new(factors::RETURN_3M, Momentum, 0.30, HigherIsBetter),
            FactorSpec::new(factors::RETURN_6M, Momentum, 0.30, HigherIsBetter),
            FactorSpec::new(factors::RETURN_12M, Momentum, 0.25, HigherIsBetter),
            FactorSpec::new(factors::RSI_14, Momentum, 0.15, HigherIsBetter),
            FactorSpec::new("pe_ratio", Value, 0.30, LowerIsBetter),
            FactorSpec::new("pb_ratio", Value, 0.20, LowerIsBetter),
            FactorSpec::new("ps_ratio", Value, 0.20, LowerIsBetter),
            FactorSpec::new("ev_ebitda", Value, 0.15, LowerIsBetter),
            FactorSpec::new("fcf_yield", Value, 0.15, HigherIsBetter),
            FactorSpec::new("roe", Quality, 0.35, HigherIsBetter),
            FactorSpec::new("gross_margin", Quality, 0.25, HigherIsBetter),
            FactorSpec::new("operating_margin", Quality, 0.20, HigherIsBetter),
            FactorSpec::new("debt_to_equity", Quality, 0.20, LowerIsBetter),
            FactorSpec::new("eps_growth_yoy", Growth, 0.40, HigherIsBetter),
            FactorSpec::new("revenue_growth_yoy", Growth, 0.40, HigherIsBetter),
            FactorSpec::new("eps_growth_3y", Growth, 0.20, HigherIsBetter),
            FactorSpec::new("institutional_ownership_change", Positioning, 0.40, HigherIsBetter),
            FactorSpec::new("short_interest_pct", Positioning, 0.35, LowerIsBetter),
            FactorSpec::new("insider_net_buying", Positioning, 0.25, HigherIsBetter),
            FactorSpec::new("analyst_revision", Sentiment, 0.40, HigherIsBetter),
            FactorSpec::new("news_sentiment", Sentiment, 0.35, HigherIsBetter),
            FactorSpec::new("social_sentiment", Sentiment, 0.25, HigherIsBetter),
            FactorSpec::new(factors::VOLATILITY_1Y, Stability, 0.40, LowerIsBetter),
            FactorSpec::new(factors::MAX_DRAWDOWN_1Y, Stability, 0.35, LowerIsBetter),
            FactorSpec::new("beta", Stability, 0.25, LowerIsBetter),
        ];
        Self { factors }
    }
}

impl FactorCatalog {
    pub fn new(factors: Vec<FactorSpec>) -> Result<Self> {
        let mut seen = HashSet::new();
        for spec in &factors {
            if !seen.insert(spec.name.as_str()) {
                return Err(anyhow!("Factor '{}' is listed more than once", spec.name));
            }
            if !spec.weight.is_finite() || spec.weight <= 0.0 {
                return Err(anyhow!(
                    "Factor '{}' weight must be > 0 (value: {})",
                    spec.name,
                    spec.weight
                ));
            }
        }
        Ok(Self { factors })
    }

    pub fn factors(&self) -> &[FactorSpec] {
        &self.factors
    }

    pub fn in_category(&self, category: Category) -> impl Iterator<Item = &FactorSpec> {
        self.factors.iter().filter(move |spec| spec.category == category)
    }

    pub fn get(&self, name: &str) -> Option<&FactorSpec> {
        self.factors.iter().find(|spec| spec.name == name)
    }
}

/// Weighted mean of `(weight, value)` pairs, or `None` when nothing contributes.
fn weighted_mean(pairs: impl Iterator<Item = (f64, f64)>) -> Option<f64> {
    let (weighted_sum, weight_sum) = pairs.fold((0.0, 0.0), |(sum, weights), (weight, value)| {
        (sum + weight * value, weights + weight)
    });
    if weight_sum > 0.0 {
        Some(weighted_sum / weight_sum)
    } else {
        None
    }
}

/// Blends one symbol's percentiles into category subscores and an overall
/// score. Missing factors and categories are skipped, with the remaining
/// weights renormalized; nothing is ever filled with a default.
pub fn score_symbol(
    symbol: &str,
    date: NaiveDate,
    percentiles: &BTreeMap<String, Option<f64>>,
    catalog: &FactorCatalog,
    config: &ScoringConfig,
) -> CompositeScore {
    let mut subscores = BTreeMap::new();
    let mut contributing_factors = 0;

    for category in Category::ALL {
        let available: Vec<(f64, f64)> = catalog
            .in_category(category)
            .filter_map(|spec| {
                percentiles
                    .get(&spec.name)
                    .copied()
                    .flatten()
                    .filter(|p| p.is_finite())
                    .map(|p| (spec.weight, p))
            })
            .collect();
        contributing_factors += available.len();
        subscores.insert(category, weighted_mean(available.into_iter()));
    }

    let present: Vec<(Category, f64, f64)> = subscores
        .iter()
        .filter_map(|(category, score)| {
            score.map(|s| (*category, config.category_weight(*category), s))
        })
        .filter(|(_, weight, _)| *weight > 0.0)
        .collect();
    let total_weight: f64 = present.iter().map(|(_, weight, _)| weight).sum();
    let overall = weighted_mean(present.iter().map(|(_, weight, score)| (*weight, *score)));
    let category_weights_used = if total_weight > 0.0 {
        present
            .iter()
            .map(|(category, weight, _)| (*category, weight / total_weight))
            .collect()
    } else {
        BTreeMap::new()
    };

    CompositeScore {
        symbol: symbol.to_string(),
        date,
        subscores,
        overall,
        category_weights_used,
        contributing_factors,
    }
}

/// Scores for one date across the universe, with the percentiles they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossSectionScores {
    pub date: NaiveDate,
    pub scores: Vec<CompositeScore>,
    pub normalized: Vec<NormalizedFactor>,
}

/// Normalizes every catalog factor over the symbols present on `date`, then
/// scores each symbol. Values for other dates or unknown factors are ignored.
pub fn score_cross_section(
    date: NaiveDate,
    raw: &[RawFactorValue],
    catalog: &FactorCatalog,
    config: &ScoringConfig,
) -> CrossSectionScores {
    let on_date: Vec<&RawFactorValue> = raw.iter().filter(|value| value.date == date).collect();
    let universe: BTreeSet<&str> = on_date.iter().map(|value| value.symbol.as_str()).collect();

    let mut by_factor: BTreeMap<&str, BTreeMap<&str, Option<f64>>> = BTreeMap::new();
    for value in &on_date {
        by_factor
            .entry(value.factor.as_str())
            .or_default()
            .insert(value.symbol.as_str(), value.value);
    }

    let mut normalized = Vec::new();
    let mut per_symbol: BTreeMap<&str, BTreeMap<String, Option<f64>>> =
        universe.iter().map(|symbol| (*symbol, BTreeMap::new())).collect();

    for spec in catalog.factors() {
        let Some(values) = by_factor.get(spec.name.as_str()) else {
            continue;
        };
        let column: Vec<(String, Option<f64>)> = universe
            .iter()
            .map(|symbol| (symbol.to_string(), values.get(symbol).copied().flatten()))
            .collect();
        let ranked = normalize_cross_section(
            date,
            &spec.name,
            spec.direction,
            &column,
            config.min_cross_section,
        );
        for entry in &ranked {
            if let Some(map) = per_symbol.get_mut(entry.symbol.as_str()) {
                map.insert(spec.name.clone(), entry.percentile);
            }
        }
        normalized.extend(ranked);
    }

    let scores = per_symbol
        .iter()
        .map(|(symbol, percentiles)| score_symbol(symbol, date, percentiles, catalog, config))
        .collect();

    CrossSectionScores {
        date,
        scores,
        normalized,
    }
}

/// Scores every date independently and in parallel. Each date's cross-section
/// is complete before ranking starts.
pub fn score_dates(
    raw_by_date: &BTreeMap<NaiveDate, Vec<RawFactorValue>>,
    catalog: &FactorCatalog,
    config: &ScoringConfig,
) -> Vec<CrossSectionScores> {
    raw_by_date
        .par_iter()
        .map(|(date, values)| score_cross_section(*date, values, catalog, config))
        .collect()
}
