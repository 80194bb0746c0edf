use crate::models::NormalizedFactor;
use anyhow::anyhow;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    HigherIsBetter,
    LowerIsBetter,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::HigherIsBetter => "higher_is_better",
            Direction::LowerIsBetter => "lower_is_better",
        }
    }

    fn orient(&self, value: f64) -> f64 {
        match self {
            Direction::HigherIsBetter => value,
            Direction::LowerIsBetter => -value,
        }
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "higher_is_better" | "higher" => Ok(Direction::HigherIsBetter),
            "lower_is_better" | "lower" => Ok(Direction::LowerIsBetter),
            other => Err(anyhow!("Unknown factor direction '{}'", other)),
        }
    }
}

/// 1-based ranks of `values` (ascending), ties sharing the average of the
/// ranks they span.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && values[order[end + 1]] == values[order[start]] {
            end += 1;
        }
        // positions start..=end hold equal values; ranks are position + 1
        let shared = (start + end) as f64 / 2.0 + 1.0;
        for &idx in &order[start..=end] {
            ranks[idx] = shared;
        }
        start = end + 1;
    }
    ranks
}

/// Ranks one factor across the universe on one date into percentiles in
/// [0, 100], where 100 is best for the factor's direction.
///
/// Null and non-finite inputs stay null. When fewer than `min_count` symbols
/// (never fewer than 2) have a value, the whole cross-section is null. Output
/// is sorted by symbol; a symbol listed twice keeps its last value.
pub fn normalize_cross_section(
    date: NaiveDate,
    factor: &str,
    direction: Direction,
    values: &[(String, Option<f64>)],
    min_count: usize,
) -> Vec<NormalizedFactor> {
    let by_symbol: BTreeMap<&str, Option<f64>> = values
        .iter()
        .map(|(symbol, value)| (symbol.as_str(), value.filter(|v| v.is_finite())))
        .collect();

    let ranked: Vec<(&str, f64)> = by_symbol
        .iter()
        .filter_map(|(symbol, value)| value.map(|v| (*symbol, direction.orient(v))))
        .collect();

    let mut percentiles: BTreeMap<&str, f64> = BTreeMap::new();
    let count = ranked.len();
    if count >= min_count.max(2) {
        let oriented: Vec<f64> = ranked.iter().map(|(_, v)| *v).collect();
        let ranks = average_ranks(&oriented);
        for ((symbol, _), rank) in ranked.iter().zip(ranks) {
            percentiles.insert(*symbol, (rank - 1.0) / (count - 1) as f64 * 100.0);
        }
    }

    by_symbol
        .keys()
        .map(|symbol| NormalizedFactor {
            symbol: symbol.to_string(),
            date,
            factor: factor.to_string(),
            percentile: percentiles.get(symbol).copied(),
        })
        .collect()
}
