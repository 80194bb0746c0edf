use crate::database::Database;
use crate::models::{Bar, RawFactorValue, Timeframe};
use crate::providers::MemoryStore;
use anyhow::{anyhow, Context, Result};
use chrono::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_SETTING_PREFIXES: [&str; 3] = ["SIGNAL_", "CATEGORY_WEIGHT_", "PROVIDER_"];
const SNAPSHOT_ALLOWED_SETTINGS: [&str; 3] = ["MAX_WORKERS", "SYMBOL_TIMEOUT_SECS", "MIN_CROSS_SECTION"];

#[derive(Serialize, Deserialize)]
struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    symbols: Vec<String>,
    bars: Vec<Bar>,
    #[serde(default)]
    factors: Vec<RawFactorValue>,
    #[serde(default)]
    settings: HashMap<String, String>,
}

fn scrub_snapshot_settings(settings: &HashMap<String, String>) -> HashMap<String, String> {
    settings
        .iter()
        .filter(|(key, _)| {
            SNAPSHOT_ALLOWED_SETTINGS.contains(&key.as_str())
                || SNAPSHOT_SETTING_PREFIXES
                    .iter()
                    .any(|prefix| key.starts_with(prefix))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Bars, raw factors and engine settings captured for offline runs.
pub struct MarketData {
    bars: Arc<Vec<Bar>>,
    factors: Arc<Vec<RawFactorValue>>,
    symbols: Arc<Vec<String>>,
    settings: Arc<HashMap<String, String>>,
}

impl MarketData {
    pub async fn load(db: &Database) -> Result<Self> {
        info!("Loading bars from database...");
        let bars = db.get_all_bars().await?;
        info!("Loading raw factors from database...");
        let factors = db.get_all_raw_factors().await?;
        let settings = db.get_all_settings().await?;

        let symbols = Self::collect_symbols(&bars, &factors);
        info!(
            "Loaded {} bars and {} raw factor values for {} symbols",
            bars.len(),
            factors.len(),
            symbols.len()
        );

        Self::from_components(symbols, bars, factors, settings)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading market data snapshot from {}", path.display());
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot =
            bincode::deserialize_from(reader).context("Snapshot decode failed")?;

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }

        info!(
            "Snapshot generated at {} holds {} bars for {} symbols",
            snapshot.generated_at,
            snapshot.bars.len(),
            snapshot.symbols.len()
        );

        Self::from_components(
            snapshot.symbols,
            snapshot.bars,
            snapshot.factors,
            snapshot.settings,
        )
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            symbols: self.symbols.as_ref().clone(),
            bars: self.bars.as_ref().clone(),
            factors: self.factors.as_ref().clone(),
            settings: scrub_snapshot_settings(self.settings.as_ref()),
        };
        bincode::serialize_into(&mut writer, &snapshot)
            .context("Failed to serialize market data snapshot")?;
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    pub fn from_components(
        symbols: Vec<String>,
        bars: Vec<Bar>,
        factors: Vec<RawFactorValue>,
        settings: HashMap<String, String>,
    ) -> Result<Self> {
        if symbols.is_empty() || (bars.is_empty() && factors.is_empty()) {
            return Err(anyhow!(
                "Market data has no usable symbols, bars or factors"
            ));
        }

        Ok(Self {
            bars: Arc::new(bars),
            factors: Arc::new(factors),
            symbols: Arc::new(symbols),
            settings: Arc::new(settings),
        })
    }

    fn collect_symbols(bars: &[Bar], factors: &[RawFactorValue]) -> Vec<String> {
        let symbols: BTreeSet<&str> = bars
            .iter()
            .map(|bar| bar.symbol.as_str())
            .chain(factors.iter().map(|value| value.symbol.as_str()))
            .collect();
        symbols.into_iter().map(str::to_string).collect()
    }

    pub fn symbols(&self) -> &[String] {
        self.symbols.as_slice()
    }

    pub fn bars(&self) -> &[Bar] {
        self.bars.as_slice()
    }

    pub fn factors(&self) -> &[RawFactorValue] {
        self.factors.as_slice()
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        self.settings.as_ref()
    }

    pub fn bar_count(&self, timeframe: Timeframe) -> usize {
        self.bars
            .iter()
            .filter(|bar| bar.timeframe == timeframe)
            .count()
    }

    /// Copies the snapshot into a fresh in-memory provider and sink.
    pub fn to_memory_store(&self) -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_bars(self.bars.as_ref().clone());
        store.insert_factors(self.factors.as_ref().clone());
        store
    }

    /// Drops bars and factors dated after `end_date`. Earlier history is kept
    /// because indicators and state replay need it.
    pub fn restrict_through(self, end_date: NaiveDate) -> Result<Self> {
        let MarketData {
            bars,
            factors,
            settings,
            ..
        } = self;

        let bars: Vec<Bar> = bars
            .iter()
            .filter(|bar| bar.date <= end_date)
            .cloned()
            .collect();
        let factors: Vec<RawFactorValue> = factors
            .iter()
            .filter(|value| value.date <= end_date)
            .cloned()
            .collect();
        let symbols = Self::collect_symbols(&bars, &factors);
        Self::from_components(symbols, bars, factors, settings.as_ref().clone())
            .with_context(|| format!("No market data remains through {}", end_date))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{BarHistoryProvider, FactorProvider};

    fn sample() -> MarketData {
        let date = |d: u32| NaiveDate::from_ymd_opt(2024, 1, d).unwrap();
        let bar = |symbol: &str, d: u32| Bar {
            symbol: symbol.to_string(),
            timeframe: Timeframe::Daily,
            date: date(d),
            open: 10.0,
            high: 11.0,
            low: 9.5,
            close: 10.5,
            volume: 1000.0,
        };
        let bars = vec![bar("AAA", 2), bar("AAA", 3), bar("BBB", 2)];
        let factors = vec![RawFactorValue {
            symbol: "CCC".to_string(),
            date: date(3),
            factor: "pe_ratio".to_string(),
            value: Some(12.0),
        }];
        let mut settings = HashMap::new();
        settings.insert("SIGNAL_DAILY_MIN_BASE_BARS".to_string(), "20".to_string());
        settings.insert("MAX_WORKERS".to_string(), "4".to_string());
        settings.insert("BROKER_API_KEY".to_string(), "secret".to_string());
        let symbols = MarketData::collect_symbols(&bars, &factors);
        MarketData::from_components(symbols, bars, factors, settings).unwrap()
    }

    #[test]
    fn test_snapshot_round_trip_scrubs_unrelated_settings() {
        let data = sample();
        let path = std::env::temp_dir().join(format!(
            "market-data-{}.bin",
            uuid::Uuid::new_v4()
        ));
        data.save_to_file(&path).unwrap();
        let loaded = MarketData::load_from_file(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded.symbols(), &["AAA", "BBB", "CCC"]);
        assert_eq!(loaded.bars(), data.bars());
        assert_eq!(loaded.factors(), data.factors());
        assert_eq!(loaded.settings().get("MAX_WORKERS").map(String::as_str), Some("4"));
        assert!(loaded.settings().contains_key("SIGNAL_DAILY_MIN_BASE_BARS"));
        assert!(!loaded.settings().contains_key("BROKER_API_KEY"));
    }

    #[test]
    fn test_restrict_through_drops_later_rows() {
        let data = sample()
            .restrict_through(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())
            .unwrap();
        assert_eq!(data.symbols(), &["AAA", "BBB"]);
        assert_eq!(data.bar_count(Timeframe::Daily), 2);
        assert!(data.factors().is_empty());

        assert!(sample()
            .restrict_through(NaiveDate::from_ymd_opt(2023, 12, 29).unwrap())
            .is_err());
    }

    #[tokio::test]
    async fn test_memory_store_serves_snapshot_contents() {
        let store = sample().to_memory_store();
        let symbols = store.list_symbols(Timeframe::Daily).await.unwrap();
        assert_eq!(symbols, vec!["AAA".to_string(), "BBB".to_string()]);
        let bars = store
            .get_bars("AAA", Timeframe::Daily, None, None)
            .await
            .unwrap();
        assert_eq!(bars.len(), 2);
        let pe = store
            .get_raw_factor("CCC", NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(), "pe_ratio")
            .await
            .unwrap();
        assert_eq!(pe, Some(12.0));
    }
}
