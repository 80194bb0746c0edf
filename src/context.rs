use crate::config::EngineSettings;
use crate::data_context::MarketData;
use crate::database::Database;
use crate::pipeline::Pipeline;
use crate::providers::{MemoryStore, StoredOutputs};
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use log::{info, warn};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    database_url: Option<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MarketDataFilters {
    pub end_date: Option<NaiveDate>,
}

impl AppContext {
    pub async fn initialize(database_url: Option<String>) -> Result<Self> {
        Ok(Self { database_url })
    }

    pub async fn database(&self) -> Result<Database> {
        let Some(database_url) = self.database_url.as_deref() else {
            return Err(anyhow!(
                "DATABASE_URL must be set to use database-backed engine commands."
            ));
        };
        Database::new(database_url).await
    }

    pub async fn engine_context(&self) -> Result<EngineContext> {
        let database_url = self.database_url.as_deref().ok_or_else(|| {
            anyhow!("DATABASE_URL must be set to run against the database.")
        })?;
        EngineContext::initialize(database_url).await
    }

    pub async fn engine_context_from_file<P: AsRef<Path>>(
        &self,
        data_file: P,
        filters: Option<MarketDataFilters>,
    ) -> Result<EngineContext> {
        EngineContext::initialize_with_market_data_file(
            self.database_url.as_deref(),
            data_file,
            filters,
        )
        .await
    }
}

enum Backend {
    Database(Arc<Database>),
    Snapshot(Arc<MemoryStore>),
}

/// Providers, sink and settings for one command invocation. Backed either by
/// PostgreSQL or by an in-memory copy of a market data snapshot.
pub struct EngineContext {
    backend: Backend,
    log_db: Option<Arc<Database>>,
    settings: EngineSettings,
}

impl EngineContext {
    pub async fn initialize<S: AsRef<str>>(database_url: S) -> Result<Self> {
        let db = Arc::new(Database::new(database_url).await?);
        db.apply_schema().await?;
        let settings = EngineSettings::from_settings_map(&db.get_all_settings().await?)?;
        info!("Engine settings loaded from database");

        Ok(Self {
            backend: Backend::Database(Arc::clone(&db)),
            log_db: Some(db),
            settings,
        })
    }

    pub async fn initialize_with_market_data_file<P: AsRef<Path>>(
        database_url: Option<&str>,
        data_file: P,
        filters: Option<MarketDataFilters>,
    ) -> Result<Self> {
        let log_db = match database_url {
            Some(url) if !url.trim().is_empty() => match Database::new(url).await {
                Ok(db) => Some(Arc::new(db)),
                Err(error) => {
                    warn!(
                        "Database connection unavailable ({}). Run logs will only go to stderr.",
                        error
                    );
                    None
                }
            },
            _ => {
                info!("Database URL not provided. Using local market data snapshot only.");
                None
            }
        };

        let mut market_data = MarketData::load_from_file(data_file)?;
        market_data = Self::apply_market_data_filters(market_data, filters.unwrap_or_default())?;
        let settings = EngineSettings::from_settings_map(market_data.settings())?;
        let store = Arc::new(market_data.to_memory_store());

        Ok(Self {
            backend: Backend::Snapshot(store),
            log_db,
            settings,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut EngineSettings {
        &mut self.settings
    }

    pub fn pipeline(&self) -> Pipeline {
        let settings = self.settings.clone();
        match &self.backend {
            Backend::Database(db) => {
                Pipeline::new(db.clone(), db.clone(), db.clone(), settings)
            }
            Backend::Snapshot(store) => {
                Pipeline::new(store.clone(), store.clone(), store.clone(), settings)
            }
        }
    }

    /// Results written during this invocation. Only snapshot runs keep them
    /// in memory; database runs return `None`.
    pub fn stored_outputs(&self) -> Option<StoredOutputs> {
        match &self.backend {
            Backend::Snapshot(store) => Some(store.outputs()),
            Backend::Database(_) => None,
        }
    }

    pub async fn log_event(&self, source: &str, level: &str, message: String, metadata: Value) {
        if let Some(db) = &self.log_db {
            db.persist_system_event(source, level, message, metadata).await;
        }
    }

    fn apply_market_data_filters(
        market_data: MarketData,
        filters: MarketDataFilters,
    ) -> Result<MarketData> {
        let Some(end_date) = filters.end_date else {
            return Ok(market_data);
        };

        let before = market_data.bars().len();
        let filtered = market_data.restrict_through(end_date)?;
        info!(
            "Restricted market data snapshot through {} ({} bars -> {})",
            end_date.format("%Y-%m-%d"),
            before,
            filtered.bars().len()
        );
        Ok(filtered)
    }
}
