use crate::database_selector::PersistentSelector;
use crate::memory_selector::InMemorySelector;
use crate::selection::Selector;
use anyhow::Context;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use token_core::error::SelectionError;
use token_core::holder::IndexingType;
use token_core::locks::TokenStore;

pub const DEFAULT_MAX_RETRIES: u32 = 8;
pub const DEFAULT_RETRY_SLEEP_MS: u64 = 100;
pub const DEFAULT_RETRY_CAP_MS: u64 = 2000;
pub const DEFAULT_PAGE_SIZE: u32 = 200;
pub const DEFAULT_CACHE_SIZE: usize = 1024;
pub const DEFAULT_AUTO_UNLOCK_DELAY_MS: u64 = 5 * 60 * 1000;

/// Top level selection configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionConfig {
    #[serde(default)]
    pub state_selection: Option<StateSelectionConfig>,
}

/// The configured selection methods. Database selection wins if both are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSelectionConfig {
    #[serde(default)]
    pub database: Option<DatabaseSelectionConfig>,

    #[serde(default, alias = "in_memory")]
    pub in_memory: Option<InMemorySelectionConfig>,
}

/// Settings of the persistent selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSelectionConfig {
    /// Number of query attempts before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base of the exponential backoff, in milliseconds
    #[serde(rename = "retrySleep", default = "default_retry_sleep_ms")]
    pub retry_sleep_ms: u64,

    /// Backoff cap in milliseconds; a single sleep never exceeds it
    #[serde(rename = "retryCap", default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,

    /// Records fetched per store query
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for DatabaseSelectionConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_sleep_ms: DEFAULT_RETRY_SLEEP_MS,
            retry_cap_ms: DEFAULT_RETRY_CAP_MS,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl DatabaseSelectionConfig {
    pub fn validate(&self) -> Result<(), SelectionError> {
        if self.max_retries == 0 {
            return Err(SelectionError::Config("maxRetries must be at least 1".to_string()));
        }
        if self.page_size == 0 {
            return Err(SelectionError::Config("pageSize must be at least 1".to_string()));
        }
        if self.retry_cap_ms < self.retry_sleep_ms {
            return Err(SelectionError::Config(format!(
                "retryCap ({}) must not be below retrySleep ({})",
                self.retry_cap_ms, self.retry_sleep_ms
            )));
        }
        Ok(())
    }

    /// Sleep before the attempt following `attempt` (1 based):
    /// `min(retrySleep << attempt, retryCap / 2) * (1 + jitter)`, jitter in `[0, 1]`
    pub fn backoff_delay(&self, attempt: u32, jitter: f64) -> Duration {
        let exponential = if attempt >= u64::BITS {
            u64::MAX
        } else {
            self.retry_sleep_ms.saturating_mul(1u64 << attempt)
        };
        let capped = exponential.min(self.retry_cap_ms / 2);
        let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        Duration::from_millis((capped as f64 * (1.0 + jitter)) as u64)
    }
}

/// Settings of the in-memory selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InMemorySelectionConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Index views built at startup; others are built on first use
    #[serde(default = "default_indexing_strategies")]
    pub indexing_strategies: Vec<IndexingType>,

    /// Expected number of cached records
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    #[serde(default = "default_auto_unlock_delay_ms")]
    pub auto_unlock_delay_ms: u64,
}

impl Default for InMemorySelectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            indexing_strategies: default_indexing_strategies(),
            cache_size: DEFAULT_CACHE_SIZE,
            auto_unlock_delay_ms: DEFAULT_AUTO_UNLOCK_DELAY_MS,
        }
    }
}

impl InMemorySelectionConfig {
    pub fn auto_unlock_delay(&self) -> Duration {
        Duration::from_millis(self.auto_unlock_delay_ms)
    }
}

/// The selection method to use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreferredSelection {
    InMemory(InMemorySelectionConfig),
    Database(DatabaseSelectionConfig),
}

/// Selection services constructed at startup. A selector can only be built
/// for a method whose service exists.
#[derive(Debug, Clone, Default)]
pub struct SelectionServices {
    pub store: Option<Arc<dyn TokenStore>>,
    pub in_memory: Option<Arc<InMemorySelector>>,
}

impl PreferredSelection {
    pub fn to_selector(
        &self,
        services: &SelectionServices,
    ) -> Result<Arc<dyn Selector>, SelectionError> {
        match self {
            PreferredSelection::Database(config) => {
                let store = services.store.clone().ok_or_else(|| {
                    SelectionError::Config(
                        "database selection is configured but no token store was provided"
                            .to_string(),
                    )
                })?;
                Ok(Arc::new(PersistentSelector::new(store, config.clone())?))
            }
            PreferredSelection::InMemory(_) => {
                let selector: Arc<dyn Selector> = services.in_memory.clone().ok_or_else(|| {
                    SelectionError::Config(
                        "in-memory selection is configured but the in-memory selector was not started"
                            .to_string(),
                    )
                })?;
                Ok(selector)
            }
        }
    }
}

impl SelectionConfig {
    pub fn from_json_str(json: &str) -> Result<Self, SelectionError> {
        serde_json::from_str(json)
            .map_err(|e| SelectionError::Config(format!("invalid selection config: {}", e)))
    }

    /// Read the configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read selection config {}", path.display()))?;
        let config = Self::from_json_str(&contents)
            .with_context(|| format!("failed to parse selection config {}", path.display()))?;
        config
            .preferred()
            .with_context(|| format!("invalid selection config {}", path.display()))?;
        Ok(config)
    }

    /// Decide which selection method is configured
    pub fn preferred(&self) -> Result<PreferredSelection, SelectionError> {
        let Some(state_selection) = &self.state_selection else {
            warn!("No token selection method configured, using database selection with defaults");
            return Ok(PreferredSelection::Database(DatabaseSelectionConfig::default()));
        };

        if let Some(database) = &state_selection.database {
            database.validate()?;
            return Ok(PreferredSelection::Database(database.clone()));
        }

        match &state_selection.in_memory {
            Some(in_memory) if in_memory.enabled => {
                Ok(PreferredSelection::InMemory(in_memory.clone()))
            }
            _ => Err(SelectionError::Config(
                "stateSelection names no enabled selection method".to_string(),
            )),
        }
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_sleep_ms() -> u64 {
    DEFAULT_RETRY_SLEEP_MS
}

fn default_retry_cap_ms() -> u64 {
    DEFAULT_RETRY_CAP_MS
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_enabled() -> bool {
    true
}

fn default_indexing_strategies() -> Vec<IndexingType> {
    vec![IndexingType::ByOwnerKey]
}

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

fn default_auto_unlock_delay_ms() -> u64 {
    DEFAULT_AUTO_UNLOCK_DELAY_MS
}
