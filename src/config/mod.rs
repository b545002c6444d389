// =============================================================================
// Configuration — process-wide runtime settings + the external config DB
// =============================================================================
//
// Two distinct concerns, matching the teacher's `RuntimeConfig` shape (every
// field `#[serde(default = "...")]`, atomic tmp+rename save) generalized to
// this orchestrator:
//
// 1. `RuntimeConfig`: process-wide paths and the optional HTTP proxy.
//    Loaded once at startup, saved back on shutdown.
// 2. The configuration database: modeled here as a `ConfigProvider` trait
//    over plain row structs, with one concrete `JsonFileConfigProvider`
//    reading a JSON document — enough to drive `Supervisor::load_for_user`
//    without inventing the SQL schema a real deployment would own.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

fn default_log_root() -> PathBuf {
    PathBuf::from("./data/decision_logs")
}

fn default_candidate_cache_dir() -> PathBuf {
    PathBuf::from("./data/candidate_cache")
}

fn default_prompt_template_dir() -> PathBuf {
    PathBuf::from("./data/prompt_templates")
}

fn default_stop_trading_hours() -> f64 {
    4.0
}

fn default_max_daily_loss_pct() -> f64 {
    5.0
}

fn default_analysis_window() -> usize {
    100
}

/// Process-wide runtime settings. Every field carries a serde default so an
/// older on-disk document still loads after new fields are added.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub http_proxy: Option<String>,

    #[serde(default = "default_log_root")]
    pub log_root: PathBuf,

    #[serde(default = "default_candidate_cache_dir")]
    pub candidate_cache_dir: PathBuf,

    #[serde(default = "default_prompt_template_dir")]
    pub prompt_template_dir: PathBuf,

    /// Risk-control cooldown duration applied when a trader trips its daily
    /// loss limit.
    #[serde(default = "default_stop_trading_hours")]
    pub stop_trading_hours: f64,

    /// System-wide default daily-loss trip threshold, as a percent of
    /// initial balance; threaded into each `AutoTraderConfig` at load time
    /// rather than re-read per cycle.
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,

    #[serde(default = "default_analysis_window")]
    pub analysis_window: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            http_proxy: None,
            log_root: default_log_root(),
            candidate_cache_dir: default_candidate_cache_dir(),
            prompt_template_dir: default_prompt_template_dir(),
            stop_trading_hours: default_stop_trading_hours(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            analysis_window: default_analysis_window(),
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        Ok(config)
    }

    /// Atomic write: write to a `.tmp` sibling, then rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("failed to serialize runtime config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        Ok(())
    }
}

// -----------------------------------------------------------------------
// Configuration database row shapes
// -----------------------------------------------------------------------

/// One row of the external trader table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderRow {
    pub trader_id: String,
    pub user_id: String,
    pub ai_model_id: String,
    pub exchange_id: String,
    pub initial_balance: f64,
    #[serde(default = "default_btc_eth_leverage")]
    pub btc_eth_leverage: u32,
    #[serde(default = "default_altcoin_leverage")]
    pub altcoin_leverage: u32,
    #[serde(default = "default_scan_interval_minutes")]
    pub scan_interval_minutes: i64,
    #[serde(default)]
    pub trading_symbols: Option<String>,
    #[serde(default = "default_template_name")]
    pub system_prompt_template: String,
    #[serde(default)]
    pub custom_prompt: Option<String>,
    #[serde(default)]
    pub override_base_prompt: bool,
    #[serde(default)]
    pub is_cross_margin: bool,
    #[serde(default = "default_true")]
    pub use_coin_pool: bool,
    #[serde(default)]
    pub use_oi_top: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_btc_eth_leverage() -> u32 {
    10
}

fn default_altcoin_leverage() -> u32 {
    5
}

fn default_scan_interval_minutes() -> i64 {
    15
}

fn default_template_name() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiModelRow {
    pub ai_model_id: String,
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRow {
    pub exchange_id: String,
    /// Selects the concrete `Venue` adapter factory. Only `"demo"` is
    /// shipped in this core; wiring a real exchange behind the same factory
    /// is an integration concern outside it.
    pub adapter: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigRows {
    #[serde(default)]
    pub traders: Vec<TraderRow>,
    #[serde(default)]
    pub ai_models: Vec<AiModelRow>,
    #[serde(default)]
    pub exchanges: Vec<ExchangeRow>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("trader {trader_id} references unknown or disabled ai_model {ai_model_id}")]
    UnknownAiModel { trader_id: String, ai_model_id: String },

    #[error("trader {trader_id} references unknown or disabled exchange {exchange_id}")]
    UnknownExchange { trader_id: String, exchange_id: String },

    #[error("trader {trader_id} has non-positive initial_balance {initial_balance}")]
    NonPositiveBalance { trader_id: String, initial_balance: f64 },

    #[error("failed to load config rows: {0}")]
    Source(String),
}

#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn traders_for_user(&self, user_id: &str) -> Result<Vec<TraderRow>, ConfigError>;
    async fn ai_model(&self, ai_model_id: &str) -> Result<Option<AiModelRow>, ConfigError>;
    async fn exchange(&self, exchange_id: &str) -> Result<Option<ExchangeRow>, ConfigError>;
}

/// Reads the entire row set from a single JSON document on disk. Sufficient
/// to drive `Supervisor::load_for_user` and the test suite without a SQL
/// layer.
pub struct JsonFileConfigProvider {
    rows: ConfigRows,
}

impl JsonFileConfigProvider {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let bytes = tokio::fs::read(path.as_ref())
            .await
            .map_err(|e| ConfigError::Source(e.to_string()))?;
        let rows: ConfigRows = serde_json::from_slice(&bytes).map_err(|e| ConfigError::Source(e.to_string()))?;
        Ok(Self { rows })
    }

    pub fn from_rows(rows: ConfigRows) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl ConfigProvider for JsonFileConfigProvider {
    async fn traders_for_user(&self, user_id: &str) -> Result<Vec<TraderRow>, ConfigError> {
        Ok(self
            .rows
            .traders
            .iter()
            .filter(|t| t.user_id == user_id && t.enabled)
            .cloned()
            .collect())
    }

    async fn ai_model(&self, ai_model_id: &str) -> Result<Option<AiModelRow>, ConfigError> {
        Ok(self
            .rows
            .ai_models
            .iter()
            .find(|m| m.ai_model_id == ai_model_id && m.enabled)
            .cloned())
    }

    async fn exchange(&self, exchange_id: &str) -> Result<Option<ExchangeRow>, ConfigError> {
        Ok(self
            .rows
            .exchanges
            .iter()
            .find(|e| e.exchange_id == exchange_id && e.enabled)
            .cloned())
    }
}

/// The fully-resolved configuration for one `AutoTrader`, assembled by the
/// Supervisor from a `TraderRow` plus system-wide defaults.
#[derive(Debug, Clone)]
pub struct AutoTraderConfig {
    pub trader_id: String,
    pub initial_balance: f64,
    pub btc_eth_leverage: u32,
    pub altcoin_leverage: u32,
    pub scan_interval_minutes: i64,
    pub trading_symbols: Option<Vec<String>>,
    pub system_prompt_template: String,
    pub custom_prompt: Option<String>,
    pub override_base_prompt: bool,
    pub is_cross_margin: bool,
    pub use_coin_pool: bool,
    pub use_oi_top: bool,
    pub stop_trading_hours: f64,
    pub max_daily_loss_pct: f64,
    pub analysis_window: usize,
}

impl AutoTraderConfig {
    pub fn from_row(row: &TraderRow, runtime: &RuntimeConfig) -> Result<Self, ConfigError> {
        if row.initial_balance <= 0.0 {
            return Err(ConfigError::NonPositiveBalance {
                trader_id: row.trader_id.clone(),
                initial_balance: row.initial_balance,
            });
        }
        let trading_symbols = row.trading_symbols.as_ref().map(|csv| {
            csv.split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect()
        });
        Ok(Self {
            trader_id: row.trader_id.clone(),
            initial_balance: row.initial_balance,
            btc_eth_leverage: row.btc_eth_leverage,
            altcoin_leverage: row.altcoin_leverage,
            scan_interval_minutes: row.scan_interval_minutes.max(1),
            trading_symbols,
            system_prompt_template: row.system_prompt_template.clone(),
            custom_prompt: row.custom_prompt.clone(),
            override_base_prompt: row.override_base_prompt,
            is_cross_margin: row.is_cross_margin,
            use_coin_pool: row.use_coin_pool,
            use_oi_top: row.use_oi_top,
            stop_trading_hours: runtime.stop_trading_hours,
            max_daily_loss_pct: runtime.max_daily_loss_pct,
            analysis_window: runtime.analysis_window,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> TraderRow {
        TraderRow {
            trader_id: "t1".into(),
            user_id: "u1".into(),
            ai_model_id: "m1".into(),
            exchange_id: "e1".into(),
            initial_balance: 1000.0,
            btc_eth_leverage: 10,
            altcoin_leverage: 5,
            scan_interval_minutes: 15,
            trading_symbols: Some("btc, eth,".into()),
            system_prompt_template: "default".into(),
            custom_prompt: None,
            override_base_prompt: false,
            is_cross_margin: false,
            use_coin_pool: true,
            use_oi_top: false,
            enabled: true,
        }
    }

    #[test]
    fn non_positive_balance_is_rejected() {
        let mut row = sample_row();
        row.initial_balance = 0.0;
        let err = AutoTraderConfig::from_row(&row, &RuntimeConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::NonPositiveBalance { .. }));
    }

    #[test]
    fn trading_symbols_csv_is_trimmed_and_uppercased() {
        let row = sample_row();
        let cfg = AutoTraderConfig::from_row(&row, &RuntimeConfig::default()).unwrap();
        assert_eq!(cfg.trading_symbols, Some(vec!["BTC".to_string(), "ETH".to_string()]));
    }

    #[tokio::test]
    async fn json_provider_filters_by_user_and_enabled_flag() {
        let mut rows = ConfigRows::default();
        rows.traders.push(sample_row());
        let mut disabled = sample_row();
        disabled.trader_id = "t2".into();
        disabled.enabled = false;
        rows.traders.push(disabled);
        let mut other_user = sample_row();
        other_user.trader_id = "t3".into();
        other_user.user_id = "u2".into();
        rows.traders.push(other_user);

        let provider = JsonFileConfigProvider::from_rows(rows);
        let traders = provider.traders_for_user("u1").await.unwrap();
        assert_eq!(traders.len(), 1);
        assert_eq!(traders[0].trader_id, "t1");
    }

    #[tokio::test]
    async fn ai_model_lookup_skips_disabled_rows() {
        let mut rows = ConfigRows::default();
        rows.ai_models.push(AiModelRow {
            ai_model_id: "m1".into(),
            base_url: "https://api.example.com/v1".into(),
            api_key: "key".into(),
            model_name: "model".into(),
            enabled: false,
        });
        let provider = JsonFileConfigProvider::from_rows(rows);
        assert!(provider.ai_model("m1").await.unwrap().is_none());
    }
}
