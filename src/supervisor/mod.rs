// =============================================================================
// Supervisor — component H
// =============================================================================
//
// Owns every AutoTrader the process is running, keyed by trader_id, and the
// process-wide CancellationToken each trader's own token descends from.
// Grounded on the teacher's `AppState` (a single long-lived registry
// constructed once at startup and handed to every request handler) and the
// reference engine's per-user bootstrap (resolve AI model + exchange rows,
// build one concrete adapter, spin up the scan loop).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::autotrader::{AutoTrader, TraderStatus};
use crate::candidate_pool::{CandidatePool, CandidatePoolConfig};
use crate::config::{AutoTraderConfig, ConfigError, ConfigProvider, ExchangeRow, RuntimeConfig};
use crate::decision_log::DecisionLog;
use crate::engine::{DecisionEngine, TemplateLibrary};
use crate::llm::http::HttpLlmClient;
use crate::llm::LLMClient;
use crate::market_data::{BinanceMarketDataFetcher, MarketDataFetcher};
use crate::venue::demo::DemoVenue;
use crate::venue::Venue;

const STOP_ALL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unknown venue adapter {0:?}")]
    UnknownAdapter(String),

    #[error("trader {0} not found")]
    UnknownTrader(String),

    #[error("failed to open decision log: {0}")]
    Log(#[from] std::io::Error),
}

/// Builds the concrete `Venue` for a trader from its resolved `ExchangeRow`.
/// Only `"demo"` is wired in this core; a real exchange
/// SDK is an integration concern the trait boundary is designed to absorb.
fn build_venue(row: &ExchangeRow, initial_balance: f64) -> Result<Arc<dyn Venue>, SupervisorError> {
    match row.adapter.as_str() {
        "demo" => Ok(Arc::new(DemoVenue::new(initial_balance))),
        other => Err(SupervisorError::UnknownAdapter(other.to_string())),
    }
}

pub struct Supervisor {
    runtime: RuntimeConfig,
    config_provider: Arc<dyn ConfigProvider>,
    http_client: reqwest::Client,
    templates: TemplateLibrary,
    root_token: CancellationToken,
    traders: Mutex<HashMap<String, Arc<AutoTrader>>>,
}

impl Supervisor {
    pub fn new(
        runtime: RuntimeConfig,
        config_provider: Arc<dyn ConfigProvider>,
        http_client: reqwest::Client,
        templates: TemplateLibrary,
    ) -> Self {
        Self {
            runtime,
            config_provider,
            http_client,
            templates,
            root_token: CancellationToken::new(),
            traders: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves every enabled trader row for `user_id` and constructs an
    /// `AutoTrader` for each not already loaded. Idempotent: traders already
    /// present in the registry are left untouched and skipped silently, so
    /// this is safe to call more than once for the same user.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn load_for_user(&self, user_id: &str) -> Result<Vec<String>, SupervisorError> {
        let rows = self.config_provider.traders_for_user(user_id).await?;
        let mut loaded = Vec::new();

        for row in rows {
            if self.traders.lock().contains_key(&row.trader_id) {
                continue;
            }

            let ai_model = self
                .config_provider
                .ai_model(&row.ai_model_id)
                .await?
                .ok_or_else(|| ConfigError::UnknownAiModel {
                    trader_id: row.trader_id.clone(),
                    ai_model_id: row.ai_model_id.clone(),
                })?;

            let exchange = self
                .config_provider
                .exchange(&row.exchange_id)
                .await?
                .ok_or_else(|| ConfigError::UnknownExchange {
                    trader_id: row.trader_id.clone(),
                    exchange_id: row.exchange_id.clone(),
                })?;

            let trader_config = AutoTraderConfig::from_row(&row, &self.runtime)?;
            let venue = build_venue(&exchange, trader_config.initial_balance)?;

            let llm: Arc<dyn LLMClient> = Arc::new(HttpLlmClient::new(
                self.http_client.clone(),
                ai_model.base_url,
                ai_model.api_key,
                ai_model.model_name,
            ));
            let engine = Arc::new(DecisionEngine::new(llm, self.templates.clone()));

            let log_dir = self.runtime.log_root.join(&row.trader_id);
            let log = Arc::new(DecisionLog::open(log_dir).await?);

            let candidate_pool = Arc::new(CandidatePool::new(
                CandidatePoolConfig {
                    cache_dir: self.runtime.candidate_cache_dir.join(&row.trader_id),
                    ..CandidatePoolConfig::default()
                },
                self.http_client.clone(),
            ));

            let market_fetcher: Arc<dyn MarketDataFetcher> =
                Arc::new(BinanceMarketDataFetcher::new(self.http_client.clone()));

            let trader = Arc::new(AutoTrader::new(
                trader_config,
                venue,
                engine,
                log,
                candidate_pool,
                market_fetcher,
                &self.root_token,
            ));

            self.traders.lock().insert(row.trader_id.clone(), trader.clone());
            loaded.push(row.trader_id.clone());

            let spawned = trader;
            tokio::spawn(async move {
                spawned.run().await;
            });

            info!(trader_id = %row.trader_id, "trader loaded and started");
        }

        Ok(loaded)
    }

    pub fn get(&self, trader_id: &str) -> Option<Arc<AutoTrader>> {
        self.traders.lock().get(trader_id).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.traders.lock().keys().cloned().collect()
    }

    pub fn status(&self, trader_id: &str) -> Result<TraderStatus, SupervisorError> {
        self.get(trader_id)
            .map(|t| t.get_status())
            .ok_or_else(|| SupervisorError::UnknownTrader(trader_id.to_string()))
    }

    pub fn status_all(&self) -> Vec<TraderStatus> {
        self.traders.lock().values().map(|t| t.get_status()).collect()
    }

    /// Cancels every trader's token, then waits up to `STOP_ALL_GRACE` for
    /// each to report `Stopped` before returning. The cancel happens
    /// up front for every trader, so no trader can run past this window.
    #[instrument(skip(self))]
    pub async fn stop_all(&self) {
        let traders: Vec<Arc<AutoTrader>> = self.traders.lock().values().cloned().collect();
        for trader in &traders {
            trader.stop();
        }

        let deadline = tokio::time::Instant::now() + STOP_ALL_GRACE;
        for trader in &traders {
            loop {
                if trader.state() == crate::autotrader::TraderState::Stopped {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(trader_id = %trader.trader_id(), "did not stop within grace period");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    pub fn root_token(&self) -> CancellationToken {
        self.root_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AiModelRow, ConfigRows, JsonFileConfigProvider, TraderRow};

    fn sample_rows() -> ConfigRows {
        ConfigRows {
            traders: vec![TraderRow {
                trader_id: "t1".into(),
                user_id: "u1".into(),
                ai_model_id: "m1".into(),
                exchange_id: "e1".into(),
                initial_balance: 1000.0,
                btc_eth_leverage: 10,
                altcoin_leverage: 5,
                scan_interval_minutes: 15,
                trading_symbols: None,
                system_prompt_template: "default".into(),
                custom_prompt: None,
                override_base_prompt: false,
                is_cross_margin: false,
                use_coin_pool: true,
                use_oi_top: false,
                enabled: true,
            }],
            ai_models: vec![AiModelRow {
                ai_model_id: "m1".into(),
                base_url: "https://api.example.com/v1".into(),
                api_key: "key".into(),
                model_name: "model".into(),
                enabled: true,
            }],
            exchanges: vec![ExchangeRow {
                exchange_id: "e1".into(),
                adapter: "demo".into(),
                enabled: true,
            }],
        }
    }

    fn test_runtime(tmp: &std::path::Path) -> RuntimeConfig {
        RuntimeConfig {
            http_proxy: None,
            log_root: tmp.join("logs"),
            candidate_cache_dir: tmp.join("cache"),
            prompt_template_dir: tmp.join("templates"),
            stop_trading_hours: 4.0,
            max_daily_loss_pct: 5.0,
            analysis_window: 100,
        }
    }

    #[tokio::test]
    async fn load_for_user_is_idempotent() {
        let tmp = std::env::temp_dir().join(format!("supervisor-test-{}", uuid::Uuid::new_v4()));
        let provider: Arc<dyn ConfigProvider> = Arc::new(JsonFileConfigProvider::from_rows(sample_rows()));
        let supervisor = Supervisor::new(
            test_runtime(&tmp),
            provider,
            reqwest::Client::new(),
            TemplateLibrary::from_map(HashMap::new()),
        );

        let first = supervisor.load_for_user("u1").await.unwrap();
        assert_eq!(first, vec!["t1".to_string()]);

        let second = supervisor.load_for_user("u1").await.unwrap();
        assert!(second.is_empty());
        assert_eq!(supervisor.list().len(), 1);

        supervisor.stop_all().await;
        let _ = tokio::fs::remove_dir_all(&tmp).await;
    }

    #[tokio::test]
    async fn unknown_exchange_adapter_is_rejected() {
        let tmp = std::env::temp_dir().join(format!("supervisor-test-{}", uuid::Uuid::new_v4()));
        let mut rows = sample_rows();
        rows.exchanges[0].adapter = "some_future_exchange".into();
        let provider: Arc<dyn ConfigProvider> = Arc::new(JsonFileConfigProvider::from_rows(rows));
        let supervisor = Supervisor::new(
            test_runtime(&tmp),
            provider,
            reqwest::Client::new(),
            TemplateLibrary::from_map(HashMap::new()),
        );

        let err = supervisor.load_for_user("u1").await.unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownAdapter(_)));

        let _ = tokio::fs::remove_dir_all(&tmp).await;
    }

    #[tokio::test]
    async fn stop_all_settles_every_trader_within_grace_period() {
        let tmp = std::env::temp_dir().join(format!("supervisor-test-{}", uuid::Uuid::new_v4()));
        let mut rows = sample_rows();
        for i in 2..=5 {
            let mut row = rows.traders[0].clone();
            row.trader_id = format!("t{i}");
            rows.traders.push(row);
        }
        let provider: Arc<dyn ConfigProvider> = Arc::new(JsonFileConfigProvider::from_rows(rows));
        let supervisor = Supervisor::new(
            test_runtime(&tmp),
            provider,
            reqwest::Client::new(),
            TemplateLibrary::from_map(HashMap::new()),
        );

        supervisor.load_for_user("u1").await.unwrap();
        assert_eq!(supervisor.list().len(), 5);

        supervisor.stop_all().await;
        for status in supervisor.status_all() {
            assert_eq!(status.state, crate::autotrader::TraderState::Stopped);
        }

        let _ = tokio::fs::remove_dir_all(&tmp).await;
    }
}
