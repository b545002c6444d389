// =============================================================================
// AutoTrader — component G, the per-trader decision-and-execution loop
// =============================================================================
//
// Owns one Venue, LLMClient (via DecisionEngine), DecisionLog, and the
// cross-cycle state called out in §9 ("keep as fields on the instance, never
// globals"): the `first_seen_ms` holding-time map, the cooldown deadline, and
// the daily PnL accumulator. Grounded on the reference engine's scan loop
// (cooldown check -> context build -> LLM decide -> ordered execution ->
// journal append), generalized behind the object-safe `Venue`/`LLMClient`
// traits and an explicit `CancellationToken` per §5/§9 (no implicit
// cooperative suspension, no uncancellable sleep).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::candidate_pool::CandidatePool;
use crate::config::AutoTraderConfig;
use crate::decision_log::{
    AccountStateSnapshot, ActionRecord, DecisionLog, DecisionRecordDraft, PositionSnapshot,
};
use crate::engine::context::{assemble_context, fetch_candidates, PositionWithHolding};
use crate::engine::{Decision, DecisionEngine, PromptOverride};
use crate::error::CoreError;
use crate::market_data::MarketDataFetcher;
use crate::types::{ActionKind, Side};
use crate::venue::Venue;

/// Marker token embedded in a cooldown skip's error message so tests (and,
/// eventually, the REST façade) can detect a risk-control pause purely from
/// `error_message` without parsing prose (§8 scenario 7). Chinese is kept
/// because it mirrors the operator-facing token used in the reference
/// engine's risk-control messaging; either is spec-acceptable (§8 note).
pub const COOLDOWN_TOKEN: &str = "暂停";

const INTER_DECISION_DELAY_MS: u64 = 1_000;
const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraderState {
    New,
    Idle,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl TraderState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::New,
            1 => Self::Idle,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraderStatus {
    pub trader_id: String,
    pub state: TraderState,
    pub cycle_number: u64,
    pub stop_until: Option<DateTime<Utc>>,
    pub daily_pnl: f64,
    pub trading_symbols: Option<Vec<String>>,
    pub last_cycle_error: Option<String>,
}

struct HoldingState {
    first_seen: HashMap<(String, Side), i64>,
}

struct DailyPnlState {
    accumulated: f64,
    last_roll_ms: i64,
}

pub struct AutoTrader {
    trader_id: String,
    config: AutoTraderConfig,
    venue: Arc<dyn Venue>,
    engine: Arc<DecisionEngine>,
    log: Arc<DecisionLog>,
    candidate_pool: Arc<CandidatePool>,
    market_fetcher: Arc<dyn MarketDataFetcher>,
    token: CancellationToken,
    state: AtomicU8,
    /// Millis since epoch; 0 means "no cooldown in effect".
    stop_until_ms: AtomicI64,
    holding: Mutex<HoldingState>,
    daily_pnl: Mutex<DailyPnlState>,
    prompt_override: Mutex<PromptOverride>,
    started_at: Mutex<Option<Instant>>,
    last_cycle_error: Mutex<Option<String>>,
}

impl AutoTrader {
    pub fn new(
        config: AutoTraderConfig,
        venue: Arc<dyn Venue>,
        engine: Arc<DecisionEngine>,
        log: Arc<DecisionLog>,
        candidate_pool: Arc<CandidatePool>,
        market_fetcher: Arc<dyn MarketDataFetcher>,
        parent_token: &CancellationToken,
    ) -> Self {
        let trader_id = config.trader_id.clone();
        let prompt_override = PromptOverride {
            template_name: config.system_prompt_template.clone(),
            custom_addendum: config.custom_prompt.clone(),
            override_base: config.override_base_prompt,
        };
        Self {
            trader_id,
            config,
            venue,
            engine,
            log,
            candidate_pool,
            market_fetcher,
            token: parent_token.child_token(),
            state: AtomicU8::new(TraderState::New.as_u8()),
            stop_until_ms: AtomicI64::new(0),
            holding: Mutex::new(HoldingState {
                first_seen: HashMap::new(),
            }),
            daily_pnl: Mutex::new(DailyPnlState {
                accumulated: 0.0,
                last_roll_ms: Utc::now().timestamp_millis(),
            }),
            prompt_override: Mutex::new(prompt_override),
            started_at: Mutex::new(None),
            last_cycle_error: Mutex::new(None),
        }
    }

    pub fn trader_id(&self) -> &str {
        &self.trader_id
    }

    pub fn state(&self) -> TraderState {
        TraderState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, s: TraderState) {
        self.state.store(s.as_u8(), Ordering::SeqCst);
    }

    pub fn get_status(&self) -> TraderStatus {
        let stop_until_ms = self.stop_until_ms.load(Ordering::SeqCst);
        TraderStatus {
            trader_id: self.trader_id.clone(),
            state: self.state(),
            cycle_number: self.log.peek_next_cycle_number().saturating_sub(1),
            stop_until: if stop_until_ms > 0 {
                DateTime::from_timestamp_millis(stop_until_ms)
            } else {
                None
            },
            daily_pnl: self.daily_pnl.lock().accumulated,
            trading_symbols: self.config.trading_symbols.clone(),
            last_cycle_error: self.last_cycle_error.lock().clone(),
        }
    }

    pub fn set_custom_prompt(&self, text: String, override_base: bool) {
        let mut guard = self.prompt_override.lock();
        guard.custom_addendum = Some(text);
        guard.override_base = override_base;
    }

    /// Triggers a risk-control cooldown: the next `stop_trading_hours` hours
    /// of cycles are skipped (§4.G step 1).
    pub fn trigger_cooldown(&self) {
        let until = Utc::now() + chrono::Duration::minutes((self.config.stop_trading_hours * 60.0) as i64);
        self.stop_until_ms.store(until.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.set_state(TraderState::Stopping);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drives the fixed-interval loop until cancelled. The first cycle fires
    /// immediately (§4.G). The inter-cycle wait races the cancellable token
    /// against `tokio::time::sleep` so `stop()` unblocks it at once (§5, §8
    /// scenario 8) instead of waiting out the full interval.
    pub async fn run(self: Arc<Self>) {
        *self.started_at.lock() = Some(Instant::now());
        self.set_state(TraderState::Running);

        loop {
            if self.token.is_cancelled() {
                break;
            }

            // Races the whole cycle (including any in-flight HTTP call)
            // against cancellation so `stop()` drops it promptly instead of
            // waiting out an LLM/market-data timeout.
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = self.run_cycle() => {}
            }

            if self.token.is_cancelled() {
                break;
            }

            let interval = std::time::Duration::from_secs((self.config.scan_interval_minutes.max(1) as u64) * 60);
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.set_state(TraderState::Stopped);
    }

    fn runtime_minutes(&self) -> i64 {
        self.started_at
            .lock()
            .map(|i| i.elapsed().as_secs() as i64 / 60)
            .unwrap_or(0)
    }

    /// Rolls the daily PnL accumulator if more than 24h have elapsed since
    /// the last roll (§4.G step 2).
    fn maybe_roll_daily_pnl(&self) {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = self.daily_pnl.lock();
        if now_ms - state.last_roll_ms > DAY_MS {
            state.accumulated = 0.0;
            state.last_roll_ms = now_ms;
        }
    }

    /// Adds a closed position's realized PnL into the daily accumulator and
    /// trips the risk-control cooldown once accumulated losses cross
    /// `max_daily_loss_pct` of the trader's initial balance (§4.G step 2).
    fn accrue_realized_pnl(&self, realized_pnl: f64) {
        let breached = {
            let mut state = self.daily_pnl.lock();
            state.accumulated += realized_pnl;
            let loss_limit = self.config.max_daily_loss_pct / 100.0 * self.config.initial_balance;
            state.accumulated <= -loss_limit
        };
        if breached {
            warn!(trader_id = %self.trader_id, "daily loss limit breached, triggering cooldown");
            self.trigger_cooldown();
        }
    }

    /// Updates the `first_seen_ms` map from the current position snapshot:
    /// insert on new `(symbol, side)` pairs, drop entries no longer present
    /// (§3, §4.G "Holding-time tracking").
    fn refresh_holding(&self, positions: &[crate::venue::Position]) -> Vec<PositionWithHolding> {
        let now_ms = Utc::now().timestamp_millis();
        let mut holding = self.holding.lock();
        let present: std::collections::HashSet<(String, Side)> =
            positions.iter().map(|p| (p.symbol.clone(), p.side)).collect();

        holding.first_seen.retain(|key, _| present.contains(key));

        let mut out = Vec::with_capacity(positions.len());
        for p in positions {
            let key = (p.symbol.clone(), p.side);
            let first_seen_ms = *holding.first_seen.entry(key).or_insert(now_ms);
            out.push(PositionWithHolding {
                position: p.clone(),
                first_seen_ms,
            });
        }
        out
    }

    #[instrument(skip(self), name = "autotrader.run_cycle", fields(trader_id = %self.trader_id))]
    async fn run_cycle(&self) {
        let now = Utc::now();
        let stop_until_ms = self.stop_until_ms.load(Ordering::SeqCst);
        if stop_until_ms > 0 && now.timestamp_millis() < stop_until_ms {
            let remaining_min = (stop_until_ms - now.timestamp_millis()) / 60_000;
            warn!(trader_id = %self.trader_id, remaining_min, "cycle skipped: cooldown in effect");
            let error_message = format!(
                "{COOLDOWN_TOKEN} risk control cooldown in effect, {remaining_min} minute(s) remaining"
            );
            self.append_skip_record(error_message.clone()).await;
            *self.last_cycle_error.lock() = Some(error_message);
            return;
        }
        // Cooldown has lapsed naturally; clear it so subsequent cycles don't
        // keep reading a stale (but already-passed) deadline.
        if stop_until_ms > 0 {
            self.stop_until_ms.store(0, Ordering::SeqCst);
        }

        self.maybe_roll_daily_pnl();

        match self.run_cycle_inner(now).await {
            Ok(()) => {
                *self.last_cycle_error.lock() = None;
            }
            Err(e) => {
                warn!(trader_id = %self.trader_id, error = %e, "cycle failed");
                let message = e.to_string();
                self.append_skip_record(message.clone()).await;
                *self.last_cycle_error.lock() = Some(message);
            }
        }
    }

    async fn append_skip_record(&self, error_message: String) {
        let draft = DecisionRecordDraft {
            system_prompt: String::new(),
            user_prompt: String::new(),
            cot_trace: String::new(),
            decision_json: serde_json::json!([]),
            account_state: AccountStateSnapshot::default(),
            positions: Vec::new(),
            candidate_coins: Vec::new(),
            decisions: Vec::new(),
            success: false,
            error_message: Some(error_message),
        };
        if let Err(e) = self.log.append(draft).await {
            warn!(trader_id = %self.trader_id, error = %e, "failed to append skipped-cycle record");
        }
    }

    async fn run_cycle_inner(&self, now: DateTime<Utc>) -> Result<(), CoreError> {
        let balance = self.venue.get_balance().await?;
        let positions = self.venue.get_positions().await?;

        let total_equity = balance.total_equity();
        let margin_used: f64 = positions.iter().map(|p| p.margin_used).sum();
        let margin_used_pct = if total_equity == 0.0 { 0.0 } else { margin_used / total_equity * 100.0 };

        let positions_with_holding = self.refresh_holding(&positions);

        let candidate_coins = if let Some(symbols) = &self.config.trading_symbols {
            symbols
                .iter()
                .map(|s| crate::candidate_pool::CandidateCoin {
                    symbol: s.clone(),
                    origins: vec![],
                })
                .collect()
        } else if self.config.use_coin_pool || self.config.use_oi_top {
            fetch_candidates(&self.candidate_pool).await
        } else {
            Vec::new()
        };

        let oi_growth_entries = if self.config.use_oi_top {
            self.candidate_pool.fetch_oi_growth_feed().await
        } else {
            Vec::new()
        };

        let performance = self
            .log
            .analyze_performance(self.config.analysis_window)
            .await
            .ok();

        let cycle_number = self.log.peek_next_cycle_number();

        let ctx = assemble_context(
            now,
            self.runtime_minutes(),
            cycle_number,
            total_equity,
            balance.available,
            margin_used_pct,
            positions_with_holding,
            candidate_coins,
            self.market_fetcher.as_ref(),
            oi_growth_entries,
            performance,
            self.config.btc_eth_leverage,
            self.config.altcoin_leverage,
        )
        .await;

        let overrides = self.prompt_override.lock().clone();
        let full_decision = self.engine.decide(&ctx, &overrides).await?;

        let ordered = order_decisions(full_decision.decisions.clone());

        let mut action_records = Vec::with_capacity(ordered.len());
        for (i, decision) in ordered.iter().enumerate() {
            let record = self.execute_decision(decision, &positions, &ctx).await;
            let succeeded = record.success;
            action_records.push(record);
            if succeeded && i + 1 < ordered.len() {
                tokio::select! {
                    _ = self.token.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(INTER_DECISION_DELAY_MS)) => {}
                }
            }
        }

        let overall_success = action_records.iter().all(|a| a.success);
        let position_snapshots: Vec<PositionSnapshot> = positions
            .iter()
            .map(|p| PositionSnapshot {
                symbol: p.symbol.clone(),
                side: p.side,
                quantity: p.quantity,
                entry_price: p.entry_price,
                mark_price: p.mark_price,
                leverage: p.leverage,
                unrealized_pnl: p.unrealized_pnl,
            })
            .collect();

        let decision_json = serde_json::to_value(&full_decision.decisions).unwrap_or(serde_json::json!([]));

        let draft = DecisionRecordDraft {
            system_prompt: full_decision.system_prompt,
            user_prompt: full_decision.user_prompt,
            cot_trace: full_decision.reasoning,
            decision_json,
            account_state: AccountStateSnapshot {
                total_balance: total_equity,
                available_balance: balance.available,
                total_unrealized_profit: balance.unrealized_pnl,
                position_count: positions.len() as u32,
                margin_used_pct,
            },
            positions: position_snapshots,
            candidate_coins: ctx.candidate_coins.iter().map(|c| c.symbol.clone()).collect(),
            decisions: action_records,
            success: overall_success,
            error_message: if overall_success {
                None
            } else {
                Some("one or more actions failed; see execution_log".to_string())
            },
        };

        self.log
            .append(draft)
            .await
            .map_err(|e| CoreError::TransientIo(format!("decision log append: {e}")))?;

        Ok(())
    }

    async fn execute_decision(
        &self,
        decision: &Decision,
        positions: &[crate::venue::Position],
        ctx: &crate::engine::Context,
    ) -> ActionRecord {
        let timestamp = Utc::now();
        match decision.action {
            ActionKind::OpenLong | ActionKind::OpenShort => {
                self.execute_open(decision, positions, ctx, timestamp).await
            }
            ActionKind::CloseLong | ActionKind::CloseShort => {
                self.execute_close(decision, positions, timestamp).await
            }
            ActionKind::Hold | ActionKind::Wait => ActionRecord {
                action: decision.action,
                symbol: decision.symbol.clone(),
                quantity: 0.0,
                leverage: 0,
                price: 0.0,
                timestamp,
                success: true,
                error: None,
            },
        }
    }

    async fn execute_open(
        &self,
        decision: &Decision,
        positions: &[crate::venue::Position],
        ctx: &crate::engine::Context,
        timestamp: DateTime<Utc>,
    ) -> ActionRecord {
        let side = decision.action.side().expect("open actions always carry a side");

        if positions.iter().any(|p| p.symbol == decision.symbol && p.side == side) {
            return ActionRecord {
                action: decision.action,
                symbol: decision.symbol.clone(),
                quantity: 0.0,
                leverage: decision.leverage,
                price: 0.0,
                timestamp,
                success: false,
                error: Some(format!(
                    "refusing to open {side} on {}: a same-side position already exists",
                    decision.symbol
                )),
            };
        }

        let current_price = match ctx.market_data.get(&decision.symbol).map(|s| s.current_price) {
            Some(price) if price > 0.0 => price,
            _ => match self.venue.get_market_price(&decision.symbol).await {
                Ok(price) => price,
                Err(e) => {
                    return ActionRecord {
                        action: decision.action,
                        symbol: decision.symbol.clone(),
                        quantity: 0.0,
                        leverage: decision.leverage,
                        price: 0.0,
                        timestamp,
                        success: false,
                        error: Some(format!("no current price available: {e}")),
                    };
                }
            },
        };

        let raw_quantity = decision.position_size_usd / current_price;
        let quantity = match self.venue.format_quantity(&decision.symbol, raw_quantity).await {
            Ok(q) => q,
            Err(e) => {
                return ActionRecord {
                    action: decision.action,
                    symbol: decision.symbol.clone(),
                    quantity: 0.0,
                    leverage: decision.leverage,
                    price: 0.0,
                    timestamp,
                    success: false,
                    error: Some(format!("format_quantity failed: {e}")),
                };
            }
        };

        let open_result = match side {
            Side::Long => self.venue.open_long(&decision.symbol, quantity, decision.leverage).await,
            Side::Short => self.venue.open_short(&decision.symbol, quantity, decision.leverage).await,
        };

        let fill = match open_result {
            Ok(fill) => fill,
            Err(e) => {
                return ActionRecord {
                    action: decision.action,
                    symbol: decision.symbol.clone(),
                    quantity,
                    leverage: decision.leverage,
                    price: 0.0,
                    timestamp,
                    success: false,
                    error: Some(e.to_string()),
                };
            }
        };

        if decision.stop_loss > 0.0 && decision.take_profit > 0.0 {
            if let Err(e) = self
                .venue
                .set_stop_loss(&decision.symbol, side, quantity, decision.stop_loss)
                .await
            {
                warn!(symbol = %decision.symbol, error = %e, "failed to install stop-loss after open");
            }
            if let Err(e) = self
                .venue
                .set_take_profit(&decision.symbol, side, quantity, decision.take_profit)
                .await
            {
                warn!(symbol = %decision.symbol, error = %e, "failed to install take-profit after open");
            }
        }

        ActionRecord {
            action: decision.action,
            symbol: decision.symbol.clone(),
            quantity,
            leverage: decision.leverage,
            price: fill.fill_price,
            timestamp,
            success: true,
            error: None,
        }
    }

    async fn execute_close(
        &self,
        decision: &Decision,
        positions: &[crate::venue::Position],
        timestamp: DateTime<Utc>,
    ) -> ActionRecord {
        let side = decision.action.side().expect("close actions always carry a side");
        let existing = positions.iter().find(|p| p.symbol == decision.symbol && p.side == side);

        let Some(existing) = existing else {
            return ActionRecord {
                action: decision.action,
                symbol: decision.symbol.clone(),
                quantity: 0.0,
                leverage: 0,
                price: 0.0,
                timestamp,
                success: false,
                error: Some(format!("no {side} position on {} to close", decision.symbol)),
            };
        };

        let quantity = existing.quantity;
        let leverage = existing.leverage;
        let entry_price = existing.entry_price;

        let close_result = match side {
            Side::Long => self.venue.close_long(&decision.symbol, 0.0).await,
            Side::Short => self.venue.close_short(&decision.symbol, 0.0).await,
        };

        match close_result {
            Ok(fill) => {
                let realized_pnl = match side {
                    Side::Long => (fill.fill_price - entry_price) * quantity,
                    Side::Short => (entry_price - fill.fill_price) * quantity,
                };
                self.accrue_realized_pnl(realized_pnl);
                ActionRecord {
                    action: decision.action,
                    symbol: decision.symbol.clone(),
                    quantity,
                    leverage,
                    price: fill.fill_price,
                    timestamp,
                    success: true,
                    error: None,
                }
            }
            Err(e) => ActionRecord {
                action: decision.action,
                symbol: decision.symbol.clone(),
                quantity,
                leverage,
                price: 0.0,
                timestamp,
                success: false,
                error: Some(e.to_string()),
            },
        }
    }

    // -------------------------------------------------------------------
    // Manual operator hooks (§4.G) — exposed for the (out-of-scope) REST
    // façade, still part of this core's contract.
    // -------------------------------------------------------------------

    pub async fn close_all_positions(&self) -> Vec<ActionRecord> {
        let positions = match self.venue.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(trader_id = %self.trader_id, error = %e, "close_all_positions: failed to list positions");
                return Vec::new();
            }
        };

        let mut records = Vec::with_capacity(positions.len());
        for position in &positions {
            records.push(self.close_position(&position.symbol, position.side).await);
        }
        records
    }

    pub async fn close_position(&self, symbol: &str, side: Side) -> ActionRecord {
        let timestamp = Utc::now();
        let positions = self.venue.get_positions().await.unwrap_or_default();
        let action = match side {
            Side::Long => ActionKind::CloseLong,
            Side::Short => ActionKind::CloseShort,
        };
        let decision = Decision {
            symbol: symbol.to_string(),
            action,
            leverage: 0,
            position_size_usd: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            confidence: 0.0,
            risk_usd: 0.0,
            reasoning: "manual close".to_string(),
        };
        self.execute_close(&decision, &positions, timestamp).await
    }
}

/// Stable partition into `[closes, opens, others]`, preserving the engine's
/// array order within each bucket (§4.G step 5, §5 ordering guarantee).
pub fn order_decisions(decisions: Vec<Decision>) -> Vec<Decision> {
    let mut indexed: Vec<(u8, Decision)> = decisions
        .into_iter()
        .map(|d| (d.action.ordering_bucket(), d))
        .collect();
    indexed.sort_by_key(|(bucket, _)| *bucket);
    indexed.into_iter().map(|(_, d)| d).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate_pool::CandidatePoolConfig;
    use crate::engine::TemplateLibrary;
    use crate::llm::LLMClient;
    use crate::market_data::BinanceMarketDataFetcher;
    use crate::venue::demo::DemoVenue;
    use async_trait::async_trait;

    struct UnreachableLlm;

    #[async_trait]
    impl LLMClient for UnreachableLlm {
        async fn call(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String, CoreError> {
            unreachable!("not exercised by these tests")
        }
    }

    fn test_config(initial_balance: f64, max_daily_loss_pct: f64) -> AutoTraderConfig {
        AutoTraderConfig {
            trader_id: "t1".into(),
            initial_balance,
            btc_eth_leverage: 10,
            altcoin_leverage: 5,
            scan_interval_minutes: 15,
            trading_symbols: None,
            system_prompt_template: "default".into(),
            custom_prompt: None,
            override_base_prompt: false,
            is_cross_margin: false,
            use_coin_pool: false,
            use_oi_top: false,
            stop_trading_hours: 4.0,
            max_daily_loss_pct,
            analysis_window: 100,
        }
    }

    async fn test_autotrader(
        tmp: &std::path::Path,
        initial_balance: f64,
        max_daily_loss_pct: f64,
    ) -> (AutoTrader, Arc<DemoVenue>) {
        let config = test_config(initial_balance, max_daily_loss_pct);
        let demo_venue = Arc::new(DemoVenue::new(initial_balance));
        let venue: Arc<dyn Venue> = demo_venue.clone();
        let engine = Arc::new(DecisionEngine::new(
            Arc::new(UnreachableLlm),
            TemplateLibrary::from_map(HashMap::new()),
        ));
        let log = Arc::new(DecisionLog::open(tmp.join("log")).await.unwrap());
        let candidate_pool = Arc::new(CandidatePool::new(
            CandidatePoolConfig {
                cache_dir: tmp.join("cache"),
                ..CandidatePoolConfig::default()
            },
            reqwest::Client::new(),
        ));
        let market_fetcher: Arc<dyn MarketDataFetcher> =
            Arc::new(BinanceMarketDataFetcher::new(reqwest::Client::new()));
        let token = CancellationToken::new();
        let trader = AutoTrader::new(config, venue, engine, log, candidate_pool, market_fetcher, &token);
        (trader, demo_venue)
    }

    fn close_decision(symbol: &str, action: ActionKind) -> Decision {
        Decision {
            symbol: symbol.to_string(),
            action,
            leverage: 0,
            position_size_usd: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            confidence: 0.0,
            risk_usd: 0.0,
            reasoning: "test close".to_string(),
        }
    }

    #[tokio::test]
    async fn execute_close_accrues_realized_pnl() {
        let tmp = std::env::temp_dir().join(format!("autotrader-test-{}", uuid::Uuid::new_v4()));
        let (trader, demo_venue) = test_autotrader(&tmp, 10_000.0, 5.0).await;

        // Open at 30,000, then mark down to 29,000 before closing — a realized
        // loss of (29,000 - 30,000) * 0.1 = -100.
        demo_venue.set_mark_price("BTCUSDT", 30_000.0);
        demo_venue.open_long("BTCUSDT", 0.1, 5).await.unwrap();
        demo_venue.set_mark_price("BTCUSDT", 29_000.0);

        let positions = demo_venue.get_positions().await.unwrap();
        let record = trader
            .execute_close(&close_decision("BTCUSDT", ActionKind::CloseLong), &positions, Utc::now())
            .await;

        assert!(record.success);
        let expected = (record.price - 30_000.0) * 0.1;
        assert!((trader.daily_pnl.lock().accumulated - expected).abs() < 1e-9);
        assert!(trader.daily_pnl.lock().accumulated < 0.0);

        let _ = tokio::fs::remove_dir_all(&tmp).await;
    }

    #[tokio::test]
    async fn accrued_loss_past_threshold_triggers_cooldown() {
        let tmp = std::env::temp_dir().join(format!("autotrader-test-{}", uuid::Uuid::new_v4()));
        // 5% of 1000 = 50; a single realized loss of 60 must trip the cooldown.
        let (trader, _demo_venue) = test_autotrader(&tmp, 1_000.0, 5.0).await;

        assert_eq!(trader.stop_until_ms.load(Ordering::SeqCst), 0);
        trader.accrue_realized_pnl(-60.0);
        assert!(trader.stop_until_ms.load(Ordering::SeqCst) > 0);

        let _ = tokio::fs::remove_dir_all(&tmp).await;
    }

    #[tokio::test]
    async fn accrued_loss_below_threshold_does_not_trigger_cooldown() {
        let tmp = std::env::temp_dir().join(format!("autotrader-test-{}", uuid::Uuid::new_v4()));
        let (trader, _demo_venue) = test_autotrader(&tmp, 1_000.0, 5.0).await;

        trader.accrue_realized_pnl(-10.0);
        assert_eq!(trader.stop_until_ms.load(Ordering::SeqCst), 0);

        let _ = tokio::fs::remove_dir_all(&tmp).await;
    }

    fn decision(action: ActionKind, symbol: &str) -> Decision {
        Decision {
            symbol: symbol.to_string(),
            action,
            leverage: 1,
            position_size_usd: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            confidence: 0.0,
            risk_usd: 0.0,
            reasoning: String::new(),
        }
    }

    #[test]
    fn order_decisions_puts_closes_before_opens_before_others() {
        let decisions = vec![
            decision(ActionKind::Hold, "A"),
            decision(ActionKind::OpenLong, "B"),
            decision(ActionKind::CloseShort, "C"),
            decision(ActionKind::OpenShort, "D"),
            decision(ActionKind::CloseLong, "E"),
            decision(ActionKind::Wait, "F"),
        ];
        let ordered = order_decisions(decisions);
        let symbols: Vec<&str> = ordered.iter().map(|d| d.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["C", "E", "B", "D", "A", "F"]);
    }

    #[test]
    fn order_decisions_preserves_relative_order_within_bucket() {
        let decisions = vec![
            decision(ActionKind::CloseLong, "first-close"),
            decision(ActionKind::CloseShort, "second-close"),
            decision(ActionKind::OpenLong, "first-open"),
            decision(ActionKind::OpenShort, "second-open"),
        ];
        let ordered = order_decisions(decisions);
        let symbols: Vec<&str> = ordered.iter().map(|d| d.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["first-close", "second-close", "first-open", "second-open"]);
    }
}
