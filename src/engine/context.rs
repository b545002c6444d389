// =============================================================================
// Context assembly (§4.F "Context assembly (before prompting)")
// =============================================================================
//
// Pulled out of the AutoTrader's cycle body into its own function so the
// fan-out/liquidity-filter logic is unit-testable without a running trader
// loop. AutoTrader still owns calling this each cycle (§4.G step 3) and
// threading the result into `DecisionEngine::decide`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{instrument, warn};

use crate::candidate_pool::{CandidateCoin, CandidatePool, OiGrowthEntry};
use crate::decision_log::PerformanceAnalysis;
use crate::market_data::{MarketDataFetcher, MarketSnapshot};
use crate::venue::Position;

use super::{AccountState, Context};

pub const LIQUIDITY_FLOOR_USD: f64 = 15_000_000.0;

/// Holding-time-annotated position, built by the AutoTrader from its
/// cross-cycle `first_seen_ms` map before context assembly.
#[derive(Debug, Clone)]
pub struct PositionWithHolding {
    pub position: Position,
    pub first_seen_ms: i64,
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, name = "engine.assemble_context")]
pub async fn assemble_context(
    now: DateTime<Utc>,
    runtime_minutes: i64,
    cycle_number: u64,
    total_equity: f64,
    available_balance: f64,
    margin_used_pct: f64,
    positions: Vec<PositionWithHolding>,
    candidate_coins: Vec<CandidateCoin>,
    market_fetcher: &dyn MarketDataFetcher,
    oi_growth_entries: Vec<OiGrowthEntry>,
    performance: Option<PerformanceAnalysis>,
    btc_eth_leverage: u32,
    altcoin_leverage: u32,
) -> Context {
    let position_symbols: Vec<String> = positions.iter().map(|p| p.position.symbol.clone()).collect();

    let mut fetch_symbols: Vec<String> = position_symbols.clone();
    for coin in &candidate_coins {
        if !fetch_symbols.contains(&coin.symbol) {
            fetch_symbols.push(coin.symbol.clone());
        }
    }

    let fetches = fetch_symbols
        .iter()
        .map(|symbol| async move { (symbol.clone(), market_fetcher.fetch_snapshot(symbol).await) });
    let fetched: Vec<(String, Result<MarketSnapshot, crate::error::CoreError>)> = join_all(fetches).await;

    let mut market_data: HashMap<String, MarketSnapshot> = HashMap::new();
    for (symbol, result) in fetched {
        match result {
            Ok(snapshot) => {
                let is_position = position_symbols.contains(&symbol);
                let passes_liquidity = snapshot
                    .open_interest_usd()
                    .map(|usd| usd >= LIQUIDITY_FLOOR_USD)
                    .unwrap_or(true);

                if is_position || passes_liquidity {
                    if is_position && !passes_liquidity {
                        warn!(symbol = %symbol, "position symbol below liquidity floor, keeping it anyway");
                    }
                    market_data.insert(symbol, snapshot);
                } else {
                    warn!(symbol = %symbol, "candidate dropped by liquidity filter");
                }
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "market snapshot fetch failed, dropping symbol from context");
            }
        }
    }

    let oi_growth: HashMap<String, OiGrowthEntry> = oi_growth_entries
        .into_iter()
        .map(|entry| (entry.symbol.clone(), entry))
        .collect();

    Context {
        now,
        runtime_minutes,
        cycle_number,
        account: AccountState {
            total_equity,
            available_balance,
            margin_used_pct,
            position_count: positions.len() as u32,
        },
        positions,
        candidate_coins,
        market_data,
        oi_growth,
        performance,
        btc_eth_leverage,
        altcoin_leverage,
    }
}

/// `ai_limit` passed to `CandidatePool::merged`: no dynamic cap is applied
/// (§9 open question — the equity-driven cap helper is a no-op in the
/// source, so this core simply takes the full scored feed).
pub const UNCAPPED_AI_LIMIT: usize = usize::MAX;

pub async fn fetch_candidates(pool: &CandidatePool) -> Vec<CandidateCoin> {
    pool.merged(UNCAPPED_AI_LIMIT).await
}
