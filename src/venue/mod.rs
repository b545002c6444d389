// =============================================================================
// Venue — component A
// =============================================================================
//
// Abstract derivatives account capability. Generalizes the inheritance-based
// "one abstract base class, four concrete exchange subclasses" shape into a
// single object-safe trait; concrete adapters implement it and are selected
// by `exchange_id` at construction time (see `supervisor`).
//
// This crate ships one concrete adapter (`demo::DemoVenue`), a local
// simulator sufficient to drive every AutoTrader code path and exercise the
// full test suite without reaching a real exchange. Wiring a genuine
// exchange SDK behind this same trait is an integration concern outside the
// core.

pub mod cache;
pub mod demo;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Side;

pub const DUST_THRESHOLD: f64 = 1e-5;
pub const LEVERAGE_CHANGE_COOLDOWN_SECS: u64 = 5;
pub const CACHE_TTL_SECS: u64 = 15;

/// Account balance snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Balance {
    pub wallet_balance: f64,
    pub unrealized_pnl: f64,
    pub available: f64,
}

impl Balance {
    pub fn total_equity(&self) -> f64 {
        self.wallet_balance + self.unrealized_pnl
    }
}

/// An open position on the venue. `first_seen_ms` is deliberately absent here
/// — it is tracked by the AutoTrader, not the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    pub liquidation_price: f64,
    pub margin_used: f64,
}

/// Result of a fill-producing call (open/close).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub fill_price: f64,
}

#[async_trait]
pub trait Venue: Send + Sync {
    async fn get_balance(&self) -> Result<Balance, CoreError>;

    /// Non-dust positions only (`|quantity| >= DUST_THRESHOLD`).
    async fn get_positions(&self) -> Result<Vec<Position>, CoreError>;

    /// Idempotent: a no-op if the symbol is already at leverage `n`.
    async fn set_leverage(&self, symbol: &str, n: u32) -> Result<(), CoreError>;

    /// Idempotent; "no change needed" and "position exists" must be treated
    /// as `VenueStateConflict`, not propagated as a fatal error.
    async fn set_margin_mode(&self, symbol: &str, is_cross_margin: bool) -> Result<(), CoreError>;

    async fn get_market_price(&self, symbol: &str) -> Result<f64, CoreError>;

    async fn open_long(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderResult, CoreError>;

    async fn open_short(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderResult, CoreError>;

    /// `quantity == 0.0` means "close the full current position"; an error
    /// is returned if there is no such position.
    async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderResult, CoreError>;

    async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderResult, CoreError>;

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_price: f64,
    ) -> Result<(), CoreError>;

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        take_profit_price: f64,
    ) -> Result<(), CoreError>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), CoreError>;

    /// Round `quantity` down to the venue's lot-size step for `symbol`.
    async fn format_quantity(&self, symbol: &str, quantity: f64) -> Result<f64, CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_total_equity_sums_wallet_and_upnl() {
        let b = Balance {
            wallet_balance: 1000.0,
            unrealized_pnl: -50.0,
            available: 900.0,
        };
        assert!((b.total_equity() - 950.0).abs() < 1e-9);
    }
}
