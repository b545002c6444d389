// =============================================================================
// DemoVenue — local simulator implementing the Venue capability
// =============================================================================
//
// No network calls; fills are synthesized at the venue's current mark price.
// Grounded on the reference engine's "demo mode" execution path (simulated
// fill, synthetic order id, position opened locally) generalized into a full
// `Venue` implementation so the rest of the engine — AutoTrader, Supervisor,
// the full test suite — can run end to end without exchange credentials.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::cache::TtlCache;
use super::{Balance, OrderResult, Position, Venue, CACHE_TTL_SECS, DUST_THRESHOLD};
use crate::error::CoreError;
use crate::types::Side;

struct Inner {
    wallet_balance: f64,
    positions: HashMap<(String, Side), Position>,
    leverage: HashMap<String, u32>,
    leverage_changed_at: HashMap<String, Instant>,
    margin_cross: HashMap<String, bool>,
    mark_prices: HashMap<String, f64>,
    open_orders: HashMap<String, Vec<String>>,
}

pub struct DemoVenue {
    inner: Mutex<Inner>,
    balance_cache: TtlCache<Balance>,
    positions_cache: TtlCache<Vec<Position>>,
    lot_size: f64,
    /// Count of calls that actually mutated leverage (as opposed to no-ops).
    /// Exposed for the leverage-idempotence test below.
    leverage_mutations: AtomicU64,
}

impl DemoVenue {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                wallet_balance: initial_balance,
                positions: HashMap::new(),
                leverage: HashMap::new(),
                leverage_changed_at: HashMap::new(),
                margin_cross: HashMap::new(),
                mark_prices: HashMap::new(),
                open_orders: HashMap::new(),
            }),
            balance_cache: TtlCache::new(Duration::from_secs(CACHE_TTL_SECS)),
            positions_cache: TtlCache::new(Duration::from_secs(CACHE_TTL_SECS)),
            lot_size: 0.001,
            leverage_mutations: AtomicU64::new(0),
        }
    }

    /// Test/bootstrap hook: set the simulated mark price for a symbol.
    pub fn set_mark_price(&self, symbol: &str, price: f64) {
        self.inner
            .lock()
            .mark_prices
            .insert(symbol.to_string(), price);
        self.positions_cache.invalidate();
    }

    /// Test/bootstrap hook: seed a position directly (bypassing open_*).
    pub fn seed_position(&self, position: Position) {
        let key = (position.symbol.clone(), position.side);
        self.inner.lock().positions.insert(key, position);
        self.positions_cache.invalidate();
    }

    pub fn leverage_mutation_count(&self) -> u64 {
        self.leverage_mutations.load(Ordering::Relaxed)
    }

    fn mark_price(&self, symbol: &str) -> f64 {
        self.inner
            .lock()
            .mark_prices
            .get(symbol)
            .copied()
            .unwrap_or(100.0)
    }

    fn synthesize_fill(&self, symbol: &str, side: Side, quantity: f64, leverage: u32) {
        let price = self.mark_price(symbol);
        let margin_used = quantity * price / leverage.max(1) as f64;
        let position = Position {
            symbol: symbol.to_string(),
            side,
            quantity,
            entry_price: price,
            mark_price: price,
            leverage,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            liquidation_price: 0.0,
            margin_used,
        };
        let mut inner = self.inner.lock();
        inner.positions.insert((symbol.to_string(), side), position);
        self.positions_cache.invalidate();
    }
}

#[async_trait]
impl Venue for DemoVenue {
    async fn get_balance(&self) -> Result<Balance, CoreError> {
        if let Some(cached) = self.balance_cache.get() {
            return Ok(cached);
        }
        let inner = self.inner.lock();
        let unrealized_pnl: f64 = inner.positions.values().map(|p| p.unrealized_pnl).sum();
        let balance = Balance {
            wallet_balance: inner.wallet_balance,
            unrealized_pnl,
            available: inner.wallet_balance,
        };
        drop(inner);
        self.balance_cache.set(balance);
        Ok(balance)
    }

    async fn get_positions(&self) -> Result<Vec<Position>, CoreError> {
        if let Some(cached) = self.positions_cache.get() {
            return Ok(cached);
        }
        let inner = self.inner.lock();
        let positions: Vec<Position> = inner
            .positions
            .values()
            .filter(|p| p.quantity.abs() >= DUST_THRESHOLD)
            .cloned()
            .collect();
        drop(inner);
        self.positions_cache.set(positions.clone());
        Ok(positions)
    }

    async fn set_leverage(&self, symbol: &str, n: u32) -> Result<(), CoreError> {
        let mut inner = self.inner.lock();
        if inner.leverage.get(symbol).copied() == Some(n) {
            return Ok(());
        }
        inner.leverage.insert(symbol.to_string(), n);
        inner.leverage_changed_at.insert(symbol.to_string(), Instant::now());
        drop(inner);
        self.leverage_mutations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, is_cross_margin: bool) -> Result<(), CoreError> {
        let mut inner = self.inner.lock();
        if inner.margin_cross.get(symbol).copied() == Some(is_cross_margin) {
            return Err(CoreError::VenueStateConflict(format!(
                "{symbol} margin mode already {is_cross_margin}"
            )));
        }
        if inner.positions.keys().any(|(s, _)| s == symbol) {
            return Err(CoreError::VenueStateConflict(format!(
                "{symbol} has an open position; cannot change margin mode"
            )));
        }
        inner.margin_cross.insert(symbol.to_string(), is_cross_margin);
        Ok(())
    }

    async fn get_market_price(&self, symbol: &str) -> Result<f64, CoreError> {
        Ok(self.mark_price(symbol))
    }

    async fn open_long(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderResult, CoreError> {
        self.cancel_all_orders(symbol).await?;
        self.set_leverage(symbol, leverage).await?;
        self.synthesize_fill(symbol, Side::Long, quantity, leverage);
        Ok(OrderResult {
            order_id: Uuid::new_v4().to_string(),
            fill_price: self.mark_price(symbol),
        })
    }

    async fn open_short(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderResult, CoreError> {
        self.cancel_all_orders(symbol).await?;
        self.set_leverage(symbol, leverage).await?;
        self.synthesize_fill(symbol, Side::Short, quantity, leverage);
        Ok(OrderResult {
            order_id: Uuid::new_v4().to_string(),
            fill_price: self.mark_price(symbol),
        })
    }

    async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderResult, CoreError> {
        self.close_side(symbol, Side::Long, quantity).await
    }

    async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderResult, CoreError> {
        self.close_side(symbol, Side::Short, quantity).await
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        _side: Side,
        _quantity: f64,
        _stop_price: f64,
    ) -> Result<(), CoreError> {
        self.inner
            .lock()
            .open_orders
            .entry(symbol.to_string())
            .or_default()
            .push(format!("SL-{}", Uuid::new_v4()));
        Ok(())
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        _side: Side,
        _quantity: f64,
        _take_profit_price: f64,
    ) -> Result<(), CoreError> {
        self.inner
            .lock()
            .open_orders
            .entry(symbol.to_string())
            .or_default()
            .push(format!("TP-{}", Uuid::new_v4()));
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), CoreError> {
        self.inner.lock().open_orders.remove(symbol);
        Ok(())
    }

    async fn format_quantity(&self, _symbol: &str, quantity: f64) -> Result<f64, CoreError> {
        let steps = (quantity / self.lot_size).floor();
        Ok(steps * self.lot_size)
    }
}

impl DemoVenue {
    async fn close_side(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderResult, CoreError> {
        let key = (symbol.to_string(), side);
        let mut inner = self.inner.lock();
        let existing = inner
            .positions
            .get(&key)
            .ok_or_else(|| CoreError::VendorRejection(format!("no {side} position on {symbol}")))?
            .clone();

        let resolved_qty = if quantity <= 0.0 {
            existing.quantity
        } else {
            quantity.min(existing.quantity)
        };
        if resolved_qty <= 0.0 {
            return Err(CoreError::VendorRejection(format!(
                "no quantity to close on {symbol} {side}"
            )));
        }

        let price = inner
            .mark_prices
            .get(symbol)
            .copied()
            .unwrap_or(existing.entry_price);

        if resolved_qty >= existing.quantity - f64::EPSILON {
            inner.positions.remove(&key);
        } else {
            let mut updated = existing.clone();
            updated.quantity -= resolved_qty;
            inner.positions.insert(key, updated);
        }
        drop(inner);
        self.positions_cache.invalidate();
        self.cancel_all_orders(symbol).await?;

        Ok(OrderResult {
            order_id: Uuid::new_v4().to_string(),
            fill_price: price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_long_creates_position_and_reopen_is_visible() {
        let venue = DemoVenue::new(1000.0);
        venue.set_mark_price("BTCUSDT", 50_000.0);
        venue.open_long("BTCUSDT", 0.01, 5).await.unwrap();
        let positions = venue.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, Side::Long);
    }

    #[tokio::test]
    async fn close_long_with_zero_quantity_closes_full_position() {
        let venue = DemoVenue::new(1000.0);
        venue.set_mark_price("ETHUSDT", 3000.0);
        venue.open_long("ETHUSDT", 1.0, 3).await.unwrap();
        venue.close_long("ETHUSDT", 0.0).await.unwrap();
        let positions = venue.get_positions().await.unwrap();
        assert!(positions.is_empty());
    }

    #[tokio::test]
    async fn close_long_without_position_errors() {
        let venue = DemoVenue::new(1000.0);
        let err = venue.close_long("ETHUSDT", 0.0).await.unwrap_err();
        assert!(matches!(err, CoreError::VendorRejection(_)));
    }

    #[tokio::test]
    async fn set_leverage_is_idempotent() {
        let venue = DemoVenue::new(1000.0);
        venue.set_leverage("BTCUSDT", 5).await.unwrap();
        assert_eq!(venue.leverage_mutation_count(), 1);
        venue.set_leverage("BTCUSDT", 5).await.unwrap();
        assert_eq!(venue.leverage_mutation_count(), 1, "second identical call must not mutate");
    }

    #[tokio::test]
    async fn format_quantity_rounds_to_lot_size() {
        let venue = DemoVenue::new(1000.0);
        let rounded = venue.format_quantity("BTCUSDT", 0.01234).await.unwrap();
        assert!((rounded - 0.012).abs() < 1e-9);
    }

    #[tokio::test]
    async fn dust_positions_are_filtered_out() {
        let venue = DemoVenue::new(1000.0);
        venue.seed_position(Position {
            symbol: "DOGEUSDT".to_string(),
            side: Side::Long,
            quantity: 1e-6,
            entry_price: 0.1,
            mark_price: 0.1,
            leverage: 1,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            liquidation_price: 0.0,
            margin_used: 0.0,
        });
        let positions = venue.get_positions().await.unwrap();
        assert!(positions.is_empty());
    }
}
