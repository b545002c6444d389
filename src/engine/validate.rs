// =============================================================================
// Decision validation — a pure function, no engine state
// =============================================================================

use thiserror::Error;

use crate::types::ActionKind;

use super::Decision;

const BTC_ETH_SYMBOLS: [&str; 2] = ["BTCUSDT", "ETHUSDT"];
const BTC_ETH_SIZE_MULTIPLIER: f64 = 10.0;
const ALTCOIN_SIZE_MULTIPLIER: f64 = 1.5;
const SIZE_TOLERANCE: f64 = 1.01;
const MIN_REWARD_RISK_RATIO: f64 = 3.0;
const NOMINAL_ENTRY_FRACTION: f64 = 0.2;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("leverage {leverage} outside allowed range [1, {max_leverage}]")]
    LeverageOutOfRange { leverage: u32, max_leverage: u32 },

    #[error("position_size_usd {size} exceeds cap {cap}")]
    SizeExceedsCap { size: f64, cap: f64 },

    #[error("position_size_usd must be positive, got {0}")]
    NonPositiveSize(f64),

    #[error("stop_loss and take_profit must be positive")]
    NonPositiveStopOrTarget,

    #[error("stop_loss/take_profit ordering invalid for {action}: stop_loss={stop_loss}, take_profit={take_profit}")]
    InvalidStopTakeOrdering {
        action: ActionKind,
        stop_loss: f64,
        take_profit: f64,
    },

    #[error("reward/risk ratio {ratio:.2} below minimum {min}")]
    RewardRiskTooLow { ratio: f64, min: f64 },

    #[error("risk is zero, cannot compute reward/risk ratio")]
    ZeroRisk,
}

/// A Decision that has passed every validation invariant. Wrapping rather than
/// reusing `Decision` directly keeps "validated" a type-level fact instead of
/// a convention callers must remember to check.
#[derive(Debug, Clone)]
pub struct ValidatedDecision(pub Decision);

pub fn validate_decision(
    decision: &Decision,
    equity: f64,
    btc_eth_leverage: u32,
    altcoin_leverage: u32,
) -> Result<ValidatedDecision, ValidationError> {
    if !decision.action.is_open() {
        return Ok(ValidatedDecision(decision.clone()));
    }

    let (max_leverage, size_multiplier) = if BTC_ETH_SYMBOLS.contains(&decision.symbol.as_str()) {
        (btc_eth_leverage, BTC_ETH_SIZE_MULTIPLIER)
    } else {
        (altcoin_leverage, ALTCOIN_SIZE_MULTIPLIER)
    };
    let max_position_value = equity * size_multiplier;

    if decision.leverage < 1 || decision.leverage > max_leverage {
        return Err(ValidationError::LeverageOutOfRange {
            leverage: decision.leverage,
            max_leverage,
        });
    }

    if decision.position_size_usd <= 0.0 {
        return Err(ValidationError::NonPositiveSize(decision.position_size_usd));
    }
    let cap = max_position_value * SIZE_TOLERANCE;
    if decision.position_size_usd > cap {
        return Err(ValidationError::SizeExceedsCap {
            size: decision.position_size_usd,
            cap,
        });
    }

    if decision.stop_loss <= 0.0 || decision.take_profit <= 0.0 {
        return Err(ValidationError::NonPositiveStopOrTarget);
    }

    match decision.action {
        ActionKind::OpenLong if decision.stop_loss >= decision.take_profit => {
            return Err(ValidationError::InvalidStopTakeOrdering {
                action: decision.action,
                stop_loss: decision.stop_loss,
                take_profit: decision.take_profit,
            });
        }
        ActionKind::OpenShort if decision.stop_loss <= decision.take_profit => {
            return Err(ValidationError::InvalidStopTakeOrdering {
                action: decision.action,
                stop_loss: decision.stop_loss,
                take_profit: decision.take_profit,
            });
        }
        _ => {}
    }

    let entry = decision.stop_loss + NOMINAL_ENTRY_FRACTION * (decision.take_profit - decision.stop_loss);
    let risk_pct = (entry - decision.stop_loss).abs() / entry * 100.0;
    let reward_pct = (decision.take_profit - entry).abs() / entry * 100.0;

    if risk_pct == 0.0 {
        return Err(ValidationError::ZeroRisk);
    }
    let ratio = reward_pct / risk_pct;
    if ratio < MIN_REWARD_RISK_RATIO {
        return Err(ValidationError::RewardRiskTooLow {
            ratio,
            min: MIN_REWARD_RISK_RATIO,
        });
    }

    Ok(ValidatedDecision(decision.clone()))
}
