// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line = EMA(fast) - EMA(slow), aligned to the shorter of the two EMA
// series (the slow EMA always starts later since it needs more seed data).
// Signal line = EMA(signal) of the MACD line itself.
//
// Standard parameters: fast=12, slow=26, signal=9.

use super::ema::calculate_ema;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdPoint {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the full MACD series (aligned to the slow EMA's start) plus its
/// signal line and histogram.
///
/// Returns an empty vec when there isn't enough data to seed both EMAs and
/// the signal EMA (need at least `slow + signal - 1` closes beyond `slow`'s
/// own seed, in practice `closes.len() >= slow + signal`).
pub fn calculate_macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Vec<MacdPoint> {
    if fast == 0 || slow == 0 || signal == 0 || fast >= slow {
        return Vec::new();
    }

    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);
    if ema_fast.is_empty() || ema_slow.is_empty() {
        return Vec::new();
    }

    // ema_fast starts at index (fast-1) of `closes`; ema_slow starts at
    // (slow-1). Align both to the slow series' start.
    let offset = slow - fast;
    if ema_fast.len() <= offset {
        return Vec::new();
    }
    let macd_line: Vec<f64> = ema_fast[offset..]
        .iter()
        .zip(ema_slow.iter())
        .map(|(f, s)| f - s)
        .collect();

    let signal_line = calculate_ema(&macd_line, signal);
    if signal_line.is_empty() {
        return Vec::new();
    }

    let macd_offset = macd_line.len() - signal_line.len();
    macd_line[macd_offset..]
        .iter()
        .zip(signal_line.iter())
        .map(|(&macd, &sig)| MacdPoint {
            macd,
            signal: sig,
            histogram: macd - sig,
        })
        .collect()
}

/// Standard 12/26/9 MACD.
pub fn calculate(closes: &[f64]) -> Vec<MacdPoint> {
    calculate_macd(closes, 12, 26, 9)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_on_insufficient_data() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        assert!(calculate(&closes).is_empty());
    }

    #[test]
    fn produces_points_with_enough_data() {
        let closes: Vec<f64> = (1..=80).map(|x| x as f64).collect();
        let points = calculate(&closes);
        assert!(!points.is_empty());
        for p in &points {
            assert!(p.macd.is_finite());
            assert!(p.signal.is_finite());
            assert!((p.histogram - (p.macd - p.signal)).abs() < 1e-9);
        }
    }

    #[test]
    fn bad_params_return_empty() {
        let closes: Vec<f64> = (1..=80).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 0, 26, 9).is_empty());
        assert!(calculate_macd(&closes, 26, 12, 9).is_empty());
    }

    #[test]
    fn steady_uptrend_has_positive_macd() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let points = calculate(&closes);
        let last = points.last().unwrap();
        assert!(last.macd > 0.0);
    }
}
