// =============================================================================
// DecisionLog — component E
// =============================================================================
//
// Append-only per-trader journal: one JSON document per cycle on disk.
// Source of truth for `analyze_performance`'s trade reconstruction and the
// Sharpe feedback fed back into the next prompt. Grounded on the reference
// performance-analysis walk (open/close matching by (symbol, side), preroll
// window for cross-boundary matches) with the Sharpe math made concrete
// where the source left it stubbed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::types::{ActionKind, Side};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct AccountStateSnapshot {
    pub total_balance: f64,
    pub available_balance: f64,
    pub total_unrealized_profit: f64,
    pub position_count: u32,
    pub margin_used_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: ActionKind,
    pub symbol: String,
    pub quantity: f64,
    pub leverage: u32,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

/// What a caller hands to `append`; the log itself stamps `timestamp` and
/// assigns `cycle_number`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecordDraft {
    pub system_prompt: String,
    pub user_prompt: String,
    pub cot_trace: String,
    pub decision_json: serde_json::Value,
    pub account_state: AccountStateSnapshot,
    pub positions: Vec<PositionSnapshot>,
    pub candidate_coins: Vec<String>,
    pub decisions: Vec<ActionRecord>,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub cycle_number: u64,
    pub input_prompt: String,
    pub cot_trace: String,
    pub decision_json: serde_json::Value,
    pub account_state: AccountStateSnapshot,
    pub positions: Vec<PositionSnapshot>,
    pub candidate_coins: Vec<String>,
    pub decisions: Vec<ActionRecord>,
    pub execution_log: Vec<String>,
    pub success: bool,
    pub error_message: Option<String>,
    /// Kept alongside `input_prompt` (the combined record a reader expects)
    /// so a trader can always recover the separate system/user halves.
    pub system_prompt: String,
}

#[derive(Debug, Default, Serialize)]
pub struct LogStatistics {
    pub cycle_count: u64,
    pub success_count: u64,
    pub fail_count: u64,
    pub open_action_count: u64,
    pub close_action_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeOutcome {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub leverage: u32,
    pub open_price: f64,
    pub close_price: f64,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub duration: String,
    pub pnl: f64,
    pub pnl_pct: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SymbolRollup {
    pub trades: u32,
    pub wins: u32,
    pub total_pnl: f64,
}

impl SymbolRollup {
    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64 * 100.0
        }
    }

    pub fn avg_pnl(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.total_pnl / self.trades as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceAnalysis {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub profit_factor: f64,
    pub per_symbol: HashMap<String, SymbolRollup>,
    pub best_symbol: Option<String>,
    pub worst_symbol: Option<String>,
    pub recent_trades: Vec<TradeOutcome>,
    pub sharpe: f64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct OpenKey<'a> {
    symbol: &'a str,
    side: Side,
}

struct OutstandingOpen {
    open_price: f64,
    open_time: DateTime<Utc>,
    quantity: f64,
    leverage: u32,
}

pub struct DecisionLog {
    dir: PathBuf,
    cycle_counter: AtomicU64,
}

impl DecisionLog {
    /// Opens (creating if needed) the trader's log directory and seeds the
    /// cycle counter from the highest `cycleN` suffix already on disk.
    pub async fn open(dir: PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let mut highest = 0u64;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(n) = parse_cycle_number(name) {
                    highest = highest.max(n);
                }
            }
        }
        Ok(Self {
            dir,
            cycle_counter: AtomicU64::new(highest),
        })
    }

    /// The cycle number the *next* `append` call will assign, without
    /// mutating the counter. Used by callers (AutoTrader) that need the
    /// upcoming cycle number to stamp into the Context/prompts built before
    /// the record is appended.
    pub fn peek_next_cycle_number(&self) -> u64 {
        self.cycle_counter.load(Ordering::SeqCst) + 1
    }

    fn file_path(&self, timestamp: DateTime<Utc>, cycle_number: u64) -> PathBuf {
        let stamp = timestamp.format("%Y%m%d_%H%M%S");
        self.dir.join(format!("decision_{stamp}_cycle{cycle_number}.json"))
    }

    #[instrument(skip(self, draft), name = "decision_log.append", fields(cycle_number))]
    pub async fn append(&self, draft: DecisionRecordDraft) -> std::io::Result<u64> {
        let cycle_number = self.cycle_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let timestamp = Utc::now();
        let execution_log = draft
            .decisions
            .iter()
            .map(|a| {
                if a.success {
                    format!("{} {} ok @ {}", a.action, a.symbol, a.price)
                } else {
                    format!(
                        "{} {} failed: {}",
                        a.action,
                        a.symbol,
                        a.error.as_deref().unwrap_or("unknown error")
                    )
                }
            })
            .collect();

        let record = DecisionRecord {
            timestamp,
            cycle_number,
            input_prompt: draft.user_prompt.clone(),
            system_prompt: draft.system_prompt,
            cot_trace: draft.cot_trace,
            decision_json: draft.decision_json,
            account_state: draft.account_state,
            positions: draft.positions,
            candidate_coins: draft.candidate_coins,
            decisions: draft.decisions,
            execution_log,
            success: draft.success,
            error_message: draft.error_message,
        };

        let path = self.file_path(timestamp, cycle_number);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&record)?;
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(cycle_number)
    }

    async fn load_all(&self) -> std::io::Result<Vec<DecisionRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<DecisionRecord>(&bytes) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unparsable decision record"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "failed to read decision record"),
            }
        }
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    pub async fn latest(&self, n: usize) -> std::io::Result<Vec<DecisionRecord>> {
        let mut records = self.load_all().await?;
        if records.len() > n {
            records.drain(0..records.len() - n);
        }
        Ok(records)
    }

    pub async fn by_date(&self, date: NaiveDate) -> std::io::Result<Vec<DecisionRecord>> {
        let records = self.load_all().await?;
        Ok(records
            .into_iter()
            .filter(|r| r.timestamp.date_naive() == date)
            .collect())
    }

    pub async fn clean(&self, older_than_days: i64) -> std::io::Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
        let mut removed = 0u64;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(&path).await else { continue };
            let Ok(record) = serde_json::from_slice::<DecisionRecord>(&bytes) else { continue };
            if record.timestamp < cutoff {
                if tokio::fs::remove_file(&path).await.is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    pub async fn statistics(&self) -> std::io::Result<LogStatistics> {
        let records = self.load_all().await?;
        let mut stats = LogStatistics::default();
        stats.cycle_count = records.len() as u64;
        for record in &records {
            if record.success {
                stats.success_count += 1;
            } else {
                stats.fail_count += 1;
            }
            for action in &record.decisions {
                if action.action.is_open() {
                    stats.open_action_count += 1;
                } else if action.action.is_close() {
                    stats.close_action_count += 1;
                }
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self), name = "decision_log.analyze_performance")]
    pub async fn analyze_performance(&self, window: usize) -> std::io::Result<PerformanceAnalysis> {
        let all = self.load_all().await?;
        let preroll_start = all.len().saturating_sub(window.saturating_mul(3));
        let window_start = all.len().saturating_sub(window);
        let scope = &all[preroll_start..];

        let mut open_map: HashMap<(String, Side), OutstandingOpen> = HashMap::new();
        let mut trades: Vec<(usize, TradeOutcome)> = Vec::new();

        for (idx, record) in scope.iter().enumerate() {
            let absolute_idx = preroll_start + idx;
            if !record.success {
                continue;
            }
            for action in &record.decisions {
                if !action.success {
                    continue;
                }
                let Some(side) = action.action.side() else { continue };
                let key = (action.symbol.clone(), side);

                if action.action.is_open() {
                    open_map.insert(
                        key,
                        OutstandingOpen {
                            open_price: action.price,
                            open_time: action.timestamp,
                            quantity: action.quantity,
                            leverage: action.leverage.max(1),
                        },
                    );
                } else if action.action.is_close() {
                    if let Some(open) = open_map.remove(&key) {
                        let close = action.price;
                        let pnl = match side {
                            Side::Long => open.quantity * (close - open.open_price),
                            Side::Short => open.quantity * (open.open_price - close),
                        };
                        let position_value = open.quantity * open.open_price;
                        let margin_used = position_value / open.leverage as f64;
                        let pnl_pct = if margin_used == 0.0 { 0.0 } else { pnl / margin_used * 100.0 };
                        let duration = format_duration(action.timestamp - open.open_time);

                        trades.push((
                            absolute_idx,
                            TradeOutcome {
                                symbol: action.symbol.clone(),
                                side,
                                quantity: open.quantity,
                                leverage: open.leverage,
                                open_price: open.open_price,
                                close_price: close,
                                open_time: open.open_time,
                                close_time: action.timestamp,
                                duration,
                                pnl,
                                pnl_pct,
                            },
                        ));
                    }
                }
            }
        }

        let windowed: Vec<TradeOutcome> = trades
            .into_iter()
            .filter(|(idx, _)| *idx >= window_start)
            .map(|(_, t)| t)
            .collect();

        let mut analysis = PerformanceAnalysis {
            total_trades: windowed.len() as u32,
            ..Default::default()
        };

        let mut sum_wins = 0.0;
        let mut sum_losses = 0.0;

        for trade in &windowed {
            if trade.pnl > 0.0 {
                analysis.winning_trades += 1;
                sum_wins += trade.pnl;
            } else if trade.pnl < 0.0 {
                analysis.losing_trades += 1;
                sum_losses += trade.pnl;
            }
            let rollup = analysis.per_symbol.entry(trade.symbol.clone()).or_default();
            rollup.trades += 1;
            if trade.pnl > 0.0 {
                rollup.wins += 1;
            }
            rollup.total_pnl += trade.pnl;
        }

        analysis.avg_win = if analysis.winning_trades > 0 {
            sum_wins / analysis.winning_trades as f64
        } else {
            0.0
        };
        analysis.avg_loss = if analysis.losing_trades > 0 {
            sum_losses / analysis.losing_trades as f64
        } else {
            0.0
        };
        analysis.profit_factor = if sum_losses == 0.0 {
            if sum_wins > 0.0 { 999.0 } else { 0.0 }
        } else {
            sum_wins / sum_losses.abs()
        };

        if let Some((symbol, _)) = analysis
            .per_symbol
            .iter()
            .max_by(|a, b| a.1.total_pnl.partial_cmp(&b.1.total_pnl).unwrap())
        {
            analysis.best_symbol = Some(symbol.clone());
        }
        if let Some((symbol, _)) = analysis
            .per_symbol
            .iter()
            .min_by(|a, b| a.1.total_pnl.partial_cmp(&b.1.total_pnl).unwrap())
        {
            analysis.worst_symbol = Some(symbol.clone());
        }

        let mut recent = windowed.clone();
        recent.reverse();
        recent.truncate(10);
        analysis.recent_trades = recent;

        let equities: Vec<f64> = scope[window_start.saturating_sub(preroll_start)..]
            .iter()
            .map(|r| r.account_state.total_balance)
            .filter(|e| *e > 0.0)
            .collect();
        analysis.sharpe = compute_sharpe(&equities);

        Ok(analysis)
    }
}

fn parse_cycle_number(filename: &str) -> Option<u64> {
    let stem = filename.strip_suffix(".json")?;
    let idx = stem.rfind("_cycle")?;
    stem[idx + "_cycle".len()..].parse::<u64>().ok()
}

fn format_duration(duration: chrono::Duration) -> String {
    let total_minutes = duration.num_minutes().max(0);
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m0s")
    } else {
        format!("{minutes}m0s")
    }
}

/// `mean(returns) / population_stdev(returns)`, with the ±999 saturation
/// rule for zero variance and `0.0` when there aren't at least two equities.
pub fn compute_sharpe(equities: &[f64]) -> f64 {
    if equities.len() < 2 {
        return 0.0;
    }
    let returns: Vec<f64> = equities
        .windows(2)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.is_empty() {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    let stdev = variance.sqrt();
    if stdev == 0.0 {
        if mean > 0.0 {
            999.0
        } else if mean < 0.0 {
            -999.0
        } else {
            0.0
        }
    } else {
        mean / stdev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(action: ActionKind, symbol: &str, price: f64, ts: DateTime<Utc>) -> ActionRecord {
        ActionRecord {
            action,
            symbol: symbol.to_string(),
            quantity: 1.0,
            leverage: 5,
            price,
            timestamp: ts,
            success: true,
            error: None,
        }
    }

    fn draft(decisions: Vec<ActionRecord>, total_balance: f64) -> DecisionRecordDraft {
        DecisionRecordDraft {
            system_prompt: "sys".into(),
            user_prompt: "user".into(),
            cot_trace: "reasoning".into(),
            decision_json: serde_json::json!([]),
            account_state: AccountStateSnapshot {
                total_balance,
                available_balance: total_balance,
                total_unrealized_profit: 0.0,
                position_count: 0,
                margin_used_pct: 0.0,
            },
            positions: Vec::new(),
            candidate_coins: Vec::new(),
            decisions,
            success: true,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn append_assigns_strictly_increasing_cycle_numbers() {
        let tmp = std::env::temp_dir().join(format!("decision-log-test-{}", uuid::Uuid::new_v4()));
        let log = DecisionLog::open(tmp.clone()).await.unwrap();

        let c1 = log.append(draft(vec![], 1000.0)).await.unwrap();
        let c2 = log.append(draft(vec![], 1010.0)).await.unwrap();
        assert!(c2 > c1);

        let _ = tokio::fs::remove_dir_all(&tmp).await;
    }

    #[tokio::test]
    async fn analyze_performance_matches_open_and_close() {
        let tmp = std::env::temp_dir().join(format!("decision-log-test-{}", uuid::Uuid::new_v4()));
        let log = DecisionLog::open(tmp.clone()).await.unwrap();

        let t0 = Utc::now() - chrono::Duration::minutes(30);
        let t1 = Utc::now();
        log.append(draft(
            vec![action(ActionKind::OpenLong, "BTCUSDT", 100.0, t0)],
            1000.0,
        ))
        .await
        .unwrap();
        log.append(draft(
            vec![action(ActionKind::CloseLong, "BTCUSDT", 110.0, t1)],
            1010.0,
        ))
        .await
        .unwrap();

        let analysis = log.analyze_performance(100).await.unwrap();
        assert_eq!(analysis.total_trades, 1);
        assert_eq!(analysis.winning_trades, 1);
        assert!(analysis.recent_trades[0].pnl > 0.0);

        let _ = tokio::fs::remove_dir_all(&tmp).await;
    }

    #[test]
    fn sharpe_saturates_on_zero_variance() {
        assert_eq!(compute_sharpe(&[1000.0, 1010.0, 1020.0, 1030.0]), 999.0);
        assert_eq!(compute_sharpe(&[1000.0, 990.0, 980.0]), -999.0);
        assert_eq!(compute_sharpe(&[1000.0]), 0.0);
    }

    #[test]
    fn sharpe_is_invariant_under_permutation_of_returns() {
        let equities = [1000.0, 1010.0, 1005.0, 1020.0, 1015.0, 1030.0, 1025.0, 1040.0, 1035.0, 1050.0];
        let returns: Vec<f64> = equities.windows(2).map(|w| (w[1] - w[0]) / w[0]).collect();
        let sharpe_original = compute_sharpe(&equities);

        let mut shuffled_returns = returns.clone();
        shuffled_returns.reverse();
        let mut rebuilt_equities = vec![1000.0];
        for r in &shuffled_returns {
            let prev = *rebuilt_equities.last().unwrap();
            rebuilt_equities.push(prev * (1.0 + r));
        }
        let sharpe_shuffled = compute_sharpe(&rebuilt_equities);

        assert!((sharpe_original.abs() - sharpe_shuffled.abs()).abs() < 1e-6);
    }

    #[test]
    fn parse_cycle_number_extracts_trailing_digits() {
        assert_eq!(parse_cycle_number("decision_20260101_120000_cycle42.json"), Some(42));
        assert_eq!(parse_cycle_number("not-a-record.json"), None);
    }
}
