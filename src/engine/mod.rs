// =============================================================================
// DecisionEngine — component F
// =============================================================================
//
// Assembles prompts from a Context, calls the LLMClient, and parses +
// validates the model's output into a FullDecision. Grounded on the
// reference engine's prompt layering (template + hard constraints + output
// format) and output-extraction pass (prose-before-bracket, balanced-bracket
// JSON block, curly-quote normalization), with the validator pulled out into
// its own pure function rather than left inline in the decide path.

pub mod context;
pub mod templates;
pub mod validate;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::candidate_pool::{CandidateCoin, FeedOrigin, OiGrowthEntry};
use crate::decision_log::PerformanceAnalysis;
use crate::error::CoreError;
use crate::llm::LLMClient;
use crate::market_data::MarketSnapshot;
use crate::types::ActionKind;

pub use context::{assemble_context, PositionWithHolding};
pub use templates::{TemplateLibrary, DEFAULT_TEMPLATE_NAME};
pub use validate::{validate_decision, ValidatedDecision, ValidationError};

const MAX_CONCURRENT_POSITIONS: u32 = 3;
const MIN_REWARD_RISK_RATIO: f64 = 3.0;
const MAX_MARGIN_USE_PCT: f64 = 90.0;

#[derive(Debug, Clone, Copy)]
pub struct AccountState {
    pub total_equity: f64,
    pub available_balance: f64,
    pub margin_used_pct: f64,
    pub position_count: u32,
}

pub struct Context {
    pub now: DateTime<Utc>,
    pub runtime_minutes: i64,
    pub cycle_number: u64,
    pub account: AccountState,
    pub positions: Vec<PositionWithHolding>,
    pub candidate_coins: Vec<CandidateCoin>,
    pub market_data: HashMap<String, MarketSnapshot>,
    pub oi_growth: HashMap<String, OiGrowthEntry>,
    pub performance: Option<PerformanceAnalysis>,
    pub btc_eth_leverage: u32,
    pub altcoin_leverage: u32,
}

/// A single proposed action on one symbol — the engine's output element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub action: ActionKind,
    #[serde(default)]
    pub leverage: u32,
    #[serde(default)]
    pub position_size_usd: f64,
    #[serde(default)]
    pub stop_loss: f64,
    #[serde(default)]
    pub take_profit: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub risk_usd: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Engine output for one cycle: the raw reasoning prose, the validated
/// decisions, what was dropped and why, and the exact prompts sent.
pub struct FullDecision {
    pub reasoning: String,
    pub decisions: Vec<Decision>,
    pub dropped: Vec<(String, String)>,
    pub system_prompt: String,
    pub user_prompt: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct PromptOverride {
    pub template_name: String,
    pub custom_addendum: Option<String>,
    pub override_base: bool,
}

pub struct DecisionEngine {
    llm: Arc<dyn LLMClient>,
    templates: TemplateLibrary,
}

impl DecisionEngine {
    pub fn new(llm: Arc<dyn LLMClient>, templates: TemplateLibrary) -> Self {
        Self { llm, templates }
    }

    #[instrument(skip(self, ctx, overrides), name = "engine.decide", fields(cycle_number = ctx.cycle_number))]
    pub async fn decide(&self, ctx: &Context, overrides: &PromptOverride) -> Result<FullDecision, CoreError> {
        let system_prompt = self.build_system_prompt(ctx, overrides);
        let user_prompt = build_user_prompt(ctx);

        let raw = self.llm.call(&system_prompt, &user_prompt).await?;
        let (reasoning, literals) = parse_output(&raw);

        let mut decisions = Vec::new();
        let mut dropped = Vec::new();
        for literal in literals {
            match literal {
                Ok(decision) => {
                    match validate_decision(&decision, ctx.account.total_equity, ctx.btc_eth_leverage, ctx.altcoin_leverage) {
                        Ok(ValidatedDecision(d)) => decisions.push(d),
                        Err(e) => dropped.push((decision.symbol.clone(), e.to_string())),
                    }
                }
                Err((symbol, reason)) => dropped.push((symbol, reason)),
            }
        }

        Ok(FullDecision {
            reasoning,
            decisions,
            dropped,
            system_prompt,
            user_prompt,
            timestamp: ctx.now,
        })
    }

    fn build_system_prompt(&self, ctx: &Context, overrides: &PromptOverride) -> String {
        let template_name = if overrides.template_name.is_empty() {
            DEFAULT_TEMPLATE_NAME
        } else {
            &overrides.template_name
        };

        if overrides.override_base {
            if let Some(custom) = &overrides.custom_addendum {
                return custom.clone();
            }
        }

        let mut prompt = String::new();
        prompt.push_str(self.templates.get(template_name));
        prompt.push_str("\n\n");

        if let Some(custom) = &overrides.custom_addendum {
            prompt.push_str("## Personalized strategy\n");
            prompt.push_str(custom);
            prompt.push_str("\n\n");
        }

        prompt.push_str(&hard_constraints_block(ctx));
        prompt.push_str("\n\n");
        prompt.push_str(OUTPUT_FORMAT_BLOCK);
        prompt
    }
}

fn hard_constraints_block(ctx: &Context) -> String {
    let btc_eth_cap = ctx.account.total_equity * 10.0;
    let altcoin_cap = ctx.account.total_equity * 1.5;
    format!(
        "## Hard constraints\n\
         - Minimum reward-to-risk ratio: 1:{MIN_REWARD_RISK_RATIO}\n\
         - Maximum concurrent open positions: {MAX_CONCURRENT_POSITIONS}\n\
         - BTCUSDT/ETHUSDT: leverage up to {}x, position size up to ${:.2}\n\
         - All other symbols: leverage up to {}x, position size up to ${:.2}\n\
         - Total margin use must not exceed {MAX_MARGIN_USE_PCT}% of equity",
        ctx.btc_eth_leverage, btc_eth_cap, ctx.altcoin_leverage, altcoin_cap,
    )
}

const OUTPUT_FORMAT_BLOCK: &str = "\
## Output format
First, write your reasoning in free-form prose.
Then, on its own, output a single JSON array of decision objects. Each \
object has: symbol, action (open_long|open_short|close_long|close_short|\
hold|wait), leverage, position_size_usd, stop_loss, take_profit, \
confidence (0-100), risk_usd, reasoning. Output nothing after the array.";

fn build_user_prompt(ctx: &Context) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "Time: {} | Cycle: {} | Runtime: {}m\n",
        ctx.now.to_rfc3339(),
        ctx.cycle_number,
        ctx.runtime_minutes
    ));

    if let Some(btc) = ctx.market_data.get("BTCUSDT") {
        out.push_str(&format!(
            "BTC pulse: ${:.2} ({:+.2}% 1h, {:+.2}% 4h)\n",
            btc.current_price, btc.price_change_1h, btc.price_change_4h
        ));
    }

    out.push_str(&format!(
        "Account: equity=${:.2} available=${:.2} margin_used={:.1}% positions={}\n",
        ctx.account.total_equity, ctx.account.available_balance, ctx.account.margin_used_pct, ctx.account.position_count
    ));

    if !ctx.positions.is_empty() {
        out.push_str("\n## Open positions\n");
        for p in &ctx.positions {
            let held_ms = (ctx.now.timestamp_millis() - p.first_seen_ms).max(0);
            out.push_str(&format!(
                "- {} {} qty={:.6} entry={:.2} mark={:.2} upnl={:.2} held={}m\n",
                p.position.symbol,
                p.position.side,
                p.position.quantity,
                p.position.entry_price,
                p.position.mark_price,
                p.position.unrealized_pnl,
                held_ms / 60_000,
            ));
        }
    }

    out.push_str("\n## Candidates\n");
    for coin in &ctx.candidate_coins {
        let Some(snapshot) = ctx.market_data.get(&coin.symbol) else { continue };
        let origins: Vec<&str> = coin
            .origins
            .iter()
            .map(|o| match o {
                FeedOrigin::ScoredFeed => "scored",
                FeedOrigin::OiGrowthFeed => "oi_growth",
            })
            .collect();
        out.push_str(&format!(
            "- {} [{}] price={:.4} rsi14(3m)={:.1} macd(3m)={:.4} oi_usd={}\n",
            snapshot.symbol,
            origins.join(","),
            snapshot.current_price,
            snapshot.intraday.rsi14.last().copied().unwrap_or(50.0),
            snapshot.intraday.macd.last().copied().unwrap_or(0.0),
            snapshot
                .open_interest_usd()
                .map(|v| format!("{v:.0}"))
                .unwrap_or_else(|| "n/a".to_string()),
        ));
    }

    if let Some(perf) = &ctx.performance {
        out.push_str(&format!(
            "\n## Recent performance\nSharpe={:.2} profit_factor={:.2} win_rate={:.1}%\n",
            perf.sharpe,
            perf.profit_factor,
            if perf.total_trades > 0 {
                perf.winning_trades as f64 / perf.total_trades as f64 * 100.0
            } else {
                0.0
            },
        ));
    }

    out.push_str("\nRespond with your reasoning followed by the JSON decision array.\n");
    out
}

/// Extracts the prose reasoning (everything before the first `[`) and the
/// list of per-decision parse results (successfully-shaped literal, or a
/// symbol-less error with the raw fragment's index as a stand-in label).
fn parse_output(raw: &str) -> (String, Vec<Result<Decision, (String, String)>>) {
    let bracket_start = match raw.find('[') {
        Some(idx) => idx,
        None => return (raw.trim().to_string(), Vec::new()),
    };
    let reasoning = raw[..bracket_start].trim().to_string();

    let Some(block) = extract_balanced_array(&raw[bracket_start..]) else {
        return (reasoning, Vec::new());
    };

    let normalized = normalize_curly_quotes(block);
    let values: Vec<serde_json::Value> = match serde_json::from_str(&normalized) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "decision array was not valid JSON");
            return (reasoning, Vec::new());
        }
    };

    let literals = values
        .into_iter()
        .map(|value| {
            let symbol = value
                .get("symbol")
                .and_then(|v| v.as_str())
                .unwrap_or("UNKNOWN")
                .to_string();
            serde_json::from_value::<Decision>(value).map_err(|e| (symbol, e.to_string()))
        })
        .collect();

    (reasoning, literals)
}

/// Scans for the first `[...]` block with matching bracket depth, respecting
/// (non-escaped-quote) JSON string literals so brackets inside strings don't
/// throw off the depth count.
fn extract_balanced_array(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, &b) in bytes.iter().enumerate() {
        let c = b as char;
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn normalize_curly_quotes(text: &str) -> String {
    text.replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_output_splits_reasoning_from_decisions() {
        let raw = r#"I think BTC looks strong here.
[{"symbol": "BTCUSDT", "action": "open_long", "leverage": 5, "position_size_usd": 5000, "stop_loss": 100, "take_profit": 115, "confidence": 80, "risk_usd": 50, "reasoning": "momentum"}]"#;
        let (reasoning, literals) = parse_output(raw);
        assert_eq!(reasoning, "I think BTC looks strong here.");
        assert_eq!(literals.len(), 1);
        assert!(literals[0].is_ok());
    }

    #[test]
    fn parse_output_handles_curly_quotes() {
        let raw = "reasoning\n[{\u{201C}symbol\u{201D}: \u{201C}ETHUSDT\u{201D}, \u{201C}action\u{201D}: \u{201C}hold\u{201D}}]";
        let (_, literals) = parse_output(raw);
        assert_eq!(literals.len(), 1);
        assert!(literals[0].is_ok());
    }

    #[test]
    fn parse_output_with_no_bracket_returns_full_text_as_reasoning() {
        let raw = "I cannot decide anything right now.";
        let (reasoning, literals) = parse_output(raw);
        assert_eq!(reasoning, raw);
        assert!(literals.is_empty());
    }

    #[test]
    fn parse_output_ignores_brackets_inside_strings() {
        let raw = r#"note
[{"symbol": "BTCUSDT", "action": "wait", "reasoning": "range [100,110]"}]"#;
        let (_, literals) = parse_output(raw);
        assert_eq!(literals.len(), 1);
        assert!(literals[0].is_ok());
    }

    #[test]
    fn parse_output_reports_unknown_action_as_dropped() {
        let raw = r#"note
[{"symbol": "BTCUSDT", "action": "moon"}]"#;
        let (_, literals) = parse_output(raw);
        assert_eq!(literals.len(), 1);
        assert!(literals[0].is_err());
    }
}
