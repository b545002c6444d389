// =============================================================================
// Core error taxonomy
// =============================================================================
//
// Kinds, not call-site messages: callers branch on `CoreError` variants where
// the retry/propagation policy differs (transient vs. vendor rejection vs.
// validation). Call sites still attach context with `anyhow::Context` before
// a `CoreError` crosses an API boundary that needs to preserve the kind.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Fatal at startup: missing/malformed credentials, bad config values.
    #[error("config error: {0}")]
    Config(String),

    /// Network reset, timeout, 5xx. Retried internally by LLM/candidate-pool
    /// layers; surfaced as-is by venue/market-data layers.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// 4xx-class rejection from a venue or LLM vendor. Never retried.
    #[error("vendor rejected request: {0}")]
    VendorRejection(String),

    /// Venue reports a state conflict (leverage locked by open position,
    /// margin mode already set, etc). Non-fatal for adjacent operations.
    #[error("venue state conflict: {0}")]
    VenueStateConflict(String),

    /// A Decision failed one of the engine's validation invariants.
    #[error("validation failed: {0}")]
    Validation(String),

    /// LLM output had no balanced `[...]` block, or the block wasn't valid JSON.
    #[error("failed to parse LLM output: {0}")]
    Parse(String),

    /// Cycle skipped because the trader is in a risk-control cooldown.
    #[error("risk control pause in effect: {0}")]
    RiskControlPause(String),
}

impl CoreError {
    /// Whether this error class should ever be retried by a layer that owns
    /// its own retry policy (LLMClient, CandidatePool). Venue and market-data
    /// layers never retry regardless of this classification.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::TransientIo(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Classify a lower-level error string into a transient/non-transient bucket.
/// Grounded on the substring-matching retry classifier used by the reference
/// LLM client: cheap, dependency-free, and good enough for the handful of
/// error shapes `reqwest`/`tokio::time::timeout` actually produce.
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    const TRANSIENT_MARKERS: &[&str] = &[
        "eof",
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "temporary failure",
        "no such host",
        "dns",
        "broken pipe",
    ];
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    // HTTP 5xx.
    if let Some(pos) = lower.find("status") {
        let tail = &lower[pos..];
        for code in ["500", "502", "503", "504"] {
            if tail.contains(code) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_markers_detected() {
        assert!(is_retryable_message("Connection reset by peer"));
        assert!(is_retryable_message("operation timed out"));
        assert!(is_retryable_message("status 503 service unavailable"));
    }

    #[test]
    fn non_retryable_messages() {
        assert!(!is_retryable_message("status 401 unauthorized"));
        assert!(!is_retryable_message("invalid api key"));
    }

    #[test]
    fn core_error_retryable_classification() {
        assert!(CoreError::TransientIo("x".into()).is_retryable());
        assert!(!CoreError::VendorRejection("x".into()).is_retryable());
        assert!(!CoreError::Validation("x".into()).is_retryable());
    }
}
