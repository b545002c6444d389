// =============================================================================
// LLMClient — component B
// =============================================================================

pub mod http;

use async_trait::async_trait;

use crate::error::CoreError;

/// Engine-level constants: compile-time, not configurable per trader.
pub const TEMPERATURE: f64 = 0.5;
pub const MAX_TOKENS: u32 = 2000;
pub const TIMEOUT_SECS: u64 = 120;
pub const MAX_ATTEMPTS: u32 = 3;

#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn call(&self, system_prompt: &str, user_prompt: &str) -> Result<String, CoreError>;
}

pub use http::HttpLlmClient;
