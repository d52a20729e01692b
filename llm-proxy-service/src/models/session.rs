//! Session and usage models for token accounting.

use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;

/// Token counters reported by a single upstream exchange.
///
/// Missing and `null` fields deserialize as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, deserialize_with = "zero_if_null")]
    pub prompt_tokens: u32,
    #[serde(default, deserialize_with = "zero_if_null")]
    pub completion_tokens: u32,
    #[serde(default, deserialize_with = "zero_if_null")]
    pub total_tokens: u32,
}

fn zero_if_null<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u32>::deserialize(deserializer)?.unwrap_or(0))
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32, total_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }
}

/// Cumulative token usage for one session id.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    /// Sum of the reported totals, not recomputed from the other two.
    pub total_tokens: i64,
    /// Number of successfully recorded usages.
    pub request_count: i64,
}

impl Session {
    /// A zero-valued session.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            total_prompt_tokens: 0,
            total_completion_tokens: 0,
            total_tokens: 0,
            request_count: 0,
        }
    }

    /// Fold one usage measurement into the totals.
    pub fn add_usage(&mut self, usage: Usage) {
        self.total_prompt_tokens += i64::from(usage.prompt_tokens);
        self.total_completion_tokens += i64::from(usage.completion_tokens);
        self.total_tokens += i64::from(usage.total_tokens);
        self.request_count += 1;
    }
}
