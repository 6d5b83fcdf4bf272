use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Done,
    Blocked,
    Error,
    Interrupted,
}

/// Which cascade stage or judge-phase mechanism produced a match. Carried alongside the
/// response so NDJSON replay and tests can assert on it without re-deriving it from raw
/// content.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    StructuredOutput,
    Phase3Tag,
    Phase1Tag,
    Aggregate,
    AiJudge,
    AiJudgeFallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub persona_display_name: String,
    pub status: AgentStatus,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule_method: Option<MatchMethod>,
}

impl AgentResponse {
    pub fn is_error(&self) -> bool {
        self.status == AgentStatus::Error
    }
}
