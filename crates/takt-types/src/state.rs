use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::response::AgentResponse;

/// Bound on `PieceState.userInputs`.
pub const MAX_USER_INPUTS: usize = 20;
/// Per-entry truncation length for `PieceState.userInputs`.
pub const MAX_INPUT_LENGTH: usize = 4_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PieceStatus {
    Running,
    Completed,
    Aborted,
}

/// Why a piece left `running`. Distinct from `EngineError`: every one of these is an in-band
/// outcome the engine resolves `Run()` with, never an `Err(_)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum TerminalReason {
    RuleAbort,
    NoRuleMatched,
    IterationLimit,
    AllParallelFailed,
    UserInterrupted,
    UnknownMovement { movement: String },
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalReason::RuleAbort => write!(f, "rule_abort"),
            TerminalReason::NoRuleMatched => write!(f, "no_rule_matched"),
            TerminalReason::IterationLimit => write!(f, "iteration_limit"),
            TerminalReason::AllParallelFailed => write!(f, "all_parallel_failed"),
            TerminalReason::UserInterrupted => write!(f, "user_interrupted"),
            TerminalReason::UnknownMovement { movement } => {
                write!(f, "unknown_movement:{movement}")
            }
        }
    }
}

/// Session-id cache key: `(personaDisplayName, provider)`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKey {
    pub persona_display_name: String,
    pub provider: String,
}

impl SessionKey {
    pub fn new(persona_display_name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            persona_display_name: persona_display_name.into(),
            provider: provider.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.persona_display_name, self.provider)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PieceState {
    pub current_movement: String,
    pub iteration: u32,
    pub status: PieceStatus,
    /// Insertion order is preserved: iterating this like a `Vec` keyed by first/last write
    /// matches the spec's "iteration-order-defined" requirement for `GetPreviousOutput`.
    pub movement_outputs: Vec<(String, AgentResponse)>,
    pub last_output: Option<AgentResponse>,
    pub persona_sessions: HashMap<String, String>,
    pub movement_iterations: HashMap<String, u32>,
    pub user_inputs: Vec<String>,
    pub terminal_reason: Option<TerminalReason>,
    pub started_at: DateTime<Utc>,
}

impl PieceState {
    pub fn new(initial_movement: impl Into<String>) -> Self {
        Self {
            current_movement: initial_movement.into(),
            iteration: 0,
            status: PieceStatus::Running,
            movement_outputs: Vec::new(),
            last_output: None,
            persona_sessions: HashMap::new(),
            movement_iterations: HashMap::new(),
            user_inputs: Vec::new(),
            terminal_reason: None,
            started_at: Utc::now(),
        }
    }

    pub fn set_movement_output(&mut self, movement: &str, response: AgentResponse) {
        self.last_output = Some(response.clone());
        if let Some(entry) = self.movement_outputs.iter_mut().find(|(name, _)| name == movement) {
            entry.1 = response;
        } else {
            self.movement_outputs.push((movement.to_string(), response));
        }
    }

    pub fn movement_output(&self, movement: &str) -> Option<&AgentResponse> {
        self.movement_outputs
            .iter()
            .find(|(name, _)| name == movement)
            .map(|(_, response)| response)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalState {
    pub status: PieceStatus,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<TerminalReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<AgentResponse>,
}

/// Read-only external projection of `PieceState`, the way the reference orchestrator derives
/// `RunSnapshot` from `Run` in `Run::to_snapshot()`. Used by SessionLog's pointer files and by
/// tests that want mid-run state without reaching into engine internals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PieceSnapshot {
    pub current_movement: String,
    pub iteration: u32,
    pub status: PieceStatus,
    pub movements_completed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<TerminalReason>,
}

impl From<&PieceState> for PieceSnapshot {
    fn from(state: &PieceState) -> Self {
        Self {
            current_movement: state.current_movement.clone(),
            iteration: state.iteration,
            status: state.status,
            movements_completed: state.movement_outputs.len(),
            terminal_reason: state.terminal_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::AgentStatus;

    fn response(content: &str) -> AgentResponse {
        AgentResponse {
            persona_display_name: "planner".to_string(),
            status: AgentStatus::Done,
            content: content.to_string(),
            timestamp: Utc::now(),
            session_id: None,
            error: None,
            matched_rule_index: None,
            matched_rule_method: None,
        }
    }

    #[test]
    fn set_movement_output_preserves_insertion_order_on_update() {
        let mut state = PieceState::new("plan");
        state.set_movement_output("plan", response("first"));
        state.set_movement_output("implement", response("second"));
        state.set_movement_output("plan", response("third"));

        let names: Vec<&str> = state
            .movement_outputs
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(names, vec!["plan", "implement"]);
        assert_eq!(state.movement_output("plan").unwrap().content, "third");
        assert_eq!(state.last_output.unwrap().content, "third");
    }
}
