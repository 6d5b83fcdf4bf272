use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::response::{AgentStatus, MatchMethod};
use crate::state::TerminalReason;

/// One line of the NDJSON session log, plus the lifecycle events the `tracing`/observability
/// layer also cares about. Mirrors the tagged-enum shape of
/// `OrchestratorEvent`, one struct-variant per event kind, each timestamped independently
/// rather than relying on the log file's append order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EngineEvent {
    PieceStarted {
        timestamp: DateTime<Utc>,
        piece_name: String,
        initial_movement: String,
    },
    MovementStarted {
        timestamp: DateTime<Utc>,
        movement: String,
        iteration: u32,
    },
    /// Emitted once per movement, in execution order, right after its response and matched
    /// rule are known — mirrors the NDJSON `movement_complete` record without carrying the
    /// full instruction/content payload.
    MovementCompleted {
        timestamp: DateTime<Utc>,
        movement: String,
        status: AgentStatus,
        matched_rule_index: Option<usize>,
        matched_rule_method: Option<MatchMethod>,
    },
    ParallelChildStarted {
        timestamp: DateTime<Utc>,
        parent_movement: String,
        child_movement: String,
    },
    ParallelChildFinished {
        timestamp: DateTime<Utc>,
        parent_movement: String,
        child_movement: String,
        succeeded: bool,
    },
    LoopMonitorTriggered {
        timestamp: DateTime<Utc>,
        cycle: Vec<String>,
        occurrences: u32,
    },
    Transition {
        timestamp: DateTime<Utc>,
        from_movement: String,
        to_movement: String,
        iteration: u32,
    },
    PieceCompleted {
        timestamp: DateTime<Utc>,
        iteration: u32,
    },
    PieceAborted {
        timestamp: DateTime<Utc>,
        iteration: u32,
        reason: TerminalReason,
    },
}

impl EngineEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::PieceStarted { timestamp, .. }
            | EngineEvent::MovementStarted { timestamp, .. }
            | EngineEvent::MovementCompleted { timestamp, .. }
            | EngineEvent::ParallelChildStarted { timestamp, .. }
            | EngineEvent::ParallelChildFinished { timestamp, .. }
            | EngineEvent::LoopMonitorTriggered { timestamp, .. }
            | EngineEvent::Transition { timestamp, .. }
            | EngineEvent::PieceCompleted { timestamp, .. }
            | EngineEvent::PieceAborted { timestamp, .. } => *timestamp,
        }
    }
}
