pub mod config;
pub mod event;
pub mod response;
pub mod state;

pub use config::{
    LoopMonitorConfig, LoopMonitorJudge, Movement, PermissionMode, PieceConfig, ReportContract,
    Rule, RuleKind, RuleTarget, SessionMode,
};
pub use event::EngineEvent;
pub use response::{AgentResponse, AgentStatus, MatchMethod};
pub use state::{
    PieceSnapshot, PieceState, PieceStatus, SessionKey, TerminalReason, TerminalState,
    MAX_INPUT_LENGTH, MAX_USER_INPUTS,
};
