pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod instruction;
pub mod loop_monitor;
pub mod parallel;
pub mod phase;
pub mod rules;
pub mod session_log;
pub mod state_manager;

pub use config::{EngineConfig, Language};
pub use engine::{EngineHandle, IterationLimitPrompt, IterationLimitRequest, PieceEngine, PieceEngineOptions};
pub use error::EngineError;
pub use rules::{AiCondition, AiJudge, NullAiJudge, RuleIndexDetector, TagRuleIndexDetector};
