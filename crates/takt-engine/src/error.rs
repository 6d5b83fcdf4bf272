/// Engine-visible error taxonomy. Every in-band outcome — agent error,
/// no-rule-matched, iteration-limit, cancellation, all-parallel-failed — is resolved as a
/// `TerminalState`, never as `Err(_)`. Only configuration problems (fail fast, before the loop
/// starts) and unrecoverable NDJSON I/O surface here.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("piece config has no movement named '{0}' (initial_movement)")]
    UnknownInitialMovement(String),

    #[error("movement '{movement}' rule {rule_index} targets unknown movement '{target}'")]
    UnknownRuleTarget {
        movement: String,
        rule_index: usize,
        target: String,
    },

    #[error("loop monitor cycle references unknown movement '{0}'")]
    UnknownLoopMonitorMovement(String),

    #[error("session log I/O error: {0}")]
    SessionLogIo(#[from] std::io::Error),

    #[error("session log serialization error: {0}")]
    SessionLogSerialization(#[from] serde_json::Error),
}
