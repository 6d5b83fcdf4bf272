use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use takt_types::{AgentStatus, PermissionMode};
use tokio_util::sync::CancellationToken;

/// A sink for streamed agent output lines. ParallelRunner wraps this per child with a
/// `[childName]` prefix before forwarding to the engine's single configured sink. Absent
/// entirely when the caller configured no sink, so providers can skip streaming setup.
pub type StreamSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Arguments to a single `Agent::call`.
pub struct CallOptions {
    pub cwd: PathBuf,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub permission_mode: PermissionMode,
    pub allowed_tools: Vec<String>,
    pub provider_options: serde_json::Value,
    pub output_schema: Option<serde_json::Value>,
    pub on_stream: Option<StreamSink>,
    pub abort_signal: CancellationToken,
}

impl CallOptions {
    pub fn new(cwd: PathBuf, permission_mode: PermissionMode, abort_signal: CancellationToken) -> Self {
        Self {
            cwd,
            session_id: None,
            model: None,
            system_prompt: None,
            permission_mode,
            allowed_tools: Vec::new(),
            provider_options: serde_json::Value::Null,
            output_schema: None,
            on_stream: None,
            abort_signal,
        }
    }
}

/// Raw result of one agent invocation, before MovementExecutor stamps it with
/// `personaDisplayName`/`timestamp` to produce a full `AgentResponse`.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub content: String,
    pub status: AgentStatus,
    pub session_id: Option<String>,
    pub error: Option<String>,
}

impl AgentOutcome {
    pub fn done(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            status: AgentStatus::Done,
            session_id: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            status: AgentStatus::Error,
            session_id: None,
            error: Some(message.into()),
        }
    }

    pub fn interrupted() -> Self {
        Self {
            content: String::new(),
            status: AgentStatus::Interrupted,
            session_id: None,
            error: Some("interrupted".to_string()),
        }
    }

    /// True for the specific "stale session id" signal, the one agent-call error
    /// MovementExecutor retries.
    pub fn is_stale_session(&self) -> bool {
        self.status == AgentStatus::Error
            && self
                .error
                .as_deref()
                .is_some_and(|e| e.contains("session") && (e.contains("invalid") || e.contains("stale")))
    }
}

/// The engine's only outward collaborator besides `DetectRuleIndex`/`AIJudge`. Implementations
/// wrap a CLI tool or SDK; the engine never constructs prompts from anything but this narrow
/// contract.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, prompt: &str, options: CallOptions) -> AgentOutcome;
}
