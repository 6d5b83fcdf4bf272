use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::agent::{Agent, AgentOutcome, CallOptions};

/// A scripted agent for tests and the demo binary: each call pops the next queued outcome.
/// Grounded on the reference codebase's pattern of hand-rolled fakes for the `Provider` trait
/// rather than a mocking framework.
pub struct MockAgent {
    name: String,
    script: Mutex<VecDeque<AgentOutcome>>,
    calls: Mutex<Vec<String>>,
}

impl MockAgent {
    pub fn new(name: impl Into<String>, script: Vec<AgentOutcome>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received so far, in call order. Useful for asserting InstructionBuilder output
    /// without re-deriving it from engine internals.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, prompt: &str, _options: CallOptions) -> AgentOutcome {
        self.calls.lock().unwrap().push(prompt.to_string());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| AgentOutcome::error("mock agent script exhausted"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_agent_replays_script_in_order_and_records_prompts() {
        let agent = MockAgent::new(
            "mock",
            vec![AgentOutcome::done("first"), AgentOutcome::done("second")],
        );
        let token = tokio_util::sync::CancellationToken::new();
        let out1 = agent
            .call(
                "prompt-a",
                CallOptions::new(
                    std::env::temp_dir(),
                    takt_types::PermissionMode::Readonly,
                    token.clone(),
                ),
            )
            .await;
        let out2 = agent
            .call(
                "prompt-b",
                CallOptions::new(std::env::temp_dir(), takt_types::PermissionMode::Readonly, token),
            )
            .await;

        assert_eq!(out1.content, "first");
        assert_eq!(out2.content, "second");
        assert_eq!(agent.calls(), vec!["prompt-a", "prompt-b"]);
    }

    #[tokio::test]
    async fn mock_agent_errors_once_script_exhausted() {
        let agent = MockAgent::new("mock", vec![]);
        let token = tokio_util::sync::CancellationToken::new();
        let out = agent
            .call(
                "prompt",
                CallOptions::new(std::env::temp_dir(), takt_types::PermissionMode::Readonly, token),
            )
            .await;
        assert!(out.error.is_some());
    }
}
