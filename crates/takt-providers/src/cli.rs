use std::process::Stdio;

use async_trait::async_trait;
use takt_types::AgentStatus;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::agent::{Agent, AgentOutcome, CallOptions};

/// Wraps a CLI agent tool (`claude`, `codex`, ...) as a subprocess: the prompt is written to
/// stdin, stdout lines are forwarded to `on_stream` and accumulated as the final content.
/// Grounded on `OrchestratorEngine::call_agent`'s streaming-accumulation loop, adapted from a
/// sidecar IPC channel to a plain child process.
pub struct CliAgent {
    name: String,
    binary: String,
    extra_args: Vec<String>,
}

impl CliAgent {
    pub fn new(name: impl Into<String>, binary: impl Into<String>, extra_args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
            extra_args,
        }
    }

    pub fn claude() -> Self {
        Self::new("claude", "claude", vec!["--print".to_string()])
    }

    pub fn codex() -> Self {
        Self::new("codex", "codex", vec!["exec".to_string()])
    }

    fn build_command(&self, options: &CallOptions) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(&self.extra_args)
            .current_dir(&options.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(session_id) = &options.session_id {
            command.arg("--session-id").arg(session_id);
        }
        if let Some(model) = &options.model {
            command.arg("--model").arg(model);
        }
        for tool in &options.allowed_tools {
            command.arg("--allow-tool").arg(tool);
        }
        command
    }
}

#[async_trait]
impl Agent for CliAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, prompt: &str, options: CallOptions) -> AgentOutcome {
        let mut command = self.build_command(&options);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => return AgentOutcome::error(format!("failed to spawn {}: {err}", self.binary)),
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                return AgentOutcome::error(format!("failed to write prompt: {err}"));
            }
            drop(stdin);
        }

        let stdout = child.stdout.take().expect("stdout piped");
        let mut lines = BufReader::new(stdout).lines();
        let mut content = String::new();

        loop {
            tokio::select! {
                biased;
                _ = options.abort_signal.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return AgentOutcome::interrupted();
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(sink) = &options.on_stream {
                                sink(&line);
                            }
                            if !content.is_empty() {
                                content.push('\n');
                            }
                            content.push_str(&line);
                        }
                        Ok(None) => break,
                        Err(err) => return AgentOutcome::error(format!("stdout read error: {err}")),
                    }
                }
            }
        }

        let status = match child.wait().await {
            Ok(status) => status,
            Err(err) => return AgentOutcome::error(format!("child wait failed: {err}")),
        };

        if status.success() {
            AgentOutcome {
                content,
                status: AgentStatus::Done,
                session_id: options.session_id.clone(),
                error: None,
            }
        } else {
            let stderr = read_stderr(&mut child).await;
            if stderr.contains("session") && (stderr.contains("invalid") || stderr.contains("expired")) {
                AgentOutcome {
                    content: String::new(),
                    status: AgentStatus::Error,
                    session_id: None,
                    error: Some(format!("session invalid: {stderr}")),
                }
            } else {
                AgentOutcome::error(format!("{} exited with {status}: {stderr}", self.binary))
            }
        }
    }
}

async fn read_stderr(child: &mut tokio::process::Child) -> String {
    use tokio::io::AsyncReadExt;
    let mut buf = String::new();
    if let Some(stderr) = child.stderr.as_mut() {
        let _ = stderr.read_to_string(&mut buf).await;
    }
    buf
}
