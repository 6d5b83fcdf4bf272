use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use takt_providers::{AgentRegistry, StreamSink};
use takt_types::{AgentResponse, AgentStatus, Movement, SessionKey};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Language;
use crate::executor::{ExecutionContext, MovementExecutor};
use crate::phase::{PhaseContext, PhaseOutcome};
use crate::rules::{RuleEvaluator, RuleMatch};

pub struct ParallelContext<'a> {
    pub cwd: PathBuf,
    pub report_dir: PathBuf,
    pub language: Language,
    pub task: &'a str,
    pub abort_signal: CancellationToken,
    pub session_snapshot: HashMap<String, String>,
    pub stream_sink: Option<StreamSink>,
}

pub struct ParallelRunResult {
    /// Declaration order, independent of completion order.
    pub child_responses: Vec<(String, AgentResponse)>,
    /// Same order as `child_responses`; each child's own three-phase `PhaseOutcome`s, so the
    /// engine can log per-phase NDJSON records for parallel children too.
    pub child_phase_outcomes: Vec<(String, Vec<PhaseOutcome>)>,
    pub child_session_updates: Vec<(SessionKey, String)>,
    pub parent_rule_match: Option<RuleMatch>,
    pub parent_content: String,
}

/// Raised when every child of a parallel movement errored; the engine aborts the whole piece
/// with `all_parallel_failed`.
pub struct AllParallelFailed;

/// Fans out a parallel movement's children, aggregates their outputs, and evaluates the
/// parent's aggregate rules. One call per parallel movement execution.
pub struct ParallelRunner;

impl ParallelRunner {
    pub async fn run(
        movement: &Movement,
        registry: &AgentRegistry,
        rule_evaluator: &RuleEvaluator,
        ctx: ParallelContext<'_>,
    ) -> Result<ParallelRunResult, AllParallelFailed> {
        let children = movement
            .parallel
            .as_ref()
            .expect("run is only called on movements with parallel children")
            .clone();

        let mut join_set: JoinSet<(usize, String, AgentResponse, Vec<PhaseOutcome>, Option<(SessionKey, String)>)> =
            JoinSet::new();

        for (index, child) in children.iter().enumerate() {
            let child = child.clone();
            let provider_name = child.provider.clone().unwrap_or_else(|| "mock".to_string());
            let agent = registry.select(Some(&provider_name)).ok();
            let rule_evaluator_stub = rule_evaluator.share();
            let cwd = ctx.cwd.clone();
            let report_dir = ctx.report_dir.clone();
            let language = ctx.language;
            let abort_signal = ctx.abort_signal.clone();
            let task = ctx.task.to_string();
            let session_key = SessionKey::new(child.persona_display_name(), provider_name.clone());
            let cached_session_id = ctx.session_snapshot.get(&session_key.to_string()).cloned();
            let stream_sink = ctx.stream_sink.clone().map(|sink| -> StreamSink {
                let child_name = child.name.clone();
                Arc::new(move |line: &str| sink(&format!("[{child_name}] {line}")))
            });

            join_set.spawn(async move {
                let Some(agent) = agent else {
                    return (
                        index,
                        child.name.clone(),
                        AgentResponse {
                            persona_display_name: child.persona_display_name().to_string(),
                            status: AgentStatus::Error,
                            content: String::new(),
                            timestamp: Utc::now(),
                            session_id: None,
                            error: Some(format!("no agent registered for provider '{provider_name}'")),
                            matched_rule_index: None,
                            matched_rule_method: None,
                        },
                        Vec::new(),
                        None,
                    );
                };

                let phase_ctx = PhaseContext {
                    cwd,
                    report_dir,
                    language,
                    permission_mode: child.permission_mode,
                    abort_signal,
                };

                let result = MovementExecutor::execute(
                    &child,
                    agent.as_ref(),
                    &rule_evaluator_stub,
                    ExecutionContext {
                        phase_ctx,
                        task: &task,
                        previous_response: None,
                        user_inputs: &[],
                        matched_rule_appendix: None,
                        cached_session_id,
                        on_stream: stream_sink,
                    },
                )
                .await;

                let session_update = result
                    .session_id
                    .clone()
                    .map(|sid| (session_key.clone(), sid));
                (index, child.name.clone(), result.response, result.phase_outcomes, session_update)
            });
        }

        let mut child_responses: Vec<Option<(String, AgentResponse)>> = vec![None; children.len()];
        let mut child_phase_outcomes: Vec<Option<(String, Vec<PhaseOutcome>)>> = vec![None; children.len()];
        let mut child_session_updates = Vec::new();

        while let Some(joined) = join_set.join_next().await {
            let (index, name, response, phase_outcomes, session_update) =
                joined.expect("child task does not panic");
            child_responses[index] = Some((name.clone(), response));
            child_phase_outcomes[index] = Some((name, phase_outcomes));
            if let Some(update) = session_update {
                child_session_updates.push(update);
            }
        }

        let child_responses: Vec<(String, AgentResponse)> = child_responses.into_iter().flatten().collect();
        let child_phase_outcomes: Vec<(String, Vec<PhaseOutcome>)> =
            child_phase_outcomes.into_iter().flatten().collect();

        if child_responses.iter().all(|(_, response)| response.is_error()) {
            return Err(AllParallelFailed);
        }

        let parent_content = child_responses
            .iter()
            .map(|(name, response)| format!("## {name}\n{}", response.content))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");

        let aggregate_inputs: Vec<(String, String)> = child_responses
            .iter()
            .map(|(name, response)| (name.clone(), response.content.clone()))
            .collect();
        let parent_rule_match = rule_evaluator.evaluate_aggregate(&movement.rules, &aggregate_inputs);

        Ok(ParallelRunResult {
            child_responses,
            child_phase_outcomes,
            child_session_updates,
            parent_rule_match,
            parent_content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use takt_providers::{Agent, MockAgent};
    use takt_types::{PermissionMode, Rule, RuleKind, SessionMode};

    fn child(name: &str, script: Vec<takt_providers::AgentOutcome>) -> (Movement, StdArc<dyn Agent>) {
        let movement = Movement {
            name: name.to_string(),
            persona_spec: Some(name.to_string()),
            persona_path: None,
            policy_contents: Vec::new(),
            knowledge_contents: Vec::new(),
            instruction_template: String::new(),
            rules: Vec::new(),
            output_contracts: Vec::new(),
            quality_gates: Vec::new(),
            pass_previous_response: false,
            session: SessionMode::Continue,
            edit: false,
            permission_mode: PermissionMode::Readonly,
            provider: Some("mock".to_string()),
            model: None,
            parallel: None,
        };
        (movement, StdArc::new(MockAgent::new("mock", script)))
    }

    #[tokio::test]
    async fn aggregates_children_in_declared_order_and_evaluates_parent_rules() {
        let dir = tempfile::tempdir().unwrap();
        let (arch, _arch_agent) = child("arch-review", vec![takt_providers::AgentOutcome::done("approved")]);
        let (qa, _qa_agent) = child("qa-review", vec![takt_providers::AgentOutcome::done("needs_fix")]);

        let registry = AgentRegistry::new(
            vec![StdArc::new(MockAgent::new(
                "mock",
                vec![
                    takt_providers::AgentOutcome::done("approved"),
                    takt_providers::AgentOutcome::done("needs_fix"),
                ],
            )) as StdArc<dyn Agent>],
            None,
        );

        let parent = Movement {
            name: "reviewers".to_string(),
            persona_spec: None,
            persona_path: None,
            policy_contents: Vec::new(),
            knowledge_contents: Vec::new(),
            instruction_template: String::new(),
            rules: vec![
                Rule { condition: "approved".to_string(), next: None, kind: RuleKind::AggregateAll, appendix: None },
                Rule { condition: "needs_fix".to_string(), next: None, kind: RuleKind::AggregateAny, appendix: None },
            ],
            output_contracts: Vec::new(),
            quality_gates: Vec::new(),
            pass_previous_response: false,
            session: SessionMode::Continue,
            edit: false,
            permission_mode: PermissionMode::Readonly,
            provider: None,
            model: None,
            parallel: Some(vec![arch, qa]),
        };

        let evaluator = RuleEvaluator::with_defaults(StdArc::new(crate::rules::NullAiJudge));
        let result = ParallelRunner::run(
            &parent,
            &registry,
            &evaluator,
            ParallelContext {
                cwd: dir.path().to_path_buf(),
                report_dir: dir.path().to_path_buf(),
                language: Language::En,
                task: "review",
                abort_signal: CancellationToken::new(),
                session_snapshot: HashMap::new(),
                stream_sink: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(result.child_responses[0].0, "arch-review");
        assert_eq!(result.child_responses[1].0, "qa-review");
        let rule_match = result.parent_rule_match.unwrap();
        assert_eq!(rule_match.index, 1);
    }

    #[tokio::test]
    async fn all_children_erroring_is_reported_as_all_parallel_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (arch, _) = child("arch-review", vec![]);
        let (qa, _) = child("qa-review", vec![]);
        let registry = AgentRegistry::new(
            vec![StdArc::new(MockAgent::new("mock", vec![])) as StdArc<dyn Agent>],
            None,
        );
        let parent = Movement {
            name: "reviewers".to_string(),
            persona_spec: None,
            persona_path: None,
            policy_contents: Vec::new(),
            knowledge_contents: Vec::new(),
            instruction_template: String::new(),
            rules: Vec::new(),
            output_contracts: Vec::new(),
            quality_gates: Vec::new(),
            pass_previous_response: false,
            session: SessionMode::Continue,
            edit: false,
            permission_mode: PermissionMode::Readonly,
            provider: None,
            model: None,
            parallel: Some(vec![arch, qa]),
        };
        let evaluator = RuleEvaluator::with_defaults(StdArc::new(crate::rules::NullAiJudge));
        let result = ParallelRunner::run(
            &parent,
            &registry,
            &evaluator,
            ParallelContext {
                cwd: dir.path().to_path_buf(),
                report_dir: dir.path().to_path_buf(),
                language: Language::En,
                task: "review",
                abort_signal: CancellationToken::new(),
                session_snapshot: HashMap::new(),
                stream_sink: None,
            },
        )
        .await;
        assert!(result.is_err());
    }
}
