use chrono::Utc;
use takt_providers::{Agent, CallOptions, StreamSink};
use takt_types::{AgentResponse, AgentStatus, Movement, SessionMode};

use crate::instruction::{InstructionBuilder, InstructionContext};
use crate::phase::{judge_source, PhaseContext, PhaseOutcome, PhaseRunner};
use crate::rules::RuleEvaluator;
use crate::session_log::PhaseName;

/// Everything MovementExecutor needs about the run that isn't carried on `Movement` itself.
pub struct ExecutionContext<'a> {
    pub phase_ctx: PhaseContext,
    pub task: &'a str,
    pub previous_response: Option<&'a str>,
    pub user_inputs: &'a [String],
    pub matched_rule_appendix: Option<&'a str>,
    pub cached_session_id: Option<String>,
    pub on_stream: Option<StreamSink>,
}

pub struct ExecutionResult {
    pub response: AgentResponse,
    /// `None` only when `session == refresh` cleared it and the call never produced a new one
    /// (e.g. the call errored before a session id was ever returned).
    pub session_id: Option<String>,
    pub phase_outcomes: Vec<PhaseOutcome>,
    pub phase1_instruction: String,
}

/// Runs the three-phase protocol (execute → report → judge) for one non-parallel movement.
pub struct MovementExecutor;

impl MovementExecutor {
    pub async fn execute(
        movement: &Movement,
        agent: &dyn Agent,
        rule_evaluator: &RuleEvaluator,
        ctx: ExecutionContext<'_>,
    ) -> ExecutionResult {
        let mut phase_outcomes = Vec::new();

        let session_id = match movement.session {
            SessionMode::Refresh => None,
            SessionMode::Continue => ctx.cached_session_id.clone(),
        };

        let instruction = InstructionBuilder::build(
            movement,
            &InstructionContext {
                task: ctx.task,
                previous_response: ctx.previous_response,
                user_inputs: ctx.user_inputs,
                language: ctx.phase_ctx.language,
                matched_rule_appendix: ctx.matched_rule_appendix,
                report_header_pending: !movement.output_contracts.is_empty(),
            },
        );

        let allowed_tools = if movement.edit { vec!["edit".to_string()] } else { Vec::new() };
        let call_options = |session_id: Option<String>| CallOptions {
            session_id,
            model: movement.model.clone(),
            allowed_tools: allowed_tools.clone(),
            on_stream: ctx.on_stream.clone(),
            ..CallOptions::new(
                ctx.phase_ctx.cwd.clone(),
                movement.permission_mode,
                ctx.phase_ctx.abort_signal.clone(),
            )
        };

        let mut outcome = agent.call(&instruction, call_options(session_id.clone())).await;
        let mut effective_session_id = outcome.session_id.clone().or(session_id.clone());

        // Retry exactly once, without a session id, on the specific "stale session" signal.
        if outcome.is_stale_session() {
            outcome = agent.call(&instruction, call_options(None)).await;
            effective_session_id = outcome.session_id.clone();
        }

        phase_outcomes.push(PhaseOutcome {
            phase: 1,
            phase_name: PhaseName::Execute,
            instruction: instruction.clone(),
            status: status_label(outcome.status),
            content: Some(outcome.content.clone()),
            error: outcome.error.clone(),
        });

        if outcome.status == AgentStatus::Error {
            // Phase 1 failed: no report/judge calls. The rule cascade still runs, over the
            // error content, so an error can still route the piece.
            let error_content = outcome.error.clone().unwrap_or_default();
            let rule_match = rule_evaluator.evaluate(movement, &error_content, None).await;
            let response = AgentResponse {
                persona_display_name: movement.persona_display_name().to_string(),
                status: outcome.status,
                content: error_content,
                timestamp: Utc::now(),
                session_id: effective_session_id.clone(),
                error: outcome.error.clone(),
                matched_rule_index: rule_match.as_ref().map(|m| m.index),
                matched_rule_method: rule_match.as_ref().map(|m| m.method),
            };
            return ExecutionResult {
                response,
                session_id: effective_session_id,
                phase_outcomes,
                phase1_instruction: instruction,
            };
        }

        let mut report_files = Vec::new();
        if !movement.output_contracts.is_empty() {
            let report = PhaseRunner::run_report_phase(
                movement,
                agent,
                effective_session_id.as_deref(),
                &ctx.phase_ctx,
            )
            .await;
            report_files = report.files;
            phase_outcomes.extend(report.outcomes);
        }

        let rule_match = if PhaseRunner::needs_judgment(movement) {
            let source = judge_source(&outcome.content, &report_files);
            let (rule_match, judge_outcomes) = PhaseRunner::run_judgment_phase(
                movement,
                agent,
                rule_evaluator,
                &outcome.content,
                &source,
                effective_session_id.as_deref(),
                &ctx.phase_ctx,
            )
            .await;
            phase_outcomes.extend(judge_outcomes);
            rule_match
        } else {
            None
        };

        let response = AgentResponse {
            persona_display_name: movement.persona_display_name().to_string(),
            status: outcome.status,
            content: outcome.content.clone(),
            timestamp: Utc::now(),
            session_id: effective_session_id.clone(),
            error: None,
            matched_rule_index: rule_match.as_ref().map(|m| m.index),
            matched_rule_method: rule_match.as_ref().map(|m| m.method),
        };

        ExecutionResult {
            response,
            session_id: effective_session_id,
            phase_outcomes,
            phase1_instruction: instruction,
        }
    }
}

pub(crate) fn status_label(status: AgentStatus) -> String {
    match status {
        AgentStatus::Done => "done".to_string(),
        AgentStatus::Blocked => "blocked".to_string(),
        AgentStatus::Error => "error".to_string(),
        AgentStatus::Interrupted => "interrupted".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Language;
    use crate::rules::NullAiJudge;
    use std::sync::Arc;
    use takt_providers::{AgentOutcome, MockAgent};
    use takt_types::{PermissionMode, Rule, RuleKind};
    use tokio_util::sync::CancellationToken;

    fn movement() -> Movement {
        Movement {
            name: "plan".to_string(),
            persona_spec: Some("planner".to_string()),
            persona_path: None,
            policy_contents: Vec::new(),
            knowledge_contents: Vec::new(),
            instruction_template: String::new(),
            rules: vec![
                Rule { condition: "Clear".to_string(), next: None, kind: RuleKind::Plain, appendix: None },
                Rule { condition: "Unclear".to_string(), next: None, kind: RuleKind::Plain, appendix: None },
            ],
            output_contracts: Vec::new(),
            quality_gates: Vec::new(),
            pass_previous_response: false,
            session: SessionMode::Continue,
            edit: false,
            permission_mode: PermissionMode::Readonly,
            provider: None,
            model: None,
            parallel: None,
        }
    }

    fn ctx(dir: &std::path::Path) -> ExecutionContext<'static> {
        ExecutionContext {
            phase_ctx: PhaseContext {
                cwd: dir.to_path_buf(),
                report_dir: dir.to_path_buf(),
                language: Language::En,
                permission_mode: PermissionMode::Readonly,
                abort_signal: CancellationToken::new(),
            },
            task: "ship it",
            previous_response: None,
            user_inputs: &[],
            matched_rule_appendix: None,
            cached_session_id: None,
            on_stream: None,
        }
    }

    #[tokio::test]
    async fn phase1_tag_is_matched_when_movement_has_no_output_contracts() {
        let dir = tempfile::tempdir().unwrap();
        let agent = MockAgent::new("mock", vec![AgentOutcome::done("[PLAN:1] Clear")]);
        let evaluator = RuleEvaluator::with_defaults(Arc::new(NullAiJudge));

        let result = MovementExecutor::execute(&movement(), &agent, &evaluator, ctx(dir.path())).await;
        assert_eq!(result.response.matched_rule_index, Some(0));
        assert_eq!(result.response.content, "[PLAN:1] Clear");
    }

    #[tokio::test]
    async fn stale_session_triggers_exactly_one_retry_without_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let agent = MockAgent::new(
            "mock",
            vec![
                AgentOutcome::error("session invalid, please retry"),
                AgentOutcome::done("[PLAN:1] Clear"),
            ],
        );
        let evaluator = RuleEvaluator::with_defaults(Arc::new(NullAiJudge));
        let mut context = ctx(dir.path());
        context.cached_session_id = Some("stale-session".to_string());

        let result = MovementExecutor::execute(&movement(), &agent, &evaluator, context).await;
        assert_eq!(agent.calls().len(), 2);
        assert_eq!(result.response.status, AgentStatus::Done);
        assert_eq!(result.response.content, "[PLAN:1] Clear");
    }

    #[tokio::test]
    async fn non_stale_error_still_runs_rule_cascade_over_error_content() {
        let dir = tempfile::tempdir().unwrap();
        let agent = MockAgent::new("mock", vec![AgentOutcome::error("boom")]);
        let evaluator = RuleEvaluator::with_defaults(Arc::new(NullAiJudge));

        let result = MovementExecutor::execute(&movement(), &agent, &evaluator, ctx(dir.path())).await;
        assert_eq!(agent.calls().len(), 1);
        assert_eq!(result.response.status, AgentStatus::Error);
        assert_eq!(result.response.matched_rule_index, None);
    }
}
