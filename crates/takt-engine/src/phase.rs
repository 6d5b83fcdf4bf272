use std::path::PathBuf;

use takt_types::Movement;
use takt_providers::{Agent, CallOptions};
use tokio_util::sync::CancellationToken;

use crate::config::Language;
use crate::rules::{parse_structured_output, RuleEvaluator, RuleMatch};
use crate::session_log::PhaseName;
use takt_types::{AgentStatus, MatchMethod, PermissionMode};

pub struct PhaseContext {
    pub cwd: PathBuf,
    pub report_dir: PathBuf,
    pub language: Language,
    pub permission_mode: PermissionMode,
    pub abort_signal: CancellationToken,
}

/// One phase's outcome as the engine needs to log it.
pub struct PhaseOutcome {
    pub phase: u8,
    pub phase_name: PhaseName,
    pub instruction: String,
    pub status: String,
    pub content: Option<String>,
    pub error: Option<String>,
}

pub struct ReportPhaseResult {
    pub files: Vec<(String, String)>,
    pub outcomes: Vec<PhaseOutcome>,
}

/// Runs the report phase (§4.2 Phase 2) and the judge phase (§4.2 Phase 3). Stateless aside
/// from its collaborators; one instance serves the whole engine.
pub struct PhaseRunner;

impl PhaseRunner {
    pub fn needs_judgment(movement: &Movement) -> bool {
        !movement.rules.is_empty()
    }

    /// For each declared report contract: ask the agent (same session) to write
    /// `{reportDir}/{name}`, then verify presence on disk and read it back.
    pub async fn run_report_phase(
        movement: &Movement,
        agent: &dyn Agent,
        session_id: Option<&str>,
        ctx: &PhaseContext,
    ) -> ReportPhaseResult {
        let mut files = Vec::new();
        let mut outcomes = Vec::new();

        let mut contracts: Vec<_> = movement.output_contracts.iter().collect();
        contracts.sort_by_key(|c| c.order.unwrap_or(u32::MAX));

        for contract in contracts {
            let target = ctx.report_dir.join(&contract.name);
            let order_prefix = contract
                .order
                .map(|order| format!("(order {order}) "))
                .unwrap_or_default();
            let format_fragment = contract.format.as_deref().unwrap_or("plain text");
            let instruction = format!(
                "{order_prefix}Write the file `{}` using this format: {format_fragment}",
                target.display()
            );

            let outcome = agent
                .call(
                    &instruction,
                    CallOptions {
                        session_id: session_id.map(str::to_string),
                        ..CallOptions::new(ctx.cwd.clone(), ctx.permission_mode, ctx.abort_signal.clone())
                    },
                )
                .await;

            let (status, content, error) = if outcome.status == AgentStatus::Error {
                ("error".to_string(), None, outcome.error.clone())
            } else if target.exists() {
                let content = std::fs::read_to_string(&target).ok();
                files.push((contract.name.clone(), content.clone().unwrap_or_default()));
                ("done".to_string(), content, None)
            } else {
                (
                    "error".to_string(),
                    None,
                    Some(format!("report file '{}' was not written", contract.name)),
                )
            };

            outcomes.push(PhaseOutcome {
                phase: 2,
                phase_name: PhaseName::Report,
                instruction,
                status,
                content,
                error,
            });
        }

        ReportPhaseResult { files, outcomes }
    }

    /// Two-call judge cascade (structured output, then free-form tag), falling through to the
    /// shared `RuleEvaluator` when both fail.
    pub async fn run_judgment_phase(
        movement: &Movement,
        agent: &dyn Agent,
        rule_evaluator: &RuleEvaluator,
        phase1_content: &str,
        judge_source: &str,
        session_id: Option<&str>,
        ctx: &PhaseContext,
    ) -> (Option<RuleMatch>, Vec<PhaseOutcome>) {
        let mut outcomes = Vec::new();

        let conditions = movement
            .rules
            .iter()
            .enumerate()
            .map(|(i, rule)| format!("{}. {}", i + 1, rule.condition))
            .collect::<Vec<_>>()
            .join("\n");

        let structured_instruction = format!(
            "Given this output:\n{judge_source}\n\nWhich numbered condition applies?\n{conditions}\n\nRespond as JSON: {{\"step\": <1..{}>, \"reason\": string}}",
            movement.rules.len()
        );
        let structured_outcome = agent
            .call(
                &structured_instruction,
                CallOptions {
                    session_id: session_id.map(str::to_string),
                    output_schema: Some(serde_json::json!({
                        "type": "object",
                        "properties": {"step": {"type": "integer"}, "reason": {"type": "string"}},
                        "required": ["step"],
                    })),
                    ..CallOptions::new(ctx.cwd.clone(), ctx.permission_mode, ctx.abort_signal.clone())
                },
            )
            .await;

        let mut structured_status = "done".to_string();
        if structured_outcome.status != AgentStatus::Error {
            if let Some(parsed) = parse_structured_output(&structured_outcome.content) {
                if parsed.step >= 1 && (parsed.step as usize) <= movement.rules.len() {
                    outcomes.push(PhaseOutcome {
                        phase: 3,
                        phase_name: PhaseName::Judge,
                        instruction: structured_instruction,
                        status: structured_status,
                        content: Some(structured_outcome.content.clone()),
                        error: None,
                    });
                    return (
                        Some(RuleMatch {
                            index: parsed.step as usize - 1,
                            method: MatchMethod::StructuredOutput,
                        }),
                        outcomes,
                    );
                }
            }
        } else {
            structured_status = "error".to_string();
        }
        outcomes.push(PhaseOutcome {
            phase: 3,
            phase_name: PhaseName::Judge,
            instruction: structured_instruction,
            status: structured_status,
            content: Some(structured_outcome.content.clone()),
            error: structured_outcome.error.clone(),
        });

        let tag_instruction = format!(
            "Given this output:\n{judge_source}\n\nReply with exactly one tag: [{}:N] where N is the matching condition number.\n{conditions}",
            movement.name.to_ascii_uppercase()
        );
        let tag_outcome = agent
            .call(
                &tag_instruction,
                CallOptions {
                    session_id: session_id.map(str::to_string),
                    ..CallOptions::new(ctx.cwd.clone(), ctx.permission_mode, ctx.abort_signal.clone())
                },
            )
            .await;

        let tag_status = if tag_outcome.status == AgentStatus::Error { "error" } else { "done" };
        if tag_outcome.status != AgentStatus::Error {
            if let Some(index) = rule_evaluator.detect_tag(&tag_outcome.content, &movement.name) {
                if index < movement.rules.len() {
                    outcomes.push(PhaseOutcome {
                        phase: 3,
                        phase_name: PhaseName::Judge,
                        instruction: tag_instruction,
                        status: tag_status.to_string(),
                        content: Some(tag_outcome.content.clone()),
                        error: None,
                    });
                    return (
                        Some(RuleMatch { index, method: MatchMethod::Phase3Tag }),
                        outcomes,
                    );
                }
            }
        }
        outcomes.push(PhaseOutcome {
            phase: 3,
            phase_name: PhaseName::Judge,
            instruction: tag_instruction,
            status: tag_status.to_string(),
            content: Some(tag_outcome.content.clone()),
            error: tag_outcome.error.clone(),
        });

        let phase3_tag = if tag_outcome.status == AgentStatus::Error {
            None
        } else {
            Some(tag_outcome.content.as_str())
        };
        let fallback = rule_evaluator.evaluate(movement, phase1_content, phase3_tag).await;
        (fallback, outcomes)
    }
}

/// Builds the focused prompt for the Phase 3 judge step out of report files (if any) or the
/// Phase 1 content.
pub fn judge_source(phase1_content: &str, report_files: &[(String, String)]) -> String {
    if report_files.is_empty() {
        return phase1_content.to_string();
    }
    report_files
        .iter()
        .map(|(name, content)| format!("## {name}\n{content}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}
