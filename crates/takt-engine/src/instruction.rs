use takt_types::Movement;

use crate::config::Language;

/// Per-call material InstructionBuilder doesn't already get from `Movement` itself.
pub struct InstructionContext<'a> {
    pub task: &'a str,
    pub previous_response: Option<&'a str>,
    pub user_inputs: &'a [String],
    pub language: Language,
    pub matched_rule_appendix: Option<&'a str>,
    /// Set only while running Phase 2; tells the agent not to write report files yet during
    /// Phase 1.
    pub report_header_pending: bool,
}

struct Headers {
    task: &'static str,
    persona: &'static str,
    policy: &'static str,
    knowledge: &'static str,
    previous_response: &'static str,
    rules: &'static str,
    user_inputs: &'static str,
    quality_gates: &'static str,
    report_header: &'static str,
}

const EN: Headers = Headers {
    task: "## Task",
    persona: "## Persona",
    policy: "## Policy",
    knowledge: "## Knowledge",
    previous_response: "## Previous response",
    rules: "## Decide the next step",
    user_inputs: "## User input",
    quality_gates: "## Quality gates",
    report_header: "## Report files",
};

const JA: Headers = Headers {
    task: "## タスク",
    persona: "## ペルソナ",
    policy: "## ポリシー",
    knowledge: "## ナレッジ",
    previous_response: "## 直前の出力",
    rules: "## 次のステップを決定してください",
    user_inputs: "## ユーザー入力",
    quality_gates: "## 品質ゲート",
    report_header: "## レポートファイル",
};

/// Composes the Phase 1 prompt from ordered sections; missing sections are skipped.
/// Pure: takes a `Movement` and context, returns text.
pub struct InstructionBuilder;

impl InstructionBuilder {
    pub fn build(movement: &Movement, ctx: &InstructionContext<'_>) -> String {
        let headers = match ctx.language {
            Language::En => &EN,
            Language::Ja => &JA,
        };
        let mut sections = Vec::new();

        sections.push(format!("{}\n{}", headers.task, ctx.task));

        let persona_text = movement.persona_path.as_deref().or(movement.persona_spec.as_deref());
        if let Some(persona) = persona_text {
            sections.push(format!("{}\n{}", headers.persona, persona));
        }

        if !movement.policy_contents.is_empty() {
            sections.push(format!("{}\n{}", headers.policy, movement.policy_contents.join("\n\n")));
        }

        if !movement.knowledge_contents.is_empty() {
            sections.push(format!(
                "{}\n{}",
                headers.knowledge,
                movement.knowledge_contents.join("\n---\n")
            ));
        }

        if movement.pass_previous_response {
            if let Some(previous) = ctx.previous_response {
                sections.push(format!("{}\n{}", headers.previous_response, previous));
            }
        }

        if !movement.rules.is_empty() {
            let enumerated = movement
                .rules
                .iter()
                .enumerate()
                .map(|(index, rule)| format!("{}. {}", index + 1, rule.condition))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("{}\n{}", headers.rules, enumerated));
        }

        if !ctx.user_inputs.is_empty() {
            sections.push(format!("{}\n{}", headers.user_inputs, ctx.user_inputs.join("\n")));
        }

        if !movement.quality_gates.is_empty() {
            sections.push(format!("{}\n{}", headers.quality_gates, movement.quality_gates.join("\n")));
        }

        if !movement.output_contracts.is_empty() && ctx.report_header_pending {
            let names = movement
                .output_contracts
                .iter()
                .map(|contract| contract.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            sections.push(format!(
                "{}\nThis movement owns report files ({names}); do not write them yet.",
                headers.report_header
            ));
        }

        if let Some(appendix) = ctx.matched_rule_appendix {
            sections.push(appendix.to_string());
        }

        sections.join("\n\n")
    }
}
