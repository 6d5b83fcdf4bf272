use std::sync::Arc;

use async_trait::async_trait;
use regex::RegexBuilder;
use takt_types::{Movement, MatchMethod, Rule, RuleKind};

/// One candidate condition offered to `AiJudge`, paired with its original rule index so the
/// judge's answer can be mapped straight back.
#[derive(Debug, Clone)]
pub struct AiCondition {
    pub index: usize,
    pub text: String,
}

/// `AIJudge(content, conditions) → int`. The engine treats this as opaque;
/// implementations typically call an agent with a structured schema.
#[async_trait]
pub trait AiJudge: Send + Sync {
    async fn judge(&self, content: &str, conditions: &[AiCondition]) -> Option<usize>;
}

/// An `AiJudge` that never matches, for movements/tests with no AI-condition rules.
pub struct NullAiJudge;

#[async_trait]
impl AiJudge for NullAiJudge {
    async fn judge(&self, _content: &str, _conditions: &[AiCondition]) -> Option<usize> {
        None
    }
}

/// `DetectRuleIndex(content, movementName) → int`, pure and deterministic.
pub trait RuleIndexDetector: Send + Sync {
    fn detect(&self, content: &str, movement_name: &str) -> Option<usize>;
}

/// Scans for `[MOVEMENT:N]` tokens, case-insensitive, `N ≥ 1`, last occurrence wins.
pub struct TagRuleIndexDetector;

impl RuleIndexDetector for TagRuleIndexDetector {
    fn detect(&self, content: &str, movement_name: &str) -> Option<usize> {
        let pattern = format!(r"\[{}:(\d+)\]", regex::escape(movement_name));
        let re = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .expect("tag pattern is always valid");

        re.captures_iter(content)
            .filter_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
            .filter(|n| *n >= 1)
            .last()
            .map(|n| (n - 1) as usize)
    }
}

/// Result of the Phase 3 structured-output attempt: `{step: 1..N, reason}` recovered from
/// direct JSON, a fenced code block, or brace extraction from surrounding prose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredJudgment {
    pub step: u32,
    pub reason: String,
}

/// Tries direct JSON, then a fenced ```...``` block, then the first `{...}` span in the text.
/// Arrays and primitives are rejected; the object must carry an integer `step` and a `reason`.
pub fn parse_structured_output(content: &str) -> Option<StructuredJudgment> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(result) = try_parse_object(trimmed) {
        return Some(result);
    }

    if let Some(fenced) = extract_fenced_block(trimmed) {
        if let Some(result) = try_parse_object(&fenced) {
            return Some(result);
        }
    }

    if let Some(braces) = extract_brace_span(trimmed) {
        if let Some(result) = try_parse_object(&braces) {
            return Some(result);
        }
    }

    None
}

fn try_parse_object(text: &str) -> Option<StructuredJudgment> {
    let value: serde_json::Value = serde_json::from_str(text.trim()).ok()?;
    let object = value.as_object()?;
    let step = object.get("step")?.as_u64()? as u32;
    let reason = object
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Some(StructuredJudgment { step, reason })
}

fn extract_fenced_block(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let after_fence = after_fence.strip_prefix("json").unwrap_or(after_fence);
    let end = after_fence.find("```")?;
    Some(after_fence[..end].trim().to_string())
}

fn extract_brace_span(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(text[start..=end].to_string())
}

/// The matched rule plus which cascade stage produced it.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub index: usize,
    pub method: MatchMethod,
}

/// Five-stage cascade that maps `(movement, agent output, phase-3 tag[, child outputs])` to a
/// matched rule index. Stateless: all per-call inputs are passed explicitly.
pub struct RuleEvaluator {
    detector: Arc<dyn RuleIndexDetector>,
    ai_judge: Arc<dyn AiJudge>,
}

impl RuleEvaluator {
    pub fn new(detector: Arc<dyn RuleIndexDetector>, ai_judge: Arc<dyn AiJudge>) -> Self {
        Self { detector, ai_judge }
    }

    pub fn with_defaults(ai_judge: Arc<dyn AiJudge>) -> Self {
        Self::new(Arc::new(TagRuleIndexDetector), ai_judge)
    }

    /// Exposes the underlying tag detector directly, for callers (PhaseRunner's Phase 3 free-form
    /// tag step) that need stage-2 detection without running the full cascade.
    pub fn detect_tag(&self, content: &str, movement_name: &str) -> Option<usize> {
        self.detector.detect(content, movement_name)
    }

    /// Shares this evaluator's collaborators, e.g. so ParallelRunner can build a per-child
    /// evaluator (children evaluate their own rules independently, but against the same
    /// `AiJudge`/detector the engine was configured with) without threading a whole `Arc<Self>`.
    pub fn share(&self) -> Self {
        Self {
            detector: self.detector.clone(),
            ai_judge: self.ai_judge.clone(),
        }
    }

    /// Stage 1, parent parallel movements only. `children` is declaration order: `(name, final
    /// content)`. The first matching `all`/`any` rule wins; `all` listed earlier than `any`
    /// naturally wins ties since rule order is the tie-break.
    pub fn evaluate_aggregate(&self, rules: &[Rule], children: &[(String, String)]) -> Option<RuleMatch> {
        for (index, rule) in rules.iter().enumerate() {
            let needle = rule.condition.as_str();
            let matched = match rule.kind {
                RuleKind::AggregateAll => children.iter().all(|(_, content)| content.contains(needle)),
                RuleKind::AggregateAny => children.iter().any(|(_, content)| content.contains(needle)),
                _ => continue,
            };
            if matched {
                return Some(RuleMatch {
                    index,
                    method: MatchMethod::Aggregate,
                });
            }
        }
        None
    }

    /// Stages 2-5 for a non-parallel movement (or, after a failed aggregate stage, is never
    /// reached for a parallel movement — aggregate rules are parent-only by construction).
    pub async fn evaluate(
        &self,
        movement: &Movement,
        phase1_content: &str,
        phase3_tag: Option<&str>,
    ) -> Option<RuleMatch> {
        if movement.rules.is_empty() {
            return None;
        }

        if let Some(tag) = phase3_tag {
            if let Some(index) = self.detector.detect(tag, &movement.name) {
                if index < movement.rules.len() {
                    return Some(RuleMatch {
                        index,
                        method: MatchMethod::Phase3Tag,
                    });
                }
            }
        }

        if let Some(index) = self.detector.detect(phase1_content, &movement.name) {
            if index < movement.rules.len() {
                return Some(RuleMatch {
                    index,
                    method: MatchMethod::Phase1Tag,
                });
            }
        }

        let ai_conditions: Vec<AiCondition> = movement
            .rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.kind == RuleKind::Ai)
            .map(|(index, rule)| AiCondition {
                index,
                text: rule.condition.clone(),
            })
            .collect();
        if !ai_conditions.is_empty() {
            if let Some(matched_index) = self.ai_judge.judge(phase1_content, &ai_conditions).await {
                if let Some(condition) = ai_conditions.iter().find(|c| c.index == matched_index) {
                    return Some(RuleMatch {
                        index: condition.index,
                        method: MatchMethod::AiJudge,
                    });
                }
            }
        }

        let all_conditions: Vec<AiCondition> = movement
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| AiCondition {
                index,
                text: rule.condition.clone(),
            })
            .collect();
        if let Some(matched_index) = self.ai_judge.judge(phase1_content, &all_conditions).await {
            if matched_index < movement.rules.len() {
                return Some(RuleMatch {
                    index: matched_index,
                    method: MatchMethod::AiJudgeFallback,
                });
            }
        }

        None
    }
}
