use serde::{Deserialize, Serialize};

/// A normalized piece: the engine never re-parses YAML, `@scope` references, or
/// facet/persona/policy layering. All of that has already happened by the time a
/// `PieceConfig` reaches the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PieceConfig {
    pub name: String,
    pub movements: Vec<Movement>,
    pub initial_movement: String,
    pub max_movements: u32,
    #[serde(default)]
    pub loop_monitors: Vec<LoopMonitorConfig>,
}

impl PieceConfig {
    pub fn movement(&self, name: &str) -> Option<&Movement> {
        self.movements.iter().find(|m| m.name == name)
    }

    pub fn contains_movement(&self, name: &str) -> bool {
        self.movements.iter().any(|m| m.name == name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Continue,
    Refresh,
}

impl Default for SessionMode {
    fn default() -> Self {
        SessionMode::Continue
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    Readonly,
    Edit,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportContract {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Movement {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_path: Option<String>,
    #[serde(default)]
    pub policy_contents: Vec<String>,
    #[serde(default)]
    pub knowledge_contents: Vec<String>,
    pub instruction_template: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub output_contracts: Vec<ReportContract>,
    #[serde(default)]
    pub quality_gates: Vec<String>,
    #[serde(default)]
    pub pass_previous_response: bool,
    #[serde(default)]
    pub session: SessionMode,
    #[serde(default)]
    pub edit: bool,
    #[serde(default = "default_permission_mode")]
    pub permission_mode: PermissionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<Vec<Movement>>,
}

fn default_permission_mode() -> PermissionMode {
    PermissionMode::Readonly
}

impl Movement {
    pub fn is_parallel(&self) -> bool {
        self.parallel.as_ref().is_some_and(|children| !children.is_empty())
    }

    pub fn persona_display_name(&self) -> &str {
        self.persona_spec.as_deref().unwrap_or(self.name.as_str())
    }

    pub fn needs_judgment(&self) -> bool {
        !self.rules.is_empty()
    }
}

/// The three mutually exclusive rule kinds the loader normalizes `condition` text into.
/// `ai("text")` and `all("text")` / `any("text")` are unwrapped at normalization time so the
/// engine never re-parses condition syntax at runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Plain,
    Ai,
    AggregateAll,
    AggregateAny,
}

impl RuleKind {
    pub fn is_aggregate(self) -> bool {
        matches!(self, RuleKind::AggregateAll | RuleKind::AggregateAny)
    }
}

/// Normalized transition target. Stored as a small closed enum rather than a bare string so
/// the engine can match on it exhaustively instead of comparing against the `"COMPLETE"` /
/// `"ABORT"` sentinels by hand at every call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    Movement(String),
    Complete,
    Abort,
}

impl RuleTarget {
    fn as_str(&self) -> std::borrow::Cow<'_, str> {
        match self {
            RuleTarget::Movement(name) => std::borrow::Cow::Borrowed(name.as_str()),
            RuleTarget::Complete => std::borrow::Cow::Borrowed("COMPLETE"),
            RuleTarget::Abort => std::borrow::Cow::Borrowed("ABORT"),
        }
    }
}

impl From<&str> for RuleTarget {
    fn from(value: &str) -> Self {
        match value {
            "COMPLETE" => RuleTarget::Complete,
            "ABORT" => RuleTarget::Abort,
            other => RuleTarget::Movement(other.to_string()),
        }
    }
}

impl Serialize for RuleTarget {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for RuleTarget {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(RuleTarget::from(raw.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<RuleTarget>,
    pub kind: RuleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appendix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopMonitorJudge {
    pub persona: String,
    pub instruction_template: String,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopMonitorConfig {
    pub cycle: Vec<String>,
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    pub judge: LoopMonitorJudge,
}

fn default_threshold() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_target_round_trips_through_json() {
        let target = RuleTarget::from("implement");
        let json = serde_json::to_string(&target).unwrap();
        assert_eq!(json, "\"implement\"");
        let back: RuleTarget = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RuleTarget::Movement("implement".to_string()));

        assert_eq!(RuleTarget::from("COMPLETE"), RuleTarget::Complete);
        assert_eq!(RuleTarget::from("ABORT"), RuleTarget::Abort);
    }

    #[test]
    fn movement_is_parallel_requires_nonempty_children() {
        let mut movement = Movement {
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
            parallel: None,
        };
        assert!(!movement.is_parallel());

        movement.parallel = Some(Vec::new());
        assert!(!movement.is_parallel());

        movement.parallel = Some(vec![movement.clone()]);
        assert!(movement.is_parallel());
    }
}
