use serde::{Deserialize, Serialize};

/// Selects InstructionBuilder's fixed header strings. Not a runtime i18n framework — just two
/// constant tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    En,
    Ja,
}

impl Default for Language {
    fn default() -> Self {
        Language::En
    }
}

/// The flat, already-layered configuration surface the engine consumes. Project/user/builtin
/// overlay resolution is a loader concern; by the time it reaches here
/// it is one resolved value per key, as `OrchestratorConfig` resolves its flags before the
/// engine ever sees them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub language: Language,
    pub default_provider: Option<String>,
    pub default_model: Option<String>,
    pub concurrency: usize,
    pub minimal_output: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            language: Language::default(),
            default_provider: None,
            default_model: None,
            concurrency: 4,
            minimal_output: false,
        }
    }
}

impl EngineConfig {
    /// Applies `TAKT_<UPPER_SNAKE_PATH>` environment overrides on top of defaults/file values,
    /// grounded on `OrchestratorConfig::strict_contract_flag_default`'s single-env-var-read
    /// pattern, generalized to every recognised option path.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(value) = env_override("language") {
            self.language = match value.to_ascii_lowercase().as_str() {
                "ja" => Language::Ja,
                _ => Language::En,
            };
        }
        if let Some(value) = env_override("provider") {
            self.default_provider = Some(value);
        }
        if let Some(value) = env_override("model") {
            self.default_model = Some(value);
        }
        if let Some(value) = env_override("concurrency") {
            if let Ok(parsed) = value.parse::<usize>() {
                self.concurrency = parsed.clamp(1, 10);
            }
        }
        if let Some(value) = env_override("minimal_output") {
            self.minimal_output = coerce_bool(&value);
        }
        self
    }
}

fn env_override(dotted_path: &str) -> Option<String> {
    let key = format!("TAKT_{}", dotted_path.to_ascii_uppercase().replace('.', "_"));
    std::env::var(key).ok()
}

fn coerce_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
