use std::sync::Arc;

use crate::agent::Agent;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("no agent provider registered")]
    NoProvidersRegistered,
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

/// Selects among registered `Agent` backends by name, falling back to a configured default and
/// then to the first registered provider.
pub struct AgentRegistry {
    agents: Vec<Arc<dyn Agent>>,
    default: Option<String>,
}

impl AgentRegistry {
    pub fn new(agents: Vec<Arc<dyn Agent>>, default: Option<String>) -> Self {
        Self { agents, default }
    }

    pub fn select(&self, requested: Option<&str>) -> Result<Arc<dyn Agent>, ProviderError> {
        if let Some(name) = requested {
            return self
                .agents
                .iter()
                .find(|agent| agent.name() == name)
                .cloned()
                .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()));
        }
        if let Some(default_name) = &self.default {
            if let Some(agent) = self.agents.iter().find(|agent| agent.name() == default_name) {
                return Ok(agent.clone());
            }
        }
        self.agents
            .first()
            .cloned()
            .ok_or(ProviderError::NoProvidersRegistered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAgent;

    #[test]
    fn select_falls_back_through_explicit_default_then_first_registered() {
        let claude = Arc::new(MockAgent::new("claude", vec![]));
        let mock = Arc::new(MockAgent::new("mock", vec![]));
        let registry = AgentRegistry::new(
            vec![claude.clone() as Arc<dyn Agent>, mock.clone() as Arc<dyn Agent>],
            Some("mock".to_string()),
        );

        assert_eq!(registry.select(Some("claude")).unwrap().name(), "claude");
        assert_eq!(registry.select(None).unwrap().name(), "mock");

        let no_default = AgentRegistry::new(vec![claude as Arc<dyn Agent>], None);
        assert_eq!(no_default.select(None).unwrap().name(), "claude");

        let empty = AgentRegistry::new(vec![], None);
        assert!(matches!(empty.select(None), Err(ProviderError::NoProvidersRegistered)));
    }
}
