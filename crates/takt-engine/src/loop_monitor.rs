use std::collections::VecDeque;

use takt_types::{LoopMonitorConfig, Movement, PermissionMode, SessionMode};

/// Detects repeated cycles over a named movement sequence and produces a one-shot judgment
/// movement to break the loop. One instance per configured monitor.
pub struct LoopMonitor {
    config: LoopMonitorConfig,
    history: VecDeque<String>,
}

impl LoopMonitor {
    pub fn new(config: LoopMonitorConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
        }
    }

    fn window_len(&self) -> usize {
        self.config.cycle.len() * self.config.threshold as usize
    }

    /// Called once per completed movement, in engine order.
    pub fn record_completion(&mut self, movement_name: &str) {
        self.history.push_back(movement_name.to_string());
        let window = self.window_len();
        while self.history.len() > window {
            self.history.pop_front();
        }
    }

    /// True iff the most recent `cycle.len() * threshold` completions equal `cycle` repeated
    /// `threshold` times.
    fn has_triggered(&self) -> bool {
        let window = self.window_len();
        if self.history.len() < window || window == 0 {
            return false;
        }
        self.history
            .iter()
            .enumerate()
            .all(|(i, name)| *name == self.config.cycle[i % self.config.cycle.len()])
    }

    /// If triggered, resets the sliding window entirely and returns a synthetic one-shot
    /// judgment `Movement` the engine runs through
    /// `MovementExecutor`'s Phase 1 + rule cascade to pick the next movement.
    pub fn check_and_build_judge_movement(&mut self) -> Option<Movement> {
        if !self.has_triggered() {
            return None;
        }
        self.history.clear();

        Some(Movement {
            name: "__loop_monitor__".to_string(),
            persona_spec: Some(self.config.judge.persona.clone()),
            persona_path: None,
            policy_contents: Vec::new(),
            knowledge_contents: Vec::new(),
            instruction_template: self.config.judge.instruction_template.clone(),
            rules: self.config.judge.rules.clone(),
            output_contracts: Vec::new(),
            quality_gates: Vec::new(),
            pass_previous_response: false,
            session: SessionMode::Refresh,
            edit: false,
            permission_mode: PermissionMode::Readonly,
            provider: None,
            model: None,
            parallel: None,
        })
    }
}
