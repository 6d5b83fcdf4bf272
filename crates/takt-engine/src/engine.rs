use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use takt_observability::{emit_event, ObservabilityEvent, ProcessKind};
use takt_providers::{AgentRegistry, StreamSink};
use takt_types::{
    AgentResponse, AgentStatus, EngineEvent, Movement, PieceConfig, PieceState, PieceStatus,
    RuleTarget, SessionKey, TerminalReason, TerminalState,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::{status_label, ExecutionContext, MovementExecutor};
use crate::loop_monitor::LoopMonitor;
use crate::parallel::{AllParallelFailed, ParallelContext, ParallelRunner};
use crate::phase::{PhaseContext, PhaseOutcome};
use crate::rules::RuleEvaluator;
use crate::session_log::{PointerSnapshot, SessionLog, SessionRecord};
use crate::state_manager::StateManager;

/// `OnIterationLimit(request) → option<number>`. When registered, the engine pauses at the
/// iteration cap instead of aborting outright and asks for more budget.
#[async_trait]
pub trait IterationLimitPrompt: Send + Sync {
    async fn request_extension(&self, request: IterationLimitRequest) -> Option<u32>;
}

#[derive(Debug, Clone, Copy)]
pub struct IterationLimitRequest {
    pub iteration: u32,
    pub max_movements: u32,
}

/// External handle for `Abort(reason)`. `Run()` takes `self` by value and drives the loop to
/// completion on the caller's task; a separate `Clone`able handle is what lets a SIGINT
/// handler or a cancel button call `abort` from another task while `run` is still awaiting an
/// agent call — the Rust shape of a cancellation token with child-scoped propagation.
#[derive(Clone)]
pub struct EngineHandle {
    cancel: CancellationToken,
    abort_reason: Arc<StdMutex<Option<TerminalReason>>>,
}

impl EngineHandle {
    /// Idempotent: the first call's reason sticks; later calls only re-trip the token (already
    /// cancelled, so this is a no-op teardown — a second cancellation during teardown is a
    /// no-op).
    pub fn abort(&self, reason: TerminalReason) {
        let mut guard = self.abort_reason.lock().expect("abort_reason mutex poisoned");
        if guard.is_none() {
            *guard = Some(reason);
        }
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Optional collaborators `PieceEngine::new` doesn't need a constructor with ten positional
/// arguments for. Everything here may be omitted; the engine runs against a bare config +
/// registry + task with all of these at their no-op defaults.
#[derive(Default)]
pub struct PieceEngineOptions {
    pub run_id: Option<String>,
    pub cwd: Option<PathBuf>,
    pub report_dir: Option<PathBuf>,
    pub engine_config: Option<EngineConfig>,
    pub session_log: Option<SessionLog>,
    pub events: Option<mpsc::Sender<EngineEvent>>,
    pub stream_sink: Option<StreamSink>,
    pub iteration_limit_prompt: Option<Arc<dyn IterationLimitPrompt>>,
    pub restored_state: Option<PieceState>,
}

/// Drives one piece from `initialMovement` to a terminal state. Single owner of `PieceState`
/// for the lifetime of one `run()` call; the only other mutator of
/// engine-visible state is `EngineHandle::abort`, which only ever flips a cancellation token
/// and records a reason, never touches `PieceState` directly.
pub struct PieceEngine {
    config: PieceConfig,
    task: String,
    state: PieceState,
    registry: AgentRegistry,
    rule_evaluator: RuleEvaluator,
    loop_monitors: Vec<LoopMonitor>,
    engine_config: EngineConfig,
    cwd: PathBuf,
    report_dir: PathBuf,
    run_id: String,
    session_log: Option<SessionLog>,
    events: Option<mpsc::Sender<EngineEvent>>,
    stream_sink: Option<StreamSink>,
    iteration_limit_prompt: Option<Arc<dyn IterationLimitPrompt>>,
    cancel: CancellationToken,
    abort_reason: Arc<StdMutex<Option<TerminalReason>>>,
    pending_appendix: Option<String>,
    dropped_events: Arc<AtomicU64>,
}

/// Where a movement's matched rule routes the piece next.
enum RuleOutcome {
    Complete,
    Abort(TerminalReason),
    Next(String, Option<String>),
    Unmatched,
}

/// Empty-rules movements auto-complete; a rule with no `next` is only meaningful on a parallel
/// sub-movement (whose rules never drive routing), so reaching one here means a plain or
/// aggregate rule was left without a target — treated as a graceful completion rather than a
/// silent hang.
fn resolve_rule_outcome(movement: &Movement, matched_rule_index: Option<usize>) -> RuleOutcome {
    if movement.rules.is_empty() {
        return RuleOutcome::Complete;
    }
    let Some(index) = matched_rule_index else {
        return RuleOutcome::Unmatched;
    };
    let Some(rule) = movement.rules.get(index) else {
        return RuleOutcome::Unmatched;
    };
    match &rule.next {
        Some(RuleTarget::Complete) => RuleOutcome::Complete,
        Some(RuleTarget::Abort) => RuleOutcome::Abort(TerminalReason::RuleAbort),
        Some(RuleTarget::Movement(name)) => RuleOutcome::Next(name.clone(), rule.appendix.clone()),
        None => RuleOutcome::Complete,
    }
}

fn status_label_for_piece(status: PieceStatus) -> &'static str {
    match status {
        PieceStatus::Running => "running",
        PieceStatus::Completed => "completed",
        PieceStatus::Aborted => "aborted",
    }
}

impl PieceEngine {
    pub fn new(
        config: PieceConfig,
        task: impl Into<String>,
        registry: AgentRegistry,
        rule_evaluator: RuleEvaluator,
        options: PieceEngineOptions,
    ) -> Result<Self, EngineError> {
        if !config.contains_movement(&config.initial_movement) {
            return Err(EngineError::UnknownInitialMovement(config.initial_movement.clone()));
        }
        for movement in &config.movements {
            for (rule_index, rule) in movement.rules.iter().enumerate() {
                if let Some(RuleTarget::Movement(target)) = &rule.next {
                    if !config.contains_movement(target) {
                        return Err(EngineError::UnknownRuleTarget {
                            movement: movement.name.clone(),
                            rule_index,
                            target: target.clone(),
                        });
                    }
                }
            }
        }
        for monitor in &config.loop_monitors {
            for name in &monitor.cycle {
                if !config.contains_movement(name) {
                    return Err(EngineError::UnknownLoopMonitorMovement(name.clone()));
                }
            }
        }

        let state = options
            .restored_state
            .unwrap_or_else(|| PieceState::new(&config.initial_movement));
        let loop_monitors = config.loop_monitors.iter().cloned().map(LoopMonitor::new).collect();
        let run_id = options.run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Self {
            config,
            task: task.into(),
            state,
            registry,
            rule_evaluator,
            loop_monitors,
            engine_config: options.engine_config.unwrap_or_default(),
            cwd: options.cwd.unwrap_or_else(|| PathBuf::from(".")),
            report_dir: options.report_dir.unwrap_or_else(|| PathBuf::from(".")),
            run_id,
            session_log: options.session_log,
            events: options.events,
            stream_sink: options.stream_sink,
            iteration_limit_prompt: options.iteration_limit_prompt,
            cancel: CancellationToken::new(),
            abort_reason: Arc::new(StdMutex::new(None)),
            pending_appendix: None,
            dropped_events: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            cancel: self.cancel.clone(),
            abort_reason: self.abort_reason.clone(),
        }
    }

    /// Read-only snapshot of the current state, for callers that want to inspect progress
    /// without owning the engine (e.g. a TUI polling between `run()` calls is out of scope;
    /// this is for tests and the demo binary's post-run summary).
    pub fn state(&self) -> &PieceState {
        &self.state
    }

    /// Count of events dropped because the bounded event channel was full. Back-pressure here
    /// is surfaced as a metric, never fed back into the loop.
    pub fn dropped_event_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    fn take_abort_reason(&self) -> Option<TerminalReason> {
        self.abort_reason.lock().expect("abort_reason mutex poisoned").take()
    }

    fn provider_for(&self, movement: &Movement) -> String {
        movement
            .provider
            .clone()
            .or_else(|| self.engine_config.default_provider.clone())
            .unwrap_or_else(|| "mock".to_string())
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.events {
            if tx.try_send(event).is_err() {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Emits the `ObservabilityEvent` shape (§2.1's ambient structured-logging layer) through
    /// `tracing`, independent of the `EngineEvent` channel above: this is for `tracing`
    /// subscribers (console/JSONL file layers), not for the engine's own event stream.
    fn observe(&self, level: Level, event: &str, movement: Option<&str>, status: Option<&str>, detail: Option<&str>) {
        emit_event(
            level,
            ProcessKind::Engine,
            &ObservabilityEvent {
                event,
                component: "piece_engine",
                correlation_id: None,
                run_id: Some(&self.run_id),
                movement,
                persona_display_name: None,
                provider_id: None,
                model_id: None,
                status,
                error_code: None,
                detail,
            },
        );
    }

    fn log(&mut self, record: SessionRecord) {
        if let Some(session_log) = &mut self.session_log {
            if let Err(err) = session_log.append(&record) {
                tracing::warn!(error = %err, "session log append failed, continuing run");
            }
        }
    }

    fn log_phase_records(&mut self, movement_name: &str, outcomes: &[PhaseOutcome]) {
        for outcome in outcomes {
            self.log(SessionRecord::PhaseStart {
                movement: movement_name.to_string(),
                phase: outcome.phase,
                phase_name: outcome.phase_name,
                instruction: Some(outcome.instruction.clone()),
                timestamp: Utc::now(),
            });
            self.log(SessionRecord::PhaseComplete {
                movement: movement_name.to_string(),
                phase: outcome.phase,
                phase_name: outcome.phase_name,
                status: outcome.status.clone(),
                content: outcome.content.clone(),
                error: outcome.error.clone(),
                timestamp: Utc::now(),
            });
        }
    }

    fn log_movement_complete(&mut self, movement_name: &str, persona: &str, response: &AgentResponse, instruction: &str) {
        self.log(SessionRecord::MovementComplete {
            movement: movement_name.to_string(),
            persona: persona.to_string(),
            status: status_label(response.status),
            content: response.content.clone(),
            instruction: instruction.to_string(),
            matched_rule_index: response.matched_rule_index,
            matched_rule_method: response.matched_rule_method,
            error: response.error.clone(),
            timestamp: Utc::now(),
        });
    }

    fn write_pointer(&self) {
        let Some(session_log) = &self.session_log else {
            return;
        };
        let snapshot = PointerSnapshot {
            session_id: self.run_id.clone(),
            log_file: session_log.log_file_name(),
            task: self.task.clone(),
            piece_name: self.config.name.clone(),
            status: status_label_for_piece(self.state.status).to_string(),
            start_time: self.state.started_at,
            updated_at: Utc::now(),
            iterations: self.state.iteration,
        };
        if let Err(err) = session_log.write_pointer(&snapshot) {
            tracing::warn!(error = %err, "pointer snapshot write failed, continuing run");
        }
    }

    fn initialize_log(&mut self) -> Result<(), EngineError> {
        if let Some(session_log) = &mut self.session_log {
            session_log.snapshot_previous_pointer_if_needed()?;
            session_log.append(&SessionRecord::PieceStart {
                task: self.task.clone(),
                piece_name: self.config.name.clone(),
                start_time: self.state.started_at,
            })?;
        }
        self.write_pointer();
        Ok(())
    }

    fn finalize_log(&mut self) -> Result<(), EngineError> {
        let iterations = self.state.iteration;
        let status = self.state.status;
        let reason = self.state.terminal_reason.clone();
        if let Some(session_log) = &mut self.session_log {
            match status {
                PieceStatus::Completed => {
                    session_log.append(&SessionRecord::PieceComplete { iterations, end_time: Utc::now() })?;
                }
                PieceStatus::Aborted => {
                    session_log.append(&SessionRecord::PieceAbort {
                        iterations,
                        reason: reason.map(|r| r.to_string()).unwrap_or_default(),
                        end_time: Utc::now(),
                    })?;
                }
                PieceStatus::Running => {}
            }
        }
        self.write_pointer();
        Ok(())
    }

    fn terminate(&mut self, status: PieceStatus, reason: Option<TerminalReason>) {
        self.state.status = status;
        self.state.terminal_reason = reason.clone();
        match status {
            PieceStatus::Completed => {
                self.emit(EngineEvent::PieceCompleted { timestamp: Utc::now(), iteration: self.state.iteration });
                self.observe(Level::INFO, "piece_complete", None, Some("completed"), None);
            }
            PieceStatus::Aborted => {
                let reason = reason.unwrap_or(TerminalReason::UserInterrupted);
                self.observe(
                    Level::WARN,
                    "piece_abort",
                    None,
                    Some("aborted"),
                    Some(&reason.to_string()),
                );
                self.emit(EngineEvent::PieceAborted {
                    timestamp: Utc::now(),
                    iteration: self.state.iteration,
                    reason,
                });
            }
            PieceStatus::Running => {}
        }
    }

    fn to_terminal_state(&self) -> TerminalState {
        TerminalState {
            status: self.state.status,
            iteration: self.state.iteration,
            reason: self.state.terminal_reason.clone(),
            last_output: self.state.last_output.clone(),
        }
    }

    /// Main loop. Consumes `self`: the engine is not reused across runs.
    pub async fn run(mut self) -> Result<TerminalState, EngineError> {
        self.initialize_log()?;
        self.emit(EngineEvent::PieceStarted {
            timestamp: Utc::now(),
            piece_name: self.config.name.clone(),
            initial_movement: self.state.current_movement.clone(),
        });
        self.observe(Level::INFO, "piece_start", None, None, Some(&self.config.name.clone()));

        let mut max_movements = self.config.max_movements;

        loop {
            if self.state.status != PieceStatus::Running {
                break;
            }
            if let Some(reason) = self.take_abort_reason() {
                self.terminate(PieceStatus::Aborted, Some(reason));
                break;
            }

            if self.state.iteration >= max_movements {
                if let Some(prompt) = self.iteration_limit_prompt.clone() {
                    let request = IterationLimitRequest {
                        iteration: self.state.iteration,
                        max_movements,
                    };
                    if let Some(extension) = prompt.request_extension(request).await {
                        if extension > 0 {
                            max_movements = max_movements.saturating_add(extension);
                            continue;
                        }
                    }
                }
                self.terminate(PieceStatus::Aborted, Some(TerminalReason::IterationLimit));
                break;
            }

            let movement_name = self.state.current_movement.clone();
            let Some(movement) = self.config.movement(&movement_name).cloned() else {
                self.terminate(
                    PieceStatus::Aborted,
                    Some(TerminalReason::UnknownMovement { movement: movement_name }),
                );
                break;
            };

            self.state.iteration += 1;
            StateManager::increment_movement_iteration(&mut self.state, &movement.name);
            self.emit(EngineEvent::MovementStarted {
                timestamp: Utc::now(),
                movement: movement.name.clone(),
                iteration: self.state.iteration,
            });
            self.observe(Level::INFO, "movement_start", Some(&movement.name), None, None);
            self.log(SessionRecord::MovementStart {
                movement: movement.name.clone(),
                persona: movement.persona_display_name().to_string(),
                iteration: self.state.iteration,
                timestamp: Utc::now(),
                instruction: None,
            });

            let response = if movement.is_parallel() {
                match self.run_parallel_movement(&movement).await {
                    Ok(response) => response,
                    Err(AllParallelFailed) => {
                        self.terminate(PieceStatus::Aborted, Some(TerminalReason::AllParallelFailed));
                        break;
                    }
                }
            } else {
                self.run_single_movement(&movement).await
            };

            if self.cancel.is_cancelled() || response.status == AgentStatus::Interrupted {
                let reason = self.take_abort_reason().unwrap_or(TerminalReason::UserInterrupted);
                self.terminate(PieceStatus::Aborted, Some(reason));
                break;
            }

            self.state.set_movement_output(&movement.name, response.clone());
            self.write_pointer();

            for monitor in &mut self.loop_monitors {
                monitor.record_completion(&movement.name);
            }

            let mut triggered_judge_movement = None;
            for monitor in &mut self.loop_monitors {
                if let Some(judge_movement) = monitor.check_and_build_judge_movement() {
                    triggered_judge_movement = Some(judge_movement);
                    break;
                }
            }
            let injected_outcome = match triggered_judge_movement {
                Some(judge_movement) => Some(self.run_loop_monitor_injection(&judge_movement).await),
                None => None,
            };

            let rule_outcome = match injected_outcome {
                Some(outcome) => outcome,
                None => resolve_rule_outcome(&movement, response.matched_rule_index),
            };

            match rule_outcome {
                RuleOutcome::Complete => {
                    self.terminate(PieceStatus::Completed, None);
                    break;
                }
                RuleOutcome::Abort(reason) => {
                    self.terminate(PieceStatus::Aborted, Some(reason));
                    break;
                }
                RuleOutcome::Unmatched => {
                    self.terminate(PieceStatus::Aborted, Some(TerminalReason::NoRuleMatched));
                    break;
                }
                RuleOutcome::Next(name, appendix) => {
                    if !self.config.contains_movement(&name) {
                        self.terminate(
                            PieceStatus::Aborted,
                            Some(TerminalReason::UnknownMovement { movement: name }),
                        );
                        break;
                    }
                    self.emit(EngineEvent::Transition {
                        timestamp: Utc::now(),
                        from_movement: movement.name.clone(),
                        to_movement: name.clone(),
                        iteration: self.state.iteration,
                    });
                    self.state.current_movement = name;
                    self.pending_appendix = appendix;
                }
            }
        }

        self.finalize_log()?;
        Ok(self.to_terminal_state())
    }

    async fn run_single_movement(&mut self, movement: &Movement) -> AgentResponse {
        let provider_name = self.provider_for(movement);
        let agent = match self.registry.select(Some(&provider_name)) {
            Ok(agent) => agent,
            Err(err) => {
                return AgentResponse {
                    persona_display_name: movement.persona_display_name().to_string(),
                    status: AgentStatus::Error,
                    content: String::new(),
                    timestamp: Utc::now(),
                    session_id: None,
                    error: Some(err.to_string()),
                    matched_rule_index: None,
                    matched_rule_method: None,
                };
            }
        };

        let session_key = SessionKey::new(movement.persona_display_name(), provider_name);
        let cached_session_id = StateManager::get_persona_session(&self.state, &session_key).map(str::to_string);
        let previous_response = if movement.pass_previous_response {
            StateManager::get_previous_output(&self.state).map(|response| response.content.clone())
        } else {
            None
        };
        let appendix = self.pending_appendix.take();

        let phase_ctx = PhaseContext {
            cwd: self.cwd.clone(),
            report_dir: self.report_dir.clone(),
            language: self.engine_config.language,
            permission_mode: movement.permission_mode,
            abort_signal: self.cancel.clone(),
        };

        let result = MovementExecutor::execute(
            movement,
            agent.as_ref(),
            &self.rule_evaluator,
            ExecutionContext {
                phase_ctx,
                task: &self.task,
                previous_response: previous_response.as_deref(),
                user_inputs: &self.state.user_inputs,
                matched_rule_appendix: appendix.as_deref(),
                cached_session_id,
                on_stream: self.stream_sink.clone(),
            },
        )
        .await;

        if let Some(session_id) = &result.session_id {
            StateManager::set_persona_session(&mut self.state, &session_key, session_id.clone());
        }

        self.log_phase_records(&movement.name, &result.phase_outcomes);
        self.log_movement_complete(
            &movement.name,
            movement.persona_display_name(),
            &result.response,
            &result.phase1_instruction,
        );
        self.emit(EngineEvent::MovementCompleted {
            timestamp: Utc::now(),
            movement: movement.name.clone(),
            status: result.response.status,
            matched_rule_index: result.response.matched_rule_index,
            matched_rule_method: result.response.matched_rule_method,
        });
        self.observe(
            Level::INFO,
            "movement_complete",
            Some(&movement.name),
            Some(&status_label(result.response.status)),
            None,
        );

        result.response
    }

    async fn run_parallel_movement(&mut self, movement: &Movement) -> Result<AgentResponse, AllParallelFailed> {
        let session_snapshot = self.state.persona_sessions.clone();
        let result = ParallelRunner::run(
            movement,
            &self.registry,
            &self.rule_evaluator,
            ParallelContext {
                cwd: self.cwd.clone(),
                report_dir: self.report_dir.clone(),
                language: self.engine_config.language,
                task: &self.task,
                abort_signal: self.cancel.clone(),
                session_snapshot,
                stream_sink: self.stream_sink.clone(),
            },
        )
        .await?;

        for (key, session_id) in &result.child_session_updates {
            StateManager::set_persona_session(&mut self.state, key, session_id.clone());
        }

        for ((name, response), (_, phase_outcomes)) in
            result.child_responses.iter().zip(result.child_phase_outcomes.iter())
        {
            self.emit(EngineEvent::ParallelChildStarted {
                timestamp: Utc::now(),
                parent_movement: movement.name.clone(),
                child_movement: name.clone(),
            });
            self.log_phase_records(name, phase_outcomes);
            let phase1_instruction = phase_outcomes
                .iter()
                .find(|outcome| outcome.phase == 1)
                .map(|outcome| outcome.instruction.clone())
                .unwrap_or_default();
            self.log_movement_complete(name, &response.persona_display_name, response, &phase1_instruction);
            self.emit(EngineEvent::ParallelChildFinished {
                timestamp: Utc::now(),
                parent_movement: movement.name.clone(),
                child_movement: name.clone(),
                succeeded: !response.is_error(),
            });
            self.emit(EngineEvent::MovementCompleted {
                timestamp: Utc::now(),
                movement: name.clone(),
                status: response.status,
                matched_rule_index: response.matched_rule_index,
                matched_rule_method: response.matched_rule_method,
            });
            self.observe(
                Level::INFO,
                "movement_complete",
                Some(name),
                Some(&status_label(response.status)),
                None,
            );
            self.state.set_movement_output(name, response.clone());
        }

        let any_child_errored = result.child_responses.iter().any(|(_, response)| response.is_error());
        let parent_response = AgentResponse {
            persona_display_name: movement.persona_display_name().to_string(),
            status: if any_child_errored { AgentStatus::Blocked } else { AgentStatus::Done },
            content: result.parent_content.clone(),
            timestamp: Utc::now(),
            session_id: None,
            error: None,
            matched_rule_index: result.parent_rule_match.as_ref().map(|m| m.index),
            matched_rule_method: result.parent_rule_match.as_ref().map(|m| m.method),
        };

        self.log_movement_complete(
            &movement.name,
            movement.persona_display_name(),
            &parent_response,
            "(parallel aggregate: see child movement_complete records)",
        );
        self.emit(EngineEvent::MovementCompleted {
            timestamp: Utc::now(),
            movement: movement.name.clone(),
            status: parent_response.status,
            matched_rule_index: parent_response.matched_rule_index,
            matched_rule_method: parent_response.matched_rule_method,
        });
        self.observe(
            Level::INFO,
            "movement_complete",
            Some(&movement.name),
            Some(&status_label(parent_response.status)),
            None,
        );
        self.state.set_movement_output(&movement.name, parent_response.clone());

        Ok(parent_response)
    }

    /// Runs the monitor's one-shot judgment movement and returns the
    /// `RuleOutcome` its own rules produce. Not stored in `movementOutputs` (it has no entry in
    /// `config.movements`, and invariant 3 forbids that), but its iteration is still counted so
    /// invariant 2 (`iteration == Σ movementIterations[m]`) holds over the fuller key set.
    async fn run_loop_monitor_injection(&mut self, judge_movement: &Movement) -> RuleOutcome {
        self.state.iteration += 1;
        StateManager::increment_movement_iteration(&mut self.state, &judge_movement.name);
        self.emit(EngineEvent::LoopMonitorTriggered {
            timestamp: Utc::now(),
            cycle: vec![judge_movement.name.clone()],
            occurrences: 1,
        });

        let response = self.run_single_movement(judge_movement).await;

        if self.cancel.is_cancelled() || response.status == AgentStatus::Interrupted {
            let reason = self.take_abort_reason().unwrap_or(TerminalReason::UserInterrupted);
            return RuleOutcome::Abort(reason);
        }

        resolve_rule_outcome(judge_movement, response.matched_rule_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::NullAiJudge;
    use async_trait::async_trait as async_trait_test;
    use std::sync::Arc as StdArc;
    use takt_providers::{Agent, AgentOutcome, CallOptions, MockAgent};
    use takt_types::{LoopMonitorConfig, LoopMonitorJudge, PermissionMode, Rule, RuleKind, SessionMode};

    fn movement(name: &str, rules: Vec<Rule>) -> Movement {
        Movement {
            name: name.to_string(),
            persona_spec: Some(name.to_string()),
            persona_path: None,
            policy_contents: Vec::new(),
            knowledge_contents: Vec::new(),
            instruction_template: String::new(),
            rules,
            output_contracts: Vec::new(),
            quality_gates: Vec::new(),
            pass_previous_response: false,
            session: SessionMode::Continue,
            edit: false,
            permission_mode: PermissionMode::Readonly,
            provider: Some("mock".to_string()),
            model: None,
            parallel: None,
        }
    }

    fn rule(condition: &str, next: &str) -> Rule {
        Rule {
            condition: condition.to_string(),
            next: Some(RuleTarget::from(next)),
            kind: RuleKind::Plain,
            appendix: None,
        }
    }

    fn simple_config() -> PieceConfig {
        PieceConfig {
            name: "default".to_string(),
            movements: vec![
                movement("plan", vec![rule("Clear", "implement"), rule("Unclear", "ABORT")]),
                movement("implement", vec![rule("Complete", "review"), rule("Cannot", "plan")]),
                movement("review", vec![rule("Passed", "COMPLETE"), rule("Issues", "implement")]),
            ],
            initial_movement: "plan".to_string(),
            max_movements: 20,
            loop_monitors: Vec::new(),
        }
    }

    fn engine_with_script(config: PieceConfig, script: Vec<AgentOutcome>) -> PieceEngine {
        let registry = AgentRegistry::new(vec![StdArc::new(MockAgent::new("mock", script)) as StdArc<dyn Agent>], None);
        let evaluator = RuleEvaluator::with_defaults(StdArc::new(NullAiJudge));
        PieceEngine::new(config, "ship it", registry, evaluator, PieceEngineOptions::default()).unwrap()
    }

    /// A movement with non-empty rules always runs the Phase 3 judgment cascade, so each such
    /// movement consumes two scripted outcomes against the shared mock: the
    /// Phase 1 response, then a structured-output `{"step": N, ...}` answer that picks the rule.
    fn structured(step: u32) -> AgentOutcome {
        AgentOutcome::done(format!("{{\"step\": {step}, \"reason\": \"ok\"}}"))
    }

    #[tokio::test]
    async fn s1_simple_happy_path_completes_in_three_iterations() {
        let engine = engine_with_script(
            simple_config(),
            vec![
                AgentOutcome::done("plan output"),
                structured(1), // Clear -> implement
                AgentOutcome::done("implement output"),
                structured(1), // Complete -> review
                AgentOutcome::done("review output"),
                structured(1), // Passed -> COMPLETE
            ],
        );
        let terminal = engine.run().await.unwrap();
        assert_eq!(terminal.status, PieceStatus::Completed);
        assert_eq!(terminal.iteration, 3);
        assert!(terminal.last_output.unwrap().content.contains("review output"));
    }

    #[tokio::test]
    async fn s2_fix_loop_runs_review_and_implement_twice() {
        let engine = engine_with_script(
            simple_config(),
            vec![
                AgentOutcome::done("plan output"),
                structured(1), // Clear -> implement
                AgentOutcome::done("implement output"),
                structured(1), // Complete -> review
                AgentOutcome::done("review output"),
                structured(2), // Issues -> implement
                AgentOutcome::done("implement output"),
                structured(1), // Complete -> review
                AgentOutcome::done("review output"),
                structured(1), // Passed -> COMPLETE
            ],
        );
        let terminal = engine.run().await.unwrap();
        assert_eq!(terminal.status, PieceStatus::Completed);
        assert_eq!(terminal.iteration, 5);
    }

    #[tokio::test]
    async fn s4_iteration_limit_without_extension_aborts() {
        let mut config = simple_config();
        config.max_movements = 5;
        let engine = engine_with_script(
            config,
            vec![
                AgentOutcome::done("plan output"),
                structured(1), // Clear -> implement
                AgentOutcome::done("implement output"),
                structured(2), // Cannot -> plan
                AgentOutcome::done("plan output"),
                structured(1), // Clear -> implement
                AgentOutcome::done("implement output"),
                structured(2), // Cannot -> plan
                AgentOutcome::done("plan output"),
                structured(1), // routes onward, but the limit check on the next lap aborts first
            ],
        );
        let terminal = engine.run().await.unwrap();
        assert_eq!(terminal.status, PieceStatus::Aborted);
        assert_eq!(terminal.reason, Some(TerminalReason::IterationLimit));
        assert_eq!(terminal.iteration, 5);
    }

    #[tokio::test]
    async fn no_rule_matched_aborts_with_reason() {
        let engine = engine_with_script(
            simple_config(),
            vec![
                AgentOutcome::done("no tag here"),
                AgentOutcome::done("not json either"),
                AgentOutcome::done("still nothing"),
            ],
        );
        let terminal = engine.run().await.unwrap();
        assert_eq!(terminal.status, PieceStatus::Aborted);
        assert_eq!(terminal.reason, Some(TerminalReason::NoRuleMatched));
    }

    #[tokio::test]
    async fn unknown_initial_movement_is_rejected_at_construction() {
        let mut config = simple_config();
        config.initial_movement = "missing".to_string();
        let registry = AgentRegistry::new(vec![StdArc::new(MockAgent::new("mock", vec![])) as StdArc<dyn Agent>], None);
        let evaluator = RuleEvaluator::with_defaults(StdArc::new(NullAiJudge));
        let err = PieceEngine::new(config, "t", registry, evaluator, PieceEngineOptions::default()).unwrap_err();
        assert!(matches!(err, EngineError::UnknownInitialMovement(_)));
    }

    #[tokio::test]
    async fn s3_parallel_aggregate_routes_to_fix_on_any_needs_fix() {
        let config = PieceConfig {
            name: "default".to_string(),
            movements: vec![Movement {
                name: "reviewers".to_string(),
                persona_spec: None,
                persona_path: None,
                policy_contents: Vec::new(),
                knowledge_contents: Vec::new(),
                instruction_template: String::new(),
                rules: vec![
                    Rule {
                        condition: "approved".to_string(),
                        next: Some(RuleTarget::from("supervise")),
                        kind: RuleKind::AggregateAll,
                        appendix: None,
                    },
                    Rule {
                        condition: "needs_fix".to_string(),
                        next: Some(RuleTarget::from("fix")),
                        kind: RuleKind::AggregateAny,
                        appendix: None,
                    },
                ],
                output_contracts: Vec::new(),
                quality_gates: Vec::new(),
                pass_previous_response: false,
                session: SessionMode::Continue,
                edit: false,
                permission_mode: PermissionMode::Readonly,
                provider: None,
                model: None,
                parallel: Some(vec![
                    movement("arch-review", Vec::new()),
                    movement("qa-review", Vec::new()),
                ]),
            }, movement("supervise", vec![]), movement("fix", vec![])],
            initial_movement: "reviewers".to_string(),
            max_movements: 5,
            loop_monitors: Vec::new(),
        };

        let registry = AgentRegistry::new(
            vec![StdArc::new(MockAgent::new(
                "mock",
                vec![AgentOutcome::done("approved"), AgentOutcome::done("needs_fix")],
            )) as StdArc<dyn Agent>],
            None,
        );
        let evaluator = RuleEvaluator::with_defaults(StdArc::new(NullAiJudge));
        let engine = PieceEngine::new(config, "review", registry, evaluator, PieceEngineOptions::default()).unwrap();
        let terminal = engine.run().await.unwrap();
        // fix/supervise have no rules, so they auto-complete after one iteration.
        assert_eq!(terminal.status, PieceStatus::Completed);
        assert_eq!(terminal.iteration, 2);
    }

    #[tokio::test]
    async fn s4b_iteration_limit_extension_via_callback_resumes() {
        struct AlwaysExtendOnce {
            used: std::sync::atomic::AtomicBool,
        }
        #[async_trait_test]
        impl IterationLimitPrompt for AlwaysExtendOnce {
            async fn request_extension(&self, _request: IterationLimitRequest) -> Option<u32> {
                if self.used.swap(true, Ordering::SeqCst) {
                    None
                } else {
                    Some(1)
                }
            }
        }

        let mut config = simple_config();
        config.max_movements = 2;
        let registry = AgentRegistry::new(
            vec![StdArc::new(MockAgent::new(
                "mock",
                vec![
                    AgentOutcome::done("plan output"),
                    structured(1), // Clear -> implement
                    AgentOutcome::done("implement output"),
                    structured(1), // Complete -> review
                    AgentOutcome::done("review output"),
                    structured(1), // Passed -> COMPLETE
                ],
            )) as StdArc<dyn Agent>],
            None,
        );
        let evaluator = RuleEvaluator::with_defaults(StdArc::new(NullAiJudge));
        let mut options = PieceEngineOptions::default();
        options.iteration_limit_prompt = Some(StdArc::new(AlwaysExtendOnce { used: std::sync::atomic::AtomicBool::new(false) }));
        let engine = PieceEngine::new(config, "ship it", registry, evaluator, options).unwrap();
        let terminal = engine.run().await.unwrap();
        assert_eq!(terminal.status, PieceStatus::Completed);
        assert_eq!(terminal.iteration, 3);
    }

    /// An `Agent` whose call only resolves when cancelled, to exercise S6 without a wall-clock
    /// sleep: the mock CLI-backed providers check `abort_signal` the same way `CliAgent` does.
    struct NeverRespondingAgent;

    #[async_trait]
    impl Agent for NeverRespondingAgent {
        fn name(&self) -> &str {
            "mock"
        }

        async fn call(&self, _prompt: &str, options: CallOptions) -> AgentOutcome {
            options.abort_signal.cancelled().await;
            AgentOutcome::interrupted()
        }
    }

    #[tokio::test]
    async fn s6_abort_resolves_run_as_user_interrupted() {
        let registry = AgentRegistry::new(vec![StdArc::new(NeverRespondingAgent) as StdArc<dyn Agent>], None);
        let evaluator = RuleEvaluator::with_defaults(StdArc::new(NullAiJudge));
        let engine = PieceEngine::new(simple_config(), "ship it", registry, evaluator, PieceEngineOptions::default()).unwrap();
        let handle = engine.handle();

        let run_future = tokio::spawn(engine.run());
        // give the engine task a chance to reach the in-flight agent call before aborting.
        tokio::task::yield_now().await;
        handle.abort(TerminalReason::UserInterrupted);

        let terminal = run_future.await.unwrap().unwrap();
        assert_eq!(terminal.status, PieceStatus::Aborted);
        assert_eq!(terminal.reason, Some(TerminalReason::UserInterrupted));
    }

    #[tokio::test]
    async fn loop_monitor_injection_overrides_normal_routing() {
        let mut config = simple_config();
        config.loop_monitors.push(LoopMonitorConfig {
            cycle: vec!["plan".to_string(), "implement".to_string()],
            threshold: 1,
            judge: LoopMonitorJudge {
                persona: "referee".to_string(),
                instruction_template: "break the loop".to_string(),
                rules: vec![rule("stuck", "COMPLETE")],
            },
        });
        let engine = engine_with_script(
            config,
            vec![
                AgentOutcome::done("plan output"),
                structured(1), // Clear -> implement
                AgentOutcome::done("implement output"),
                structured(1), // matched rule is irrelevant: the monitor fires right after this
                AgentOutcome::done("stuck"),
                structured(1), // stuck -> COMPLETE, overriding implement's own routing
            ],
        );
        let terminal = engine.run().await.unwrap();
        assert_eq!(terminal.status, PieceStatus::Completed);
    }
}
