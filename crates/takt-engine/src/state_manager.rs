use takt_types::{AgentResponse, PieceState, SessionKey, MAX_INPUT_LENGTH, MAX_USER_INPUTS};

/// Single-owner mutator for `PieceState`. Called only from the engine's
/// task; parallel children pass their outputs back through `ParallelRunner` and the engine
/// writes them in here sequentially, never concurrently.
pub struct StateManager;

impl StateManager {
    /// Starts a movement's counter at 1 on first execution, independent of other movements.
    pub fn increment_movement_iteration(state: &mut PieceState, movement_name: &str) -> u32 {
        let counter = state.movement_iterations.entry(movement_name.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Truncates to `MAX_INPUT_LENGTH`, appends, then evicts oldest entries beyond
    /// `MAX_USER_INPUTS` (property 7: newest `MAX_USER_INPUTS` survive, in order).
    pub fn add_user_input(state: &mut PieceState, text: &str) {
        let truncated: String = text.chars().take(MAX_INPUT_LENGTH).collect();
        state.user_inputs.push(truncated);
        while state.user_inputs.len() > MAX_USER_INPUTS {
            state.user_inputs.remove(0);
        }
    }

    /// `lastOutput` if set, else the most recently inserted entry of `movementOutputs`
    /// (insertion order, not alphabetical), else none.
    pub fn get_previous_output(state: &PieceState) -> Option<&AgentResponse> {
        state
            .last_output
            .as_ref()
            .or_else(|| state.movement_outputs.last().map(|(_, response)| response))
    }

    pub fn set_persona_session(state: &mut PieceState, key: &SessionKey, session_id: impl Into<String>) {
        state.persona_sessions.insert(key.to_string(), session_id.into());
    }

    pub fn clear_persona_session(state: &mut PieceState, key: &SessionKey) {
        state.persona_sessions.remove(&key.to_string());
    }

    pub fn get_persona_session(state: &PieceState, key: &SessionKey) -> Option<&str> {
        state.persona_sessions.get(&key.to_string()).map(String::as_str)
    }
}
