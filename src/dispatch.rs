//! Turn dispatch for the agent loop.
//!
//! After every model turn the agent asks [`decide`] what to do next. The
//! answer only depends on the last message and the per-run [`RunState`], so
//! the whole control flow of a run is the small [`Phase`] machine below.

use crate::llm::ModelMessage;

/// Next step chosen after a model turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    RunTools,
    DeliverResult,
    Stop,
}

/// Per-run summary derived from the conversation.
///
/// `last_result_text` is written at most once and `delivered` flips to
/// `true` at most once. A new value is created for every run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunState {
    last_result_text: Option<String>,
    delivered: bool,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_result_text(&self) -> Option<&str> {
        self.last_result_text.as_deref()
    }

    pub fn delivered(&self) -> bool {
        self.delivered
    }

    /// Stores `text` as the run's result unless one was already captured.
    pub fn capture_result(&mut self, text: impl Into<String>) -> bool {
        if self.last_result_text.is_some() {
            return false;
        }
        self.last_result_text = Some(text.into());
        true
    }

    /// Returns `false` when the result had already been delivered.
    pub fn mark_delivered(&mut self) -> bool {
        if self.delivered {
            return false;
        }
        self.delivered = true;
        true
    }

    pub fn pending_delivery(&self) -> bool {
        self.last_result_text.is_some() && !self.delivered
    }
}

/// Decides the next step. First match wins: tool calls, pending delivery, stop.
///
/// Anything that is not an assistant turn with tool calls (including no
/// message at all) counts as "no tool calls".
pub fn decide(last_message: Option<&ModelMessage>, state: &RunState) -> Action {
    if last_message.is_some_and(has_tool_calls) {
        return Action::RunTools;
    }

    if state.pending_delivery() {
        return Action::DeliverResult;
    }

    Action::Stop
}

fn has_tool_calls(message: &ModelMessage) -> bool {
    matches!(message, ModelMessage::Assistant { tool_calls, .. } if !tool_calls.is_empty())
}

/// Where a run currently is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    AwaitingModel,
    RunningTools,
    Delivering,
    Done,
}

impl Phase {
    /// Transition out of `AwaitingModel` for a dispatcher decision.
    pub fn on_decision(self, action: Action) -> Phase {
        match (self, action) {
            (Phase::AwaitingModel, Action::RunTools) => Phase::RunningTools,
            (Phase::AwaitingModel, Action::DeliverResult) => Phase::Delivering,
            (Phase::AwaitingModel, Action::Stop) => Phase::Done,
            (phase, _) => phase,
        }
    }

    /// Transition once the side effect of the current phase has finished.
    pub fn on_action_complete(self) -> Phase {
        match self {
            Phase::RunningTools => Phase::AwaitingModel,
            Phase::Delivering => Phase::Done,
            phase => phase,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Phase::Done
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::llm::ModelToolCall;

    fn assistant_with_calls() -> ModelMessage {
        ModelMessage::Assistant {
            content: None,
            tool_calls: vec![ModelToolCall {
                id: "call_1".to_string(),
                name: "web_search".to_string(),
                arguments: json!({"query": "rust"}),
            }],
        }
    }

    fn assistant_text() -> ModelMessage {
        ModelMessage::Assistant {
            content: Some("summary".to_string()),
            tool_calls: vec![],
        }
    }

    fn state(result: Option<&str>, delivered: bool) -> RunState {
        RunState {
            last_result_text: result.map(str::to_string),
            delivered,
        }
    }

    #[test]
    fn tool_calls_without_result_run_tools() {
        let action = decide(Some(&assistant_with_calls()), &state(None, false));
        assert_eq!(action, Action::RunTools);
    }

    #[test]
    fn pending_result_is_delivered() {
        let action = decide(Some(&assistant_text()), &state(Some("foo"), false));
        assert_eq!(action, Action::DeliverResult);
    }

    #[test]
    fn delivered_result_stops() {
        let action = decide(Some(&assistant_text()), &state(Some("foo"), true));
        assert_eq!(action, Action::Stop);
    }

    #[test]
    fn nothing_pending_stops() {
        let action = decide(Some(&assistant_text()), &state(None, false));
        assert_eq!(action, Action::Stop);
    }

    #[test]
    fn tool_calls_take_precedence_over_pending_delivery() {
        let action = decide(Some(&assistant_with_calls()), &state(Some("foo"), false));
        assert_eq!(action, Action::RunTools);
    }

    #[test]
    fn missing_or_non_assistant_message_counts_as_no_tool_calls() {
        assert_eq!(decide(None, &state(None, false)), Action::Stop);
        assert_eq!(decide(None, &state(Some("foo"), false)), Action::DeliverResult);

        let user = ModelMessage::User("hi".to_string());
        assert_eq!(decide(Some(&user), &state(None, false)), Action::Stop);
    }

    #[test]
    fn decide_is_deterministic() {
        let message = assistant_text();
        let run_state = state(Some("foo"), false);
        let first = decide(Some(&message), &run_state);
        for _ in 0..8 {
            assert_eq!(decide(Some(&message), &run_state), first);
        }
    }

    #[test]
    fn delivery_happens_once_then_stops() {
        let message = assistant_text();
        let mut run_state = RunState::new();
        assert!(run_state.capture_result("foo"));

        assert_eq!(decide(Some(&message), &run_state), Action::DeliverResult);
        assert!(run_state.mark_delivered());
        assert_eq!(decide(Some(&message), &run_state), Action::Stop);

        assert!(!run_state.mark_delivered());
        assert_eq!(decide(Some(&message), &run_state), Action::Stop);
    }

    #[test]
    fn captured_result_is_never_overwritten() {
        let mut run_state = RunState::new();
        assert!(run_state.capture_result("first"));
        assert!(!run_state.capture_result("second"));
        assert_eq!(run_state.last_result_text(), Some("first"));
    }

    #[test]
    fn phase_walks_tool_round_then_delivery() {
        let mut phase = Phase::default();
        assert_eq!(phase, Phase::AwaitingModel);

        phase = phase.on_decision(Action::RunTools);
        assert_eq!(phase, Phase::RunningTools);
        phase = phase.on_action_complete();
        assert_eq!(phase, Phase::AwaitingModel);

        phase = phase.on_decision(Action::DeliverResult);
        assert_eq!(phase, Phase::Delivering);
        phase = phase.on_action_complete();
        assert!(phase.is_terminal());
    }

    #[test]
    fn done_is_absorbing() {
        let done = Phase::AwaitingModel.on_decision(Action::Stop);
        assert!(done.is_terminal());
        assert_eq!(done.on_decision(Action::RunTools), Phase::Done);
        assert_eq!(done.on_decision(Action::DeliverResult), Phase::Done);
        assert_eq!(done.on_action_complete(), Phase::Done);
    }
}
