//! Prompt-cycle event translation
//!
//! [`PromptTranslator`] turns the `session/update` notifications of one
//! prompt into [`StreamEvent`]s. It starts with `message_start` and ends with
//! exactly one `message_complete` or `error`; after that it yields nothing.

use crate::types::{
    AvailableCommand, ConfigOption, ContentBlock, PlanEntry, SessionUpdate, StopReason, ToolCall,
    ToolCallUpdateFields,
};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Event consumed by the host while a prompt is in flight
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart,
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        text: String,
    },
    ToolCallStart {
        tool_call: ToolCall,
    },
    /// Merged view of the tool call after a non-terminal update
    ToolCallDelta {
        tool_call: ToolCall,
    },
    ToolCallComplete {
        tool_call: ToolCall,
    },
    Plan {
        entries: Vec<PlanEntry>,
    },
    ModeChange {
        mode: String,
    },
    ConfigChange {
        config_options: Vec<ConfigOption>,
    },
    CommandsUpdate {
        commands: Vec<AvailableCommand>,
    },
    SessionInfo {
        title: Option<String>,
        updated_at: Option<String>,
    },
    MessageComplete {
        stop_reason: StopReason,
    },
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MessageComplete { .. } | Self::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslatorState {
    Idle,
    Streaming,
    Completed,
    Errored,
}

/// State machine for one prompt cycle
#[derive(Debug)]
pub struct PromptTranslator {
    state: TranslatorState,
    tool_calls: HashMap<String, ToolCall>,
}

impl Default for PromptTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptTranslator {
    pub fn new() -> Self {
        Self {
            state: TranslatorState::Idle,
            tool_calls: HashMap::new(),
        }
    }

    pub fn state(&self) -> TranslatorState {
        self.state
    }

    /// Idle -> Streaming
    pub fn start(&mut self) -> Option<StreamEvent> {
        if self.state != TranslatorState::Idle {
            return None;
        }
        self.state = TranslatorState::Streaming;
        Some(StreamEvent::MessageStart)
    }

    /// Translate one notification. Yields nothing outside Streaming.
    pub fn on_update(&mut self, update: SessionUpdate) -> Option<StreamEvent> {
        if self.state != TranslatorState::Streaming {
            debug!("Ignoring update outside of a streaming prompt");
            return None;
        }

        match update {
            SessionUpdate::AgentMessageChunk { content } => text_of(content, "message")
                .map(|text| StreamEvent::TextDelta { text }),
            SessionUpdate::AgentThoughtChunk { content } => text_of(content, "thought")
                .map(|text| StreamEvent::ThinkingDelta { text }),
            SessionUpdate::ToolCall(call) => Some(self.on_tool_call(call)),
            SessionUpdate::ToolCallUpdate(fields) => self.on_tool_call_update(fields),
            SessionUpdate::Plan { entries } => Some(StreamEvent::Plan { entries }),
            SessionUpdate::CurrentModeUpdate { current_mode_id } => Some(StreamEvent::ModeChange {
                mode: current_mode_id,
            }),
            SessionUpdate::ConfigOptionUpdate { config_options } => {
                Some(StreamEvent::ConfigChange { config_options })
            }
            SessionUpdate::AvailableCommandsUpdate { available_commands } => {
                Some(StreamEvent::CommandsUpdate {
                    commands: available_commands,
                })
            }
            SessionUpdate::SessionInfoUpdate { title, updated_at } => {
                Some(StreamEvent::SessionInfo { title, updated_at })
            }
            // History replays belong to load/resume, not to a live prompt
            SessionUpdate::UserMessageChunk { .. } => None,
            SessionUpdate::Unknown => None,
        }
    }

    fn on_tool_call(&mut self, call: ToolCall) -> StreamEvent {
        if self.tool_calls.contains_key(&call.tool_call_id) {
            warn!("Tool call {} reported twice; replacing", call.tool_call_id);
        }
        self.tool_calls.insert(call.tool_call_id.clone(), call.clone());
        if call.status.is_terminal() {
            StreamEvent::ToolCallComplete { tool_call: call }
        } else {
            StreamEvent::ToolCallStart { tool_call: call }
        }
    }

    fn on_tool_call_update(&mut self, fields: ToolCallUpdateFields) -> Option<StreamEvent> {
        let Some(call) = self.tool_calls.get_mut(&fields.tool_call_id) else {
            warn!("Update for unknown tool call {}", fields.tool_call_id);
            return None;
        };

        let was_terminal = call.status.is_terminal();
        if was_terminal && fields.status.map_or(false, |s| s != call.status) {
            debug!(
                "Ignoring status change for finished tool call {}",
                fields.tool_call_id
            );
        }

        let completed_now = call.apply(&fields);
        let tool_call = call.clone();
        if completed_now {
            Some(StreamEvent::ToolCallComplete { tool_call })
        } else {
            Some(StreamEvent::ToolCallDelta { tool_call })
        }
    }

    /// Streaming -> Completed
    pub fn complete(&mut self, stop_reason: StopReason) -> Option<StreamEvent> {
        if self.state != TranslatorState::Streaming {
            return None;
        }
        self.state = TranslatorState::Completed;
        Some(StreamEvent::MessageComplete { stop_reason })
    }

    /// Streaming -> Errored
    pub fn fail(&mut self, error: impl Into<String>) -> Option<StreamEvent> {
        if self.state != TranslatorState::Streaming {
            return None;
        }
        self.state = TranslatorState::Errored;
        Some(StreamEvent::Error {
            error: error.into(),
        })
    }

    /// Tool call as last seen in this cycle
    pub fn tool_call(&self, tool_call_id: &str) -> Option<&ToolCall> {
        self.tool_calls.get(tool_call_id)
    }
}

fn text_of(content: ContentBlock, what: &str) -> Option<String> {
    match content {
        ContentBlock::Text { text } => Some(text),
        other => {
            debug!("Skipping non-text {} chunk: {:?}", what, other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToolCallStatus, ToolKind};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn update(value: serde_json::Value) -> SessionUpdate {
        serde_json::from_value(value).unwrap()
    }

    fn streaming() -> PromptTranslator {
        let mut translator = PromptTranslator::new();
        assert_eq!(translator.start(), Some(StreamEvent::MessageStart));
        translator
    }

    #[test]
    fn test_text_deltas_then_complete() {
        let mut t = streaming();
        let mut events = vec![];
        for text in ["Hel", "lo"] {
            events.extend(t.on_update(update(json!({
                "sessionUpdate": "agent_message_chunk",
                "content": {"type": "text", "text": text}
            }))));
        }
        events.extend(t.complete(StopReason::EndTurn));

        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta { text: "Hel".into() },
                StreamEvent::TextDelta { text: "lo".into() },
                StreamEvent::MessageComplete {
                    stop_reason: StopReason::EndTurn
                },
            ]
        );
        assert_eq!(t.state(), TranslatorState::Completed);
    }

    #[test]
    fn test_exactly_one_terminal_event() {
        let mut t = streaming();
        assert!(t.fail("boom").is_some());
        assert!(t.complete(StopReason::EndTurn).is_none());
        assert!(t.fail("again").is_none());
        assert!(t
            .on_update(update(json!({
                "sessionUpdate": "agent_message_chunk",
                "content": {"type": "text", "text": "late"}
            })))
            .is_none());
        assert_eq!(t.state(), TranslatorState::Errored);
    }

    #[test]
    fn test_thought_chunk() {
        let mut t = streaming();
        let event = t.on_update(update(json!({
            "sessionUpdate": "agent_thought_chunk",
            "content": {"type": "text", "text": "hmm"}
        })));
        assert_eq!(event, Some(StreamEvent::ThinkingDelta { text: "hmm".into() }));
    }

    #[test]
    fn test_tool_call_lifecycle() {
        let mut t = streaming();

        let start = t.on_update(update(json!({
            "sessionUpdate": "tool_call",
            "toolCallId": "t1",
            "title": "Run tests",
            "kind": "execute",
            "status": "pending"
        })));
        assert!(matches!(start, Some(StreamEvent::ToolCallStart { ref tool_call }) if tool_call.kind == ToolKind::Bash));

        let delta = t.on_update(update(json!({
            "sessionUpdate": "tool_call_update",
            "toolCallId": "t1",
            "status": "in_progress"
        })));
        assert!(matches!(delta, Some(StreamEvent::ToolCallDelta { ref tool_call })
            if tool_call.status == ToolCallStatus::InProgress && tool_call.title == "Run tests"));

        let done = t.on_update(update(json!({
            "sessionUpdate": "tool_call_update",
            "toolCallId": "t1",
            "status": "completed"
        })));
        assert!(matches!(done, Some(StreamEvent::ToolCallComplete { .. })));

        let after = t.on_update(update(json!({
            "sessionUpdate": "tool_call_update",
            "toolCallId": "t1",
            "status": "failed"
        })));
        assert!(matches!(after, Some(StreamEvent::ToolCallDelta { ref tool_call })
            if tool_call.status == ToolCallStatus::Completed));
        assert_eq!(t.tool_call("t1").unwrap().status, ToolCallStatus::Completed);
    }

    #[test]
    fn test_unknown_tool_call_update_is_ignored() {
        let mut t = streaming();
        let event = t.on_update(update(json!({
            "sessionUpdate": "tool_call_update",
            "toolCallId": "nope",
            "status": "completed"
        })));
        assert_eq!(event, None);
        assert_eq!(t.state(), TranslatorState::Streaming);
    }

    #[test]
    fn test_state_events() {
        let mut t = streaming();
        assert_eq!(
            t.on_update(update(json!({"sessionUpdate": "current_mode_update", "currentModeId": "code"}))),
            Some(StreamEvent::ModeChange { mode: "code".into() })
        );
        assert!(matches!(
            t.on_update(update(json!({
                "sessionUpdate": "available_commands_update",
                "availableCommands": [{"name": "compact", "description": "Compact history"}]
            }))),
            Some(StreamEvent::CommandsUpdate { ref commands }) if commands.len() == 1
        ));
        assert!(matches!(
            t.on_update(update(json!({
                "sessionUpdate": "plan",
                "entries": [{"content": "step", "status": "pending", "priority": "high"}]
            }))),
            Some(StreamEvent::Plan { .. })
        ));
        assert_eq!(
            t.on_update(update(json!({
                "sessionUpdate": "user_message_chunk",
                "content": {"type": "text", "text": "replay"}
            }))),
            None
        );
    }

    #[test]
    fn test_event_wire_tags() {
        let event = StreamEvent::MessageComplete {
            stop_reason: StopReason::EndTurn,
        };
        assert_eq!(
            serde_json::to_value(event).unwrap(),
            json!({"type": "message_complete", "stop_reason": "end_turn"})
        );
    }
}
