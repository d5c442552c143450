//! Session-scoped types: modes, models, config options and the
//! `session/update` notification union.

use serde::{de, Deserialize, Deserializer, Serialize};

/// Agent mode advertised for a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMode {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Model advertised for a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionModel {
    #[serde(alias = "modelId")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Session-level configuration knob
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOption {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<String>,
    #[serde(default)]
    pub options: Vec<ConfigOptionEntry>,
}

impl ConfigOption {
    /// All selectable values, flattening groups
    pub fn choices(&self) -> Vec<&ConfigChoice> {
        let mut out = Vec::new();
        for entry in &self.options {
            match entry {
                ConfigOptionEntry::Group(group) => out.extend(group.options.iter()),
                ConfigOptionEntry::Choice(choice) => out.push(choice),
            }
        }
        out
    }
}

/// Either a flat choice or a labelled group of choices
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConfigOptionEntry {
    Group(ConfigGroup),
    Choice(ConfigChoice),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigGroup {
    #[serde(alias = "group")]
    pub id: String,
    #[serde(alias = "name")]
    pub label: String,
    pub options: Vec<ConfigChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigChoice {
    #[serde(alias = "value")]
    pub id: String,
    #[serde(alias = "name")]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Slash command the agent accepts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AvailableCommand {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
}

/// `session/update` notification params
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdateNotification {
    pub session_id: String,
    pub update: SessionUpdate,
}

impl<'de> Deserialize<'de> for SessionUpdateNotification {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;

        // { "sessionId": "...", "update": { "sessionUpdate": "...", ... } }
        if value.get("update").is_some() {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Wrapped {
                session_id: String,
                update: SessionUpdate,
            }

            let wrapped: Wrapped = serde_json::from_value(value).map_err(de::Error::custom)?;
            Ok(Self {
                session_id: wrapped.session_id,
                update: wrapped.update,
            })
        } else {
            // { "sessionId": "...", "sessionUpdate": "...", ... }
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Flat {
                session_id: String,
                #[serde(flatten)]
                update: SessionUpdate,
            }

            let flat: Flat = serde_json::from_value(value).map_err(de::Error::custom)?;
            Ok(Self {
                session_id: flat.session_id,
                update: flat.update,
            })
        }
    }
}

/// Session update types (union)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    UserMessageChunk {
        content: super::ContentBlock,
    },
    AgentMessageChunk {
        content: super::ContentBlock,
    },
    AgentThoughtChunk {
        content: super::ContentBlock,
    },
    ToolCall(ToolCall),
    ToolCallUpdate(ToolCallUpdateFields),
    Plan {
        entries: Vec<super::PlanEntry>,
    },
    AvailableCommandsUpdate {
        #[serde(rename = "availableCommands")]
        available_commands: Vec<AvailableCommand>,
    },
    CurrentModeUpdate {
        #[serde(rename = "currentModeId", alias = "modeId")]
        current_mode_id: String,
    },
    ConfigOptionUpdate {
        #[serde(rename = "configOptions")]
        config_options: Vec<ConfigOption>,
    },
    SessionInfoUpdate {
        #[serde(default)]
        title: Option<String>,
        #[serde(rename = "updatedAt", default)]
        updated_at: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// First report of a tool call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub tool_call_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub kind: ToolKind,
    #[serde(default)]
    pub status: ToolCallStatus,
    #[serde(default)]
    pub content: Vec<ToolCallContent>,
    #[serde(default)]
    pub locations: Vec<ToolCallLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<serde_json::Value>,
}

impl ToolCall {
    /// Merge a partial update; returns true when the status became terminal
    pub fn apply(&mut self, fields: &ToolCallUpdateFields) -> bool {
        let was_terminal = self.status.is_terminal();

        if let Some(title) = &fields.title {
            self.title = title.clone();
        }
        if let Some(kind) = fields.kind {
            self.kind = kind;
        }
        if let Some(content) = &fields.content {
            self.content = content.clone();
        }
        if let Some(locations) = &fields.locations {
            self.locations = locations.clone();
        }
        if fields.raw_input.is_some() {
            self.raw_input = fields.raw_input.clone();
        }
        if fields.raw_output.is_some() {
            self.raw_output = fields.raw_output.clone();
        }

        // Terminal status is sticky
        if let Some(status) = fields.status {
            if !was_terminal {
                self.status = status;
            }
        }

        !was_terminal && self.status.is_terminal()
    }
}

/// Partial tool call carried by `tool_call_update` and permission requests
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallUpdateFields {
    pub tool_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ToolKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolCallStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ToolCallContent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<ToolCallLocation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Read,
    #[serde(alias = "delete", alias = "move")]
    Write,
    Edit,
    #[serde(alias = "execute", alias = "terminal")]
    Bash,
    #[serde(alias = "glob", alias = "grep")]
    Search,
    #[serde(alias = "fetch")]
    Web,
    Mcp,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ToolCallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolCallContent {
    Content {
        content: super::ContentBlock,
    },
    Diff {
        path: String,
        #[serde(rename = "oldText", default, skip_serializing_if = "Option::is_none")]
        old_text: Option<String>,
        #[serde(rename = "newText", default, skip_serializing_if = "Option::is_none")]
        new_text: Option<String>,
    },
    Terminal {
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallLocation {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentBlock;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_deserialize_wrapped_update() {
        let n: SessionUpdateNotification = serde_json::from_value(json!({
            "sessionId": "s1",
            "update": {"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": "Hel"}}
        }))
        .unwrap();
        assert_eq!(n.session_id, "s1");
        assert_eq!(
            n.update,
            SessionUpdate::AgentMessageChunk {
                content: ContentBlock::text("Hel")
            }
        );
    }

    #[test]
    fn test_deserialize_flat_update() {
        let n: SessionUpdateNotification = serde_json::from_value(json!({
            "sessionId": "s1",
            "sessionUpdate": "current_mode_update",
            "modeId": "code"
        }))
        .unwrap();
        assert_eq!(
            n.update,
            SessionUpdate::CurrentModeUpdate {
                current_mode_id: "code".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_update_kind() {
        let n: SessionUpdateNotification = serde_json::from_value(json!({
            "sessionId": "s1",
            "update": {"sessionUpdate": "usage_update"}
        }))
        .unwrap();
        assert_eq!(n.update, SessionUpdate::Unknown);
    }

    #[test]
    fn test_tool_call_with_diff_and_terminal() {
        let n: SessionUpdateNotification = serde_json::from_value(json!({
            "sessionId": "s1",
            "update": {
                "sessionUpdate": "tool_call",
                "toolCallId": "t1",
                "title": "Edit main.rs",
                "kind": "edit",
                "status": "pending",
                "locations": [{"path": "/src/main.rs", "line": 3}],
                "content": [
                    {"type": "diff", "path": "/src/main.rs", "newText": "fn main() {}"},
                    {"type": "terminal", "terminalId": "term-1"}
                ]
            }
        }))
        .unwrap();

        let SessionUpdate::ToolCall(call) = n.update else {
            panic!("expected tool_call");
        };
        assert_eq!(call.kind, ToolKind::Edit);
        assert_eq!(call.locations[0].line, Some(3));
        assert_eq!(call.content.len(), 2);
        assert!(matches!(call.content[1], ToolCallContent::Terminal { ref terminal_id } if terminal_id == "term-1"));
    }

    #[test]
    fn test_tool_kind_aliases() {
        let kinds: Vec<ToolKind> =
            serde_json::from_value(json!(["execute", "grep", "fetch", "think"])).unwrap();
        assert_eq!(
            kinds,
            vec![ToolKind::Bash, ToolKind::Search, ToolKind::Web, ToolKind::Other]
        );
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let mut call = ToolCall {
            tool_call_id: "t1".to_string(),
            title: "Run".to_string(),
            kind: ToolKind::Bash,
            status: ToolCallStatus::InProgress,
            content: vec![],
            locations: vec![],
            raw_input: None,
            raw_output: None,
        };

        let completed = ToolCallUpdateFields {
            tool_call_id: "t1".to_string(),
            status: Some(ToolCallStatus::Completed),
            ..Default::default()
        };
        assert!(call.apply(&completed));

        let failed = ToolCallUpdateFields {
            tool_call_id: "t1".to_string(),
            status: Some(ToolCallStatus::Failed),
            title: Some("Run again".to_string()),
            ..Default::default()
        };
        assert!(!call.apply(&failed));
        assert_eq!(call.status, ToolCallStatus::Completed);
        assert_eq!(call.title, "Run again");
    }

    #[test]
    fn test_config_option_grouped_choices() {
        let option: ConfigOption = serde_json::from_value(json!({
            "id": "model",
            "name": "Model",
            "currentValue": "fast",
            "options": [
                {"group": "g1", "name": "Speed", "options": [{"value": "fast", "name": "Fast"}]},
                {"value": "slow", "name": "Slow", "description": "thorough"}
            ]
        }))
        .unwrap();

        let ids: Vec<&str> = option.choices().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["fast", "slow"]);
        assert!(matches!(option.options[0], ConfigOptionEntry::Group(ref g) if g.label == "Speed"));
    }
}
