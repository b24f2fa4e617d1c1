use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// One NDJSON record emitted by the sandboxed agent process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentEvent {
    TextDelta {
        #[serde(alias = "delta")]
        text: String,
    },
    ReasoningDelta {
        #[serde(alias = "delta")]
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolStart {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        #[serde(default)]
        output: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(rename_all = "camelCase")]
    SessionInit {
        #[serde(default, alias = "sessionId")]
        continuity_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        #[serde(default, alias = "sessionId")]
        continuity_id: Option<String>,
    },
    Error {
        #[serde(default, alias = "error")]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl AgentEvent {
    /// Parses a single line; unparsable input yields `None`.
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }

    pub fn continuity_id(&self) -> Option<&str> {
        match self {
            Self::SessionInit { continuity_id } | Self::Done { continuity_id } => continuity_id
                .as_deref()
                .filter(|value| !value.is_empty()),
            _ => None,
        }
    }
}

/// Client-protocol event rendered on the translated output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ReasoningEnd {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputAvailable {
        tool_call_id: String,
        output: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputError {
        tool_call_id: String,
        error_text: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_text: String,
    },
    Finish,
}

impl ClientEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error_text: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextStart { .. } => "text-start",
            Self::TextDelta { .. } => "text-delta",
            Self::TextEnd { .. } => "text-end",
            Self::ReasoningStart { .. } => "reasoning-start",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ReasoningEnd { .. } => "reasoning-end",
            Self::ToolInputAvailable { .. } => "tool-input-available",
            Self::ToolOutputAvailable { .. } => "tool-output-available",
            Self::ToolOutputError { .. } => "tool-output-error",
            Self::Error { .. } => "error",
            Self::Finish => "finish",
        }
    }
}
