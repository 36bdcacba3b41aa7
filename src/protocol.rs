use chrono::{SecondsFormat, Utc};
use schemars::{JsonSchema, Schema, schema_for};
use serde::{Deserialize, Serialize};
use std::num::ParseIntError;

/// Structured submission accepted by `POST /api/chat`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    #[schemars(description = "Prompt forwarded to the CLI tool.", length(min = 1))]
    pub prompt: String,
    #[schemars(description = "Run the tool inside its sandbox.")]
    #[serde(default)]
    pub sandbox: bool,
    #[schemars(description = "Auto-confirm every action the tool proposes.")]
    #[serde(default)]
    pub yolo: bool,
    #[schemars(description = "Model name passed through to the tool.")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[schemars(description = "Working directory of the spawned process.")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[schemars(description = "API key exported to the tool's environment.")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// One event relayed from the subprocess. `Close` and `Error` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireEvent", try_from = "WireEvent")]
pub enum StreamEvent {
    Stdout(String),
    Stderr(String),
    Close(i32),
    Error(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Close(_) | StreamEvent::Error(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EventKind {
    Stdout,
    Stderr,
    Close,
    Error,
}

// On the wire every event is `{"type": ..., "content": "..."}`.
#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: EventKind,
    content: String,
}

impl From<StreamEvent> for WireEvent {
    fn from(event: StreamEvent) -> Self {
        let (kind, content) = match event {
            StreamEvent::Stdout(content) => (EventKind::Stdout, content),
            StreamEvent::Stderr(content) => (EventKind::Stderr, content),
            StreamEvent::Close(code) => (EventKind::Close, code.to_string()),
            StreamEvent::Error(message) => (EventKind::Error, message),
        };
        Self { kind, content }
    }
}

impl TryFrom<WireEvent> for StreamEvent {
    type Error = ParseIntError;

    fn try_from(wire: WireEvent) -> Result<Self, ParseIntError> {
        Ok(match wire.kind {
            EventKind::Stdout => StreamEvent::Stdout(wire.content),
            EventKind::Stderr => StreamEvent::Stderr(wire.content),
            EventKind::Close => StreamEvent::Close(wire.content.trim().parse()?),
            EventKind::Error => StreamEvent::Error(wire.content),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// JSON body of every non-streaming response.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T = serde_json::Value> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<ValidationIssue>,
    pub timestamp: String,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            details: Vec::new(),
            timestamp: now_timestamp(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            details: Vec::new(),
            timestamp: now_timestamp(),
        }
    }

    pub fn with_details(mut self, details: Vec<ValidationIssue>) -> Self {
        self.details = details;
        self
    }
}

/// JSON Schema of [`ChatRequestBody`], for clients that validate up front.
pub fn chat_request_schema() -> Schema {
    schema_for!(ChatRequestBody)
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
