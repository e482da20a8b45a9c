// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The normalized wire model consumed by provider adapters.
//!
//! The loop projects persisted history onto these types; adapters map
//! them onto their API-specific formats. Serialization follows the
//! provider wire conventions: tool results become `tool-<name>` blocks
//! with an `output-available` / `output-error` state, files carry
//! `mediaType`, and interrupted calls are marked as errors.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One content block inside a multi-block message.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    File {
        url: String,
        media_type: String,
        filename: Option<String>,
    },
    StepStart,
    /// A prior tool invocation replayed into history.
    ToolResult {
        tool: String,
        call_id: String,
        input: Value,
        outcome: ToolOutcome,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Output(String),
    Error(String),
    /// The call never reached a terminal state (abort, crash).
    Interrupted,
}

pub const INTERRUPTED_TOOL_TEXT: &str = "[Tool execution was interrupted]";

impl Serialize for ContentBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ContentBlock::Text { text } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "text")?;
                map.serialize_entry("text", text)?;
                map.end()
            }
            ContentBlock::Reasoning { text } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "reasoning")?;
                map.serialize_entry("text", text)?;
                map.end()
            }
            ContentBlock::File {
                url,
                media_type,
                filename,
            } => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("type", "file")?;
                map.serialize_entry("url", url)?;
                map.serialize_entry("mediaType", media_type)?;
                if let Some(filename) = filename {
                    map.serialize_entry("filename", filename)?;
                }
                map.end()
            }
            ContentBlock::StepStart => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("type", "step-start")?;
                map.end()
            }
            ContentBlock::ToolResult {
                tool,
                call_id,
                input,
                outcome,
            } => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("type", &format!("tool-{tool}"))?;
                map.serialize_entry("toolCallId", call_id)?;
                map.serialize_entry("input", input)?;
                match outcome {
                    ToolOutcome::Output(output) => {
                        map.serialize_entry("state", "output-available")?;
                        map.serialize_entry("output", output)?;
                    }
                    ToolOutcome::Error(error) => {
                        map.serialize_entry("state", "output-error")?;
                        map.serialize_entry("errorText", error)?;
                    }
                    ToolOutcome::Interrupted => {
                        map.serialize_entry("state", "output-error")?;
                        map.serialize_entry("errorText", INTERRUPTED_TOOL_TEXT)?;
                    }
                }
                map.end()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ModelMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Plain text of this message when it is a single text payload.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Blocks(blocks) => match blocks.as_slice() {
                [ContentBlock::Text { text }] => Some(text),
                _ => None,
            },
        }
    }
}

// ─── Requests & responses ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompletionRequest {
    pub messages: Vec<ModelMessage>,
    /// Model-facing tool schemas (`{name, description, inputSchema}`).
    pub tools: Vec<Value>,
    pub temperature: Option<f32>,
}

/// Provider-reported stop reason, mapped by the loop onto the persisted
/// finish reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Raw token metadata as the provider reported it. Fields are `f64`
/// because providers have been seen returning junk; the accounting
/// layer coerces non-finite and negative values to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawUsage {
    pub input: f64,
    pub output: f64,
    pub reasoning: Option<f64>,
    /// Tokens served from the provider's prompt cache.
    pub cached_input: Option<f64>,
    /// Tokens written into the provider's prompt cache.
    pub cache_write: Option<f64>,
    /// Provider-reported grand total, when it reports one.
    pub total: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub model_id: String,
    pub usage: RawUsage,
    pub stop: StopReason,
}

impl Completion {
    /// Text-only completion, for tests and degraded adapters.
    pub fn text(content: impl Into<String>, usage: RawUsage) -> Self {
        Self {
            content: Some(content.into()),
            reasoning: None,
            tool_calls: Vec::new(),
            model_id: String::new(),
            usage,
            stop: StopReason::Stop,
        }
    }

    pub fn tool_calls(calls: Vec<ToolCallRequest>, usage: RawUsage) -> Self {
        Self {
            content: None,
            reasoning: None,
            tool_calls: calls,
            model_id: String::new(),
            usage,
            stop: StopReason::ToolCalls,
        }
    }
}

/// Streaming shape: a lazy sequence of text deltas with the terminal
/// event last. Tool calls and usage surface only in the terminal event.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    Finished(Completion),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
