// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The relational data model: sessions, messages and typed parts.
//!
//! Field names serialize in the wire/legacy spelling (`sessionID`,
//! `messageID`, `callID`, …) so rows written by earlier versions of the
//! runtime deserialize unchanged. Sums are internally tagged: parts on
//! `type`, tool states on `status`, message roles on `role`, persisted
//! errors on `name`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tandem_config::ModelRef;
use tandem_permission::PermissionRule;

// ─── Session ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTime {
    pub created: i64,
    pub updated: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacting: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionShare {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub additions: u64,
    pub deletions: u64,
    pub files: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diffs: Option<Value>,
}

/// Marker that the session has been rewound to an earlier message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRevert {
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "partID", default, skip_serializing_if = "Option::is_none")]
    pub part_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(rename = "projectID")]
    pub project_id: String,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub directory: String,
    pub title: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<SessionShare>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SessionSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert: Option<SessionRevert>,
    /// Session-scoped permission rules, evaluated before the engine's own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<Vec<PermissionRule>>,
    pub time: SessionTime,
}

// ─── Tokens ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheUsage {
    pub read: u64,
    pub write: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cache: CacheUsage,
    pub total: u64,
}

impl TokenUsage {
    /// Component-wise sum; used when a step's usage is folded into the
    /// assistant message's running totals.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.reasoning += other.reasoning;
        self.cache.read += other.cache.read;
        self.cache.write += other.cache.write;
        self.total += other.total;
    }
}

// ─── Messages ────────────────────────────────────────────────────────────────

/// Why the model stopped emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Unknown,
}

impl FinishReason {
    /// A finished assistant whose reason is terminal; `tool-calls` and
    /// `unknown` mean the loop has more work to do.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FinishReason::Stop | FinishReason::Length | FinishReason::ContentFilter
        )
    }
}

/// Requested shape of the assistant's final answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputFormat {
    Text,
    JsonSchema {
        schema: Value,
        #[serde(rename = "retryCount", default = "default_retry_count")]
        retry_count: u32,
    },
}

fn default_retry_count() -> u32 {
    2
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTime {
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

/// Error persisted onto an assistant message when a step fails.
///
/// `Busy`, `NotFound` and argument errors are not here: they are
/// returned to the caller (or fed back to the model) without touching
/// the assistant row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum MessageError {
    #[serde(rename = "MessageOutputLengthError")]
    OutputLength { message: String },
    #[serde(rename = "MessageAbortedError")]
    Aborted { message: String },
    #[serde(rename = "ProviderAuthError")]
    Auth {
        #[serde(rename = "providerID")]
        provider_id: String,
        message: String,
    },
    #[serde(rename = "APIError")]
    Api {
        message: String,
        #[serde(rename = "statusCode", default, skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        #[serde(rename = "isRetryable")]
        retryable: bool,
    },
    #[serde(rename = "ContextOverflowError")]
    ContextOverflow { message: String },
    #[serde(rename = "StructuredOutputError")]
    StructuredOutput { message: String, retries: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub time: MessageTime,
    /// Agent this turn is addressed to.
    pub agent: String,
    pub model: ModelRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<OutputFormat>,
    /// Per-tool enable flags for this turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<HashMap<String, bool>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    /// The user message this assistant answers.
    #[serde(rename = "parentID")]
    pub parent_id: String,
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
    pub agent: String,
    pub time: MessageTime,
    pub cost: f64,
    pub tokens: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MessageError>,
    /// Set on assistants that hold a compaction summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<bool>,
    /// Structured-output payload when `format = json_schema`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
    /// Absent while the loop is still running or was interrupted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<FinishReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum MessageInfo {
    User(UserMessage),
    Assistant(AssistantMessage),
}

impl MessageInfo {
    pub fn id(&self) -> &str {
        match self {
            MessageInfo::User(m) => &m.id,
            MessageInfo::Assistant(m) => &m.id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            MessageInfo::User(m) => &m.session_id,
            MessageInfo::Assistant(m) => &m.session_id,
        }
    }

    pub fn created_at(&self) -> i64 {
        match self {
            MessageInfo::User(m) => m.time.created,
            MessageInfo::Assistant(m) => m.time.created,
        }
    }

    pub fn as_user(&self) -> Option<&UserMessage> {
        match self {
            MessageInfo::User(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            MessageInfo::Assistant(m) => Some(m),
            _ => None,
        }
    }
}

// ─── Parts ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

/// File payload carried by completed-tool attachments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub url: String,
}

/// Lifecycle of one tool invocation. Transitions are monotonic:
/// `pending → running → (completed | error)`; the store rejects
/// anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolState {
    Pending {
        input: Value,
    },
    Running {
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        time: TimeRange,
    },
    Completed {
        input: Value,
        output: String,
        title: String,
        metadata: Value,
        time: TimeRange,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachments: Option<Vec<FileAttachment>>,
    },
    Error {
        input: Value,
        error: String,
        time: TimeRange,
    },
}

impl ToolState {
    pub fn status(&self) -> &'static str {
        match self {
            ToolState::Pending { .. } => "pending",
            ToolState::Running { .. } => "running",
            ToolState::Completed { .. } => "completed",
            ToolState::Error { .. } => "error",
        }
    }

    /// Position in the pending → running → terminal order.
    pub fn rank(&self) -> u8 {
        match self {
            ToolState::Pending { .. } => 0,
            ToolState::Running { .. } => 1,
            ToolState::Completed { .. } | ToolState::Error { .. } => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PartBody {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        synthetic: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ignored: Option<bool>,
    },
    Reasoning {
        text: String,
        time: TimeRange,
    },
    File {
        mime: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<Value>,
    },
    Tool {
        #[serde(rename = "callID")]
        call_id: String,
        tool: String,
        state: ToolState,
    },
    StepStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<String>,
    },
    StepFinish {
        reason: FinishReason,
        cost: f64,
        tokens: TokenUsage,
    },
    Snapshot {
        snapshot: String,
    },
    Patch {
        hash: String,
        files: Vec<String>,
    },
    Agent {
        name: String,
    },
    Subtask {
        prompt: String,
        description: String,
        agent: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<ModelRef>,
    },
    Compaction {
        auto: bool,
    },
    Retry {
        attempt: u32,
        error: MessageError,
        time: TimeRange,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(flatten)]
    pub body: PartBody,
}

impl Part {
    pub fn tool_state(&self) -> Option<&ToolState> {
        match &self.body {
            PartBody::Tool { state, .. } => Some(state),
            _ => None,
        }
    }

    pub fn is_compaction(&self) -> bool {
        matches!(self.body, PartBody::Compaction { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageWithParts {
    pub info: MessageInfo,
    pub parts: Vec<Part>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn user_message_roundtrips_with_wire_names() {
        let msg = MessageInfo::User(UserMessage {
            id: "message_1_abc".into(),
            session_id: "session_1_abc".into(),
            time: MessageTime {
                created: 1000,
                completed: None,
            },
            agent: "build".into(),
            model: ModelRef::default(),
            system: None,
            format: None,
            tools: None,
        });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["role"], "user");
        assert_eq!(v["sessionID"], "session_1_abc");
        let back: MessageInfo = serde_json::from_value(v).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn assistant_error_uses_legacy_error_names() {
        let err = MessageError::Aborted {
            message: "stopped".into(),
        };
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["name"], "MessageAbortedError");
    }

    #[test]
    fn api_error_roundtrips_status_code() {
        let err = MessageError::Api {
            message: "bad gateway".into(),
            status_code: Some(502),
            retryable: true,
        };
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["name"], "APIError");
        assert_eq!(v["statusCode"], 502);
        let back: MessageError = serde_json::from_value(v).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn part_type_tags_are_kebab_case() {
        let part = Part {
            id: "part_1_a".into(),
            session_id: "s".into(),
            message_id: "m".into(),
            body: PartBody::StepFinish {
                reason: FinishReason::ToolCalls,
                cost: 0.0,
                tokens: TokenUsage::default(),
            },
        };
        let v = serde_json::to_value(&part).unwrap();
        assert_eq!(v["type"], "step-finish");
        assert_eq!(v["reason"], "tool-calls");
    }

    #[test]
    fn tool_part_roundtrips_call_id() {
        let part = Part {
            id: "part_1_a".into(),
            session_id: "s".into(),
            message_id: "m".into(),
            body: PartBody::Tool {
                call_id: "tc_1".into(),
                tool: "read".into(),
                state: ToolState::Pending {
                    input: json!({"filePath": "/tmp/x"}),
                },
            },
        };
        let v = serde_json::to_value(&part).unwrap();
        assert_eq!(v["type"], "tool");
        assert_eq!(v["callID"], "tc_1");
        assert_eq!(v["state"]["status"], "pending");
        let back: Part = serde_json::from_value(v).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn tool_state_rank_is_monotonic() {
        let pending = ToolState::Pending { input: json!({}) };
        let running = ToolState::Running {
            input: json!({}),
            title: None,
            metadata: None,
            time: TimeRange {
                start: 0,
                end: None,
            },
        };
        let done = ToolState::Completed {
            input: json!({}),
            output: "ok".into(),
            title: "read".into(),
            metadata: json!({}),
            time: TimeRange {
                start: 0,
                end: Some(1),
            },
            attachments: None,
        };
        assert!(pending.rank() < running.rank());
        assert!(running.rank() < done.rank());
    }

    #[test]
    fn finish_reason_wire_spelling() {
        assert_eq!(
            serde_json::to_value(FinishReason::ContentFilter).unwrap(),
            json!("content-filter")
        );
        assert_eq!(
            serde_json::to_value(FinishReason::ToolCalls).unwrap(),
            json!("tool-calls")
        );
    }

    #[test]
    fn output_format_json_schema_default_retries() {
        let f: OutputFormat =
            serde_json::from_value(json!({"type": "json_schema", "schema": {"type": "object"}}))
                .unwrap();
        match f {
            OutputFormat::JsonSchema { retry_count, .. } => assert_eq!(retry_count, 2),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn token_usage_add_is_componentwise() {
        let mut a = TokenUsage {
            input: 1,
            output: 2,
            reasoning: 3,
            cache: CacheUsage { read: 4, write: 5 },
            total: 15,
        };
        let b = a;
        a.add(&b);
        assert_eq!(a.input, 2);
        assert_eq!(a.cache.write, 10);
        assert_eq!(a.total, 30);
    }
}
