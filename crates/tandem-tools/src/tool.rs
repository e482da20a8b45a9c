// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ToolContext;
use crate::schema::ToolDescriptor;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model, forwarded verbatim.
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub args: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
}

/// File produced by a tool alongside its text output (e.g. a rendered
/// screenshot); attached to the completed tool part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolAttachment {
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub url: String,
}

/// The result of executing a tool. Error results are not fatal to the
/// agent loop — the model sees them and may react.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub status: ToolStatus,
    pub content: String,
    pub title: Option<String>,
    pub metadata: Option<Value>,
    pub attachments: Option<Vec<ToolAttachment>>,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Success,
            content: content.into(),
            title: None,
            metadata: None,
            attachments: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: ToolStatus::Error,
            content: message.clone(),
            title: None,
            metadata: None,
            attachments: None,
            error: Some(message),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<ToolAttachment>) -> Self {
        self.attachments = Some(attachments);
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }
}

/// The contract every tool implements.
///
/// The [`ToolContext`] is the tool's sole capability source: abort
/// signal, metadata sink, permission questions, working directory. A
/// tool must not reach around it. Long-running tools poll
/// `ctx.aborted()` (or select on the token) at every suspension point
/// and must reap any subprocess tree they spawned on cancellation and
/// on timeout.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    /// Whether the dispatcher may run this tool concurrently with other
    /// parallel-safe calls from the same step. Defaults to sequential.
    fn parallel_safe(&self) -> bool {
        false
    }

    /// Execute with validated arguments. Failures are reported through
    /// [`ToolResult::error`], not panics.
    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_result_has_no_error() {
        let r = ToolResult::ok("fine");
        assert_eq!(r.status, ToolStatus::Success);
        assert!(!r.is_error());
        assert!(r.error.is_none());
    }

    #[test]
    fn error_result_mirrors_message_into_content() {
        let r = ToolResult::error("nope");
        assert!(r.is_error());
        assert_eq!(r.content, "nope");
        assert_eq!(r.error.as_deref(), Some("nope"));
    }

    #[test]
    fn builders_attach_title_and_metadata() {
        let r = ToolResult::ok("body")
            .with_title("Read /tmp/x")
            .with_metadata(serde_json::json!({"lines": 10}));
        assert_eq!(r.title.as_deref(), Some("Read /tmp/x"));
        assert_eq!(r.metadata.unwrap()["lines"], 10);
    }
}
