// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;

use crate::provider::{CompletionStream, Provider, ProviderCaps, ProviderError};
use crate::types::{
    Completion, CompletionRequest, RawUsage, StopReason, StreamEvent, ToolCallRequest,
};

/// A pre-scripted provider. Each call to `complete` pops the next
/// completion from the front of the queue, so tests can specify exact
/// sequences — including tool calls — without network access.
pub struct ScriptedProvider {
    scripts: Mutex<Vec<Result<Completion, ProviderError>>>,
    caps: ProviderCaps,
    chunked_streaming: bool,
    /// The last request seen, so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Completion>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().map(Ok).collect()),
            caps: ProviderCaps::default(),
            chunked_streaming: false,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Script error outcomes alongside completions.
    pub fn with_outcomes(scripts: Vec<Result<Completion, ProviderError>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            caps: ProviderCaps::default(),
            chunked_streaming: false,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_caps(mut self, caps: ProviderCaps) -> Self {
        self.caps = caps;
        self
    }

    /// Make `stream` emit the content word-by-word before the terminal
    /// event, to exercise delta handling.
    pub fn chunked(mut self) -> Self {
        self.chunked_streaming = true;
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let completion = Completion {
            model_id: "scripted-model".into(),
            ..Completion::text(
                reply,
                RawUsage {
                    input: 5.0,
                    output: 5.0,
                    ..Default::default()
                },
            )
        };
        Self::new(vec![completion])
    }

    /// Convenience: one tool call, then a text reply.
    pub fn tool_then_text(
        call_id: impl Into<String>,
        tool: impl Into<String>,
        args: Value,
        final_text: impl Into<String>,
    ) -> Self {
        let usage = RawUsage {
            input: 10.0,
            output: 2.0,
            ..Default::default()
        };
        Self::new(vec![
            Completion {
                model_id: "scripted-model".into(),
                ..Completion::tool_calls(
                    vec![ToolCallRequest {
                        id: call_id.into(),
                        name: tool.into(),
                        arguments: args,
                    }],
                    usage,
                )
            },
            Completion {
                model_id: "scripted-model".into(),
                ..Completion::text(final_text, usage)
            },
        ])
    }

    fn pop(&self) -> Result<Completion, ProviderError> {
        let mut scripts = self.scripts.lock().expect("scripts lock");
        if scripts.is_empty() {
            // Fallback once every script is consumed.
            return Ok(Completion {
                model_id: "scripted-model".into(),
                stop: StopReason::Stop,
                ..Completion::text("[no more scripts]", RawUsage::default())
            });
        }
        scripts.remove(0)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn model_id(&self) -> &str {
        "scripted-model"
    }

    fn capabilities(&self) -> ProviderCaps {
        self.caps
    }

    async fn complete(&self, req: CompletionRequest) -> Result<Completion, ProviderError> {
        *self.last_request.lock().expect("request lock") = Some(req);
        self.pop()
    }

    async fn stream(&self, req: CompletionRequest) -> Result<CompletionStream, ProviderError> {
        *self.last_request.lock().expect("request lock") = Some(req);
        let completion = self.pop()?;
        let mut events: Vec<Result<StreamEvent, ProviderError>> = Vec::new();
        if self.chunked_streaming {
            if let Some(content) = &completion.content {
                for word in content.split_inclusive(' ') {
                    events.push(Ok(StreamEvent::TextDelta(word.to_string())));
                }
            }
        }
        events.push(Ok(StreamEvent::Finished(completion)));
        Ok(Box::pin(stream::iter(events)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;

    use crate::types::ModelMessage;

    use super::*;

    fn req() -> CompletionRequest {
        CompletionRequest {
            messages: vec![ModelMessage::user("hi")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scripts_pop_in_order() {
        let p = ScriptedProvider::tool_then_text("tc_1", "read", json!({"filePath": "/x"}), "done");
        let first = p.complete(req()).await.unwrap();
        assert_eq!(first.tool_calls.len(), 1);
        assert_eq!(first.stop, StopReason::ToolCalls);
        let second = p.complete(req()).await.unwrap();
        assert_eq!(second.content.as_deref(), Some("done"));
        assert_eq!(second.stop, StopReason::Stop);
    }

    #[tokio::test]
    async fn exhausted_scripts_fall_back() {
        let p = ScriptedProvider::new(vec![]);
        let c = p.complete(req()).await.unwrap();
        assert!(c.content.unwrap().contains("no more scripts"));
    }

    #[tokio::test]
    async fn last_request_is_recorded() {
        let p = ScriptedProvider::always_text("hey");
        let _ = p.complete(req()).await.unwrap();
        let seen = p.last_request.lock().unwrap();
        assert_eq!(seen.as_ref().unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn scripted_errors_surface() {
        let p = ScriptedProvider::with_outcomes(vec![Err(ProviderError::status(502, "bad"))]);
        let err = p.complete(req()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn default_stream_ends_with_finished() {
        let p = ScriptedProvider::always_text("streamed");
        let mut s = p.stream(req()).await.unwrap();
        let mut last = None;
        while let Some(ev) = s.next().await {
            last = Some(ev.unwrap());
        }
        assert!(matches!(last, Some(StreamEvent::Finished(_))));
    }

    #[tokio::test]
    async fn chunked_stream_emits_deltas_before_terminal() {
        let p = ScriptedProvider::always_text("two words").chunked();
        let mut s = p.stream(req()).await.unwrap();
        let mut deltas = String::new();
        let mut finished = None;
        while let Some(ev) = s.next().await {
            match ev.unwrap() {
                StreamEvent::TextDelta(d) => deltas.push_str(&d),
                StreamEvent::Finished(c) => finished = Some(c),
            }
        }
        assert_eq!(deltas, "two words");
        assert_eq!(finished.unwrap().content.as_deref(), Some("two words"));
    }
}
