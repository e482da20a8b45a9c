// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::types::{Completion, CompletionRequest, StreamEvent};

pub type CompletionStream =
    Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;

/// Capabilities an adapter declares about itself, so the loop never has
/// to guess from names.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderCaps {
    /// Whether the provider's `input` token count already excludes
    /// cached tokens (Anthropic-family, Bedrock). When false, cached
    /// tokens are subtracted from `input` during accounting.
    pub excludes_cached_input: bool,
    /// Whether the adapter can stream while tools are supplied.
    /// Adapters that cannot must degrade to non-streaming.
    pub tool_streaming: bool,
}

/// Errors surfaced by adapters. The loop classifies these into the
/// session-level error taxonomy.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider '{provider_id}' rejected credentials: {message}")]
    Auth { provider_id: String, message: String },

    #[error("api error ({status:?}): {message}")]
    Api {
        status: Option<u16>,
        message: String,
        retryable: bool,
    },

    #[error("context window exceeded: {message}")]
    ContextOverflow { message: String },
}

impl ProviderError {
    /// Transport failure with a status code; retryable iff 5xx.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        ProviderError::Api {
            status: Some(status),
            message: message.into(),
            retryable: status >= 500,
        }
    }

    /// Connection reset mid-request; always retryable.
    pub fn connection_reset() -> Self {
        ProviderError::Api {
            status: None,
            message: "connection reset by server".into(),
            retryable: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Api { retryable: true, .. })
    }
}

/// The contract the agent loop consumes to talk to any LLM backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    fn model_id(&self) -> &str;

    fn capabilities(&self) -> ProviderCaps {
        ProviderCaps::default()
    }

    /// One non-streaming completion.
    async fn complete(&self, req: CompletionRequest) -> Result<Completion, ProviderError>;

    /// Streaming completion: text deltas followed by exactly one
    /// terminal [`StreamEvent::Finished`] carrying content, tool calls
    /// and usage.
    ///
    /// The default degrades to [`complete`](Self::complete) wrapped in
    /// a single terminal event, which is also the required behaviour
    /// for adapters that cannot stream with tools attached.
    async fn stream(&self, req: CompletionRequest) -> Result<CompletionStream, ProviderError> {
        let completion = self.complete(req).await?;
        Ok(Box::pin(futures::stream::iter([Ok(StreamEvent::Finished(
            completion,
        ))])))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
