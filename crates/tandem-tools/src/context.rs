// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tandem_permission::{PermissionContext, PermissionDenied, PermissionEngine, PermissionRule};

/// Partial progress forwarded to the owning tool part while a tool is
/// still running.
#[derive(Debug, Clone)]
pub struct ToolMetadataUpdate {
    pub call_id: String,
    pub title: Option<String>,
    pub metadata: Option<Value>,
}

/// Per-call execution context: the tool's sole capability source.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub message_id: String,
    pub call_id: String,
    /// Name of the invoking agent.
    pub agent: String,
    pub working_dir: PathBuf,
    abort: CancellationToken,
    metadata_tx: Option<mpsc::UnboundedSender<ToolMetadataUpdate>>,
    permissions: Option<Arc<PermissionEngine>>,
    session_rules: Vec<PermissionRule>,
}

impl ToolContext {
    pub fn new(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        call_id: impl Into<String>,
        agent: impl Into<String>,
        working_dir: PathBuf,
        abort: CancellationToken,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            message_id: message_id.into(),
            call_id: call_id.into(),
            agent: agent.into(),
            working_dir,
            abort,
            metadata_tx: None,
            permissions: None,
            session_rules: Vec::new(),
        }
    }

    /// Attach the channel that forwards partial output/description to
    /// the owning tool part.
    pub fn with_metadata_sink(mut self, tx: mpsc::UnboundedSender<ToolMetadataUpdate>) -> Self {
        self.metadata_tx = Some(tx);
        self
    }

    /// Attach the permission engine plus the session's own ruleset.
    pub fn with_permissions(
        mut self,
        engine: Arc<PermissionEngine>,
        session_rules: Vec<PermissionRule>,
    ) -> Self {
        self.permissions = Some(engine);
        self.session_rules = session_rules;
        self
    }

    pub fn aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub fn session_rules(&self) -> &[PermissionRule] {
        &self.session_rules
    }

    /// Forward a title/metadata update to the owning tool part. Silently
    /// dropped when no sink is attached (tests, fire-and-forget tools).
    pub fn update(&self, title: Option<String>, metadata: Option<Value>) {
        if let Some(tx) = &self.metadata_tx {
            let _ = tx.send(ToolMetadataUpdate {
                call_id: self.call_id.clone(),
                title,
                metadata,
            });
        }
    }

    /// Ask permission for an operation on `path`. Suspends on an `ask`
    /// rule until the question is answered; a fired abort token resolves
    /// as deny. Without an attached engine everything is allowed — that
    /// wiring only exists in tests.
    pub async fn ask(
        &self,
        tool: &str,
        path: Option<&str>,
        metadata: Value,
    ) -> Result<(), PermissionDenied> {
        let Some(engine) = &self.permissions else {
            return Ok(());
        };
        let ctx = PermissionContext {
            path: path.map(str::to_string),
        };
        engine
            .resolve(&self.session_rules, tool, &ctx, metadata, &self.abort)
            .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ctx() -> ToolContext {
        ToolContext::new(
            "session_1_a",
            "message_1_a",
            "tool_1_a",
            "build",
            PathBuf::from("/work"),
            CancellationToken::new(),
        )
    }

    #[test]
    fn update_without_sink_is_a_noop() {
        ctx().update(Some("title".into()), None);
    }

    #[test]
    fn update_forwards_call_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = ctx().with_metadata_sink(tx);
        ctx.update(None, Some(json!({"progress": 1})));
        let update = rx.try_recv().unwrap();
        assert_eq!(update.call_id, "tool_1_a");
        assert_eq!(update.metadata.unwrap()["progress"], 1);
    }

    #[test]
    fn aborted_reflects_token() {
        let token = CancellationToken::new();
        let ctx = ToolContext::new(
            "s",
            "m",
            "c",
            "build",
            PathBuf::from("/"),
            token.clone(),
        );
        assert!(!ctx.aborted());
        token.cancel();
        assert!(ctx.aborted());
    }

    #[tokio::test]
    async fn ask_without_engine_allows() {
        assert!(ctx().ask("write", Some("/tmp/x"), json!({})).await.is_ok());
    }
}
