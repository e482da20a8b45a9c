// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::context::ToolContext;
use crate::schema::ToolDescriptor;
use crate::tool::{Tool, ToolCall, ToolResult};

/// Central registry holding all available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.descriptor().name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> =
            self.tools.values().map(|t| t.descriptor()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Model-facing schemas, optionally filtered by per-tool enable
    /// flags (absent flag means enabled).
    pub fn schemas(&self, enabled: Option<&HashMap<String, bool>>) -> Vec<Value> {
        self.descriptors()
            .iter()
            .filter(|d| {
                enabled
                    .and_then(|flags| flags.get(&d.name))
                    .copied()
                    .unwrap_or(true)
            })
            .map(|d| d.input_schema())
            .collect()
    }

    pub fn parallel_safe(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.parallel_safe())
    }

    /// Validate arguments and run the executor. Unknown tools and
    /// schema mismatches come back as error results without the
    /// executor ever running; a fired abort token turns into
    /// `error="User aborted"`.
    pub async fn dispatch(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let Some(tool) = self.get(&call.name) else {
            return ToolResult::error(format!("unknown tool: {}", call.name));
        };
        let args = match tool.descriptor().validate(&call.args) {
            Ok(args) => args,
            Err(e) => return ToolResult::error(format!("invalid arguments: {e}")),
        };
        if ctx.aborted() {
            return ToolResult::error("User aborted");
        }
        debug!(tool = %call.name, call_id = %call.id, "dispatching tool");
        tokio::select! {
            biased;
            _ = ctx.abort_token().cancelled() => ToolResult::error("User aborted"),
            result = tool.execute(ctx, args) => result,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
