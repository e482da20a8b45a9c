// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Agent used when a prompt does not name one.
pub const DEFAULT_AGENT: &str = "build";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Model used when neither the prompt nor the agent names one.
    #[serde(default)]
    pub model: ModelRef,
    /// Named agent configurations, keyed by agent name.
    ///
    /// ```toml
    /// [agents.review]
    /// system_prompt = "You review diffs and nothing else."
    /// temperature = 0.2
    ///
    /// [agents.review.tools]
    /// write = false
    /// shell = false
    /// ```
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
}

impl Config {
    /// Look up an agent, falling back to an all-defaults config so an
    /// unknown agent name still produces a usable runtime.
    pub fn agent(&self, name: &str) -> AgentConfig {
        self.agents.get(name).cloned().unwrap_or_default()
    }
}

/// Knobs for the agent loop and tool dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Hard ceiling on model calls per prompt before the loop gives up.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Tool output is truncated to this many characters before it is
    /// persisted onto the tool part.
    #[serde(default = "default_tool_output_cap")]
    pub tool_output_cap: usize,
    /// Deadline for a single tool execution.
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    /// Retry budget for retryable provider errors (5xx, connection reset).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base delay for exponential backoff between provider retries.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Worker budget when a batch of parallel-safe tool calls runs
    /// concurrently.
    #[serde(default = "default_parallel_tool_budget")]
    pub parallel_tool_budget: usize,
}

fn default_max_steps() -> u32 {
    50
}
fn default_tool_output_cap() -> usize {
    30_000
}
fn default_tool_timeout_ms() -> u64 {
    120_000
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_parallel_tool_budget() -> usize {
    4
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            tool_output_cap: default_tool_output_cap(),
            tool_timeout_ms: default_tool_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            parallel_tool_budget: default_parallel_tool_budget(),
        }
    }
}

/// Provider + model pair. Serialized as `providerID` / `modelID` so the
/// value round-trips through persisted message rows unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl Default for ModelRef {
    fn default() -> Self {
        Self {
            provider_id: "anthropic".into(),
            model_id: "claude-sonnet-4-20250514".into(),
        }
    }
}

/// A named agent: which model it runs, what it is told, which tools it
/// may see, how hot it samples.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    pub model: Option<ModelRef>,
    pub system_prompt: Option<String>,
    /// Per-tool enable flags. Absent means "all registered tools".
    pub tools: Option<HashMap<String, bool>>,
    pub temperature: Option<f32>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
