// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Outcome of matching a tool invocation against the rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    /// Always run without asking
    Allow,
    /// Ask the user before each invocation
    Ask,
    /// Never run; return an error
    Deny,
}

/// Request-side facts a rule's pattern can match against.
#[derive(Debug, Clone, Default)]
pub struct PermissionContext {
    /// Filesystem path the tool is about to touch, when known.
    pub path: Option<String>,
}

impl PermissionContext {
    pub fn for_path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }
}

/// One permission rule. Rules are evaluated newest-first; the first
/// match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub tool: String,
    pub level: PermissionLevel,
    /// Glob pattern (`*` and `?`) matched against `context.path`.
    /// A rule with a pattern does not match a request without a path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Expiry in milliseconds since epoch; an expired rule never matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Creation time in milliseconds since epoch.
    pub created_at: i64,
}

impl PermissionRule {
    pub fn new(tool: impl Into<String>, level: PermissionLevel) -> Self {
        Self {
            tool: tool.into(),
            level,
            pattern: None,
            expires_at: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn expiring_at(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn matches(&self, tool: &str, ctx: &PermissionContext, now_ms: i64) -> bool {
        if self.tool != tool {
            return false;
        }
        if let Some(expiry) = self.expires_at {
            if now_ms > expiry {
                return false;
            }
        }
        if let Some(pattern) = &self.pattern {
            let Some(path) = ctx.path.as_deref() else {
                return false;
            };
            match glob_to_regex(pattern) {
                Some(re) => {
                    if !re.is_match(path) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
pub(crate) fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
