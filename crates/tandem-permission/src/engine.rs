// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tandem_bus::Bus;
use tandem_id::IdService;

use crate::rule::{PermissionContext, PermissionLevel, PermissionRule};

pub const TOPIC_PERMISSION_REQUESTED: &str = "permission.requested";
pub const TOPIC_PERMISSION_REPLIED: &str = "permission.replied";

/// Answer to a permission question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow,
    Deny,
}

/// Why a tool invocation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// A deny rule matched.
    Rule,
    /// The user answered the question with deny.
    Answer,
    /// The abort signal fired while the question was pending.
    Cancelled,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("permission denied for tool '{tool}'")]
pub struct PermissionDenied {
    pub tool: String,
    pub reason: DenyReason,
}

/// Process-wide permission engine.
///
/// Two rule lists: session-scoped rules (cleared when the process's
/// interactive session ends) are evaluated before persistent rules;
/// within each list the newest rule wins. An unmatched request defaults
/// to [`PermissionLevel::Ask`].
pub struct PermissionEngine {
    bus: Bus,
    ids: Arc<IdService>,
    rules: Mutex<Vec<PermissionRule>>,
    session_rules: Mutex<Vec<PermissionRule>>,
    pending: Mutex<HashMap<String, oneshot::Sender<PermissionDecision>>>,
}

impl PermissionEngine {
    /// Engine with no rules at all. Prefer [`PermissionEngine::with_defaults`].
    pub fn new(bus: Bus, ids: Arc<IdService>) -> Self {
        Self {
            bus,
            ids,
            rules: Mutex::new(Vec::new()),
            session_rules: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Engine seeded with the stock ruleset: `read` and `search` run
    /// freely, mutating tools ask first.
    pub fn with_defaults(bus: Bus, ids: Arc<IdService>) -> Self {
        let engine = Self::new(bus, ids);
        {
            let mut rules = engine.rules.lock().expect("rules lock");
            for tool in ["read", "search"] {
                rules.push(PermissionRule::new(tool, PermissionLevel::Allow));
            }
            for tool in ["write", "edit", "shell", "bash"] {
                rules.push(PermissionRule::new(tool, PermissionLevel::Ask));
            }
        }
        engine
    }

    /// Evaluate `tool` against the rule sets.
    pub fn check(&self, tool: &str, ctx: &PermissionContext) -> PermissionLevel {
        self.check_with(&[], tool, ctx)
    }

    /// Like [`check`](Self::check) but with caller-supplied rules (e.g.
    /// a session's own ruleset) evaluated before everything else.
    pub fn check_with(
        &self,
        extra: &[PermissionRule],
        tool: &str,
        ctx: &PermissionContext,
    ) -> PermissionLevel {
        let now = chrono::Utc::now().timestamp_millis();
        for rule in extra.iter().rev() {
            if rule.matches(tool, ctx, now) {
                return rule.level;
            }
        }
        for rule in self.session_rules.lock().expect("rules lock").iter().rev() {
            if rule.matches(tool, ctx, now) {
                return rule.level;
            }
        }
        for rule in self.rules.lock().expect("rules lock").iter().rev() {
            if rule.matches(tool, ctx, now) {
                return rule.level;
            }
        }
        PermissionLevel::Ask
    }

    pub fn add_rule(&self, rule: PermissionRule, session_only: bool) {
        if session_only {
            self.session_rules.lock().expect("rules lock").push(rule);
        } else {
            self.rules.lock().expect("rules lock").push(rule);
        }
    }

    /// Remove rules matching the given tool and/or pattern. Returns the
    /// number removed across both lists.
    pub fn remove_rules(&self, tool: Option<&str>, pattern: Option<&str>) -> usize {
        let keep = |r: &PermissionRule| {
            let tool_hit = tool.map_or(true, |t| r.tool == t);
            let pattern_hit = pattern.map_or(true, |p| r.pattern.as_deref() == Some(p));
            !(tool_hit && pattern_hit)
        };
        let mut removed = 0;
        for list in [&self.rules, &self.session_rules] {
            let mut list = list.lock().expect("rules lock");
            let before = list.len();
            list.retain(keep);
            removed += before - list.len();
        }
        removed
    }

    pub fn list_rules(&self) -> Vec<PermissionRule> {
        let mut out = self.rules.lock().expect("rules lock").clone();
        out.extend(self.session_rules.lock().expect("rules lock").iter().cloned());
        out
    }

    pub fn clear_session_rules(&self) {
        self.session_rules.lock().expect("rules lock").clear();
    }

    /// Publish a permission question and suspend until it is answered
    /// via [`reply`](Self::reply) or the abort token fires (which
    /// resolves as deny).
    pub async fn ask(
        &self,
        tool: &str,
        pattern: Option<&str>,
        metadata: Value,
        abort: &CancellationToken,
    ) -> PermissionDecision {
        let request_id = self.ids.request_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock")
            .insert(request_id.clone(), tx);

        self.bus.emit(
            TOPIC_PERMISSION_REQUESTED,
            json!({
                "requestID": request_id,
                "tool": tool,
                "pattern": pattern,
                "metadata": metadata,
            }),
        );

        tokio::select! {
            biased;
            _ = abort.cancelled() => {
                self.pending.lock().expect("pending lock").remove(&request_id);
                debug!(tool, request_id = %request_id, "permission question cancelled");
                PermissionDecision::Deny
            }
            answer = rx => answer.unwrap_or(PermissionDecision::Deny),
        }
    }

    /// Answer a pending question. Returns false when the request id is
    /// unknown (already answered or cancelled).
    pub fn reply(
        &self,
        request_id: &str,
        decision: PermissionDecision,
        note: Option<&str>,
    ) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("pending lock")
            .remove(request_id);
        let Some(sender) = sender else {
            return false;
        };
        let delivered = sender.send(decision).is_ok();
        self.bus.emit(
            TOPIC_PERMISSION_REPLIED,
            json!({
                "requestID": request_id,
                "decision": decision,
                "note": note,
            }),
        );
        delivered
    }

    /// Full adjudication for the dispatcher: rule check, then a blocking
    /// question when rules demand one.
    pub async fn resolve(
        &self,
        extra: &[PermissionRule],
        tool: &str,
        ctx: &PermissionContext,
        metadata: Value,
        abort: &CancellationToken,
    ) -> Result<(), PermissionDenied> {
        match self.check_with(extra, tool, ctx) {
            PermissionLevel::Allow => Ok(()),
            PermissionLevel::Deny => Err(PermissionDenied {
                tool: tool.to_string(),
                reason: DenyReason::Rule,
            }),
            PermissionLevel::Ask => {
                if abort.is_cancelled() {
                    return Err(PermissionDenied {
                        tool: tool.to_string(),
                        reason: DenyReason::Cancelled,
                    });
                }
                match self.ask(tool, ctx.path.as_deref(), metadata, abort).await {
                    PermissionDecision::Allow => Ok(()),
                    PermissionDecision::Deny => Err(PermissionDenied {
                        tool: tool.to_string(),
                        reason: if abort.is_cancelled() {
                            DenyReason::Cancelled
                        } else {
                            DenyReason::Answer
                        },
                    }),
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tandem_bus::HandlerFlow;

    use super::*;

    fn engine() -> PermissionEngine {
        PermissionEngine::with_defaults(Bus::new(), Arc::new(IdService::new()))
    }

    #[test]
    fn defaults_allow_read_and_search() {
        let e = engine();
        let ctx = PermissionContext::default();
        assert_eq!(e.check("read", &ctx), PermissionLevel::Allow);
        assert_eq!(e.check("search", &ctx), PermissionLevel::Allow);
    }

    #[test]
    fn defaults_ask_for_mutating_tools() {
        let e = engine();
        let ctx = PermissionContext::default();
        for tool in ["write", "edit", "shell", "bash"] {
            assert_eq!(e.check(tool, &ctx), PermissionLevel::Ask, "{tool}");
        }
    }

    #[test]
    fn unknown_tool_defaults_to_ask() {
        let e = engine();
        assert_eq!(
            e.check("unknown", &PermissionContext::default()),
            PermissionLevel::Ask
        );
    }

    #[test]
    fn newest_rule_wins() {
        let e = engine();
        e.add_rule(PermissionRule::new("read", PermissionLevel::Deny), false);
        assert_eq!(
            e.check("read", &PermissionContext::default()),
            PermissionLevel::Deny
        );
    }

    #[test]
    fn session_rules_beat_persistent_rules() {
        let e = engine();
        e.add_rule(PermissionRule::new("write", PermissionLevel::Deny), false);
        e.add_rule(PermissionRule::new("write", PermissionLevel::Allow), true);
        assert_eq!(
            e.check("write", &PermissionContext::default()),
            PermissionLevel::Allow
        );
        e.clear_session_rules();
        assert_eq!(
            e.check("write", &PermissionContext::default()),
            PermissionLevel::Deny
        );
    }

    #[test]
    fn extra_rules_beat_everything() {
        let e = engine();
        e.add_rule(PermissionRule::new("write", PermissionLevel::Deny), true);
        let extra = vec![PermissionRule::new("write", PermissionLevel::Allow)];
        assert_eq!(
            e.check_with(&extra, "write", &PermissionContext::default()),
            PermissionLevel::Allow
        );
    }

    #[test]
    fn remove_rules_by_tool() {
        let e = engine();
        let removed = e.remove_rules(Some("read"), None);
        assert_eq!(removed, 1);
        assert_eq!(
            e.check("read", &PermissionContext::default()),
            PermissionLevel::Ask
        );
    }

    #[tokio::test]
    async fn ask_resolves_with_reply() {
        let bus = Bus::new();
        let ids = Arc::new(IdService::new());
        let e = Arc::new(PermissionEngine::new(bus.clone(), ids));

        // Auto-answer every question with allow, like a UI would.
        let answerer = Arc::clone(&e);
        let _sub = bus.subscribe(TOPIC_PERMISSION_REQUESTED, move |ev| {
            let id = ev.payload["requestID"].as_str().unwrap().to_string();
            let engine = Arc::clone(&answerer);
            // Reply from another task so ask() is already suspended.
            tokio::spawn(async move {
                engine.reply(&id, PermissionDecision::Allow, Some("ok"));
            });
            HandlerFlow::Continue
        });

        let abort = CancellationToken::new();
        let decision = e.ask("write", Some("/tmp/x"), json!({}), &abort).await;
        assert_eq!(decision, PermissionDecision::Allow);
    }

    #[tokio::test]
    async fn cancelled_question_resolves_as_deny() {
        let e = engine();
        let abort = CancellationToken::new();
        abort.cancel();
        let decision = e.ask("write", None, json!({}), &abort).await;
        assert_eq!(decision, PermissionDecision::Deny);
    }

    #[tokio::test]
    async fn reply_to_unknown_request_returns_false() {
        let e = engine();
        assert!(!e.reply("req_bogus", PermissionDecision::Allow, None));
    }

    #[tokio::test]
    async fn resolve_allows_without_question_for_allow_rule() {
        let bus = Bus::new();
        let asked = Arc::new(AtomicUsize::new(0));
        let a = asked.clone();
        let _sub = bus.subscribe(TOPIC_PERMISSION_REQUESTED, move |_| {
            a.fetch_add(1, Ordering::SeqCst);
            HandlerFlow::Continue
        });
        let e = PermissionEngine::with_defaults(bus, Arc::new(IdService::new()));
        let abort = CancellationToken::new();
        e.resolve(&[], "read", &PermissionContext::default(), json!({}), &abort)
            .await
            .unwrap();
        assert_eq!(asked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resolve_deny_rule_is_immediate() {
        let e = engine();
        e.add_rule(PermissionRule::new("shell", PermissionLevel::Deny), false);
        let abort = CancellationToken::new();
        let err = e
            .resolve(&[], "shell", &PermissionContext::default(), json!({}), &abort)
            .await
            .unwrap_err();
        assert_eq!(err.reason, DenyReason::Rule);
    }
}
