// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The per-session agent loop.
//!
//! One prompt advances a session in discrete steps: build the wire
//! request from history, call the model, apply the returned tool calls,
//! repeat until a terminal assistant message exists. The session's busy
//! flag is held from intake until the terminal transition; a concurrent
//! prompt fails fast with `Busy`. All state changes route through the
//! store so invariants and events hold.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tandem_bus::Bus;
use tandem_config::{Config, ModelRef, DEFAULT_AGENT};
use tandem_model::{
    calculate_usage, Completion, CompletionRequest, ModelDescriptor, ModelMessage, Provider,
    ProviderError, ProviderRegistry, StopReason, StreamEvent, TokenCounts, ToolCallRequest,
};
use tandem_permission::{
    DenyReason, PermissionContext, PermissionEngine, PermissionLevel, PermissionRule,
};
use tandem_store::{
    events, AssistantMessage, CacheUsage, CreateSession, FileAttachment, FinishReason,
    MessageError, MessageInfo, MessageTime, MessageWithParts, OutputFormat, Part, PartBody,
    SessionInfo, Store, StoreError, TimeRange, TokenUsage, ToolState, UserMessage,
};
use tandem_tools::{ToolCall, ToolContext, ToolMetadataUpdate, ToolRegistry, ToolResult};

use crate::error::{classify_provider_error, SessionError};
use crate::history::{filter_compacted, project_history};
use crate::prompts;

/// One piece of user input before expansion into stored parts.
#[derive(Debug, Clone)]
pub enum InputPart {
    Text {
        text: String,
    },
    File {
        mime: String,
        filename: Option<String>,
        url: String,
    },
    /// Ask the primary agent to delegate to a named subagent.
    Agent {
        name: String,
    },
}

#[derive(Debug, Default)]
pub struct PromptInput {
    pub session_id: String,
    pub parts: Vec<InputPart>,
    pub message_id: Option<String>,
    pub agent: Option<String>,
    pub model: Option<ModelRef>,
    pub system: Option<String>,
    pub format: Option<OutputFormat>,
    /// Per-tool enable flags; also persisted as session permission rules.
    pub tools: Option<HashMap<String, bool>>,
    /// Store the user message without running the loop.
    pub no_reply: bool,
}

#[derive(Debug, Clone)]
pub struct SubtaskSpec {
    pub prompt: String,
    pub description: String,
    pub agent: String,
    pub model: Option<ModelRef>,
    /// Parent-session message the subtask part is recorded on.
    pub parent_message_id: Option<String>,
}

pub struct Orchestrator {
    store: Arc<Store>,
    bus: Bus,
    registry: Arc<ToolRegistry>,
    providers: Arc<ProviderRegistry>,
    permissions: Arc<PermissionEngine>,
    config: Arc<Config>,
    active: Mutex<HashMap<String, CancellationToken>>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Releases the busy flag when a prompt ends, normally or not.
struct BusyGuard<'a> {
    active: &'a Mutex<HashMap<String, CancellationToken>>,
    session_id: String,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .expect("active lock poisoned")
            .remove(&self.session_id);
    }
}

enum StepFailure {
    Aborted,
    Fatal(MessageError),
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        bus: Bus,
        registry: Arc<ToolRegistry>,
        providers: Arc<ProviderRegistry>,
        permissions: Arc<PermissionEngine>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            providers,
            permissions,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Fire the session's abort token. Returns false when no prompt is
    /// running there.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self
            .active
            .lock()
            .expect("active lock poisoned")
            .get(session_id)
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.active
            .lock()
            .expect("active lock poisoned")
            .contains_key(session_id)
    }

    /// Submit a user turn and drive the loop to a terminal assistant
    /// message (unless `no_reply` is set).
    pub async fn prompt(&self, input: PromptInput) -> Result<MessageWithParts, SessionError> {
        let session = self.store.get(&input.session_id)?;
        let abort = self.claim(&session.id)?;
        let _guard = BusyGuard {
            active: &self.active,
            session_id: session.id.clone(),
        };
        self.run_prompt(session, input, abort).await
    }

    /// Summarize the session so later steps can drop older history. The
    /// summary lands on an assistant answering a synthetic user message
    /// that carries the `compaction` part.
    pub async fn compact(
        &self,
        session_id: &str,
        auto: bool,
    ) -> Result<MessageWithParts, SessionError> {
        let session = self.store.get(session_id)?;
        let abort = self.claim(session_id)?;
        let _guard = BusyGuard {
            active: &self.active,
            session_id: session_id.to_string(),
        };
        self.store.set_compacting(session_id, Some(now_ms()))?;
        let result = self.run_compaction(&session, auto, &abort).await;
        let _ = self.store.set_compacting(session_id, None);
        result
    }

    /// Run a delegated task as a nested session linked to its parent.
    pub async fn run_subtask(
        &self,
        parent_session_id: &str,
        spec: SubtaskSpec,
    ) -> Result<MessageWithParts, SessionError> {
        let parent = self.store.get(parent_session_id)?;
        let child = self.store.create_session(CreateSession {
            parent_id: Some(parent.id.clone()),
            title: Some(format!("Subtask: {}", spec.description)),
            permission: parent.permission.clone(),
        })?;
        if let Some(message_id) = &spec.parent_message_id {
            self.upsert_new_part(
                &parent.id,
                message_id,
                PartBody::Subtask {
                    prompt: spec.prompt.clone(),
                    description: spec.description.clone(),
                    agent: spec.agent.clone(),
                    model: spec.model.clone(),
                },
            )?;
        }
        self.prompt(PromptInput {
            session_id: child.id,
            parts: vec![InputPart::Text {
                text: spec.prompt,
            }],
            agent: Some(spec.agent),
            model: spec.model,
            ..Default::default()
        })
        .await
    }

    fn claim(&self, session_id: &str) -> Result<CancellationToken, SessionError> {
        let mut active = self.active.lock().expect("active lock poisoned");
        if active.contains_key(session_id) {
            return Err(SessionError::Busy(session_id.to_string()));
        }
        let token = CancellationToken::new();
        active.insert(session_id.to_string(), token.clone());
        Ok(token)
    }

    // ── Prompt intake ────────────────────────────────────────────────────────

    async fn run_prompt(
        &self,
        session: SessionInfo,
        input: PromptInput,
        abort: CancellationToken,
    ) -> Result<MessageWithParts, SessionError> {
        let agent_name = input
            .agent
            .clone()
            .unwrap_or_else(|| DEFAULT_AGENT.to_string());
        let agent_cfg = self.config.agent(&agent_name);
        let model = input
            .model
            .clone()
            .or_else(|| agent_cfg.model.clone())
            .unwrap_or_else(|| self.config.model.clone());

        let user = UserMessage {
            id: input
                .message_id
                .clone()
                .unwrap_or_else(|| self.store.ids().message_id()),
            session_id: session.id.clone(),
            time: MessageTime {
                created: now_ms(),
                completed: None,
            },
            agent: agent_name,
            model,
            system: input.system.clone(),
            format: input.format.clone(),
            tools: input.tools.clone(),
        };
        self.store.upsert_message(&MessageInfo::User(user.clone()))?;
        let parts = self.expand_parts(&session.id, &user.id, input.parts);
        for part in &parts {
            self.store.upsert_part(part)?;
        }
        self.store.touch(&session.id)?;

        // Per-tool enable flags double as session permission rules.
        if let Some(flags) = &input.tools {
            let rules: Vec<PermissionRule> = flags
                .iter()
                .map(|(tool, enabled)| {
                    let level = if *enabled {
                        PermissionLevel::Allow
                    } else {
                        PermissionLevel::Deny
                    };
                    PermissionRule::new(tool.clone(), level).with_pattern("*")
                })
                .collect();
            self.store.set_permission(&session.id, rules)?;
        }

        if input.no_reply {
            return Ok(MessageWithParts {
                info: MessageInfo::User(user),
                parts,
            });
        }
        self.run_loop(&session.id, &abort).await
    }

    /// Expand raw input parts into stored parts. File parts pointing at
    /// local paths or data URLs become synthetic Read-style text parts
    /// (plus the retained file part for attribution); `agent` parts gain
    /// the delegation directive.
    fn expand_parts(
        &self,
        session_id: &str,
        message_id: &str,
        inputs: Vec<InputPart>,
    ) -> Vec<Part> {
        let mut parts = Vec::new();
        for input in inputs {
            match input {
                InputPart::Text { text } => {
                    parts.push(self.new_part(
                        session_id,
                        message_id,
                        PartBody::Text {
                            text,
                            synthetic: None,
                            ignored: None,
                        },
                    ));
                }
                InputPart::Agent { name } => {
                    parts.push(self.new_part(
                        session_id,
                        message_id,
                        PartBody::Agent { name: name.clone() },
                    ));
                    parts.push(self.synthetic_text(
                        session_id,
                        message_id,
                        prompts::subtask_directive(&name),
                    ));
                }
                InputPart::File {
                    mime,
                    filename,
                    url,
                } => {
                    parts.extend(self.expand_file_part(
                        session_id, message_id, mime, filename, url,
                    ));
                }
            }
        }
        parts
    }

    fn expand_file_part(
        &self,
        session_id: &str,
        message_id: &str,
        mime: String,
        filename: Option<String>,
        url: String,
    ) -> Vec<Part> {
        let file_part = |url: String| {
            self.new_part(
                session_id,
                message_id,
                PartBody::File {
                    mime: mime.clone(),
                    filename: filename.clone(),
                    url,
                    source: None,
                },
            )
        };

        if let Some(rest) = url.strip_prefix("data:") {
            if mime == "text/plain" {
                let b64 = rest.split_once(',').map(|(_, b)| b).unwrap_or(rest);
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok());
                let Some(text) = decoded else {
                    return vec![self.synthetic_text(
                        session_id,
                        message_id,
                        format!(
                            "Read tool failed to decode inline file {}",
                            filename.as_deref().unwrap_or("(unnamed)")
                        ),
                    )];
                };
                let shown = filename.clone().unwrap_or_else(|| "inline".to_string());
                return vec![
                    self.synthetic_text(session_id, message_id, prompts::file_read_text(&shown)),
                    self.synthetic_text(session_id, message_id, text),
                    file_part(url),
                ];
            }
            return vec![file_part(url)];
        }

        if let Some(path) = url.strip_prefix("file://") {
            if mime == "text/plain" {
                return match std::fs::read_to_string(path) {
                    Ok(content) => vec![
                        self.synthetic_text(
                            session_id,
                            message_id,
                            prompts::file_read_text(path),
                        ),
                        self.synthetic_text(session_id, message_id, content),
                        file_part(url),
                    ],
                    Err(e) => vec![self.synthetic_text(
                        session_id,
                        message_id,
                        format!("Read tool failed to read {path}: {e}"),
                    )],
                };
            }
            return match std::fs::read(path) {
                Ok(bytes) => {
                    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                    vec![
                        self.synthetic_text(
                            session_id,
                            message_id,
                            prompts::file_read_text(path),
                        ),
                        file_part(format!("data:{mime};base64,{encoded}")),
                    ]
                }
                Err(e) => vec![self.synthetic_text(
                    session_id,
                    message_id,
                    format!("Failed to read file {path}: {e}"),
                )],
            };
        }

        vec![file_part(url)]
    }

    // ── The loop ─────────────────────────────────────────────────────────────

    async fn run_loop(
        &self,
        session_id: &str,
        abort: &CancellationToken,
    ) -> Result<MessageWithParts, SessionError> {
        let max_steps = self.config.runtime.max_steps;
        let mut structured_attempts: u32 = 0;
        let mut step: u32 = 0;

        loop {
            step += 1;
            if abort.is_cancelled() {
                return Err(SessionError::Aborted(session_id.to_string()));
            }

            let history = self.store.list_messages(session_id, None)?;
            let visible = filter_compacted(&history);

            let last_user_idx = visible
                .iter()
                .rposition(|m| m.info.as_user().is_some())
                .ok_or_else(|| {
                    SessionError::NotFound(format!("no user message in session {session_id}"))
                })?;
            let last_user = visible[last_user_idx]
                .info
                .as_user()
                .expect("checked above")
                .clone();

            // Only assistants newer than the last user message count as
            // this turn's progress.
            if let Some(done) = visible[last_user_idx..]
                .iter()
                .rev()
                .find_map(|m| m.info.as_assistant())
                .filter(|a| a.finish.is_some_and(|f| f.is_terminal()))
            {
                return Ok(self.store.get_message_with_parts(session_id, &done.id)?);
            }

            if step > max_steps {
                debug!(session_id, max_steps, "step budget exhausted");
                return self.finish_max_steps(session_id, &last_user);
            }

            let provider = self
                .providers
                .resolve(&last_user.model.provider_id, &last_user.model.model_id)
                .ok_or_else(|| {
                    SessionError::NotFound(format!(
                        "provider {}/{}",
                        last_user.model.provider_id, last_user.model.model_id
                    ))
                })?;
            let descriptor = self
                .providers
                .descriptor(&last_user.model.provider_id, &last_user.model.model_id)
                .unwrap_or_else(|| ModelDescriptor {
                    provider_id: last_user.model.provider_id.clone(),
                    model_id: last_user.model.model_id.clone(),
                    ..Default::default()
                });
            let caps = provider.capabilities();
            let agent_cfg = self.config.agent(&last_user.agent);

            let mut assistant = AssistantMessage {
                id: self.store.ids().message_id(),
                session_id: session_id.to_string(),
                parent_id: last_user.id.clone(),
                provider_id: last_user.model.provider_id.clone(),
                model_id: last_user.model.model_id.clone(),
                agent: last_user.agent.clone(),
                time: MessageTime {
                    created: now_ms(),
                    completed: None,
                },
                cost: 0.0,
                tokens: TokenUsage::default(),
                error: None,
                summary: None,
                structured: None,
                finish: None,
            };
            self.store
                .upsert_message(&MessageInfo::Assistant(assistant.clone()))?;
            self.upsert_new_part(session_id, &assistant.id, PartBody::StepStart { snapshot: None })?;

            // Wire request: system message, projected history, tools.
            let mut wire = project_history(&visible);
            let structured_format =
                matches!(last_user.format, Some(OutputFormat::JsonSchema { .. }));
            let mut system_text = agent_cfg
                .system_prompt
                .clone()
                .or_else(|| last_user.system.clone());
            if structured_format {
                system_text = Some(match system_text {
                    Some(s) => format!("{s}\n\n{}", prompts::STRUCTURED_OUTPUT_SYSTEM_PROMPT),
                    None => prompts::STRUCTURED_OUTPUT_SYSTEM_PROMPT.to_string(),
                });
            }
            if let Some(system) = system_text {
                wire.insert(0, ModelMessage::system(system));
            }

            let flags = merge_tool_flags(agent_cfg.tools.as_ref(), last_user.tools.as_ref());
            let mut tool_schemas = self.registry.schemas(flags.as_ref());
            if let Some(OutputFormat::JsonSchema { schema, .. }) = &last_user.format {
                tool_schemas.push(prompts::structured_output_schema(schema));
            }

            let req = CompletionRequest {
                messages: wire,
                tools: tool_schemas,
                temperature: agent_cfg.temperature,
            };

            let (completion, delta_part) = match self
                .call_model(provider.as_ref(), req, session_id, &assistant.id, abort)
                .await
            {
                Ok(done) => done,
                Err(StepFailure::Aborted) => {
                    return self.finish_aborted(session_id, assistant);
                }
                Err(StepFailure::Fatal(error)) => {
                    assistant.error = Some(error);
                    assistant.time.completed = Some(now_ms());
                    self.store
                        .upsert_message(&MessageInfo::Assistant(assistant.clone()))?;
                    return Ok(self
                        .store
                        .get_message_with_parts(session_id, &assistant.id)?);
                }
            };

            let usage = calculate_usage(&descriptor, &completion.usage, &caps);
            assistant.cost += usage.cost;
            let step_tokens = to_token_usage(&usage.tokens);
            assistant.tokens.add(&step_tokens);

            if let Some(reasoning) = completion
                .reasoning
                .as_ref()
                .filter(|r| !r.is_empty())
            {
                self.upsert_new_part(
                    session_id,
                    &assistant.id,
                    PartBody::Reasoning {
                        text: reasoning.clone(),
                        time: TimeRange {
                            start: assistant.time.created,
                            end: Some(now_ms()),
                        },
                    },
                )?;
            }

            let content = completion.content.clone().unwrap_or_default();
            if !content.is_empty() {
                let part = Part {
                    id: delta_part
                        .clone()
                        .unwrap_or_else(|| self.store.ids().part_id()),
                    session_id: session_id.to_string(),
                    message_id: assistant.id.clone(),
                    body: PartBody::Text {
                        text: content.clone(),
                        synthetic: None,
                        ignored: None,
                    },
                };
                self.store.upsert_part(&part)?;
            }

            let tool_calls = sanitize_tool_calls(completion.tool_calls.clone());
            if !tool_calls.is_empty() {
                // Structured-output tool call is the terminal answer.
                if structured_format {
                    if let Some(call) = tool_calls
                        .iter()
                        .find(|c| c.name == prompts::STRUCTURED_OUTPUT_TOOL)
                    {
                        return self.finish_structured(session_id, assistant, call, &step_tokens, usage.cost);
                    }
                }

                assistant.finish = Some(FinishReason::ToolCalls);
                assistant.time.completed = Some(now_ms());
                self.store
                    .upsert_message(&MessageInfo::Assistant(assistant.clone()))?;
                self.upsert_new_part(
                    session_id,
                    &assistant.id,
                    PartBody::StepFinish {
                        reason: FinishReason::ToolCalls,
                        cost: usage.cost,
                        tokens: step_tokens,
                    },
                )?;

                let aborted = self
                    .run_tool_calls(session_id, &assistant, &last_user, &tool_calls, abort)
                    .await?;
                if aborted {
                    return self.finish_aborted(session_id, assistant);
                }
                continue;
            }

            // No tool calls. Structured mode nudges the model until the
            // retry budget runs out.
            if structured_format {
                let retry_count = match &last_user.format {
                    Some(OutputFormat::JsonSchema { retry_count, .. }) => *retry_count,
                    _ => 0,
                };
                if structured_attempts < retry_count {
                    structured_attempts += 1;
                    assistant.finish = Some(FinishReason::Unknown);
                    assistant.time.completed = Some(now_ms());
                    self.store
                        .upsert_message(&MessageInfo::Assistant(assistant.clone()))?;
                    self.append_synthetic_user(
                        session_id,
                        &last_user,
                        prompts::STRUCTURED_OUTPUT_RETRY_NUDGE,
                    )?;
                    continue;
                }
                assistant.error = Some(MessageError::StructuredOutput {
                    message: "the StructuredOutput tool was not called".into(),
                    retries: structured_attempts,
                });
                assistant.time.completed = Some(now_ms());
                self.store
                    .upsert_message(&MessageInfo::Assistant(assistant.clone()))?;
                return Ok(self
                    .store
                    .get_message_with_parts(session_id, &assistant.id)?);
            }

            // No content and no tool calls: give up on this turn.
            let finish = if content.is_empty() {
                FinishReason::Unknown
            } else {
                match completion.stop {
                    StopReason::Length => {
                        assistant.error = Some(MessageError::OutputLength {
                            message: "model stopped at the output token limit".into(),
                        });
                        FinishReason::Length
                    }
                    StopReason::ContentFilter => FinishReason::ContentFilter,
                    _ => FinishReason::Stop,
                }
            };
            assistant.finish = Some(finish);
            assistant.time.completed = Some(now_ms());
            self.store
                .upsert_message(&MessageInfo::Assistant(assistant.clone()))?;
            self.upsert_new_part(
                session_id,
                &assistant.id,
                PartBody::StepFinish {
                    reason: finish,
                    cost: usage.cost,
                    tokens: step_tokens,
                },
            )?;
            return Ok(self
                .store
                .get_message_with_parts(session_id, &assistant.id)?);
        }
    }

    // ── Model calls ──────────────────────────────────────────────────────────

    /// Call the model with retry/backoff for retryable transport
    /// failures, recording a `retry` part before each backoff sleep.
    /// Returns the completion plus the part id used for streamed text
    /// deltas (when any were published).
    async fn call_model(
        &self,
        provider: &dyn Provider,
        req: CompletionRequest,
        session_id: &str,
        assistant_id: &str,
        abort: &CancellationToken,
    ) -> Result<(Completion, Option<String>), StepFailure> {
        let mut attempt: u32 = 0;
        loop {
            match self
                .stream_once(provider, req.clone(), session_id, assistant_id, abort)
                .await
            {
                Ok(done) => return Ok(done),
                Err(StepFailure::Aborted) => return Err(StepFailure::Aborted),
                Err(StepFailure::Fatal(classified)) => {
                    let retryable = matches!(
                        classified,
                        MessageError::Api {
                            retryable: true,
                            ..
                        }
                    );
                    attempt += 1;
                    if !retryable || attempt > self.config.runtime.retry_attempts {
                        return Err(StepFailure::Fatal(classified));
                    }
                    warn!(attempt, "retryable provider error; backing off");
                    if self
                        .upsert_new_part(
                            session_id,
                            assistant_id,
                            PartBody::Retry {
                                attempt,
                                error: classified,
                                time: TimeRange {
                                    start: now_ms(),
                                    end: None,
                                },
                            },
                        )
                        .is_err()
                    {
                        return Err(StepFailure::Fatal(MessageError::Api {
                            message: "failed to record retry".into(),
                            status_code: None,
                            retryable: false,
                        }));
                    }
                    let exp = (attempt - 1).min(8);
                    let delay = Duration::from_millis(
                        self.config
                            .runtime
                            .retry_base_delay_ms
                            .saturating_mul(1u64 << exp),
                    );
                    tokio::select! {
                        biased;
                        _ = abort.cancelled() => return Err(StepFailure::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One streaming attempt. Text deltas are published as
    /// `message.part.delta` events; the store is written once with the
    /// final text by the caller.
    async fn stream_once(
        &self,
        provider: &dyn Provider,
        req: CompletionRequest,
        session_id: &str,
        assistant_id: &str,
        abort: &CancellationToken,
    ) -> Result<(Completion, Option<String>), StepFailure> {
        let fatal = |e: &ProviderError| StepFailure::Fatal(classify_provider_error(e));

        let mut stream = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(StepFailure::Aborted),
            result = provider.stream(req) => result.map_err(|e| fatal(&e))?,
        };

        let delta_part_id = self.store.ids().part_id();
        let mut any_delta = false;
        let mut completion: Option<Completion> = None;
        loop {
            let event = tokio::select! {
                biased;
                _ = abort.cancelled() => return Err(StepFailure::Aborted),
                event = stream.next() => event,
            };
            match event {
                None => break,
                Some(Err(e)) => return Err(fatal(&e)),
                Some(Ok(StreamEvent::TextDelta(delta))) => {
                    any_delta = true;
                    self.bus.emit(
                        events::TOPIC_PART_DELTA,
                        events::part_delta_payload(
                            session_id,
                            assistant_id,
                            &delta_part_id,
                            "text",
                            &delta,
                        ),
                    );
                }
                Some(Ok(StreamEvent::Finished(c))) => completion = Some(c),
            }
        }
        match completion {
            Some(c) => Ok((c, any_delta.then_some(delta_part_id))),
            None => Err(StepFailure::Fatal(MessageError::Api {
                message: "stream ended without a terminal event".into(),
                status_code: None,
                retryable: true,
            })),
        }
    }

    // ── Tool execution ───────────────────────────────────────────────────────

    /// Run a step's tool calls in call order. Consecutive parallel-safe
    /// calls run concurrently within the worker budget; everything else
    /// is sequential. Returns true when the abort signal fired.
    async fn run_tool_calls(
        &self,
        session_id: &str,
        assistant: &AssistantMessage,
        last_user: &UserMessage,
        calls: &[ToolCallRequest],
        abort: &CancellationToken,
    ) -> Result<bool, SessionError> {
        let session = self.store.get(session_id)?;
        let session_rules = session.permission.clone().unwrap_or_default();
        let working_dir = PathBuf::from(&session.directory);

        // Phase 1: a pending part per call, in call order.
        let mut part_ids = Vec::with_capacity(calls.len());
        for call in calls {
            let part_id = self.upsert_new_part(
                session_id,
                &assistant.id,
                PartBody::Tool {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    state: ToolState::Pending {
                        input: call.arguments.clone(),
                    },
                },
            )?;
            part_ids.push(part_id);
        }

        // Phase 2: execute.
        let mut results: Vec<Option<ToolResult>> = vec![None; calls.len()];
        let mut i = 0;
        while i < calls.len() {
            if abort.is_cancelled() {
                break;
            }
            if self.registry.parallel_safe(&calls[i].name) {
                let mut j = i + 1;
                while j < calls.len() && self.registry.parallel_safe(&calls[j].name) {
                    j += 1;
                }
                let budget = self.config.runtime.parallel_tool_budget.max(1);
                let mut k = i;
                while k < j {
                    let end = (k + budget).min(j);
                    let batch = futures::future::join_all((k..end).map(|idx| {
                        self.run_one_tool(
                            session_id,
                            &assistant.id,
                            &part_ids[idx],
                            &calls[idx],
                            &last_user.agent,
                            &working_dir,
                            &session_rules,
                            abort,
                        )
                    }))
                    .await;
                    for (offset, result) in batch.into_iter().enumerate() {
                        results[k + offset] = Some(result?);
                    }
                    k = end;
                }
                i = j;
            } else {
                let result = self
                    .run_one_tool(
                        session_id,
                        &assistant.id,
                        &part_ids[i],
                        &calls[i],
                        &last_user.agent,
                        &working_dir,
                        &session_rules,
                        abort,
                    )
                    .await?;
                results[i] = Some(result);
                i += 1;
            }
        }

        let aborted = abort.is_cancelled();

        // Phase 3: feed results back as synthetic user turns, in call
        // order; calls the abort pre-empted get terminal error parts.
        for (idx, call) in calls.iter().enumerate() {
            match &results[idx] {
                Some(result) if !aborted => {
                    self.append_synthetic_user(
                        session_id,
                        last_user,
                        &prompts::tool_result_text(&call.name, &result.content),
                    )?;
                }
                Some(_) => {}
                None => {
                    self.store.upsert_part(&Part {
                        id: part_ids[idx].clone(),
                        session_id: session_id.to_string(),
                        message_id: assistant.id.clone(),
                        body: PartBody::Tool {
                            call_id: call.id.clone(),
                            tool: call.name.clone(),
                            state: ToolState::Error {
                                input: call.arguments.clone(),
                                error: "User aborted".into(),
                                time: TimeRange {
                                    start: now_ms(),
                                    end: Some(now_ms()),
                                },
                            },
                        },
                    })?;
                }
            }
        }

        Ok(aborted)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_one_tool(
        &self,
        session_id: &str,
        assistant_id: &str,
        part_id: &str,
        call: &ToolCallRequest,
        agent: &str,
        working_dir: &PathBuf,
        session_rules: &[PermissionRule],
        abort: &CancellationToken,
    ) -> Result<ToolResult, SessionError> {
        let started = now_ms();
        let running = |title: Option<String>, metadata: Option<Value>| PartBody::Tool {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            state: ToolState::Running {
                input: call.arguments.clone(),
                title,
                metadata,
                time: TimeRange {
                    start: started,
                    end: None,
                },
            },
        };
        self.store.upsert_part(&Part {
            id: part_id.to_string(),
            session_id: session_id.to_string(),
            message_id: assistant_id.to_string(),
            body: running(None, None),
        })?;

        // Forward partial title/metadata onto the running part until the
        // tool finishes.
        let (meta_tx, mut meta_rx) = mpsc::unbounded_channel::<ToolMetadataUpdate>();
        let forwarder = {
            let store = Arc::clone(&self.store);
            let part_id = part_id.to_string();
            let session_id = session_id.to_string();
            let assistant_id = assistant_id.to_string();
            let call_id = call.id.clone();
            let tool_name = call.name.clone();
            let input = call.arguments.clone();
            tokio::spawn(async move {
                while let Some(update) = meta_rx.recv().await {
                    let part = Part {
                        id: part_id.clone(),
                        session_id: session_id.clone(),
                        message_id: assistant_id.clone(),
                        body: PartBody::Tool {
                            call_id: call_id.clone(),
                            tool: tool_name.clone(),
                            state: ToolState::Running {
                                input: input.clone(),
                                title: update.title,
                                metadata: update.metadata,
                                time: TimeRange {
                                    start: started,
                                    end: None,
                                },
                            },
                        },
                    };
                    if let Err(e) = store.upsert_part(&part) {
                        debug!(error = %e, "dropping tool metadata update");
                    }
                }
            })
        };

        let path = call
            .arguments
            .get("filePath")
            .or_else(|| call.arguments.get("path"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let permitted = self
            .permissions
            .resolve(
                session_rules,
                &call.name,
                &PermissionContext { path },
                call.arguments.clone(),
                abort,
            )
            .await;

        let result = match permitted {
            Err(denied) if denied.reason == DenyReason::Cancelled => {
                ToolResult::error("User aborted")
            }
            Err(_) => ToolResult::error(format!("permission denied for tool '{}'", call.name)),
            Ok(()) => {
                let ctx = ToolContext::new(
                    session_id,
                    assistant_id,
                    &call.id,
                    agent,
                    working_dir.clone(),
                    abort.clone(),
                )
                .with_metadata_sink(meta_tx.clone())
                .with_permissions(Arc::clone(&self.permissions), session_rules.to_vec());
                let tool_call = ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    args: call.arguments.clone(),
                };
                let timeout = Duration::from_millis(self.config.runtime.tool_timeout_ms);
                tokio::select! {
                    biased;
                    result = self.registry.dispatch(&tool_call, &ctx) => result,
                    _ = tokio::time::sleep(timeout) => {
                        ToolResult::error(format!(
                            "Tool execution timed out after {}ms",
                            self.config.runtime.tool_timeout_ms
                        ))
                        .with_metadata(json!({"timeout": true}))
                    }
                }
            }
        };

        // Close the sink and drain the forwarder before the terminal
        // write, so no late running-update can race it.
        drop(meta_tx);
        let _ = forwarder.await;

        let ended = now_ms();
        let state = if result.is_error() {
            ToolState::Error {
                input: call.arguments.clone(),
                error: result
                    .error
                    .clone()
                    .unwrap_or_else(|| result.content.clone()),
                time: TimeRange {
                    start: started,
                    end: Some(ended),
                },
            }
        } else {
            ToolState::Completed {
                input: call.arguments.clone(),
                output: truncate_output(&result.content, self.config.runtime.tool_output_cap),
                title: result.title.clone().unwrap_or_else(|| call.name.clone()),
                metadata: result.metadata.clone().unwrap_or_else(|| json!({})),
                time: TimeRange {
                    start: started,
                    end: Some(ended),
                },
                attachments: result.attachments.clone().map(|list| {
                    list.into_iter()
                        .map(|a| FileAttachment {
                            mime: a.mime,
                            filename: a.filename,
                            url: a.url,
                        })
                        .collect()
                }),
            }
        };
        self.store.upsert_part(&Part {
            id: part_id.to_string(),
            session_id: session_id.to_string(),
            message_id: assistant_id.to_string(),
            body: PartBody::Tool {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                state,
            },
        })?;

        Ok(result)
    }

    // ── Terminal transitions ─────────────────────────────────────────────────

    fn finish_aborted(
        &self,
        session_id: &str,
        mut assistant: AssistantMessage,
    ) -> Result<MessageWithParts, SessionError> {
        // Any tool part still pending/running belongs to this aborted
        // step; close it out.
        let message = self
            .store
            .get_message_with_parts(session_id, &assistant.id)?;
        for part in &message.parts {
            if let PartBody::Tool {
                call_id,
                tool,
                state,
            } = &part.body
            {
                if state.rank() < 2 {
                    let input = match state {
                        ToolState::Pending { input } | ToolState::Running { input, .. } => {
                            input.clone()
                        }
                        _ => json!({}),
                    };
                    self.store.upsert_part(&Part {
                        id: part.id.clone(),
                        session_id: session_id.to_string(),
                        message_id: assistant.id.clone(),
                        body: PartBody::Tool {
                            call_id: call_id.clone(),
                            tool: tool.clone(),
                            state: ToolState::Error {
                                input,
                                error: "User aborted".into(),
                                time: TimeRange {
                                    start: now_ms(),
                                    end: Some(now_ms()),
                                },
                            },
                        },
                    })?;
                }
            }
        }
        assistant.error = Some(MessageError::Aborted {
            message: "the user aborted this request".into(),
        });
        assistant.time.completed = Some(now_ms());
        self.store
            .upsert_message(&MessageInfo::Assistant(assistant.clone()))?;
        Ok(self
            .store
            .get_message_with_parts(session_id, &assistant.id)?)
    }

    fn finish_max_steps(
        &self,
        session_id: &str,
        last_user: &UserMessage,
    ) -> Result<MessageWithParts, SessionError> {
        let assistant = AssistantMessage {
            id: self.store.ids().message_id(),
            session_id: session_id.to_string(),
            parent_id: last_user.id.clone(),
            provider_id: last_user.model.provider_id.clone(),
            model_id: last_user.model.model_id.clone(),
            agent: last_user.agent.clone(),
            time: MessageTime {
                created: now_ms(),
                completed: Some(now_ms()),
            },
            cost: 0.0,
            tokens: TokenUsage::default(),
            error: None,
            summary: None,
            structured: None,
            finish: Some(FinishReason::Length),
        };
        self.store
            .upsert_message(&MessageInfo::Assistant(assistant.clone()))?;
        self.upsert_new_part(
            session_id,
            &assistant.id,
            PartBody::Text {
                text: prompts::MAX_STEPS_TEXT.to_string(),
                synthetic: Some(true),
                ignored: None,
            },
        )?;
        Ok(self
            .store
            .get_message_with_parts(session_id, &assistant.id)?)
    }

    fn finish_structured(
        &self,
        session_id: &str,
        mut assistant: AssistantMessage,
        call: &ToolCallRequest,
        step_tokens: &TokenUsage,
        step_cost: f64,
    ) -> Result<MessageWithParts, SessionError> {
        self.upsert_new_part(
            session_id,
            &assistant.id,
            PartBody::Tool {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                state: ToolState::Completed {
                    input: call.arguments.clone(),
                    output: String::new(),
                    title: call.name.clone(),
                    metadata: json!({}),
                    time: TimeRange {
                        start: now_ms(),
                        end: Some(now_ms()),
                    },
                    attachments: None,
                },
            },
        )?;
        assistant.structured = Some(call.arguments.clone());
        assistant.finish = Some(FinishReason::Stop);
        assistant.time.completed = Some(now_ms());
        self.store
            .upsert_message(&MessageInfo::Assistant(assistant.clone()))?;
        self.upsert_new_part(
            session_id,
            &assistant.id,
            PartBody::StepFinish {
                reason: FinishReason::Stop,
                cost: step_cost,
                tokens: *step_tokens,
            },
        )?;
        Ok(self
            .store
            .get_message_with_parts(session_id, &assistant.id)?)
    }

    // ── Compaction ───────────────────────────────────────────────────────────

    async fn run_compaction(
        &self,
        session: &SessionInfo,
        auto: bool,
        abort: &CancellationToken,
    ) -> Result<MessageWithParts, SessionError> {
        let history = self.store.list_messages(&session.id, None)?;
        let visible = filter_compacted(&history);
        let model = visible
            .iter()
            .rev()
            .find_map(|m| m.info.as_user().map(|u| u.model.clone()))
            .unwrap_or_else(|| self.config.model.clone());

        let user = UserMessage {
            id: self.store.ids().message_id(),
            session_id: session.id.clone(),
            time: MessageTime {
                created: now_ms(),
                completed: None,
            },
            agent: "compaction".into(),
            model: model.clone(),
            system: None,
            format: None,
            tools: None,
        };
        self.store.upsert_message(&MessageInfo::User(user.clone()))?;
        self.upsert_new_part(&session.id, &user.id, PartBody::Compaction { auto })?;

        let provider = self
            .providers
            .resolve(&model.provider_id, &model.model_id)
            .ok_or_else(|| {
                SessionError::NotFound(format!(
                    "provider {}/{}",
                    model.provider_id, model.model_id
                ))
            })?;
        let descriptor = self
            .providers
            .descriptor(&model.provider_id, &model.model_id)
            .unwrap_or_else(|| ModelDescriptor {
                provider_id: model.provider_id.clone(),
                model_id: model.model_id.clone(),
                ..Default::default()
            });
        let caps = provider.capabilities();

        let mut wire = project_history(&visible);
        wire.insert(0, ModelMessage::system(prompts::COMPACTION_PROMPT));
        wire.push(ModelMessage::user("What did we do so far?"));

        let mut assistant = AssistantMessage {
            id: self.store.ids().message_id(),
            session_id: session.id.clone(),
            parent_id: user.id.clone(),
            provider_id: model.provider_id.clone(),
            model_id: model.model_id.clone(),
            agent: "compaction".into(),
            time: MessageTime {
                created: now_ms(),
                completed: None,
            },
            cost: 0.0,
            tokens: TokenUsage::default(),
            error: None,
            summary: Some(true),
            structured: None,
            finish: None,
        };
        self.store
            .upsert_message(&MessageInfo::Assistant(assistant.clone()))?;

        let req = CompletionRequest {
            messages: wire,
            tools: Vec::new(),
            temperature: None,
        };
        match self
            .call_model(provider.as_ref(), req, &session.id, &assistant.id, abort)
            .await
        {
            Ok((completion, delta_part)) => {
                let usage = calculate_usage(&descriptor, &completion.usage, &caps);
                assistant.cost = usage.cost;
                assistant.tokens = to_token_usage(&usage.tokens);
                let summary = completion.content.unwrap_or_default();
                if !summary.is_empty() {
                    self.store.upsert_part(&Part {
                        id: delta_part.unwrap_or_else(|| self.store.ids().part_id()),
                        session_id: session.id.clone(),
                        message_id: assistant.id.clone(),
                        body: PartBody::Text {
                            text: summary,
                            synthetic: None,
                            ignored: None,
                        },
                    })?;
                }
                assistant.finish = Some(FinishReason::Stop);
                assistant.time.completed = Some(now_ms());
                self.store
                    .upsert_message(&MessageInfo::Assistant(assistant.clone()))?;
                Ok(self
                    .store
                    .get_message_with_parts(&session.id, &assistant.id)?)
            }
            Err(StepFailure::Aborted) => self.finish_aborted(&session.id, assistant),
            Err(StepFailure::Fatal(error)) => {
                assistant.error = Some(error);
                assistant.time.completed = Some(now_ms());
                self.store
                    .upsert_message(&MessageInfo::Assistant(assistant.clone()))?;
                Ok(self
                    .store
                    .get_message_with_parts(&session.id, &assistant.id)?)
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn new_part(&self, session_id: &str, message_id: &str, body: PartBody) -> Part {
        Part {
            id: self.store.ids().part_id(),
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            body,
        }
    }

    fn synthetic_text(&self, session_id: &str, message_id: &str, text: impl Into<String>) -> Part {
        self.new_part(
            session_id,
            message_id,
            PartBody::Text {
                text: text.into(),
                synthetic: Some(true),
                ignored: None,
            },
        )
    }

    fn upsert_new_part(
        &self,
        session_id: &str,
        message_id: &str,
        body: PartBody,
    ) -> Result<String, StoreError> {
        let part = Part {
            id: self.store.ids().part_id(),
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            body,
        };
        self.store.upsert_part(&part)?;
        Ok(part.id)
    }

    /// Append a synthetic user message carrying `text`. The new message
    /// inherits the turn's agent/model/format/tools so the next step
    /// resolves the same way.
    fn append_synthetic_user(
        &self,
        session_id: &str,
        last_user: &UserMessage,
        text: &str,
    ) -> Result<(), SessionError> {
        let message = UserMessage {
            id: self.store.ids().message_id(),
            session_id: session_id.to_string(),
            time: MessageTime {
                created: now_ms(),
                completed: None,
            },
            agent: last_user.agent.clone(),
            model: last_user.model.clone(),
            system: last_user.system.clone(),
            format: last_user.format.clone(),
            tools: last_user.tools.clone(),
        };
        self.store
            .upsert_message(&MessageInfo::User(message.clone()))?;
        let part = self.synthetic_text(session_id, &message.id, text);
        self.store.upsert_part(&part)?;
        Ok(())
    }
}

fn merge_tool_flags(
    agent: Option<&HashMap<String, bool>>,
    user: Option<&HashMap<String, bool>>,
) -> Option<HashMap<String, bool>> {
    match (agent, user) {
        (None, None) => None,
        (a, u) => {
            let mut merged = a.cloned().unwrap_or_default();
            if let Some(u) = u {
                for (k, v) in u {
                    merged.insert(k.clone(), *v);
                }
            }
            Some(merged)
        }
    }
}

fn to_token_usage(counts: &TokenCounts) -> TokenUsage {
    TokenUsage {
        input: counts.input,
        output: counts.output,
        reasoning: counts.reasoning,
        cache: CacheUsage {
            read: counts.cache_read,
            write: counts.cache_write,
        },
        total: counts.total,
    }
}

/// Hygiene for model-emitted tool calls: a call with an empty name
/// cannot be dispatched and is dropped; an empty id (which would poison
/// the replayed history) gets a synthetic one; non-object arguments
/// degrade to `{}`.
fn sanitize_tool_calls(calls: Vec<ToolCallRequest>) -> Vec<ToolCallRequest> {
    let mut out = Vec::with_capacity(calls.len());
    for (i, mut call) in calls.into_iter().enumerate() {
        if call.name.is_empty() {
            warn!(call_id = %call.id, "dropping tool call with empty name; cannot dispatch");
            continue;
        }
        if call.id.is_empty() {
            call.id = format!("tc_synthetic_{i}");
            warn!(
                tool = %call.name,
                call_id = %call.id,
                "tool call had empty id; generated synthetic id"
            );
        }
        if !call.arguments.is_object() {
            if !call.arguments.is_null() {
                warn!(tool = %call.name, "tool call arguments were not an object; substituting {{}}");
            }
            call.arguments = Value::Object(Default::default());
        }
        out.push(call);
    }
    out
}

/// Cap persisted tool output, cutting on a char boundary.
fn truncate_output(content: &str, cap: usize) -> String {
    if content.len() <= cap {
        return content.to_string();
    }
    let mut cut = cap;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = content[..cut].to_string();
    out.push_str("\n[output truncated]");
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
