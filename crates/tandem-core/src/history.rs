// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! History shaping: the compaction filter and the provider wire
//! projection.

use tandem_model::{ContentBlock, MessageContent, ModelMessage, Role, ToolOutcome};
use tandem_store::{MessageError, MessageInfo, MessageWithParts, PartBody, ToolState};

/// Drop history that an active compaction point has replaced.
///
/// The compaction point is the most recent user message that carries a
/// `compaction` part **and** is answered by a finished assistant. Only
/// messages strictly after that assistant survive; the compaction pair
/// itself is dropped along with everything older.
pub fn filter_compacted(messages: &[MessageWithParts]) -> Vec<&MessageWithParts> {
    let mut boundary: Option<usize> = None;
    for (i, msg) in messages.iter().enumerate() {
        let MessageInfo::User(user) = &msg.info else {
            continue;
        };
        if !msg.parts.iter().any(|p| p.is_compaction()) {
            continue;
        }
        // Index of the last finished assistant answering this user.
        let answered = messages
            .iter()
            .enumerate()
            .skip(i)
            .filter(|(_, m)| {
                m.info
                    .as_assistant()
                    .is_some_and(|a| a.parent_id == user.id && a.finish.is_some())
            })
            .map(|(j, _)| j)
            .next_back();
        if let Some(j) = answered {
            boundary = Some(j);
        }
    }
    match boundary {
        Some(j) => messages.iter().skip(j + 1).collect(),
        None => messages.iter().collect(),
    }
}

/// Project persisted history onto the provider wire format.
pub fn project_history(messages: &[&MessageWithParts]) -> Vec<ModelMessage> {
    let mut out = Vec::new();
    for msg in messages {
        if msg.parts.is_empty() {
            continue;
        }
        match &msg.info {
            MessageInfo::User(_) => {
                if let Some(m) = project_user(msg) {
                    out.push(m);
                }
            }
            MessageInfo::Assistant(info) => {
                // Errored assistants are replayed only when they were
                // aborted mid-flight with real content to show.
                if let Some(error) = &info.error {
                    let aborted_with_content = matches!(error, MessageError::Aborted { .. })
                        && msg.parts.iter().any(|p| {
                            !matches!(
                                p.body,
                                PartBody::StepStart { .. } | PartBody::Reasoning { .. }
                            )
                        });
                    if !aborted_with_content {
                        continue;
                    }
                }
                if let Some(m) = project_assistant(msg) {
                    out.push(m);
                }
            }
        }
    }
    out
}

fn project_user(msg: &MessageWithParts) -> Option<ModelMessage> {
    let mut blocks = Vec::new();
    for part in &msg.parts {
        match &part.body {
            PartBody::Text { text, ignored, .. } => {
                if !ignored.unwrap_or(false) {
                    blocks.push(ContentBlock::Text { text: text.clone() });
                }
            }
            PartBody::File {
                mime,
                filename,
                url,
                ..
            } => {
                // Plain-text files were already expanded into synthetic
                // text parts at intake.
                if mime != "text/plain" && mime != "application/x-directory" {
                    blocks.push(ContentBlock::File {
                        url: url.clone(),
                        media_type: mime.clone(),
                        filename: filename.clone(),
                    });
                }
            }
            PartBody::Compaction { .. } => blocks.push(ContentBlock::Text {
                text: "What did we do so far?".into(),
            }),
            PartBody::Subtask { .. } => blocks.push(ContentBlock::Text {
                text: "The following tool was executed by the user".into(),
            }),
            _ => {}
        }
    }
    if blocks.is_empty() {
        return None;
    }
    Some(ModelMessage {
        role: Role::User,
        content: MessageContent::Blocks(blocks),
    })
}

fn project_assistant(msg: &MessageWithParts) -> Option<ModelMessage> {
    let mut blocks = Vec::new();
    for part in &msg.parts {
        match &part.body {
            PartBody::Text { text, .. } => blocks.push(ContentBlock::Text { text: text.clone() }),
            PartBody::Reasoning { text, .. } => {
                blocks.push(ContentBlock::Reasoning { text: text.clone() })
            }
            PartBody::StepStart { .. } => blocks.push(ContentBlock::StepStart),
            PartBody::Tool {
                call_id,
                tool,
                state,
            } => {
                let outcome = match state {
                    ToolState::Completed { output, .. } => ToolOutcome::Output(output.clone()),
                    ToolState::Error { error, .. } => ToolOutcome::Error(error.clone()),
                    ToolState::Pending { .. } | ToolState::Running { .. } => {
                        ToolOutcome::Interrupted
                    }
                };
                let input = match state {
                    ToolState::Pending { input }
                    | ToolState::Running { input, .. }
                    | ToolState::Completed { input, .. }
                    | ToolState::Error { input, .. } => input.clone(),
                };
                blocks.push(ContentBlock::ToolResult {
                    tool: tool.clone(),
                    call_id: call_id.clone(),
                    input,
                    outcome,
                });
            }
            _ => {}
        }
    }
    if blocks.is_empty() {
        return None;
    }
    Some(ModelMessage {
        role: Role::Assistant,
        content: MessageContent::Blocks(blocks),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tandem_config::ModelRef;
    use tandem_store::{
        AssistantMessage, FinishReason, MessageTime, Part, TimeRange, TokenUsage, UserMessage,
    };

    use super::*;

    fn user(id: &str) -> MessageInfo {
        MessageInfo::User(UserMessage {
            id: id.into(),
            session_id: "s".into(),
            time: MessageTime {
                created: 0,
                completed: None,
            },
            agent: "build".into(),
            model: ModelRef::default(),
            system: None,
            format: None,
            tools: None,
        })
    }

    fn assistant(id: &str, parent: &str, finish: Option<FinishReason>) -> MessageInfo {
        MessageInfo::Assistant(AssistantMessage {
            id: id.into(),
            session_id: "s".into(),
            parent_id: parent.into(),
            provider_id: "p".into(),
            model_id: "m".into(),
            agent: "build".into(),
            time: MessageTime {
                created: 0,
                completed: None,
            },
            cost: 0.0,
            tokens: TokenUsage::default(),
            error: None,
            summary: None,
            structured: None,
            finish,
        })
    }

    fn text_part(id: &str, message_id: &str, text: &str) -> Part {
        Part {
            id: id.into(),
            session_id: "s".into(),
            message_id: message_id.into(),
            body: PartBody::Text {
                text: text.into(),
                synthetic: None,
                ignored: None,
            },
        }
    }

    fn with_parts(info: MessageInfo, parts: Vec<Part>) -> MessageWithParts {
        MessageWithParts { info, parts }
    }

    fn compaction_part(id: &str, message_id: &str) -> Part {
        Part {
            id: id.into(),
            session_id: "s".into(),
            message_id: message_id.into(),
            body: PartBody::Compaction { auto: false },
        }
    }

    #[test]
    fn filter_keeps_everything_without_compaction() {
        let messages = vec![
            with_parts(user("u1"), vec![text_part("p1", "u1", "hi")]),
            with_parts(assistant("a1", "u1", Some(FinishReason::Stop)), vec![]),
        ];
        assert_eq!(filter_compacted(&messages).len(), 2);
    }

    #[test]
    fn filter_drops_history_through_compaction_pair() {
        // u1, a1, u2(+compaction), a2(finished), u3, a3 → only u3, a3.
        let messages = vec![
            with_parts(user("u1"), vec![text_part("p1", "u1", "one")]),
            with_parts(
                assistant("a1", "u1", Some(FinishReason::Stop)),
                vec![text_part("p2", "a1", "r1")],
            ),
            with_parts(user("u2"), vec![compaction_part("p3", "u2")]),
            with_parts(
                assistant("a2", "u2", Some(FinishReason::Stop)),
                vec![text_part("p4", "a2", "summary")],
            ),
            with_parts(user("u3"), vec![text_part("p5", "u3", "three")]),
            with_parts(
                assistant("a3", "u3", Some(FinishReason::Stop)),
                vec![text_part("p6", "a3", "r3")],
            ),
        ];
        let filtered = filter_compacted(&messages);
        let ids: Vec<&str> = filtered.iter().map(|m| m.info.id()).collect();
        assert_eq!(ids, vec!["u3", "a3"]);
    }

    #[test]
    fn unanswered_compaction_does_not_filter() {
        let messages = vec![
            with_parts(user("u1"), vec![text_part("p1", "u1", "one")]),
            with_parts(user("u2"), vec![compaction_part("p2", "u2")]),
        ];
        assert_eq!(filter_compacted(&messages).len(), 2);
    }

    #[test]
    fn projection_skips_empty_messages() {
        let messages = vec![with_parts(user("u1"), vec![])];
        let refs: Vec<&MessageWithParts> = messages.iter().collect();
        assert!(project_history(&refs).is_empty());
    }

    #[test]
    fn projection_skips_ignored_text() {
        let mut part = text_part("p1", "u1", "secret");
        part.body = PartBody::Text {
            text: "secret".into(),
            synthetic: None,
            ignored: Some(true),
        };
        let messages = vec![with_parts(user("u1"), vec![part])];
        let refs: Vec<&MessageWithParts> = messages.iter().collect();
        assert!(project_history(&refs).is_empty());
    }

    #[test]
    fn compaction_part_projects_as_recap_question() {
        let messages = vec![with_parts(user("u1"), vec![compaction_part("p1", "u1")])];
        let refs: Vec<&MessageWithParts> = messages.iter().collect();
        let projected = project_history(&refs);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected[0].as_text(), Some("What did we do so far?"));
    }

    #[test]
    fn errored_assistant_is_skipped() {
        let mut info = assistant("a1", "u1", None);
        if let MessageInfo::Assistant(a) = &mut info {
            a.error = Some(MessageError::Api {
                message: "boom".into(),
                status_code: Some(500),
                retryable: true,
            });
        }
        let messages = vec![with_parts(info, vec![text_part("p1", "a1", "partial")])];
        let refs: Vec<&MessageWithParts> = messages.iter().collect();
        assert!(project_history(&refs).is_empty());
    }

    #[test]
    fn aborted_assistant_with_content_is_replayed() {
        let mut info = assistant("a1", "u1", None);
        if let MessageInfo::Assistant(a) = &mut info {
            a.error = Some(MessageError::Aborted {
                message: "stopped".into(),
            });
        }
        let messages = vec![with_parts(info, vec![text_part("p1", "a1", "partial")])];
        let refs: Vec<&MessageWithParts> = messages.iter().collect();
        assert_eq!(project_history(&refs).len(), 1);
    }

    #[test]
    fn running_tool_projects_as_interrupted() {
        let part = Part {
            id: "p1".into(),
            session_id: "s".into(),
            message_id: "a1".into(),
            body: PartBody::Tool {
                call_id: "tc_1".into(),
                tool: "shell".into(),
                state: ToolState::Running {
                    input: json!({"command": "sleep 30"}),
                    title: None,
                    metadata: None,
                    time: TimeRange {
                        start: 0,
                        end: None,
                    },
                },
            },
        };
        let messages = vec![with_parts(assistant("a1", "u1", None), vec![part])];
        let refs: Vec<&MessageWithParts> = messages.iter().collect();
        let projected = project_history(&refs);
        let v = serde_json::to_value(&projected[0]).unwrap();
        assert_eq!(v["content"][0]["type"], "tool-shell");
        assert_eq!(v["content"][0]["state"], "output-error");
    }

    #[test]
    fn file_part_with_binary_mime_projects_as_file_block() {
        let part = Part {
            id: "p1".into(),
            session_id: "s".into(),
            message_id: "u1".into(),
            body: PartBody::File {
                mime: "image/png".into(),
                filename: Some("shot.png".into()),
                url: "data:image/png;base64,AAAA".into(),
                source: None,
            },
        };
        let messages = vec![with_parts(user("u1"), vec![part])];
        let refs: Vec<&MessageWithParts> = messages.iter().collect();
        let v = serde_json::to_value(&project_history(&refs)[0]).unwrap();
        assert_eq!(v["content"][0]["type"], "file");
        assert_eq!(v["content"][0]["mediaType"], "image/png");
    }
}
