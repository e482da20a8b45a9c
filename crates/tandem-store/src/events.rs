// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bus topics and payload builders for store events.
//!
//! The store publishes these exclusively through transaction effects,
//! so a delivered event always refers to committed state.

use serde_json::{json, Value};

use crate::types::{MessageInfo, Part, SessionInfo};

pub const TOPIC_SESSION_CREATED: &str = "session.created";
pub const TOPIC_SESSION_UPDATED: &str = "session.updated";
pub const TOPIC_SESSION_DELETED: &str = "session.deleted";
pub const TOPIC_MESSAGE_UPDATED: &str = "message.updated";
pub const TOPIC_MESSAGE_REMOVED: &str = "message.removed";
pub const TOPIC_PART_UPDATED: &str = "message.part.updated";
pub const TOPIC_PART_REMOVED: &str = "message.part.removed";
/// Incremental text for a part during streaming; published by the loop,
/// not backed by a store write per delta.
pub const TOPIC_PART_DELTA: &str = "message.part.delta";

pub fn session_payload(info: &SessionInfo) -> Value {
    json!({ "info": info })
}

pub fn message_payload(info: &MessageInfo) -> Value {
    json!({ "info": info })
}

pub fn message_removed_payload(session_id: &str, message_id: &str) -> Value {
    json!({ "sessionID": session_id, "messageID": message_id })
}

pub fn part_payload(part: &Part) -> Value {
    json!({ "part": part })
}

pub fn part_removed_payload(session_id: &str, message_id: &str, part_id: &str) -> Value {
    json!({
        "sessionID": session_id,
        "messageID": message_id,
        "partID": part_id,
    })
}

pub fn part_delta_payload(
    session_id: &str,
    message_id: &str,
    part_id: &str,
    field: &str,
    delta: &str,
) -> Value {
    json!({
        "sessionID": session_id,
        "messageID": message_id,
        "partID": part_id,
        "field": field,
        "delta": delta,
    })
}
