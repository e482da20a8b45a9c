// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod engine;
mod rule;

pub use engine::{
    DenyReason, PermissionDecision, PermissionDenied, PermissionEngine, TOPIC_PERMISSION_REPLIED,
    TOPIC_PERMISSION_REQUESTED,
};
pub use rule::{PermissionContext, PermissionLevel, PermissionRule};
