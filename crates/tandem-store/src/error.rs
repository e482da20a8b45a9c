// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unknown session/message/part id. Returned to the caller without
    /// touching state.
    #[error("not found: {0}")]
    NotFound(String),

    /// A tool part was updated backwards (e.g. completed → running).
    #[error("invalid tool state transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("io: {0}")]
    Io(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}
