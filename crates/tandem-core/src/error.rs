// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

use tandem_model::ProviderError;
use tandem_store::{MessageError, StoreError};

/// Errors returned to the caller of the session layer.
///
/// Step-level failures (auth, API, context overflow, aborts, structured
/// output) are not returned this way — they are persisted onto the
/// assistant message as a [`MessageError`] and the prompt call still
/// yields that message.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A prompt is already running in this session. No state changed.
    #[error("session {0} is busy")]
    Busy(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The abort signal fired before any assistant message existed.
    #[error("session {0} was aborted")]
    Aborted(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => SessionError::NotFound(what),
            other => SessionError::Store(other),
        }
    }
}

/// Map an adapter error onto the persisted taxonomy.
pub fn classify_provider_error(error: &ProviderError) -> MessageError {
    match error {
        ProviderError::Auth {
            provider_id,
            message,
        } => MessageError::Auth {
            provider_id: provider_id.clone(),
            message: message.clone(),
        },
        ProviderError::Api {
            status,
            message,
            retryable,
        } => MessageError::Api {
            message: message.clone(),
            status_code: *status,
            retryable: *retryable,
        },
        ProviderError::ContextOverflow { message } => MessageError::ContextOverflow {
            message: message.clone(),
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_becomes_session_not_found() {
        let e: SessionError = StoreError::NotFound("session s1".into()).into();
        assert!(matches!(e, SessionError::NotFound(_)));
    }

    #[test]
    fn auth_classifies_with_provider_id() {
        let e = ProviderError::Auth {
            provider_id: "anthropic".into(),
            message: "bad key".into(),
        };
        match classify_provider_error(&e) {
            MessageError::Auth { provider_id, .. } => assert_eq!(provider_id, "anthropic"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn api_classification_keeps_retryability() {
        let e = ProviderError::status(503, "overloaded");
        match classify_provider_error(&e) {
            MessageError::Api {
                status_code,
                retryable,
                ..
            } => {
                assert_eq!(status_code, Some(503));
                assert!(retryable);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn context_overflow_maps_through() {
        let e = ProviderError::ContextOverflow {
            message: "too long".into(),
        };
        assert!(matches!(
            classify_provider_error(&e),
            MessageError::ContextOverflow { .. }
        ));
    }
}
