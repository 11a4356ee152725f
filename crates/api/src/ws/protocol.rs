//! JSON frames exchanged over a session.
//!
//! Every frame is a text message with a `type` discriminator. Calls carry a
//! client-chosen `call_id` that is echoed on the matching reply, so replies
//! may arrive in any order.

use folio_core::job::RenderJob;
use folio_core::outcome::{BatchResult, ErrorCode, RenderResult};
use folio_core::pipeline::PipelineCall;
use folio_core::rate_limit::RateLimitStatus;
use folio_core::types::Timestamp;
use serde::{Deserialize, Serialize};

use crate::engine::{DispatchError, PipelineCallResult};
use crate::response::{reset_epoch_secs, retry_after_secs};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Render {
        call_id: String,
        job: RenderJob,
    },
    Batch {
        call_id: String,
        jobs: Vec<RenderJob>,
    },
    Pipeline {
        call_id: String,
        calls: Vec<PipelineCall>,
    },
    Ping,
}

impl ClientMessage {
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::Render { call_id, .. }
            | Self::Batch { call_id, .. }
            | Self::Pipeline { call_id, .. } => Some(call_id),
            Self::Ping => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Result {
        call_id: String,
        result: RenderResult,
    },
    BatchResult {
        call_id: String,
        results: Vec<RenderResult>,
        succeeded: usize,
        failed: usize,
    },
    PipelineResult {
        call_id: String,
        results: Vec<PipelineCallResult>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        code: ErrorCode,
        message: String,
        retryable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reset_at: Option<Timestamp>,
    },
    Pong,
    RateLimit {
        limit: u32,
        remaining: u32,
        /// Unix time in seconds at which the bucket is full again.
        reset: i64,
    },
}

impl ServerMessage {
    pub fn batch_result(call_id: String, batch: BatchResult) -> Self {
        Self::BatchResult {
            call_id,
            results: batch.results,
            succeeded: batch.succeeded,
            failed: batch.failed,
        }
    }

    pub fn rate_limit(status: RateLimitStatus) -> Self {
        Self::RateLimit {
            limit: status.limit,
            remaining: status.remaining,
            reset: reset_epoch_secs(status.reset_after),
        }
    }

    pub fn error(call_id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            call_id,
            code,
            message: message.into(),
            retryable: code.is_retryable(),
            retry_after_secs: None,
            reset_at: None,
        }
    }

    pub fn session_closed(call_id: String) -> Self {
        Self::error(
            Some(call_id),
            ErrorCode::SessionClosed,
            "session closed before the call finished",
        )
    }

    /// Error frame for a call refused before it ran.
    pub fn refused(call_id: String, err: &DispatchError) -> Self {
        let (retry_after, reset_at) = match err {
            DispatchError::RateLimited { retry_after, .. } => {
                (Some(retry_after_secs(*retry_after)), None)
            }
            DispatchError::QuotaExceeded { reset_at, .. } => (None, Some(*reset_at)),
            _ => (None, None),
        };
        let message = match err {
            DispatchError::Ledger { .. } => "usage accounting is temporarily unavailable".to_string(),
            other => other.to_string(),
        };
        Self::Error {
            call_id: Some(call_id),
            code: err.code(),
            message,
            retryable: err.code().is_retryable(),
            retry_after_secs: retry_after,
            reset_at,
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","code":"INTERNAL","message":"{e}","retryable":true}}"#)
        })
    }
}
