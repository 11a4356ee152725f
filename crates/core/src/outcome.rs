//! Per-job results and the error taxonomy surfaced to callers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Machine-readable failure codes shared by HTTP responses, session frames
/// and per-item batch entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimited,
    QuotaExceeded,
    Busy,
    RenderFailed,
    RenderTimeout,
    WorkerCrashed,
    StorageFailed,
    InvalidRequest,
    DependencyFailed,
    SessionClosed,
    Unauthorized,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "RATE_LIMITED",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::Busy => "BUSY",
            Self::RenderFailed => "RENDER_FAILED",
            Self::RenderTimeout => "RENDER_TIMEOUT",
            Self::WorkerCrashed => "WORKER_CRASHED",
            Self::StorageFailed => "STORAGE_FAILED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::DependencyFailed => "DEPENDENCY_FAILED",
            Self::SessionClosed => "SESSION_CLOSED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether resubmitting the same job later can succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::Busy
                | Self::RenderTimeout
                | Self::WorkerCrashed
                | Self::StorageFailed
                | Self::SessionClosed
                | Self::Internal
        )
    }
}

/// Failure detail attached to an unsuccessful [`RenderResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl JobError {
    /// Build an error whose retryability follows its code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.is_retryable(),
        }
    }

    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderResult {
    pub job_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    pub size_bytes: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl RenderResult {
    pub fn succeeded(
        job_id: Uuid,
        output_url: String,
        size_bytes: u64,
        duration_ms: u64,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            job_id,
            success: true,
            output_url: Some(output_url),
            size_bytes,
            duration_ms,
            error: None,
            metadata,
        }
    }

    pub fn failed(
        job_id: Uuid,
        error: JobError,
        duration_ms: u64,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            job_id,
            success: false,
            output_url: None,
            size_bytes: 0,
            duration_ms,
            error: Some(error),
            metadata,
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// Ordered results of a batch, one entry per submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub results: Vec<RenderResult>,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchResult {
    pub fn from_results(results: Vec<RenderResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        let failed = results.len() - succeeded;
        Self {
            results,
            succeeded,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::QuotaExceeded).unwrap();
        assert_eq!(json, "\"QUOTA_EXCEEDED\"");
        assert_eq!(ErrorCode::DependencyFailed.as_str(), "DEPENDENCY_FAILED");
    }

    #[test]
    fn retryability_follows_code() {
        assert!(JobError::new(ErrorCode::Busy, "pool busy").retryable);
        assert!(JobError::new(ErrorCode::WorkerCrashed, "crashed").retryable);
        assert!(!JobError::new(ErrorCode::QuotaExceeded, "quota").retryable);
        assert!(!JobError::new(ErrorCode::InvalidRequest, "bad").retryable);
        assert!(!JobError::fatal(ErrorCode::Internal, "bad html").retryable);
    }

    #[test]
    fn failed_result_omits_output_url() {
        let result = RenderResult::failed(
            Uuid::nil(),
            JobError::new(ErrorCode::RenderFailed, "boom"),
            12,
            None,
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert!(json.get("output_url").is_none());
        assert_eq!(json["error"]["code"], "RENDER_FAILED");
    }

    #[test]
    fn batch_result_counts() {
        let ok = RenderResult::succeeded(Uuid::nil(), "u".into(), 10, 5, None);
        let bad = RenderResult::failed(
            Uuid::nil(),
            JobError::new(ErrorCode::Busy, "busy"),
            5,
            None,
        );
        let batch = BatchResult::from_results(vec![ok.clone(), bad, ok]);
        assert_eq!(batch.results.len(), 3);
        assert_eq!(batch.succeeded, 2);
        assert_eq!(batch.failed, 1);
    }
}
