//! Output storage seam.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::CoreError;
use crate::types::{CallerId, PartitionKey};

pub const PDF_CONTENT_TYPE: &str = "application/pdf";

/// Everything a sink may want to record alongside the rendered bytes.
#[derive(Debug, Clone, Serialize)]
pub struct UploadMetadata {
    pub job_id: Uuid,
    pub caller_id: CallerId,
    pub partition: PartitionKey,
    pub content_type: &'static str,
    /// Caller tag copied from the job.
    pub tag: Option<serde_json::Value>,
}

/// Destination for finished renders. Returns the URL the caller should use
/// to fetch the output. A failed upload fails the job.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, metadata: &UploadMetadata) -> Result<String, CoreError>;
}
