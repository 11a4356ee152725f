//! Filesystem-backed [`StorageSink`].
//!
//! Outputs are written to `<root>/<partition>/<job_id>.pdf` and served back
//! under `/files` by the router.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use folio_core::error::CoreError;
use folio_core::storage::{StorageSink, UploadMetadata};

/// Route prefix the storage directory is mounted under.
pub const FILES_ROUTE: &str = "/files";

pub struct LocalStorageSink {
    root: PathBuf,
    public_base_url: String,
}

impl LocalStorageSink {
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn relative_path(metadata: &UploadMetadata) -> String {
        format!("{}/{}.pdf", metadata.partition, metadata.job_id)
    }
}

#[async_trait]
impl StorageSink for LocalStorageSink {
    async fn upload(&self, bytes: Vec<u8>, metadata: &UploadMetadata) -> Result<String, CoreError> {
        let relative = Self::relative_path(metadata);
        let dest = self.root.join(&relative);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::Internal(format!("Failed to create output dir: {e}")))?;
        }

        // Write then rename so a reader never sees a partial file.
        let staging = dest.with_extension("pdf.part");
        tokio::fs::write(&staging, &bytes)
            .await
            .map_err(|e| CoreError::Internal(format!("Failed to write output: {e}")))?;
        if let Err(e) = tokio::fs::rename(&staging, &dest).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(CoreError::Internal(format!("Failed to publish output: {e}")));
        }

        tracing::debug!(
            job_id = %metadata.job_id,
            partition = %metadata.partition,
            size_bytes = bytes.len(),
            "Output written",
        );
        Ok(format!("{}{FILES_ROUTE}/{relative}", self.public_base_url))
    }
}

#[cfg(test)]
mod tests {
    use folio_core::storage::PDF_CONTENT_TYPE;
    use folio_core::types::PartitionKey;
    use uuid::Uuid;

    use super::*;

    fn metadata(job_id: Uuid) -> UploadMetadata {
        UploadMetadata {
            job_id,
            caller_id: 3,
            partition: PartitionKey::for_caller(3),
            content_type: PDF_CONTENT_TYPE,
            tag: None,
        }
    }

    #[tokio::test]
    async fn upload_writes_file_and_returns_public_url() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalStorageSink::new(dir.path(), "http://localhost:3000/");
        let job_id = Uuid::new_v4();

        let url = sink.upload(b"%PDF-1.7".to_vec(), &metadata(job_id)).await.unwrap();

        assert_eq!(
            url,
            format!("http://localhost:3000/files/caller-3/{job_id}.pdf")
        );
        let written = std::fs::read(dir.path().join(format!("caller-3/{job_id}.pdf"))).unwrap();
        assert_eq!(written, b"%PDF-1.7");
        assert!(!dir
            .path()
            .join(format!("caller-3/{job_id}.pdf.part"))
            .exists());
    }

    #[tokio::test]
    async fn upload_into_unwritable_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let sink = LocalStorageSink::new(&blocker, "http://localhost:3000");

        let result = sink.upload(b"%PDF".to_vec(), &metadata(Uuid::new_v4())).await;
        assert!(result.is_err());
    }
}
