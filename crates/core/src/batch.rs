//! Batch request validation.

use std::collections::HashSet;

use serde::Deserialize;

use crate::error::CoreError;
use crate::job::{validate_job, RenderJob};

/// Upper bound on jobs per batch.
pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub jobs: Vec<RenderJob>,
}

/// Reject malformed batches before any admission work happens.
///
/// A batch must be non-empty, hold at most `max_size` jobs, contain no
/// duplicate job ids, and every job must pass [`validate_job`]. Errors name
/// the offending index.
pub fn validate_batch(jobs: &[RenderJob], max_size: usize) -> Result<(), CoreError> {
    if jobs.is_empty() {
        return Err(CoreError::Validation("batch must contain at least one job".into()));
    }
    if jobs.len() > max_size {
        return Err(CoreError::Validation(format!(
            "batch of {} jobs exceeds the limit of {max_size}",
            jobs.len()
        )));
    }

    let mut seen = HashSet::with_capacity(jobs.len());
    for (index, job) in jobs.iter().enumerate() {
        if !seen.insert(job.id) {
            return Err(CoreError::Validation(format!(
                "jobs[{index}]: duplicate job id {}",
                job.id
            )));
        }
        validate_job(job).map_err(|e| match e {
            CoreError::Validation(msg) => CoreError::Validation(format!("jobs[{index}]: {msg}")),
            other => other,
        })?;
    }
    Ok(())
}
