//! Render dispatch: admission, worker lease, render, upload, usage.
//!
//! [`Dispatcher`] is the single entry point shared by the HTTP routes and the
//! session protocol. Admission failures are returned as [`DispatchError`]
//! before any pool is touched; once a job is admitted, every outcome
//! (including pool exhaustion, crashes and storage failures) is reported as a
//! [`RenderResult`] so batch entries fail independently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::Serialize;

use folio_core::batch::{validate_batch, MAX_BATCH_SIZE};
use folio_core::caller::CallerContext;
use folio_core::error::CoreError;
use folio_core::job::{validate_job, RenderJob};
use folio_core::outcome::{BatchResult, ErrorCode, JobError, RenderResult};
use folio_core::pipeline::{plan_waves, substitute_outputs, PipelineCall};
use folio_core::quota::QuotaReservation;
use folio_core::rate_limit::{RateDecision, RateLimitStatus};
use folio_core::storage::{StorageSink, UploadMetadata, PDF_CONTENT_TYPE};
use folio_core::types::Timestamp;
use folio_pool::{EngineError, Lease, PoolError, PoolRegistry, WorkerPool};

use crate::engine::admission::{AdmissionController, QuotaOutcome};

/// Attempts per job. The second attempt only happens after a crash or a
/// render timeout, on a fresh worker.
const MAX_ATTEMPTS: u32 = 2;

/// Stand-in for dependency outputs while validating pipeline calls up front.
const PLACEHOLDER_OUTPUT_URL: &str = "https://placeholder.invalid/output.pdf";

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long a job may wait for a worker before failing as busy.
    pub acquire_timeout: Duration,
    /// Hard deadline on a single render attempt.
    pub render_timeout: Duration,
    pub max_batch_size: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(10),
            render_timeout: Duration::from_secs(30),
            max_batch_size: MAX_BATCH_SIZE,
        }
    }
}

/// Reasons a request is refused before any job runs.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Malformed job, oversize batch or broken pipeline graph.
    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        status: RateLimitStatus,
    },

    #[error("Quota exceeded until {reset_at}")]
    QuotaExceeded {
        remaining: i64,
        reset_at: Timestamp,
        status: RateLimitStatus,
    },

    /// The usage ledger could not be consulted.
    #[error("Usage ledger unavailable: {message}")]
    Ledger {
        message: String,
        status: RateLimitStatus,
    },
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Invalid(_) => ErrorCode::InvalidRequest,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            Self::Ledger { .. } => ErrorCode::Internal,
        }
    }

    /// Rate status at the time of refusal. Requests rejected before the
    /// rate check have none.
    pub fn rate_status(&self) -> Option<RateLimitStatus> {
        match self {
            Self::Invalid(_) => None,
            Self::RateLimited { status, .. }
            | Self::QuotaExceeded { status, .. }
            | Self::Ledger { status, .. } => Some(*status),
        }
    }
}

fn invalid(err: CoreError) -> DispatchError {
    DispatchError::Invalid(core_message(err))
}

/// An admitted request's output together with the caller's rate status.
#[derive(Debug)]
pub struct Dispatched<T> {
    pub output: T,
    pub rate: RateLimitStatus,
}

/// Outcome of one call in a pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineCallResult {
    pub id: String,
    #[serde(flatten)]
    pub result: RenderResult,
}

pub struct Dispatcher {
    pools: Arc<PoolRegistry>,
    admission: Arc<AdmissionController>,
    storage: Arc<dyn StorageSink>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        pools: Arc<PoolRegistry>,
        admission: Arc<AdmissionController>,
        storage: Arc<dyn StorageSink>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            pools,
            admission,
            storage,
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Render one job.
    pub async fn generate(
        &self,
        caller: &CallerContext,
        job: RenderJob,
    ) -> Result<Dispatched<RenderResult>, DispatchError> {
        validate_job(&job).map_err(invalid)?;
        let (rate, reservation) = self.admit(caller, 1).await?;

        let pool = self.pools.get_or_create(&caller.partition()).await;
        let result = self.run_job(caller, &pool, job).await;

        settle(caller, reservation, u32::from(result.success)).await;
        Ok(Dispatched { output: result, rate })
    }

    /// Render a batch. The batch costs one rate token and reserves quota for
    /// every job before any of them starts; results keep input order.
    pub async fn generate_batch(
        &self,
        caller: &CallerContext,
        jobs: Vec<RenderJob>,
    ) -> Result<Dispatched<BatchResult>, DispatchError> {
        validate_batch(&jobs, self.config.max_batch_size).map_err(invalid)?;
        let count = jobs.len() as u32;
        let (rate, reservation) = self.admit(caller, count).await?;

        let pool = self.pools.get_or_create(&caller.partition()).await;
        let results = self.run_concurrently(caller, &pool, jobs).await;

        let succeeded = results.iter().filter(|r| r.success).count() as u32;
        tracing::info!(
            caller_id = caller.caller_id,
            jobs = count,
            succeeded,
            "Batch finished",
        );
        settle(caller, reservation, succeeded).await;
        Ok(Dispatched {
            output: BatchResult::from_results(results),
            rate,
        })
    }

    /// Run dependent calls in dependency order. Each call may reference the
    /// output URL of a call it lists in `after`; calls whose dependencies
    /// failed are reported as `DEPENDENCY_FAILED` without rendering.
    pub async fn run_pipeline(
        &self,
        caller: &CallerContext,
        calls: Vec<PipelineCall>,
    ) -> Result<Dispatched<Vec<PipelineCallResult>>, DispatchError> {
        if calls.is_empty() {
            return Err(DispatchError::Invalid(
                "pipeline must contain at least one call".into(),
            ));
        }
        if calls.len() > self.config.max_batch_size {
            return Err(DispatchError::Invalid(format!(
                "pipeline contains {} calls, the maximum is {}",
                calls.len(),
                self.config.max_batch_size
            )));
        }
        let waves = plan_waves(&calls).map_err(invalid)?;
        validate_pipeline_jobs(&calls)?;

        let count = calls.len() as u32;
        let (rate, reservation) = self.admit(caller, count).await?;
        let pool = self.pools.get_or_create(&caller.partition()).await;

        let mut results: Vec<Option<RenderResult>> = vec![None; calls.len()];
        let mut outputs: HashMap<String, String> = HashMap::new();

        for wave in waves {
            let mut runnable = Vec::with_capacity(wave.len());
            for index in wave {
                let call = &calls[index];
                let failed_dep = call
                    .after
                    .iter()
                    .find(|dep| !outputs.contains_key(dep.as_str()));
                match failed_dep {
                    Some(dep) => {
                        results[index] = Some(RenderResult::failed(
                            call.job.id,
                            JobError::fatal(
                                ErrorCode::DependencyFailed,
                                format!("dependency '{dep}' did not succeed"),
                            ),
                            0,
                            call.job.metadata.clone(),
                        ));
                    }
                    None => {
                        let mut job = call.job.clone();
                        substitute_outputs(&mut job, &outputs);
                        runnable.push((index, job));
                    }
                }
            }

            let (indices, jobs): (Vec<usize>, Vec<RenderJob>) = runnable.into_iter().unzip();
            let finished = self.run_concurrently(caller, &pool, jobs).await;
            for (index, result) in indices.into_iter().zip(finished) {
                if let Some(url) = &result.output_url {
                    outputs.insert(calls[index].id.clone(), url.clone());
                }
                results[index] = Some(result);
            }
        }

        let results: Vec<PipelineCallResult> = calls
            .into_iter()
            .zip(results)
            .map(|(call, result)| PipelineCallResult {
                result: result.unwrap_or_else(|| {
                    RenderResult::failed(
                        call.job.id,
                        JobError::new(ErrorCode::Internal, "call was not scheduled"),
                        0,
                        call.job.metadata.clone(),
                    )
                }),
                id: call.id,
            })
            .collect();

        let succeeded = results.iter().filter(|r| r.result.success).count() as u32;
        settle(caller, reservation, succeeded).await;
        Ok(Dispatched {
            output: results,
            rate,
        })
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    async fn admit(
        &self,
        caller: &CallerContext,
        count: u32,
    ) -> Result<(RateLimitStatus, QuotaReservation), DispatchError> {
        let rate = match self.admission.check_rate(caller) {
            RateDecision::Allowed { status } => status,
            RateDecision::Denied {
                retry_after,
                status,
            } => {
                tracing::debug!(
                    caller_id = caller.caller_id,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rate limited",
                );
                return Err(DispatchError::RateLimited {
                    retry_after,
                    status,
                });
            }
        };

        match self.admission.check_quota(caller, count).await {
            Ok(QuotaOutcome::Reserved(reservation)) => Ok((rate, reservation)),
            Ok(QuotaOutcome::Denied {
                remaining,
                reset_at,
            }) => Err(DispatchError::QuotaExceeded {
                remaining,
                reset_at,
                status: rate,
            }),
            Err(e) => {
                tracing::error!(caller_id = caller.caller_id, error = %e, "Quota check failed");
                Err(DispatchError::Ledger {
                    message: e.to_string(),
                    status: rate,
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run jobs with at most one in flight per worker the pool may hold.
    /// Output order matches input order.
    async fn run_concurrently(
        &self,
        caller: &CallerContext,
        pool: &WorkerPool,
        jobs: Vec<RenderJob>,
    ) -> Vec<RenderResult> {
        let width = pool.max_size().max(1);
        // Futures are inert until polled; `buffered` starts at most `width`.
        let pending: Vec<_> = jobs
            .into_iter()
            .map(|job| self.run_job(caller, pool, job))
            .collect();
        stream::iter(pending).buffered(width).collect().await
    }

    /// Render and upload one admitted job. Never fails: every problem is
    /// folded into the returned result.
    async fn run_job(
        &self,
        caller: &CallerContext,
        pool: &WorkerPool,
        job: RenderJob,
    ) -> RenderResult {
        let started = Instant::now();
        let rendered = self.render_with_retry(pool, &job).await;
        let RenderJob { id, metadata, .. } = job;

        let bytes = match rendered {
            Ok(bytes) => bytes,
            Err(error) => {
                return RenderResult::failed(id, error, elapsed_ms(started), metadata);
            }
        };

        let size_bytes = bytes.len() as u64;
        let upload = UploadMetadata {
            job_id: id,
            caller_id: caller.caller_id,
            partition: pool.partition().clone(),
            content_type: PDF_CONTENT_TYPE,
            tag: metadata.clone(),
        };
        match self.storage.upload(bytes, &upload).await {
            Ok(url) => {
                let duration_ms = elapsed_ms(started);
                tracing::debug!(
                    job_id = %id,
                    caller_id = caller.caller_id,
                    size_bytes,
                    duration_ms,
                    "Render stored",
                );
                RenderResult::succeeded(id, url, size_bytes, duration_ms, metadata)
            }
            Err(e) => {
                tracing::warn!(job_id = %id, caller_id = caller.caller_id, error = %e, "Upload failed");
                RenderResult::failed(
                    id,
                    JobError::new(ErrorCode::StorageFailed, "rendered output could not be stored"),
                    elapsed_ms(started),
                    metadata,
                )
            }
        }
    }

    async fn render_with_retry(
        &self,
        pool: &WorkerPool,
        job: &RenderJob,
    ) -> Result<Vec<u8>, JobError> {
        let mut last_error = JobError::new(ErrorCode::Internal, "render was not attempted");

        for attempt in 1..=MAX_ATTEMPTS {
            let lease = self.acquire(pool).await?;
            let worker_id = lease.id();

            let outcome = tokio::time::timeout(self.config.render_timeout, lease.render(job)).await;
            match outcome {
                Ok(Ok(bytes)) => {
                    lease.release();
                    return Ok(bytes);
                }
                Ok(Err(EngineError::Rejected(msg))) => {
                    lease.release();
                    return Err(JobError::fatal(ErrorCode::RenderFailed, msg));
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        partition = %pool.partition(),
                        worker_id = %worker_id,
                        job_id = %job.id,
                        attempt,
                        error = %e,
                        "Render failed on worker",
                    );
                    lease.report_crashed();
                    last_error = match e {
                        EngineError::Timeout(_) => {
                            JobError::new(ErrorCode::RenderTimeout, "render timed out")
                        }
                        _ => JobError::new(ErrorCode::WorkerCrashed, "worker crashed during render"),
                    };
                }
                Err(_) => {
                    tracing::warn!(
                        partition = %pool.partition(),
                        worker_id = %worker_id,
                        job_id = %job.id,
                        attempt,
                        timeout_ms = self.config.render_timeout.as_millis() as u64,
                        "Render timed out",
                    );
                    lease.report_crashed();
                    last_error = JobError::new(
                        ErrorCode::RenderTimeout,
                        format!(
                            "render exceeded {} ms",
                            self.config.render_timeout.as_millis()
                        ),
                    );
                }
            }
        }

        Err(last_error)
    }

    async fn acquire(&self, pool: &WorkerPool) -> Result<Lease, JobError> {
        let wait = self.config.acquire_timeout;
        let result = match pool.acquire(wait).await {
            // Torn down between lookup and acquire: retry once on a fresh pool.
            Err(PoolError::Closed) => {
                let fresh = self.pools.get_or_create(pool.partition()).await;
                fresh.acquire(wait).await
            }
            other => other,
        };

        result.map_err(|e| match e {
            PoolError::Timeout(wait) => JobError::new(
                ErrorCode::Busy,
                format!("no worker became available within {} ms", wait.as_millis()),
            ),
            PoolError::Closed | PoolError::LaunchFailed(_) => {
                tracing::error!(partition = %pool.partition(), error = %e, "Worker acquire failed");
                JobError::new(ErrorCode::Internal, "worker unavailable")
            }
        })
    }
}

async fn settle(caller: &CallerContext, reservation: QuotaReservation, succeeded: u32) {
    let reserved = reservation.count();
    if let Err(e) = reservation.settle(succeeded).await {
        tracing::error!(
            caller_id = caller.caller_id,
            reserved,
            succeeded,
            error = %e,
            "Failed to settle quota reservation",
        );
    }
}

/// Validate pipeline jobs with dependency placeholders filled in, so a URL
/// made only of a placeholder is checked as a URL.
fn validate_pipeline_jobs(calls: &[PipelineCall]) -> Result<(), DispatchError> {
    let mut seen = HashSet::with_capacity(calls.len());
    for call in calls {
        if !seen.insert(call.job.id) {
            return Err(DispatchError::Invalid(format!(
                "call '{}': duplicate job id {}",
                call.id, call.job.id
            )));
        }
        let mut job = call.job.clone();
        if !call.after.is_empty() {
            let stand_ins: HashMap<String, String> = call
                .after
                .iter()
                .map(|dep| (dep.clone(), PLACEHOLDER_OUTPUT_URL.to_string()))
                .collect();
            substitute_outputs(&mut job, &stand_ins);
        }
        validate_job(&job).map_err(|e| {
            DispatchError::Invalid(format!("call '{}': {}", call.id, core_message(e)))
        })?;
    }
    Ok(())
}

fn core_message(err: CoreError) -> String {
    match err {
        CoreError::Validation(msg) => msg,
        other => other.to_string(),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
