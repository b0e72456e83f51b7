use crate::error::{JobQueueError, Result};
use crate::models::{
    prepare_job_batches, JobQueueBatch, JobQueueBatchFile, JobRequest, JobResult, JobStatus,
};
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_STUCK_BATCH_THRESHOLD: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_UNHEALTHY_THRESHOLD: Duration = Duration::from_secs(3 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of patients per batch when a job is chunked.
    pub batch_size: usize,
    /// A running batch without a heartbeat for this long is requeued on the next claim.
    pub stuck_batch_threshold: Duration,
    /// A running batch without a heartbeat for this long makes its aggregator unhealthy.
    pub unhealthy_threshold: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            stuck_batch_threshold: DEFAULT_STUCK_BATCH_THRESHOLD,
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
        }
    }
}

/// Leasable export batch queue shared by every aggregator.
///
/// Operations that take a `&mut JobQueueBatch` check the lease against the stored state,
/// apply the transition to the caller's copy and persist it in one step.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues the whole request as a single batch and returns the new job ID.
    async fn create_job(&self, request: JobRequest) -> Result<Uuid> {
        let batches = prepare_job_batches(&request, request.patients.len().max(1))?;
        self.submit_job_batches(batches).await
    }

    /// Enqueues batches prepared by [`prepare_job_batches`]; all of them must share one job.
    async fn submit_job_batches(&self, batches: Vec<JobQueueBatch>) -> Result<Uuid>;

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<JobQueueBatch>>;

    async fn get_job_batches(&self, job_id: Uuid) -> Result<Vec<JobQueueBatch>>;

    /// Finds an output file by name, scoped to the organization that requested it.
    async fn get_job_batch_file(
        &self,
        org_id: Uuid,
        file_name: &str,
    ) -> Result<Option<JobQueueBatchFile>>;

    /// Leases the next batch to `aggregator_id`.
    ///
    /// `None` means "try again later": either nothing is queued, or this call requeued a
    /// stuck batch instead of claiming one.
    async fn claim_batch(&self, aggregator_id: Uuid) -> Result<Option<JobQueueBatch>>;

    /// Returns a running batch to the queue without losing progress.
    async fn pause_batch(&self, batch: &mut JobQueueBatch, aggregator_id: Uuid) -> Result<()>;

    /// Persists progress and output files, and refreshes the heartbeat.
    async fn complete_partial_batch(
        &self,
        batch: &mut JobQueueBatch,
        aggregator_id: Uuid,
    ) -> Result<()>;

    async fn complete_batch(&self, batch: &mut JobQueueBatch, aggregator_id: Uuid) -> Result<()>;

    /// Marks the batch failed and discards its output. Rejected only when another aggregator
    /// currently holds the lease.
    async fn fail_batch(&self, batch: &mut JobQueueBatch, aggregator_id: Uuid) -> Result<()>;

    /// Per resource type totals of completed batches.
    async fn get_job_results(&self, job_id: Uuid) -> Result<Vec<JobResult>>;

    async fn queue_size(&self) -> Result<i64>;

    /// Age of the oldest queued batch, zero when nothing is queued.
    async fn queue_age(&self) -> Result<Duration>;

    fn queue_type(&self) -> &'static str;

    /// Fails with `Unhealthy` when `aggregator_id` holds a batch it has stopped heartbeating.
    async fn assert_healthy(&self, aggregator_id: Uuid) -> Result<()>;
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Fails unless `aggregator_id` holds the lease on the stored batch.
pub(crate) fn ensure_lease(stored: &JobQueueBatch, aggregator_id: Uuid) -> Result<()> {
    if stored.status != JobStatus::Running || stored.aggregator_id != Some(aggregator_id) {
        return Err(JobQueueError::LeaseLost {
            batch_id: stored.batch_id,
            expected: aggregator_id,
            holder: stored.aggregator_id,
        });
    }
    Ok(())
}

/// Failing is allowed in any state except while another aggregator holds the lease.
pub(crate) fn ensure_can_fail(stored: &JobQueueBatch, aggregator_id: Uuid) -> Result<()> {
    if stored.status == JobStatus::Running && stored.aggregator_id != Some(aggregator_id) {
        return Err(JobQueueError::LeaseLost {
            batch_id: stored.batch_id,
            expected: aggregator_id,
            holder: stored.aggregator_id,
        });
    }
    Ok(())
}

/// Checks that a submission is non-empty and covers a single job.
pub(crate) fn submission_job_id(batches: &[JobQueueBatch]) -> Result<Uuid> {
    let job_id = batches
        .first()
        .map(|b| b.job_id)
        .ok_or_else(|| JobQueueError::Failure("No job batches to submit".into()))?;
    if batches.iter().any(|b| b.job_id != job_id) {
        return Err(JobQueueError::InvalidRequest(
            "All batches must belong to the same job".into(),
        ));
    }
    Ok(job_id)
}
