//! Process-local queue with the same leasing rules as the database queue.

use crate::error::{JobQueueError, Result};
use crate::metrics::QueueMetrics;
use crate::models::{JobQueueBatch, JobQueueBatchFile, JobResult, JobStatus, ResourceType};
use crate::queue::{
    ensure_can_fail, ensure_lease, submission_job_id, to_chrono, JobQueue, QueueConfig,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Time source for the in-memory queue.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += to_chrono(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Default)]
struct State {
    batches: Vec<JobQueueBatch>,
    results: HashMap<(Uuid, ResourceType), JobResult>,
}

impl State {
    fn find_mut(&mut self, batch_id: Uuid) -> Result<&mut JobQueueBatch> {
        self.batches
            .iter_mut()
            .find(|b| b.batch_id == batch_id)
            .ok_or(JobQueueError::NotFound(batch_id))
    }

    /// Stored batch, provided `aggregator_id` still holds its lease.
    fn leased_mut(&mut self, batch_id: Uuid, aggregator_id: Uuid) -> Result<&mut JobQueueBatch> {
        let stored = self.find_mut(batch_id)?;
        ensure_lease(stored, aggregator_id)?;
        Ok(stored)
    }
}

pub struct MemoryBatchQueue {
    state: AsyncMutex<State>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    metrics: Option<QueueMetrics>,
}

impl MemoryBatchQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: AsyncMutex::new(State::default()),
            config,
            clock,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: QueueMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn is_stale(&self, batch: &JobQueueBatch, threshold: Duration, now: DateTime<Utc>) -> bool {
        batch.status == JobStatus::Running
            && batch
                .update_time
                .map_or(false, |heartbeat| heartbeat < now - to_chrono(threshold))
    }
}

#[async_trait]
impl JobQueue for MemoryBatchQueue {
    async fn submit_job_batches(&self, mut batches: Vec<JobQueueBatch>) -> Result<Uuid> {
        let job_id = submission_job_id(&batches)?;
        let now = self.clock.now();
        for batch in batches.iter_mut() {
            batch.submit_time = Some(now);
        }
        debug!(job_id = %job_id, batches = batches.len(), "Adding job to the queue");

        self.state.lock().await.batches.extend(batches);
        Ok(job_id)
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<JobQueueBatch>> {
        let state = self.state.lock().await;
        Ok(state.batches.iter().find(|b| b.batch_id == batch_id).cloned())
    }

    async fn get_job_batches(&self, job_id: Uuid) -> Result<Vec<JobQueueBatch>> {
        let state = self.state.lock().await;
        Ok(state
            .batches
            .iter()
            .filter(|b| b.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn get_job_batch_file(
        &self,
        org_id: Uuid,
        file_name: &str,
    ) -> Result<Option<JobQueueBatchFile>> {
        let state = self.state.lock().await;
        Ok(state
            .batches
            .iter()
            .filter(|b| b.org_id == org_id)
            .flat_map(|b| b.job_queue_batch_files.iter())
            .find(|f| f.file_name == file_name)
            .cloned())
    }

    async fn claim_batch(&self, aggregator_id: Uuid) -> Result<Option<JobQueueBatch>> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let mut recovered = false;
        for batch in state.batches.iter_mut() {
            if self.is_stale(batch, self.config.stuck_batch_threshold, now) {
                warn!(batch_id = %batch.batch_id, "Restarting stuck batch");
                batch.restart_batch(now);
                recovered = true;
            }
        }
        if recovered {
            return Ok(None);
        }

        let candidate = state
            .batches
            .iter_mut()
            .filter(|b| b.status == JobStatus::Queued)
            .min_by_key(|b| (b.priority, b.submit_time));
        let batch = match candidate {
            Some(batch) => batch,
            None => return Ok(None),
        };

        if let Err(err) = batch.set_running_status(aggregator_id, now) {
            error!(batch_id = %batch.batch_id, error = %err, "Failed to mark batch as running, failing it");
            batch.set_failed_status(now);
            return Ok(None);
        }
        if let Some(metrics) = &self.metrics {
            QueueMetrics::observe_between(&metrics.wait_time, batch.submit_time, now);
        }
        Ok(Some(batch.clone()))
    }

    async fn pause_batch(&self, batch: &mut JobQueueBatch, aggregator_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state.leased_mut(batch.batch_id, aggregator_id)?;
        batch.set_paused_status(aggregator_id, self.clock.now())?;
        *stored = batch.clone();
        Ok(())
    }

    async fn complete_partial_batch(
        &self,
        batch: &mut JobQueueBatch,
        aggregator_id: Uuid,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state.leased_mut(batch.batch_id, aggregator_id)?;
        batch.verify_aggregator_id(aggregator_id)?;

        let now = self.clock.now();
        if let Some(metrics) = &self.metrics {
            QueueMetrics::observe_between(&metrics.partial_time, stored.update_time, now);
        }
        batch.update_time = Some(now);
        *stored = batch.clone();
        Ok(())
    }

    async fn complete_batch(&self, batch: &mut JobQueueBatch, aggregator_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state.leased_mut(batch.batch_id, aggregator_id)?;

        let now = self.clock.now();
        batch.set_completed_status(aggregator_id, now)?;
        *stored = batch.clone();

        for file in &batch.job_queue_batch_files {
            state
                .results
                .entry((batch.job_id, file.resource_type))
                .or_insert_with(|| JobResult::new(batch.job_id, file.resource_type))
                .increment_count(file.count);
        }
        if let Some(metrics) = &self.metrics {
            QueueMetrics::observe_between(&metrics.success_time, batch.start_time, now);
        }
        Ok(())
    }

    async fn fail_batch(&self, batch: &mut JobQueueBatch, aggregator_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state.find_mut(batch.batch_id)?;
        ensure_can_fail(stored, aggregator_id)?;

        let now = self.clock.now();
        batch.set_failed_status(now);
        *stored = batch.clone();
        if let Some(metrics) = &self.metrics {
            QueueMetrics::observe_between(&metrics.failure_time, batch.start_time, now);
        }
        Ok(())
    }

    async fn get_job_results(&self, job_id: Uuid) -> Result<Vec<JobResult>> {
        let state = self.state.lock().await;
        let mut results: Vec<JobResult> = state
            .results
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.resource_type);
        Ok(results)
    }

    async fn queue_size(&self) -> Result<i64> {
        let state = self.state.lock().await;
        let size = state
            .batches
            .iter()
            .filter(|b| b.status == JobStatus::Queued)
            .count() as i64;
        if let Some(metrics) = &self.metrics {
            metrics.queue_length.set(size);
        }
        Ok(size)
    }

    async fn queue_age(&self) -> Result<Duration> {
        let state = self.state.lock().await;
        let oldest = state
            .batches
            .iter()
            .filter(|b| b.status == JobStatus::Queued)
            .filter_map(|b| b.submit_time)
            .min();
        Ok(oldest
            .and_then(|submitted| (self.clock.now() - submitted).to_std().ok())
            .unwrap_or(Duration::ZERO))
    }

    fn queue_type(&self) -> &'static str {
        "Memory Queue"
    }

    async fn assert_healthy(&self, aggregator_id: Uuid) -> Result<()> {
        let state = self.state.lock().await;
        let now = self.clock.now();
        let stuck = state
            .batches
            .iter()
            .filter(|b| b.aggregator_id == Some(aggregator_id))
            .filter(|b| self.is_stale(b, self.config.unhealthy_threshold, now))
            .count();

        debug!(aggregator_id = %aggregator_id, stuck, "Checked aggregator for stuck batches");
        if stuck > 0 {
            return Err(JobQueueError::Unhealthy(
                "Aggregator is not making progress on the queue".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::job_request;
    use crate::models::prepare_job_batches;

    fn queue() -> (MemoryBatchQueue, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let queue = MemoryBatchQueue::with_clock(QueueConfig::default(), Arc::new(clock.clone()));
        (queue, clock)
    }

    #[tokio::test]
    async fn claims_by_priority_then_submission() {
        let (queue, clock) = queue();
        let bulk = queue.create_job(job_request(&["1", "2"])).await.unwrap();
        clock.advance(Duration::from_secs(1));
        let single = queue.create_job(job_request(&["3"])).await.unwrap();

        let aggregator = Uuid::new_v4();
        let first = queue.claim_batch(aggregator).await.unwrap().unwrap();
        let second = queue.claim_batch(aggregator).await.unwrap().unwrap();
        assert_eq!(first.job_id, single);
        assert_eq!(second.job_id, bulk);
        assert!(queue.claim_batch(aggregator).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_job_does_not_chunk() {
        let (queue, _) = queue();
        let patients: Vec<String> = (0..250).map(|i| i.to_string()).collect();
        let refs: Vec<&str> = patients.iter().map(String::as_str).collect();
        let job_id = queue.create_job(job_request(&refs)).await.unwrap();

        let batches = queue.get_job_batches(job_id).await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].patients.len(), 250);
        assert!(batches[0].submit_time.is_some());
    }

    #[tokio::test]
    async fn submits_prepared_batches() {
        let (queue, _) = queue();
        let batches = prepare_job_batches(&job_request(&["1", "2", "3"]), 2).unwrap();
        let job_id = queue.submit_job_batches(batches).await.unwrap();

        assert_eq!(queue.get_job_batches(job_id).await.unwrap().len(), 2);
        assert_eq!(queue.queue_size().await.unwrap(), 2);
        assert!(queue.submit_job_batches(Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn queue_age_tracks_oldest_queued_batch() {
        let (queue, clock) = queue();
        assert_eq!(queue.queue_age().await.unwrap(), Duration::ZERO);

        queue.create_job(job_request(&["1"])).await.unwrap();
        clock.advance(Duration::from_secs(90));
        assert_eq!(queue.queue_age().await.unwrap(), Duration::from_secs(90));

        queue.claim_batch(Uuid::new_v4()).await.unwrap().unwrap();
        assert_eq!(queue.queue_age().await.unwrap(), Duration::ZERO);
    }

    #[tokio::test]
    async fn completing_tallies_job_results() {
        let (queue, _) = queue();
        let aggregator = Uuid::new_v4();
        let job_id = queue.create_job(job_request(&["1", "2"])).await.unwrap();
        let mut batch = queue.claim_batch(aggregator).await.unwrap().unwrap();

        while batch.fetch_next_patient(aggregator).unwrap().is_some() {
            batch.add_job_queue_file(ResourceType::Patient, 0, 1);
            batch.add_job_queue_file(ResourceType::Coverage, 0, 2);
            queue.complete_partial_batch(&mut batch, aggregator).await.unwrap();
        }
        queue.complete_batch(&mut batch, aggregator).await.unwrap();

        let results = queue.get_job_results(job_id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].resource_type, ResourceType::Patient);
        assert_eq!(results[0].count, 2);
        assert_eq!(results[1].count, 4);

        let stored = queue.get_batch(batch.batch_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        let file_name = &stored.job_queue_batch_files[0].file_name;
        assert!(queue
            .get_job_batch_file(batch.org_id, file_name)
            .await
            .unwrap()
            .is_some());
        assert!(queue
            .get_job_batch_file(Uuid::new_v4(), file_name)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn paused_batch_resumes_where_it_stopped() {
        let (queue, _) = queue();
        let first = Uuid::new_v4();
        queue.create_job(job_request(&["1", "2"])).await.unwrap();

        let mut batch = queue.claim_batch(first).await.unwrap().unwrap();
        batch.fetch_next_patient(first).unwrap();
        queue.pause_batch(&mut batch, first).await.unwrap();

        let second = Uuid::new_v4();
        let mut resumed = queue.claim_batch(second).await.unwrap().unwrap();
        assert_eq!(resumed.batch_id, batch.batch_id);
        assert_eq!(resumed.fetch_next_patient(second).unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn fail_is_rejected_only_for_foreign_leases() {
        let (queue, _) = queue();
        let owner = Uuid::new_v4();
        queue.create_job(job_request(&["1"])).await.unwrap();
        let mut batch = queue.claim_batch(owner).await.unwrap().unwrap();

        let mut stolen = batch.clone();
        assert!(matches!(
            queue.fail_batch(&mut stolen, Uuid::new_v4()).await,
            Err(JobQueueError::LeaseLost { .. })
        ));

        queue.fail_batch(&mut batch, owner).await.unwrap();
        assert_eq!(batch.status, JobStatus::Failed);

        // Failing again is allowed once nobody holds the lease.
        queue.fail_batch(&mut stolen, Uuid::new_v4()).await.unwrap();
    }
}
