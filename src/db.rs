use crate::error::{JobQueueError, Result};
use crate::metrics::QueueMetrics;
use crate::models::{JobQueueBatch, JobQueueBatchFile, JobResult, JobStatus, ResourceType};
use crate::queue::{ensure_can_fail, ensure_lease, submission_job_id, JobQueue, QueueConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Executor;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

const BATCH_COLUMNS: &str = "batch_id, job_id, org_id, org_npi, provider_npi, status, priority, \
    patients, patient_index, resource_types, since, transaction_time, aggregator_id, \
    update_time, submit_time, start_time, complete_time, requesting_ip, request_url, \
    is_bulk, use_cache";

const FILE_COLUMNS: &str =
    "job_id, batch_id, resource_type, sequence, file_name, count, checksum, file_length";

#[derive(sqlx::FromRow)]
struct BatchRow {
    batch_id: Uuid,
    job_id: Uuid,
    org_id: Uuid,
    org_npi: String,
    provider_npi: String,
    #[sqlx(try_from = "String")]
    status: JobStatus,
    priority: i32,
    patients: Vec<String>,
    patient_index: Option<i32>,
    resource_types: Vec<String>,
    since: Option<DateTime<Utc>>,
    transaction_time: DateTime<Utc>,
    aggregator_id: Option<Uuid>,
    update_time: Option<DateTime<Utc>>,
    submit_time: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
    complete_time: Option<DateTime<Utc>>,
    requesting_ip: Option<String>,
    request_url: Option<String>,
    is_bulk: bool,
    use_cache: bool,
}

impl BatchRow {
    fn into_batch(self, files: Vec<JobQueueBatchFile>) -> Result<JobQueueBatch> {
        let resource_types = self
            .resource_types
            .iter()
            .map(|t| t.parse::<ResourceType>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| JobQueueError::failure(self.batch_id, e))?;

        Ok(JobQueueBatch {
            batch_id: self.batch_id,
            job_id: self.job_id,
            org_id: self.org_id,
            org_npi: self.org_npi,
            provider_npi: self.provider_npi,
            status: self.status,
            priority: self.priority,
            patients: self.patients,
            patient_index: self.patient_index,
            resource_types,
            since: self.since,
            transaction_time: self.transaction_time,
            aggregator_id: self.aggregator_id,
            update_time: self.update_time,
            submit_time: self.submit_time,
            start_time: self.start_time,
            complete_time: self.complete_time,
            requesting_ip: self.requesting_ip,
            request_url: self.request_url,
            is_bulk: self.is_bulk,
            use_cache: self.use_cache,
            job_queue_batch_files: files,
        })
    }
}

fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

/// Queue backed by PostgreSQL, safe to share between any number of aggregator processes.
///
/// Every transition runs in one transaction that locks the batch row. Staleness is always
/// judged against the database server's clock.
#[derive(Clone)]
pub struct DistributedBatchQueue {
    pool: PgPool,
    config: QueueConfig,
    metrics: Option<QueueMetrics>,
}

impl DistributedBatchQueue {
    pub async fn connect(url: &str, max_connections: u32, config: QueueConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Self::setup(&pool).await?;
        Ok(Self::new(pool, config))
    }

    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self {
            pool,
            config,
            metrics: None,
        }
    }

    /// Creates the queue and root key tables when missing.
    pub async fn setup(pool: &PgPool) -> Result<()> {
        pool.execute(include_str!("setup.sql")).await?;
        Ok(())
    }

    pub fn with_metrics(mut self, metrics: QueueMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn db_now(conn: &mut PgConnection) -> Result<DateTime<Utc>> {
        Ok(sqlx::query_scalar::<_, DateTime<Utc>>("SELECT now()")
            .fetch_one(&mut *conn)
            .await?)
    }

    async fn load_files(conn: &mut PgConnection, batch_id: Uuid) -> Result<Vec<JobQueueBatchFile>> {
        Ok(sqlx::query_as::<_, JobQueueBatchFile>(&format!(
            "SELECT {} FROM job_queue_batch_file WHERE batch_id = $1 ORDER BY resource_type, sequence",
            FILE_COLUMNS
        ))
        .bind(batch_id)
        .fetch_all(&mut *conn)
        .await?)
    }

    async fn hydrate(conn: &mut PgConnection, rows: Vec<BatchRow>) -> Result<Vec<JobQueueBatch>> {
        let mut batches = Vec::with_capacity(rows.len());
        for row in rows {
            let files = Self::load_files(conn, row.batch_id).await?;
            batches.push(row.into_batch(files)?);
        }
        Ok(batches)
    }

    /// Reads the batch row under `FOR UPDATE`, blocking concurrent writers until commit.
    async fn lock_batch(conn: &mut PgConnection, batch_id: Uuid) -> Result<JobQueueBatch> {
        let row = sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {} FROM job_queue_batch WHERE batch_id = $1 FOR UPDATE",
            BATCH_COLUMNS
        ))
        .bind(batch_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(JobQueueError::NotFound(batch_id))?;
        let files = Self::load_files(conn, batch_id).await?;
        row.into_batch(files)
    }

    async fn insert_batch(conn: &mut PgConnection, batch: &JobQueueBatch) -> Result<()> {
        let resource_types: Vec<String> =
            batch.resource_types.iter().map(|t| t.name().to_string()).collect();
        sqlx::query(&format!(
            "INSERT INTO job_queue_batch ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, now(), $15, $16, $17, $18, $19, $20)",
            BATCH_COLUMNS
        ))
        .bind(batch.batch_id)
        .bind(batch.job_id)
        .bind(batch.org_id)
        .bind(&batch.org_npi)
        .bind(&batch.provider_npi)
        .bind(batch.status.as_str())
        .bind(batch.priority)
        .bind(&batch.patients)
        .bind(batch.patient_index)
        .bind(&resource_types)
        .bind(batch.since)
        .bind(batch.transaction_time)
        .bind(batch.aggregator_id)
        .bind(batch.update_time)
        .bind(batch.start_time)
        .bind(batch.complete_time)
        .bind(&batch.requesting_ip)
        .bind(&batch.request_url)
        .bind(batch.is_bulk)
        .bind(batch.use_cache)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Writes the mutable columns of `batch` and replaces its file rows.
    async fn write_batch(conn: &mut PgConnection, batch: &JobQueueBatch) -> Result<()> {
        sqlx::query(
            "UPDATE job_queue_batch SET \
                status = $2, \
                patient_index = $3, \
                aggregator_id = $4, \
                update_time = $5, \
                start_time = $6, \
                complete_time = $7 \
            WHERE batch_id = $1",
        )
        .bind(batch.batch_id)
        .bind(batch.status.as_str())
        .bind(batch.patient_index)
        .bind(batch.aggregator_id)
        .bind(batch.update_time)
        .bind(batch.start_time)
        .bind(batch.complete_time)
        .execute(&mut *conn)
        .await?;

        sqlx::query("DELETE FROM job_queue_batch_file WHERE batch_id = $1")
            .bind(batch.batch_id)
            .execute(&mut *conn)
            .await?;

        for file in &batch.job_queue_batch_files {
            sqlx::query(&format!(
                "INSERT INTO job_queue_batch_file ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                FILE_COLUMNS
            ))
            .bind(file.job_id)
            .bind(file.batch_id)
            .bind(file.resource_type.name())
            .bind(file.sequence)
            .bind(&file.file_name)
            .bind(file.count)
            .bind(&file.checksum)
            .bind(file.file_length)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    async fn restart_stuck_batches(&self, conn: &mut PgConnection, now: DateTime<Utc>) -> Result<usize> {
        let rows = sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {} FROM job_queue_batch \
             WHERE status = 'RUNNING' AND update_time < now() - make_interval(secs => $1) \
             FOR UPDATE SKIP LOCKED",
            BATCH_COLUMNS
        ))
        .bind(seconds(self.config.stuck_batch_threshold))
        .fetch_all(&mut *conn)
        .await?;

        let stuck = Self::hydrate(conn, rows).await?;
        for mut batch in stuck.iter().cloned() {
            warn!(batch_id = %batch.batch_id, aggregator_id = ?batch.aggregator_id, "Restarting stuck batch");
            batch.restart_batch(now);
            Self::write_batch(conn, &batch).await?;
        }
        Ok(stuck.len())
    }

    async fn claim_queued_batch(
        &self,
        conn: &mut PgConnection,
        aggregator_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<JobQueueBatch>> {
        let row = sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {} FROM job_queue_batch \
             WHERE status = 'QUEUED' \
             ORDER BY priority ASC, submit_time ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED",
            BATCH_COLUMNS
        ))
        .fetch_optional(&mut *conn)
        .await?;

        let mut batch = match row {
            Some(row) => {
                let files = Self::load_files(conn, row.batch_id).await?;
                row.into_batch(files)?
            }
            None => return Ok(None),
        };

        if let Err(err) = batch.set_running_status(aggregator_id, now) {
            error!(batch_id = %batch.batch_id, error = %err, "Failed to mark batch as running, failing it");
            batch.set_failed_status(now);
            Self::write_batch(conn, &batch).await?;
            return Ok(None);
        }
        Self::write_batch(conn, &batch).await?;

        if let Some(metrics) = &self.metrics {
            QueueMetrics::observe_between(&metrics.wait_time, batch.submit_time, now);
        }
        Ok(Some(batch))
    }
}

#[async_trait]
impl JobQueue for DistributedBatchQueue {
    #[instrument(skip_all, fields(batches = batches.len()))]
    async fn submit_job_batches(&self, batches: Vec<JobQueueBatch>) -> Result<Uuid> {
        let job_id = submission_job_id(&batches)?;
        let mut tx = self.pool.begin().await?;
        for batch in &batches {
            Self::insert_batch(&mut *tx, batch).await?;
        }
        tx.commit().await?;

        debug!(job_id = %job_id, org_id = %batches[0].org_id, "Added job to the queue");
        Ok(job_id)
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<JobQueueBatch>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {} FROM job_queue_batch WHERE batch_id = $1",
            BATCH_COLUMNS
        ))
        .bind(batch_id)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => Ok(Self::hydrate(&mut *conn, vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn get_job_batches(&self, job_id: Uuid) -> Result<Vec<JobQueueBatch>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {} FROM job_queue_batch WHERE job_id = $1 ORDER BY submit_time ASC",
            BATCH_COLUMNS
        ))
        .bind(job_id)
        .fetch_all(&mut *conn)
        .await?;
        Self::hydrate(&mut *conn, rows).await
    }

    async fn get_job_batch_file(
        &self,
        org_id: Uuid,
        file_name: &str,
    ) -> Result<Option<JobQueueBatchFile>> {
        Ok(sqlx::query_as::<_, JobQueueBatchFile>(
            "SELECT f.job_id, f.batch_id, f.resource_type, f.sequence, f.file_name, f.count, \
                    f.checksum, f.file_length \
             FROM job_queue_batch_file f \
             JOIN job_queue_batch b ON b.batch_id = f.batch_id \
             WHERE f.file_name = $1 AND b.org_id = $2",
        )
        .bind(file_name)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    #[instrument(skip_all, fields(aggregator_id = %aggregator_id))]
    async fn claim_batch(&self, aggregator_id: Uuid) -> Result<Option<JobQueueBatch>> {
        let mut tx = self.pool.begin().await?;
        let now = Self::db_now(&mut *tx).await?;

        if self.restart_stuck_batches(&mut *tx, now).await? > 0 {
            tx.commit().await?;
            return Ok(None);
        }

        let claimed = self.claim_queued_batch(&mut *tx, aggregator_id, now).await?;
        tx.commit().await?;

        if let Some(batch) = &claimed {
            debug!(batch_id = %batch.batch_id, job_id = %batch.job_id, "Claimed batch");
        }
        Ok(claimed)
    }

    async fn pause_batch(&self, batch: &mut JobQueueBatch, aggregator_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let stored = Self::lock_batch(&mut *tx, batch.batch_id).await?;
        ensure_lease(&stored, aggregator_id)?;

        let now = Self::db_now(&mut *tx).await?;
        batch.set_paused_status(aggregator_id, now)?;
        Self::write_batch(&mut *tx, batch).await?;
        tx.commit().await?;

        debug!(batch_id = %batch.batch_id, "Paused batch");
        Ok(())
    }

    async fn complete_partial_batch(
        &self,
        batch: &mut JobQueueBatch,
        aggregator_id: Uuid,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let stored = Self::lock_batch(&mut *tx, batch.batch_id).await?;
        ensure_lease(&stored, aggregator_id)?;
        batch.verify_aggregator_id(aggregator_id)?;

        let now = Self::db_now(&mut *tx).await?;
        batch.update_time = Some(now);
        Self::write_batch(&mut *tx, batch).await?;
        tx.commit().await?;

        if let Some(metrics) = &self.metrics {
            QueueMetrics::observe_between(&metrics.partial_time, stored.update_time, now);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(batch_id = %batch.batch_id, aggregator_id = %aggregator_id))]
    async fn complete_batch(&self, batch: &mut JobQueueBatch, aggregator_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let stored = Self::lock_batch(&mut *tx, batch.batch_id).await?;
        ensure_lease(&stored, aggregator_id)?;

        let now = Self::db_now(&mut *tx).await?;
        batch.set_completed_status(aggregator_id, now)?;
        Self::write_batch(&mut *tx, batch).await?;

        for file in &batch.job_queue_batch_files {
            sqlx::query(
                "INSERT INTO job_result (job_id, resource_type, count) VALUES ($1, $2, $3) \
                 ON CONFLICT (job_id, resource_type) \
                 DO UPDATE SET count = job_result.count + EXCLUDED.count",
            )
            .bind(batch.job_id)
            .bind(file.resource_type.name())
            .bind(file.count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        if let Some(metrics) = &self.metrics {
            QueueMetrics::observe_between(&metrics.success_time, batch.start_time, now);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(batch_id = %batch.batch_id, aggregator_id = %aggregator_id))]
    async fn fail_batch(&self, batch: &mut JobQueueBatch, aggregator_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let stored = Self::lock_batch(&mut *tx, batch.batch_id).await?;
        ensure_can_fail(&stored, aggregator_id)?;

        let now = Self::db_now(&mut *tx).await?;
        batch.set_failed_status(now);
        Self::write_batch(&mut *tx, batch).await?;
        tx.commit().await?;

        if let Some(metrics) = &self.metrics {
            QueueMetrics::observe_between(&metrics.failure_time, batch.start_time, now);
        }
        Ok(())
    }

    async fn get_job_results(&self, job_id: Uuid) -> Result<Vec<JobResult>> {
        Ok(sqlx::query_as::<_, JobResult>(
            "SELECT job_id, resource_type, count FROM job_result WHERE job_id = $1 ORDER BY resource_type",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn queue_size(&self) -> Result<i64> {
        let size: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM job_queue_batch WHERE status = 'QUEUED'")
                .fetch_one(&self.pool)
                .await?;
        if let Some(metrics) = &self.metrics {
            metrics.queue_length.set(size);
        }
        Ok(size)
    }

    async fn queue_age(&self) -> Result<Duration> {
        // Rows without a submit time are ignored by MIN.
        let age: Option<f64> = sqlx::query_scalar(
            "SELECT EXTRACT(EPOCH FROM now() - MIN(submit_time))::float8 \
             FROM job_queue_batch WHERE status = 'QUEUED'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(age
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::ZERO))
    }

    fn queue_type(&self) -> &'static str {
        "Database Queue"
    }

    async fn assert_healthy(&self, aggregator_id: Uuid) -> Result<()> {
        let stuck: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_queue_batch \
             WHERE aggregator_id = $1 AND status = 'RUNNING' \
               AND update_time < now() - make_interval(secs => $2)",
        )
        .bind(aggregator_id)
        .bind(seconds(self.config.unhealthy_threshold))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| JobQueueError::Unhealthy(format!("Database cluster is not responding: {}", e)))?;

        debug!(aggregator_id = %aggregator_id, stuck, "Checked aggregator for stuck batches");
        if stuck > 0 {
            return Err(JobQueueError::Unhealthy(
                "Aggregator is not making progress on the queue".into(),
            ));
        }
        Ok(())
    }
}
