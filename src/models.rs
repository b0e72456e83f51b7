//! Export job and batch domain models.
//!
//! Every state transition takes `now` from the caller so that a queue can apply a single
//! authoritative clock to all of them.

use crate::error::{JobQueueError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Batches for a single patient jump ahead of bulk work.
pub const SINGLE_PATIENT_PRIORITY: i32 = 1000;
pub const SMOKE_TEST_PRIORITY: i32 = 1500;
pub const DEFAULT_PRIORITY: i32 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    Patient,
    ExplanationOfBenefit,
    Coverage,
    /// Output only, carries per-patient errors.
    OperationOutcome,
}

impl ResourceType {
    /// Types an export request may ask for.
    pub const SUPPORTED: [ResourceType; 3] = [
        ResourceType::Patient,
        ResourceType::ExplanationOfBenefit,
        ResourceType::Coverage,
    ];

    const ALL: [ResourceType; 4] = [
        ResourceType::Patient,
        ResourceType::ExplanationOfBenefit,
        ResourceType::Coverage,
        ResourceType::OperationOutcome,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ResourceType::Patient => "Patient",
            ResourceType::ExplanationOfBenefit => "ExplanationOfBenefit",
            ResourceType::Coverage => "Coverage",
            ResourceType::OperationOutcome => "OperationOutcome",
        }
    }

    /// Lowercase fragment used in output file names.
    pub fn path(&self) -> &'static str {
        match self {
            ResourceType::Patient => "patient",
            ResourceType::ExplanationOfBenefit => "explanationofbenefit",
            ResourceType::Coverage => "coverage",
            ResourceType::OperationOutcome => "operationoutcome",
        }
    }

    pub fn is_supported(&self) -> bool {
        Self::SUPPORTED.contains(self)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Invalid resource type: {}", s))
    }
}

impl TryFrom<String> for ResourceType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.to_uppercase().as_str() {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            _ => Err(format!("Invalid job status: {}", value)),
        }
    }
}

/// Running per-type tally of exported resources for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct JobResult {
    pub job_id: Uuid,
    #[sqlx(try_from = "String")]
    pub resource_type: ResourceType,
    pub count: i32,
}

impl JobResult {
    pub fn new(job_id: Uuid, resource_type: ResourceType) -> Self {
        Self {
            job_id,
            resource_type,
            count: 0,
        }
    }

    pub fn increment_count(&mut self, n: i32) {
        self.count += n.max(0);
    }
}

/// A whole export job tracked as one unit, without batching.
#[derive(Debug, Clone, Serialize)]
pub struct JobModel {
    pub job_id: Uuid,
    pub org_id: Uuid,
    pub provider_id: String,
    pub patients: Vec<String>,
    pub resource_types: Vec<ResourceType>,
    #[serde(skip)]
    pub rsa_public_key: Option<Vec<u8>>,
    pub status: JobStatus,
    pub job_results: Vec<JobResult>,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub complete_time: Option<DateTime<Utc>>,
}

impl JobModel {
    pub fn new(
        org_id: Uuid,
        provider_id: impl Into<String>,
        patients: Vec<String>,
        resource_types: Vec<ResourceType>,
        rsa_public_key: Option<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        validate_resource_types(&resource_types)?;
        Ok(Self {
            job_id: Uuid::new_v4(),
            org_id,
            provider_id: provider_id.into(),
            patients,
            resource_types,
            rsa_public_key,
            status: JobStatus::Queued,
            job_results: Vec::new(),
            submit_time: now,
            start_time: None,
            complete_time: None,
        })
    }

    pub fn output_file_name(job_id: Uuid, resource_type: ResourceType) -> String {
        format!("{}.{}", job_id, resource_type.path())
    }

    pub fn error_file_name(job_id: Uuid, resource_type: ResourceType) -> String {
        format!("{}-error.{}", job_id, resource_type.path())
    }

    pub fn is_valid(&self) -> bool {
        match self.status {
            JobStatus::Queued => true,
            JobStatus::Running => self.start_time.is_some(),
            JobStatus::Completed | JobStatus::Failed => {
                self.start_time.is_some() && self.complete_time.is_some()
            }
        }
    }

    pub fn set_running_status(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != JobStatus::Queued {
            return Err(JobQueueError::failure(
                self.job_id,
                format!("Cannot run job. JobStatus: {}", self.status),
            ));
        }
        self.status = JobStatus::Running;
        self.start_time = Some(now);
        Ok(())
    }

    pub fn set_finished_status(
        &mut self,
        status: JobStatus,
        results: Vec<JobResult>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status != JobStatus::Running {
            return Err(JobQueueError::failure(
                self.job_id,
                format!("Cannot finish job. JobStatus: {}", self.status),
            ));
        }
        if !self.job_results.is_empty() {
            return Err(JobQueueError::failure(
                self.job_id,
                "Cannot finish job. Results are already attached",
            ));
        }
        if !status.is_terminal() {
            return Err(JobQueueError::failure(
                self.job_id,
                format!("Cannot finish job with status {}", status),
            ));
        }
        self.status = status;
        self.job_results = results;
        self.complete_time = Some(now);
        Ok(())
    }
}

/// One output file of a batch; the count grows while the batch is still running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct JobQueueBatchFile {
    pub job_id: Uuid,
    pub batch_id: Uuid,
    #[sqlx(try_from = "String")]
    pub resource_type: ResourceType,
    pub sequence: i32,
    pub file_name: String,
    pub count: i32,
    pub checksum: Option<Vec<u8>>,
    pub file_length: i64,
}

impl JobQueueBatchFile {
    pub fn new(
        job_id: Uuid,
        batch_id: Uuid,
        resource_type: ResourceType,
        sequence: i32,
        count: i32,
    ) -> Self {
        Self {
            job_id,
            batch_id,
            resource_type,
            sequence,
            file_name: Self::form_output_file_name(batch_id, resource_type, sequence),
            count,
            checksum: None,
            file_length: 0,
        }
    }

    pub fn form_output_file_name(batch_id: Uuid, resource_type: ResourceType, sequence: i32) -> String {
        format!("{}-{}.{}", batch_id, sequence, resource_type.path())
    }
}

/// An export request as handed over by the API layer, already authorized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub org_id: Uuid,
    pub org_npi: String,
    pub provider_npi: String,
    pub patients: Vec<String>,
    pub resource_types: Vec<ResourceType>,
    pub since: Option<DateTime<Utc>>,
    pub transaction_time: DateTime<Utc>,
    pub requesting_ip: Option<String>,
    pub request_url: Option<String>,
    pub is_bulk: bool,
    pub use_cache: bool,
    #[serde(default)]
    pub is_smoke: bool,
}

impl JobRequest {
    pub fn validate(&self) -> Result<()> {
        validate_resource_types(&self.resource_types)
    }

    /// A `since` at or after the transaction time can never match any data.
    fn has_empty_window(&self) -> bool {
        matches!(self.since, Some(since) if self.transaction_time <= since)
    }

    fn priority(&self) -> i32 {
        if self.is_smoke {
            SMOKE_TEST_PRIORITY
        } else if self.patients.len() == 1 {
            SINGLE_PATIENT_PRIORITY
        } else {
            DEFAULT_PRIORITY
        }
    }
}

fn validate_resource_types(resource_types: &[ResourceType]) -> Result<()> {
    if resource_types.is_empty() {
        return Err(JobQueueError::InvalidRequest(
            "At least one resource type is required".into(),
        ));
    }
    if let Some(unsupported) = resource_types.iter().find(|t| !t.is_supported()) {
        return Err(JobQueueError::InvalidRequest(format!(
            "Unsupported resource type: {}",
            unsupported
        )));
    }
    Ok(())
}

/// The leasable unit of export work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobQueueBatch {
    pub batch_id: Uuid,
    pub job_id: Uuid,
    pub org_id: Uuid,
    pub org_npi: String,
    pub provider_npi: String,
    pub status: JobStatus,
    pub priority: i32,
    pub patients: Vec<String>,
    pub patient_index: Option<i32>,
    pub resource_types: Vec<ResourceType>,
    pub since: Option<DateTime<Utc>>,
    pub transaction_time: DateTime<Utc>,
    pub aggregator_id: Option<Uuid>,
    pub update_time: Option<DateTime<Utc>>,
    pub submit_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub complete_time: Option<DateTime<Utc>>,
    pub requesting_ip: Option<String>,
    pub request_url: Option<String>,
    pub is_bulk: bool,
    pub use_cache: bool,
    pub job_queue_batch_files: Vec<JobQueueBatchFile>,
}

impl JobQueueBatch {
    pub fn new(job_id: Uuid, request: &JobRequest, patients: Vec<String>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            job_id,
            org_id: request.org_id,
            org_npi: request.org_npi.clone(),
            provider_npi: request.provider_npi.clone(),
            status: JobStatus::Queued,
            priority: request.priority(),
            patients,
            patient_index: None,
            resource_types: request.resource_types.clone(),
            since: request.since,
            transaction_time: request.transaction_time,
            aggregator_id: None,
            update_time: None,
            submit_time: None,
            start_time: None,
            complete_time: None,
            requesting_ip: request.requesting_ip.clone(),
            request_url: request.request_url.clone(),
            is_bulk: request.is_bulk,
            use_cache: request.use_cache,
            job_queue_batch_files: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self.status {
            JobStatus::Queued => self.aggregator_id.is_none(),
            JobStatus::Running => {
                self.aggregator_id.is_some()
                    && self.submit_time.is_some()
                    && self.start_time.is_some()
                    && self.update_time.is_some()
            }
            JobStatus::Completed | JobStatus::Failed => {
                self.aggregator_id.is_none() && self.complete_time.is_some()
            }
        }
    }

    pub fn is_v2(&self) -> bool {
        self.request_url
            .as_deref()
            .map(|url| url.contains("/v2/"))
            .unwrap_or(false)
    }

    /// Fails with [`JobQueueError::LeaseLost`] when another aggregator holds the batch.
    pub fn verify_aggregator_id(&self, aggregator_id: Uuid) -> Result<()> {
        match self.aggregator_id {
            Some(holder) if holder != aggregator_id => Err(JobQueueError::LeaseLost {
                batch_id: self.batch_id,
                expected: aggregator_id,
                holder: Some(holder),
            }),
            _ => Ok(()),
        }
    }

    pub fn set_running_status(&mut self, aggregator_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        if self.status != JobStatus::Queued {
            return Err(JobQueueError::failure(
                self.batch_id,
                format!("Cannot run job. JobStatus: {}", self.status),
            ));
        }
        self.verify_aggregator_id(aggregator_id)?;
        self.status = JobStatus::Running;
        self.aggregator_id = Some(aggregator_id);
        self.start_time = Some(now);
        self.update_time = Some(now);
        Ok(())
    }

    /// Advances to the next patient, or returns `None` once every patient was handed out.
    pub fn fetch_next_patient(&mut self, aggregator_id: Uuid) -> Result<Option<String>> {
        if self.status != JobStatus::Running {
            return Err(JobQueueError::failure(
                self.batch_id,
                format!("Cannot fetch next batch. JobStatus: {}", self.status),
            ));
        }
        self.verify_aggregator_id(aggregator_id)?;

        let next = self.patient_index.map_or(0, |i| i + 1);
        match self.patients.get(next as usize) {
            Some(patient) => {
                self.patient_index = Some(next);
                Ok(Some(patient.clone()))
            }
            None => Ok(None),
        }
    }

    /// Hands the batch back to the queue keeping the progress made so far.
    pub fn set_paused_status(&mut self, aggregator_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        if self.status != JobStatus::Running {
            return Err(JobQueueError::failure(
                self.batch_id,
                format!("Cannot pause batch. JobStatus: {}", self.status),
            ));
        }
        self.verify_aggregator_id(aggregator_id)?;
        self.status = JobStatus::Queued;
        self.aggregator_id = None;
        self.update_time = Some(now);
        Ok(())
    }

    pub fn set_completed_status(&mut self, aggregator_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        if self.status != JobStatus::Running {
            return Err(JobQueueError::failure(
                self.batch_id,
                format!("Cannot complete. JobStatus: {}", self.status),
            ));
        }
        self.verify_aggregator_id(aggregator_id)?;

        let last = self.patients.len() as i32 - 1;
        if !self.patients.is_empty() && self.patient_index != Some(last) {
            return Err(JobQueueError::failure(
                self.batch_id,
                format!(
                    "Cannot complete. Job processing not finished. Only at {} of {}",
                    self.patients_processed(),
                    self.patients.len()
                ),
            ));
        }

        self.status = JobStatus::Completed;
        self.complete_time = Some(now);
        self.update_time = Some(now);
        self.aggregator_id = None;
        self.patient_index = None;
        Ok(())
    }

    /// Always succeeds regardless of the current state. Partial output is discarded.
    pub fn set_failed_status(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.complete_time = Some(now);
        self.update_time = Some(now);
        self.aggregator_id = None;
        self.job_queue_batch_files.clear();
    }

    /// Puts the batch back at the start of the queue with no progress.
    pub fn restart_batch(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.patient_index = None;
        self.start_time = None;
        self.complete_time = None;
        self.aggregator_id = None;
        self.update_time = Some(now);
        self.job_queue_batch_files.clear();
    }

    pub fn patients_processed(&self) -> usize {
        if self.status == JobStatus::Completed {
            return self.patients.len();
        }
        self.patient_index.map_or(0, |i| i as usize + 1)
    }

    /// Records `count` more resources in the `(resource_type, sequence)` file.
    pub fn add_job_queue_file(
        &mut self,
        resource_type: ResourceType,
        sequence: i32,
        count: i32,
    ) -> &JobQueueBatchFile {
        let position = self
            .job_queue_batch_files
            .iter()
            .position(|f| f.resource_type == resource_type && f.sequence == sequence);

        let index = match position {
            Some(index) => {
                self.job_queue_batch_files[index].count += count;
                index
            }
            None => {
                self.job_queue_batch_files.push(JobQueueBatchFile::new(
                    self.job_id,
                    self.batch_id,
                    resource_type,
                    sequence,
                    count,
                ));
                self.job_queue_batch_files.len() - 1
            }
        };
        &self.job_queue_batch_files[index]
    }

    pub fn get_job_queue_file(&self, resource_type: ResourceType) -> Option<&JobQueueBatchFile> {
        self.job_queue_batch_files
            .iter()
            .find(|f| f.resource_type == resource_type)
    }

    pub fn get_job_queue_file_latest(&self, resource_type: ResourceType) -> Option<&JobQueueBatchFile> {
        self.job_queue_batch_files
            .iter()
            .filter(|f| f.resource_type == resource_type)
            .max_by_key(|f| f.sequence)
    }
}

/// Splits a request into batches of at most `batch_size` patients sharing one job ID.
///
/// Requests without patients, or whose `since` leaves no data to export, yield a single
/// empty batch.
pub fn prepare_job_batches(request: &JobRequest, batch_size: usize) -> Result<Vec<JobQueueBatch>> {
    request.validate()?;
    if batch_size == 0 {
        return Err(JobQueueError::InvalidRequest(
            "Batch size must be positive".into(),
        ));
    }

    let job_id = Uuid::new_v4();
    if request.patients.is_empty() || request.has_empty_window() {
        let mut batch = JobQueueBatch::new(job_id, request, Vec::new());
        batch.is_bulk = true;
        return Ok(vec![batch]);
    }

    Ok(request
        .patients
        .chunks(batch_size)
        .map(|chunk| JobQueueBatch::new(job_id, request, chunk.to_vec()))
        .collect())
}
