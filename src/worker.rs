use crate::config::ServerConfig;
use crate::error::JobQueueError;
use crate::models::{JobQueueBatch, ResourceType};
use crate::queue::JobQueue;
use anyhow::{Context, Error};
use async_channel::Receiver;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{
    fs,
    io::{self, AsyncReadExt, AsyncWriteExt},
    sync::mpsc::UnboundedSender,
};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkMessage {
    BatchStarted(Uuid),
    BatchCompleted(Uuid),
    BatchPaused(Uuid),
    BatchFailed(Uuid, String),
}

/// NDJSON lines exported for one patient, grouped by resource type.
pub type PatientExport = Vec<(ResourceType, Vec<String>)>;

/// Fetches the resources of a single patient.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process_patient(&self, batch: &JobQueueBatch, patient: &str) -> Result<PatientExport, Error>;
}

#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<dyn JobQueue>,
    pub processor: Arc<dyn BatchProcessor>,
    pub aggregator_id: Uuid,
    pub export_path: PathBuf,
    pub resources_per_file: i32,
}

impl WorkerContext {
    pub fn new(queue: Arc<dyn JobQueue>, processor: Arc<dyn BatchProcessor>, config: &ServerConfig) -> Self {
        Self {
            queue,
            processor,
            aggregator_id: config.aggregator_id,
            export_path: config.export_path.clone(),
            resources_per_file: config.resources_per_file.max(1),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Completed,
    Paused,
}

pub fn ndjson_path(export_path: &Path, file_name: &str) -> PathBuf {
    export_path.join(format!("{}.ndjson", file_name))
}

pub async fn start(
    cancel_token: CancellationToken,
    ctx: WorkerContext,
    recv_from_queue: Receiver<JobQueueBatch>,
    send_to_server: UnboundedSender<WorkMessage>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            batch = recv_from_queue.recv() => {
                match batch {
                    Err(_) => {
                        debug!("Batch channel closed, exiting");
                        break;
                    },
                    Ok(mut batch) => {
                        let batch_id = batch.batch_id;
                        if send_to_server.send(WorkMessage::BatchStarted(batch_id)).is_err() {
                            error!("Server channel closed, exiting");
                            break;
                        }
                        let message = match process(&ctx, &cancel_token, &mut batch).await {
                            Ok(Outcome::Completed) => WorkMessage::BatchCompleted(batch_id),
                            Ok(Outcome::Paused) => WorkMessage::BatchPaused(batch_id),
                            Err(err) => {
                                fail(&ctx, &mut batch, &err).await;
                                WorkMessage::BatchFailed(batch_id, format!("{:#}", err))
                            }
                        };
                        if send_to_server.send(message).is_err() {
                            error!("Server channel closed, exiting");
                            break;
                        }
                    }
                }
            }
        }
    }
    info!("Worker stopped.");
}

#[instrument(skip_all, fields(batch_id = %batch.batch_id, job_id = %batch.job_id))]
async fn process(
    ctx: &WorkerContext,
    cancel_token: &CancellationToken,
    batch: &mut JobQueueBatch,
) -> Result<Outcome, Error> {
    if batch.patient_index.is_none() {
        remove_stale_output(&ctx.export_path, batch.batch_id).await?;
    }

    loop {
        if cancel_token.is_cancelled() {
            info!(processed = batch.patients_processed(), "Pausing batch");
            ctx.queue.pause_batch(batch, ctx.aggregator_id).await?;
            return Ok(Outcome::Paused);
        }

        let Some(patient) = batch.fetch_next_patient(ctx.aggregator_id)? else {
            break;
        };
        let export = ctx
            .processor
            .process_patient(batch, &patient)
            .await
            .with_context(|| format!("Failed to export patient {}", patient))?;

        // Output only reaches the batch files once the heartbeat confirms the lease
        let mut staged = Vec::new();
        let written = async {
            for (resource_type, lines) in export {
                write_resources(ctx, batch, resource_type, &lines, &mut staged).await?;
            }
            ctx.queue.complete_partial_batch(batch, ctx.aggregator_id).await?;
            Ok::<_, Error>(())
        }
        .await;
        if let Err(err) = written {
            discard(&staged).await;
            return Err(err);
        }
        commit(&staged).await?;
    }

    seal_files(&ctx.export_path, batch).await?;
    ctx.queue.complete_batch(batch, ctx.aggregator_id).await?;
    info!(files = batch.job_queue_batch_files.len(), "Batch completed");
    Ok(Outcome::Completed)
}

async fn fail(ctx: &WorkerContext, batch: &mut JobQueueBatch, err: &Error) {
    error!(batch_id = %batch.batch_id, error = ?err, "Batch failed");
    if let Some(JobQueueError::LeaseLost { holder, .. }) = err.downcast_ref::<JobQueueError>() {
        warn!(batch_id = %batch.batch_id, holder = ?holder, "Lease lost, leaving the batch alone");
        return;
    }
    if let Err(err) = ctx.queue.fail_batch(batch, ctx.aggregator_id).await {
        error!(batch_id = %batch.batch_id, error = ?err, "Could not mark batch as failed");
    }
}

/// A chunk of output held in a part file private to one aggregator.
struct Staged {
    part: PathBuf,
    target: PathBuf,
}

fn part_path(export_path: &Path, file_name: &str, aggregator_id: Uuid) -> PathBuf {
    export_path.join(format!("{}.ndjson.{}.part", file_name, aggregator_id))
}

/// Spreads `lines` over the batch's files, opening a new sequence when the latest one is full.
/// Each chunk is staged next to its target and recorded in `staged`.
async fn write_resources(
    ctx: &WorkerContext,
    batch: &mut JobQueueBatch,
    resource_type: ResourceType,
    lines: &[String],
    staged: &mut Vec<Staged>,
) -> Result<(), Error> {
    let limit = ctx.resources_per_file;
    let mut remaining = lines;
    while !remaining.is_empty() {
        let (sequence, room) = match batch.get_job_queue_file_latest(resource_type) {
            Some(file) if file.count < limit => (file.sequence, limit - file.count),
            Some(file) => (file.sequence + 1, limit),
            None => (0, limit),
        };
        let (chunk, rest) = remaining.split_at(remaining.len().min(room as usize));
        let file_name = batch
            .add_job_queue_file(resource_type, sequence, chunk.len() as i32)
            .file_name
            .clone();
        let part = part_path(&ctx.export_path, &file_name, ctx.aggregator_id);
        staged.push(Staged {
            part: part.clone(),
            target: ndjson_path(&ctx.export_path, &file_name),
        });
        write_lines(&part, chunk).await?;
        remaining = rest;
    }
    Ok(())
}

async fn write_lines(path: &Path, lines: &[String]) -> Result<(), Error> {
    let mut file = fs::File::create(path)
        .await
        .with_context(|| format!("Cannot create {}", path.display()))?;
    for line in lines {
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
    }
    file.flush().await?;
    Ok(())
}

/// Appends staged chunks to their targets.
async fn commit(staged: &[Staged]) -> Result<(), Error> {
    for file in staged {
        let mut part = fs::File::open(&file.part)
            .await
            .with_context(|| format!("Cannot open {}", file.part.display()))?;
        let mut target = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file.target)
            .await
            .with_context(|| format!("Cannot open {}", file.target.display()))?;
        io::copy(&mut part, &mut target).await?;
        target.flush().await?;
        fs::remove_file(&file.part).await?;
    }
    Ok(())
}

async fn discard(staged: &[Staged]) {
    for file in staged {
        match fs::remove_file(&file.part).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %file.part.display(), error = ?err, "Could not remove staged output"),
        }
    }
}

/// Records the length and checksum of every output file.
async fn seal_files(export_path: &Path, batch: &mut JobQueueBatch) -> Result<(), Error> {
    let mut buf = vec![0u8; 64 * 1024];
    for file in batch.job_queue_batch_files.iter_mut() {
        let path = ndjson_path(export_path, &file.file_name);
        let mut output = fs::File::open(&path)
            .await
            .with_context(|| format!("Cannot open {}", path.display()))?;
        let mut hasher = Sha256::new();
        loop {
            let read = output.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        file.file_length = output.metadata().await?.len() as i64;
        file.checksum = Some(hasher.finalize().to_vec());
    }
    Ok(())
}

/// A batch starting over must not append to files left by an earlier attempt.
async fn remove_stale_output(export_path: &Path, batch_id: Uuid) -> Result<(), Error> {
    let prefix = format!("{}-", batch_id);
    let mut entries = match fs::read_dir(export_path).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir_all(export_path).await?;
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            debug!(path = %entry.path().display(), "Removing stale output");
            fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}
