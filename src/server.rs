use crate::config::ServerConfig;
use crate::health::QueueHealth;
use crate::models::JobQueueBatch;
use crate::queue::JobQueue;
use crate::worker::{self, BatchProcessor, WorkMessage, WorkerContext};
use anyhow::Error;
use std::sync::Arc;
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Runs one aggregator: claims batches while workers are free and stops when cancelled or
/// when the queue reports it unhealthy. Running batches are paused on the way out.
pub async fn serve(
    cancel_token: CancellationToken,
    queue: Arc<dyn JobQueue>,
    processor: Arc<dyn BatchProcessor>,
    health: Option<Arc<QueueHealth>>,
    config: ServerConfig,
) -> Result<(), Error> {
    let aggregator_id = config.aggregator_id;
    info!(%aggregator_id, queue = queue.queue_type(), workers = config.workers, "Starting aggregator");

    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
    let (send_to_queue, recv_from_queue) =
        async_channel::bounded::<JobQueueBatch>(config.workers.max(1) as usize);

    let ctx = WorkerContext::new(queue.clone(), processor, &config);
    let mut workers = vec![];
    for _ in 0..config.workers {
        let send_to_server = send_to_server.clone();
        let cancel_token = cancel_token.clone();
        let recv_from_queue = recv_from_queue.clone();
        let ctx = ctx.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(cancel_token, ctx, recv_from_queue, send_to_server).await;
            }
            .instrument(info_span!("worker")),
        );
        workers.push(join_handle);
    }
    drop(send_to_server);

    let mut free_workers = config.workers as i64;
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut outcome = Ok(());

    loop {
        while free_workers > 0 && !cancel_token.is_cancelled() {
            match queue.claim_batch(aggregator_id).await {
                Ok(Some(batch)) => {
                    debug!(batch_id = %batch.batch_id, "Claimed batch");
                    send_to_queue.send(batch).await?;
                    free_workers -= 1;
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = ?err, "Could not claim a batch");
                    break;
                }
            }
        }

        // Wait for a worker to free up, a health tick or cancellation
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            chan_msg = recv_from_worker.recv() => {
                match chan_msg {
                    None => {
                        debug!("Worker channel closed unexpectedly, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(WorkMessage::BatchStarted(batch_id)) => {
                        debug!(message = "Starting batch", batch_id = ?batch_id);
                    },
                    Some(WorkMessage::BatchCompleted(batch_id)) => {
                        info!(message = "Completed batch", batch_id = ?batch_id);
                        free_workers += 1;
                    },
                    Some(WorkMessage::BatchPaused(batch_id)) => {
                        info!(message = "Paused batch", batch_id = ?batch_id);
                        free_workers += 1;
                    },
                    Some(WorkMessage::BatchFailed(batch_id, error_msg)) => {
                        warn!(message = "Failed batch", batch_id = ?batch_id, error = ?error_msg);
                        free_workers += 1;
                    },
                }
            },
            _ = ticker.tick() => {
                if let Err(err) = check_health(queue.as_ref(), health.as_deref(), &config).await {
                    error!(error = ?err, "Aggregator is unhealthy, shutting down");
                    cancel_token.cancel();
                    outcome = Err(err);
                    break;
                }
                match queue.queue_size().await {
                    Ok(size) => trace!(size, "Queue size"),
                    Err(err) => warn!(error = ?err, "Could not read queue size"),
                }
            }
        }
    }

    send_to_queue.close();

    // Wait for all workers to pause or finish their batches
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    outcome
}

async fn check_health(
    queue: &dyn JobQueue,
    health: Option<&QueueHealth>,
    config: &ServerConfig,
) -> Result<(), Error> {
    queue.assert_healthy(config.aggregator_id).await?;
    if let Some(health) = health {
        health.is_healthy().await?;
    }
    trace!("Aggregator healthy");
    Ok(())
}
