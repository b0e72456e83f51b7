use anyhow::Error;
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::{env, sync::Arc, time::Duration};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};
use uuid::Uuid;

use dpc_queue::config::{Command, ConfigContext, HealthArgs, ServerConfig};
use dpc_queue::health::{PgLockCluster, QueueHealth};
use dpc_queue::macaroons::tokens::{self, CURRENT_TOKEN_VERSION};
use dpc_queue::macaroons::{
    ExpirationCaveatVerifier, MacaroonBakery, PgRootKeyStore, VersionCaveatVerifier,
};
use dpc_queue::metrics::QueueMetrics;
use dpc_queue::models::prepare_job_batches;
use dpc_queue::worker::{BatchProcessor, PatientExport};
use dpc_queue::{server, telemetry};
use dpc_queue::{DistributedBatchQueue, JobQueue, JobQueueBatch, JobRequest, QueueConfig};

/// Emits one placeholder resource per requested type for every patient.
struct SyntheticProcessor;

#[async_trait]
impl BatchProcessor for SyntheticProcessor {
    async fn process_patient(&self, batch: &JobQueueBatch, patient: &str) -> Result<PatientExport, Error> {
        Ok(batch
            .resource_types
            .iter()
            .map(|rt| {
                let resource = json!({
                    "resourceType": rt.name(),
                    "id": format!("{}-{}", rt.path(), patient),
                    "meta": { "lastUpdated": batch.transaction_time },
                });
                (*rt, vec![resource.to_string()])
            })
            .collect())
    }
}

async fn connect(config: &ConfigContext) -> Result<DistributedBatchQueue, Error> {
    let queue = DistributedBatchQueue::connect(
        &config.connect_url,
        config.max_connections,
        QueueConfig::from(&config.queue),
    )
    .await?;
    Ok(queue)
}

fn queue_health(queue: &DistributedBatchQueue, args: &HealthArgs) -> QueueHealth {
    let cluster = PgLockCluster::new(vec![queue.pool().clone()]);
    QueueHealth::new(Arc::new(cluster), queue.pool().clone())
        .with_health_query(args.health_query.clone())
        .with_ping_timeout(Duration::from_secs(args.ping_timeout_secs))
}

fn bakery(queue: &DistributedBatchQueue, location: &str) -> MacaroonBakery {
    MacaroonBakery::builder(location, Arc::new(PgRootKeyStore::new(queue.pool().clone())))
        .add_default_verifier(VersionCaveatVerifier::new(CURRENT_TOKEN_VERSION))
        .add_default_verifier(ExpirationCaveatVerifier)
        .build()
}

#[instrument(skip_all)]
async fn setup(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    let queue = connect(&config).await?;

    match config.command.clone() {
        Command::Run {
            workers,
            aggregator_id,
            poll_interval_ms,
            export_path,
            resources_per_file,
            health,
        } => {
            let queue_health = queue_health(&queue, &health);
            let queue = queue.with_metrics(QueueMetrics::register(prometheus::default_registry())?);
            let server_config = ServerConfig {
                aggregator_id: aggregator_id.unwrap_or_else(Uuid::new_v4),
                workers,
                poll_interval: Duration::from_millis(poll_interval_ms),
                export_path,
                resources_per_file,
            };

            let result = server::serve(
                cancel_token,
                Arc::new(queue),
                Arc::new(SyntheticProcessor),
                Some(Arc::new(queue_health)),
                server_config,
            )
            .instrument(info_span!("server"))
            .await;

            let mut buffer = vec![];
            TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
            debug!(metrics = %String::from_utf8_lossy(&buffer), "Final queue metrics");
            result?;
        }
        Command::Health { aggregator_id, health } => {
            queue_health(&queue, &health).is_healthy().await?;
            if let Some(aggregator_id) = aggregator_id {
                queue.assert_healthy(aggregator_id).await?;
            }
            println!("{} is healthy", queue.queue_type());
        }
        Command::Stats => {
            let size = queue.queue_size().await?;
            let age = queue.queue_age().await?;
            println!("queue_type={} queue_size={} queue_age_secs={}", queue.queue_type(), size, age.as_secs());
        }
        Command::Submit {
            org_id,
            org_npi,
            provider_npi,
            patients,
            resource_types,
            since,
            chunk,
        } => {
            let request = JobRequest {
                org_id,
                org_npi,
                provider_npi,
                is_bulk: patients.len() != 1,
                patients,
                resource_types,
                since,
                transaction_time: Utc::now(),
                requesting_ip: None,
                request_url: None,
                use_cache: false,
                is_smoke: false,
            };
            let job_id = if chunk {
                let batches = prepare_job_batches(&request, config.queue.batch_size)?;
                info!(batches = batches.len(), "Submitting chunked job");
                queue.submit_job_batches(batches).await?
            } else {
                queue.create_job(request).await?
            };
            println!("{}", job_id);
        }
        Command::MintToken {
            org_id,
            lifetime_secs,
            location,
            json,
        } => {
            let bakery = bakery(&queue, &location);
            let caveats = tokens::generate_caveats_for_token(
                CURRENT_TOKEN_VERSION,
                org_id,
                chrono::Duration::seconds(lifetime_secs),
            )?;
            let macaroon = bakery.create_macaroon(&caveats).await?;
            println!("{}", String::from_utf8(bakery.serialize_macaroon(&macaroon, !json))?);
        }
        Command::VerifyToken { org_id, token } => {
            let macaroon = MacaroonBakery::deserialize_macaroon(&token)?;
            let bakery = bakery(&queue, macaroon.location());
            let expected = tokens::organization_caveat(org_id).to_string();
            bakery.verify_macaroon_exact(&macaroon, &[expected.as_str()]).await?;
            println!("Token is valid for organization {}", tokens::extract_org_id(&macaroon)?);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "dpc_queue=DEBUG");
    }
    let config = ConfigContext::parse();

    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(cloned_token, config));

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(err), _) | (_, Err(err)) => {
                    error!(error = ?err, "Cannot install signal handlers");
                    return;
                }
            };
        tokio::select! {
            _ = sigterm.recv() => {info!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {info!("Received SIGINT"); token.cancel()},
        }
    });
    let result = app.await?;
    info!("Shutting down.");
    telemetry::shutdown();

    result?;
    Ok(())
}
