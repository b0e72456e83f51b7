//! Runs against a real database when `DPC_QUEUE_TEST_DATABASE_URL` is set, otherwise every
//! test returns early.

mod common;

use common::request;
use dpc_queue::health::{PgLockCluster, QueueHealth};
use dpc_queue::macaroons::{
    tokens, ExpirationCaveatVerifier, MacaroonBakery, PgRootKeyStore, VersionCaveatVerifier,
};
use dpc_queue::{DistributedBatchQueue, JobQueue, JobQueueError, JobStatus, QueueConfig, ResourceType};
use std::sync::Arc;
use uuid::Uuid;

async fn queue() -> Option<DistributedBatchQueue> {
    let url = std::env::var("DPC_QUEUE_TEST_DATABASE_URL").ok()?;
    let queue = DistributedBatchQueue::connect(&url, 5, QueueConfig::default())
        .await
        .unwrap();
    sqlx::query("TRUNCATE job_queue_batch, job_queue_batch_file, job_result")
        .execute(queue.pool())
        .await
        .unwrap();
    Some(queue)
}

/// Moves every heartbeat of the batch into the past.
async fn backdate(queue: &DistributedBatchQueue, batch_id: Uuid, minutes: i32) {
    sqlx::query(
        "UPDATE job_queue_batch SET update_time = now() - make_interval(mins => $2) WHERE batch_id = $1",
    )
    .bind(batch_id)
    .bind(minutes)
    .execute(queue.pool())
    .await
    .unwrap();
}

// Every test truncates the same tables, so they share one test function.
#[tokio::test]
async fn distributed_queue() {
    let Some(queue) = queue().await else {
        return;
    };

    stuck_batch_is_recovered_and_reclaimed(&queue).await;
    concurrent_claims_have_one_winner(&queue).await;
    completed_batches_publish_results(&queue).await;
    health_probe_passes(&queue).await;
    tokens_survive_a_round_trip(&queue).await;
}

async fn stuck_batch_is_recovered_and_reclaimed(queue: &DistributedBatchQueue) {
    let job_id = queue
        .create_job(request(
            Uuid::new_v4(),
            &["1", "2"],
            &[ResourceType::Patient, ResourceType::Coverage],
        ))
        .await
        .unwrap();

    let (w1, w2) = (Uuid::new_v4(), Uuid::new_v4());
    let mut batch = queue.claim_batch(w1).await.unwrap().unwrap();
    assert_eq!(batch.job_id, job_id);
    batch.fetch_next_patient(w1).unwrap();
    batch.add_job_queue_file(ResourceType::Patient, 0, 5);
    queue.complete_partial_batch(&mut batch, w1).await.unwrap();

    let stored = queue.get_batch(batch.batch_id).await.unwrap().unwrap();
    assert_eq!(stored.job_queue_batch_files.len(), 1);
    assert_eq!(stored.patient_index, Some(0));

    backdate(queue, batch.batch_id, 10).await;
    assert!(queue.claim_batch(w2).await.unwrap().is_none());
    let err = queue.assert_healthy(w1).await.unwrap_err();
    assert!(matches!(err, JobQueueError::Unhealthy(_)));

    backdate(queue, batch.batch_id, 20).await;
    assert!(queue.claim_batch(w2).await.unwrap().is_none());
    let reclaimed = queue.claim_batch(w2).await.unwrap().unwrap();
    assert_eq!(reclaimed.batch_id, batch.batch_id);
    assert_eq!(reclaimed.status, JobStatus::Running);
    assert_eq!(reclaimed.aggregator_id, Some(w2));
    assert!(reclaimed.job_queue_batch_files.is_empty());

    let err = queue.complete_partial_batch(&mut batch, w1).await.unwrap_err();
    assert!(matches!(err, JobQueueError::LeaseLost { .. }));

    let mut reclaimed = reclaimed;
    queue.fail_batch(&mut reclaimed, w2).await.unwrap();
}

async fn concurrent_claims_have_one_winner(queue: &DistributedBatchQueue) {
    queue
        .create_job(request(Uuid::new_v4(), &["1", "2"], &[ResourceType::Patient]))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        queue.claim_batch(Uuid::new_v4()),
        queue.claim_batch(Uuid::new_v4())
    );
    let winners = [a.unwrap(), b.unwrap()]
        .into_iter()
        .filter(Option::is_some)
        .count();
    assert_eq!(winners, 1);
    assert_eq!(queue.queue_size().await.unwrap(), 0);
}

async fn completed_batches_publish_results(queue: &DistributedBatchQueue) {
    let org_id = Uuid::new_v4();
    let job_id = queue
        .create_job(request(org_id, &["1"], &[ResourceType::Coverage]))
        .await
        .unwrap();

    let aggregator = Uuid::new_v4();
    let mut batch = queue.claim_batch(aggregator).await.unwrap().unwrap();
    batch.fetch_next_patient(aggregator).unwrap();
    let file_name = batch
        .add_job_queue_file(ResourceType::Coverage, 0, 3)
        .file_name
        .clone();
    queue.complete_batch(&mut batch, aggregator).await.unwrap();

    let results = queue.get_job_results(job_id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].count, 3);

    let file = queue.get_job_batch_file(org_id, &file_name).await.unwrap();
    assert_eq!(file.map(|f| f.count), Some(3));
    assert!(queue
        .get_job_batch_file(Uuid::new_v4(), &file_name)
        .await
        .unwrap()
        .is_none());
}

async fn health_probe_passes(queue: &DistributedBatchQueue) {
    let cluster = PgLockCluster::new(vec![queue.pool().clone()]);
    QueueHealth::new(Arc::new(cluster), queue.pool().clone())
        .is_healthy()
        .await
        .unwrap();
}

async fn tokens_survive_a_round_trip(queue: &DistributedBatchQueue) {
    let store = Arc::new(PgRootKeyStore::new(queue.pool().clone()));
    let bakery = MacaroonBakery::builder("http://localhost:3002/v1", store)
        .add_default_verifier(VersionCaveatVerifier::new(tokens::CURRENT_TOKEN_VERSION))
        .add_default_verifier(ExpirationCaveatVerifier)
        .build();

    let org_id = Uuid::new_v4();
    let caveats = tokens::generate_caveats_for_token(
        tokens::CURRENT_TOKEN_VERSION,
        org_id,
        chrono::Duration::hours(1),
    )
    .unwrap();
    let macaroon = bakery.create_macaroon(&caveats).await.unwrap();

    let serialized = String::from_utf8(bakery.serialize_macaroon(&macaroon, true)).unwrap();
    let restored = MacaroonBakery::deserialize_macaroon(&serialized).unwrap();
    let expected = tokens::organization_caveat(org_id).to_string();
    bakery
        .verify_macaroon_exact(&restored, &[expected.as_str()])
        .await
        .unwrap();
    assert_eq!(tokens::extract_org_id(&restored).unwrap(), org_id);
}
