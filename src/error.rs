use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, JobQueueError>;

#[derive(Error, Debug)]
pub enum JobQueueError {
    /// A state transition was attempted out of order.
    #[error("{0}")]
    Failure(String),

    #[error("Invalid job request: {0}")]
    InvalidRequest(String),

    /// The caller no longer holds the lease on the batch.
    #[error("Cannot process a job owned by another aggregator. (batch: {batch_id}, expected: {expected}, holder: {holder:?})")]
    LeaseLost {
        batch_id: Uuid,
        expected: Uuid,
        holder: Option<Uuid>,
    },

    #[error("Batch not found: {0}")]
    NotFound(Uuid),

    #[error("Queue is unhealthy: {0}")]
    Unhealthy(String),

    #[error("Lock cluster did not answer within {0:?}")]
    PingTimeout(Duration),

    #[error("Lock cluster is not responding: {0}")]
    ClusterNotResponding(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl JobQueueError {
    pub(crate) fn failure(batch_id: Uuid, msg: impl AsRef<str>) -> Self {
        JobQueueError::Failure(format!("{} (batch: {})", msg.as_ref(), batch_id))
    }

    /// Infrastructure failures may clear up on their own; everything else is a coordination bug.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobQueueError::Unhealthy(_)
                | JobQueueError::PingTimeout(_)
                | JobQueueError::ClusterNotResponding(_)
                | JobQueueError::Database(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_infrastructure_errors_are_retryable() {
        assert!(JobQueueError::PingTimeout(Duration::from_secs(1)).is_retryable());
        assert!(JobQueueError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!JobQueueError::failure(Uuid::nil(), "Cannot run job.").is_retryable());
        assert!(!JobQueueError::LeaseLost {
            batch_id: Uuid::nil(),
            expected: Uuid::nil(),
            holder: None,
        }
        .is_retryable());
    }
}
