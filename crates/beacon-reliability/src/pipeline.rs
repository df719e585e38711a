//! Outbound operation path: dedup link around a retry loop around the transport.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::dedup::{DedupError, RequestDeduplicationLink};
use crate::retry_policy::OperationRetryPolicy;
use crate::transport::{Operation, OperationTransport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Superseded(#[from] DedupError),
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Transport {
        operation: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
}

#[derive(Clone)]
pub struct OperationPipeline {
    transport: Arc<dyn OperationTransport>,
    policy: OperationRetryPolicy,
    dedup: RequestDeduplicationLink,
}

impl OperationPipeline {
    #[must_use]
    pub fn new(transport: Arc<dyn OperationTransport>, policy: OperationRetryPolicy) -> Self {
        Self {
            transport,
            policy,
            dedup: RequestDeduplicationLink::new(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &OperationRetryPolicy {
        &self.policy
    }

    #[must_use]
    pub fn dedup(&self) -> &RequestDeduplicationLink {
        &self.dedup
    }

    pub async fn execute(&self, operation: Operation) -> Result<Value, PipelineError> {
        self.dedup
            .run(&operation, self.execute_with_retry(&operation))
            .await?
    }

    async fn execute_with_retry(&self, operation: &Operation) -> Result<Value, PipelineError> {
        let mut attempt: u32 = 1;
        loop {
            match self.transport.execute(operation).await {
                Ok(value) => return Ok(value),
                Err(error) if self.policy.should_retry(&operation.name, attempt, &error) => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        operation = %operation.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying operation"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => {
                    tracing::error!(
                        operation = %operation.name,
                        attempt,
                        error = %error,
                        "Operation failed"
                    );
                    return Err(PipelineError::Transport {
                        operation: operation.name.clone(),
                        attempts: attempt,
                        source: error,
                    });
                }
            }
        }
    }
}
