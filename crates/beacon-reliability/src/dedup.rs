//! Cancels superseded in-flight requests.
//!
//! Two requests with the same operation name and variables are duplicates;
//! starting the second aborts the first so that only the latest one delivers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::transport::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DedupError {
    #[error("request superseded by a newer identical request")]
    Superseded,
}

struct InFlight {
    id: u64,
    cancel: oneshot::Sender<()>,
}

type Registry = Arc<Mutex<HashMap<String, InFlight>>>;

#[derive(Clone, Default)]
pub struct RequestDeduplicationLink {
    in_flight: Registry,
    next_id: Arc<AtomicU64>,
}

impl RequestDeduplicationLink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `request` as the current holder of the operation's key.
    ///
    /// Dropping the returned future also releases the key.
    pub async fn run<F, T>(&self, operation: &Operation, request: F) -> Result<T, DedupError>
    where
        F: Future<Output = T>,
    {
        let key = operation.dedup_key();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancelled) = oneshot::channel();
        {
            let mut in_flight = lock(&self.in_flight);
            if let Some(previous) = in_flight.insert(key.clone(), InFlight { id, cancel }) {
                tracing::debug!(operation = %operation.name, "Cancelling superseded request");
                let _ = previous.cancel.send(());
            }
        }
        let _registration = Registration {
            registry: self.in_flight.clone(),
            key,
            id,
        };

        // Cancellation wins over a request that finishes in the same poll.
        tokio::select! {
            biased;
            _ = cancelled => Err(DedupError::Superseded),
            output = request => Ok(output),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Cancels every in-flight request.
    pub fn cancel_all(&self) {
        let drained: Vec<InFlight> = lock(&self.in_flight).drain().map(|(_, entry)| entry).collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Cancelling all in-flight requests");
        }
        for entry in drained {
            let _ = entry.cancel.send(());
        }
    }
}

/// Removes the registry entry when the request ends, unless a newer request
/// has already taken the key.
struct Registration {
    registry: Registry,
    key: String,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.registry);
        if in_flight.get(&self.key).is_some_and(|entry| entry.id == self.id) {
            in_flight.remove(&self.key);
        }
    }
}

fn lock(registry: &Registry) -> std::sync::MutexGuard<'_, HashMap<String, InFlight>> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
