//! Seams to the request/response and subscription transport.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("graphql error: {0}")]
    Graph(String),
    #[error("live connection error: {0}")]
    Live(String),
}

impl TransportError {
    /// Only network failures are worth another attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// One request or subscription as the transport sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub name: String,
    pub variables: Value,
}

impl Operation {
    #[must_use]
    pub fn new(name: impl Into<String>, variables: Value) -> Self {
        Self {
            name: name.into(),
            variables,
        }
    }

    /// Identity used to detect duplicate in-flight requests.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        let variables = serde_json::to_string(&self.variables).unwrap_or_default();
        format!("{}{}", self.name, variables)
    }
}

#[async_trait]
pub trait OperationTransport: Send + Sync {
    async fn execute(&self, operation: &Operation) -> Result<Value, TransportError>;
}

#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Drops and reopens the subscription socket.
    async fn restart_live_connection(&self) -> Result<(), TransportError>;
    /// Rebuilds the whole client, caches included.
    async fn full_reload(&self) -> Result<(), TransportError>;
}

#[derive(Debug, Default)]
pub struct MemoryLiveTransport {
    restarts: AtomicUsize,
    reloads: AtomicUsize,
    fail_restart: Mutex<Option<String>>,
}

impl MemoryLiveTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn fail_restart(&self, reason: Option<&str>) {
        *self
            .fail_restart
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = reason.map(str::to_string);
    }
}

#[async_trait]
impl LiveTransport for MemoryLiveTransport {
    async fn restart_live_connection(&self) -> Result<(), TransportError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        let failure = self
            .fail_restart
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match failure {
            Some(reason) => Err(TransportError::Live(reason)),
            None => Ok(()),
        }
    }

    async fn full_reload(&self) -> Result<(), TransportError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryOperationInner {
    failures: HashMap<String, VecDeque<TransportError>>,
    delays: HashMap<String, VecDeque<Duration>>,
    executed: Vec<Operation>,
}

/// Transport double that echoes operations back.
///
/// Scripted failures and delays are consumed one per call, per operation name.
#[derive(Debug, Clone, Default)]
pub struct MemoryOperationTransport {
    inner: Arc<Mutex<MemoryOperationInner>>,
}

impl MemoryOperationTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_failures(
        &self,
        name: &str,
        failures: impl IntoIterator<Item = TransportError>,
    ) {
        self.with_inner(|inner| {
            inner
                .failures
                .entry(name.to_string())
                .or_default()
                .extend(failures);
        });
    }

    pub fn push_delays(&self, name: &str, delays: impl IntoIterator<Item = Duration>) {
        self.with_inner(|inner| {
            inner
                .delays
                .entry(name.to_string())
                .or_default()
                .extend(delays);
        });
    }

    #[must_use]
    pub fn executed(&self) -> Vec<Operation> {
        self.with_inner(|inner| inner.executed.clone())
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut MemoryOperationInner) -> T) -> T {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

#[async_trait]
impl OperationTransport for MemoryOperationTransport {
    async fn execute(&self, operation: &Operation) -> Result<Value, TransportError> {
        let (delay, failure) = self.with_inner(|inner| {
            inner.executed.push(operation.clone());
            let delay = inner
                .delays
                .get_mut(&operation.name)
                .and_then(VecDeque::pop_front);
            let failure = inner
                .failures
                .get_mut(&operation.name)
                .and_then(VecDeque::pop_front);
            (delay, failure)
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(json!({
                "operation": operation.name,
                "variables": operation.variables,
            })),
        }
    }
}
