//! Seam to the native background location agent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

/// Agent configuration document: `{geolocation, app, http, persistence, ...}`.
pub type AgentConfig = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("agent rejected configuration: {0}")]
    ConfigRejected(String),
    #[error("agent start failed: {0}")]
    Start(String),
    #[error("agent stop failed: {0}")]
    Stop(String),
    #[error("agent sync failed: {0}")]
    Sync(String),
    #[error("agent unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentState {
    pub enabled: bool,
    pub config: AgentConfig,
}

impl AgentState {
    /// Nested map `section.key` of the live config, empty when missing.
    #[must_use]
    pub fn nested_map(&self, section: &str, key: &str) -> Map<String, Value> {
        self.config
            .get(section)
            .and_then(Value::as_object)
            .and_then(|section| section.get(key))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait LocationAgent: Send + Sync {
    async fn get_state(&self) -> Result<AgentState, AgentError>;
    /// Applies the given top-level sections. Each section replaces the live one.
    async fn set_config(&self, config: AgentConfig) -> Result<AgentState, AgentError>;
    async fn start(&self) -> Result<AgentState, AgentError>;
    async fn stop(&self) -> Result<AgentState, AgentError>;
    async fn change_pace(&self, is_moving: bool) -> Result<(), AgentError>;
    /// Flushes the agent's upload queue; returns the number of records sent.
    async fn sync(&self) -> Result<usize, AgentError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentCall {
    GetState,
    SetConfig(AgentConfig),
    Start,
    Stop,
    ChangePace(bool),
    Sync,
}

#[derive(Debug, Default)]
struct MemoryAgentInner {
    state: AgentState,
    calls: Vec<AgentCall>,
    set_config_delays: VecDeque<Duration>,
    sync_delay: Option<Duration>,
    reject_set_config: Option<String>,
    fail_sync: Option<String>,
    queued_records: usize,
}

/// In-process agent used by tests and the harness.
///
/// Sections passed to `set_config` replace the live sections wholesale, which is
/// the only merge behaviour callers are allowed to rely on.
#[derive(Debug, Clone, Default)]
pub struct MemoryLocationAgent {
    inner: Arc<Mutex<MemoryAgentInner>>,
}

impl MemoryLocationAgent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays consumed one per `set_config` call, in call order.
    pub fn push_set_config_delays(&self, delays: impl IntoIterator<Item = Duration>) {
        self.with_inner(|inner| inner.set_config_delays.extend(delays));
    }

    pub fn set_sync_delay(&self, delay: Option<Duration>) {
        self.with_inner(|inner| inner.sync_delay = delay);
    }

    pub fn reject_set_config(&self, reason: Option<&str>) {
        self.with_inner(|inner| inner.reject_set_config = reason.map(str::to_string));
    }

    pub fn fail_sync(&self, reason: Option<&str>) {
        self.with_inner(|inner| inner.fail_sync = reason.map(str::to_string));
    }

    pub fn queue_records(&self, count: usize) {
        self.with_inner(|inner| inner.queued_records += count);
    }

    #[must_use]
    pub fn snapshot(&self) -> AgentState {
        self.with_inner(|inner| inner.state.clone())
    }

    #[must_use]
    pub fn calls(&self) -> Vec<AgentCall> {
        self.with_inner(|inner| inner.calls.clone())
    }

    #[must_use]
    pub fn count_calls(&self, matches: impl Fn(&AgentCall) -> bool) -> usize {
        self.with_inner(|inner| inner.calls.iter().filter(|call| matches(call)).count())
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut MemoryAgentInner) -> T) -> T {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

#[async_trait]
impl LocationAgent for MemoryLocationAgent {
    async fn get_state(&self) -> Result<AgentState, AgentError> {
        Ok(self.with_inner(|inner| {
            inner.calls.push(AgentCall::GetState);
            inner.state.clone()
        }))
    }

    async fn set_config(&self, config: AgentConfig) -> Result<AgentState, AgentError> {
        let delay = self.with_inner(|inner| inner.set_config_delays.pop_front());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with_inner(|inner| {
            inner.calls.push(AgentCall::SetConfig(config.clone()));
            if let Some(reason) = inner.reject_set_config.clone() {
                return Err(AgentError::ConfigRejected(reason));
            }
            for (section, value) in config {
                inner.state.config.insert(section, value);
            }
            Ok(inner.state.clone())
        })
    }

    async fn start(&self) -> Result<AgentState, AgentError> {
        Ok(self.with_inner(|inner| {
            inner.calls.push(AgentCall::Start);
            inner.state.enabled = true;
            inner.state.clone()
        }))
    }

    async fn stop(&self) -> Result<AgentState, AgentError> {
        Ok(self.with_inner(|inner| {
            inner.calls.push(AgentCall::Stop);
            inner.state.enabled = false;
            inner.state.clone()
        }))
    }

    async fn change_pace(&self, is_moving: bool) -> Result<(), AgentError> {
        self.with_inner(|inner| inner.calls.push(AgentCall::ChangePace(is_moving)));
        Ok(())
    }

    async fn sync(&self) -> Result<usize, AgentError> {
        let delay = self.with_inner(|inner| {
            inner.calls.push(AgentCall::Sync);
            inner.sync_delay
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with_inner(|inner| {
            if let Some(reason) = inner.fail_sync.clone() {
                return Err(AgentError::Sync(reason));
            }
            Ok(std::mem::take(&mut inner.queued_records))
        })
    }
}
