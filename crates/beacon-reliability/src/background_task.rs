//! Bridges the OS periodic background-task callbacks to the heartbeat scheduler.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::heartbeat_sync::{HeartbeatSyncResult, HeartbeatSyncScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackgroundFetchResult {
    NewData,
    NoData,
    Failed,
}

impl BackgroundFetchResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewData => "NEW_DATA",
            Self::NoData => "NO_DATA",
            Self::Failed => "FAILED",
        }
    }
}

impl From<&HeartbeatSyncResult> for BackgroundFetchResult {
    fn from(result: &HeartbeatSyncResult) -> Self {
        match (result.sync_performed, result.sync_successful) {
            (false, _) => Self::NoData,
            (true, true) => Self::NewData,
            (true, false) => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("background task acknowledgement failed: {0}")]
pub struct AckError(pub String);

/// OS hook that ends a background task.
#[async_trait]
pub trait BackgroundTaskAcknowledger: Send + Sync {
    async fn finish(&self, task_id: &str, result: BackgroundFetchResult) -> Result<(), AckError>;
}

/// How many recently acknowledged task ids are remembered. The OS keeps only a
/// handful of background tasks alive at once.
const ACKNOWLEDGED_WINDOW: usize = 32;

#[derive(Default)]
struct AcknowledgedTasks {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl AcknowledgedTasks {
    /// Returns false when the id was already acknowledged.
    fn insert(&mut self, task_id: &str) -> bool {
        if !self.ids.insert(task_id.to_string()) {
            return false;
        }
        self.order.push_back(task_id.to_string());
        while self.order.len() > ACKNOWLEDGED_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

pub struct BackgroundTaskCoordinator {
    scheduler: Arc<HeartbeatSyncScheduler>,
    acknowledger: Arc<dyn BackgroundTaskAcknowledger>,
    acknowledged: Mutex<AcknowledgedTasks>,
}

impl BackgroundTaskCoordinator {
    #[must_use]
    pub fn new(
        scheduler: Arc<HeartbeatSyncScheduler>,
        acknowledger: Arc<dyn BackgroundTaskAcknowledger>,
    ) -> Self {
        Self {
            scheduler,
            acknowledger,
            acknowledged: Mutex::new(AcknowledgedTasks::default()),
        }
    }

    /// Runs one scheduler tick and acknowledges the task with its outcome.
    pub async fn on_fetch(&self, task_id: &str) -> BackgroundFetchResult {
        tracing::debug!(task_id, "Background fetch started");
        let result = self.scheduler.execute_heartbeat_sync().await;
        let fetch_result = BackgroundFetchResult::from(&result);
        self.acknowledge(task_id, fetch_result).await;
        fetch_result
    }

    /// The OS is about to kill the task.
    pub async fn on_timeout(&self, task_id: &str) {
        tracing::warn!(task_id, "Background task timed out");
        self.acknowledge(task_id, BackgroundFetchResult::Failed).await;
    }

    /// Returns whether this call was the one that acknowledged the task.
    async fn acknowledge(&self, task_id: &str, result: BackgroundFetchResult) -> bool {
        let first = self
            .acknowledged
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(task_id);
        if !first {
            tracing::debug!(task_id, result = result.as_str(), "Task already acknowledged");
            return false;
        }
        if let Err(error) = self.acknowledger.finish(task_id, result).await {
            tracing::error!(task_id, error = %error, "Failed to acknowledge background task");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MemoryLocationAgent;
    use crate::clock::ManualClock;
    use crate::config::SchedulerConfig;
    use crate::heartbeat_sync::NativeQueueFlushStrategy;
    use crate::storage::{self, PersistedState};
    use std::time::Duration;

    const NOW_MS: u64 = 1_760_000_000_000;

    #[derive(Default)]
    struct RecordingAcknowledger {
        finished: Mutex<Vec<(String, BackgroundFetchResult)>>,
        fail: bool,
    }

    impl RecordingAcknowledger {
        fn finished(&self) -> Vec<(String, BackgroundFetchResult)> {
            self.finished.lock().expect("acks").clone()
        }
    }

    #[async_trait]
    impl BackgroundTaskAcknowledger for RecordingAcknowledger {
        async fn finish(
            &self,
            task_id: &str,
            result: BackgroundFetchResult,
        ) -> Result<(), AckError> {
            self.finished
                .lock()
                .expect("acks")
                .push((task_id.to_string(), result));
            if self.fail {
                return Err(AckError("bridge gone".to_string()));
            }
            Ok(())
        }
    }

    fn coordinator(
        persisted: &PersistedState,
        agent: &MemoryLocationAgent,
        acknowledger: Arc<RecordingAcknowledger>,
    ) -> BackgroundTaskCoordinator {
        let scheduler = HeartbeatSyncScheduler::new(
            persisted.clone(),
            Arc::new(NativeQueueFlushStrategy::new(Arc::new(agent.clone()))),
            Arc::new(ManualClock::new(NOW_MS)),
            SchedulerConfig::default(),
        );
        BackgroundTaskCoordinator::new(Arc::new(scheduler), acknowledger)
    }

    #[tokio::test]
    async fn fetch_maps_results_to_acknowledgements() {
        let persisted = PersistedState::new(storage::memory());
        let agent = MemoryLocationAgent::new();
        let acks = Arc::new(RecordingAcknowledger::default());
        let coordinator = coordinator(&persisted, &agent, acks.clone());

        assert_eq!(coordinator.on_fetch("t1").await, BackgroundFetchResult::NewData);
        assert_eq!(coordinator.on_fetch("t2").await, BackgroundFetchResult::NoData);
        assert_eq!(
            acks.finished(),
            vec![
                ("t1".to_string(), BackgroundFetchResult::NewData),
                ("t2".to_string(), BackgroundFetchResult::NoData),
            ]
        );
    }

    #[tokio::test]
    async fn failed_sync_acknowledges_failed() {
        let persisted = PersistedState::new(storage::memory());
        let agent = MemoryLocationAgent::new();
        agent.fail_sync(Some("offline"));
        let acks = Arc::new(RecordingAcknowledger::default());
        let coordinator = coordinator(&persisted, &agent, acks.clone());

        assert_eq!(coordinator.on_fetch("t1").await, BackgroundFetchResult::Failed);
        assert_eq!(
            acks.finished(),
            vec![("t1".to_string(), BackgroundFetchResult::Failed)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_then_late_fetch_acknowledges_once() {
        let persisted = PersistedState::new(storage::memory());
        let agent = MemoryLocationAgent::new();
        agent.set_sync_delay(Some(Duration::from_secs(5)));
        let acks = Arc::new(RecordingAcknowledger::default());
        let coordinator = Arc::new(coordinator(&persisted, &agent, acks.clone()));

        let fetching = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.on_fetch("t1").await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        coordinator.on_timeout("t1").await;
        let _ = fetching.await.expect("fetch task");

        assert_eq!(
            acks.finished(),
            vec![("t1".to_string(), BackgroundFetchResult::Failed)]
        );
    }

    #[tokio::test]
    async fn acknowledgement_failure_is_swallowed() {
        let persisted = PersistedState::new(storage::memory());
        let agent = MemoryLocationAgent::new();
        let acks = Arc::new(RecordingAcknowledger {
            fail: true,
            ..RecordingAcknowledger::default()
        });
        let coordinator = coordinator(&persisted, &agent, acks.clone());
        coordinator.on_timeout("t9").await;
        assert_eq!(acks.finished().len(), 1);
    }

    #[tokio::test]
    async fn acknowledged_ids_stay_bounded() {
        let persisted = PersistedState::new(storage::memory());
        let agent = MemoryLocationAgent::new();
        let acks = Arc::new(RecordingAcknowledger::default());
        let coordinator = coordinator(&persisted, &agent, acks.clone());

        for index in 0..ACKNOWLEDGED_WINDOW * 3 {
            coordinator.on_timeout(&format!("task-{index}")).await;
        }
        let last = format!("task-{}", ACKNOWLEDGED_WINDOW * 3 - 1);
        coordinator.on_timeout(&last).await;

        assert_eq!(acks.finished().len(), ACKNOWLEDGED_WINDOW * 3);
        assert_eq!(
            coordinator
                .acknowledged
                .lock()
                .expect("acknowledged")
                .len(),
            ACKNOWLEDGED_WINDOW
        );
    }

    #[test]
    fn result_mapping_covers_every_case() {
        let result = |performed, successful| HeartbeatSyncResult {
            sync_performed: performed,
            sync_successful: successful,
            error: None,
        };
        assert_eq!(BackgroundFetchResult::from(&result(false, true)), BackgroundFetchResult::NoData);
        assert_eq!(BackgroundFetchResult::from(&result(true, true)), BackgroundFetchResult::NewData);
        assert_eq!(BackgroundFetchResult::from(&result(true, false)), BackgroundFetchResult::Failed);
    }
}
