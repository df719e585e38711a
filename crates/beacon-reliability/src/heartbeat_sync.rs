//! Forced location sync driven by the OS periodic background task.
//!
//! The native agent only uploads when the device moves. A stationary phone can
//! therefore go silent for days; this scheduler bounds that staleness by forcing
//! a sync once `force_sync_interval` has elapsed since the last success.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::agent::{AgentError, LocationAgent};
use crate::clock::Clock;
use crate::config::{Platform, SchedulerConfig};
use crate::storage::{PersistedState, StorageError};
use crate::stores::IdentityStore;
use crate::sync_client::{HeartbeatRequest, HeartbeatSyncClient, SyncClientError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Client(#[from] SyncClientError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The native agent flushed its queue.
    Flushed { records: usize },
    /// A heartbeat was posted directly.
    HeartbeatSent,
    /// Nothing could be sent; not a failure.
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoStoredLocation,
    StoredLocationTooOld,
    NoBearerToken,
}

impl SkipReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoStoredLocation => "no_stored_location",
            Self::StoredLocationTooOld => "stored_location_too_old",
            Self::NoBearerToken => "no_bearer_token",
        }
    }
}

/// One way of getting the device position to the server.
#[async_trait]
pub trait SyncStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn sync(&self) -> Result<SyncOutcome, SyncError>;
}

/// For agents that keep their own upload queue: wake the agent and flush it.
pub struct NativeQueueFlushStrategy {
    agent: Arc<dyn LocationAgent>,
}

impl NativeQueueFlushStrategy {
    #[must_use]
    pub fn new(agent: Arc<dyn LocationAgent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl SyncStrategy for NativeQueueFlushStrategy {
    fn name(&self) -> &'static str {
        "native_queue_flush"
    }

    async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        self.agent.change_pace(true).await?;
        let records = self.agent.sync().await?;
        Ok(SyncOutcome::Flushed { records })
    }
}

/// For agents without an independent upload queue: post the last stored
/// location as a heartbeat with the current bearer token.
pub struct DirectHeartbeatStrategy {
    persisted: PersistedState,
    identity: Arc<IdentityStore>,
    client: HeartbeatSyncClient,
    clock: Arc<dyn Clock>,
    location_max_age: Duration,
}

impl DirectHeartbeatStrategy {
    #[must_use]
    pub fn new(
        persisted: PersistedState,
        identity: Arc<IdentityStore>,
        client: HeartbeatSyncClient,
        clock: Arc<dyn Clock>,
        location_max_age: Duration,
    ) -> Self {
        Self {
            persisted,
            identity,
            client,
            clock,
            location_max_age,
        }
    }
}

#[async_trait]
impl SyncStrategy for DirectHeartbeatStrategy {
    fn name(&self) -> &'static str {
        "direct_heartbeat"
    }

    async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        let Some(location) = self.persisted.last_location().await? else {
            return Ok(SyncOutcome::Skipped(SkipReason::NoStoredLocation));
        };
        let max_age_ms = u64::try_from(self.location_max_age.as_millis()).unwrap_or(u64::MAX);
        if location.age_ms(self.clock.now_ms()) > max_age_ms {
            return Ok(SyncOutcome::Skipped(SkipReason::StoredLocationTooOld));
        }
        let Some(token) = self.identity.user_token() else {
            return Ok(SyncOutcome::Skipped(SkipReason::NoBearerToken));
        };

        self.client
            .send_heartbeat(&token, &HeartbeatRequest::from_coords(&location.coords))
            .await?;
        Ok(SyncOutcome::HeartbeatSent)
    }
}

/// Picks the strategy for the platform once, at startup.
#[must_use]
pub fn select_strategy(
    platform: Platform,
    emulator_mode: bool,
    agent: Arc<dyn LocationAgent>,
    direct: impl FnOnce() -> DirectHeartbeatStrategy,
) -> Arc<dyn SyncStrategy> {
    match (platform, emulator_mode) {
        (Platform::Android, false) => Arc::new(NativeQueueFlushStrategy::new(agent)),
        _ => Arc::new(direct()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatSyncResult {
    pub sync_performed: bool,
    pub sync_successful: bool,
    pub error: Option<String>,
}

impl HeartbeatSyncResult {
    fn not_due() -> Self {
        Self {
            sync_performed: false,
            sync_successful: true,
            error: None,
        }
    }

    fn succeeded() -> Self {
        Self {
            sync_performed: true,
            sync_successful: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            sync_performed: true,
            sync_successful: false,
            error: Some(error),
        }
    }
}

pub struct HeartbeatSyncScheduler {
    persisted: PersistedState,
    strategy: Arc<dyn SyncStrategy>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl HeartbeatSyncScheduler {
    #[must_use]
    pub fn new(
        persisted: PersistedState,
        strategy: Arc<dyn SyncStrategy>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            persisted,
            strategy,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub async fn execute_heartbeat_sync(&self) -> HeartbeatSyncResult {
        self.execute_heartbeat_sync_at(self.clock.now_ms()).await
    }

    /// Never fails outward: every error becomes part of the result.
    pub async fn execute_heartbeat_sync_at(&self, now_ms: u64) -> HeartbeatSyncResult {
        let last_sync = match self.persisted.last_sync_time().await {
            Ok(last_sync) => last_sync,
            Err(error) => {
                tracing::warn!(error = %error, "Could not read last sync time; forcing sync");
                None
            }
        };
        let interval_ms =
            u64::try_from(self.config.force_sync_interval.as_millis()).unwrap_or(u64::MAX);
        if let Some(last_sync) = last_sync {
            let elapsed = now_ms.saturating_sub(last_sync);
            if elapsed < interval_ms {
                tracing::debug!(elapsed_ms = elapsed, interval_ms, "Forced sync not due");
                return HeartbeatSyncResult::not_due();
            }
        }

        let strategy = self.strategy.name();
        tracing::info!(strategy, last_sync_ms = ?last_sync, "Forced location sync due");
        let outcome = match tokio::time::timeout(self.config.sync_timeout, self.strategy.sync()).await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.config.sync_timeout)),
        };

        match outcome {
            Ok(outcome) => {
                if let SyncOutcome::Skipped(reason) = outcome {
                    tracing::info!(strategy, reason = reason.as_str(), "Forced sync had nothing to send");
                }
                if let Err(error) = self.persisted.set_last_sync_time(now_ms).await {
                    tracing::error!(error = %error, "Failed to persist last sync time");
                    return HeartbeatSyncResult::failed(error.to_string());
                }
                tracing::info!(strategy, ?outcome, "Forced location sync completed");
                HeartbeatSyncResult::succeeded()
            }
            Err(error) => {
                tracing::error!(strategy, error = %error, "Forced location sync failed");
                HeartbeatSyncResult::failed(error.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentCall, MemoryLocationAgent};
    use crate::clock::ManualClock;
    use crate::storage::{self, Coords, StoredLocation};
    use crate::sync_client::tests::{StubMode, spawn_sync_stub};
    use serde_json::json;

    const HOUR_MS: u64 = 60 * 60 * 1_000;
    const NOW_MS: u64 = 1_760_000_000_000;

    struct FailingStrategy;

    #[async_trait]
    impl SyncStrategy for FailingStrategy {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn sync(&self) -> Result<SyncOutcome, SyncError> {
            Err(SyncError::Agent(AgentError::Sync("queue locked".to_string())))
        }
    }

    fn scheduler(
        persisted: &PersistedState,
        strategy: Arc<dyn SyncStrategy>,
    ) -> HeartbeatSyncScheduler {
        HeartbeatSyncScheduler::new(
            persisted.clone(),
            strategy,
            Arc::new(ManualClock::new(NOW_MS)),
            SchedulerConfig::default(),
        )
    }

    fn native(agent: &MemoryLocationAgent) -> Arc<dyn SyncStrategy> {
        Arc::new(NativeQueueFlushStrategy::new(Arc::new(agent.clone())))
    }

    #[tokio::test]
    async fn recent_sync_is_not_repeated() {
        let persisted = PersistedState::new(storage::memory());
        persisted.set_last_sync_time(NOW_MS - HOUR_MS).await.expect("seed");
        let agent = MemoryLocationAgent::new();

        let result = scheduler(&persisted, native(&agent)).execute_heartbeat_sync().await;
        assert_eq!(
            result,
            HeartbeatSyncResult {
                sync_performed: false,
                sync_successful: true,
                error: None
            }
        );
        assert_eq!(
            persisted.last_sync_time().await.expect("read"),
            Some(NOW_MS - HOUR_MS)
        );
        assert!(agent.calls().is_empty());
    }

    #[tokio::test]
    async fn overdue_sync_flushes_and_records_time() {
        let persisted = PersistedState::new(storage::memory());
        persisted
            .set_last_sync_time(NOW_MS - 13 * HOUR_MS)
            .await
            .expect("seed");
        let agent = MemoryLocationAgent::new();
        agent.queue_records(2);

        let result = scheduler(&persisted, native(&agent)).execute_heartbeat_sync().await;
        assert!(result.sync_performed);
        assert!(result.sync_successful);
        assert_eq!(persisted.last_sync_time().await.expect("read"), Some(NOW_MS));
        assert_eq!(
            agent.calls(),
            vec![AgentCall::ChangePace(true), AgentCall::Sync]
        );
    }

    #[tokio::test]
    async fn missing_record_counts_as_due() {
        let persisted = PersistedState::new(storage::memory());
        let agent = MemoryLocationAgent::new();
        let result = scheduler(&persisted, native(&agent)).execute_heartbeat_sync().await;
        assert!(result.sync_performed);
        assert_eq!(persisted.last_sync_time().await.expect("read"), Some(NOW_MS));
    }

    #[tokio::test]
    async fn strategy_error_leaves_record_untouched() {
        let persisted = PersistedState::new(storage::memory());
        let last = NOW_MS - 13 * HOUR_MS;
        persisted.set_last_sync_time(last).await.expect("seed");

        let result = scheduler(&persisted, Arc::new(FailingStrategy))
            .execute_heartbeat_sync()
            .await;
        assert_eq!(
            result,
            HeartbeatSyncResult {
                sync_performed: true,
                sync_successful: false,
                error: Some("agent sync failed: queue locked".to_string()),
            }
        );
        assert_eq!(persisted.last_sync_time().await.expect("read"), Some(last));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_strategy_times_out_without_recording() {
        let persisted = PersistedState::new(storage::memory());
        let agent = MemoryLocationAgent::new();
        agent.set_sync_delay(Some(Duration::from_secs(60)));

        let result = scheduler(&persisted, native(&agent)).execute_heartbeat_sync().await;
        assert!(result.sync_performed);
        assert!(!result.sync_successful);
        assert_eq!(result.error.as_deref(), Some("sync timed out after 20s"));
        assert_eq!(persisted.last_sync_time().await.expect("read"), None);
    }

    fn direct(
        persisted: &PersistedState,
        identity: Arc<IdentityStore>,
    ) -> Arc<dyn SyncStrategy> {
        Arc::new(DirectHeartbeatStrategy::new(
            persisted.clone(),
            identity,
            HeartbeatSyncClient::new("http://127.0.0.1:9/api/v1/geoloc/sync").expect("client"),
            Arc::new(ManualClock::new(NOW_MS)),
            Duration::from_millis(14 * 24 * HOUR_MS),
        ))
    }

    fn stored(timestamp: u64) -> StoredLocation {
        StoredLocation {
            coords: Coords {
                latitude: 43.6,
                longitude: 1.44,
                accuracy: None,
            },
            timestamp,
        }
    }

    #[tokio::test]
    async fn direct_strategy_skips_without_location() {
        let persisted = PersistedState::new(storage::memory());
        let strategy = direct(&persisted, Arc::new(IdentityStore::new()));
        assert_eq!(
            strategy.sync().await.expect("skip"),
            SyncOutcome::Skipped(SkipReason::NoStoredLocation)
        );
    }

    #[tokio::test]
    async fn direct_strategy_skips_stale_location() {
        let persisted = PersistedState::new(storage::memory());
        persisted
            .store_location(&stored(NOW_MS - 15 * 24 * HOUR_MS))
            .await
            .expect("seed");
        let identity = Arc::new(IdentityStore::new());
        identity.set_user_token(Some("tok".to_string()));
        let strategy = direct(&persisted, identity);
        assert_eq!(
            strategy.sync().await.expect("skip"),
            SyncOutcome::Skipped(SkipReason::StoredLocationTooOld)
        );
    }

    #[tokio::test]
    async fn direct_strategy_skips_without_token() {
        let persisted = PersistedState::new(storage::memory());
        persisted.store_location(&stored(NOW_MS - HOUR_MS)).await.expect("seed");
        let strategy = direct(&persisted, Arc::new(IdentityStore::new()));
        assert_eq!(
            strategy.sync().await.expect("skip"),
            SyncOutcome::Skipped(SkipReason::NoBearerToken)
        );
    }

    fn direct_scheduler(
        persisted: &PersistedState,
        sync_url: &str,
    ) -> HeartbeatSyncScheduler {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOW_MS));
        let identity = Arc::new(IdentityStore::new());
        identity.set_user_token(Some("T1".to_string()));
        let strategy = DirectHeartbeatStrategy::new(
            persisted.clone(),
            identity,
            HeartbeatSyncClient::new(sync_url).expect("client"),
            clock.clone(),
            Duration::from_millis(14 * 24 * HOUR_MS),
        );
        HeartbeatSyncScheduler::new(
            persisted.clone(),
            Arc::new(strategy),
            clock,
            SchedulerConfig::default(),
        )
    }

    #[tokio::test]
    async fn direct_strategy_posts_stored_location_and_records_time() {
        let stub = spawn_sync_stub(StubMode::Ok).await;
        let persisted = PersistedState::new(storage::memory());
        persisted
            .set_last_sync_time(NOW_MS - 13 * HOUR_MS)
            .await
            .expect("seed sync time");
        persisted.store_location(&stored(NOW_MS - HOUR_MS)).await.expect("seed location");

        let result = direct_scheduler(&persisted, &stub.url)
            .execute_heartbeat_sync()
            .await;
        assert_eq!(
            result,
            HeartbeatSyncResult {
                sync_performed: true,
                sync_successful: true,
                error: None
            }
        );
        assert_eq!(persisted.last_sync_time().await.expect("read"), Some(NOW_MS));

        let seen = stub.seen.lock().await.clone();
        assert_eq!(
            seen,
            vec![(
                Some("Bearer T1".to_string()),
                json!({
                    "location": {
                        "event": "heartbeat",
                        "coords": {"latitude": 43.6, "longitude": 1.44}
                    }
                })
            )]
        );
    }

    #[tokio::test]
    async fn direct_strategy_rejection_keeps_previous_sync_time() {
        let stub = spawn_sync_stub(StubMode::NotOk).await;
        let persisted = PersistedState::new(storage::memory());
        let last = NOW_MS - 13 * HOUR_MS;
        persisted.set_last_sync_time(last).await.expect("seed sync time");
        persisted.store_location(&stored(NOW_MS - HOUR_MS)).await.expect("seed location");

        let result = direct_scheduler(&persisted, &stub.url)
            .execute_heartbeat_sync()
            .await;
        assert!(result.sync_performed);
        assert!(!result.sync_successful);
        assert!(
            result
                .error
                .as_deref()
                .is_some_and(|error| error.starts_with("heartbeat_rejected:"))
        );
        assert_eq!(persisted.last_sync_time().await.expect("read"), Some(last));
        assert_eq!(stub.seen.lock().await.len(), 1);
    }

    #[test]
    fn strategy_selection_follows_platform() {
        let agent: Arc<dyn LocationAgent> = Arc::new(MemoryLocationAgent::new());
        let persisted = PersistedState::new(storage::memory());
        let make_direct = || {
            DirectHeartbeatStrategy::new(
                persisted.clone(),
                Arc::new(IdentityStore::new()),
                HeartbeatSyncClient::new("http://127.0.0.1:9/sync").expect("client"),
                Arc::new(ManualClock::new(0)),
                Duration::from_secs(1),
            )
        };
        assert_eq!(
            select_strategy(Platform::Android, false, agent.clone(), make_direct).name(),
            "native_queue_flush"
        );
        assert_eq!(
            select_strategy(Platform::Ios, false, agent.clone(), make_direct).name(),
            "direct_heartbeat"
        );
        assert_eq!(
            select_strategy(Platform::Android, true, agent, make_direct).name(),
            "direct_heartbeat"
        );
    }
}
