//! One foreground session's worth of reliability machinery.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::agent::{AgentError, LocationAgent};
use crate::background_task::{BackgroundTaskAcknowledger, BackgroundTaskCoordinator};
use crate::clock::Clock;
use crate::config::ReliabilityConfig;
use crate::heartbeat_sync::{DirectHeartbeatStrategy, HeartbeatSyncScheduler, select_strategy};
use crate::payload::ConfigPayloadBuilder;
use crate::pipeline::OperationPipeline;
use crate::retry_policy::OperationRetryPolicy;
use crate::storage::{KeyValueStore, PersistedState, StorageError};
use crate::stores::{ConnectivityStore, IdentityStore};
use crate::sync_client::{HeartbeatSyncClient, SyncClientError};
use crate::tracking::AuthGatedTrackingController;
use crate::transport::{LiveTransport, OperationTransport};
use crate::watchdog::LiveConnectionWatchdog;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    SyncClient(#[from] SyncClientError),
}

/// Platform pieces the service drives but does not own.
pub struct Collaborators {
    pub agent: Arc<dyn LocationAgent>,
    pub live_transport: Arc<dyn LiveTransport>,
    pub operation_transport: Arc<dyn OperationTransport>,
    pub store: Arc<dyn KeyValueStore>,
    pub acknowledger: Arc<dyn BackgroundTaskAcknowledger>,
    pub clock: Arc<dyn Clock>,
}

pub struct ReliabilityService {
    identity: Arc<IdentityStore>,
    connectivity: Arc<ConnectivityStore>,
    persisted: PersistedState,
    controller: Arc<AuthGatedTrackingController>,
    scheduler: Arc<HeartbeatSyncScheduler>,
    coordinator: Arc<BackgroundTaskCoordinator>,
    watchdog: Arc<LiveConnectionWatchdog>,
    pipeline: OperationPipeline,
    live_transport: Arc<dyn LiveTransport>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl ReliabilityService {
    /// Wires every component. The sync strategy is fixed here from the
    /// platform and the persisted emulator flag.
    pub async fn build(
        config: &ReliabilityConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ServiceError> {
        let Collaborators {
            agent,
            live_transport,
            operation_transport,
            store,
            acknowledger,
            clock,
        } = collaborators;

        let identity = Arc::new(IdentityStore::new());
        let connectivity = Arc::new(ConnectivityStore::new());
        let persisted = PersistedState::new(store);

        let emulator_mode = persisted.emulator_mode().await?;
        let client = HeartbeatSyncClient::new(config.sync_url.clone())?
            .with_timeout(config.scheduler.sync_timeout);
        let strategy = select_strategy(config.platform, emulator_mode, agent.clone(), || {
            DirectHeartbeatStrategy::new(
                persisted.clone(),
                identity.clone(),
                client,
                clock.clone(),
                config.scheduler.location_max_age,
            )
        });
        tracing::info!(
            platform = config.platform.as_str(),
            emulator_mode,
            strategy = strategy.name(),
            "Selected forced sync strategy"
        );

        let controller = Arc::new(AuthGatedTrackingController::new(
            agent,
            ConfigPayloadBuilder::with_sync_url(&config.sync_url),
            persisted.clone(),
        ));
        let scheduler = Arc::new(HeartbeatSyncScheduler::new(
            persisted.clone(),
            strategy,
            clock.clone(),
            config.scheduler.clone(),
        ));
        let coordinator = Arc::new(BackgroundTaskCoordinator::new(
            scheduler.clone(),
            acknowledger,
        ));
        let watchdog = LiveConnectionWatchdog::new(
            connectivity.clone(),
            live_transport.clone(),
            clock,
            config.watchdog.clone(),
        );
        let pipeline = OperationPipeline::new(
            operation_transport,
            OperationRetryPolicy::new(config.retry.clone()),
        );

        Ok(Self {
            identity,
            connectivity,
            persisted,
            controller,
            scheduler,
            coordinator,
            watchdog,
            pipeline,
            live_transport,
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Starts the session: configures the agent, subscribes to the stores and
    /// enables the watchdog.
    ///
    /// Listeners and the watchdog run even when the initial agent configuration
    /// fails; that failure is returned after everything else is up.
    pub async fn init(&self) -> Result<(), ServiceError> {
        let configured = self.controller.init().await;
        if let Err(error) = &configured {
            tracing::error!(error = %error, "Initial agent configuration failed");
        }

        {
            let mut listeners = self.lock_listeners();
            if listeners.is_empty() {
                listeners.extend(self.controller.spawn_identity_listener(&self.identity));
                listeners.push(self.spawn_reload_listener());
            }
        }
        self.watchdog.enable();
        configured.map_err(ServiceError::from)
    }

    /// Stops background work and cancels every in-flight operation.
    pub fn teardown(&self) {
        self.watchdog.disable();
        let listeners: Vec<JoinHandle<()>> = self.lock_listeners().drain(..).collect();
        for listener in listeners {
            listener.abort();
        }
        self.pipeline.dedup().cancel_all();
        tracing::info!("Reliability service torn down");
    }

    fn spawn_reload_listener(&self) -> JoinHandle<()> {
        let mut health = self.connectivity.subscribe();
        // Baseline taken before spawning so a reload triggered before the task
        // first runs is still seen as new.
        let mut seen_epoch = health.borrow_and_update().reload_epoch;
        let transport = self.live_transport.clone();
        tokio::spawn(async move {
            while health.changed().await.is_ok() {
                let epoch = health.borrow_and_update().reload_epoch;
                if epoch <= seen_epoch {
                    continue;
                }
                seen_epoch = epoch;
                tracing::warn!(reload_epoch = epoch, "Performing full client reload");
                if let Err(error) = transport.full_reload().await {
                    tracing::error!(error = %error, "Full client reload failed");
                }
            }
        })
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[must_use]
    pub fn identity(&self) -> &Arc<IdentityStore> {
        &self.identity
    }

    #[must_use]
    pub fn connectivity(&self) -> &Arc<ConnectivityStore> {
        &self.connectivity
    }

    #[must_use]
    pub fn persisted(&self) -> &PersistedState {
        &self.persisted
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<AuthGatedTrackingController> {
        &self.controller
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<HeartbeatSyncScheduler> {
        &self.scheduler
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<BackgroundTaskCoordinator> {
        &self.coordinator
    }

    #[must_use]
    pub fn watchdog(&self) -> &Arc<LiveConnectionWatchdog> {
        &self.watchdog
    }

    #[must_use]
    pub fn pipeline(&self) -> &OperationPipeline {
        &self.pipeline
    }
}

impl Drop for ReliabilityService {
    fn drop(&mut self) {
        for listener in self.lock_listeners().drain(..) {
            listener.abort();
        }
    }
}
