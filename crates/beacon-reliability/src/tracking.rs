//! Auth-gated lifecycle of the native location agent.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;

use crate::agent::{AgentConfig, AgentError, AgentState, LocationAgent};
use crate::payload::{
    ConfigPayloadBuilder, PERSISTENCE_EXTRAS, SECTION_PERSISTENCE, bearer_header, extras_patch,
    headers_patch,
};
use crate::storage::{PersistedState, StorageError, StoredLocation};
use crate::stores::IdentityStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    NoSession,
    Authenticating,
    Tracking,
}

impl TrackingState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoSession => "no_session",
            Self::Authenticating => "authenticating",
            Self::Tracking => "tracking",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// A newer call on the same channel was issued before this one reached the agent.
    Superseded,
    /// The agent rejected the call; the previous configuration is still in force.
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Token,
    UserId,
}

impl Channel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Token => "user_token",
            Self::UserId => "user_id",
        }
    }
}

pub struct AuthGatedTrackingController {
    agent: Arc<dyn LocationAgent>,
    builder: ConfigPayloadBuilder,
    persisted: PersistedState,
    state: std::sync::Mutex<TrackingState>,
    /// Single writer for every agent mutation.
    writer: Mutex<()>,
    token_generation: AtomicU64,
    user_id_generation: AtomicU64,
    ready: OnceCell<()>,
}

impl AuthGatedTrackingController {
    #[must_use]
    pub fn new(
        agent: Arc<dyn LocationAgent>,
        builder: ConfigPayloadBuilder,
        persisted: PersistedState,
    ) -> Self {
        Self {
            agent,
            builder,
            persisted,
            state: std::sync::Mutex::new(TrackingState::NoSession),
            writer: Mutex::new(()),
            token_generation: AtomicU64::new(0),
            user_id_generation: AtomicU64::new(0),
            ready: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> TrackingState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: TrackingState) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state != next {
            tracing::debug!(from = state.as_str(), to = next.as_str(), "Tracking state changed");
            *state = next;
        }
    }

    /// Applies the full template and makes sure the agent is stopped.
    ///
    /// Repeated calls after a success are no-ops; a failed attempt is retried by
    /// the next call.
    pub async fn init(&self) -> Result<(), AgentError> {
        self.ready
            .get_or_try_init(|| async {
                let _writer = self.writer.lock().await;
                let patch = self.builder.full_template_patch();
                let payload = self
                    .builder
                    .build_from_agent(self.agent.as_ref(), &patch)
                    .await?;
                let state = self.agent.set_config(payload).await?;
                if state.enabled {
                    self.agent.stop().await?;
                }
                tracing::info!("Location agent configured and stopped");
                Ok::<(), AgentError>(())
            })
            .await
            .map(|_| ())
    }

    pub async fn handle_auth_token(&self, token: Option<String>) -> ApplyOutcome {
        let token = token
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let generation = self.token_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _writer = self.writer.lock().await;
        if self.is_superseded(Channel::Token, generation) {
            return ApplyOutcome::Superseded;
        }

        let result = match token {
            None => self.apply_signed_out().await,
            Some(token) => self.apply_signed_in(&token).await,
        };
        match result {
            Ok(()) => ApplyOutcome::Applied,
            Err(error) => {
                tracing::error!(
                    error = %error,
                    channel = Channel::Token.as_str(),
                    generation,
                    "Failed to apply auth token to location agent"
                );
                ApplyOutcome::Failed(error.to_string())
            }
        }
    }

    pub async fn handle_user_id(&self, user_id: Option<String>) -> ApplyOutcome {
        let user_id = user_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let generation = self.user_id_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _writer = self.writer.lock().await;
        if self.is_superseded(Channel::UserId, generation) {
            return ApplyOutcome::Superseded;
        }

        match self.apply_user_id(user_id).await {
            Ok(()) => ApplyOutcome::Applied,
            Err(error) => {
                tracing::error!(
                    error = %error,
                    channel = Channel::UserId.as_str(),
                    generation,
                    "Failed to apply user id to location agent"
                );
                ApplyOutcome::Failed(error.to_string())
            }
        }
    }

    /// Persists a location reported by the agent for the forced-sync fallback.
    pub async fn record_location(&self, location: StoredLocation) -> Result<(), StorageError> {
        self.persisted.store_location(&location).await
    }

    /// Forwards identity store changes to the handlers until the store is dropped.
    pub fn spawn_identity_listener(
        self: &Arc<Self>,
        identity: &IdentityStore,
    ) -> Vec<JoinHandle<()>> {
        let mut token_rx = identity.subscribe_user_token();
        let mut user_id_rx = identity.subscribe_user_id();
        let token_controller = Arc::clone(self);
        let user_id_controller = Arc::clone(self);

        let token_task = tokio::spawn(async move {
            loop {
                let token = token_rx.borrow_and_update().clone();
                let _ = token_controller.handle_auth_token(token).await;
                if token_rx.changed().await.is_err() {
                    break;
                }
            }
        });
        let user_id_task = tokio::spawn(async move {
            loop {
                let user_id = user_id_rx.borrow_and_update().clone();
                if user_id.is_some() || user_id_controller.has_applied_user_id() {
                    let _ = user_id_controller.handle_user_id(user_id).await;
                }
                if user_id_rx.changed().await.is_err() {
                    break;
                }
            }
        });
        vec![token_task, user_id_task]
    }

    fn is_superseded(&self, channel: Channel, generation: u64) -> bool {
        let latest = match channel {
            Channel::Token => self.token_generation.load(Ordering::SeqCst),
            Channel::UserId => self.user_id_generation.load(Ordering::SeqCst),
        };
        if latest != generation {
            tracing::debug!(
                channel = channel.as_str(),
                generation,
                latest,
                "Dropping superseded identity apply"
            );
            return true;
        }
        false
    }

    fn has_applied_user_id(&self) -> bool {
        self.user_id_generation.load(Ordering::SeqCst) > 0
    }

    async fn apply_signed_out(&self) -> Result<(), AgentError> {
        self.apply(&headers_patch(Map::new())).await?;
        let state = self.agent.get_state().await?;
        if state.enabled {
            self.agent.stop().await?;
        }
        self.set_state(TrackingState::NoSession);
        tracing::info!("Auth token cleared; location tracking stopped");
        Ok(())
    }

    async fn apply_signed_in(&self, token: &str) -> Result<(), AgentError> {
        let previous = self.state();
        self.set_state(TrackingState::Authenticating);
        let state = match self.apply(&headers_patch(bearer_header(token))).await {
            Ok(state) => state,
            Err(error) => {
                self.set_state(previous);
                return Err(error);
            }
        };
        if state.enabled {
            tracing::debug!("Location agent already running; headers refreshed in place");
        } else if let Err(error) = self.agent.start().await {
            self.set_state(previous);
            return Err(error);
        } else {
            tracing::info!("Location tracking started");
        }
        self.set_state(TrackingState::Tracking);
        Ok(())
    }

    async fn apply_user_id(&self, user_id: Option<String>) -> Result<(), AgentError> {
        let patch = match user_id {
            Some(user_id) => {
                let mut extras = Map::new();
                extras.insert("userId".to_string(), Value::String(user_id));
                extras_patch(extras)
            }
            None => {
                let snapshot = self.agent.get_state().await?;
                let mut remaining = snapshot.nested_map(SECTION_PERSISTENCE, PERSISTENCE_EXTRAS);
                remaining.remove("userId");
                // Clear first, then reinsert what is left: a non-empty patch would merge.
                let mut payload = self.builder.build(&extras_patch(Map::new()), &snapshot);
                if let Some(section) = payload
                    .get_mut(SECTION_PERSISTENCE)
                    .and_then(Value::as_object_mut)
                {
                    section.insert(PERSISTENCE_EXTRAS.to_string(), Value::Object(remaining));
                }
                self.agent.set_config(payload).await?;
                return Ok(());
            }
        };
        self.apply(&patch).await?;
        Ok(())
    }

    async fn apply(&self, patch: &AgentConfig) -> Result<AgentState, AgentError> {
        let payload = self
            .builder
            .build_from_agent(self.agent.as_ref(), patch)
            .await?;
        self.agent.set_config(payload).await
    }
}
