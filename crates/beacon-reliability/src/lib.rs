//! Reliability layer for the Beacon alert client.
//!
//! Keeps two data streams alive across flaky networks, backgrounding and
//! identity changes:
//! - background location telemetry, via the auth-gated tracking controller and
//!   the forced heartbeat sync
//! - the live alert stream, via the staleness watchdog and the retry/dedup
//!   policies in the operation pipeline
//!
//! [`ReliabilityService`] wires everything for one foreground session.

pub mod agent;
pub mod background_task;
pub mod cli;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod heartbeat_sync;
pub mod payload;
pub mod pipeline;
pub mod retry_policy;
pub mod service;
pub mod storage;
pub mod stores;
pub mod sync_client;
pub mod tracking;
pub mod transport;
pub mod watchdog;

pub use agent::{AgentConfig, AgentError, AgentState, LocationAgent, MemoryLocationAgent};
pub use background_task::{
    AckError, BackgroundFetchResult, BackgroundTaskAcknowledger, BackgroundTaskCoordinator,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, Platform, ReliabilityConfig};
pub use dedup::{DedupError, RequestDeduplicationLink};
pub use heartbeat_sync::{HeartbeatSyncResult, HeartbeatSyncScheduler, SyncStrategy};
pub use payload::ConfigPayloadBuilder;
pub use pipeline::{OperationPipeline, PipelineError};
pub use retry_policy::{MaxAttempts, OperationRetryPolicy};
pub use service::{Collaborators, ReliabilityService, ServiceError};
pub use storage::{KeyValueStore, PersistedState, StoredLocation};
pub use stores::{ConnectivityStore, IdentityStore, LiveConnectionHealth};
pub use tracking::{ApplyOutcome, AuthGatedTrackingController, TrackingState};
pub use transport::{LiveTransport, Operation, OperationTransport, TransportError};
pub use watchdog::{LiveConnectionWatchdog, WatchdogDecision};
