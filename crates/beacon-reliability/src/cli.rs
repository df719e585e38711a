//! `reliability-harness` command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};

use crate::agent::MemoryLocationAgent;
use crate::background_task::{AckError, BackgroundFetchResult, BackgroundTaskAcknowledger};
use crate::clock::{Clock, ManualClock, SystemClock};
use crate::config::{Platform, ReliabilityConfig, normalize_sync_url};
use crate::heartbeat_sync::{DirectHeartbeatStrategy, HeartbeatSyncScheduler, SyncStrategy};
use crate::payload::{HTTP_HEADERS, SECTION_HTTP};
use crate::service::{Collaborators, ReliabilityService};
use crate::storage::{self, Coords, FileKeyValueStore, KeyValueStore, PersistedState, StoredLocation};
use crate::stores::IdentityStore;
use crate::sync_client::HeartbeatSyncClient;
use crate::transport::{MemoryLiveTransport, MemoryOperationTransport, Operation, TransportError};

#[derive(Parser, Debug)]
#[command(name = "reliability-harness")]
#[command(about = "Exercise the Beacon reliability layer outside the app")]
pub struct HarnessCli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a full session against in-memory collaborators
    Scenario(ScenarioArgs),
    /// Run one forced heartbeat sync against the configured endpoint
    SyncOnce(SyncOnceArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum PlatformArg {
    Android,
    Ios,
}

impl From<PlatformArg> for Platform {
    fn from(value: PlatformArg) -> Self {
        match value {
            PlatformArg::Android => Self::Android,
            PlatformArg::Ios => Self::Ios,
        }
    }
}

#[derive(Args, Debug)]
pub struct ScenarioArgs {
    /// Overrides BEACON_PLATFORM.
    #[arg(long, value_enum)]
    pub platform: Option<PlatformArg>,
    /// Write the JSON summary here.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SyncOnceArgs {
    /// Bearer token sent with the heartbeat.
    #[arg(long)]
    pub token: String,
    /// Store this position as the last known location before syncing.
    #[arg(long, requires = "longitude")]
    pub latitude: Option<f64>,
    #[arg(long, requires = "latitude")]
    pub longitude: Option<f64>,
    /// Overrides BEACON_SYNC_URL.
    #[arg(long)]
    pub sync_url: Option<String>,
    /// Overrides BEACON_STORAGE_PATH.
    #[arg(long)]
    pub storage_path: Option<PathBuf>,
    /// Ignore the forced-sync interval.
    #[arg(long)]
    pub force: bool,
    /// Write the JSON summary here.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

pub async fn run(cli: HarnessCli) -> Result<Value> {
    let config = ReliabilityConfig::from_env().context("load BEACON_* configuration")?;
    let (summary, output) = match cli.command {
        Command::Scenario(args) => {
            let mut config = config;
            if let Some(platform) = args.platform {
                config.platform = platform.into();
            }
            (run_scenario(&config).await?, args.output)
        }
        Command::SyncOnce(args) => {
            let output = args.output.clone();
            (run_sync_once(config, args).await?, output)
        }
    };
    tracing::info!(summary = %summary, "Harness run complete");
    if let Some(path) = output {
        write_summary(&path, &summary).await?;
    }
    Ok(summary)
}

struct LoggingAcknowledger;

#[async_trait]
impl BackgroundTaskAcknowledger for LoggingAcknowledger {
    async fn finish(&self, task_id: &str, result: BackgroundFetchResult) -> Result<(), AckError> {
        tracing::info!(task_id, result = result.as_str(), "Background task acknowledged");
        Ok(())
    }
}

async fn run_scenario(config: &ReliabilityConfig) -> Result<Value> {
    let clock = ManualClock::new(crate::clock::current_unix_ms());
    let agent = MemoryLocationAgent::new();
    let live = Arc::new(MemoryLiveTransport::new());
    let operations = MemoryOperationTransport::new();
    let service = ReliabilityService::build(
        config,
        Collaborators {
            agent: Arc::new(agent.clone()),
            live_transport: live.clone(),
            operation_transport: Arc::new(operations.clone()),
            store: storage::memory(),
            acknowledger: Arc::new(LoggingAcknowledger),
            clock: Arc::new(clock.clone()),
        },
    )
    .await?;
    service.init().await?;

    service.identity().set_user_token(Some("harness-token".to_string()));
    service.identity().set_user_id(Some("harness-user".to_string()));
    settle().await;
    let signed_in_state = service.controller().state();
    let signed_in_headers = agent
        .snapshot()
        .nested_map(SECTION_HTTP, HTTP_HEADERS);

    service
        .controller()
        .record_location(StoredLocation {
            coords: Coords {
                latitude: 48.8566,
                longitude: 2.3522,
                accuracy: Some(15.0),
            },
            timestamp: clock.now_ms(),
        })
        .await?;
    agent.queue_records(3);
    let first_fetch = service.coordinator().on_fetch("harness-fetch-1").await;
    clock.advance(Duration::from_secs(60 * 60));
    let second_fetch = service.coordinator().on_fetch("harness-fetch-2").await;

    let connectivity = service.connectivity();
    connectivity.set_internet_connection(true);
    connectivity.set_ws_connected(true);
    connectivity.record_heartbeat(clock.now_ms().saturating_sub(46_000));
    let watchdog_decision = service.watchdog().check().await;

    operations.push_failures(
        "sendAlert",
        [TransportError::Network("connection reset".to_string())],
    );
    let alert = service
        .pipeline()
        .execute(Operation::new("sendAlert", json!({"level": "red"})))
        .await?;

    service.identity().set_user_token(None);
    settle().await;
    let signed_out_state = service.controller().state();
    service.teardown();

    Ok(json!({
        "generatedAt": Utc::now().to_rfc3339(),
        "platform": config.platform.as_str(),
        "strategy": service.scheduler().strategy_name(),
        "signedIn": {
            "trackingState": signed_in_state.as_str(),
            "headers": signed_in_headers,
        },
        "fetches": [first_fetch.as_str(), second_fetch.as_str()],
        "watchdog": {
            "decision": watchdog_decision.as_str(),
            "restarts": live.restarts(),
        },
        "sendAlert": {
            "attempts": operations.executed().len(),
            "result": alert,
        },
        "signedOut": {
            "trackingState": signed_out_state.as_str(),
            "agentEnabled": agent.snapshot().enabled,
        },
    }))
}

async fn run_sync_once(mut config: ReliabilityConfig, args: SyncOnceArgs) -> Result<Value> {
    if let Some(raw) = args.sync_url.as_deref() {
        config.sync_url = normalize_sync_url(raw)?;
    }
    if let Some(path) = args.storage_path {
        config.storage_path = Some(path);
    }
    let store: Arc<dyn KeyValueStore> = match config.storage_path.as_ref() {
        Some(path) => Arc::new(FileKeyValueStore::open(path).await?),
        None => storage::memory(),
    };
    let persisted = PersistedState::new(store);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    if let (Some(latitude), Some(longitude)) = (args.latitude, args.longitude) {
        persisted
            .store_location(&StoredLocation {
                coords: Coords {
                    latitude,
                    longitude,
                    accuracy: None,
                },
                timestamp: clock.now_ms(),
            })
            .await?;
    }

    let identity = Arc::new(IdentityStore::new());
    identity.set_user_token(Some(args.token));
    if identity.user_token().is_none() {
        return Err(anyhow!("--token must not be blank"));
    }

    let client = HeartbeatSyncClient::new(config.sync_url.clone())?
        .with_timeout(config.scheduler.sync_timeout);
    let strategy: Arc<dyn SyncStrategy> = Arc::new(DirectHeartbeatStrategy::new(
        persisted.clone(),
        identity,
        client,
        clock.clone(),
        config.scheduler.location_max_age,
    ));
    let mut scheduler_config = config.scheduler.clone();
    if args.force {
        scheduler_config.force_sync_interval = Duration::ZERO;
    }
    let scheduler = HeartbeatSyncScheduler::new(persisted, strategy, clock, scheduler_config);
    let result = scheduler.execute_heartbeat_sync().await;

    Ok(json!({
        "generatedAt": Utc::now().to_rfc3339(),
        "syncUrl": config.sync_url,
        "syncPerformed": result.sync_performed,
        "syncSuccessful": result.sync_successful,
        "error": result.error,
    }))
}

/// Lets the identity listeners drain their queued store changes.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn write_summary(path: &Path, summary: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }
    }
    let encoded = serde_json::to_vec_pretty(summary)?;
    tokio::fs::write(path, encoded)
        .await
        .with_context(|| format!("write summary {}", path.display()))
}
