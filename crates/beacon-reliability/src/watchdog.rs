//! Staleness watchdog for the live subscription connection.
//!
//! A socket can stay "connected" while the server has stopped delivering
//! events. The watchdog compares the last heartbeat seen on the connection
//! against a threshold and escalates in two tiers:
//!
//! 1. restart the live connection, then after a grace period
//! 2. request a full client reload if the heartbeat is still stale.
//!
//! At most one tier-1 restart happens per cooldown window.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::Clock;
use crate::config::WatchdogConfig;
use crate::stores::{ConnectivityStore, LiveConnectionHealth};
use crate::transport::LiveTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogDecision {
    Offline,
    Disconnected,
    NoHeartbeat,
    Healthy,
    CoolingDown,
    RestartTriggered,
}

impl WatchdogDecision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Disconnected => "disconnected",
            Self::NoHeartbeat => "no_heartbeat",
            Self::Healthy => "healthy",
            Self::CoolingDown => "cooling_down",
            Self::RestartTriggered => "restart_triggered",
        }
    }
}

#[derive(Default)]
struct WatchdogTasks {
    poll: Option<JoinHandle<()>>,
    follow_up: Option<JoinHandle<()>>,
}

pub struct LiveConnectionWatchdog {
    connectivity: Arc<ConnectivityStore>,
    transport: Arc<dyn LiveTransport>,
    clock: Arc<dyn Clock>,
    config: WatchdogConfig,
    last_recovery_ms: Mutex<Option<u64>>,
    tasks: Mutex<WatchdogTasks>,
}

impl LiveConnectionWatchdog {
    #[must_use]
    pub fn new(
        connectivity: Arc<ConnectivityStore>,
        transport: Arc<dyn LiveTransport>,
        clock: Arc<dyn Clock>,
        config: WatchdogConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            connectivity,
            transport,
            clock,
            config,
            last_recovery_ms: Mutex::new(None),
            tasks: Mutex::new(WatchdogTasks::default()),
        })
    }

    /// Starts the polling loop. Calling it again while running is a no-op.
    pub fn enable(self: &Arc<Self>) {
        let mut tasks = self.lock_tasks();
        if tasks.poll.as_ref().is_some_and(|poll| !poll.is_finished()) {
            return;
        }
        let watchdog = Arc::downgrade(self);
        let period = self.config.check_interval;
        tasks.poll = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(watchdog) = watchdog.upgrade() else {
                    break;
                };
                watchdog.check().await;
            }
        }));
        tracing::info!(interval_ms = period.as_millis() as u64, "Live connection watchdog enabled");
    }

    /// Stops polling and cancels any pending reload follow-up.
    pub fn disable(&self) {
        let mut tasks = self.lock_tasks();
        let had_poll = tasks.poll.is_some();
        if let Some(poll) = tasks.poll.take() {
            poll.abort();
        }
        if let Some(follow_up) = tasks.follow_up.take() {
            follow_up.abort();
        }
        if had_poll {
            tracing::info!("Live connection watchdog disabled");
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.lock_tasks()
            .poll
            .as_ref()
            .is_some_and(|poll| !poll.is_finished())
    }

    pub async fn check(self: &Arc<Self>) -> WatchdogDecision {
        let health = self.connectivity.snapshot();
        let now_ms = self.clock.now_ms();
        let decision = self.evaluate(&health, now_ms);
        if decision != WatchdogDecision::RestartTriggered {
            tracing::trace!(decision = decision.as_str(), "Watchdog check");
            return decision;
        }

        tracing::warn!(
            heartbeat_age_ms = heartbeat_age_ms(&health, now_ms),
            "Live connection heartbeat stale; restarting connection"
        );
        if let Err(error) = self.transport.restart_live_connection().await {
            tracing::error!(error = %error, "Live connection restart failed");
        }
        self.schedule_follow_up();
        decision
    }

    /// Classifies the health snapshot and claims the cooldown window when a
    /// restart is due.
    fn evaluate(&self, health: &LiveConnectionHealth, now_ms: u64) -> WatchdogDecision {
        if !health.has_internet_connection {
            return WatchdogDecision::Offline;
        }
        if !health.ws_connected {
            return WatchdogDecision::Disconnected;
        }
        let Some(age_ms) = heartbeat_age_ms(health, now_ms) else {
            return WatchdogDecision::NoHeartbeat;
        };
        if age_ms < duration_ms(self.config.stale_threshold) {
            return WatchdogDecision::Healthy;
        }

        let mut last_recovery = self
            .last_recovery_ms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(last) = *last_recovery {
            if now_ms.saturating_sub(last) < duration_ms(self.config.recovery_cooldown) {
                return WatchdogDecision::CoolingDown;
            }
        }
        *last_recovery = Some(now_ms);
        WatchdogDecision::RestartTriggered
    }

    fn schedule_follow_up(self: &Arc<Self>) {
        let watchdog = Arc::downgrade(self);
        let grace = self.config.reload_grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(watchdog) = watchdog.upgrade() {
                watchdog.follow_up();
            }
        });
        let mut tasks = self.lock_tasks();
        if let Some(previous) = tasks.follow_up.replace(handle) {
            previous.abort();
        }
    }

    fn follow_up(&self) {
        let health = self.connectivity.snapshot();
        let now_ms = self.clock.now_ms();
        let recovered = heartbeat_age_ms(&health, now_ms)
            .is_some_and(|age_ms| age_ms < duration_ms(self.config.stale_threshold));
        if recovered {
            tracing::info!("Live connection recovered after restart");
            return;
        }
        let epoch = self.connectivity.trigger_reload();
        tracing::warn!(reload_epoch = epoch, "Heartbeat still stale after restart; requesting full reload");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, WatchdogTasks> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for LiveConnectionWatchdog {
    fn drop(&mut self) {
        self.disable();
    }
}

fn heartbeat_age_ms(health: &LiveConnectionHealth, now_ms: u64) -> Option<u64> {
    health
        .last_heartbeat_date
        .map(|heartbeat| now_ms.saturating_sub(heartbeat))
}

fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
