//! Observable app stores this layer reacts to.
//!
//! Both stores sit on `tokio::sync::watch`: a subscriber always sees the value
//! produced by the latest mutation, and intermediate values may be coalesced.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug)]
pub struct IdentityStore {
    user_token: watch::Sender<Option<String>>,
    user_id: watch::Sender<Option<String>>,
}

impl Default for IdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityStore {
    #[must_use]
    pub fn new() -> Self {
        let (user_token, _) = watch::channel(None);
        let (user_id, _) = watch::channel(None);
        Self {
            user_token,
            user_id,
        }
    }

    /// Sets the bearer token; blank strings count as signed out.
    pub fn set_user_token(&self, token: Option<String>) {
        let token = normalize(token);
        self.user_token.send_if_modified(|current| {
            if *current == token {
                return false;
            }
            *current = token;
            true
        });
    }

    pub fn set_user_id(&self, user_id: Option<String>) {
        let user_id = normalize(user_id);
        self.user_id.send_if_modified(|current| {
            if *current == user_id {
                return false;
            }
            *current = user_id;
            true
        });
    }

    #[must_use]
    pub fn user_token(&self) -> Option<String> {
        self.user_token.borrow().clone()
    }

    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        self.user_id.borrow().clone()
    }

    #[must_use]
    pub fn subscribe_user_token(&self) -> watch::Receiver<Option<String>> {
        self.user_token.subscribe()
    }

    #[must_use]
    pub fn subscribe_user_id(&self) -> watch::Receiver<Option<String>> {
        self.user_id.subscribe()
    }
}

fn normalize(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveConnectionHealth {
    pub ws_connected: bool,
    /// Epoch milliseconds of the last heartbeat seen on the live connection.
    pub last_heartbeat_date: Option<u64>,
    pub has_internet_connection: bool,
    /// Bumped each time a full client reload is requested.
    pub reload_epoch: u64,
}

#[derive(Debug)]
pub struct ConnectivityStore {
    health: watch::Sender<LiveConnectionHealth>,
}

impl Default for ConnectivityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityStore {
    #[must_use]
    pub fn new() -> Self {
        let (health, _) = watch::channel(LiveConnectionHealth::default());
        Self { health }
    }

    #[must_use]
    pub fn snapshot(&self) -> LiveConnectionHealth {
        self.health.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LiveConnectionHealth> {
        self.health.subscribe()
    }

    pub fn set_ws_connected(&self, connected: bool) {
        self.health.send_if_modified(|health| {
            let changed = health.ws_connected != connected;
            health.ws_connected = connected;
            changed
        });
    }

    pub fn set_internet_connection(&self, online: bool) {
        self.health.send_if_modified(|health| {
            let changed = health.has_internet_connection != online;
            health.has_internet_connection = online;
            changed
        });
    }

    pub fn record_heartbeat(&self, at_ms: u64) {
        self.health.send_modify(|health| {
            health.last_heartbeat_date = Some(at_ms);
        });
    }

    /// Requests a full client reload; returns the new epoch.
    pub fn trigger_reload(&self) -> u64 {
        let mut epoch = 0;
        self.health.send_modify(|health| {
            health.reload_epoch = health.reload_epoch.saturating_add(1);
            epoch = health.reload_epoch;
        });
        epoch
    }
}
