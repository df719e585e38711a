//! HTTP client for the location heartbeat endpoint.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::Coords;

pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Error)]
pub enum SyncClientError {
    #[error("heartbeat_sync_url_missing")]
    UrlMissing,
    #[error("heartbeat_request_failed:{message}")]
    Request { message: String },
    #[error("heartbeat_read_failed:{message}")]
    Read { message: String },
    #[error("heartbeat_http_{status}:{body}")]
    Http { status: StatusCode, body: String },
    #[error("heartbeat_json_decode_failed:{message}")]
    Decode { message: String },
    #[error("heartbeat_rejected:{body}")]
    Rejected { body: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatRequest {
    pub location: HeartbeatLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatLocation {
    pub event: &'static str,
    pub coords: HeartbeatCoords,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeartbeatCoords {
    pub latitude: f64,
    pub longitude: f64,
}

impl HeartbeatRequest {
    #[must_use]
    pub fn from_coords(coords: &Coords) -> Self {
        Self {
            location: HeartbeatLocation {
                event: "heartbeat",
                coords: HeartbeatCoords {
                    latitude: coords.latitude,
                    longitude: coords.longitude,
                },
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct HeartbeatResponse {
    #[serde(default)]
    ok: bool,
}

#[derive(Debug, Clone)]
pub struct HeartbeatSyncClient {
    sync_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl HeartbeatSyncClient {
    pub fn new(sync_url: impl Into<String>) -> Result<Self, SyncClientError> {
        let sync_url = sync_url.into().trim().to_string();
        if sync_url.is_empty() {
            return Err(SyncClientError::UrlMissing);
        }
        Ok(Self {
            sync_url,
            timeout: Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS),
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn sync_url(&self) -> &str {
        &self.sync_url
    }

    /// Posts one heartbeat. Succeeds only on a 2xx status with `{"ok": true}`.
    pub async fn send_heartbeat(
        &self,
        token: &str,
        request: &HeartbeatRequest,
    ) -> Result<(), SyncClientError> {
        let response = self
            .http
            .post(self.sync_url.as_str())
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|error| SyncClientError::Request {
                message: error.to_string(),
            })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|error| SyncClientError::Read {
                message: error.to_string(),
            })?;
        if !status.is_success() {
            return Err(format_http_error(status, &bytes));
        }

        let decoded = serde_json::from_slice::<HeartbeatResponse>(&bytes).map_err(|error| {
            SyncClientError::Decode {
                message: error.to_string(),
            }
        })?;
        if !decoded.ok {
            return Err(SyncClientError::Rejected {
                body: body_or_placeholder(&bytes),
            });
        }
        Ok(())
    }
}

pub fn format_http_error(status: StatusCode, body: &[u8]) -> SyncClientError {
    SyncClientError::Http {
        status,
        body: body_or_placeholder(body),
    }
}

fn body_or_placeholder(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        "<empty>".to_string()
    } else {
        trimmed.to_string()
    }
}
