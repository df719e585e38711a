//! Deterministic construction of agent configuration payloads.
//!
//! The agent's own merge of nested maps cannot be trusted, so every section a
//! caller touches is rebuilt here in full: defaults, then the caller's patch,
//! then invariants. `http.headers` and `persistence.extras` are the two nested
//! maps whose previous runtime value matters; they are carried forward, merged
//! or cleared explicitly.

use serde_json::{Map, Value, json};

use crate::agent::{AgentConfig, AgentError, AgentState, LocationAgent};

pub const SECTION_GEOLOCATION: &str = "geolocation";
pub const SECTION_APP: &str = "app";
pub const SECTION_HTTP: &str = "http";
pub const SECTION_PERSISTENCE: &str = "persistence";
pub const HTTP_HEADERS: &str = "headers";
pub const PERSISTENCE_EXTRAS: &str = "extras";

/// `(section, key)` pairs whose value is a map owned by runtime state.
const RUNTIME_MAPS: [(&str, &str); 2] = [
    (SECTION_HTTP, HTTP_HEADERS),
    (SECTION_PERSISTENCE, PERSISTENCE_EXTRAS),
];

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigPayloadBuilder {
    defaults: AgentConfig,
    invariants: AgentConfig,
}

impl ConfigPayloadBuilder {
    #[must_use]
    pub fn new(defaults: AgentConfig, invariants: AgentConfig) -> Self {
        Self {
            defaults,
            invariants,
        }
    }

    /// Builder with the stock tracking template pointed at `sync_url`.
    #[must_use]
    pub fn with_sync_url(sync_url: &str) -> Self {
        Self::new(default_sections(sync_url), invariant_sections())
    }

    #[must_use]
    pub fn defaults(&self) -> &AgentConfig {
        &self.defaults
    }

    /// Patch that touches every templated section without overriding anything.
    #[must_use]
    pub fn full_template_patch(&self) -> AgentConfig {
        self.defaults
            .keys()
            .chain(self.invariants.keys())
            .map(|section| (section.clone(), Value::Object(Map::new())))
            .collect()
    }

    /// Reads the agent state once and builds against it.
    pub async fn build_from_agent(
        &self,
        agent: &dyn LocationAgent,
        patch: &AgentConfig,
    ) -> Result<AgentConfig, AgentError> {
        let snapshot = agent.get_state().await?;
        Ok(self.build(patch, &snapshot))
    }

    /// Builds the payload for every top-level key present in `patch`.
    #[must_use]
    pub fn build(&self, patch: &AgentConfig, snapshot: &AgentState) -> AgentConfig {
        let mut payload = AgentConfig::new();
        for (section, patch_value) in patch {
            let is_templated =
                self.defaults.contains_key(section) || self.invariants.contains_key(section);
            let output = match (is_templated, patch_value.as_object()) {
                (true, Some(section_patch)) => {
                    Value::Object(self.build_section(section, section_patch, snapshot))
                }
                _ => patch_value.clone(),
            };
            payload.insert(section.clone(), output);
        }
        payload
    }

    fn build_section(
        &self,
        section: &str,
        section_patch: &Map<String, Value>,
        snapshot: &AgentState,
    ) -> Map<String, Value> {
        let mut merged = object_at(&self.defaults, section);
        for (key, value) in section_patch {
            merged.insert(key.clone(), value.clone());
        }
        for (key, value) in object_at(&self.invariants, section) {
            merged.insert(key, value);
        }

        for (map_section, map_key) in RUNTIME_MAPS {
            if map_section != section {
                continue;
            }
            let previous = runtime_or_default(snapshot, &self.defaults, map_section, map_key);
            let resolved = match section_patch.get(map_key) {
                Some(Value::Object(update)) if update.is_empty() => Map::new(),
                Some(Value::Object(update)) => {
                    let mut next = previous;
                    for (key, value) in update {
                        next.insert(key.clone(), value.clone());
                    }
                    next
                }
                // A non-object value is taken as the caller's literal intent.
                Some(other) => {
                    merged.insert(map_key.to_string(), other.clone());
                    continue;
                }
                None => previous,
            };
            merged.insert(map_key.to_string(), Value::Object(resolved));
        }
        merged
    }
}

fn runtime_or_default(
    snapshot: &AgentState,
    defaults: &AgentConfig,
    section: &str,
    key: &str,
) -> Map<String, Value> {
    let runtime = snapshot
        .config
        .get(section)
        .and_then(Value::as_object)
        .and_then(|section| section.get(key))
        .and_then(Value::as_object);
    match runtime {
        Some(map) => map.clone(),
        None => object_at(defaults, section)
            .get(key)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
    }
}

fn object_at(config: &AgentConfig, section: &str) -> Map<String, Value> {
    config
        .get(section)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn into_object(value: Value) -> AgentConfig {
    match value {
        Value::Object(map) => map,
        _ => AgentConfig::new(),
    }
}

#[must_use]
pub fn default_sections(sync_url: &str) -> AgentConfig {
    into_object(json!({
        SECTION_GEOLOCATION: {
            "desiredAccuracy": "high",
            "distanceFilter": 50,
            "stationaryRadius": 50,
            "stopTimeout": 5,
            "activityType": "other",
            "locationAuthorizationRequest": "Always",
        },
        SECTION_APP: {
            "stopOnTerminate": false,
            "startOnBoot": true,
            "enableHeadless": true,
            "heartbeatInterval": 3600,
        },
        SECTION_HTTP: {
            "url": sync_url,
            "method": "POST",
            "autoSync": true,
            "batchSync": false,
            "httpRootProperty": "location",
            "headers": {},
        },
        SECTION_PERSISTENCE: {
            "maxDaysToPersist": 7,
            "maxRecordsToPersist": 1000,
            "extras": {},
        },
    }))
}

/// Settings no caller may weaken.
#[must_use]
pub fn invariant_sections() -> AgentConfig {
    into_object(json!({
        SECTION_GEOLOCATION: {
            "distanceFilter": 50,
            "activityType": "other",
        },
        SECTION_APP: {
            "stopOnTerminate": false,
            "startOnBoot": true,
        },
        SECTION_HTTP: {
            "method": "POST",
            "autoSync": true,
        },
    }))
}

/// `{http: {headers: ...}}`, empty headers meaning "clear".
#[must_use]
pub fn headers_patch(headers: Map<String, Value>) -> AgentConfig {
    into_object(json!({ SECTION_HTTP: { HTTP_HEADERS: headers } }))
}

/// `{persistence: {extras: ...}}`, empty extras meaning "clear".
#[must_use]
pub fn extras_patch(extras: Map<String, Value>) -> AgentConfig {
    into_object(json!({ SECTION_PERSISTENCE: { PERSISTENCE_EXTRAS: extras } }))
}

#[must_use]
pub fn bearer_header(token: &str) -> Map<String, Value> {
    let mut headers = Map::new();
    headers.insert(
        "Authorization".to_string(),
        Value::String(format!("Bearer {token}")),
    );
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> ConfigPayloadBuilder {
        ConfigPayloadBuilder::with_sync_url("https://alerts.example.org/sync")
    }

    fn snapshot_with_headers(headers: Value) -> AgentState {
        AgentState {
            enabled: true,
            config: into_object(json!({
                "http": {"url": "https://alerts.example.org/sync", "headers": headers},
                "persistence": {"extras": {"userId": "u-1"}},
            })),
        }
    }

    fn headers_of(payload: &AgentConfig) -> Value {
        payload["http"]["headers"].clone()
    }

    #[test]
    fn non_empty_headers_merge_onto_runtime_value() {
        let snapshot = snapshot_with_headers(json!({"A": 1, "B": 2}));
        let patch = into_object(json!({"http": {"headers": {"B": 3}}}));
        let payload = builder().build(&patch, &snapshot);
        assert_eq!(headers_of(&payload), json!({"A": 1, "B": 3}));
    }

    #[test]
    fn empty_headers_clear_everything() {
        let snapshot = snapshot_with_headers(json!({"A": 1, "B": 2}));
        let patch = into_object(json!({"http": {"headers": {}}}));
        let payload = builder().build(&patch, &snapshot);
        assert_eq!(headers_of(&payload), json!({}));
    }

    #[test]
    fn absent_headers_carry_forward() {
        let snapshot = snapshot_with_headers(json!({"A": 1, "B": 2}));
        let patch = into_object(json!({"http": {"batchSync": true}}));
        let payload = builder().build(&patch, &snapshot);
        assert_eq!(headers_of(&payload), json!({"A": 1, "B": 2}));
        assert_eq!(payload["http"]["batchSync"], json!(true));
        assert_eq!(payload["http"]["url"], json!("https://alerts.example.org/sync"));
    }

    #[test]
    fn invariants_override_caller_values() {
        let patch = into_object(json!({
            "geolocation": {"distanceFilter": 5000, "desiredAccuracy": "low"},
            "app": {"stopOnTerminate": true},
            "http": {"autoSync": false},
        }));
        let payload = builder().build(&patch, &AgentState::default());
        assert_eq!(payload["geolocation"]["distanceFilter"], json!(50));
        assert_eq!(payload["geolocation"]["desiredAccuracy"], json!("low"));
        assert_eq!(payload["app"]["stopOnTerminate"], json!(false));
        assert_eq!(payload["http"]["autoSync"], json!(true));
    }

    #[test]
    fn untouched_sections_are_not_emitted() {
        let patch = extras_patch(into_object(json!({"userId": "u-2"})));
        let payload = builder().build(&patch, &snapshot_with_headers(json!({"A": 1})));
        assert_eq!(payload.keys().collect::<Vec<_>>(), vec!["persistence"]);
        assert_eq!(payload["persistence"]["extras"], json!({"userId": "u-2"}));
        assert_eq!(payload["persistence"]["maxDaysToPersist"], json!(7));
    }

    #[test]
    fn unknown_keys_pass_through_verbatim() {
        let patch = into_object(json!({
            "logger": {"debug": true, "logLevel": 5},
            "reset": false,
        }));
        let payload = builder().build(&patch, &AgentState::default());
        assert_eq!(payload["logger"], json!({"debug": true, "logLevel": 5}));
        assert_eq!(payload["reset"], json!(false));
    }

    #[test]
    fn missing_runtime_map_falls_back_to_defaults() {
        let patch = into_object(json!({"persistence": {}}));
        let payload = builder().build(&patch, &AgentState::default());
        assert_eq!(payload["persistence"]["extras"], json!({}));
    }

    #[test]
    fn full_template_patch_touches_every_section() {
        let builder = builder();
        let patch = builder.full_template_patch();
        let payload = builder.build(&patch, &snapshot_with_headers(json!({"A": 1})));
        for section in ["geolocation", "app", "http", "persistence"] {
            assert!(payload.contains_key(section), "missing {section}");
        }
        assert_eq!(headers_of(&payload), json!({"A": 1}));
        assert_eq!(payload["persistence"]["extras"], json!({"userId": "u-1"}));
    }

    #[test]
    fn bearer_header_formats_token() {
        assert_eq!(
            Value::Object(bearer_header("abc")),
            json!({"Authorization": "Bearer abc"})
        );
    }
}
