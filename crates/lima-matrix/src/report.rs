//! Operator-facing reporting: per-user bridge-state pings and per-event
//! message send checkpoints. Both are best-effort — failures are logged,
//! never propagated.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::appservice::Appservice;

/// Connectivity state reported for one remote (LinkedIn) account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeStateEvent {
    StartingUp,
    Connecting,
    Backfilling,
    Connected,
    TransientDisconnect,
    BadCredentials,
    LoggedOut,
    UnknownError,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeState {
    pub state_event: BridgeStateEvent,
    /// The LinkedIn member URN of the account.
    pub remote_id: String,
    /// Human-readable name of the account.
    pub remote_name: String,
    /// Seconds since the epoch.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

impl BridgeState {
    pub fn new(state_event: BridgeStateEvent, remote_id: String, remote_name: String) -> Self {
        Self {
            state_event,
            remote_id,
            remote_name,
            timestamp: chrono::Utc::now().timestamp(),
            info: None,
        }
    }

    pub fn with_info(mut self, info: Value) -> Self {
        self.info = Some(info);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointStatus {
    Success,
    PermFailure,
    Unsupported,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointStep {
    Bridge,
    Remote,
}

/// Delivery checkpoint for one Matrix-originated event.
#[derive(Debug, Clone, Serialize)]
pub struct MessageSendCheckpoint {
    pub event_id: String,
    pub room_id: String,
    pub step: CheckpointStep,
    pub timestamp: i64,
    pub status: CheckpointStatus,
    pub reported_by: &'static str,
    pub retry_num: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

impl MessageSendCheckpoint {
    pub fn new(event_id: &str, room_id: &str, status: CheckpointStatus) -> Self {
        Self {
            event_id: event_id.to_owned(),
            room_id: room_id.to_owned(),
            step: CheckpointStep::Remote,
            timestamp: chrono::Utc::now().timestamp_millis(),
            status,
            reported_by: "BRIDGE",
            retry_num: 0,
            info: None,
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }
}

impl Appservice {
    /// Push a bridge-state ping to the operator's status endpoint.
    pub async fn post_bridge_state(&self, state: BridgeState) {
        let Some(endpoint) = &self.status_endpoint else {
            debug!("No status endpoint configured, not reporting {:?}", state.state_event);
            return;
        };
        let result = self
            .http()
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.as_token))
            .json(&state)
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(
                    "Bridge state endpoint returned {} for {:?}",
                    response.status(),
                    state.state_event
                );
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to push bridge state {:?}: {e}", state.state_event),
        }
    }

    /// Push a message send checkpoint. Fire-and-forget.
    pub async fn send_checkpoint(&self, checkpoint: MessageSendCheckpoint) {
        let Some(endpoint) = &self.checkpoint_endpoint else {
            return;
        };
        let result = self
            .http()
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.as_token))
            .json(&serde_json::json!({"checkpoints": [checkpoint]}))
            .send()
            .await;
        if let Err(e) = result {
            warn!("Failed to send message checkpoint for {}: {e}", checkpoint.event_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_event_serializes_screaming_snake() {
        let state = BridgeState::new(
            BridgeStateEvent::TransientDisconnect,
            "urn:li:member:1".to_owned(),
            "LinkedIn".to_owned(),
        );
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["state_event"], "TRANSIENT_DISCONNECT");
        assert_eq!(value["remote_id"], "urn:li:member:1");
    }

    #[test]
    fn checkpoint_statuses_match_wire_format() {
        assert_eq!(
            serde_json::to_value(CheckpointStatus::PermFailure).unwrap(),
            "PERM_FAILURE"
        );
        assert_eq!(
            serde_json::to_value(CheckpointStatus::Unsupported).unwrap(),
            "UNSUPPORTED"
        );
    }
}
