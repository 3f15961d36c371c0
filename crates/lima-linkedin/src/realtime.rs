//! Long-lived Server-Sent-Events listener for LinkedIn's realtime endpoint.
//!
//! Frames are `data:`-prefixed JSON lines. Two envelopes are recognized:
//! `ClientConnection` (carries the realtime session id, echoed by subsequent
//! requests and heartbeats) and `DecoratedEvent`, whose payload is dispatched
//! once per present payload field. A heartbeat sibling task pings the
//! connectivity-tracking endpoint every 60 seconds while the stream is open.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::client::LinkedInClient;
use crate::error::{ClientError, ClientResult};
use crate::types::RealtimeEvent;
use crate::urn::Urn;

const CLIENT_CONNECTION_KEY: &str = "com.linkedin.realtimefrontend.ClientConnection";
const DECORATED_EVENT_KEY: &str = "com.linkedin.realtimefrontend.DecoratedEvent";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// An event surfaced to the stream consumer.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The realtime session was (re-)established.
    Connected { session_id: String },
    /// A conversation message event (`payload.event`).
    Message(RealtimeEvent),
    /// A reaction add/remove (`payload.reactionAdded`).
    ReactionChange(RealtimeEvent),
    /// A conversation action such as `UPDATE` (`payload.action`).
    Action(RealtimeEvent),
    /// A seen receipt or typing indicator (`payload.fromEntity`).
    FromEntity(RealtimeEvent),
    /// Every decoded frame, raw. The firehose channel.
    AllEvents(Value),
    /// The stream timed out or dropped; a reconnect follows automatically.
    Timeout(String),
}

/// Why [`listen`] returned.
#[derive(Debug)]
pub enum ListenerExit {
    /// The shutdown signal fired.
    Shutdown,
    /// The consumer dropped its receiver.
    ConsumerGone,
}

/// Run the realtime listener until shutdown. Reconnects internally on
/// transport failures (emitting [`StreamEvent::Timeout`] first); a 429 on
/// stream open is fatal for the attempt and surfaces as an error so the
/// caller can back off.
pub async fn listen(
    client: Arc<LinkedInClient>,
    user_urn: Urn,
    tx: mpsc::Sender<StreamEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> ClientResult<ListenerExit> {
    loop {
        if *shutdown.borrow() {
            return Ok(ListenerExit::Shutdown);
        }

        let heartbeat = tokio::spawn(heartbeat_loop(client.clone(), user_urn.clone()));

        let outcome = tokio::select! {
            _ = shutdown.changed() => {
                heartbeat.abort();
                return Ok(ListenerExit::Shutdown);
            }
            result = run_stream(&client, &tx) => result,
        };
        heartbeat.abort();

        match outcome {
            Ok(StreamOutcome::Closed) => {
                info!("Event stream closed, reconnecting");
            }
            Ok(StreamOutcome::ConsumerGone) => return Ok(ListenerExit::ConsumerGone),
            Err(ClientError::TooManyRequests) => return Err(ClientError::TooManyRequests),
            Err(e) if e.is_transient() => {
                warn!("Realtime stream dropped: {e}");
                if tx.send(StreamEvent::Timeout(e.to_string())).await.is_err() {
                    return Ok(ListenerExit::ConsumerGone);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

enum StreamOutcome {
    /// Server closed the stream (EOF).
    Closed,
    ConsumerGone,
}

async fn run_stream(
    client: &LinkedInClient,
    tx: &mpsc::Sender<StreamEvent>,
) -> ClientResult<StreamOutcome> {
    info!("Starting event stream listener");
    let response = client.open_realtime_stream().await?;

    let mut byte_stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = byte_stream.next().await {
        let bytes = chunk?;
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(line_end) = buffer.find('\n') {
            let line = buffer[..line_end].trim().to_string();
            buffer.drain(..=line_end);

            let Some(payload) = line.strip_prefix("data:") else { continue };
            let data: Value = match serde_json::from_str(payload.trim()) {
                Ok(data) => data,
                Err(e) => {
                    debug!("Skipping undecodable realtime frame: {e}");
                    continue;
                }
            };

            if dispatch_frame(client, tx, data).await.is_err() {
                return Ok(StreamOutcome::ConsumerGone);
            }
        }
    }

    Ok(StreamOutcome::Closed)
}

async fn dispatch_frame(
    client: &LinkedInClient,
    tx: &mpsc::Sender<StreamEvent>,
    data: Value,
) -> Result<(), mpsc::error::SendError<StreamEvent>> {
    tx.send(StreamEvent::AllEvents(data.clone())).await?;

    if let Some(connection) = data.get(CLIENT_CONNECTION_KEY) {
        if let Some(id) = connection.get("id").and_then(Value::as_str) {
            info!("Got realtime connection ID: {id}");
            client.set_realtime_session_id(id.to_owned());
            tx.send(StreamEvent::Connected { session_id: id.to_owned() }).await?;
        }
        return Ok(());
    }

    let Some(payload) = data.get(DECORATED_EVENT_KEY).and_then(|d| d.get("payload")) else {
        return Ok(());
    };
    let event: RealtimeEvent = match serde_json::from_value(payload.clone()) {
        Ok(event) => event,
        Err(e) => {
            // Unknown payload shapes are data, not errors.
            debug!("Undecodable DecoratedEvent payload: {e}");
            return Ok(());
        }
    };

    // One frame can carry several payload kinds; dispatch each present one.
    if event.event.is_some() {
        tx.send(StreamEvent::Message(event.clone())).await?;
    }
    if event.reaction_added.is_some() {
        tx.send(StreamEvent::ReactionChange(event.clone())).await?;
    }
    if event.action.is_some() {
        tx.send(StreamEvent::Action(event.clone())).await?;
    }
    if event.from_entity.is_some() {
        tx.send(StreamEvent::FromEntity(event)).await?;
    }
    Ok(())
}

async fn heartbeat_loop(client: Arc<LinkedInClient>, user_urn: Urn) {
    info!("Starting heartbeat task");
    loop {
        sleep(HEARTBEAT_INTERVAL).await;
        debug!("Sending heartbeat");
        if let Err(e) = client.send_heartbeat(&user_urn).await {
            warn!("Heartbeat failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_client() -> Arc<LinkedInClient> {
        Arc::new(
            LinkedInClient::from_cookies(
                HashMap::from([
                    ("li_at".to_owned(), "token".to_owned()),
                    ("JSESSIONID".to_owned(), "\"ajax:1\"".to_owned()),
                ]),
                Vec::new(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn client_connection_frame_stores_session_id() {
        let client = test_client();
        let (tx, mut rx) = mpsc::channel(8);
        let frame = serde_json::json!({
            CLIENT_CONNECTION_KEY: {"id": "session-abc"}
        });
        dispatch_frame(&client, &tx, frame).await.unwrap();

        assert_eq!(client.realtime_session_id().as_deref(), Some("session-abc"));
        assert!(matches!(rx.recv().await, Some(StreamEvent::AllEvents(_))));
        match rx.recv().await {
            Some(StreamEvent::Connected { session_id }) => assert_eq!(session_id, "session-abc"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn decorated_event_dispatches_once_per_present_field() {
        let client = test_client();
        let (tx, mut rx) = mpsc::channel(8);
        let frame = serde_json::json!({
            DECORATED_EVENT_KEY: {
                "payload": {
                    "reactionAdded": true,
                    "eventUrn": "urn:li:fs_event:(2-abc,123)",
                    "actorMiniProfileUrn": "urn:li:fs_miniProfile:U",
                    "action": "UPDATE",
                }
            }
        });
        dispatch_frame(&client, &tx, frame).await.unwrap();

        assert!(matches!(rx.recv().await, Some(StreamEvent::AllEvents(_))));
        assert!(matches!(rx.recv().await, Some(StreamEvent::ReactionChange(_))));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Action(_))));
        assert!(rx.try_recv().is_err());
    }
}
