//! Inbound Matrix event handling: consumes appservice transactions and
//! routes each event to the right portal and user.

use std::sync::Arc;

use anyhow::Result;
use lima_matrix::types::{
    self as mx, Event, MemberContent, ReactionContent, Transaction,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::Bridge;

/// Consume transactions until the channel closes or shutdown fires.
pub async fn run(bridge: Arc<Bridge>, mut rx: mpsc::Receiver<Transaction>) {
    let mut shutdown = bridge.subscribe_shutdown();
    loop {
        let txn = tokio::select! {
            _ = shutdown.changed() => break,
            txn = rx.recv() => match txn {
                Some(txn) => txn,
                None => break,
            },
        };
        for event in txn.events {
            if let Err(e) = handle_event(&bridge, event).await {
                warn!("Failed to handle Matrix event: {e:#}");
            }
        }
        for event in txn.ephemeral {
            if let Err(e) = handle_ephemeral_event(&bridge, event).await {
                warn!("Failed to handle ephemeral event: {e:#}");
            }
        }
    }
    info!("Matrix handler stopped");
}

fn is_own_event(bridge: &Bridge, sender: &str) -> bool {
    sender == bridge.appservice.bot_mxid || bridge.is_bridge_ghost(sender)
}

async fn handle_event(bridge: &Arc<Bridge>, event: Event) -> Result<()> {
    match event.event_type.as_str() {
        mx::EVENT_MEMBER => handle_member(bridge, event).await,
        _ if is_own_event(bridge, &event.sender) => Ok(()),
        mx::EVENT_MESSAGE | mx::EVENT_ENCRYPTED => handle_message(bridge, event).await,
        mx::EVENT_REACTION => handle_reaction(bridge, event).await,
        mx::EVENT_REDACTION => handle_redaction(bridge, event).await,
        other => {
            debug!("Ignoring unhandled Matrix event type {other}");
            Ok(())
        }
    }
}

async fn handle_message(bridge: &Arc<Bridge>, event: Event) -> Result<()> {
    let Some(room_id) = event.room_id.clone() else { return Ok(()) };
    let Some(event_id) = event.event_id.clone() else { return Ok(()) };

    let Some(user) = bridge.get_user_by_mxid(&event.sender, true).await? else {
        return Ok(());
    };
    let Some(portal) = bridge.get_portal_by_mxid(&room_id).await? else {
        return Ok(());
    };

    if event.event_type == mx::EVENT_ENCRYPTED {
        // Decryption is the e2ee helper's job; without it the event cannot be
        // bridged.
        warn!("Received encrypted event {event_id} but no e2ee helper is configured");
        return Ok(());
    }

    let content: mx::MessageContent = serde_json::from_value(event.content)?;
    portal.handle_matrix_message(bridge, &user, content, event_id).await;
    Ok(())
}

async fn handle_reaction(bridge: &Arc<Bridge>, event: Event) -> Result<()> {
    let Some(room_id) = event.room_id.clone() else { return Ok(()) };
    let Some(event_id) = event.event_id.clone() else { return Ok(()) };

    let content: ReactionContent = serde_json::from_value(event.content)?;
    if content.relates_to.rel_type.as_deref() != Some(mx::RELATION_ANNOTATION) {
        debug!(
            "Ignoring m.reaction in {room_id} with relation type {:?}",
            content.relates_to.rel_type
        );
        return Ok(());
    }
    let (Some(target), Some(key)) = (content.relates_to.event_id, content.relates_to.key) else {
        return Ok(());
    };

    let Some(user) = bridge.get_user_by_mxid(&event.sender, true).await? else {
        return Ok(());
    };
    let Some(portal) = bridge.get_portal_by_mxid(&room_id).await? else {
        return Ok(());
    };
    portal
        .handle_matrix_reaction(bridge, &user, event_id, target, key)
        .await;
    Ok(())
}

async fn handle_redaction(bridge: &Arc<Bridge>, event: Event) -> Result<()> {
    let Some(room_id) = event.room_id.clone() else { return Ok(()) };
    let (Some(redacts), Some(event_id)) = (event.redacts.clone(), event.event_id.clone()) else {
        return Ok(());
    };

    let Some(user) = bridge.get_user_by_mxid(&event.sender, true).await? else {
        return Ok(());
    };
    let Some(portal) = bridge.get_portal_by_mxid(&room_id).await? else {
        return Ok(());
    };
    portal
        .handle_matrix_redaction(bridge, &user, redacts, event_id)
        .await;
    Ok(())
}

async fn handle_member(bridge: &Arc<Bridge>, event: Event) -> Result<()> {
    let Some(room_id) = event.room_id.clone() else { return Ok(()) };
    let Some(state_key) = event.state_key.clone() else { return Ok(()) };
    let content: MemberContent = serde_json::from_value(event.content)?;

    match content.membership.as_str() {
        // The user invited the bridge bot to a room: join and adopt it as the
        // notice room on first contact.
        mx::MEMBERSHIP_INVITE if state_key == bridge.appservice.bot_mxid => {
            bridge.appservice.bot_intent().join_room(&room_id).await?;
            let Some(user) = bridge.get_user_by_mxid(&event.sender, true).await? else {
                return Ok(());
            };
            if user.notice_room().await.is_none() {
                user.set_notice_room(bridge, room_id.clone()).await?;
                let notice = mx::MessageContent::notice(
                    "This room has been marked as your LinkedIn Messages bridge notice room.",
                );
                bridge
                    .appservice
                    .bot_intent()
                    .send_message_event(&room_id, mx::EVENT_MESSAGE, &serde_json::to_value(&notice)?)
                    .await?;
            }
            Ok(())
        }
        mx::MEMBERSHIP_LEAVE if state_key == event.sender => {
            let Some(user) = bridge.get_user_by_mxid(&event.sender, false).await? else {
                return Ok(());
            };
            let Some(portal) = bridge.get_portal_by_mxid(&room_id).await? else {
                return Ok(());
            };
            portal.handle_matrix_leave(bridge, &user).await;
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn handle_ephemeral_event(bridge: &Arc<Bridge>, event: Event) -> Result<()> {
    match event.event_type.as_str() {
        mx::EVENT_TYPING => handle_typing(bridge, event).await,
        mx::EVENT_RECEIPT => handle_receipt(bridge, event).await,
        mx::EVENT_PRESENCE => {
            // Reserved.
            debug!("Presence update from {}", event.sender);
            Ok(())
        }
        other => {
            debug!("Ignoring ephemeral event type {other}");
            Ok(())
        }
    }
}

async fn handle_typing(bridge: &Arc<Bridge>, event: Event) -> Result<()> {
    let Some(room_id) = event.room_id.clone() else { return Ok(()) };
    let Some(portal) = bridge.get_portal_by_mxid(&room_id).await? else {
        return Ok(());
    };
    let user_ids: Vec<String> = event
        .content
        .get("user_ids")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    for user_id in user_ids {
        if is_own_event(bridge, &user_id) {
            continue;
        }
        if let Some(user) = bridge.get_user_by_mxid(&user_id, false).await? {
            portal.handle_matrix_typing(&user).await;
        }
    }
    Ok(())
}

async fn handle_receipt(bridge: &Arc<Bridge>, event: Event) -> Result<()> {
    let Some(room_id) = event.room_id.clone() else { return Ok(()) };
    let Some(portal) = bridge.get_portal_by_mxid(&room_id).await? else {
        return Ok(());
    };
    let receiver = portal.receiver_urn().await;

    // content: { "$event_id": { "m.read": { "@user:hs": {...} } } }
    let Some(receipts) = event.content.as_object() else { return Ok(()) };
    for per_event in receipts.values() {
        let Some(read) = per_event.get("m.read").and_then(Value::as_object) else {
            continue;
        };
        for user_id in read.keys() {
            let Some(user) = bridge.get_user_by_mxid(user_id, false).await? else {
                continue;
            };
            // Only the portal's owning user propagates read state upstream.
            if user.li_member_urn().await != receiver {
                continue;
            }
            if let Some(client) = user.client().await {
                debug!("{user_id} read {}", portal.li_thread_urn);
                if let Err(e) = client.mark_conversation_read(&portal.li_thread_urn).await {
                    debug!("Failed to mark conversation read upstream: {e}");
                }
            }
        }
    }
    Ok(())
}
