//! Matrix event and content types, as exchanged with the homeserver.
//!
//! Event `content` stays a raw `serde_json::Value` at the transaction
//! boundary and is decoded per event type by the handler — the homeserver may
//! send anything, and unknown shapes must never fail the transaction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Event type strings ───────────────────────────────────────────────────────

pub const EVENT_MESSAGE: &str = "m.room.message";
pub const EVENT_ENCRYPTED: &str = "m.room.encrypted";
pub const EVENT_REACTION: &str = "m.reaction";
pub const EVENT_REDACTION: &str = "m.room.redaction";
pub const EVENT_MEMBER: &str = "m.room.member";
pub const EVENT_TYPING: &str = "m.typing";
pub const EVENT_RECEIPT: &str = "m.receipt";
pub const EVENT_PRESENCE: &str = "m.presence";
pub const EVENT_ENCRYPTION: &str = "m.room.encryption";
pub const EVENT_TOPIC: &str = "m.room.topic";
pub const EVENT_AVATAR: &str = "m.room.avatar";
pub const EVENT_POWER_LEVELS: &str = "m.room.power_levels";
pub const EVENT_SPACE_CHILD: &str = "m.space.child";
/// Official bridge-info state event.
pub const EVENT_BRIDGE: &str = "m.bridge";
/// Legacy bridge-info state event kept for compatibility.
pub const EVENT_HALF_SHOT_BRIDGE: &str = "uk.half-shot.bridge";

pub const MSGTYPE_TEXT: &str = "m.text";
pub const MSGTYPE_NOTICE: &str = "m.notice";
pub const MSGTYPE_EMOTE: &str = "m.emote";
pub const MSGTYPE_IMAGE: &str = "m.image";
pub const MSGTYPE_FILE: &str = "m.file";
pub const MSGTYPE_AUDIO: &str = "m.audio";
pub const MSGTYPE_VIDEO: &str = "m.video";

pub const RELATION_ANNOTATION: &str = "m.annotation";
pub const RELATION_REPLACE: &str = "m.replace";

pub const FORMAT_HTML: &str = "org.matrix.custom.html";

pub const MEMBERSHIP_JOIN: &str = "join";
pub const MEMBERSHIP_LEAVE: &str = "leave";
pub const MEMBERSHIP_INVITE: &str = "invite";

// ── Transactions ─────────────────────────────────────────────────────────────

/// A homeserver transaction pushed to the appservice.
///
/// `PUT /_matrix/app/v1/transactions/{txnId}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub events: Vec<Event>,
    /// MSC2409 ephemeral events (typing, receipts, presence).
    #[serde(
        default,
        alias = "de.sorunome.msc2409.ephemeral",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub ephemeral: Vec<Event>,
}

/// A client event as received from the homeserver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub origin_server_ts: i64,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub unsigned: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    /// Only on `m.room.redaction`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<String>,
}

// ── Message content ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default)]
    pub msgtype: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
    /// mxc URI for media messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<MediaInfo>,
    /// Encrypted media descriptor; present instead of `url` in e2ee rooms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<EncryptedFile>,
    #[serde(
        default,
        rename = "m.relates_to",
        skip_serializing_if = "Option::is_none"
    )]
    pub relates_to: Option<Relation>,
    #[serde(
        default,
        rename = "m.new_content",
        skip_serializing_if = "Option::is_none"
    )]
    pub new_content: Option<Box<MessageContent>>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self { msgtype: MSGTYPE_TEXT.to_owned(), body: body.into(), ..Default::default() }
    }

    pub fn notice(body: impl Into<String>) -> Self {
        Self { msgtype: MSGTYPE_NOTICE.to_owned(), body: body.into(), ..Default::default() }
    }

    pub fn html(body: impl Into<String>, formatted_body: impl Into<String>) -> Self {
        Self {
            msgtype: MSGTYPE_TEXT.to_owned(),
            body: body.into(),
            format: Some(FORMAT_HTML.to_owned()),
            formatted_body: Some(formatted_body.into()),
            ..Default::default()
        }
    }

    /// Wrap this content as an edit (`m.replace`) of `event_id`.
    pub fn into_edit_of(self, event_id: &str) -> Self {
        let mut fallback = self.clone();
        fallback.body = format!("* {}", self.body);
        if let Some(formatted) = &self.formatted_body {
            fallback.formatted_body = Some(format!("* {formatted}"));
        }
        fallback.new_content = Some(Box::new(self));
        fallback.relates_to = Some(Relation {
            rel_type: Some(RELATION_REPLACE.to_owned()),
            event_id: Some(event_id.to_owned()),
            key: None,
        });
        fallback
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Relation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Annotation key, i.e. the reaction emoji.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReactionContent {
    #[serde(default, rename = "m.relates_to")]
    pub relates_to: Relation,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<i64>,
    /// Milliseconds, for audio/video.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
}

/// Encrypted attachment descriptor (Matrix `EncryptedFile`). Opaque to the
/// bridge core; decryption is the e2ee helper's concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptedFile {
    pub url: String,
    #[serde(default)]
    pub key: Value,
    #[serde(default)]
    pub iv: String,
    #[serde(default)]
    pub hashes: Value,
    #[serde(default)]
    pub v: String,
}

// ── State content ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemberContent {
    pub membership: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Tells supporting clients to auto-accept this invite.
    #[serde(
        default,
        rename = "fi.mau.will_auto_accept",
        skip_serializing_if = "Option::is_none"
    )]
    pub will_auto_accept: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PowerLevelsContent {
    #[serde(default)]
    pub users: HashMap<String, i64>,
    #[serde(default)]
    pub users_default: i64,
    #[serde(default)]
    pub events: HashMap<String, i64>,
    #[serde(default)]
    pub events_default: i64,
    #[serde(default)]
    pub state_default: i64,
    #[serde(default)]
    pub ban: i64,
    #[serde(default)]
    pub kick: i64,
    #[serde(default)]
    pub redact: i64,
    #[serde(default)]
    pub invite: i64,
}

/// Bridge-info state content, posted both as `m.bridge` and the legacy
/// `uk.half-shot.bridge` type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeInfoContent {
    pub bridgebot: String,
    pub creator: String,
    pub protocol: BridgeInfoSection,
    pub channel: BridgeInfoSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeInfoSection {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

// ── Room creation ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct InitialStateEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub state_key: String,
    pub content: Value,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateRoomRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invite: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub initial_state: Vec<InitialStateEvent>,
    pub is_direct: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_level_content_override: Option<PowerLevelsContent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_accepts_msc2409_ephemeral_key() {
        let raw = serde_json::json!({
            "events": [],
            "de.sorunome.msc2409.ephemeral": [
                {"type": "m.typing", "room_id": "!r:h", "content": {"user_ids": []}}
            ]
        });
        let txn: Transaction = serde_json::from_value(raw).unwrap();
        assert_eq!(txn.ephemeral.len(), 1);
        assert_eq!(txn.ephemeral[0].event_type, "m.typing");
    }

    #[test]
    fn edit_wraps_new_content_and_prefixes_fallback() {
        let edit = MessageContent::text("fixed").into_edit_of("$orig");
        assert_eq!(edit.body, "* fixed");
        let new_content = edit.new_content.as_ref().unwrap();
        assert_eq!(new_content.body, "fixed");
        let relation = edit.relates_to.as_ref().unwrap();
        assert_eq!(relation.rel_type.as_deref(), Some(RELATION_REPLACE));
        assert_eq!(relation.event_id.as_deref(), Some("$orig"));
    }
}
