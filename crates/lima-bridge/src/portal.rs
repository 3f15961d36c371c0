//! Per-conversation portals: room creation, backfill, deduplication, and
//! message/reaction/redaction translation in both directions.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use lima_db::repository::{
    messages::{self, MessageRow},
    portals::{self, PortalRow},
    reactions::{self, ReactionRow},
};
use lima_linkedin::types::{
    Conversation, ConversationEvent, MessageAttachment, MessageEvent, ReactionSummary,
    RealtimeEvent,
};
use lima_linkedin::{LinkedInClient, Urn};
use lima_matrix::types::{
    self as mx, BridgeInfoContent, BridgeInfoSection, CreateRoomRequest, InitialStateEvent,
    MemberContent, MessageContent, PowerLevelsContent, ReactionContent, Relation,
};
use lima_matrix::{CheckpointStatus, Intent, MatrixError, MessageSendCheckpoint};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::formatter::{
    linkedin_feed_update_to_matrix, linkedin_spinmail_to_matrix, linkedin_subject_to_matrix,
    linkedin_to_matrix, matrix_to_linkedin,
};
use crate::user::User;
use crate::{Bridge, puppet::sniff_image_mime};

/// Capacity of the recent-message dedup ring.
const DEDUP_CAPACITY: usize = 100;

/// Participant URN LinkedIn uses for ad/auto-message senders.
const UNKNOWN_PARTICIPANT: &str = "UNKNOWN";

/// Registry key: thread URN and receiver URN by canonical id string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortalKey {
    pub thread: String,
    pub receiver: String,
}

impl PortalKey {
    pub fn new(li_thread_urn: &Urn, li_receiver_urn: Option<&Urn>) -> Self {
        Self {
            thread: li_thread_urn.id_str(),
            receiver: li_receiver_urn.map(Urn::id_str).unwrap_or_default(),
        }
    }
}

pub struct Portal {
    pub key: PortalKey,
    pub li_thread_urn: Urn,
    row: Mutex<PortalRow>,
    /// Serializes `create_matrix_room` so concurrent events don't race to
    /// create the same room.
    create_room_lock: Mutex<()>,
    /// Held during backfill; live events block on it so history lands first.
    backfill_lock: Mutex<()>,
    backfilling: AtomicBool,
    /// Recently handled LinkedIn message URNs, for echo suppression.
    dedup: Mutex<VecDeque<String>>,
    /// Per-sender locks keeping the dedup queue coherent.
    send_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Portal {
    pub(crate) fn new(li_thread_urn: Urn, li_receiver_urn: Option<Urn>) -> Self {
        let key = PortalKey::new(&li_thread_urn, li_receiver_urn.as_ref());
        let row = PortalRow::new(li_thread_urn.clone(), li_receiver_urn);
        Self {
            key,
            li_thread_urn,
            row: Mutex::new(row),
            create_room_lock: Mutex::new(()),
            backfill_lock: Mutex::new(()),
            backfilling: AtomicBool::new(false),
            dedup: Mutex::new(VecDeque::with_capacity(DEDUP_CAPACITY)),
            send_locks: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn from_row(row: PortalRow) -> Self {
        let key = PortalKey::new(&row.li_thread_urn, row.li_receiver_urn.as_ref());
        Self {
            key,
            li_thread_urn: row.li_thread_urn.clone(),
            row: Mutex::new(row),
            create_room_lock: Mutex::new(()),
            backfill_lock: Mutex::new(()),
            backfilling: AtomicBool::new(false),
            dedup: Mutex::new(VecDeque::with_capacity(DEDUP_CAPACITY)),
            send_locks: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn row(&self) -> PortalRow {
        self.row.lock().await.clone()
    }

    pub async fn mxid(&self) -> Option<String> {
        self.row.lock().await.mxid.clone()
    }

    pub async fn other_user_urn(&self) -> Option<Urn> {
        self.row.lock().await.li_other_user_urn.clone()
    }

    pub async fn is_group_chat(&self) -> bool {
        self.row.lock().await.li_is_group_chat
    }

    pub async fn receiver_urn(&self) -> Option<Urn> {
        self.row.lock().await.li_receiver_urn.clone()
    }

    pub fn is_backfilling(&self) -> bool {
        self.backfilling.load(Ordering::Relaxed)
    }

    async fn save(&self, bridge: &Bridge) -> Result<()> {
        let row = self.row.lock().await.clone();
        portals::save(&bridge.db.pool, &row).await?;
        Ok(())
    }

    /// The intent that owns this room: the DM counterpart's ghost, or the
    /// bridge bot for group chats.
    pub async fn main_intent(&self, bridge: &Arc<Bridge>) -> Intent {
        let (is_group, other) = {
            let row = self.row.lock().await;
            (row.li_is_group_chat, row.li_other_user_urn.clone())
        };
        if !is_group {
            if let Some(other) = other {
                if let Ok(Some(puppet)) = bridge.get_puppet_by_urn(&other, true).await {
                    return puppet.default_intent(bridge);
                }
            }
        }
        bridge.appservice.bot_intent()
    }

    // ── Dedup machinery ──────────────────────────────────────────────────────

    /// Push `key` into the recent queue; returns true when it was already
    /// present (the event is an echo or replay).
    pub(crate) async fn dedup_check_and_push(&self, key: &str) -> bool {
        let mut dedup = self.dedup.lock().await;
        if dedup.iter().any(|k| k == key) {
            return true;
        }
        if dedup.len() >= DEDUP_CAPACITY {
            dedup.pop_front();
        }
        dedup.push_back(key.to_owned());
        false
    }

    /// Record an outbound URN so its realtime echo is suppressed. Must be
    /// called while holding the sender's send lock.
    async fn dedup_push(&self, key: &str) {
        let mut dedup = self.dedup.lock().await;
        if dedup.len() >= DEDUP_CAPACITY {
            dedup.pop_front();
        }
        dedup.push_back(key.to_owned());
    }

    async fn send_lock(&self, sender: &Urn) -> Arc<Mutex<()>> {
        self.send_locks
            .lock()
            .await
            .entry(sender.id_str())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn reaction_dedup_key(message_urn: &Urn, sender: &Urn, emoji: &str) -> String {
        format!(
            "urn:li-reaction:({},{},{emoji})",
            message_urn.id_str(),
            sender.id_str()
        )
    }

    // ── Chat info updating ───────────────────────────────────────────────────

    /// Refresh participants, name, topic, and avatar from a conversation
    /// snapshot. Set-flags keep repeated runs from thrashing Matrix state.
    pub async fn update_info(
        &self,
        bridge: &Arc<Bridge>,
        source: &User,
        conversation: &Conversation,
    ) -> Result<()> {
        if let Some(entity_urn) = &conversation.entity_urn {
            if entity_urn != &self.li_thread_urn {
                warn!(
                    "Got different thread ({entity_urn}) than expected ({}) when updating info",
                    self.li_thread_urn
                );
            }
        }

        let receiver = self.receiver_urn().await;
        let mut changed = false;

        {
            let mut row = self.row.lock().await;
            if row.li_is_group_chat != conversation.group_chat {
                row.li_is_group_chat = conversation.group_chat;
                changed = true;
            }
        }

        // Sync participant puppets; work out the DM counterpart.
        let mut others = Vec::new();
        let mut other_occupation = None;
        for participant in &conversation.participants {
            let Some(member) = &participant.messaging_member else { continue };
            let Some(urn) = participant.member_urn().cloned() else {
                debug!("Participant without entity urn in {}", self.li_thread_urn);
                continue;
            };
            if Some(&urn) != receiver.as_ref() {
                others.push(urn.clone());
                other_occupation = member
                    .mini_profile
                    .as_ref()
                    .and_then(|p| p.occupation.clone())
                    .or(other_occupation);
            }
            if let Some(puppet) = bridge.get_puppet_by_urn(&urn, true).await? {
                puppet.update_info(bridge, source, member, true).await?;
            }
        }

        if !conversation.group_chat {
            if let [other] = others.as_slice() {
                let mut row = self.row.lock().await;
                if row.li_other_user_urn.as_ref() != Some(other) {
                    row.li_other_user_urn = Some(other.clone());
                    changed = true;
                }
                if bridge.config.bridge.set_topic_on_dms {
                    if let Some(occupation) = other_occupation.filter(|o| !o.is_empty()) {
                        if row.topic.as_deref() != Some(occupation.as_str()) {
                            row.topic = Some(occupation);
                            row.topic_set = false;
                            changed = true;
                        }
                    }
                }
            }
        } else {
            let mut row = self.row.lock().await;
            if row.li_other_user_urn.is_some() {
                row.li_other_user_urn = None;
                changed = true;
            }
        }

        changed |= self.update_name(bridge, conversation).await?;
        changed |= self.update_topic(bridge).await?;
        changed |= self.update_avatar(bridge).await?;
        self.sync_group_participants(bridge, &others).await;

        if changed {
            self.save(bridge).await?;
        }
        Ok(())
    }

    async fn update_name(
        &self,
        bridge: &Arc<Bridge>,
        conversation: &Conversation,
    ) -> Result<bool> {
        if !conversation.group_chat || conversation.name.is_empty() {
            return Ok(false);
        }
        let (mxid, needs_update) = {
            let row = self.row.lock().await;
            let needs = row.name.as_deref() != Some(conversation.name.as_str()) || !row.name_set;
            (row.mxid.clone(), needs)
        };
        if !needs_update {
            return Ok(false);
        }
        self.row.lock().await.name = Some(conversation.name.clone());
        if let Some(room_id) = mxid {
            let result = self
                .main_intent(bridge)
                .await
                .send_state_event(&room_id, "m.room.name", "", &json!({"name": conversation.name}))
                .await;
            self.row.lock().await.name_set = result.is_ok();
            if let Err(e) = result {
                warn!("Failed to set room name for {room_id}: {e}");
            }
        }
        Ok(true)
    }

    /// DM topics mirror the counterpart's occupation; `update_info` fills
    /// `row.topic` from the conversation snapshot.
    async fn update_topic(&self, bridge: &Arc<Bridge>) -> Result<bool> {
        if !bridge.config.bridge.set_topic_on_dms || self.is_group_chat().await {
            return Ok(false);
        }
        let (mxid, topic, topic_set) = {
            let row = self.row.lock().await;
            (row.mxid.clone(), row.topic.clone(), row.topic_set)
        };
        let Some(topic) = topic else { return Ok(false) };
        if topic_set {
            return Ok(false);
        }
        if let Some(room_id) = mxid {
            let result = self
                .main_intent(bridge)
                .await
                .send_state_event(&room_id, mx::EVENT_TOPIC, "", &json!({"topic": topic}))
                .await;
            self.row.lock().await.topic_set = result.is_ok();
            return Ok(true);
        }
        Ok(false)
    }

    /// DM rooms take the counterpart's profile photo as the room avatar.
    async fn update_avatar(&self, bridge: &Arc<Bridge>) -> Result<bool> {
        if self.is_group_chat().await {
            return Ok(false);
        }
        let Some(other) = self.other_user_urn().await else { return Ok(false) };
        let Some(puppet) = bridge.get_puppet_by_urn(&other, false).await? else {
            return Ok(false);
        };
        let puppet_row = puppet.row().await;
        let (mxid, changed) = {
            let mut row = self.row.lock().await;
            let changed = row.photo_id != puppet_row.photo_id || !row.avatar_set;
            if changed {
                row.photo_id = puppet_row.photo_id.clone();
                row.avatar_url = puppet_row.photo_mxc.clone();
            }
            (row.mxid.clone(), changed)
        };
        if !changed {
            return Ok(false);
        }
        if let (Some(room_id), Some(avatar_url)) = (mxid, puppet_row.photo_mxc) {
            let result = self
                .main_intent(bridge)
                .await
                .send_state_event(&room_id, mx::EVENT_AVATAR, "", &json!({"url": avatar_url}))
                .await;
            self.row.lock().await.avatar_set = result.is_ok();
        }
        Ok(true)
    }

    /// Join participant ghosts to group-chat rooms.
    async fn sync_group_participants(&self, bridge: &Arc<Bridge>, others: &[Urn]) {
        if !self.is_group_chat().await {
            return;
        }
        let Some(room_id) = self.mxid().await else { return };
        let bot = bridge.appservice.bot_intent();
        for urn in others {
            let Ok(Some(puppet)) = bridge.get_puppet_by_urn(urn, true).await else { continue };
            if let Err(e) = puppet
                .default_intent(bridge)
                .ensure_joined(&room_id, Some(&bot))
                .await
            {
                warn!("Failed to join {} to {room_id}: {e}", puppet.default_mxid);
            }
        }
    }

    // ── Matrix room creation ─────────────────────────────────────────────────

    /// Create the Matrix room if needed, else refresh it. Errors are logged;
    /// the portal stays roomless and the next event retries.
    pub async fn create_matrix_room(
        &self,
        bridge: &Arc<Bridge>,
        source: &User,
        conversation: Option<&Conversation>,
    ) -> Option<String> {
        if let Some(mxid) = self.mxid().await {
            if let Err(e) = self.update_matrix_room(bridge, source, conversation).await {
                warn!("Failed to update portal {}: {e:#}", self.li_thread_urn);
            }
            return Some(mxid);
        }

        let _guard = self.create_room_lock.lock().await;
        if let Some(mxid) = self.mxid().await {
            return Some(mxid);
        }
        match self.create_matrix_room_locked(bridge, source, conversation).await {
            Ok(mxid) => Some(mxid),
            Err(e) => {
                warn!("Failed to create portal room for {}: {e:#}", self.li_thread_urn);
                None
            }
        }
    }

    async fn update_matrix_room(
        &self,
        bridge: &Arc<Bridge>,
        source: &User,
        conversation: Option<&Conversation>,
    ) -> Result<()> {
        let room_id = self.mxid().await.context("no room")?;
        let main_intent = self.main_intent(bridge).await;
        let invite = MemberContent {
            membership: mx::MEMBERSHIP_INVITE.to_owned(),
            will_auto_accept: Some(true),
            ..Default::default()
        };
        if let Err(e) = main_intent
            .invite_user_with_content(&room_id, &source.mxid, &invite)
            .await
        {
            if !e.is_forbidden() {
                debug!("Failed to re-invite {} to {room_id}: {e}", source.mxid);
            }
        }
        if let Some(puppet) = bridge.get_puppet_by_custom_mxid(&source.mxid).await? {
            if let Some(intent) = puppet.custom_intent(bridge).await {
                let _ = intent.ensure_joined(&room_id, Some(&bridge.appservice.bot_intent())).await;
            }
        }
        if let Some(conversation) = conversation {
            self.update_info(bridge, source, conversation).await?;
            self.backfill(bridge, source, false, Some(conversation)).await;
        }
        Ok(())
    }

    fn bridge_info_state_key(&self) -> String {
        format!("com.github.linkedin://linkedin/{}", self.li_thread_urn.id_str())
    }

    async fn bridge_info(&self, bridge: &Arc<Bridge>) -> BridgeInfoContent {
        let row = self.row.lock().await;
        BridgeInfoContent {
            bridgebot: bridge.appservice.bot_mxid.clone(),
            creator: bridge.appservice.bot_mxid.clone(),
            protocol: BridgeInfoSection {
                id: "linkedin".to_owned(),
                displayname: Some("LinkedIn Messages".to_owned()),
                avatar_url: if bridge.config.appservice.bot_avatar.is_empty() {
                    None
                } else {
                    Some(bridge.config.appservice.bot_avatar.clone())
                },
            },
            channel: BridgeInfoSection {
                id: self.li_thread_urn.id_str(),
                displayname: row.name.clone(),
                avatar_url: row.avatar_url.clone(),
            },
        }
    }

    async fn create_matrix_room_locked(
        &self,
        bridge: &Arc<Bridge>,
        source: &User,
        conversation: Option<&Conversation>,
    ) -> Result<String> {
        debug!("Creating Matrix room for {}", self.li_thread_urn);

        if let Some(conversation) = conversation {
            self.update_info(bridge, source, conversation).await?;
        }

        let bridge_info = serde_json::to_value(self.bridge_info(bridge).await)?;
        let mut initial_state = vec![
            InitialStateEvent {
                event_type: mx::EVENT_BRIDGE.to_owned(),
                state_key: self.bridge_info_state_key(),
                content: bridge_info.clone(),
            },
            // Kept alongside the official type for older clients.
            InitialStateEvent {
                event_type: mx::EVENT_HALF_SHOT_BRIDGE.to_owned(),
                state_key: self.bridge_info_state_key(),
                content: bridge_info,
            },
        ];

        let encrypt =
            bridge.config.bridge.encryption.default && bridge.config.bridge.encryption.allow;
        if encrypt {
            self.row.lock().await.encrypted = true;
            initial_state.push(InitialStateEvent {
                event_type: mx::EVENT_ENCRYPTION.to_owned(),
                state_key: String::new(),
                content: json!({"algorithm": "m.megolm.v1.aes-sha2"}),
            });
        }

        let row = self.row.lock().await.clone();
        if let Some(topic) = &row.topic {
            initial_state.push(InitialStateEvent {
                event_type: mx::EVENT_TOPIC.to_owned(),
                state_key: String::new(),
                content: json!({"topic": topic}),
            });
        }
        if let Some(avatar_url) = &row.avatar_url {
            initial_state.push(InitialStateEvent {
                event_type: mx::EVENT_AVATAR.to_owned(),
                state_key: String::new(),
                content: json!({"url": avatar_url}),
            });
        }

        let main_intent = self.main_intent(bridge).await;

        // Ad/auto-message DMs get replies disabled from the start.
        let is_ad_dm = !row.li_is_group_chat
            && row
                .li_other_user_urn
                .as_ref()
                .is_some_and(|urn| urn.id_str() == UNKNOWN_PARTICIPANT);
        let power_override = is_ad_dm.then(|| PowerLevelsContent {
            users: HashMap::from([(main_intent.user_id().to_owned(), 100)]),
            events_default: 50,
            state_default: 50,
            ban: 50,
            kick: 50,
            redact: 50,
            invite: 50,
            ..Default::default()
        });

        let request = CreateRoomRequest {
            name: row.li_is_group_chat.then(|| row.name.clone()).flatten(),
            is_direct: !row.li_is_group_chat,
            preset: Some("private_chat".to_owned()),
            initial_state,
            power_level_content_override: power_override,
            ..Default::default()
        };
        let room_id = main_intent.create_room(&request).await?;
        info!("Matrix room created for {}: {room_id}", self.li_thread_urn);

        self.row.lock().await.mxid = Some(room_id.clone());
        self.save(bridge).await?;
        bridge.index_portal_mxid(&self.key, &room_id).await;

        if encrypt {
            if let Err(e) = bridge.appservice.bot_intent().ensure_joined(&room_id, None).await {
                warn!("Failed to add bridge bot to encrypted room {room_id}: {e}");
            }
        }

        if !row.li_is_group_chat && bridge.config.bridge.invite_own_puppet_to_pm {
            if let Some(receiver) = &row.li_receiver_urn {
                if let Ok(Some(own_puppet)) = bridge.get_puppet_by_urn(receiver, true).await {
                    let _ = own_puppet
                        .default_intent(bridge)
                        .ensure_joined(&room_id, Some(&bridge.appservice.bot_intent()))
                        .await;
                }
            }
        }

        // Invite the owning user with auto-accept, then join their double
        // puppet if one is attached.
        let invite = MemberContent {
            membership: mx::MEMBERSHIP_INVITE.to_owned(),
            will_auto_accept: Some(true),
            ..Default::default()
        };
        main_intent
            .invite_user_with_content(&room_id, &source.mxid, &invite)
            .await?;
        if let Some(puppet) = bridge.get_puppet_by_custom_mxid(&source.mxid).await? {
            if let Some(intent) = puppet.custom_intent(bridge).await {
                match intent.join_room(&room_id).await {
                    Ok(()) => {
                        if !row.li_is_group_chat {
                            let _ = intent
                                .add_direct_chat(main_intent.user_id(), &room_id)
                                .await;
                        }
                    }
                    Err(e) => debug!("Double puppet failed to join {room_id}: {e}"),
                }
            }
        }

        if let Some(space) = source.space_mxid().await {
            if let Err(e) = bridge
                .appservice
                .bot_intent()
                .add_space_child(&space, &room_id, &bridge.appservice.domain)
                .await
            {
                warn!("Failed to add {room_id} to space {space}: {e}");
            }
        }

        self.backfill(bridge, source, true, conversation).await;

        Ok(room_id)
    }

    // ── Backfill ─────────────────────────────────────────────────────────────

    /// Backfill decision table; failures never abort the portal.
    pub async fn backfill(
        &self,
        bridge: &Arc<Bridge>,
        source: &User,
        is_initial: bool,
        conversation: Option<&Conversation>,
    ) {
        let limit = if is_initial {
            bridge.config.bridge.backfill.initial_limit
        } else {
            bridge.config.bridge.backfill.missed_limit
        };
        if limit == 0 {
            return;
        }

        let (Some(receiver), Some(_)) = (self.receiver_urn().await, source.client().await) else {
            return;
        };
        let watermark = match messages::get_most_recent(
            &bridge.db.pool,
            &self.li_thread_urn,
            &receiver,
        )
        .await
        {
            Ok(watermark) => watermark,
            Err(e) => {
                warn!("Failed to load backfill watermark: {e}");
                return;
            }
        };

        let already_bridged = watermark.is_some();
        if already_bridged && is_initial {
            return;
        }
        if !already_bridged && !is_initial {
            return;
        }
        if !is_initial {
            let last_activity = conversation.and_then(|c| c.last_activity_at);
            if let (Some(last_activity), Some(watermark)) = (last_activity, &watermark) {
                if last_activity <= watermark.timestamp {
                    return;
                }
            }
        }

        if let Err(e) = self
            .run_backfill(bridge, source, limit, watermark.map(|m| m.timestamp), conversation)
            .await
        {
            warn!("Backfill for {} failed: {e:#}", self.li_thread_urn);
        }
    }

    /// Fetch pages newest-first, window them, and replay oldest-first with
    /// the backfill lock held.
    async fn run_backfill(
        &self,
        bridge: &Arc<Bridge>,
        source: &User,
        limit: i64,
        after_timestamp: Option<i64>,
        conversation: Option<&Conversation>,
    ) -> Result<()> {
        let client = source.client().await.context("not logged in")?;
        let now = chrono::Utc::now().timestamp_millis();

        let _backfill_guard = self.backfill_lock.lock().await;
        self.backfilling.store(true, Ordering::Relaxed);
        let notifications = NotificationDisabler::start(bridge, source, self).await;

        let result = self
            .collect_and_replay(bridge, source, &client, limit, after_timestamp, now)
            .await;

        notifications.end(bridge).await;
        self.backfilling.store(false, Ordering::Relaxed);

        let replayed = result?;
        info!("Backfilled {replayed} messages into {}", self.li_thread_urn);

        self.place_post_backfill_read_marker(bridge, source, conversation).await;
        Ok(())
    }

    async fn collect_and_replay(
        &self,
        bridge: &Arc<Bridge>,
        source: &User,
        client: &Arc<LinkedInClient>,
        limit: i64,
        after_timestamp: Option<i64>,
        now: i64,
    ) -> Result<usize> {
        let mut collected: Vec<ConversationEvent> = Vec::new();
        let mut before = now;
        loop {
            let page = client
                .get_conversation_events(&self.li_thread_urn, before)
                .await?;
            let batch = page.elements;
            let short = batch.len() < lima_linkedin::client::PAGE_SIZE;
            let oldest = batch.iter().filter_map(|e| e.created_at).min();
            collected.extend(batch);

            let Some(oldest) = oldest else { break };
            if short {
                break;
            }
            if let Some(after) = after_timestamp {
                if oldest <= after {
                    break;
                }
            }
            before = oldest;
        }

        // Window to (after, now], oldest first, then keep the newest `limit`.
        collected.retain(|event| {
            event
                .created_at
                .map(|ts| ts <= now && after_timestamp.is_none_or(|after| ts > after))
                .unwrap_or(false)
        });
        collected.sort_by_key(|event| event.created_at);
        collected.dedup_by_key(|event| event.entity_urn.as_ref().map(Urn::id_str));
        if limit > 0 && collected.len() > limit as usize {
            let excess = collected.len() - limit as usize;
            collected.drain(..excess);
        }

        let replayed = collected.len();
        for event in collected {
            self.handle_linkedin_message_locked(bridge, source, event).await;
        }
        Ok(replayed)
    }

    /// If the conversation was unread and recent, mirror that by placing a
    /// read marker on the latest bridged item.
    async fn place_post_backfill_read_marker(
        &self,
        bridge: &Arc<Bridge>,
        source: &User,
        conversation: Option<&Conversation>,
    ) {
        let Some(conversation) = conversation else { return };
        if conversation.read != Some(false) {
            return;
        }
        let threshold_ms = bridge.config.bridge.backfill.unread_hours_threshold * 3_600_000;
        let age = conversation
            .last_activity_at
            .map(|ts| chrono::Utc::now().timestamp_millis() - ts);
        if age.is_some_and(|age| age <= threshold_ms) {
            self.handle_linkedin_read(bridge, source).await;
        }
    }

    // ── Inbound LinkedIn messages ────────────────────────────────────────────

    /// Entry point for live realtime messages; blocks while a backfill holds
    /// the lock so history lands first.
    pub async fn handle_linkedin_message(
        &self,
        bridge: &Arc<Bridge>,
        source: &User,
        event: ConversationEvent,
    ) {
        let _ordering_guard = self.backfill_lock.lock().await;
        self.handle_linkedin_message_locked(bridge, source, event).await;
    }

    async fn handle_linkedin_message_locked(
        &self,
        bridge: &Arc<Bridge>,
        source: &User,
        event: ConversationEvent,
    ) {
        if let Err(e) = self.try_handle_linkedin_message(bridge, source, event).await {
            warn!("Failed to handle LinkedIn message in {}: {e:#}", self.li_thread_urn);
        }
    }

    async fn try_handle_linkedin_message(
        &self,
        bridge: &Arc<Bridge>,
        source: &User,
        event: ConversationEvent,
    ) -> Result<()> {
        let Some(entity_urn) = event.entity_urn.clone() else {
            debug!("Dropping message event without entity urn");
            return Ok(());
        };
        let message_urn = Urn::new(entity_urn.last_part());
        let receiver = self.receiver_urn().await.context("portal has no receiver")?;
        let sender_urn = event
            .sender_urn()
            .cloned()
            .unwrap_or_else(|| Urn::new(UNKNOWN_PARTICIPANT));

        let send_lock = self.send_lock(&sender_urn).await;
        let _send_guard = send_lock.lock().await;

        if self.dedup_check_and_push(&entity_urn.id_str()).await {
            debug!("Deduplicated message {entity_urn}");
            return Ok(());
        }

        let message_event = event.message_event().cloned();

        // Recalls arrive as message events with recalled_at set.
        if message_event.as_ref().is_some_and(|m| m.recalled_at.is_some()) {
            return self
                .handle_linkedin_recall(bridge, &message_urn, &receiver, &sender_urn)
                .await;
        }

        let existing = messages::get_all_by_urn(&bridge.db.pool, &message_urn, &receiver).await?;

        if message_event.as_ref().is_some_and(|m| m.last_edited_at.is_some())
            && !existing.is_empty()
        {
            return self
                .handle_linkedin_edit(
                    bridge,
                    source,
                    &sender_urn,
                    &message_urn,
                    &receiver,
                    existing,
                    message_event.as_ref().unwrap(),
                )
                .await;
        }

        if !existing.is_empty() {
            // Reactions may still arrive after the message itself was seen.
            self.handle_reaction_summaries(
                bridge,
                source,
                &message_urn,
                &receiver,
                &event.reaction_summaries,
            )
            .await;
            return Ok(());
        }

        // Own-message echo in a DM where the own ghost has no seat: drop.
        if sender_urn == receiver
            && !self.is_group_chat().await
            && !bridge.config.bridge.invite_own_puppet_to_pm
        {
            let own_double_puppet = bridge
                .get_puppet_by_custom_mxid(&source.mxid)
                .await?
                .is_some();
            if !own_double_puppet {
                warn!(
                    "Dropping self-sent message {message_urn}: own puppet not in room and \
                     inviting it is disabled"
                );
                return Ok(());
            }
        }

        let Some(puppet) = bridge.get_puppet_by_urn(&sender_urn, true).await? else {
            return Ok(());
        };
        if let Some(member) = event.from.as_ref().and_then(|f| f.messaging_member.as_ref()) {
            puppet.update_info(bridge, source, member, true).await?;
        }
        puppet.ensure_registered(bridge).await?;

        let room_id = self.mxid().await.context("portal has no room")?;
        let intent = puppet.intent_for(bridge, self).await;
        let timestamp = event.created_at.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        let Some(message_event) = message_event else {
            debug!("Event {entity_urn} has no message content");
            return Ok(());
        };

        // Conversation renames come in as custom content.
        if let Some(rename) = message_event
            .custom_content
            .as_ref()
            .and_then(|c| c.conversation_name_update.as_ref())
        {
            let mut conversation = Conversation::default();
            conversation.group_chat = true;
            conversation.name = rename.new_name.clone();
            self.update_name(bridge, &conversation).await?;
            self.save(bridge).await?;
            return Ok(());
        }

        let contents = self
            .render_message_event(bridge, source, &message_event)
            .await;
        if contents.is_empty() {
            debug!("Message {message_urn} rendered no Matrix events");
            return Ok(());
        }

        let is_spinmail = message_event
            .custom_content
            .as_ref()
            .is_some_and(|c| c.sp_inmail_content.is_some());

        let mut rows = Vec::new();
        for (index, content) in contents.iter().enumerate() {
            let content_value = serde_json::to_value(content)?;
            let event_id = intent
                .send_message_event(&room_id, mx::EVENT_MESSAGE, &content_value)
                .await?;
            rows.push(MessageRow {
                mxid: event_id,
                mx_room: room_id.clone(),
                li_message_urn: message_urn.clone(),
                index: index as i32,
                li_thread_urn: self.li_thread_urn.clone(),
                li_receiver_urn: receiver.clone(),
                li_sender_urn: sender_urn.clone(),
                timestamp,
            });
        }
        messages::bulk_create(&bridge.db.pool, &rows).await?;

        if is_spinmail {
            self.disable_replies(bridge).await;
        }

        self.handle_reaction_summaries(
            bridge,
            source,
            &message_urn,
            &receiver,
            &event.reaction_summaries,
        )
        .await;
        Ok(())
    }

    /// Translate one LinkedIn message into its ordered list of Matrix
    /// contents: subject, attachments, media, third-party media, body, feed
    /// update.
    async fn render_message_event(
        &self,
        bridge: &Arc<Bridge>,
        source: &User,
        message: &MessageEvent,
    ) -> Vec<MessageContent> {
        let mut contents = Vec::new();

        if let Some(subject) = message.subject.as_deref().filter(|s| !s.is_empty()) {
            contents.push(linkedin_subject_to_matrix(subject));
        }

        for attachment in &message.attachments {
            match self.reupload_attachment(bridge, source, attachment).await {
                Ok(content) => contents.push(content),
                Err(e) => {
                    warn!("Failed to bridge attachment {:?}: {e:#}", attachment.name);
                    contents.push(MessageContent::notice(format!(
                        "Failed to bridge attachment {}",
                        attachment.name
                    )));
                }
            }
        }

        for media in &message.media_attachments {
            if let Some(audio) = &media.audio_metadata {
                match self
                    .reupload_url(bridge, source, &audio.url, "voice_message", "audio/mp4")
                    .await
                {
                    Ok((mxc, size)) => {
                        let mut content = MessageContent {
                            msgtype: mx::MSGTYPE_AUDIO.to_owned(),
                            body: "Voice message".to_owned(),
                            url: Some(mxc),
                            ..Default::default()
                        };
                        content.info = Some(mx::MediaInfo {
                            mimetype: Some("audio/mp4".to_owned()),
                            size: Some(size),
                            duration: Some(audio.duration),
                            ..Default::default()
                        });
                        contents.push(content);
                    }
                    Err(e) => {
                        warn!("Failed to bridge audio message: {e:#}");
                        contents.push(MessageContent::notice("Failed to bridge voice message"));
                    }
                }
            } else {
                contents.push(MessageContent::notice(format!(
                    "Unsupported media attachment type {}",
                    media.media_type
                )));
            }
        }

        if let Some(third_party) = message
            .custom_content
            .as_ref()
            .and_then(|c| c.third_party_media.as_ref())
        {
            if let Some(gif) = third_party.media.as_ref().and_then(|m| m.gif.as_ref()) {
                match self
                    .reupload_url(bridge, source, &gif.url, "tenor.gif", "image/gif")
                    .await
                {
                    Ok((mxc, size)) => {
                        let mut content = MessageContent {
                            msgtype: mx::MSGTYPE_IMAGE.to_owned(),
                            body: if third_party.title.is_empty() {
                                "GIF".to_owned()
                            } else {
                                third_party.title.clone()
                            },
                            url: Some(mxc),
                            ..Default::default()
                        };
                        content.info = Some(mx::MediaInfo {
                            mimetype: Some("image/gif".to_owned()),
                            size: Some(size),
                            w: Some(gif.original_width),
                            h: Some(gif.original_height),
                            ..Default::default()
                        });
                        contents.push(content);
                    }
                    Err(e) => warn!("Failed to bridge third-party media: {e:#}"),
                }
            }
        }

        if let Some(spinmail) = message
            .custom_content
            .as_ref()
            .and_then(|c| c.sp_inmail_content.as_ref())
        {
            let mut content = linkedin_spinmail_to_matrix(spinmail);
            content.msgtype = mx::MSGTYPE_NOTICE.to_owned();
            contents.push(content);
        } else if let Some(body) = &message.attributed_body {
            if !body.text.is_empty() {
                contents.push(linkedin_to_matrix(bridge, body).await);
            }
        } else if !message.body.is_empty() {
            contents.push(MessageContent::text(message.body.clone()));
        }

        if let Some(feed_update) = &message.feed_update {
            if let Some(content) = linkedin_feed_update_to_matrix(feed_update) {
                contents.push(content);
            }
        }

        contents
    }

    async fn reupload_attachment(
        &self,
        bridge: &Arc<Bridge>,
        source: &User,
        attachment: &MessageAttachment,
    ) -> Result<MessageContent> {
        let url = attachment
            .reference
            .as_ref()
            .map(|r| r.string.clone())
            .filter(|u| !u.is_empty())
            .context("attachment has no reference url")?;
        let client = source.client().await.context("not logged in")?;
        let data = client.download_media(&url).await?;
        let size = data.len() as u64;
        let mime = if attachment.media_type.is_empty() {
            sniff_image_mime(&data).to_owned()
        } else {
            attachment.media_type.clone()
        };
        let intent = self.main_intent(bridge).await;
        let mxc = intent.upload_media(data, &mime, &attachment.name).await?;

        let msgtype = if mime.starts_with("image/") {
            mx::MSGTYPE_IMAGE
        } else if mime.starts_with("video/") {
            mx::MSGTYPE_VIDEO
        } else if mime.starts_with("audio/") {
            mx::MSGTYPE_AUDIO
        } else {
            mx::MSGTYPE_FILE
        };
        Ok(MessageContent {
            msgtype: msgtype.to_owned(),
            body: attachment.name.clone(),
            url: Some(mxc),
            info: Some(mx::MediaInfo {
                mimetype: Some(mime),
                size: Some(size),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn reupload_url(
        &self,
        bridge: &Arc<Bridge>,
        source: &User,
        url: &str,
        filename: &str,
        mime: &str,
    ) -> Result<(String, u64)> {
        let client = source.client().await.context("not logged in")?;
        let data = client.download_media(url).await?;
        let size = data.len() as u64;
        let intent = self.main_intent(bridge).await;
        let mxc = intent.upload_media(data, mime, filename).await?;
        Ok((mxc, size))
    }

    /// Raise `events_default` above the user's level so replies are
    /// impossible (ad DMs and sponsored InMail).
    async fn disable_replies(&self, bridge: &Arc<Bridge>) {
        let Some(room_id) = self.mxid().await else { return };
        let intent = self.main_intent(bridge).await;
        let mut levels = match intent.get_power_levels(&room_id).await {
            Ok(levels) => levels,
            Err(e) => {
                warn!("Failed to fetch power levels for {room_id}: {e}");
                PowerLevelsContent::default()
            }
        };
        if levels.events_default >= 50 {
            return;
        }
        levels.events_default = 50;
        levels.users.insert(intent.user_id().to_owned(), 100);
        if let Err(e) = intent.set_power_levels(&room_id, &levels).await {
            warn!("Failed to disable replies in {room_id}: {e}");
        }
    }

    // ── Edits & recalls ──────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn handle_linkedin_edit(
        &self,
        bridge: &Arc<Bridge>,
        source: &User,
        sender_urn: &Urn,
        message_urn: &Urn,
        receiver: &Urn,
        mut existing: Vec<MessageRow>,
        message: &MessageEvent,
    ) -> Result<()> {
        let room_id = self.mxid().await.context("portal has no room")?;
        existing.sort_by_key(|row| row.index);

        let Some(puppet) = bridge.get_puppet_by_urn(sender_urn, true).await? else {
            return Ok(());
        };
        let intent = puppet.intent_for(bridge, self).await;
        let new_contents = self.render_message_event(bridge, source, message).await;
        let timestamp = message.last_edited_at.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        let paired = existing.len().min(new_contents.len());

        // Edit each surviving pair in place.
        for (row, content) in existing.iter().zip(new_contents.iter()).take(paired) {
            let edit = content.clone().into_edit_of(&row.mxid);
            let edit_value = serde_json::to_value(&edit)?;
            if let Err(e) = intent
                .send_message_event(&room_id, mx::EVENT_MESSAGE, &edit_value)
                .await
            {
                warn!("Failed to send edit for {}: {e}", row.mxid);
            }
        }

        // Redact old events that have no new counterpart.
        for row in existing.iter().skip(paired) {
            if let Err(e) = self.redact_with_fallback(bridge, &intent, &room_id, &row.mxid).await {
                warn!("Failed to redact {} during edit: {e}", row.mxid);
            }
        }

        // Send brand-new parts the edit added.
        let mut rows: Vec<MessageRow> = existing.iter().take(paired).cloned().collect();
        for (offset, content) in new_contents.iter().enumerate().skip(paired) {
            let content_value = serde_json::to_value(content)?;
            let event_id = intent
                .send_message_event(&room_id, mx::EVENT_MESSAGE, &content_value)
                .await?;
            rows.push(MessageRow {
                mxid: event_id,
                mx_room: room_id.clone(),
                li_message_urn: message_urn.clone(),
                index: offset as i32,
                li_thread_urn: self.li_thread_urn.clone(),
                li_receiver_urn: receiver.clone(),
                li_sender_urn: sender_urn.clone(),
                timestamp,
            });
        }

        for (index, row) in rows.iter_mut().enumerate() {
            row.index = index as i32;
            row.timestamp = timestamp;
        }
        messages::delete_all_by_urn(&bridge.db.pool, message_urn, receiver).await?;
        messages::bulk_create(&bridge.db.pool, &rows).await?;
        Ok(())
    }

    async fn handle_linkedin_recall(
        &self,
        bridge: &Arc<Bridge>,
        message_urn: &Urn,
        receiver: &Urn,
        sender_urn: &Urn,
    ) -> Result<()> {
        let rows = messages::get_all_by_urn(&bridge.db.pool, message_urn, receiver).await?;
        if rows.is_empty() {
            return Ok(());
        }
        let room_id = self.mxid().await.context("portal has no room")?;
        let sender_intent = match bridge.get_puppet_by_urn(sender_urn, true).await? {
            Some(puppet) => puppet.intent_for(bridge, self).await,
            None => self.main_intent(bridge).await,
        };
        for row in &rows {
            if let Err(e) = self
                .redact_with_fallback(bridge, &sender_intent, &room_id, &row.mxid)
                .await
            {
                warn!("Failed to redact recalled event {}: {e}", row.mxid);
            }
        }
        messages::delete_all_by_urn(&bridge.db.pool, message_urn, receiver).await?;
        reactions::delete_all_by_message(&bridge.db.pool, message_urn, receiver).await?;
        info!("Recalled message {message_urn} in {room_id}");
        Ok(())
    }

    /// Redact as the sender, falling back to the main intent when the sender
    /// lacks permission.
    async fn redact_with_fallback(
        &self,
        bridge: &Arc<Bridge>,
        intent: &Intent,
        room_id: &str,
        event_id: &str,
    ) -> Result<(), MatrixError> {
        match intent.redact(room_id, event_id, None).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_forbidden() => {
                self.main_intent(bridge)
                    .await
                    .redact(room_id, event_id, None)
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    // ── Inbound reactions ────────────────────────────────────────────────────

    pub async fn handle_linkedin_reaction(
        &self,
        bridge: &Arc<Bridge>,
        source: &User,
        event: RealtimeEvent,
    ) {
        let result = self.try_handle_linkedin_reaction(bridge, source, event).await;
        if let Err(e) = result {
            warn!("Failed to handle reaction in {}: {e:#}", self.li_thread_urn);
        }
    }

    async fn try_handle_linkedin_reaction(
        &self,
        bridge: &Arc<Bridge>,
        _source: &User,
        event: RealtimeEvent,
    ) -> Result<()> {
        let added = event.reaction_added.context("not a reaction event")?;
        let actor = event.actor_mini_profile_urn.clone().context("reaction without actor")?;
        let emoji = event
            .reaction_summary
            .as_ref()
            .map(|s| s.emoji.clone())
            .filter(|e| !e.is_empty())
            .context("reaction without emoji")?;
        let event_urn = event.event_urn.clone().context("reaction without event urn")?;
        let message_urn = Urn::new(event_urn.last_part());
        let receiver = self.receiver_urn().await.context("portal has no receiver")?;

        let send_lock = self.send_lock(&actor).await;
        let _guard = send_lock.lock().await;

        if added {
            self.add_linkedin_reaction(bridge, &message_urn, &receiver, &actor, &emoji)
                .await
        } else {
            self.remove_linkedin_reaction(bridge, &message_urn, &receiver, &actor, &emoji)
                .await
        }
    }

    async fn add_linkedin_reaction(
        &self,
        bridge: &Arc<Bridge>,
        message_urn: &Urn,
        receiver: &Urn,
        actor: &Urn,
        emoji: &str,
    ) -> Result<()> {
        let dedup_key = Self::reaction_dedup_key(message_urn, actor, emoji);
        if self.dedup_check_and_push(&dedup_key).await {
            return Ok(());
        }
        // Same triple twice is a no-op.
        if reactions::get_by_urn_and_emoji(&bridge.db.pool, message_urn, receiver, actor, emoji)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let rows = messages::get_all_by_urn(&bridge.db.pool, message_urn, receiver).await?;
        let target = rows.last().context("reaction to unknown message")?;

        let Some(puppet) = bridge.get_puppet_by_urn(actor, true).await? else { return Ok(()) };
        puppet.ensure_registered(bridge).await?;
        let intent = puppet.intent_for(bridge, self).await;

        let content = ReactionContent {
            relates_to: Relation {
                rel_type: Some(mx::RELATION_ANNOTATION.to_owned()),
                event_id: Some(target.mxid.clone()),
                key: Some(emoji.to_owned()),
            },
        };
        let event_id = intent
            .send_message_event(
                &target.mx_room,
                mx::EVENT_REACTION,
                &serde_json::to_value(&content)?,
            )
            .await?;

        reactions::insert(
            &bridge.db.pool,
            &ReactionRow {
                mxid: event_id,
                mx_room: target.mx_room.clone(),
                li_message_urn: message_urn.clone(),
                li_receiver_urn: receiver.clone(),
                li_sender_urn: actor.clone(),
                reaction: emoji.to_owned(),
            },
        )
        .await?;
        Ok(())
    }

    async fn remove_linkedin_reaction(
        &self,
        bridge: &Arc<Bridge>,
        message_urn: &Urn,
        receiver: &Urn,
        actor: &Urn,
        emoji: &str,
    ) -> Result<()> {
        let Some(row) =
            reactions::get_by_urn_and_emoji(&bridge.db.pool, message_urn, receiver, actor, emoji)
                .await?
        else {
            debug!("Unreaction for unknown reaction on {message_urn}");
            return Ok(());
        };

        let intent = match bridge.get_puppet_by_urn(actor, false).await? {
            Some(puppet) => puppet.intent_for(bridge, self).await,
            None => self.main_intent(bridge).await,
        };
        if let Err(e) = self
            .redact_with_fallback(bridge, &intent, &row.mx_room, &row.mxid)
            .await
        {
            warn!("Failed to redact reaction {}: {e}", row.mxid);
        }
        reactions::delete(&bridge.db.pool, &row).await?;
        Ok(())
    }

    /// Late reaction summaries on (possibly already-bridged) messages: look
    /// up the reactors per emoji and replay each as a reaction add.
    async fn handle_reaction_summaries(
        &self,
        bridge: &Arc<Bridge>,
        source: &User,
        message_urn: &Urn,
        receiver: &Urn,
        summaries: &[ReactionSummary],
    ) {
        if summaries.is_empty() {
            return;
        }
        let Some(client) = source.client().await else { return };
        for summary in summaries {
            if summary.emoji.is_empty() {
                continue;
            }
            let reactors = match client.get_reactors(message_urn, &summary.emoji).await {
                Ok(reactors) => reactors,
                Err(e) => {
                    debug!("Failed to list reactors for {message_urn}: {e}");
                    continue;
                }
            };
            for reactor in reactors.elements {
                let Some(actor) = reactor.reactor_urn.or_else(|| {
                    reactor.reactor.as_ref().and_then(|r| r.entity_urn.clone())
                }) else {
                    continue;
                };
                if let Err(e) = self
                    .add_linkedin_reaction(bridge, message_urn, receiver, &actor, &summary.emoji)
                    .await
                {
                    debug!("Failed to replay reaction summary on {message_urn}: {e:#}");
                }
            }
        }
    }

    // ── Read state ───────────────────────────────────────────────────────────

    /// The user read this conversation elsewhere; mirror via double puppet.
    pub async fn handle_linkedin_read(&self, bridge: &Arc<Bridge>, source: &User) {
        let Some(receiver) = self.receiver_urn().await else { return };
        let Ok(Some(puppet)) = bridge.get_puppet_by_custom_mxid(&source.mxid).await else {
            return;
        };
        let Some(intent) = puppet.custom_intent(bridge).await else { return };

        let latest = messages::get_most_recent(&bridge.db.pool, &self.li_thread_urn, &receiver)
            .await
            .ok()
            .flatten();
        let Some(latest) = latest else { return };

        // Prefer the newest reaction on the newest message, if any.
        let target = reactions::get_all_by_message(
            &bridge.db.pool,
            &latest.li_message_urn,
            &receiver,
        )
        .await
        .ok()
        .and_then(|rows| rows.last().map(|row| row.mxid.clone()))
        .unwrap_or_else(|| latest.mxid.clone());
        if let Err(e) = intent.mark_read(&latest.mx_room, &target).await {
            debug!("Failed to move read marker in {}: {e}", latest.mx_room);
        }
    }

    /// A remote participant started typing; mirror it as their ghost.
    pub async fn handle_linkedin_typing(&self, bridge: &Arc<Bridge>, viewer: &Urn) {
        let Some(room_id) = self.mxid().await else { return };
        let Ok(Some(puppet)) = bridge.get_puppet_by_urn(viewer, false).await else { return };
        if let Err(e) = puppet
            .default_intent(bridge)
            .set_typing(&room_id, true, 10_000)
            .await
        {
            debug!("Failed to bridge typing from {viewer}: {e}");
        }
    }

    /// A remote participant saw a message; mark it read as their ghost.
    pub async fn handle_linkedin_seen_receipt(
        &self,
        bridge: &Arc<Bridge>,
        viewer: &Urn,
        event_urn: &Urn,
        seen_at: Option<i64>,
    ) {
        let Some(receiver) = self.receiver_urn().await else { return };
        let message_urn = Urn::new(event_urn.last_part());
        let rows = match messages::get_all_by_urn(&bridge.db.pool, &message_urn, &receiver).await {
            Ok(rows) => rows,
            Err(_) => return,
        };
        let target = match rows.last().cloned() {
            Some(target) => target,
            None => {
                // The seen event itself was never bridged (outside the
                // backfill window); anchor on the newest bridged message at
                // or before the receipt timestamp instead.
                let Some(seen_at) = seen_at else { return };
                match messages::get_closest_before(
                    &bridge.db.pool,
                    &self.li_thread_urn,
                    &receiver,
                    seen_at,
                )
                .await
                {
                    Ok(Some(target)) => target,
                    _ => return,
                }
            }
        };
        let Ok(Some(puppet)) = bridge.get_puppet_by_urn(viewer, false).await else { return };
        let intent = puppet.intent_for(bridge, self).await;
        if let Err(e) = intent.mark_read(&target.mx_room, &target.mxid).await {
            debug!("Failed to bridge seen receipt from {viewer}: {e}");
        }
    }

    // ── Outbound (Matrix → LinkedIn) ─────────────────────────────────────────

    pub async fn handle_matrix_message(
        &self,
        bridge: &Arc<Bridge>,
        sender: &User,
        content: MessageContent,
        event_id: String,
    ) {
        let status = match self
            .try_handle_matrix_message(bridge, sender, &content, &event_id)
            .await
        {
            Ok(()) => CheckpointStatus::Success,
            Err(MatrixSendError::Unsupported(reason)) => {
                sender
                    .send_bridge_notice(bridge, &format!("Message not bridged: {reason}"))
                    .await;
                CheckpointStatus::Unsupported
            }
            Err(MatrixSendError::Failed(e)) => {
                warn!("Failed to bridge Matrix message {event_id}: {e:#}");
                sender
                    .send_bridge_notice(
                        bridge,
                        "Failed to send your message to LinkedIn. It was not delivered.",
                    )
                    .await;
                CheckpointStatus::PermFailure
            }
        };

        let room_id = self.mxid().await.unwrap_or_default();
        let mut checkpoint = MessageSendCheckpoint::new(&event_id, &room_id, status);
        if status != CheckpointStatus::Success {
            checkpoint = checkpoint.with_info(format!("msgtype {}", content.msgtype));
        }
        bridge.appservice.send_checkpoint(checkpoint).await;
    }

    async fn try_handle_matrix_message(
        &self,
        bridge: &Arc<Bridge>,
        sender: &User,
        content: &MessageContent,
        event_id: &str,
    ) -> Result<(), MatrixSendError> {
        let client = sender
            .client()
            .await
            .ok_or_else(|| MatrixSendError::Failed(anyhow!("user is not logged in")))?;
        let sender_urn = sender
            .li_member_urn()
            .await
            .ok_or_else(|| MatrixSendError::Failed(anyhow!("member URN unknown")))?;
        let receiver = self
            .receiver_urn()
            .await
            .ok_or_else(|| MatrixSendError::Failed(anyhow!("portal has no receiver")))?;
        let room_id = self
            .mxid()
            .await
            .ok_or_else(|| MatrixSendError::Failed(anyhow!("portal has no room")))?;

        let send_lock = self.send_lock(&sender_urn).await;
        let _guard = send_lock.lock().await;

        let message_create = match content.msgtype.as_str() {
            mx::MSGTYPE_TEXT | mx::MSGTYPE_EMOTE | mx::MSGTYPE_NOTICE => {
                matrix_to_linkedin(bridge, content, sender)
                    .await
                    .map_err(MatrixSendError::Failed)?
            }
            mx::MSGTYPE_IMAGE | mx::MSGTYPE_FILE | mx::MSGTYPE_VIDEO | mx::MSGTYPE_AUDIO => {
                if content.file.is_some() {
                    return Err(MatrixSendError::Unsupported(
                        "encrypted media requires the e2ee helper".to_owned(),
                    ));
                }
                let url = content
                    .url
                    .as_deref()
                    .ok_or_else(|| MatrixSendError::Failed(anyhow!("media without url")))?;
                let data = bridge
                    .appservice
                    .bot_intent()
                    .download_media(url)
                    .await
                    .map_err(|e| MatrixSendError::Failed(e.into()))?;
                let mime = content
                    .info
                    .as_ref()
                    .and_then(|i| i.mimetype.clone())
                    .unwrap_or_else(|| {
                        mime_guess::from_path(&content.body)
                            .first_or_octet_stream()
                            .to_string()
                    });
                let attachment = client
                    .upload_media(data, &content.body, &mime)
                    .await
                    .map_err(|e| MatrixSendError::Failed(e.into()))?;
                lima_linkedin::types::MessageCreate {
                    attributed_body: None,
                    body: String::new(),
                    attachments: vec![attachment],
                }
            }
            other => {
                return Err(MatrixSendError::Unsupported(format!(
                    "LinkedIn cannot represent {other} messages"
                )));
            }
        };

        let response = client
            .send_message(&self.li_thread_urn, &message_create)
            .await
            .map_err(|e| MatrixSendError::Failed(e.into()))?;
        let info = response
            .value
            .ok_or_else(|| MatrixSendError::Failed(anyhow!("send response carried no value")))?;
        let message_urn = info
            .event_urn
            .or(info.backend_event_urn)
            .ok_or_else(|| MatrixSendError::Failed(anyhow!("send response carried no urn")))?;

        // Record the URN before releasing the send lock so the realtime echo
        // (serialized on the same lock) is suppressed.
        self.dedup_push(&message_urn.id_str()).await;

        let row = MessageRow {
            mxid: event_id.to_owned(),
            mx_room: room_id,
            li_message_urn: Urn::new(message_urn.last_part()),
            index: 0,
            li_thread_urn: self.li_thread_urn.clone(),
            li_receiver_urn: receiver,
            li_sender_urn: sender_urn,
            timestamp: info
                .created_at
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        };
        messages::insert(&bridge.db.pool, &row)
            .await
            .map_err(|e| MatrixSendError::Failed(e.into()))?;
        Ok(())
    }

    pub async fn handle_matrix_reaction(
        &self,
        bridge: &Arc<Bridge>,
        sender: &User,
        event_id: String,
        target_event_id: String,
        emoji: String,
    ) {
        let result = self
            .try_handle_matrix_reaction(bridge, sender, &event_id, &target_event_id, &emoji)
            .await;
        let status = match &result {
            Ok(()) => CheckpointStatus::Success,
            Err(e) => {
                warn!("Failed to bridge reaction {event_id}: {e:#}");
                CheckpointStatus::PermFailure
            }
        };
        let room_id = self.mxid().await.unwrap_or_default();
        bridge
            .appservice
            .send_checkpoint(MessageSendCheckpoint::new(&event_id, &room_id, status))
            .await;
    }

    async fn try_handle_matrix_reaction(
        &self,
        bridge: &Arc<Bridge>,
        sender: &User,
        event_id: &str,
        target_event_id: &str,
        emoji: &str,
    ) -> Result<()> {
        let client = sender.client().await.context("user is not logged in")?;
        let sender_urn = sender.li_member_urn().await.context("member URN unknown")?;
        let room_id = self.mxid().await.context("portal has no room")?;
        let receiver = self.receiver_urn().await.context("portal has no receiver")?;

        let target = messages::get_by_mxid(&bridge.db.pool, target_event_id, &room_id)
            .await?
            .context("reaction to unbridged event")?;

        let send_lock = self.send_lock(&sender_urn).await;
        let _guard = send_lock.lock().await;

        client
            .add_emoji_reaction(&self.li_thread_urn, &target.li_message_urn, emoji)
            .await?;
        self.dedup_push(&Self::reaction_dedup_key(&target.li_message_urn, &sender_urn, emoji))
            .await;

        reactions::insert(
            &bridge.db.pool,
            &ReactionRow {
                mxid: event_id.to_owned(),
                mx_room: room_id,
                li_message_urn: target.li_message_urn.clone(),
                li_receiver_urn: receiver,
                li_sender_urn: sender_urn,
                reaction: emoji.to_owned(),
            },
        )
        .await?;
        Ok(())
    }

    /// A redaction maps to either a message recall or a reaction removal,
    /// depending on which row the event id belongs to.
    pub async fn handle_matrix_redaction(
        &self,
        bridge: &Arc<Bridge>,
        sender: &User,
        redacted_event_id: String,
        redaction_event_id: String,
    ) {
        let result = self
            .try_handle_matrix_redaction(bridge, sender, &redacted_event_id)
            .await;
        let status = match &result {
            Ok(()) => CheckpointStatus::Success,
            Err(e) => {
                warn!("Failed to bridge redaction of {redacted_event_id}: {e:#}");
                CheckpointStatus::PermFailure
            }
        };
        let room_id = self.mxid().await.unwrap_or_default();
        bridge
            .appservice
            .send_checkpoint(MessageSendCheckpoint::new(&redaction_event_id, &room_id, status))
            .await;
    }

    async fn try_handle_matrix_redaction(
        &self,
        bridge: &Arc<Bridge>,
        sender: &User,
        redacted_event_id: &str,
    ) -> Result<()> {
        let client = sender.client().await.context("user is not logged in")?;
        let room_id = self.mxid().await.context("portal has no room")?;
        let receiver = self.receiver_urn().await.context("portal has no receiver")?;

        if let Some(message) =
            messages::get_by_mxid(&bridge.db.pool, redacted_event_id, &room_id).await?
        {
            client
                .delete_message(&self.li_thread_urn, &message.li_message_urn)
                .await?;
            self.dedup_push(&message.li_message_urn.id_str()).await;
            messages::delete_all_by_urn(&bridge.db.pool, &message.li_message_urn, &receiver)
                .await?;
            reactions::delete_all_by_message(&bridge.db.pool, &message.li_message_urn, &receiver)
                .await?;
            return Ok(());
        }

        if let Some(reaction) =
            reactions::get_by_mxid(&bridge.db.pool, redacted_event_id, &room_id).await?
        {
            client
                .remove_emoji_reaction(
                    &self.li_thread_urn,
                    &reaction.li_message_urn,
                    &reaction.reaction,
                )
                .await?;
            self.dedup_push(&Self::reaction_dedup_key(
                &reaction.li_message_urn,
                &reaction.li_sender_urn,
                &reaction.reaction,
            ))
            .await;
            reactions::delete(&bridge.db.pool, &reaction).await?;
            return Ok(());
        }

        Err(anyhow!("redacted event is not bridged"))
    }

    pub async fn handle_matrix_typing(&self, sender: &User) {
        if let Some(client) = sender.client().await {
            if let Err(e) = client.set_typing(&self.li_thread_urn).await {
                debug!("Failed to bridge typing notification: {e}");
            }
        }
    }

    /// Leaving a DM unbridges it entirely.
    pub async fn handle_matrix_leave(&self, bridge: &Arc<Bridge>, sender: &User) {
        if self.is_group_chat().await {
            debug!("{} left group portal {}", sender.mxid, self.li_thread_urn);
            return;
        }
        info!("{} left DM {}; cleaning up", sender.mxid, self.li_thread_urn);
        if let Err(e) = self.cleanup_and_delete(bridge).await {
            warn!("Failed to clean up portal {}: {e:#}", self.li_thread_urn);
        }
    }

    /// Unregister Matrix membership and delete all rows for this portal.
    pub async fn cleanup_and_delete(&self, bridge: &Arc<Bridge>) -> Result<()> {
        if let Some(room_id) = self.mxid().await {
            messages::delete_all_by_room(&bridge.db.pool, &room_id).await?;
            reactions::delete_all_by_room(&bridge.db.pool, &room_id).await?;
            let main_intent = self.main_intent(bridge).await;
            if let Err(e) = main_intent.leave_room(&room_id).await {
                debug!("Failed to remove main intent from {room_id}: {e}");
            }
            if let Err(e) = bridge.appservice.bot_intent().leave_room(&room_id).await {
                debug!("Failed to remove bot from {room_id}: {e}");
            }
        }
        let row = self.row().await;
        portals::delete(&bridge.db.pool, &row.li_thread_urn, row.li_receiver_urn.as_ref()).await?;
        bridge.uncache_portal(&self.key, row.mxid.as_deref()).await;
        Ok(())
    }
}

enum MatrixSendError {
    Unsupported(String),
    Failed(anyhow::Error),
}

/// Suppresses push notifications for the historical batch: a `dont_notify`
/// rule on the user's own account while backfill runs.
struct NotificationDisabler {
    intent: Option<Intent>,
    room_id: Option<String>,
}

impl NotificationDisabler {
    async fn start(bridge: &Arc<Bridge>, source: &User, portal: &Portal) -> Self {
        let inactive = Self { intent: None, room_id: None };
        if !bridge.config.bridge.backfill.disable_notifications {
            return inactive;
        }
        let Some(room_id) = portal.mxid().await else { return inactive };
        let Ok(Some(puppet)) = bridge.get_puppet_by_custom_mxid(&source.mxid).await else {
            return inactive;
        };
        let Some(intent) = puppet.custom_intent(bridge).await else { return inactive };
        if let Err(e) = intent.put_dont_notify_rule(&room_id).await {
            debug!("Failed to disable notifications for backfill: {e}");
            return inactive;
        }
        Self { intent: Some(intent), room_id: Some(room_id) }
    }

    async fn end(self, _bridge: &Arc<Bridge>) {
        if let (Some(intent), Some(room_id)) = (self.intent, self.room_id) {
            if let Err(e) = intent.delete_dont_notify_rule(&room_id).await {
                debug!("Failed to re-enable notifications after backfill: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(urn: &str, created_at: i64) -> ConversationEvent {
        ConversationEvent {
            created_at: Some(created_at),
            entity_urn: Some(Urn::new(urn)),
            ..Default::default()
        }
    }

    /// The pure windowing step of the backfill algorithm, extracted for
    /// verification: filter to (after, now], sort ascending, keep newest N.
    fn window(
        mut events: Vec<ConversationEvent>,
        after: Option<i64>,
        now: i64,
        limit: i64,
    ) -> Vec<ConversationEvent> {
        events.retain(|e| {
            e.created_at
                .map(|ts| ts <= now && after.is_none_or(|a| ts > a))
                .unwrap_or(false)
        });
        events.sort_by_key(|e| e.created_at);
        events.dedup_by_key(|e| e.entity_urn.as_ref().map(Urn::id_str));
        if limit > 0 && events.len() > limit as usize {
            let excess = events.len() - limit as usize;
            events.drain(..excess);
        }
        events
    }

    #[test]
    fn backfill_window_filters_and_orders() {
        let events = vec![
            event("urn:li:fs_event:(t,3)", 3_000),
            event("urn:li:fs_event:(t,1)", 1_000),
            event("urn:li:fs_event:(t,2)", 2_000),
            event("urn:li:fs_event:(t,4)", 4_000),
        ];
        let out = window(events, Some(1_000), 3_500, -1);
        let ids: Vec<i64> = out.iter().map(|e| e.created_at.unwrap()).collect();
        // Watermark itself excluded, future (4s) excluded, rest oldest-first.
        assert_eq!(ids, vec![2_000, 3_000]);
    }

    #[test]
    fn backfill_window_trims_to_newest_limit() {
        let events: Vec<_> = (1..=10)
            .map(|i| event(&format!("urn:li:fs_event:(t,{i})"), i * 1_000))
            .collect();
        let out = window(events, None, 100_000, 3);
        let ids: Vec<i64> = out.iter().map(|e| e.created_at.unwrap()).collect();
        assert_eq!(ids, vec![8_000, 9_000, 10_000]);
    }

    #[test]
    fn backfill_window_deduplicates_page_overlap() {
        let events = vec![
            event("urn:li:fs_event:(t,1)", 1_000),
            event("urn:li:fs_event:(t,1)", 1_000),
            event("urn:li:fs_event:(t,2)", 2_000),
        ];
        let out = window(events, None, 10_000, -1);
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn dedup_ring_suppresses_replays_and_is_bounded() {
        let portal = Portal::new(Urn::new("urn:li:fs_conversation:t"), Some(Urn::new("r")));
        assert!(!portal.dedup_check_and_push("a").await);
        assert!(portal.dedup_check_and_push("a").await);

        for i in 0..DEDUP_CAPACITY {
            portal.dedup_check_and_push(&format!("filler-{i}")).await;
        }
        // "a" has been evicted by now.
        assert!(!portal.dedup_check_and_push("a").await);
        assert!(portal.dedup.lock().await.len() <= DEDUP_CAPACITY);
    }

    #[test]
    fn reaction_dedup_key_is_a_urn_tuple() {
        let key = Portal::reaction_dedup_key(&Urn::new("urn:li:msg:M"), &Urn::new("U"), "👍");
        assert_eq!(key, "urn:li-reaction:(M,U,👍)");
    }

    #[test]
    fn portal_key_ignores_urn_prefixes() {
        let a = PortalKey::new(&Urn::new("urn:li:fs_conversation:2-abc"), Some(&Urn::new("42")));
        let b = PortalKey::new(&Urn::new("2-abc"), Some(&Urn::new("urn:li:member:42")));
        assert_eq!(a, b);
    }
}
