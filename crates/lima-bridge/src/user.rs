//! Per-Matrix-user sessions: login state, post-login bootstrapping,
//! bridge-state heartbeats, and the realtime event-stream consumer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use lima_db::repository::{cookies, http_headers, users, users::UserRow};
use lima_linkedin::realtime::{ListenerExit, StreamEvent};
use lima_linkedin::types::RealtimeEvent;
use lima_linkedin::{ClientError, LinkedInClient, Urn};
use lima_matrix::types::{CreateRoomRequest, MessageContent};
use lima_matrix::{BridgeState, BridgeStateEvent};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::Bridge;

/// Thread syncs are rate-limited to once per this interval.
const THREAD_SYNC_INTERVAL: Duration = Duration::from_secs(10);
/// CONNECTED pings are debounced to once per this interval unless the session
/// disconnected in between.
const CONNECTED_DEBOUNCE: Duration = Duration::from_secs(12 * 60 * 60);
/// Profile-fetch retry ceiling; past this the process exits for a supervisor
/// restart.
const LOGIN_BACKOFF_CEILING: Duration = Duration::from_secs(64);

#[derive(Default)]
struct SessionState {
    is_connected: Option<bool>,
    /// Set when a disconnect happened since the last CONNECTED ping.
    was_disconnected: bool,
    last_connected_push: Option<Instant>,
    prev_thread_sync: Option<Instant>,
    /// Cached remote displayname for bridge-state payloads.
    remote_name: Option<String>,
}

pub struct User {
    pub mxid: String,
    row: Mutex<UserRow>,
    client: RwLock<Option<Arc<LinkedInClient>>>,
    state: Mutex<SessionState>,
    notice_room_lock: Mutex<()>,
    notice_send_lock: Mutex<()>,
    listen_task: Mutex<Option<JoinHandle<()>>>,
}

impl User {
    pub(crate) fn new(_bridge: &Bridge, mxid: String) -> Self {
        Self {
            row: Mutex::new(UserRow {
                mxid: mxid.clone(),
                li_member_urn: None,
                notice_room: None,
                space_mxid: None,
            }),
            mxid,
            client: RwLock::new(None),
            state: Mutex::new(SessionState::default()),
            notice_room_lock: Mutex::new(()),
            notice_send_lock: Mutex::new(()),
            listen_task: Mutex::new(None),
        }
    }

    pub(crate) fn from_row(_bridge: &Bridge, row: UserRow) -> Self {
        Self {
            mxid: row.mxid.clone(),
            row: Mutex::new(row),
            client: RwLock::new(None),
            state: Mutex::new(SessionState::default()),
            notice_room_lock: Mutex::new(()),
            notice_send_lock: Mutex::new(()),
            listen_task: Mutex::new(None),
        }
    }

    pub(crate) async fn row(&self) -> UserRow {
        self.row.lock().await.clone()
    }

    pub async fn li_member_urn(&self) -> Option<Urn> {
        self.row.lock().await.li_member_urn.clone()
    }

    pub async fn client(&self) -> Option<Arc<LinkedInClient>> {
        self.client.read().await.clone()
    }

    pub async fn is_logged_in(&self) -> bool {
        self.client.read().await.is_some() && self.li_member_urn().await.is_some()
    }

    pub async fn notice_room(&self) -> Option<String> {
        self.row.lock().await.notice_room.clone()
    }

    pub async fn space_mxid(&self) -> Option<String> {
        self.row.lock().await.space_mxid.clone()
    }

    pub async fn set_notice_room(&self, bridge: &Bridge, room_id: String) -> Result<()> {
        self.row.lock().await.notice_room = Some(room_id);
        self.save(bridge).await
    }

    async fn save(&self, bridge: &Bridge) -> Result<()> {
        let row = self.row.lock().await.clone();
        users::save(&bridge.db.pool, &row).await?;
        Ok(())
    }

    // ── Login ────────────────────────────────────────────────────────────────

    /// Restore the session from stored cookies. Called for every logged-in
    /// user at startup.
    pub async fn load_session(self: Arc<Self>, bridge: &Arc<Bridge>) -> Result<bool> {
        let stored_cookies = cookies::get_for_mxid(&bridge.db.pool, &self.mxid).await?;
        if !stored_cookies.contains_key("li_at") || !stored_cookies.contains_key("JSESSIONID") {
            debug!("{} has no stored session", self.mxid);
            return Ok(false);
        }
        let headers = http_headers::get_for_mxid(&bridge.db.pool, &self.mxid).await?;
        let client = LinkedInClient::from_cookies(
            stored_cookies,
            headers.into_iter().collect::<Vec<_>>(),
        )?;
        *self.client.write().await = Some(Arc::new(client));
        self.connect(bridge).await;
        Ok(true)
    }

    /// Take ownership of a freshly authenticated client (provisioning login).
    /// Cookies and non-ephemeral headers are persisted before connecting.
    pub async fn on_logged_in(
        self: Arc<Self>,
        bridge: &Arc<Bridge>,
        client: Arc<LinkedInClient>,
        headers: HashMap<String, String>,
    ) -> Result<()> {
        cookies::bulk_upsert(&bridge.db.pool, &self.mxid, &client.cookies()).await?;
        if !headers.is_empty() {
            http_headers::bulk_upsert(&bridge.db.pool, &self.mxid, &headers).await?;
        }
        *self.client.write().await = Some(client);

        // The provisioning caller wants a synchronous verdict on the cookies.
        let profile = self
            .client()
            .await
            .ok_or_else(|| anyhow!("client vanished during login"))?
            .get_user_profile()
            .await?;
        let member_urn = profile
            .member_urn()
            .cloned()
            .ok_or_else(|| anyhow!("profile response carried no member URN"))?;
        self.finish_login(bridge, member_urn, &profile_name(&profile)).await?;
        bridge.cache_user(&self).await;

        let bridge = bridge.clone();
        tokio::spawn(async move {
            if let Err(e) = self.clone().post_login(&bridge).await {
                error!("Post-login for {} failed: {e:#}", self.mxid);
            }
        });
        Ok(())
    }

    /// Startup path: verify the restored cookies and run post-login.
    async fn connect(self: Arc<Self>, bridge: &Arc<Bridge>) {
        self.push_bridge_state(bridge, BridgeStateEvent::Connecting).await;
        let bridge = bridge.clone();
        tokio::spawn(async move {
            let this = self;
            match this.fetch_profile_with_backoff(&bridge).await {
                Ok(Some((member_urn, name))) => {
                    if let Err(e) = this.finish_login(&bridge, member_urn, &name).await {
                        error!("Failed to finish login for {}: {e:#}", this.mxid);
                        return;
                    }
                    bridge.cache_user(&this).await;
                    if let Err(e) = this.clone().post_login(&bridge).await {
                        error!("Post-login for {} failed: {e:#}", this.mxid);
                    }
                }
                Ok(None) => {
                    // Credentials rejected; already reported.
                }
                Err(e) => {
                    error!("Unrecoverable login failure for {}: {e:#}", this.mxid);
                    this.push_bridge_state(&bridge, BridgeStateEvent::UnknownError).await;
                    // The supervisor restarts the whole process.
                    std::process::exit(70);
                }
            }
        });
    }

    /// Retry the profile probe with exponential backoff (1 → 64 s). Returns
    /// `Ok(None)` on bad credentials, `Err` once the ceiling is exhausted.
    async fn fetch_profile_with_backoff(
        &self,
        bridge: &Arc<Bridge>,
    ) -> Result<Option<(Urn, String)>> {
        let mut delay = Duration::from_secs(1);
        loop {
            let Some(client) = self.client().await else { return Ok(None) };
            match client.get_user_profile().await {
                Ok(profile) => match profile.member_urn() {
                    Some(urn) => return Ok(Some((urn.clone(), profile_name(&profile)))),
                    None => {
                        self.mark_bad_credentials(bridge).await;
                        return Ok(None);
                    }
                },
                Err(e) if e.is_auth_failure() => {
                    self.mark_bad_credentials(bridge).await;
                    return Ok(None);
                }
                Err(e) => {
                    if delay > LOGIN_BACKOFF_CEILING {
                        return Err(e.into());
                    }
                    warn!("Profile fetch for {} failed ({e}), retrying in {delay:?}", self.mxid);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    async fn finish_login(
        &self,
        bridge: &Arc<Bridge>,
        member_urn: Urn,
        remote_name: &str,
    ) -> Result<()> {
        info!("{} logged in as {member_urn}", self.mxid);
        self.row.lock().await.li_member_urn = Some(member_urn);
        self.state.lock().await.remote_name = Some(remote_name.to_owned());
        self.save(bridge).await?;
        Ok(())
    }

    async fn mark_bad_credentials(&self, bridge: &Arc<Bridge>) {
        warn!("Credentials for {} are no longer valid", self.mxid);
        *self.client.write().await = None;
        self.push_bridge_state(bridge, BridgeStateEvent::BadCredentials).await;
        self.send_bridge_notice(
            bridge,
            "Your LinkedIn session expired. Log in again through the provisioning API.",
        )
        .await;
    }

    // ── Post-login ───────────────────────────────────────────────────────────

    async fn post_login(self: Arc<Self>, bridge: &Arc<Bridge>) -> Result<()> {
        // Double puppeting first so backfilled rooms can auto-join the real
        // account.
        if bridge.config.bridge.sync_with_custom_puppets {
            if let Some(puppet) = bridge.get_puppet_by_custom_mxid(&self.mxid).await? {
                puppet.start_double_puppet(bridge).await;
            }
        }
        if let Err(e) = self.update_space(bridge).await {
            warn!("Failed to set up personal space for {}: {e:#}", self.mxid);
        }
        if let Err(e) = self.sync_threads(bridge).await {
            warn!("Initial thread sync for {} failed: {e:#}", self.mxid);
        }
        self.start_listen(bridge).await;
        Ok(())
    }

    /// Create or refresh the personal space room grouping this user's
    /// portals.
    async fn update_space(&self, bridge: &Arc<Bridge>) -> Result<String> {
        if let Some(space) = self.space_mxid().await {
            return Ok(space);
        }
        let _guard = self.notice_room_lock.lock().await;
        if let Some(space) = self.space_mxid().await {
            return Ok(space);
        }
        let request = CreateRoomRequest {
            name: Some("LinkedIn".to_owned()),
            topic: Some("Your LinkedIn bridged chats".to_owned()),
            invite: vec![self.mxid.clone()],
            is_direct: false,
            preset: Some("private_chat".to_owned()),
            creation_content: Some(serde_json::json!({"type": "m.space"})),
            ..Default::default()
        };
        let space = bridge.appservice.bot_intent().create_room(&request).await?;
        self.row.lock().await.space_mxid = Some(space.clone());
        self.save(bridge).await?;
        info!("Created space {space} for {}", self.mxid);
        Ok(space)
    }

    /// Sync recent conversations into portals. Rate-limited; re-entry within
    /// the window is a no-op.
    pub async fn sync_threads(&self, bridge: &Arc<Bridge>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if let Some(last) = state.prev_thread_sync {
                if last.elapsed() < THREAD_SYNC_INTERVAL {
                    debug!("Throttling thread sync for {}", self.mxid);
                    return Ok(());
                }
            }
            state.prev_thread_sync = Some(Instant::now());
        }

        let Some(client) = self.client().await else {
            return Err(anyhow!("not logged in"));
        };
        let Some(receiver) = self.li_member_urn().await else {
            return Err(anyhow!("own member URN unknown"));
        };

        self.push_bridge_state(bridge, BridgeStateEvent::Backfilling).await;
        info!("Syncing threads for {}", self.mxid);

        let limit = bridge.config.bridge.initial_chat_sync;
        let mut synced = 0usize;
        let mut before = chrono::Utc::now().timestamp_millis();
        'pages: loop {
            let page = client.get_conversations(before).await?;
            let page_len = page.elements.len();
            let last_activity = page.elements.last().and_then(|c| c.last_activity_at);

            for conversation in page.elements {
                if synced >= limit {
                    break 'pages;
                }
                let Some(thread_urn) = conversation.entity_urn.clone() else { continue };
                let Some(portal) = bridge
                    .get_portal_by_thread(&thread_urn, Some(&receiver), true)
                    .await?
                else {
                    continue;
                };
                portal.create_matrix_room(bridge, self, Some(&conversation)).await;
                self.sync_mute_state(bridge, &portal, conversation.muted).await;
                synced += 1;
            }

            if page_len < lima_linkedin::client::PAGE_SIZE {
                break;
            }
            match last_activity {
                Some(ts) => before = ts,
                None => break,
            }
        }

        info!("Thread sync for {} touched {synced} conversations", self.mxid);
        Ok(())
    }

    /// Mirror the LinkedIn mute flag onto a Matrix push rule. Requires the
    /// double puppet; silently skipped without one.
    async fn sync_mute_state(
        &self,
        bridge: &Arc<Bridge>,
        portal: &crate::portal::Portal,
        muted: bool,
    ) {
        if !bridge.config.bridge.mute_bridging {
            return;
        }
        let Some(room_id) = portal.mxid().await else { return };
        let Ok(Some(puppet)) = bridge.get_puppet_by_custom_mxid(&self.mxid).await else { return };
        let Some(intent) = puppet.custom_intent(bridge).await else { return };
        let result = if muted {
            intent.put_dont_notify_rule(&room_id).await
        } else {
            // NotFound on removal is benign.
            intent.delete_dont_notify_rule(&room_id).await
        };
        if let Err(e) = result {
            warn!("Failed to sync mute state for {room_id}: {e}");
        }
    }

    // ── Realtime listener ────────────────────────────────────────────────────

    pub async fn start_listen(self: Arc<Self>, bridge: &Arc<Bridge>) {
        self.stop_listen().await;
        let this = self.clone();
        let bridge = bridge.clone();
        let handle = tokio::spawn(async move {
            this.listen_loop(&bridge).await;
        });
        *self.listen_task.lock().await = Some(handle);
    }

    pub async fn stop_listen(&self) {
        if let Some(task) = self.listen_task.lock().await.take() {
            task.abort();
        }
    }

    /// Supervisor loop around the realtime stream. Restarts the listener
    /// until shutdown, logout, or bad credentials.
    async fn listen_loop(&self, bridge: &Arc<Bridge>) {
        loop {
            let Some(client) = self.client().await else {
                self.push_bridge_state(bridge, BridgeStateEvent::BadCredentials).await;
                return;
            };
            let Some(member_urn) = self.li_member_urn().await else { return };

            let (tx, mut rx) = mpsc::channel::<StreamEvent>(256);
            let shutdown = bridge.subscribe_shutdown();
            let listener = tokio::spawn(lima_linkedin::realtime::listen(
                client,
                member_urn,
                tx,
                shutdown,
            ));

            while let Some(event) = rx.recv().await {
                self.handle_stream_event(bridge, event).await;
            }

            let exit = listener.await;
            if bridge.is_shutting_down() {
                return;
            }
            if !self.is_logged_in().await {
                self.push_bridge_state(bridge, BridgeStateEvent::BadCredentials).await;
                return;
            }

            match exit {
                Ok(Ok(ListenerExit::Shutdown)) => return,
                Ok(Ok(ListenerExit::ConsumerGone)) => return,
                Ok(Err(ClientError::TooManyRequests)) => {
                    self.on_disconnect(bridge, "LinkedIn rate limited the connection").await;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(Err(e)) if e.is_auth_failure() => {
                    self.mark_bad_credentials(bridge).await;
                    return;
                }
                Ok(Err(e)) => {
                    self.on_disconnect(bridge, &e.to_string()).await;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Err(e) if e.is_cancelled() => return,
                Err(e) => {
                    error!("Listener task for {} panicked: {e}", self.mxid);
                    return;
                }
            }
        }
    }

    async fn on_disconnect(&self, bridge: &Arc<Bridge>, reason: &str) {
        {
            let mut state = self.state.lock().await;
            state.is_connected = Some(false);
            state.was_disconnected = true;
        }
        self.push_bridge_state(bridge, BridgeStateEvent::TransientDisconnect).await;
        if bridge.config.bridge.temporary_disconnect_notices {
            self.send_bridge_notice(
                bridge,
                &format!("Disconnected from LinkedIn: {reason}. Reconnecting…"),
            )
            .await;
        }
    }

    async fn handle_stream_event(&self, bridge: &Arc<Bridge>, event: StreamEvent) {
        let result = match event {
            StreamEvent::Connected { .. } => {
                self.on_connected(bridge).await;
                Ok(())
            }
            StreamEvent::Timeout(reason) => {
                self.on_disconnect(bridge, &reason).await;
                Ok(())
            }
            StreamEvent::Message(event) => self.handle_realtime_message(bridge, event).await,
            StreamEvent::ReactionChange(event) => {
                self.handle_realtime_reaction(bridge, event).await
            }
            StreamEvent::Action(event) => self.handle_realtime_action(bridge, event).await,
            StreamEvent::FromEntity(event) => self.handle_realtime_receipt(bridge, event).await,
            StreamEvent::AllEvents(_) => Ok(()),
        };
        if let Err(e) = result {
            // Data errors never kill the stream.
            warn!("Failed to handle realtime event for {}: {e:#}", self.mxid);
        }
    }

    async fn on_connected(&self, bridge: &Arc<Bridge>) {
        let should_push = {
            let mut state = self.state.lock().await;
            state.is_connected = Some(true);
            let debounced = state
                .last_connected_push
                .is_some_and(|t| t.elapsed() < CONNECTED_DEBOUNCE)
                && !state.was_disconnected;
            state.was_disconnected = false;
            if !debounced {
                state.last_connected_push = Some(Instant::now());
            }
            !debounced
        };
        if should_push {
            self.push_bridge_state(bridge, BridgeStateEvent::Connected).await;
        }
        // Cookies refreshed mid-session get written back on every reconnect.
        if let Err(e) = self.persist_session(bridge).await {
            warn!("Failed to persist refreshed cookies for {}: {e:#}", self.mxid);
        }
    }

    async fn handle_realtime_message(
        &self,
        bridge: &Arc<Bridge>,
        event: RealtimeEvent,
    ) -> Result<()> {
        let Some(conversation_event) = event.event else { return Ok(()) };
        let Some(entity_urn) = conversation_event.entity_urn.clone() else {
            debug!("Realtime message without entity urn, skipping");
            return Ok(());
        };
        let Some(receiver) = self.li_member_urn().await else { return Ok(()) };
        let thread_urn = Urn::new(entity_urn.first_part());
        let Some(portal) = bridge
            .get_portal_by_thread(&thread_urn, Some(&receiver), true)
            .await?
        else {
            return Ok(());
        };
        if portal.mxid().await.is_none() {
            // A conversation we have never seen: sync threads to pick up its
            // metadata (throttled), then fall back to a bare room.
            if let Err(e) = self.sync_threads(bridge).await {
                warn!("Thread sync for new portal failed: {e:#}");
            }
            if portal.mxid().await.is_none() {
                portal.create_matrix_room(bridge, self, None).await;
            }
        }
        portal
            .handle_linkedin_message(bridge, self, conversation_event)
            .await;
        Ok(())
    }

    async fn handle_realtime_reaction(
        &self,
        bridge: &Arc<Bridge>,
        event: RealtimeEvent,
    ) -> Result<()> {
        let Some(event_urn) = event.event_urn.clone() else { return Ok(()) };
        let Some(receiver) = self.li_member_urn().await else { return Ok(()) };
        let thread_urn = Urn::new(event_urn.first_part());
        let Some(portal) = bridge
            .get_portal_by_thread(&thread_urn, Some(&receiver), false)
            .await?
        else {
            debug!("Reaction for unknown portal {thread_urn}");
            return Ok(());
        };
        portal.handle_linkedin_reaction(bridge, self, event).await;
        Ok(())
    }

    async fn handle_realtime_action(
        &self,
        bridge: &Arc<Bridge>,
        event: RealtimeEvent,
    ) -> Result<()> {
        if event.action.as_deref() != Some("UPDATE") {
            debug!("Unhandled realtime action {:?}", event.action);
            return Ok(());
        }
        let Some(conversation) = event.embedded_conversation() else { return Ok(()) };
        if conversation.read != Some(true) {
            return Ok(());
        }
        let Some(thread_urn) = conversation.entity_urn else { return Ok(()) };
        let Some(receiver) = self.li_member_urn().await else { return Ok(()) };
        let Some(portal) = bridge
            .get_portal_by_thread(&thread_urn, Some(&receiver), false)
            .await?
        else {
            return Ok(());
        };
        portal.handle_linkedin_read(bridge, self).await;
        Ok(())
    }

    async fn handle_realtime_receipt(
        &self,
        bridge: &Arc<Bridge>,
        event: RealtimeEvent,
    ) -> Result<()> {
        let Some(viewer) = event.from_entity.clone() else { return Ok(()) };
        let Some(receipt) = event.seen_receipt.clone() else {
            // No receipt payload means a typing indicator.
            return self.handle_realtime_typing(bridge, &event, &viewer).await;
        };
        let Some(event_urn) = receipt.event_urn else { return Ok(()) };
        let Some(receiver) = self.li_member_urn().await else { return Ok(()) };
        let thread_urn = Urn::new(event_urn.first_part());
        let Some(portal) = bridge
            .get_portal_by_thread(&thread_urn, Some(&receiver), false)
            .await?
        else {
            return Ok(());
        };
        portal
            .handle_linkedin_seen_receipt(bridge, &viewer, &event_urn, receipt.seen_at)
            .await;
        Ok(())
    }

    async fn handle_realtime_typing(
        &self,
        bridge: &Arc<Bridge>,
        event: &RealtimeEvent,
        viewer: &Urn,
    ) -> Result<()> {
        // Typing events carry the conversation as a bare URN string.
        let Some(thread_urn) = event
            .conversation
            .as_ref()
            .and_then(|c| c.as_str())
            .map(Urn::new)
        else {
            debug!("{viewer} is typing in an unknown conversation");
            return Ok(());
        };
        let Some(receiver) = self.li_member_urn().await else { return Ok(()) };
        let Some(portal) = bridge
            .get_portal_by_thread(&thread_urn, Some(&receiver), false)
            .await?
        else {
            return Ok(());
        };
        portal.handle_linkedin_typing(bridge, viewer).await;
        Ok(())
    }

    // ── Bridge state & notices ───────────────────────────────────────────────

    pub async fn push_bridge_state(&self, bridge: &Bridge, event: BridgeStateEvent) {
        let remote_id = self
            .li_member_urn()
            .await
            .map(|urn| urn.id_str())
            .unwrap_or_default();
        let remote_name = self
            .state
            .lock()
            .await
            .remote_name
            .clone()
            .unwrap_or_else(|| "LinkedIn".to_owned());
        bridge
            .appservice
            .post_bridge_state(BridgeState::new(event, remote_id, remote_name))
            .await;
    }

    /// Post an `m.notice` into the user's notice room, creating the room on
    /// first use.
    pub async fn send_bridge_notice(&self, bridge: &Arc<Bridge>, message: &str) {
        let _send_guard = self.notice_send_lock.lock().await;
        let room_id = match self.ensure_notice_room(bridge).await {
            Ok(room_id) => room_id,
            Err(e) => {
                warn!("Failed to get notice room for {}: {e:#}", self.mxid);
                return;
            }
        };
        let content = MessageContent::notice(message);
        let content = serde_json::to_value(&content).expect("notice content serializes");
        if let Err(e) = bridge
            .appservice
            .bot_intent()
            .send_message_event(&room_id, lima_matrix::types::EVENT_MESSAGE, &content)
            .await
        {
            warn!("Failed to send bridge notice to {}: {e}", self.mxid);
        }
    }

    async fn ensure_notice_room(&self, bridge: &Arc<Bridge>) -> Result<String> {
        if let Some(room) = self.notice_room().await {
            return Ok(room);
        }
        let _guard = self.notice_room_lock.lock().await;
        if let Some(room) = self.notice_room().await {
            return Ok(room);
        }
        let request = CreateRoomRequest {
            name: Some("LinkedIn bridge notices".to_owned()),
            invite: vec![self.mxid.clone()],
            is_direct: true,
            preset: Some("private_chat".to_owned()),
            ..Default::default()
        };
        let room_id = bridge.appservice.bot_intent().create_room(&request).await?;
        self.row.lock().await.notice_room = Some(room_id.clone());
        self.save(bridge).await?;
        Ok(room_id)
    }

    // ── Logout ───────────────────────────────────────────────────────────────

    pub async fn logout(&self, bridge: &Arc<Bridge>) -> Result<()> {
        self.stop_listen().await;
        if let Some(client) = self.client.write().await.take() {
            if let Err(e) = client.logout().await {
                debug!("Remote logout for {} failed: {e}", self.mxid);
            }
        }
        cookies::delete_all_for_mxid(&bridge.db.pool, &self.mxid).await?;
        http_headers::delete_all_for_mxid(&bridge.db.pool, &self.mxid).await?;
        self.push_bridge_state(bridge, BridgeStateEvent::LoggedOut).await;
        info!("{} logged out", self.mxid);
        Ok(())
    }

    /// Persist the client's current cookie jar; called at shutdown and after
    /// successful reconnects so refreshed cookies survive restarts.
    pub async fn persist_session(&self, bridge: &Bridge) -> Result<()> {
        if let Some(client) = self.client().await {
            cookies::bulk_upsert(&bridge.db.pool, &self.mxid, &client.cookies()).await?;
        }
        Ok(())
    }
}

fn profile_name(profile: &lima_linkedin::types::UserProfile) -> String {
    profile
        .mini_profile
        .as_ref()
        .map(|p| {
            format!(
                "{} {}",
                p.first_name.clone().unwrap_or_default(),
                p.last_name.clone().unwrap_or_default()
            )
            .trim()
            .to_owned()
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "LinkedIn".to_owned())
}
