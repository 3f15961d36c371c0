//! Per-user intent clients for the Matrix client-server API.
//!
//! An [`Intent`] issues CS-API calls as a particular user: ghosts are
//! impersonated through appservice `user_id` query-parameter identity
//! assertion, double puppets use the real user's own access token (and
//! possibly a different homeserver base URL).

use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::error::{MatrixError, MatrixResult};
use crate::types::{
    CreateRoomRequest, EVENT_MEMBER, EVENT_POWER_LEVELS, MEMBERSHIP_INVITE, MemberContent,
    PowerLevelsContent,
};

fn encode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[derive(Clone)]
pub struct Intent {
    http: reqwest::Client,
    base_url: String,
    token: String,
    user_id: String,
    /// Whether to assert identity via the appservice `user_id` query param.
    impersonate: bool,
}

impl Intent {
    pub(crate) fn appservice_scoped(
        http: reqwest::Client,
        base_url: String,
        as_token: String,
        user_id: String,
    ) -> Self {
        Self { http, base_url, token: as_token, user_id, impersonate: true }
    }

    /// Intent backed by a real user's access token (double puppeting).
    pub fn with_access_token(
        http: reqwest::Client,
        base_url: String,
        access_token: String,
        user_id: String,
    ) -> Self {
        Self { http, base_url, token: access_token, user_id, impersonate: false }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    // ── Internal ─────────────────────────────────────────────────────────────

    async fn request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> MatrixResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method, &url)
            .header("Authorization", format!("Bearer {}", self.token));
        if self.impersonate {
            request = request.query(&[("user_id", self.user_id.as_str())]);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or_default();
            return Err(MatrixError::Api {
                status: status.as_u16(),
                errcode: body
                    .get("errcode")
                    .and_then(Value::as_str)
                    .unwrap_or("M_UNKNOWN")
                    .to_owned(),
                error: body
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            });
        }
        Ok(response.json().await?)
    }

    async fn put(&self, path: &str, body: &Value) -> MatrixResult<Value> {
        self.request(reqwest::Method::PUT, path, Some(body)).await
    }

    async fn post(&self, path: &str, body: &Value) -> MatrixResult<Value> {
        self.request(reqwest::Method::POST, path, Some(body)).await
    }

    fn txn_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    // ── Registration & profile ───────────────────────────────────────────────

    /// Register the ghost account. `M_USER_IN_USE` is success.
    pub async fn ensure_registered(&self) -> MatrixResult<()> {
        let localpart = self
            .user_id
            .trim_start_matches('@')
            .split(':')
            .next()
            .unwrap_or_default();
        let result: MatrixResult<Value> = self
            .request(
                reqwest::Method::POST,
                "/_matrix/client/v3/register",
                Some(&json!({
                    "type": "m.login.application_service",
                    "username": localpart,
                })),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_user_in_use() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn set_displayname(&self, displayname: &str) -> MatrixResult<()> {
        self.put(
            &format!("/_matrix/client/v3/profile/{}/displayname", encode(&self.user_id)),
            &json!({"displayname": displayname}),
        )
        .await?;
        Ok(())
    }

    pub async fn set_avatar_url(&self, avatar_url: &str) -> MatrixResult<()> {
        self.put(
            &format!("/_matrix/client/v3/profile/{}/avatar_url", encode(&self.user_id)),
            &json!({"avatar_url": avatar_url}),
        )
        .await?;
        Ok(())
    }

    pub async fn get_displayname(&self, user_id: &str) -> MatrixResult<Option<String>> {
        let result: MatrixResult<Value> = self
            .request(
                reqwest::Method::GET,
                &format!("/_matrix/client/v3/profile/{}/displayname", encode(user_id)),
                None,
            )
            .await;
        match result {
            Ok(body) => Ok(body.get("displayname").and_then(Value::as_str).map(str::to_owned)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Validate the access token and return the mxid it belongs to.
    pub async fn whoami(&self) -> MatrixResult<String> {
        let body: Value = self
            .request(reqwest::Method::GET, "/_matrix/client/v3/account/whoami", None)
            .await?;
        body.get("user_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(MatrixError::MissingField("user_id"))
    }

    // ── Media ────────────────────────────────────────────────────────────────

    /// Upload to the content repository; returns the mxc URI.
    pub async fn upload_media(
        &self,
        data: Vec<u8>,
        mime_type: &str,
        filename: &str,
    ) -> MatrixResult<String> {
        let mut request = self
            .http
            .post(format!("{}/_matrix/media/v3/upload", self.base_url))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Content-Type", mime_type)
            .query(&[("filename", filename)])
            .body(data);
        if self.impersonate {
            request = request.query(&[("user_id", self.user_id.as_str())]);
        }
        let response = request.send().await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or_default();
        if !status.is_success() {
            return Err(MatrixError::Api {
                status: status.as_u16(),
                errcode: body
                    .get("errcode")
                    .and_then(Value::as_str)
                    .unwrap_or("M_UNKNOWN")
                    .to_owned(),
                error: body.get("error").and_then(Value::as_str).unwrap_or_default().to_owned(),
            });
        }
        body.get("content_uri")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(MatrixError::MissingField("content_uri"))
    }

    /// Download from the content repository by mxc URI.
    pub async fn download_media(&self, mxc: &str) -> MatrixResult<Vec<u8>> {
        let path = mxc.trim_start_matches("mxc://");
        let response = self
            .http
            .get(format!("{}/_matrix/media/v3/download/{path}", self.base_url))
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MatrixError::Api {
                status: status.as_u16(),
                errcode: "M_UNKNOWN".to_owned(),
                error: format!("media download failed for {mxc}"),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    // ── Rooms ────────────────────────────────────────────────────────────────

    pub async fn create_room(&self, request: &CreateRoomRequest) -> MatrixResult<String> {
        let body = serde_json::to_value(request).expect("CreateRoomRequest serializes");
        let response = self.post("/_matrix/client/v3/createRoom", &body).await?;
        response
            .get("room_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(MatrixError::MissingField("room_id"))
    }

    pub async fn invite_user(&self, room_id: &str, user_id: &str) -> MatrixResult<()> {
        self.post(
            &format!("/_matrix/client/v3/rooms/{}/invite", encode(room_id)),
            &json!({"user_id": user_id}),
        )
        .await?;
        Ok(())
    }

    /// Invite with extra membership content (e.g. `fi.mau.will_auto_accept`),
    /// which requires writing the member state event directly.
    pub async fn invite_user_with_content(
        &self,
        room_id: &str,
        user_id: &str,
        content: &MemberContent,
    ) -> MatrixResult<()> {
        debug_assert_eq!(content.membership, MEMBERSHIP_INVITE);
        self.send_state_event(
            room_id,
            EVENT_MEMBER,
            user_id,
            &serde_json::to_value(content).expect("MemberContent serializes"),
        )
        .await?;
        Ok(())
    }

    pub async fn join_room(&self, room_id: &str) -> MatrixResult<()> {
        self.post(&format!("/_matrix/client/v3/join/{}", encode(room_id)), &json!({})).await?;
        Ok(())
    }

    /// Join, inviting ourselves through `via` first when the join is
    /// forbidden. `via` is typically the bridge bot's intent.
    pub async fn ensure_joined(&self, room_id: &str, via: Option<&Intent>) -> MatrixResult<()> {
        match self.join_room(room_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_forbidden() => {
                if let Some(via) = via {
                    via.invite_user(room_id, &self.user_id).await?;
                    self.join_room(room_id).await
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn leave_room(&self, room_id: &str) -> MatrixResult<()> {
        self.post(&format!("/_matrix/client/v3/rooms/{}/leave", encode(room_id)), &json!({}))
            .await?;
        Ok(())
    }

    pub async fn kick_user(&self, room_id: &str, user_id: &str, reason: &str) -> MatrixResult<()> {
        self.post(
            &format!("/_matrix/client/v3/rooms/{}/kick", encode(room_id)),
            &json!({"user_id": user_id, "reason": reason}),
        )
        .await?;
        Ok(())
    }

    // ── Events ───────────────────────────────────────────────────────────────

    /// Send a message-like event; returns the event id.
    pub async fn send_message_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> MatrixResult<String> {
        let response = self
            .put(
                &format!(
                    "/_matrix/client/v3/rooms/{}/send/{}/{}",
                    encode(room_id),
                    event_type,
                    Self::txn_id()
                ),
                content,
            )
            .await?;
        response
            .get("event_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(MatrixError::MissingField("event_id"))
    }

    pub async fn send_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> MatrixResult<String> {
        let response = self
            .put(
                &format!(
                    "/_matrix/client/v3/rooms/{}/state/{}/{}",
                    encode(room_id),
                    event_type,
                    encode(state_key)
                ),
                content,
            )
            .await?;
        response
            .get("event_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(MatrixError::MissingField("event_id"))
    }

    pub async fn redact(
        &self,
        room_id: &str,
        event_id: &str,
        reason: Option<&str>,
    ) -> MatrixResult<String> {
        let body = match reason {
            Some(reason) => json!({"reason": reason}),
            None => json!({}),
        };
        let response = self
            .put(
                &format!(
                    "/_matrix/client/v3/rooms/{}/redact/{}/{}",
                    encode(room_id),
                    encode(event_id),
                    Self::txn_id()
                ),
                &body,
            )
            .await?;
        response
            .get("event_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(MatrixError::MissingField("event_id"))
    }

    /// Set both the read receipt and the fully-read marker.
    pub async fn mark_read(&self, room_id: &str, event_id: &str) -> MatrixResult<()> {
        self.post(
            &format!("/_matrix/client/v3/rooms/{}/read_markers", encode(room_id)),
            &json!({"m.fully_read": event_id, "m.read": event_id}),
        )
        .await?;
        Ok(())
    }

    pub async fn set_typing(&self, room_id: &str, typing: bool, timeout_ms: u64) -> MatrixResult<()> {
        let body = if typing {
            json!({"typing": true, "timeout": timeout_ms})
        } else {
            json!({"typing": false})
        };
        self.put(
            &format!(
                "/_matrix/client/v3/rooms/{}/typing/{}",
                encode(room_id),
                encode(&self.user_id)
            ),
            &body,
        )
        .await?;
        Ok(())
    }

    pub async fn get_power_levels(&self, room_id: &str) -> MatrixResult<PowerLevelsContent> {
        let value: Value = self
            .request(
                reqwest::Method::GET,
                &format!(
                    "/_matrix/client/v3/rooms/{}/state/{}/",
                    encode(room_id),
                    EVENT_POWER_LEVELS
                ),
                None,
            )
            .await?;
        serde_json::from_value(value).map_err(|_| MatrixError::MissingField("power levels"))
    }

    pub async fn set_power_levels(
        &self,
        room_id: &str,
        content: &PowerLevelsContent,
    ) -> MatrixResult<()> {
        self.send_state_event(
            room_id,
            EVENT_POWER_LEVELS,
            "",
            &serde_json::to_value(content).expect("PowerLevelsContent serializes"),
        )
        .await?;
        Ok(())
    }

    // ── Account data & push rules ────────────────────────────────────────────

    /// Merge `room_id` into the `m.direct` map under `other_user`.
    pub async fn add_direct_chat(&self, other_user: &str, room_id: &str) -> MatrixResult<()> {
        let path = format!(
            "/_matrix/client/v3/user/{}/account_data/m.direct",
            encode(&self.user_id)
        );
        let mut direct: Value = match self.request(reqwest::Method::GET, &path, None).await {
            Ok(value) => value,
            Err(e) if e.is_not_found() => json!({}),
            Err(e) => return Err(e),
        };
        let rooms = direct
            .as_object_mut()
            .map(|map| map.entry(other_user).or_insert_with(|| json!([])))
            .and_then(Value::as_array_mut);
        if let Some(rooms) = rooms {
            if !rooms.iter().any(|r| r.as_str() == Some(room_id)) {
                rooms.push(json!(room_id));
            }
        }
        self.put(&path, &direct).await?;
        Ok(())
    }

    /// Room-kind push rule with a `dont_notify` action — mirrors a LinkedIn
    /// mute onto Matrix.
    pub async fn put_dont_notify_rule(&self, room_id: &str) -> MatrixResult<()> {
        self.put(
            &format!("/_matrix/client/v3/pushrules/global/room/{}", encode(room_id)),
            &json!({"actions": ["dont_notify"]}),
        )
        .await?;
        Ok(())
    }

    /// Remove the mute rule. Absence is benign.
    pub async fn delete_dont_notify_rule(&self, room_id: &str) -> MatrixResult<()> {
        let result: MatrixResult<Value> = self
            .request(
                reqwest::Method::DELETE,
                &format!("/_matrix/client/v3/pushrules/global/room/{}", encode(room_id)),
                None,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── Spaces ───────────────────────────────────────────────────────────────

    /// Add `child_room` as a suggested child of `space_room`.
    pub async fn add_space_child(
        &self,
        space_room: &str,
        child_room: &str,
        via_server: &str,
    ) -> MatrixResult<()> {
        self.send_state_event(
            space_room,
            crate::types::EVENT_SPACE_CHILD,
            child_room,
            &json!({"via": [via_server], "suggested": true}),
        )
        .await?;
        Ok(())
    }
}
