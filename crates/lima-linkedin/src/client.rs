//! Async REST client for the Voyager messaging API.
//!
//! Authentication is cookie-based: the jar must contain `li_at` and
//! `JSESSIONID`, and the latter (stripped of surrounding quotes) is echoed on
//! every request as the `csrf-token` header. The jar is hand-managed so that
//! refreshed cookies can be exported and persisted by the caller.

use std::collections::HashMap;
use std::sync::RwLock;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, SET_COOKIE};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::error::{ClientError, ClientResult};
use crate::types::{
    ApiError, Conversation, ConversationEventsResponse, ConversationsResponse,
    MessageAttachmentCreate, MessageCreate, Picture, ReactorsResponse, SendMessageResponse,
    UserProfile,
};
use crate::urn::Urn;

pub const BASE_URL: &str = "https://www.linkedin.com";
pub const API_BASE_URL: &str = "https://www.linkedin.com/voyager/api";
pub const REALTIME_CONNECT_URL: &str = "https://www.linkedin.com/realtime/connect";
pub const CONNECTIVITY_TRACKING_URL: &str =
    "https://www.linkedin.com/realtime/realtimeFrontendClientConnectivityTracking";
const LOGOUT_URL: &str = "https://www.linkedin.com/uas/logout";

/// Conversation list / event pages have a fixed server-side size. A shorter
/// page means the end of the history.
pub const PAGE_SIZE: usize = 20;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

fn x_li_track() -> String {
    json!({
        "clientVersion": "1.13.8751",
        "mpVersion": "1.13.8751",
        "osName": "web",
        "timezoneOffset": -7,
        "timezone": "America/Denver",
        "deviceFormFactor": "DESKTOP",
        "mpName": "voyager-web",
        "displayDensity": 1,
        "displayWidth": 2560,
        "displayHeight": 1440,
    })
    .to_string()
}

#[derive(Debug)]
pub struct LinkedInClient {
    http: reqwest::Client,
    cookies: RwLock<HashMap<String, String>>,
    /// Exact header overrides captured from a browser session. Applied last.
    custom_headers: Vec<(String, String)>,
    csrf_token: String,
    realtime_session_id: RwLock<Option<String>>,
}

impl LinkedInClient {
    /// Build a client from a cookie map. `li_at` and `JSESSIONID` are
    /// required; everything else is forwarded as-is.
    pub fn from_cookies(
        cookies: HashMap<String, String>,
        custom_headers: Vec<(String, String)>,
    ) -> ClientResult<Self> {
        if !cookies.contains_key("li_at") {
            return Err(ClientError::MissingAuthCookies);
        }
        let csrf_token = cookies
            .get("JSESSIONID")
            .map(|v| v.trim_matches('"').to_owned())
            .ok_or(ClientError::MissingAuthCookies)?;

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self {
            http,
            cookies: RwLock::new(cookies),
            custom_headers,
            csrf_token,
            realtime_session_id: RwLock::new(None),
        })
    }

    /// Export the current cookie jar, including values refreshed by
    /// `Set-Cookie` responses, for persistence.
    pub fn cookies(&self) -> HashMap<String, String> {
        self.cookies.read().unwrap().clone()
    }

    pub fn has_auth_cookies(&self) -> bool {
        let cookies = self.cookies.read().unwrap();
        cookies.contains_key("li_at") && cookies.contains_key("JSESSIONID")
    }

    pub(crate) fn set_realtime_session_id(&self, id: String) {
        *self.realtime_session_id.write().unwrap() = Some(id);
    }

    pub fn realtime_session_id(&self) -> Option<String> {
        self.realtime_session_id.read().unwrap().clone()
    }

    // ── Internal ─────────────────────────────────────────────────────────────

    fn cookie_header(&self) -> String {
        self.cookies
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub(crate) fn request_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut set = |name: &str, value: &str| {
            if let (Ok(name), Ok(value)) =
                (HeaderName::try_from(name), HeaderValue::from_str(value))
            {
                headers.insert(name, value);
            }
        };
        set("accept-language", "en-US,en;q=0.9");
        set("x-li-lang", "en_US");
        set("x-restli-protocol-version", "2.0.0");
        set("x-li-track", &x_li_track());
        set("authority", "www.linkedin.com");
        set("referer", "https://www.linkedin.com/feed/");
        set("sec-ch-ua", "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\"");
        set("sec-ch-ua-mobile", "?0");
        set("sec-ch-ua-platform", "\"Linux\"");
        set("sec-fetch-dest", "empty");
        set("sec-fetch-mode", "cors");
        set("sec-fetch-site", "same-origin");
        set("csrf-token", &self.csrf_token);
        if let Some(session_id) = self.realtime_session_id.read().unwrap().as_deref() {
            set("x-li-realtime-session", session_id);
        }
        // Captured browser headers override everything above.
        for (name, value) in &self.custom_headers {
            set(name, value);
        }
        set("cookie", &self.cookie_header());
        headers
    }

    fn record_cookies(&self, response: &Response) {
        let mut cookies = self.cookies.write().unwrap();
        for value in response.headers().get_all(SET_COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            let Some(pair) = raw.split(';').next() else { continue };
            if let Some((name, value)) = pair.split_once('=') {
                cookies.insert(name.trim().to_owned(), value.trim().to_owned());
            }
        }
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        params: &[(&str, String)],
        body: Option<&Value>,
    ) -> ClientResult<Response> {
        let mut request = self
            .http
            .request(method, url)
            .headers(self.request_headers())
            .query(params);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        self.record_cookies(&response);
        Ok(response)
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> ClientResult<Response> {
        self.send(Method::GET, &format!("{API_BASE_URL}{path}"), params, None).await
    }

    async fn post(
        &self,
        path: &str,
        params: &[(&str, String)],
        body: &Value,
    ) -> ClientResult<Response> {
        self.send(Method::POST, &format!("{API_BASE_URL}{path}"), params, Some(body)).await
    }

    /// Decode a typed record, mapping non-2xx responses to the API's own
    /// `Error{status}` record where possible.
    async fn decode<T: DeserializeOwned>(
        response: Response,
        context: &'static str,
    ) -> ClientResult<T> {
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let decoded: Option<ApiError> = serde_json::from_str(&text).ok();
            let status = decoded
                .map(|e| u16::try_from(e.status).unwrap_or(status.as_u16()))
                .unwrap_or(status.as_u16());
            return Err(ClientError::Status { status });
        }
        serde_json::from_str(&text).map_err(|source| ClientError::Decode { context, source })
    }

    fn expect_status(response: &Response, expected: StatusCode) -> ClientResult<()> {
        if response.status() == expected {
            Ok(())
        } else {
            Err(ClientError::Status { status: response.status().as_u16() })
        }
    }

    // ── Profiles ─────────────────────────────────────────────────────────────

    /// Fetch the logged-in member's profile. Doubles as a liveness probe.
    pub async fn get_user_profile(&self) -> ClientResult<UserProfile> {
        let response = self.get("/me", &[]).await?;
        Self::decode(response, "user profile").await
    }

    pub async fn logged_in(&self) -> bool {
        if !self.has_auth_cookies() {
            return false;
        }
        match self.get_user_profile().await {
            Ok(profile) => profile.member_urn().is_some(),
            Err(e) => {
                tracing::warn!("Failed getting the user profile: {e}");
                false
            }
        }
    }

    // ── Conversations ────────────────────────────────────────────────────────

    /// Fetch one page of the conversation list, newest-first, strictly before
    /// `last_activity_before` (milliseconds).
    pub async fn get_conversations(
        &self,
        last_activity_before: i64,
    ) -> ClientResult<ConversationsResponse> {
        let params = [
            ("keyVersion", "LEGACY_INBOX".to_owned()),
            // The upstream parameter really is createdBefore even though it
            // filters on last activity.
            ("createdBefore", last_activity_before.to_string()),
        ];
        let response = self.get("/messaging/conversations", &params).await?;
        Self::decode(response, "conversations page").await
    }

    /// Iterate the full conversation list by resubmitting with the last
    /// element's activity timestamp until a short page arrives.
    pub async fn get_all_conversations(&self) -> ClientResult<Vec<Conversation>> {
        let mut all = Vec::new();
        let mut before = chrono::Utc::now().timestamp_millis();
        loop {
            let page = self.get_conversations(before).await?;
            let len = page.elements.len();
            let last_activity =
                page.elements.last().and_then(|c| c.last_activity_at);
            all.extend(page.elements);
            if len < PAGE_SIZE {
                break;
            }
            match last_activity {
                Some(ts) => before = ts,
                None => break,
            }
        }
        Ok(all)
    }

    /// Fetch a page of a thread's events created before the given timestamp,
    /// newest-first.
    pub async fn get_conversation_events(
        &self,
        thread_urn: &Urn,
        created_before: i64,
    ) -> ClientResult<ConversationEventsResponse> {
        if thread_urn.id_parts().len() != 1 {
            return Err(ClientError::InvalidUrn(thread_urn.to_string()));
        }
        let params = [("createdBefore", created_before.to_string())];
        let response = self
            .get(
                &format!("/messaging/conversations/{}/events", thread_urn.get_id()),
                &params,
            )
            .await?;
        Self::decode(response, "conversation events page").await
    }

    pub async fn mark_conversation_read(&self, thread_urn: &Urn) -> ClientResult<()> {
        let response = self
            .post(
                &format!("/messaging/conversations/{}", thread_urn.last_part()),
                &[],
                &json!({"patch": {"$set": {"read": true}}}),
            )
            .await?;
        Self::expect_status(&response, StatusCode::OK)
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    pub async fn send_message(
        &self,
        thread_urn: &Urn,
        message_create: &MessageCreate,
    ) -> ClientResult<SendMessageResponse> {
        let event = json!({
            "eventCreate": {
                "value": {
                    "com.linkedin.voyager.messaging.create.MessageCreate": message_create,
                }
            }
        });
        let response = self
            .post(
                &format!("/messaging/conversations/{}/events", thread_urn.get_id()),
                &[("action", "create".to_owned())],
                &event,
            )
            .await?;
        Self::decode(response, "send message response").await
    }

    /// Recall (delete for everyone) a previously sent message.
    pub async fn delete_message(&self, thread_urn: &Urn, message_urn: &Urn) -> ClientResult<()> {
        let response = self
            .post(
                &format!(
                    "/messaging/conversations/{}/events/{}",
                    thread_urn.id_str(),
                    message_urn.last_part()
                ),
                &[("action", "recall".to_owned())],
                &json!({}),
            )
            .await?;
        Self::expect_status(&response, StatusCode::NO_CONTENT)
    }

    // ── Reactions ────────────────────────────────────────────────────────────

    pub async fn add_emoji_reaction(
        &self,
        thread_urn: &Urn,
        message_urn: &Urn,
        emoji: &str,
    ) -> ClientResult<()> {
        let response = self
            .post(
                &format!(
                    "/messaging/conversations/{}/events/{}",
                    thread_urn.id_str(),
                    message_urn.last_part()
                ),
                &[("action", "reactWithEmoji".to_owned())],
                &json!({"emoji": emoji}),
            )
            .await?;
        Self::expect_status(&response, StatusCode::NO_CONTENT)
    }

    pub async fn remove_emoji_reaction(
        &self,
        thread_urn: &Urn,
        message_urn: &Urn,
        emoji: &str,
    ) -> ClientResult<()> {
        let response = self
            .post(
                &format!(
                    "/messaging/conversations/{}/events/{}",
                    thread_urn.id_str(),
                    message_urn.last_part()
                ),
                &[("action", "unreactWithEmoji".to_owned())],
                &json!({"emoji": emoji}),
            )
            .await?;
        Self::expect_status(&response, StatusCode::NO_CONTENT)
    }

    /// List who reacted to a message with a given emoji.
    pub async fn get_reactors(
        &self,
        message_urn: &Urn,
        emoji: &str,
    ) -> ClientResult<ReactorsResponse> {
        let params = [
            (
                "decorationId",
                "com.linkedin.voyager.dash.deco.messaging.FullReactor-8".to_owned(),
            ),
            ("emoji", emoji.to_owned()),
            (
                "messageUrn",
                format!("urn:li:fsd_message:{}", message_urn.last_part()),
            ),
            ("q", "messageAndEmoji".to_owned()),
        ];
        let response = self.get("/voyagerMessagingDashReactors", &params).await?;
        Self::decode(response, "reactors page").await
    }

    // ── Typing ───────────────────────────────────────────────────────────────

    pub async fn set_typing(&self, thread_urn: &Urn) -> ClientResult<()> {
        self.post(
            "/messaging/conversations",
            &[("action", "typing".to_owned())],
            &json!({"conversationId": thread_urn.get_id()}),
        )
        .await?;
        Ok(())
    }

    // ── Media ────────────────────────────────────────────────────────────────

    /// Two-step upload: metadata POST yields a one-shot PUT URL and the
    /// attachment URN; the bytes are PUT there directly.
    pub async fn upload_media(
        &self,
        data: Vec<u8>,
        filename: &str,
        media_type: &str,
    ) -> ClientResult<MessageAttachmentCreate> {
        let byte_size = data.len() as u64;
        let metadata_response = self
            .post(
                "/voyagerMediaUploadMetadata",
                &[("action", "upload".to_owned())],
                &json!({
                    "mediaUploadType": "MESSAGING_PHOTO_ATTACHMENT",
                    "fileSize": byte_size,
                    "filename": filename,
                }),
            )
            .await?;
        if metadata_response.status() != StatusCode::OK {
            return Err(ClientError::Upload("failed to send upload metadata".into()));
        }
        let metadata: Value = metadata_response
            .json()
            .await
            .map_err(|_| ClientError::Upload("malformed upload metadata response".into()))?;
        let value = metadata.get("value").cloned().unwrap_or_default();
        let upload_url = value
            .get("singleUploadUrl")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Upload("no upload URL provided".into()))?;
        let attachment_urn = value
            .get("urn")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Upload("no attachment urn provided".into()))?;

        let upload_response = self
            .http
            .put(upload_url)
            .headers(self.request_headers())
            .body(data)
            .send()
            .await?;
        if upload_response.status() != StatusCode::CREATED {
            return Err(ClientError::Upload(format!(
                "upload PUT returned {}",
                upload_response.status()
            )));
        }

        Ok(MessageAttachmentCreate {
            byte_size,
            id: Some(Urn::new(attachment_urn)),
            media_type: media_type.to_owned(),
            name: filename.to_owned(),
        })
    }

    /// Download attachment content with the authenticated cookie jar.
    pub async fn download_media(&self, url: &str) -> ClientResult<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .headers(self.request_headers())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::Status { status: response.status().as_u16() });
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Download a profile picture: root url + the largest artifact's segment.
    pub async fn download_profile_picture(&self, picture: &Picture) -> ClientResult<Vec<u8>> {
        let vector_image = picture
            .vector_image
            .as_ref()
            .filter(|vi| !vi.artifacts.is_empty())
            .ok_or_else(|| ClientError::Upload("picture has no vector image".into()))?;
        let url = format!(
            "{}{}",
            vector_image.root_url,
            vector_image.artifacts[vector_image.artifacts.len() - 1]
                .file_identifying_url_path_segment
        );
        self.download_media(&url).await
    }

    // ── Session ──────────────────────────────────────────────────────────────

    pub async fn logout(&self) -> ClientResult<bool> {
        let response = self
            .http
            .get(LOGOUT_URL)
            .headers(self.request_headers())
            .query(&[("csrfToken", self.csrf_token.as_str())])
            .send()
            .await?;
        Ok(response.status() == StatusCode::SEE_OTHER || response.status().is_success())
    }

    /// Realtime connectivity heartbeat. Skipped while no session id exists.
    pub async fn send_heartbeat(&self, user_urn: &Urn) -> ClientResult<()> {
        let Some(session_id) = self.realtime_session_id() else {
            tracing::warn!("No realtime session ID, skipping heartbeat");
            return Ok(());
        };
        self.send(
            Method::POST,
            CONNECTIVITY_TRACKING_URL,
            &[("action", "sendHeartbeat".to_owned())],
            Some(&json!({
                "isFirstHeartbeat": false,
                "isLastHeartbeat": false,
                "realtimeSessionId": session_id,
                "mpName": "voyager-web",
                "mpVersion": "1.13.8751",
                "clientId": "voyager-web",
                "actorUrn": user_urn.to_string(),
                "contextUrns": [user_urn.to_string()],
            })),
        )
        .await?;
        Ok(())
    }

    pub(crate) async fn open_realtime_stream(&self) -> ClientResult<Response> {
        let mut headers = self.request_headers();
        headers.insert("accept", HeaderValue::from_static("text/event-stream"));
        let response = self
            .http
            .get(REALTIME_CONNECT_URL)
            .headers(headers)
            .query(&[("rc", "1")])
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(response),
            StatusCode::TOO_MANY_REQUESTS => Err(ClientError::TooManyRequests),
            status => Err(ClientError::Status { status: status.as_u16() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_cookies() -> HashMap<String, String> {
        HashMap::from([
            ("li_at".to_owned(), "token".to_owned()),
            ("JSESSIONID".to_owned(), "\"ajax:123\"".to_owned()),
        ])
    }

    #[test]
    fn jsessionid_quotes_are_stripped_for_csrf() {
        let client = LinkedInClient::from_cookies(auth_cookies(), Vec::new()).unwrap();
        let headers = client.request_headers();
        assert_eq!(headers.get("csrf-token").unwrap(), "ajax:123");
        // The cookie itself keeps its original quoting.
        let cookie = headers.get("cookie").unwrap().to_str().unwrap();
        assert!(cookie.contains("JSESSIONID=\"ajax:123\""));
    }

    #[test]
    fn missing_auth_cookies_rejected() {
        let err = LinkedInClient::from_cookies(
            HashMap::from([("li_at".to_owned(), "token".to_owned())]),
            Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::MissingAuthCookies));
    }

    #[test]
    fn custom_headers_override_defaults() {
        let client = LinkedInClient::from_cookies(
            auth_cookies(),
            vec![("x-li-track".to_owned(), "{\"custom\":true}".to_owned())],
        )
        .unwrap();
        let headers = client.request_headers();
        assert_eq!(headers.get("x-li-track").unwrap(), "{\"custom\":true}");
    }
}
