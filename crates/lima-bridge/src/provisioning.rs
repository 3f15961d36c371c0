//! Provisioning HTTP API — the sole login path. Cookies captured from the
//! user's browser session are posted here and persisted per user.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, options, post};
use lima_common::config::PermissionLevel;
use lima_common::error::BridgeError;
use lima_linkedin::LinkedInClient;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::Bridge;
use crate::user::User;

/// Headers that must not be replayed from a captured browser session.
const EPHEMERAL_HEADERS: &[&str] = &[
    "cookie",
    "content-length",
    "content-type",
    "host",
    "connection",
    "accept-encoding",
];

pub fn router(bridge: Arc<Bridge>) -> axum::Router {
    let prefix = bridge.config.appservice.provisioning.prefix.trim_end_matches('/');
    axum::Router::new()
        .route(&format!("{prefix}/whoami"), get(whoami))
        .route(&format!("{prefix}/login"), options(login_options).post(login))
        .route(&format!("{prefix}/logout"), post(logout))
        .with_state(bridge)
}

fn cors_headers(response: Response) -> Response {
    let mut response = response;
    let headers = response.headers_mut();
    headers.insert("Access-Control-Allow-Origin", "*".parse().unwrap());
    headers.insert(
        "Access-Control-Allow-Headers",
        "Authorization, Content-Type".parse().unwrap(),
    );
    headers.insert("Access-Control-Allow-Methods", "POST, OPTIONS".parse().unwrap());
    response
}

#[derive(Deserialize)]
struct UserIdQuery {
    user_id: Option<String>,
}

/// Shared-secret check plus user resolution; every endpoint goes through it.
async fn check_token(
    bridge: &Arc<Bridge>,
    headers: &HeaderMap,
    query: &UserIdQuery,
) -> Result<Arc<User>, BridgeError> {
    let token = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(BridgeError::MissingAuthHeader)?
        .strip_prefix("Bearer ")
        .ok_or(BridgeError::MissingAuthHeader)?;
    if token != bridge.config.appservice.provisioning.shared_secret {
        return Err(BridgeError::InvalidToken);
    }
    let user_id = query.user_id.as_deref().ok_or(BridgeError::MissingUserId)?;
    bridge
        .get_user_by_mxid(user_id, true)
        .await
        .map_err(BridgeError::Internal)?
        .ok_or_else(|| BridgeError::NotFound { resource: "user".to_owned() })
}

async fn whoami(
    State(bridge): State<Arc<Bridge>>,
    Query(query): Query<UserIdQuery>,
    headers: HeaderMap,
) -> Response {
    let user = match check_token(&bridge, &headers, &query).await {
        Ok(user) => user,
        Err(e) => return cors_headers(e.into_response()),
    };

    let permissions = match bridge.config.bridge.permission_level(&user.mxid) {
        PermissionLevel::Admin => "admin",
        PermissionLevel::User => "user",
        PermissionLevel::Relay => "relay",
        PermissionLevel::None => "",
    };

    let mut linkedin = Value::Null;
    if let Some(client) = user.client().await {
        if let Ok(profile) = client.get_user_profile().await {
            linkedin = serde_json::to_value(&profile).unwrap_or(Value::Null);
        }
    }

    cors_headers(
        Json(json!({
            "permissions": permissions,
            "mxid": user.mxid,
            "linkedin": linkedin,
        }))
        .into_response(),
    )
}

async fn login_options() -> Response {
    cors_headers(StatusCode::OK.into_response())
}

#[derive(Deserialize)]
struct LoginBody {
    /// Full header capture, including the `Cookie` header.
    all_headers: Option<HashMap<String, String>>,
    /// Just the `Cookie` header value.
    cookie_header: Option<String>,
    /// Or the two required cookies directly.
    li_at: Option<String>,
    #[serde(rename = "JSESSIONID")]
    jsessionid: Option<String>,
}

fn parse_cookie_header(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            Some((name.trim().to_owned(), value.trim().to_owned()))
        })
        .collect()
}

async fn login(
    State(bridge): State<Arc<Bridge>>,
    Query(query): Query<UserIdQuery>,
    headers: HeaderMap,
    body: Result<Json<LoginBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let user = match check_token(&bridge, &headers, &query).await {
        Ok(user) => user,
        Err(e) => return cors_headers(e.into_response()),
    };
    let Ok(Json(body)) = body else {
        return cors_headers(BridgeError::MalformedBody.into_response());
    };

    let mut header_overrides: HashMap<String, String> = HashMap::new();
    let cookies = if let Some(all_headers) = body.all_headers {
        let mut cookies = HashMap::new();
        for (name, value) in all_headers {
            if name.eq_ignore_ascii_case("cookie") {
                cookies = parse_cookie_header(&value);
            } else if !EPHEMERAL_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                header_overrides.insert(name, value);
            }
        }
        cookies
    } else if let Some(cookie_header) = body.cookie_header {
        parse_cookie_header(&cookie_header)
    } else {
        let mut cookies = HashMap::new();
        if let Some(li_at) = body.li_at {
            cookies.insert("li_at".to_owned(), li_at);
        }
        if let Some(jsessionid) = body.jsessionid {
            cookies.insert("JSESSIONID".to_owned(), jsessionid);
        }
        cookies
    };

    if !cookies.contains_key("li_at") || !cookies.contains_key("JSESSIONID") {
        return cors_headers(BridgeError::MissingLoginKeys.into_response());
    }

    let client = match LinkedInClient::from_cookies(
        cookies,
        header_overrides.clone().into_iter().collect(),
    ) {
        Ok(client) => Arc::new(client),
        Err(_) => return cors_headers(BridgeError::MissingLoginKeys.into_response()),
    };

    match user.clone().on_logged_in(&bridge, client, header_overrides).await {
        Ok(()) => cors_headers(Json(json!({})).into_response()),
        Err(e) => {
            warn!("Login for {} failed: {e:#}", user.mxid);
            cors_headers(BridgeError::LinkedInAuthFailed.into_response())
        }
    }
}

async fn logout(
    State(bridge): State<Arc<Bridge>>,
    Query(query): Query<UserIdQuery>,
    headers: HeaderMap,
) -> Response {
    if let Ok(user) = check_token(&bridge, &headers, &query).await {
        if let Err(e) = user.logout(&bridge).await {
            warn!("Logout for {} failed: {e:#}", user.mxid);
        }
    }
    cors_headers(Json(json!({})).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_parsing() {
        let cookies = parse_cookie_header("li_at=tok; JSESSIONID=\"ajax:1\"; bcookie=v");
        assert_eq!(cookies.get("li_at").map(String::as_str), Some("tok"));
        assert_eq!(cookies.get("JSESSIONID").map(String::as_str), Some("\"ajax:1\""));
        assert_eq!(cookies.len(), 3);
    }

    #[test]
    fn cookie_header_parsing_ignores_malformed_pairs() {
        let cookies = parse_cookie_header("li_at=tok; garbage; =novalue");
        assert_eq!(cookies.get("li_at").map(String::as_str), Some("tok"));
        assert!(!cookies.contains_key("garbage"));
    }
}
