//! The appservice itself: intent pool plus the homeserver-facing
//! transaction endpoint.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::intent::Intent;
use crate::types::Transaction;

/// How many processed transaction ids to remember for replay suppression.
const TXN_DEDUP_CAPACITY: usize = 128;

/// Shared appservice handle: connection details plus the intent pool.
pub struct Appservice {
    http: reqwest::Client,
    /// Client-server API base URL of the homeserver.
    pub homeserver_url: String,
    /// Server name that appears in mxids.
    pub domain: String,
    pub as_token: String,
    pub hs_token: String,
    pub bot_mxid: String,
    /// Bridge-state status endpoint, if the operator configured one.
    pub status_endpoint: Option<String>,
    /// Message send checkpoint endpoint, if configured.
    pub checkpoint_endpoint: Option<String>,
}

impl Appservice {
    pub fn new(
        homeserver_url: String,
        domain: String,
        as_token: String,
        hs_token: String,
        bot_localpart: &str,
        status_endpoint: Option<String>,
        checkpoint_endpoint: Option<String>,
    ) -> Self {
        let bot_mxid = format!("@{bot_localpart}:{domain}");
        let http = reqwest::Client::builder()
            .user_agent(concat!("lima/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build appservice http client");
        Self {
            http,
            homeserver_url,
            domain,
            as_token,
            hs_token,
            bot_mxid,
            status_endpoint,
            checkpoint_endpoint,
        }
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Intent scoped to an arbitrary user id under this appservice's
    /// namespace.
    pub fn intent(&self, user_id: &str) -> Intent {
        Intent::appservice_scoped(
            self.http.clone(),
            self.homeserver_url.clone(),
            self.as_token.clone(),
            user_id.to_owned(),
        )
    }

    /// The bridge bot's intent.
    pub fn bot_intent(&self) -> Intent {
        self.intent(&self.bot_mxid)
    }

    /// Intent for a double puppet: the real user's own access token, on their
    /// own homeserver when a base-URL override is given.
    pub fn double_puppet_intent(
        &self,
        user_id: &str,
        access_token: &str,
        base_url: Option<&str>,
    ) -> Intent {
        Intent::with_access_token(
            self.http.clone(),
            base_url.unwrap_or(&self.homeserver_url).to_owned(),
            access_token.to_owned(),
            user_id.to_owned(),
        )
    }
}

// ── Transaction server ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TransactionState {
    hs_token: String,
    tx: mpsc::Sender<Transaction>,
    seen_txn_ids: Arc<Mutex<VecDeque<String>>>,
}

/// Build the homeserver-facing appservice router. Received transactions are
/// forwarded into `tx` for the bridge's Matrix handler to consume.
pub fn transaction_router(hs_token: String, tx: mpsc::Sender<Transaction>) -> Router {
    let state = TransactionState {
        hs_token,
        tx,
        seen_txn_ids: Arc::new(Mutex::new(VecDeque::with_capacity(TXN_DEDUP_CAPACITY))),
    };
    Router::new()
        .route("/_matrix/app/v1/transactions/{txn_id}", put(handle_transaction))
        .route("/_matrix/app/v1/users/{user_id}", get(query_entity))
        .route("/_matrix/app/v1/rooms/{alias}", get(query_entity))
        .with_state(state)
}

#[derive(Deserialize)]
struct TokenQuery {
    access_token: Option<String>,
}

fn authorized(state: &TransactionState, headers: &axum::http::HeaderMap, query: &TokenQuery) -> bool {
    let bearer = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    bearer == Some(state.hs_token.as_str())
        || query.access_token.as_deref() == Some(state.hs_token.as_str())
}

async fn handle_transaction(
    State(state): State<TransactionState>,
    Path(txn_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: axum::http::HeaderMap,
    Json(txn): Json<Transaction>,
) -> Response {
    if !authorized(&state, &headers, &query) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"errcode": "M_FORBIDDEN", "error": "Bad token supplied"})),
        )
            .into_response();
    }

    {
        let mut seen = state.seen_txn_ids.lock().await;
        if seen.contains(&txn_id) {
            debug!("Ignoring duplicate transaction {txn_id}");
            return Json(json!({})).into_response();
        }
        if seen.len() >= TXN_DEDUP_CAPACITY {
            seen.pop_front();
        }
        seen.push_back(txn_id.clone());
    }

    if state.tx.send(txn).await.is_err() {
        warn!("Matrix handler is gone, dropping transaction {txn_id}");
    }
    Json(json!({})).into_response()
}

async fn query_entity(Path(_): Path<String>) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"errcode": "M_NOT_FOUND", "error": "Not handled by this bridge"})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(tx: mpsc::Sender<Transaction>) -> TransactionState {
        TransactionState {
            hs_token: "hs-secret".to_owned(),
            tx,
            seen_txn_ids: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    #[tokio::test]
    async fn rejects_bad_token() {
        let (tx, _rx) = mpsc::channel(1);
        let state = state(tx);
        let headers = axum::http::HeaderMap::new();
        let query = TokenQuery { access_token: Some("wrong".to_owned()) };
        assert!(!authorized(&state, &headers, &query));
    }

    #[tokio::test]
    async fn duplicate_transactions_are_dropped() {
        let (tx, mut rx) = mpsc::channel(4);
        let state = state(tx);
        let query = Query(TokenQuery { access_token: Some("hs-secret".to_owned()) });
        let headers = axum::http::HeaderMap::new();

        for _ in 0..2 {
            handle_transaction(
                State(state.clone()),
                Path("txn-1".to_owned()),
                Query(TokenQuery { access_token: query.access_token.clone() }),
                headers.clone(),
                Json(Transaction::default()),
            )
            .await;
        }

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
