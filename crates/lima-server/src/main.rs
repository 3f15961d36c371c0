//! # lima
//!
//! Main binary for the Matrix-LinkedIn Messages puppeting bridge.
//!
//! Startup order matters: store → migrations → appservice → double puppets →
//! user sessions → HTTP server. Shutdown reverses it: stop listener
//! restarts, cancel listeners, persist sessions, close the store.

use std::net::SocketAddr;
use std::sync::Arc;

use lima_bridge::{Bridge, matrix, provisioning};
use lima_db::Database;
use lima_matrix::{Appservice, transaction_router};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = lima_common::config::init()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.clone().into()),
        )
        .with_target(true)
        .init();

    tracing::info!("Starting lima v{}", env!("CARGO_PKG_VERSION"));

    // === Store ===
    let db = Database::connect(&config.appservice.database).await?;
    db.migrate().await?;

    // === Matrix appservice ===
    let appservice = Arc::new(Appservice::new(
        config.homeserver.address.clone(),
        config.homeserver.domain.clone(),
        config.appservice.as_token.clone(),
        config.appservice.hs_token.clone(),
        &config.appservice.bot_username,
        config.bridge_state.status_endpoint.clone(),
        config.bridge_state.message_send_checkpoint_endpoint.clone(),
    ));

    let bridge = Bridge::new(config, db, appservice.clone());

    // === Bridge bot ===
    let bot = appservice.bot_intent();
    if let Err(e) = bot.ensure_registered().await {
        tracing::warn!("Failed to register the bridge bot: {e}");
    }
    if let Err(e) = bot.set_displayname(&config.appservice.bot_displayname).await {
        tracing::warn!("Failed to set the bridge bot displayname: {e}");
    }

    // === Double puppets ===
    // Validate stored access tokens before any portal work needs them.
    let custom_puppets =
        lima_db::repository::puppets::all_with_custom_mxid(&bridge.db.pool).await?;
    for row in custom_puppets {
        if let Some(puppet) = bridge.get_puppet_by_urn(&row.li_member_urn, false).await? {
            let bridge = bridge.clone();
            tokio::spawn(async move { puppet.start_double_puppet(&bridge).await });
        }
    }

    // === User sessions ===
    let logged_in = lima_db::repository::users::all_logged_in(&bridge.db.pool).await?;
    let loads = logged_in.into_iter().map(|row| {
        let bridge = bridge.clone();
        async move {
            match bridge.get_user_by_mxid(&row.mxid, false).await {
                Ok(Some(user)) => {
                    if let Err(e) = user.load_session(&bridge).await {
                        tracing::error!("Failed to load session for {}: {e:#}", row.mxid);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::error!("Failed to load user {}: {e:#}", row.mxid),
            }
        }
    });
    futures_util::future::join_all(loads).await;

    // === Appservice HTTP server ===
    let (txn_tx, txn_rx) = mpsc::channel(64);
    let handler = tokio::spawn(matrix::run(bridge.clone(), txn_rx));

    let mut app = transaction_router(config.appservice.hs_token.clone(), txn_tx);
    if config.appservice.provisioning.enabled {
        app = app.merge(provisioning::router(bridge.clone()));
    }
    let app = app.layer(tower_http::trace::TraceLayer::new_for_http());

    let addr: SocketAddr =
        format!("{}:{}", config.appservice.hostname, config.appservice.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Appservice listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    // === Graceful shutdown ===
    // The shutdown flag keeps listener supervisors from restarting streams.
    bridge.begin_shutdown();
    for user in bridge.all_cached_users().await {
        user.stop_listen().await;
        if let Err(e) = user.persist_session(&bridge).await {
            tracing::warn!("Failed to persist session for {}: {e:#}", user.mxid);
        }
    }
    handler.abort();
    bridge.db.pool.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
