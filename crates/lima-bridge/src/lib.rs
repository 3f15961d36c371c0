//! # lima-bridge
//!
//! The bridge core: the shared [`Bridge`] context, the per-conversation
//! portal state machine, the puppet registry, user sessions, the formatter,
//! the inbound Matrix handler, and the provisioning API.
//!
//! User/puppet/portal collaborate through the `Bridge` context and look each
//! other up by id — there are no direct references between the three, so no
//! reference cycles.

pub mod formatter;
pub mod matrix;
pub mod portal;
pub mod provisioning;
pub mod puppet;
pub mod user;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use lima_common::config::AppConfig;
use lima_db::Database;
use lima_linkedin::Urn;
use lima_matrix::Appservice;
use tokio::sync::{Mutex, RwLock, watch};

use crate::portal::{Portal, PortalKey};
use crate::puppet::Puppet;
use crate::user::User;

/// Shared context wiring every component together. One per process.
pub struct Bridge {
    pub config: &'static AppConfig,
    pub db: Database,
    pub appservice: Arc<Appservice>,

    users_by_mxid: RwLock<HashMap<String, Arc<User>>>,
    users_by_urn: RwLock<HashMap<Urn, Arc<User>>>,
    user_create_lock: Mutex<()>,

    puppets_by_urn: RwLock<HashMap<Urn, Arc<Puppet>>>,
    puppets_by_custom_mxid: RwLock<HashMap<String, Arc<Puppet>>>,
    puppet_create_lock: Mutex<()>,

    portals_by_key: RwLock<HashMap<PortalKey, Arc<Portal>>>,
    portals_by_mxid: RwLock<HashMap<String, Arc<Portal>>>,
    portal_create_lock: Mutex<()>,

    /// Ghost localpart template split at `{userid}`.
    username_prefix: String,
    username_suffix: String,

    shutdown_tx: watch::Sender<bool>,
}

impl Bridge {
    pub fn new(config: &'static AppConfig, db: Database, appservice: Arc<Appservice>) -> Arc<Self> {
        let (username_prefix, username_suffix) = config
            .bridge
            .username_template
            .split_once("{userid}")
            .map(|(pre, post)| (pre.to_owned(), post.to_owned()))
            .unwrap_or_else(|| (config.bridge.username_template.clone(), String::new()));

        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            config,
            db,
            appservice,
            users_by_mxid: RwLock::new(HashMap::new()),
            users_by_urn: RwLock::new(HashMap::new()),
            user_create_lock: Mutex::new(()),
            puppets_by_urn: RwLock::new(HashMap::new()),
            puppets_by_custom_mxid: RwLock::new(HashMap::new()),
            puppet_create_lock: Mutex::new(()),
            portals_by_key: RwLock::new(HashMap::new()),
            portals_by_mxid: RwLock::new(HashMap::new()),
            portal_create_lock: Mutex::new(()),
            username_prefix,
            username_suffix,
            shutdown_tx,
        })
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    /// Cancellation signal handed to every long-lived task.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    // ── Ghost mxid template ──────────────────────────────────────────────────

    /// The ghost mxid for a LinkedIn member URN.
    pub fn ghost_mxid(&self, li_member_urn: &Urn) -> String {
        format!(
            "@{}{}{}:{}",
            self.username_prefix,
            li_member_urn.id_str(),
            self.username_suffix,
            self.appservice.domain
        )
    }

    /// Parse the member URN out of a ghost mxid. `None` for anything outside
    /// the puppet namespace (including the bridge bot).
    pub fn urn_from_ghost_mxid(&self, mxid: &str) -> Option<Urn> {
        let localpart = mxid
            .strip_prefix('@')?
            .strip_suffix(&format!(":{}", self.appservice.domain))?;
        let id = localpart
            .strip_prefix(self.username_prefix.as_str())?
            .strip_suffix(self.username_suffix.as_str())?;
        if id.is_empty() {
            return None;
        }
        Some(Urn::new(id))
    }

    pub fn is_bridge_ghost(&self, mxid: &str) -> bool {
        self.urn_from_ghost_mxid(mxid).is_some()
    }

    // ── User registry ────────────────────────────────────────────────────────

    pub async fn get_user_by_mxid(
        &self,
        mxid: &str,
        create: bool,
    ) -> Result<Option<Arc<User>>> {
        // Ghosts and the bot never get user sessions.
        if self.is_bridge_ghost(mxid) || mxid == self.appservice.bot_mxid {
            return Ok(None);
        }
        if let Some(user) = self.users_by_mxid.read().await.get(mxid) {
            return Ok(Some(user.clone()));
        }

        let _guard = self.user_create_lock.lock().await;
        if let Some(user) = self.users_by_mxid.read().await.get(mxid) {
            return Ok(Some(user.clone()));
        }

        if let Some(row) = lima_db::repository::users::get_by_mxid(&self.db.pool, mxid).await? {
            let user = Arc::new(User::from_row(self, row));
            self.cache_user(&user).await;
            return Ok(Some(user));
        }

        if !create {
            return Ok(None);
        }

        tracing::debug!("Creating user instance for {mxid}");
        let user = Arc::new(User::new(self, mxid.to_owned()));
        lima_db::repository::users::insert(&self.db.pool, &user.row().await).await?;
        self.cache_user(&user).await;
        Ok(Some(user))
    }

    pub async fn get_user_by_urn(&self, li_member_urn: &Urn) -> Result<Option<Arc<User>>> {
        if let Some(user) = self.users_by_urn.read().await.get(li_member_urn) {
            return Ok(Some(user.clone()));
        }
        Ok(None)
    }

    pub(crate) async fn cache_user(&self, user: &Arc<User>) {
        self.users_by_mxid.write().await.insert(user.mxid.clone(), user.clone());
        if let Some(urn) = user.li_member_urn().await {
            self.users_by_urn.write().await.insert(urn, user.clone());
        }
    }

    pub async fn all_cached_users(&self) -> Vec<Arc<User>> {
        self.users_by_mxid.read().await.values().cloned().collect()
    }

    // ── Puppet registry ──────────────────────────────────────────────────────

    pub async fn get_puppet_by_urn(
        &self,
        li_member_urn: &Urn,
        create: bool,
    ) -> Result<Option<Arc<Puppet>>> {
        if let Some(puppet) = self.puppets_by_urn.read().await.get(li_member_urn) {
            return Ok(Some(puppet.clone()));
        }

        let _guard = self.puppet_create_lock.lock().await;
        if let Some(puppet) = self.puppets_by_urn.read().await.get(li_member_urn) {
            return Ok(Some(puppet.clone()));
        }

        if let Some(row) =
            lima_db::repository::puppets::get_by_li_member_urn(&self.db.pool, li_member_urn).await?
        {
            let puppet = Arc::new(Puppet::from_row(self, row));
            self.cache_puppet(&puppet).await;
            return Ok(Some(puppet));
        }

        if !create {
            return Ok(None);
        }

        let puppet = Arc::new(Puppet::new(self, li_member_urn.clone()));
        lima_db::repository::puppets::insert(&self.db.pool, &puppet.row().await).await?;
        self.cache_puppet(&puppet).await;
        Ok(Some(puppet))
    }

    /// Resolve a ghost mxid to its puppet by parsing the templated localpart.
    pub async fn get_puppet_by_mxid(
        &self,
        mxid: &str,
        create: bool,
    ) -> Result<Option<Arc<Puppet>>> {
        match self.urn_from_ghost_mxid(mxid) {
            Some(urn) => self.get_puppet_by_urn(&urn, create).await,
            None => Ok(None),
        }
    }

    pub async fn get_puppet_by_custom_mxid(&self, mxid: &str) -> Result<Option<Arc<Puppet>>> {
        if let Some(puppet) = self.puppets_by_custom_mxid.read().await.get(mxid) {
            return Ok(Some(puppet.clone()));
        }
        // Double puppets are loaded eagerly at startup; a cache miss here is a
        // genuine miss.
        Ok(None)
    }

    pub(crate) async fn cache_puppet(&self, puppet: &Arc<Puppet>) {
        self.puppets_by_urn
            .write()
            .await
            .insert(puppet.li_member_urn.clone(), puppet.clone());
        if let Some(custom_mxid) = puppet.custom_mxid().await {
            self.puppets_by_custom_mxid.write().await.insert(custom_mxid, puppet.clone());
        }
    }

    pub(crate) async fn uncache_custom_mxid(&self, mxid: &str) {
        self.puppets_by_custom_mxid.write().await.remove(mxid);
    }

    // ── Portal registry ──────────────────────────────────────────────────────

    pub async fn get_portal_by_thread(
        &self,
        li_thread_urn: &Urn,
        li_receiver_urn: Option<&Urn>,
        create: bool,
    ) -> Result<Option<Arc<Portal>>> {
        let key = PortalKey::new(li_thread_urn, li_receiver_urn);
        if let Some(portal) = self.portals_by_key.read().await.get(&key) {
            return Ok(Some(portal.clone()));
        }

        let _guard = self.portal_create_lock.lock().await;
        if let Some(portal) = self.portals_by_key.read().await.get(&key) {
            return Ok(Some(portal.clone()));
        }

        if let Some(row) = lima_db::repository::portals::get_by_thread(
            &self.db.pool,
            li_thread_urn,
            li_receiver_urn,
        )
        .await?
        {
            let portal = Arc::new(Portal::from_row(row));
            self.cache_portal(&portal).await;
            return Ok(Some(portal));
        }

        if !create {
            return Ok(None);
        }

        let portal = Arc::new(Portal::new(li_thread_urn.clone(), li_receiver_urn.cloned()));
        lima_db::repository::portals::insert(&self.db.pool, &portal.row().await).await?;
        self.cache_portal(&portal).await;
        Ok(Some(portal))
    }

    pub async fn get_portal_by_mxid(&self, mxid: &str) -> Result<Option<Arc<Portal>>> {
        if let Some(portal) = self.portals_by_mxid.read().await.get(mxid) {
            return Ok(Some(portal.clone()));
        }

        let _guard = self.portal_create_lock.lock().await;
        if let Some(portal) = self.portals_by_mxid.read().await.get(mxid) {
            return Ok(Some(portal.clone()));
        }

        if let Some(row) = lima_db::repository::portals::get_by_mxid(&self.db.pool, mxid).await? {
            let portal = Arc::new(Portal::from_row(row));
            self.cache_portal(&portal).await;
            return Ok(Some(portal));
        }
        Ok(None)
    }

    pub(crate) async fn cache_portal(&self, portal: &Arc<Portal>) {
        self.portals_by_key.write().await.insert(portal.key.clone(), portal.clone());
        if let Some(mxid) = portal.mxid().await {
            self.portals_by_mxid.write().await.insert(mxid, portal.clone());
        }
    }

    /// Register a freshly created room id in the by-mxid index.
    pub(crate) async fn index_portal_mxid(&self, key: &PortalKey, mxid: &str) {
        let portal = self.portals_by_key.read().await.get(key).cloned();
        if let Some(portal) = portal {
            self.portals_by_mxid.write().await.insert(mxid.to_owned(), portal);
        }
    }

    pub(crate) async fn uncache_portal(&self, key: &PortalKey, mxid: Option<&str>) {
        self.portals_by_key.write().await.remove(key);
        if let Some(mxid) = mxid {
            self.portals_by_mxid.write().await.remove(mxid);
        }
    }

    /// Re-index a puppet under its (new) custom mxid after `switch_mxid`.
    pub(crate) async fn recache_custom_mxid(&self, li_member_urn: &Urn) {
        let puppet = self.puppets_by_urn.read().await.get(li_member_urn).cloned();
        if let Some(puppet) = puppet {
            if let Some(custom_mxid) = puppet.custom_mxid().await {
                self.puppets_by_custom_mxid.write().await.insert(custom_mxid, puppet);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // Template parsing is pure; exercise it without a database.
    fn split_template(template: &str) -> (String, String) {
        template
            .split_once("{userid}")
            .map(|(pre, post)| (pre.to_owned(), post.to_owned()))
            .unwrap_or_else(|| (template.to_owned(), String::new()))
    }

    #[test]
    fn username_template_splits_at_placeholder() {
        assert_eq!(split_template("linkedin_{userid}"), ("linkedin_".into(), "".into()));
        assert_eq!(split_template("li_{userid}_x"), ("li_".into(), "_x".into()));
    }
}
