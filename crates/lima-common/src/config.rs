//! Bridge configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for
//! production. Config precedence: env vars > .env file > config.toml > defaults.
//!
//! Environment overrides use the `MAUTRIX_LINKEDIN` prefix with `__` as the
//! nesting separator, e.g. `MAUTRIX_LINKEDIN_BRIDGE__INITIAL_CHAT_SYNC=20`.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::Deserialize;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Load the configuration and install it for the lifetime of the process.
///
/// Called once at startup; the returned reference is threaded through the
/// `Bridge` context rather than re-read from a global.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = builder()?.build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
    let builder = config::Config::builder()
        // Defaults
        .set_default("homeserver.address", "http://localhost:8008")?
        .set_default("homeserver.domain", "localhost")?
        .set_default("appservice.hostname", "0.0.0.0")?
        .set_default("appservice.port", 29319)?
        .set_default("appservice.address", "http://localhost:29319")?
        .set_default("appservice.id", "linkedin")?
        .set_default("appservice.bot_username", "linkedinbot")?
        .set_default("appservice.bot_displayname", "LinkedIn bridge bot")?
        .set_default("appservice.bot_avatar", "")?
        .set_default("appservice.database", "sqlite:lima.db")?
        .set_default("appservice.provisioning.enabled", true)?
        .set_default("appservice.provisioning.prefix", "/api")?
        .set_default("appservice.provisioning.shared_secret", "")?
        .set_default("bridge.username_template", "linkedin_{userid}")?
        .set_default("bridge.displayname_template", "{displayname} (LinkedIn)")?
        .set_default(
            "bridge.displayname_preference",
            vec!["displayname", "name", "first_name"],
        )?
        .set_default("bridge.command_prefix", "!li")?
        .set_default("bridge.initial_chat_sync", 10)?
        .set_default("bridge.backfill.initial_limit", 20)?
        .set_default("bridge.backfill.missed_limit", 500)?
        .set_default("bridge.backfill.disable_notifications", true)?
        .set_default("bridge.backfill.invite_own_puppet", true)?
        .set_default("bridge.backfill.unread_hours_threshold", 72)?
        .set_default("bridge.invite_own_puppet_to_pm", false)?
        .set_default("bridge.sync_with_custom_puppets", true)?
        .set_default("bridge.set_topic_on_dms", true)?
        .set_default("bridge.mute_bridging", true)?
        .set_default("bridge.temporary_disconnect_notices", true)?
        .set_default("bridge.encryption.allow", false)?
        .set_default("bridge.encryption.default", false)?
        .set_default("logging.filter", "lima=debug,tower_http=info")?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (MAUTRIX_LINKEDIN_BRIDGE__INITIAL_CHAT_SYNC, …)
        .add_source(
            config::Environment::with_prefix("MAUTRIX_LINKEDIN")
                .separator("__")
                .try_parsing(true),
        );
    Ok(builder)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub homeserver: HomeserverConfig,
    pub appservice: AppserviceConfig,
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub bridge_state: BridgeStateConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HomeserverConfig {
    /// Base URL of the homeserver's client-server API.
    pub address: String,
    /// Server name used in mxids (e.g. "example.com").
    pub domain: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppserviceConfig {
    /// Public URL the homeserver uses to reach this appservice.
    pub address: String,
    pub hostname: String,
    pub port: u16,
    /// Appservice registration id.
    pub id: String,
    pub bot_username: String,
    pub bot_displayname: String,
    /// mxc URI shown in bridge-info state events. Empty for none.
    pub bot_avatar: String,
    /// Token this appservice sends to the homeserver.
    pub as_token: String,
    /// Token the homeserver sends to this appservice.
    pub hs_token: String,
    /// Database URL — `postgres://…` for full mode, `sqlite:…` for lite mode.
    pub database: String,
    pub provisioning: ProvisioningConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvisioningConfig {
    pub enabled: bool,
    /// URL prefix the provisioning routes are mounted under.
    pub prefix: String,
    /// Bearer token required on every provisioning request.
    pub shared_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConfig {
    /// Localpart template for ghost users. `{userid}` is replaced with the
    /// LinkedIn member URN id part.
    pub username_template: String,
    /// Displayname template. `{displayname}` is replaced per
    /// `displayname_preference`.
    pub displayname_template: String,
    /// Ordered field preference for picking a ghost displayname.
    pub displayname_preference: Vec<String>,
    pub command_prefix: String,
    /// How many conversations to touch during the initial thread sync.
    pub initial_chat_sync: usize,
    pub backfill: BackfillConfig,
    /// Whether to invite the user's own ghost to DMs (for self-message echo).
    pub invite_own_puppet_to_pm: bool,
    pub sync_with_custom_puppets: bool,
    pub set_topic_on_dms: bool,
    /// Mirror LinkedIn mute flags to Matrix push rules.
    pub mute_bridging: bool,
    pub temporary_disconnect_notices: bool,
    pub encryption: EncryptionConfig,
    /// homeserver domain -> base URL overrides for double puppeting.
    #[serde(default)]
    pub double_puppet_server_map: HashMap<String, String>,
    /// homeserver domain -> shared secret for automatic double-puppet login.
    #[serde(default)]
    pub login_shared_secret_map: HashMap<String, String>,
    /// mxid or homeserver -> permission level ("relay", "user", "admin").
    #[serde(default)]
    pub permissions: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackfillConfig {
    /// Message limit for the first backfill of a new portal.
    /// 0 disables backfill, negative means unbounded.
    pub initial_limit: i64,
    /// Message limit when catching up an existing portal.
    pub missed_limit: i64,
    pub disable_notifications: bool,
    pub invite_own_puppet: bool,
    /// Place a read marker after backfill if the conversation was unread and
    /// its last activity is at most this many hours old.
    pub unread_hours_threshold: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EncryptionConfig {
    pub allow: bool,
    /// Create new portals encrypted by default.
    pub default: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BridgeStateConfig {
    /// Endpoint bridge-state pings are POSTed to. None disables reporting.
    pub status_endpoint: Option<String>,
    /// Endpoint message send checkpoints are POSTed to. None disables them.
    pub message_send_checkpoint_endpoint: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// tracing-subscriber env-filter expression.
    pub filter: String,
}

/// Permission level granted to a Matrix user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PermissionLevel {
    None,
    Relay,
    User,
    Admin,
}

impl PermissionLevel {
    fn parse(value: &str) -> Self {
        match value {
            "admin" => Self::Admin,
            "user" | "full" => Self::User,
            "relay" => Self::Relay,
            _ => Self::None,
        }
    }
}

impl BridgeConfig {
    /// Resolve the permission level for an mxid: exact mxid match first, then
    /// the user's homeserver, then the `*` wildcard.
    pub fn permission_level(&self, mxid: &str) -> PermissionLevel {
        if let Some(level) = self.permissions.get(mxid) {
            return PermissionLevel::parse(level);
        }
        if let Some(idx) = mxid.find(':') {
            if let Some(level) = self.permissions.get(&mxid[idx + 1..]) {
                return PermissionLevel::parse(level);
            }
        }
        self.permissions
            .get("*")
            .map(|l| PermissionLevel::parse(l))
            .unwrap_or(PermissionLevel::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge_config(permissions: &[(&str, &str)]) -> BridgeConfig {
        BridgeConfig {
            username_template: "linkedin_{userid}".into(),
            displayname_template: "{displayname} (LinkedIn)".into(),
            displayname_preference: vec!["displayname".into(), "name".into()],
            command_prefix: "!li".into(),
            initial_chat_sync: 10,
            backfill: BackfillConfig {
                initial_limit: 20,
                missed_limit: 500,
                disable_notifications: true,
                invite_own_puppet: true,
                unread_hours_threshold: 72,
            },
            invite_own_puppet_to_pm: false,
            sync_with_custom_puppets: true,
            set_topic_on_dms: true,
            mute_bridging: true,
            temporary_disconnect_notices: true,
            encryption: EncryptionConfig { allow: false, default: false },
            double_puppet_server_map: HashMap::new(),
            login_shared_secret_map: HashMap::new(),
            permissions: permissions
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn permission_exact_match_wins_over_homeserver() {
        let config = bridge_config(&[
            ("@alice:example.com", "admin"),
            ("example.com", "user"),
            ("*", "relay"),
        ]);
        assert_eq!(config.permission_level("@alice:example.com"), PermissionLevel::Admin);
        assert_eq!(config.permission_level("@bob:example.com"), PermissionLevel::User);
        assert_eq!(config.permission_level("@eve:other.com"), PermissionLevel::Relay);
    }

    #[test]
    fn permission_defaults_to_none_without_wildcard() {
        let config = bridge_config(&[("example.com", "user")]);
        assert_eq!(config.permission_level("@eve:other.com"), PermissionLevel::None);
    }
}
