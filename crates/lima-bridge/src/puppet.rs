//! Ghost ("puppet") accounts: one Matrix user per LinkedIn member.

use std::sync::Arc;

use anyhow::{Context, Result};
use lima_db::repository::puppets::{self, PuppetRow};
use lima_linkedin::Urn;
use lima_linkedin::types::{MessagingMember, MiniProfile, Picture};
use lima_matrix::Intent;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::Bridge;
use crate::portal::Portal;

/// Matches the content-addressed segment of LinkedIn avatar URLs.
fn photo_id_regex() -> &'static Regex {
    static PHOTO_ID: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PHOTO_ID.get_or_init(|| {
        Regex::new(r"https://.*?/image/(.*?)/(profile|spinmail)-.*").expect("valid photo id regex")
    })
}

/// Minimal magic-byte sniffing for avatar uploads. LinkedIn serves avatars
/// without a usable extension in the URL.
pub(crate) fn sniff_image_mime(data: &[u8]) -> &'static str {
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if data.starts_with(b"GIF8") {
        "image/gif"
    } else if data.len() > 11 && &data[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

pub struct Puppet {
    pub li_member_urn: Urn,
    /// The templated ghost mxid.
    pub default_mxid: String,
    row: tokio::sync::Mutex<PuppetRow>,
}

impl Puppet {
    pub(crate) fn new(bridge: &Bridge, li_member_urn: Urn) -> Self {
        let default_mxid = bridge.ghost_mxid(&li_member_urn);
        Self {
            li_member_urn: li_member_urn.clone(),
            default_mxid,
            row: tokio::sync::Mutex::new(PuppetRow::new(li_member_urn)),
        }
    }

    pub(crate) fn from_row(bridge: &Bridge, row: PuppetRow) -> Self {
        let default_mxid = bridge.ghost_mxid(&row.li_member_urn);
        Self {
            li_member_urn: row.li_member_urn.clone(),
            default_mxid,
            row: tokio::sync::Mutex::new(row),
        }
    }

    pub(crate) async fn row(&self) -> PuppetRow {
        self.row.lock().await.clone()
    }

    pub async fn custom_mxid(&self) -> Option<String> {
        self.row.lock().await.custom_mxid.clone()
    }

    pub async fn displayname(&self) -> Option<String> {
        self.row.lock().await.name.clone()
    }

    async fn save(&self, bridge: &Bridge) -> Result<()> {
        let row = self.row.lock().await.clone();
        puppets::save(&bridge.db.pool, &row).await?;
        Ok(())
    }

    // ── Intents ──────────────────────────────────────────────────────────────

    /// The ghost's own appservice-scoped intent.
    pub fn default_intent(&self, bridge: &Bridge) -> Intent {
        bridge.appservice.intent(&self.default_mxid)
    }

    /// The double-puppet intent, when a real user is attached.
    pub async fn custom_intent(&self, bridge: &Bridge) -> Option<Intent> {
        let row = self.row.lock().await;
        let (mxid, token) = (row.custom_mxid.as_ref()?, row.access_token.as_ref()?);
        Some(bridge.appservice.double_puppet_intent(mxid, token, row.base_url.as_deref()))
    }

    /// Intent used when acting in a given portal: the plain ghost when this
    /// puppet is the DM counterpart (or while backfilling with
    /// `invite_own_puppet`), otherwise the double puppet when available.
    pub async fn intent_for(&self, bridge: &Bridge, portal: &Portal) -> Intent {
        let is_other_user = portal.other_user_urn().await.as_ref() == Some(&self.li_member_urn);
        let backfilling =
            portal.is_backfilling() && bridge.config.bridge.backfill.invite_own_puppet;
        if is_other_user || backfilling {
            return self.default_intent(bridge);
        }
        match self.custom_intent(bridge).await {
            Some(intent) => intent,
            None => self.default_intent(bridge),
        }
    }

    // ── Profile sync ─────────────────────────────────────────────────────────

    /// Refresh displayname and avatar from a LinkedIn member record.
    pub async fn update_info(
        &self,
        bridge: &Arc<Bridge>,
        source: &crate::user::User,
        info: &MessagingMember,
        update_avatar: bool,
    ) -> Result<()> {
        let mut changed = self.update_name(bridge, info).await?;
        if update_avatar {
            let picture = info
                .alternate_image
                .as_ref()
                .or_else(|| info.mini_profile.as_ref().and_then(|p| p.picture.as_ref()));
            changed |= self.update_photo(bridge, source, picture).await?;
        }
        if changed {
            self.save(bridge).await?;
        }
        Ok(())
    }

    fn pick_displayname(bridge: &Bridge, info: &MessagingMember) -> Result<String> {
        let profile: &MiniProfile = info
            .mini_profile
            .as_ref()
            .with_context(|| format!("no mini profile for {:?}", info.entity_urn))?;
        let first = profile.first_name.clone().unwrap_or_default();
        let last = profile.last_name.clone().unwrap_or_default();
        let alternate = info.alternate_name.clone().unwrap_or_default();

        let full_name = format!("{first} {last}").trim().to_owned();
        let mut displayname = alternate.clone();
        for preference in &bridge.config.bridge.displayname_preference {
            let candidate = match preference.as_str() {
                "displayname" => alternate.clone(),
                "name" => {
                    if alternate.is_empty() { full_name.clone() } else { alternate.clone() }
                }
                "first_name" => if alternate.is_empty() { first.clone() } else { alternate.clone() },
                "last_name" => last.clone(),
                _ => String::new(),
            };
            if !candidate.is_empty() {
                displayname = candidate;
                break;
            }
        }

        Ok(bridge
            .config
            .bridge
            .displayname_template
            .replace("{displayname}", &displayname))
    }

    async fn update_name(&self, bridge: &Arc<Bridge>, info: &MessagingMember) -> Result<bool> {
        let name = match Self::pick_displayname(bridge, info) {
            Ok(name) => name,
            Err(e) => {
                debug!("Skipping name update for {}: {e}", self.li_member_urn);
                return Ok(false);
            }
        };

        let mut row = self.row.lock().await;
        if Some(&name) == row.name.as_ref() && row.name_set {
            return Ok(false);
        }
        row.name = Some(name.clone());
        drop(row);

        match self.default_intent(bridge).set_displayname(&name).await {
            Ok(()) => self.row.lock().await.name_set = true,
            Err(e) => {
                // Retried on the next sync.
                warn!("Failed to set displayname for {}: {e}", self.default_mxid);
                self.row.lock().await.name_set = false;
            }
        }
        Ok(true)
    }

    fn extract_photo_id(picture: Option<&Picture>) -> Option<String> {
        let vector_image = picture?.vector_image.as_ref()?;
        let re = photo_id_regex();
        if let Some(captures) = re.captures(&vector_image.root_url) {
            return Some(captures[1].to_owned());
        }
        // InMail pictures have no root_url; the id lives in the artifact path.
        let first_artifact = vector_image.artifacts.first()?;
        re.captures(&first_artifact.file_identifying_url_path_segment)
            .map(|captures| captures[1].to_owned())
    }

    async fn update_photo(
        &self,
        bridge: &Arc<Bridge>,
        source: &crate::user::User,
        picture: Option<&Picture>,
    ) -> Result<bool> {
        let photo_id = Self::extract_photo_id(picture);
        {
            let row = self.row.lock().await;
            if photo_id == row.photo_id && row.avatar_set {
                return Ok(false);
            }
        }
        self.row.lock().await.photo_id = photo_id.clone();

        let mut photo_mxc = String::new();
        if photo_id.is_some() {
            if let (Some(picture), Some(client)) = (picture, source.client().await) {
                match client.download_profile_picture(picture).await {
                    Ok(data) => {
                        let mime = sniff_image_mime(&data);
                        match self
                            .default_intent(bridge)
                            .upload_media(data, mime, "avatar")
                            .await
                        {
                            Ok(mxc) => photo_mxc = mxc,
                            Err(e) => {
                                warn!("Failed to reupload avatar for {}: {e}", self.li_member_urn);
                                self.row.lock().await.avatar_set = false;
                                return Ok(true);
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Failed to download avatar for {}: {e}", self.li_member_urn);
                        self.row.lock().await.avatar_set = false;
                        return Ok(true);
                    }
                }
            }
        }

        self.row.lock().await.photo_mxc =
            if photo_mxc.is_empty() { None } else { Some(photo_mxc.clone()) };

        match self.default_intent(bridge).set_avatar_url(&photo_mxc).await {
            Ok(()) => self.row.lock().await.avatar_set = true,
            Err(e) => {
                warn!("Failed to set avatar for {}: {e}", self.default_mxid);
                self.row.lock().await.avatar_set = false;
            }
        }
        Ok(true)
    }

    /// Register the ghost on the homeserver if it has not been yet.
    pub async fn ensure_registered(&self, bridge: &Arc<Bridge>) -> Result<()> {
        if self.row.lock().await.is_registered {
            return Ok(());
        }
        self.default_intent(bridge).ensure_registered().await?;
        self.row.lock().await.is_registered = true;
        self.save(bridge).await
    }

    // ── Double puppeting ─────────────────────────────────────────────────────

    /// Attach (or detach, with `None`) a real Matrix account to this ghost.
    pub async fn switch_mxid(
        &self,
        bridge: &Arc<Bridge>,
        access_token: Option<String>,
        mxid: Option<String>,
    ) -> Result<()> {
        let previous = self.custom_mxid().await;
        // Users on other homeservers may need a different CS-API base URL.
        let base_url = mxid
            .as_deref()
            .and_then(|m| m.rsplit_once(':'))
            .and_then(|(_, domain)| {
                bridge.config.bridge.double_puppet_server_map.get(domain).cloned()
            });
        {
            let mut row = self.row.lock().await;
            row.custom_mxid = mxid.clone();
            row.access_token = access_token;
            row.base_url = base_url;
            row.next_batch = None;
        }
        self.save(bridge).await?;

        if let Some(previous) = previous {
            bridge.uncache_custom_mxid(&previous).await;
        }
        if mxid.is_some() {
            bridge.recache_custom_mxid(&self.li_member_urn).await;
            self.start_double_puppet(bridge).await;
        }
        Ok(())
    }

    /// Validate the stored access token against the homeserver. Called at
    /// startup for every puppet with a custom mxid and after `switch_mxid`.
    pub async fn start_double_puppet(&self, bridge: &Arc<Bridge>) {
        let Some(intent) = self.custom_intent(bridge).await else { return };
        let expected = self.custom_mxid().await.unwrap_or_default();
        match intent.whoami().await {
            Ok(mxid) if mxid == expected => {
                info!("Double puppet for {expected} validated");
            }
            Ok(mxid) => {
                warn!("Double puppet token for {expected} belongs to {mxid}, detaching");
                let mut row = self.row.lock().await;
                row.custom_mxid = None;
                row.access_token = None;
                drop(row);
                bridge.uncache_custom_mxid(&expected).await;
                if let Err(e) = self.save(bridge).await {
                    warn!("Failed to persist double puppet detach: {e}");
                }
            }
            Err(e) => {
                warn!("Failed to validate double puppet for {expected}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lima_linkedin::types::{Artifact, VectorImage};

    fn picture(root_url: &str, artifact_segment: &str) -> Picture {
        Picture {
            vector_image: Some(VectorImage {
                root_url: root_url.to_owned(),
                artifacts: vec![Artifact {
                    file_identifying_url_path_segment: artifact_segment.to_owned(),
                    ..Default::default()
                }],
            }),
        }
    }

    #[test]
    fn photo_id_extracted_from_root_url() {
        let picture = picture(
            "https://media.licdn.com/mpr/mpr/image/C4D03AQFooBar/profile-displayphoto-shrink_",
            "",
        );
        assert_eq!(
            Puppet::extract_photo_id(Some(&picture)).as_deref(),
            Some("C4D03AQFooBar")
        );
    }

    #[test]
    fn photo_id_falls_back_to_artifact_for_inmail() {
        let picture = picture(
            "",
            "https://media.licdn.com/mpr/image/C4D03AQAdvert/spinmail-logo_100_100/0",
        );
        assert_eq!(
            Puppet::extract_photo_id(Some(&picture)).as_deref(),
            Some("C4D03AQAdvert")
        );
    }

    #[test]
    fn no_picture_means_no_photo_id() {
        assert_eq!(Puppet::extract_photo_id(None), None);
        assert_eq!(Puppet::extract_photo_id(Some(&Picture::default())), None);
    }

    #[test]
    fn image_mime_sniffing() {
        assert_eq!(sniff_image_mime(&[0x89, b'P', b'N', b'G', 0x0D]), "image/png");
        assert_eq!(sniff_image_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(sniff_image_mime(b"GIF89a"), "image/gif");
        assert_eq!(sniff_image_mime(b"plain text"), "application/octet-stream");
    }
}
