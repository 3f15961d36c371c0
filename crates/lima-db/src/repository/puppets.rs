//! Puppet repository — one ghost account per LinkedIn member URN.

use lima_linkedin::Urn;
use sqlx::{AnyPool, Row, any::AnyRow};

use crate::any_compat::get_urn;

#[derive(Debug, Clone)]
pub struct PuppetRow {
    pub li_member_urn: Urn,
    pub name: Option<String>,
    /// Content-addressed id extracted from the avatar URL; used to detect
    /// picture changes without re-downloading.
    pub photo_id: Option<String>,
    pub photo_mxc: Option<String>,
    pub name_set: bool,
    pub avatar_set: bool,
    pub is_registered: bool,
    pub contact_info_set: bool,
    /// Real Matrix user this ghost is double-puppeted to, if any.
    pub custom_mxid: Option<String>,
    pub access_token: Option<String>,
    pub next_batch: Option<String>,
    pub base_url: Option<String>,
}

impl PuppetRow {
    pub fn new(li_member_urn: Urn) -> Self {
        Self {
            li_member_urn,
            name: None,
            photo_id: None,
            photo_mxc: None,
            name_set: false,
            avatar_set: false,
            is_registered: false,
            contact_info_set: false,
            custom_mxid: None,
            access_token: None,
            next_batch: None,
            base_url: None,
        }
    }
}

impl<'r> sqlx::FromRow<'r, AnyRow> for PuppetRow {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(PuppetRow {
            li_member_urn: get_urn(row, "li_member_urn")?,
            name: row.try_get("name")?,
            photo_id: row.try_get("photo_id")?,
            photo_mxc: row.try_get("photo_mxc")?,
            name_set: row.try_get("name_set")?,
            avatar_set: row.try_get("avatar_set")?,
            is_registered: row.try_get("is_registered")?,
            contact_info_set: row.try_get("contact_info_set")?,
            custom_mxid: row.try_get("custom_mxid")?,
            access_token: row.try_get("access_token")?,
            next_batch: row.try_get("next_batch")?,
            base_url: row.try_get("base_url")?,
        })
    }
}

const COLUMNS: &str = "li_member_urn, name, photo_id, photo_mxc, name_set, avatar_set, \
                       is_registered, contact_info_set, custom_mxid, access_token, next_batch, \
                       base_url";

pub async fn get_by_li_member_urn(
    pool: &AnyPool,
    li_member_urn: &Urn,
) -> Result<Option<PuppetRow>, sqlx::Error> {
    sqlx::query_as::<_, PuppetRow>(&format!(
        "SELECT {COLUMNS} FROM puppet WHERE li_member_urn=$1"
    ))
    .bind(li_member_urn.id_str())
    .fetch_optional(pool)
    .await
}

pub async fn get_by_custom_mxid(
    pool: &AnyPool,
    custom_mxid: &str,
) -> Result<Option<PuppetRow>, sqlx::Error> {
    sqlx::query_as::<_, PuppetRow>(&format!(
        "SELECT {COLUMNS} FROM puppet WHERE custom_mxid=$1"
    ))
    .bind(custom_mxid)
    .fetch_optional(pool)
    .await
}

pub async fn all_with_custom_mxid(pool: &AnyPool) -> Result<Vec<PuppetRow>, sqlx::Error> {
    sqlx::query_as::<_, PuppetRow>(&format!(
        "SELECT {COLUMNS} FROM puppet WHERE custom_mxid IS NOT NULL AND custom_mxid <> ''"
    ))
    .fetch_all(pool)
    .await
}

pub async fn insert(pool: &AnyPool, puppet: &PuppetRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO puppet (
               li_member_urn, name, photo_id, photo_mxc, name_set, avatar_set,
               is_registered, contact_info_set, custom_mxid, access_token, next_batch, base_url
           ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
    )
    .bind(puppet.li_member_urn.id_str())
    .bind(&puppet.name)
    .bind(&puppet.photo_id)
    .bind(&puppet.photo_mxc)
    .bind(puppet.name_set)
    .bind(puppet.avatar_set)
    .bind(puppet.is_registered)
    .bind(puppet.contact_info_set)
    .bind(&puppet.custom_mxid)
    .bind(&puppet.access_token)
    .bind(&puppet.next_batch)
    .bind(&puppet.base_url)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn save(pool: &AnyPool, puppet: &PuppetRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"UPDATE puppet
              SET name=$2,
                  photo_id=$3,
                  photo_mxc=$4,
                  name_set=$5,
                  avatar_set=$6,
                  is_registered=$7,
                  contact_info_set=$8,
                  custom_mxid=$9,
                  access_token=$10,
                  next_batch=$11,
                  base_url=$12
            WHERE li_member_urn=$1"#,
    )
    .bind(puppet.li_member_urn.id_str())
    .bind(&puppet.name)
    .bind(&puppet.photo_id)
    .bind(&puppet.photo_mxc)
    .bind(puppet.name_set)
    .bind(puppet.avatar_set)
    .bind(puppet.is_registered)
    .bind(puppet.contact_info_set)
    .bind(&puppet.custom_mxid)
    .bind(&puppet.access_token)
    .bind(&puppet.next_batch)
    .bind(&puppet.base_url)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete(pool: &AnyPool, li_member_urn: &Urn) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM puppet WHERE li_member_urn=$1")
        .bind(li_member_urn.id_str())
        .execute(pool)
        .await?;
    Ok(())
}
