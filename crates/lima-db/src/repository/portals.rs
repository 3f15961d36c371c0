//! Portal repository — one row per (thread URN, receiver URN) pair.
//!
//! The receiver URN participates in the primary key, so the "unassigned"
//! state is stored as an empty string and mapped to `None` here.

use lima_linkedin::Urn;
use sqlx::{AnyPool, Row, any::AnyRow};

use crate::any_compat::{get_opt_urn, get_urn, urn_key};

#[derive(Debug, Clone)]
pub struct PortalRow {
    pub li_thread_urn: Urn,
    pub li_receiver_urn: Option<Urn>,
    pub li_is_group_chat: bool,
    /// The sole non-self participant. Always `None` for group chats.
    pub li_other_user_urn: Option<Urn>,
    /// Assigned exactly once; immutable thereafter.
    pub mxid: Option<String>,
    pub encrypted: bool,
    pub name: Option<String>,
    pub photo_id: Option<String>,
    pub avatar_url: Option<String>,
    pub topic: Option<String>,
    pub name_set: bool,
    pub avatar_set: bool,
    pub topic_set: bool,
}

impl PortalRow {
    pub fn new(li_thread_urn: Urn, li_receiver_urn: Option<Urn>) -> Self {
        Self {
            li_thread_urn,
            li_receiver_urn,
            li_is_group_chat: false,
            li_other_user_urn: None,
            mxid: None,
            encrypted: false,
            name: None,
            photo_id: None,
            avatar_url: None,
            topic: None,
            name_set: false,
            avatar_set: false,
            topic_set: false,
        }
    }
}

impl<'r> sqlx::FromRow<'r, AnyRow> for PortalRow {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(PortalRow {
            li_thread_urn: get_urn(row, "li_thread_urn")?,
            li_receiver_urn: get_opt_urn(row, "li_receiver_urn")?,
            li_is_group_chat: row.try_get("li_is_group_chat")?,
            li_other_user_urn: get_opt_urn(row, "li_other_user_urn")?,
            mxid: row.try_get("mxid")?,
            encrypted: row.try_get("encrypted")?,
            name: row.try_get("name")?,
            photo_id: row.try_get("photo_id")?,
            avatar_url: row.try_get("avatar_url")?,
            topic: row.try_get("topic")?,
            name_set: row.try_get("name_set")?,
            avatar_set: row.try_get("avatar_set")?,
            topic_set: row.try_get("topic_set")?,
        })
    }
}

const COLUMNS: &str = "li_thread_urn, li_receiver_urn, li_is_group_chat, li_other_user_urn, \
                       mxid, encrypted, name, photo_id, avatar_url, topic, name_set, avatar_set, \
                       topic_set";

pub async fn get_by_thread(
    pool: &AnyPool,
    li_thread_urn: &Urn,
    li_receiver_urn: Option<&Urn>,
) -> Result<Option<PortalRow>, sqlx::Error> {
    sqlx::query_as::<_, PortalRow>(&format!(
        "SELECT {COLUMNS} FROM portal WHERE li_thread_urn=$1 AND li_receiver_urn=$2"
    ))
    .bind(li_thread_urn.id_str())
    .bind(urn_key(li_receiver_urn))
    .fetch_optional(pool)
    .await
}

pub async fn get_by_mxid(pool: &AnyPool, mxid: &str) -> Result<Option<PortalRow>, sqlx::Error> {
    sqlx::query_as::<_, PortalRow>(&format!("SELECT {COLUMNS} FROM portal WHERE mxid=$1"))
        .bind(mxid)
        .fetch_optional(pool)
        .await
}

pub async fn all_by_receiver(
    pool: &AnyPool,
    li_receiver_urn: &Urn,
) -> Result<Vec<PortalRow>, sqlx::Error> {
    sqlx::query_as::<_, PortalRow>(&format!(
        "SELECT {COLUMNS} FROM portal WHERE li_receiver_urn=$1"
    ))
    .bind(li_receiver_urn.id_str())
    .fetch_all(pool)
    .await
}

pub async fn all(pool: &AnyPool) -> Result<Vec<PortalRow>, sqlx::Error> {
    sqlx::query_as::<_, PortalRow>(&format!("SELECT {COLUMNS} FROM portal"))
        .fetch_all(pool)
        .await
}

pub async fn insert(pool: &AnyPool, portal: &PortalRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO portal (
               li_thread_urn, li_receiver_urn, li_is_group_chat, li_other_user_urn,
               mxid, encrypted, name, photo_id, avatar_url, topic, name_set, avatar_set, topic_set
           ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"#,
    )
    .bind(portal.li_thread_urn.id_str())
    .bind(urn_key(portal.li_receiver_urn.as_ref()))
    .bind(portal.li_is_group_chat)
    .bind(portal.li_other_user_urn.as_ref().map(Urn::id_str))
    .bind(&portal.mxid)
    .bind(portal.encrypted)
    .bind(&portal.name)
    .bind(&portal.photo_id)
    .bind(&portal.avatar_url)
    .bind(&portal.topic)
    .bind(portal.name_set)
    .bind(portal.avatar_set)
    .bind(portal.topic_set)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn save(pool: &AnyPool, portal: &PortalRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"UPDATE portal
              SET li_is_group_chat=$3,
                  li_other_user_urn=$4,
                  mxid=$5,
                  encrypted=$6,
                  name=$7,
                  photo_id=$8,
                  avatar_url=$9,
                  topic=$10,
                  name_set=$11,
                  avatar_set=$12,
                  topic_set=$13
            WHERE li_thread_urn=$1 AND li_receiver_urn=$2"#,
    )
    .bind(portal.li_thread_urn.id_str())
    .bind(urn_key(portal.li_receiver_urn.as_ref()))
    .bind(portal.li_is_group_chat)
    .bind(portal.li_other_user_urn.as_ref().map(Urn::id_str))
    .bind(&portal.mxid)
    .bind(portal.encrypted)
    .bind(&portal.name)
    .bind(&portal.photo_id)
    .bind(&portal.avatar_url)
    .bind(&portal.topic)
    .bind(portal.name_set)
    .bind(portal.avatar_set)
    .bind(portal.topic_set)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete the portal row. Messages cascade via the foreign key.
pub async fn delete(
    pool: &AnyPool,
    li_thread_urn: &Urn,
    li_receiver_urn: Option<&Urn>,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM portal WHERE li_thread_urn=$1 AND li_receiver_urn=$2")
        .bind(li_thread_urn.id_str())
        .bind(urn_key(li_receiver_urn))
        .execute(pool)
        .await?;
    Ok(())
}
