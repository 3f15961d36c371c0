//! Reaction repository — unique per (message URN, receiver, sender, emoji).

use lima_linkedin::Urn;
use sqlx::{AnyPool, Row, any::AnyRow};

use crate::any_compat::get_urn;

#[derive(Debug, Clone)]
pub struct ReactionRow {
    pub mxid: String,
    pub mx_room: String,
    pub li_message_urn: Urn,
    pub li_receiver_urn: Urn,
    pub li_sender_urn: Urn,
    /// The emoji text.
    pub reaction: String,
}

impl<'r> sqlx::FromRow<'r, AnyRow> for ReactionRow {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(ReactionRow {
            mxid: row.try_get("mxid")?,
            mx_room: row.try_get("mx_room")?,
            li_message_urn: get_urn(row, "li_message_urn")?,
            li_receiver_urn: get_urn(row, "li_receiver_urn")?,
            li_sender_urn: get_urn(row, "li_sender_urn")?,
            reaction: row.try_get("reaction")?,
        })
    }
}

const COLUMNS: &str =
    "mxid, mx_room, li_message_urn, li_receiver_urn, li_sender_urn, reaction";

pub async fn get_by_mxid(
    pool: &AnyPool,
    mxid: &str,
    mx_room: &str,
) -> Result<Option<ReactionRow>, sqlx::Error> {
    sqlx::query_as::<_, ReactionRow>(&format!(
        "SELECT {COLUMNS} FROM reaction WHERE mxid=$1 AND mx_room=$2"
    ))
    .bind(mxid)
    .bind(mx_room)
    .fetch_optional(pool)
    .await
}

pub async fn get_by_urn_and_emoji(
    pool: &AnyPool,
    li_message_urn: &Urn,
    li_receiver_urn: &Urn,
    li_sender_urn: &Urn,
    reaction: &str,
) -> Result<Option<ReactionRow>, sqlx::Error> {
    sqlx::query_as::<_, ReactionRow>(&format!(
        "SELECT {COLUMNS} FROM reaction WHERE li_message_urn=$1 AND li_receiver_urn=$2 \
         AND li_sender_urn=$3 AND reaction=$4"
    ))
    .bind(li_message_urn.id_str())
    .bind(li_receiver_urn.id_str())
    .bind(li_sender_urn.id_str())
    .bind(reaction)
    .fetch_optional(pool)
    .await
}

/// Every reaction on one message.
pub async fn get_all_by_message(
    pool: &AnyPool,
    li_message_urn: &Urn,
    li_receiver_urn: &Urn,
) -> Result<Vec<ReactionRow>, sqlx::Error> {
    sqlx::query_as::<_, ReactionRow>(&format!(
        "SELECT {COLUMNS} FROM reaction WHERE li_message_urn=$1 AND li_receiver_urn=$2"
    ))
    .bind(li_message_urn.id_str())
    .bind(li_receiver_urn.id_str())
    .fetch_all(pool)
    .await
}

pub async fn insert(pool: &AnyPool, reaction: &ReactionRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO reaction (
               mxid, mx_room, li_message_urn, li_receiver_urn, li_sender_urn, reaction
           ) VALUES ($1, $2, $3, $4, $5, $6)"#,
    )
    .bind(&reaction.mxid)
    .bind(&reaction.mx_room)
    .bind(reaction.li_message_urn.id_str())
    .bind(reaction.li_receiver_urn.id_str())
    .bind(reaction.li_sender_urn.id_str())
    .bind(&reaction.reaction)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn save(pool: &AnyPool, reaction: &ReactionRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"UPDATE reaction
              SET mxid=$5, mx_room=$6
            WHERE li_message_urn=$1 AND li_receiver_urn=$2 AND li_sender_urn=$3 AND reaction=$4"#,
    )
    .bind(reaction.li_message_urn.id_str())
    .bind(reaction.li_receiver_urn.id_str())
    .bind(reaction.li_sender_urn.id_str())
    .bind(&reaction.reaction)
    .bind(&reaction.mxid)
    .bind(&reaction.mx_room)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete(pool: &AnyPool, reaction: &ReactionRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"DELETE FROM reaction
            WHERE li_message_urn=$1 AND li_receiver_urn=$2 AND li_sender_urn=$3 AND reaction=$4"#,
    )
    .bind(reaction.li_message_urn.id_str())
    .bind(reaction.li_receiver_urn.id_str())
    .bind(reaction.li_sender_urn.id_str())
    .bind(&reaction.reaction)
    .execute(pool)
    .await?;
    Ok(())
}

/// Drop every reaction on one message — used on LinkedIn recall.
pub async fn delete_all_by_message(
    pool: &AnyPool,
    li_message_urn: &Urn,
    li_receiver_urn: &Urn,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM reaction WHERE li_message_urn=$1 AND li_receiver_urn=$2")
        .bind(li_message_urn.id_str())
        .bind(li_receiver_urn.id_str())
        .execute(pool)
        .await?;
    Ok(())
}

/// Drop every reaction in a room — used when a portal is deleted.
pub async fn delete_all_by_room(pool: &AnyPool, mx_room: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM reaction WHERE mx_room=$1")
        .bind(mx_room)
        .execute(pool)
        .await?;
    Ok(())
}
