//! Message repository.
//!
//! One LinkedIn message can fan out to several Matrix events (subject,
//! attachments, body, …), so a logical message maps to N rows distinguished
//! by `index`, written atomically through [`bulk_create`]. Indices are
//! contiguous from 0.

use lima_linkedin::Urn;
use sqlx::{AnyPool, Row, any::AnyRow};

use crate::any_compat::get_urn;

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub mxid: String,
    pub mx_room: String,
    pub li_message_urn: Urn,
    pub index: i32,
    pub li_thread_urn: Urn,
    pub li_receiver_urn: Urn,
    pub li_sender_urn: Urn,
    /// Milliseconds since the epoch, from the LinkedIn event.
    pub timestamp: i64,
}

impl<'r> sqlx::FromRow<'r, AnyRow> for MessageRow {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(MessageRow {
            mxid: row.try_get("mxid")?,
            mx_room: row.try_get("mx_room")?,
            li_message_urn: get_urn(row, "li_message_urn")?,
            index: row.try_get("index")?,
            li_thread_urn: get_urn(row, "li_thread_urn")?,
            li_receiver_urn: get_urn(row, "li_receiver_urn")?,
            li_sender_urn: get_urn(row, "li_sender_urn")?,
            timestamp: row.try_get("timestamp")?,
        })
    }
}

const COLUMNS: &str = "mxid, mx_room, li_message_urn, \"index\", li_thread_urn, \
                       li_receiver_urn, li_sender_urn, timestamp";

/// All rows of one logical message, ordered by index.
pub async fn get_all_by_urn(
    pool: &AnyPool,
    li_message_urn: &Urn,
    li_receiver_urn: &Urn,
) -> Result<Vec<MessageRow>, sqlx::Error> {
    sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {COLUMNS} FROM message WHERE li_message_urn=$1 AND li_receiver_urn=$2 \
         ORDER BY \"index\""
    ))
    .bind(li_message_urn.id_str())
    .bind(li_receiver_urn.id_str())
    .fetch_all(pool)
    .await
}

pub async fn get_by_urn(
    pool: &AnyPool,
    li_message_urn: &Urn,
    li_receiver_urn: &Urn,
    index: i32,
) -> Result<Option<MessageRow>, sqlx::Error> {
    sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {COLUMNS} FROM message WHERE li_message_urn=$1 AND li_receiver_urn=$2 \
         AND \"index\"=$3"
    ))
    .bind(li_message_urn.id_str())
    .bind(li_receiver_urn.id_str())
    .bind(index)
    .fetch_optional(pool)
    .await
}

pub async fn get_by_mxid(
    pool: &AnyPool,
    mxid: &str,
    mx_room: &str,
) -> Result<Option<MessageRow>, sqlx::Error> {
    sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {COLUMNS} FROM message WHERE mxid=$1 AND mx_room=$2"
    ))
    .bind(mxid)
    .bind(mx_room)
    .fetch_optional(pool)
    .await
}

/// The newest bridged message in a conversation — the backfill watermark.
pub async fn get_most_recent(
    pool: &AnyPool,
    li_thread_urn: &Urn,
    li_receiver_urn: &Urn,
) -> Result<Option<MessageRow>, sqlx::Error> {
    sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {COLUMNS} FROM message WHERE li_thread_urn=$1 AND li_receiver_urn=$2 \
         ORDER BY timestamp DESC, \"index\" DESC LIMIT 1"
    ))
    .bind(li_thread_urn.id_str())
    .bind(li_receiver_urn.id_str())
    .fetch_optional(pool)
    .await
}

/// The newest bridged message at or before `timestamp` — anchors read
/// markers for seen receipts whose event was never bridged.
pub async fn get_closest_before(
    pool: &AnyPool,
    li_thread_urn: &Urn,
    li_receiver_urn: &Urn,
    timestamp: i64,
) -> Result<Option<MessageRow>, sqlx::Error> {
    sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {COLUMNS} FROM message WHERE li_thread_urn=$1 AND li_receiver_urn=$2 \
         AND timestamp<=$3 ORDER BY timestamp DESC, \"index\" DESC LIMIT 1"
    ))
    .bind(li_thread_urn.id_str())
    .bind(li_receiver_urn.id_str())
    .bind(timestamp)
    .fetch_optional(pool)
    .await
}

pub async fn insert(pool: &AnyPool, message: &MessageRow) -> Result<(), sqlx::Error> {
    let mut txn = pool.begin().await?;
    insert_in(&mut txn, message).await?;
    txn.commit().await
}

async fn insert_in(
    txn: &mut sqlx::Transaction<'_, sqlx::Any>,
    message: &MessageRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO message (
               mxid, mx_room, li_message_urn, "index", li_thread_urn, li_receiver_urn,
               li_sender_urn, timestamp
           ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
    )
    .bind(&message.mxid)
    .bind(&message.mx_room)
    .bind(message.li_message_urn.id_str())
    .bind(message.index)
    .bind(message.li_thread_urn.id_str())
    .bind(message.li_receiver_urn.id_str())
    .bind(message.li_sender_urn.id_str())
    .bind(message.timestamp)
    .execute(&mut **txn)
    .await?;
    Ok(())
}

/// Insert every row of one logical message in a single transaction.
pub async fn bulk_create(pool: &AnyPool, messages: &[MessageRow]) -> Result<(), sqlx::Error> {
    if messages.is_empty() {
        return Ok(());
    }
    let mut txn = pool.begin().await?;
    for message in messages {
        insert_in(&mut txn, message).await?;
    }
    txn.commit().await
}

pub async fn delete(pool: &AnyPool, message: &MessageRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"DELETE FROM message WHERE li_message_urn=$1 AND li_receiver_urn=$2 AND "index"=$3"#,
    )
    .bind(message.li_message_urn.id_str())
    .bind(message.li_receiver_urn.id_str())
    .bind(message.index)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_all_by_urn(
    pool: &AnyPool,
    li_message_urn: &Urn,
    li_receiver_urn: &Urn,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM message WHERE li_message_urn=$1 AND li_receiver_urn=$2")
        .bind(li_message_urn.id_str())
        .bind(li_receiver_urn.id_str())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_all_by_room(pool: &AnyPool, mx_room: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM message WHERE mx_room=$1")
        .bind(mx_room)
        .execute(pool)
        .await?;
    Ok(())
}
