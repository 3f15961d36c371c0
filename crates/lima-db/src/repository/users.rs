//! User repository — one row per Matrix user who has interacted with the
//! bridge. Login cookies live in the `cookie` table, not here.

use lima_linkedin::Urn;
use sqlx::{AnyPool, Row, any::AnyRow};

use crate::any_compat::get_opt_urn;

#[derive(Debug, Clone)]
pub struct UserRow {
    pub mxid: String,
    /// Set after the first successful profile fetch.
    pub li_member_urn: Option<Urn>,
    pub notice_room: Option<String>,
    /// The user's personal space room grouping all their portals.
    pub space_mxid: Option<String>,
}

impl<'r> sqlx::FromRow<'r, AnyRow> for UserRow {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(UserRow {
            mxid: row.try_get("mxid")?,
            li_member_urn: get_opt_urn(row, "li_member_urn")?,
            notice_room: row.try_get("notice_room")?,
            space_mxid: row.try_get("space_mxid")?,
        })
    }
}

const COLUMNS: &str = "mxid, li_member_urn, notice_room, space_mxid";

pub async fn get_by_mxid(pool: &AnyPool, mxid: &str) -> Result<Option<UserRow>, sqlx::Error> {
    sqlx::query_as::<_, UserRow>(&format!(r#"SELECT {COLUMNS} FROM "user" WHERE mxid=$1"#))
        .bind(mxid)
        .fetch_optional(pool)
        .await
}

pub async fn get_by_li_member_urn(
    pool: &AnyPool,
    li_member_urn: &Urn,
) -> Result<Option<UserRow>, sqlx::Error> {
    sqlx::query_as::<_, UserRow>(&format!(
        r#"SELECT {COLUMNS} FROM "user" WHERE li_member_urn=$1"#
    ))
    .bind(li_member_urn.id_str())
    .fetch_optional(pool)
    .await
}

/// Users that have completed a login at some point (member URN known).
pub async fn all_logged_in(pool: &AnyPool) -> Result<Vec<UserRow>, sqlx::Error> {
    sqlx::query_as::<_, UserRow>(&format!(
        r#"SELECT {COLUMNS} FROM "user" WHERE li_member_urn IS NOT NULL AND li_member_urn <> ''"#
    ))
    .fetch_all(pool)
    .await
}

pub async fn insert(pool: &AnyPool, user: &UserRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO "user" (mxid, li_member_urn, notice_room, space_mxid)
           VALUES ($1, $2, $3, $4)"#,
    )
    .bind(&user.mxid)
    .bind(user.li_member_urn.as_ref().map(Urn::id_str))
    .bind(&user.notice_room)
    .bind(&user.space_mxid)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn save(pool: &AnyPool, user: &UserRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"UPDATE "user"
              SET li_member_urn=$2,
                  notice_room=$3,
                  space_mxid=$4
            WHERE mxid=$1"#,
    )
    .bind(&user.mxid)
    .bind(user.li_member_urn.as_ref().map(Urn::id_str))
    .bind(&user.notice_room)
    .bind(&user.space_mxid)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete(pool: &AnyPool, mxid: &str) -> Result<(), sqlx::Error> {
    sqlx::query(r#"DELETE FROM "user" WHERE mxid=$1"#)
        .bind(mxid)
        .execute(pool)
        .await?;
    Ok(())
}
