//! HTTP header repository — per-user request header overrides captured from
//! the browser session at login, replayed verbatim on every LinkedIn call.

use std::collections::HashMap;

use sqlx::{AnyPool, Row, any::AnyRow};

#[derive(Debug, Clone)]
pub struct HttpHeaderRow {
    pub mxid: String,
    pub name: String,
    pub value: String,
}

impl<'r> sqlx::FromRow<'r, AnyRow> for HttpHeaderRow {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(HttpHeaderRow {
            mxid: row.try_get("mxid")?,
            name: row.try_get("name")?,
            value: row.try_get("value")?,
        })
    }
}

pub async fn get_for_mxid(
    pool: &AnyPool,
    mxid: &str,
) -> Result<HashMap<String, String>, sqlx::Error> {
    let rows = sqlx::query_as::<_, HttpHeaderRow>(
        "SELECT mxid, name, value FROM http_header WHERE mxid=$1",
    )
    .bind(mxid)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|row| (row.name, row.value)).collect())
}

pub async fn bulk_upsert(
    pool: &AnyPool,
    mxid: &str,
    headers: &HashMap<String, String>,
) -> Result<(), sqlx::Error> {
    let mut txn = pool.begin().await?;
    for (name, value) in headers {
        sqlx::query(
            r#"INSERT INTO http_header (mxid, name, value)
               VALUES ($1, $2, $3)
               ON CONFLICT (mxid, name)
               DO UPDATE SET value=excluded.value"#,
        )
        .bind(mxid)
        .bind(name)
        .bind(value)
        .execute(&mut *txn)
        .await?;
    }
    txn.commit().await
}

pub async fn delete_all_for_mxid(pool: &AnyPool, mxid: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM http_header WHERE mxid=$1")
        .bind(mxid)
        .execute(pool)
        .await?;
    Ok(())
}
