//! AnyPool row-extraction helpers.
//!
//! `sqlx::AnyPool` only natively decodes primitive types. URN columns are
//! stored as their canonical id string (`Urn::id_str()`), so every read
//! rewraps the text and every bind unwraps it here. Empty strings map to
//! `None` for the nullable-URN columns that participate in a primary key.

use lima_linkedin::Urn;
use sqlx::{Row, any::AnyRow};

pub fn get_urn(row: &AnyRow, col: &str) -> Result<Urn, sqlx::Error> {
    let s: String = row.try_get(col)?;
    Ok(Urn::new(&s))
}

pub fn get_opt_urn(row: &AnyRow, col: &str) -> Result<Option<Urn>, sqlx::Error> {
    let s: Option<String> = row.try_get(col)?;
    Ok(s.filter(|v| !v.is_empty()).map(|v| Urn::new(&v)))
}

/// Bind value for an optional URN stored in a NOT NULL key column.
pub fn urn_key(urn: Option<&Urn>) -> String {
    urn.map(Urn::id_str).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urn_key_maps_none_to_empty() {
        assert_eq!(urn_key(None), "");
        assert_eq!(urn_key(Some(&Urn::new("urn:li:member:42"))), "42");
    }
}
