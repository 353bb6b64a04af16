// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed query modules, one per durable table group.

pub mod bot_states;
pub mod contexts;
pub mod followups;
pub mod queue;
pub mod rate_buckets;

use chrono::{DateTime, Utc};

/// Parse an RFC 3339 timestamp stored as text, surfacing a conversion error
/// through rusqlite so callers can use `?` inside `call` closures.
pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

/// Parse an optional RFC 3339 timestamp column.
pub(crate) fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    s.map(|v| parse_ts(&v)).transpose()
}

/// Deserialize a JSON column, surfacing the error through rusqlite.
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    s: &str,
) -> Result<T, rusqlite::Error> {
    serde_json::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}
