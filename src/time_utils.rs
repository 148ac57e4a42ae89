// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Timestamp conversions between BSON and API strings.

use chrono::{DateTime, SecondsFormat, Utc};
use mongodb::bson;

/// Format a UTC timestamp as RFC3339 using a `Z` suffix.
pub fn format_utc_rfc3339(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Format a stored BSON datetime for API responses.
///
/// Values outside chrono's range render as an empty string.
pub fn format_bson_rfc3339(value: bson::DateTime) -> String {
    DateTime::from_timestamp_millis(value.timestamp_millis())
        .map(format_utc_rfc3339)
        .unwrap_or_default()
}
