//! Stored page snapshots and HTTP date handling.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use super::headers::HeaderBag;

const HTTP_DATE: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to encode page snapshot: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode page snapshot: {0}")]
    Decode(#[source] serde_json::Error),
}

/// A captured response, stored under the request fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    #[serde(with = "body_base64")]
    pub output: Bytes,
    /// Unix seconds at which generation started.
    pub created_at: i64,
    pub headers: HeaderBag,
    pub gen_duration_seconds: f64,
    pub status_line: Option<String>,
    pub redirect_status: Option<u16>,
    pub redirect_location: Option<String>,
    /// Page version the snapshot was generated under.
    pub version: i64,
    pub max_age_seconds: u64,
    /// Backend TTL relative to `created_at`.
    pub expires_at_offset: u64,
}

impl PageSnapshot {
    pub fn encode(&self) -> Result<String, SnapshotError> {
        serde_json::to_string(self).map_err(SnapshotError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, SnapshotError> {
        serde_json::from_str(text).map_err(SnapshotError::Decode)
    }

    /// Status code from the stored status line, 200 when absent or unparsable.
    pub fn status_code(&self) -> u16 {
        self.status_line
            .as_deref()
            .and_then(status_code_from_line)
            .unwrap_or(200)
    }

    pub fn expires_at(&self) -> i64 {
        self.created_at
            .saturating_add(i64::try_from(self.max_age_seconds).unwrap_or(i64::MAX))
    }

    pub fn is_fresh(&self, now: i64) -> bool {
        now <= self.expires_at()
    }

    /// Within `window` seconds of expiry, or already past it.
    pub fn is_near_expiry(&self, now: i64, window: u64) -> bool {
        let window = i64::try_from(window).unwrap_or(i64::MAX);
        now >= self.expires_at().saturating_sub(window)
    }

    /// Stored redirect, if this snapshot represents one.
    pub fn redirect(&self) -> Option<(u16, &str)> {
        match (self.redirect_status, self.redirect_location.as_deref()) {
            (Some(status), Some(location)) => Some((status, location)),
            _ => None,
        }
    }

    /// Stored `Last-Modified` when parsable, otherwise the creation time.
    pub fn last_modified(&self) -> i64 {
        self.headers
            .first("last-modified")
            .and_then(parse_http_date)
            .unwrap_or(self.created_at)
    }
}

fn status_code_from_line(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let first = parts.next()?;
    // Accept both "HTTP/1.1 200 OK" and a bare "200 OK".
    let code = if first.starts_with("HTTP/") {
        parts.next()?
    } else {
        first
    };
    code.parse().ok().filter(|code| (100..1000).contains(code))
}

/// Format unix seconds as an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format_http_date(timestamp: i64) -> Option<String> {
    OffsetDateTime::from_unix_timestamp(timestamp)
        .ok()?
        .format(HTTP_DATE)
        .ok()
}

pub fn parse_http_date(value: &str) -> Option<i64> {
    PrimitiveDateTime::parse(value.trim(), HTTP_DATE)
        .ok()
        .map(|date| date.assume_utc().unix_timestamp())
}

mod body_base64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
