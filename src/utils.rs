use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use url::Url;

use crate::error::{ChatError, Result};

/// Adds a scheme to bare host input. `default_scheme` is used when the user
/// typed something like `localhost:8080/ws`.
pub fn normalize_url(input: &str, default_scheme: &str) -> String {
    let trimmed = input.trim();
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}://{}", default_scheme, trimmed)
    }
}

/// Builds the WebSocket endpoint for a broker URL, carrying the bearer token
/// as a `token` query parameter. HTTP schemes are mapped onto their
/// WebSocket counterparts so SockJS-style URLs keep working.
pub fn broker_endpoint(broker_url: &str, token: &str) -> Result<Url> {
    let normalized = normalize_url(broker_url, "ws");
    let mut url = Url::parse(&normalized)
        .map_err(|e| ChatError::Transport(format!("invalid broker url {}: {}", normalized, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ChatError::Transport(format!("unsupported broker scheme: {}", other)));
        }
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(ChatError::Transport(format!("cannot use scheme {} for {}", scheme, url)));
    }

    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

/// Current UTC time truncated to whole milliseconds, which is the precision
/// the wire format carries.
pub fn now_millis() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap_or_else(Utc::now)
}

pub fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Parses RFC 3339, or a zone-less ISO-8601 timestamp (read as UTC) as sent
/// by servers serialising local date-times.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Serde helpers for ISO-8601 timestamps with millisecond precision.
pub mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
    }

    /// Optional timestamps. Unparsable values become `None` instead of
    /// failing the whole document.
    pub mod lenient {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => serializer.serialize_str(&super::super::format_timestamp(ts)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            Ok(raw.as_deref().and_then(super::super::parse_timestamp))
        }
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
