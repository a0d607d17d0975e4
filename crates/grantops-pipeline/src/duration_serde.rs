//! Serde adapter for human-friendly durations (`250ms`, `2s`, `5m`, `1h`, `1d`).
//!
//! A bare integer is read as seconds. Serialization picks the largest unit
//! that represents the value exactly, so `600s` is written back as `10m`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Longest suffix first so `ms` is not read as `m`.
const UNITS: [(&str, u64); 5] = [
    ("ms", 1),
    ("s", 1_000),
    ("m", 60_000),
    ("h", 3_600_000),
    ("d", 86_400_000),
];

#[derive(Deserialize)]
#[serde(untagged)]
enum Raw {
    Seconds(u64),
    Text(String),
}

impl Raw {
    fn into_duration(self) -> Result<Duration, String> {
        match self {
            Raw::Seconds(n) => Ok(Duration::from_secs(n)),
            Raw::Text(s) => parse_duration_str(&s),
        }
    }
}

pub fn parse_duration_str(input: &str) -> Result<Duration, String> {
    let text = input.trim();
    if text.is_empty() {
        return Err("empty duration".into());
    }
    let (digits, millis_per_unit) = UNITS
        .iter()
        .find_map(|(suffix, ms)| text.strip_suffix(suffix).map(|rest| (rest, *ms)))
        .unwrap_or((text, 1_000));
    let digits = digits.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid duration '{input}'"));
    }
    let value: u64 = digits
        .parse()
        .map_err(|e| format!("invalid duration '{input}': {e}"))?;
    value
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration '{input}' is too large"))
}

pub fn format_duration(duration: &Duration) -> String {
    let ms = duration.as_millis().min(u128::from(u64::MAX)) as u64;
    if ms == 0 {
        return "0s".into();
    }
    let (suffix, per) = UNITS
        .iter()
        .rev()
        .find(|(_, per)| ms % per == 0)
        .copied()
        .unwrap_or(("ms", 1));
    format!("{}{suffix}", ms / per)
}

pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_duration(duration))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    Raw::deserialize(deserializer)?
        .into_duration()
        .map_err(serde::de::Error::custom)
}

/// Same encoding for `Option<Duration>` fields.
pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => super::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<Raw>::deserialize(deserializer)?
            .map(Raw::into_duration)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}
