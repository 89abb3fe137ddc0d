//! Human-readable durations (`"500ms"`, `"5s"`, `"2m"`, `"1h"`).
//!
//! A bare `"0"` is accepted and means "disabled" wherever a zero
//! duration has that meaning (e.g. the hibernation timeout).

use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Parse a duration string with a `ms`, `s`, `m` or `h` suffix.
pub fn parse_duration(s: &str) -> ConfigResult<Duration> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let invalid = || ConfigError::Duration(s.to_string());
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value.parse().map_err(|_| invalid())?;

    let secs = |scale: u64| value.checked_mul(scale).map(Duration::from_secs).ok_or_else(invalid);
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => secs(60),
        "h" => secs(3600),
        _ => Err(invalid()),
    }
}

/// Render a duration in the shortest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0".to_string();
    }
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = d.as_secs();
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Serde adapter for `Duration` fields written as human strings.
pub mod human {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
