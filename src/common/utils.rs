//! Utility functions for shard-registrar

use std::time::Duration;

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else if s.ends_with(|c: char| c.is_ascii_digit()) {
        // bare numbers are seconds
        (s, "s")
    } else {
        // non-empty, so there is a last char
        let split = s.char_indices().last().map_or(0, |(idx, _)| idx);
        (&s[..split], &s[split..])
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let scaled = |factor: u64| {
        num.checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| crate::Error::InvalidConfig(format!("duration too large: {}", s)))
    };

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => scaled(60)?,
        "h" => scaled(3600)?,
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Render a duration the way `parse_duration` reads it back
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// Short holder prefix used in log lines
pub fn holder_prefix(holder: &str) -> &str {
    match holder.char_indices().nth(8) {
        Some((idx, _)) => &holder[..idx],
        None => holder,
    }
}

/// Convert a std duration into a chrono one for timestamp arithmetic
pub fn chrono_duration(d: Duration) -> crate::Result<chrono::Duration> {
    chrono::Duration::from_std(d)
        .map_err(|e| crate::Error::InvalidConfig(format!("duration out of range: {}", e)))
}

/// Serde adapter for durations given as seconds (`10`, `0.5`) or strings (`"500ms"`)
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Seconds(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Seconds(secs) => {
                Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
            }
            Repr::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}
