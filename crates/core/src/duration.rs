//! Go-style duration strings (`"10s"`, `"1h0m0s"`, `"1.5ms"`).
//!
//! Run timeouts travel in this format and timeout messages quote it, so
//! both directions live here.

use std::time::Duration;

use crate::error::Error;
use crate::result::Result;

const NANOS_PER_MICRO: u64 = 1_000;
const NANOS_PER_MILLI: u64 = 1_000_000;
const NANOS_PER_SEC: u64 = 1_000_000_000;
const NANOS_PER_MIN: u64 = 60 * NANOS_PER_SEC;
const NANOS_PER_HOUR: u64 = 60 * NANOS_PER_MIN;

/// Format a duration the way Go's `time.Duration.String()` does.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let nanos = u64::from(duration.subsec_nanos());

    if secs == 0 {
        return match nanos {
            0 => "0s".to_string(),
            n if n < NANOS_PER_MICRO => format!("{n}ns"),
            n if n < NANOS_PER_MILLI => {
                format!("{}{}µs", n / NANOS_PER_MICRO, fraction(n % NANOS_PER_MICRO, 3))
            }
            n => format!("{}{}ms", n / NANOS_PER_MILLI, fraction(n % NANOS_PER_MILLI, 6)),
        };
    }

    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    let seconds = format!("{seconds}{}s", fraction(nanos, 9));

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}")
    } else {
        seconds
    }
}

/// Render `value` as a decimal fraction with `digits` places, trailing zeros removed.
fn fraction(value: u64, digits: usize) -> String {
    if value == 0 {
        return String::new();
    }
    let padded = format!("{value:0digits$}");
    format!(".{}", padded.trim_end_matches('0'))
}

/// Parse a Go-style duration string.
///
/// Accepts a sequence of decimal numbers with optional fraction and a unit
/// suffix (`ns`, `us`, `µs`, `ms`, `s`, `m`, `h`), e.g. `"1h30m"` or
/// `"2.5s"`. A bare `"0"` is accepted.
///
/// # Errors
///
/// Returns [`Error::InvalidDuration`] for empty input, missing units,
/// unknown units, negative values or overflow.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }
    if trimmed.is_empty() {
        return Err(Error::invalid_duration(input, "empty duration"));
    }
    if trimmed.starts_with('-') {
        return Err(Error::invalid_duration(input, "negative durations are not allowed"));
    }

    let mut total: u64 = 0;
    let mut rest = trimmed.trim_start_matches('+');

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| Error::invalid_duration(input, "missing unit"))?;
        let (number, after) = rest.split_at(number_len);
        if number.is_empty() {
            return Err(Error::invalid_duration(input, "expected a number"));
        }

        let unit_len = after
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after.len());
        let (unit, remaining) = after.split_at(unit_len);
        let unit_nanos = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => NANOS_PER_MICRO,
            "ms" => NANOS_PER_MILLI,
            "s" => NANOS_PER_SEC,
            "m" => NANOS_PER_MIN,
            "h" => NANOS_PER_HOUR,
            other => {
                return Err(Error::invalid_duration(input, format!("unknown unit '{other}'")));
            }
        };

        let component = component_nanos(number, unit_nanos)
            .ok_or_else(|| Error::invalid_duration(input, "invalid number or overflow"))?;
        total = total
            .checked_add(component)
            .ok_or_else(|| Error::invalid_duration(input, "overflow"))?;
        rest = remaining;
    }

    Ok(Duration::from_nanos(total))
}

fn component_nanos(number: &str, unit_nanos: u64) -> Option<u64> {
    let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && frac.is_empty() {
        return None;
    }

    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut nanos = whole.checked_mul(unit_nanos)?;

    let mut scale = unit_nanos;
    for digit in frac.chars() {
        let digit = u64::from(digit.to_digit(10)?);
        scale /= 10;
        if scale == 0 {
            break;
        }
        nanos = nanos.checked_add(digit.checked_mul(scale)?)?;
    }
    Some(nanos)
}

/// Serde adapter for `Option<Duration>` stored as a Go-style string.
pub mod go_duration_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize an optional duration as `"10s"`-style text.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_str(&super::format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize an optional Go-style duration string.
    ///
    /// # Errors
    ///
    /// Fails when the string is not a valid duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| super::parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Serde adapter for `Duration` stored as a Go-style string.
pub mod go_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a duration as `"10s"`-style text.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    /// Deserialize a Go-style duration string.
    ///
    /// # Errors
    ///
    /// Fails when the string is not a valid duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
