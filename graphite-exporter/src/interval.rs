//! Parsing of polling intervals and timeouts.
use std::time::Duration;

use crate::common::ConfigError;

/// Parses an interval specification into a number of seconds.
///
/// A bare integer is taken as seconds. Otherwise, the last character is a unit suffix (`s`, `m`
/// or `h`) applied to the integer that precedes it, so `"30s"` is 30, `"5m"` is 300 and `"1h"` is
/// 3600. An empty `spec` falls back to parsing `fallback` instead.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidInterval`] if the unit suffix is not recognized, if the
/// magnitude is not an integer, or if both `spec` and `fallback` are empty.
pub fn parse_interval(spec: &str, fallback: &str) -> Result<u64, ConfigError> {
    let spec = spec.trim();
    if spec.is_empty() {
        if fallback.trim().is_empty() {
            return Err(invalid(spec, "no interval given and no fallback available"));
        }
        return parse_interval(fallback, "");
    }

    if let Ok(seconds) = spec.parse::<u64>() {
        return Ok(seconds);
    }

    // `spec` is non-empty, so there is always a last character.
    let (split, unit) = match spec.char_indices().last() {
        Some(last) => last,
        None => return Err(invalid(spec, "no interval given")),
    };
    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        _ => return Err(invalid(spec, "unit must be one of `s`, `m` or `h`")),
    };
    let magnitude = spec[..split]
        .parse::<u64>()
        .map_err(|_| invalid(spec, "magnitude must be a non-negative integer"))?;

    magnitude.checked_mul(multiplier).ok_or_else(|| invalid(spec, "interval is too large"))
}

/// Parses an interval specification into a [`Duration`].
///
/// See [`parse_interval`] for the accepted syntax.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidInterval`] under the same conditions as [`parse_interval`].
pub fn parse_duration(spec: &str, fallback: &str) -> Result<Duration, ConfigError> {
    parse_interval(spec, fallback).map(Duration::from_secs)
}

fn invalid(spec: &str, reason: &'static str) -> ConfigError {
    ConfigError::InvalidInterval { value: spec.to_owned(), reason }
}
