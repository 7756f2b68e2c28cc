//! Duration strings in configuration documents.
//!
//! Timeouts use the `90m` / `1h30m` / `1.5h` / `300ms` notation. A bare `0` is
//! accepted; a missing unit anywhere else is an error.

use std::time::Duration;

/// Parse a duration string such as `1h30m`
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let invalid = || format!("time: invalid duration \"{input}\"");
    let mut rest = input.trim();
    if let Some(stripped) = rest.strip_prefix('+') {
        rest = stripped;
    } else if rest.starts_with('-') {
        // Negative durations make no sense for timeouts
        return Err(invalid());
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total_nanos: f64 = 0.0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let number = &rest[..number_len];
        if number.is_empty() || number == "." {
            return Err(invalid());
        }
        let value: f64 = number.parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        let scale = match unit {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            "" => return Err(format!("time: missing unit in duration \"{input}\"")),
            other => {
                return Err(format!(
                    "time: unknown unit \"{other}\" in duration \"{input}\""
                ));
            }
        };
        total_nanos += value * scale;
        rest = &rest[unit_len..];
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid());
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "range checked above")]
    let nanos = total_nanos.round() as u64;
    Ok(Duration::from_nanos(nanos))
}

/// Read an optional duration field from a configuration document
///
/// Absent or empty values fall back to `default`.
pub fn duration_from_config(
    data: &std::collections::BTreeMap<String, String>,
    key: &str,
    config_name: &str,
    default: Duration,
) -> Result<Duration, String> {
    match data.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => parse_duration(raw).map_err(|e| {
            format!(
                "the value of key {key} from ConfigMap {config_name} is not a valid duration string: {e}"
            )
        }),
    }
}
