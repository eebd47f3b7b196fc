// Human-readable durations
// Parses values such as "1 week", "2 days", "1h 30m" or a bare number of seconds

use serde::{Deserialize, Deserializer};
use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;

/// Parse a duration string into a `Duration`
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let mut total: u64 = 0;
    let mut chars = trimmed.chars().peekable();
    let mut parsed_any = false;

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut number = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
            number.push(c);
            chars.next();
        }
        if number.is_empty() {
            // "and" between components, as in "1 hour and 5 minutes"
            let word: String = std::iter::from_fn(|| chars.next_if(|c| c.is_alphabetic())).collect();
            if word.eq_ignore_ascii_case("and") && parsed_any {
                continue;
            }
            return Err(format!("invalid duration '{}'", input));
        }

        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        let unit: String = std::iter::from_fn(|| chars.next_if(|c| c.is_alphabetic())).collect();

        let value: u64 = number
            .parse()
            .map_err(|_| format!("invalid duration '{}'", input))?;
        let multiplier = unit_seconds(&unit)
            .ok_or_else(|| format!("unknown duration unit '{}' in '{}'", unit, input))?;
        total = value
            .checked_mul(multiplier)
            .and_then(|seconds| total.checked_add(seconds))
            .ok_or_else(|| format!("duration '{}' is too large", input))?;
        parsed_any = true;
    }

    if parsed_any {
        Ok(Duration::from_secs(total))
    } else {
        Err(format!("invalid duration '{}'", input))
    }
}

fn unit_seconds(unit: &str) -> Option<u64> {
    match unit.to_ascii_lowercase().as_str() {
        "" | "s" | "sec" | "secs" | "second" | "seconds" => Some(1),
        "m" | "min" | "mins" | "minute" | "minutes" => Some(MINUTE),
        "h" | "hr" | "hrs" | "hour" | "hours" => Some(HOUR),
        "d" | "day" | "days" => Some(DAY),
        "w" | "wk" | "wks" | "week" | "weeks" => Some(WEEK),
        _ => None,
    }
}

/// Serde helper for optional duration fields
pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Seconds(seconds)) => Ok(Some(Duration::from_secs(seconds))),
        Some(Raw::Text(text)) => parse_duration(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Render a duration the way it would be written in a pipeline file
pub fn format_duration(duration: Duration) -> String {
    let mut remaining = duration.as_secs();
    if remaining == 0 {
        return "0s".to_string();
    }
    let mut parts = Vec::new();
    for (unit, seconds) in [("w", WEEK), ("d", DAY), ("h", HOUR), ("m", MINUTE), ("s", 1)] {
        if remaining >= seconds {
            parts.push(format!("{}{}", remaining / seconds, unit));
            remaining %= seconds;
        }
    }
    parts.join(" ")
}
