//! Vendor rate-limit headers parsed to a common shape.
//!
//! Three distinct rules share one output: OpenAI publishes reset times as
//! duration strings (`1h2m3s`), Anthropic as ISO-8601 timestamps, Google
//! publishes nothing proactive at all.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::types::Vendor;

/// Cooldown applied when a 429 carries no usable `retry-after`.
pub const DEFAULT_RETRY_AFTER_MS: i64 = 60_000;

/// The common shape all three extractors produce. Unknown fields stay `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitSnapshot {
    pub remaining_requests: Option<u64>,
    pub remaining_tokens: Option<u64>,
    pub reset_requests_at: Option<DateTime<Utc>>,
    pub reset_tokens_at: Option<DateTime<Utc>>,
}

/// Lowercase a response header map on ingress so later lookups never chase
/// case drift.
pub fn lowercase_headers(map: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    map.iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

/// Extract the vendor's proactive rate-limit headers.
pub fn extract(vendor: Vendor, headers: &HashMap<String, String>, now: DateTime<Utc>) -> RateLimitSnapshot {
    match vendor {
        Vendor::OpenAi => extract_openai(headers, now),
        Vendor::Anthropic => extract_anthropic(headers),
        Vendor::Google => RateLimitSnapshot::default(),
    }
}

fn extract_openai(headers: &HashMap<String, String>, now: DateTime<Utc>) -> RateLimitSnapshot {
    let reset_at = |key: &str| {
        headers
            .get(key)
            .and_then(|v| parse_reset_duration_ms(v))
            .map(|ms| now + Duration::milliseconds(ms))
    };
    RateLimitSnapshot {
        remaining_requests: parse_count(headers.get("x-ratelimit-remaining-requests")),
        remaining_tokens: parse_count(headers.get("x-ratelimit-remaining-tokens")),
        reset_requests_at: reset_at("x-ratelimit-reset-requests"),
        reset_tokens_at: reset_at("x-ratelimit-reset-tokens"),
    }
}

fn extract_anthropic(headers: &HashMap<String, String>) -> RateLimitSnapshot {
    let reset_at = |key: &str| {
        headers
            .get(key)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    };
    RateLimitSnapshot {
        remaining_requests: parse_count(headers.get("anthropic-ratelimit-requests-remaining")),
        remaining_tokens: parse_count(headers.get("anthropic-ratelimit-tokens-remaining")),
        reset_requests_at: reset_at("anthropic-ratelimit-requests-reset"),
        reset_tokens_at: reset_at("anthropic-ratelimit-tokens-reset"),
    }
}

fn parse_count(value: Option<&String>) -> Option<u64> {
    value.and_then(|v| v.trim().parse::<u64>().ok())
}

/// Parse an OpenAI reset duration like `1h2m3s`, `6m0s`, `250ms`, or `1.5s`
/// into milliseconds. Every segment is `<number><unit>`; fractional numbers
/// are allowed.
pub fn parse_reset_duration_ms(input: &str) -> Option<i64> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let mut total = 0f64;
    let mut num = String::new();
    let mut unit = String::new();

    for c in input.chars() {
        if c.is_ascii_digit() || c == '.' {
            if !unit.is_empty() {
                total += segment_ms(&num, &unit)?;
                num.clear();
                unit.clear();
            }
            num.push(c);
        } else if c.is_ascii_alphabetic() {
            if num.is_empty() {
                return None;
            }
            unit.push(c);
        } else {
            return None;
        }
    }
    total += segment_ms(&num, &unit)?;

    if !total.is_finite() || total < 0.0 {
        return None;
    }
    Some(total.round() as i64)
}

fn segment_ms(num: &str, unit: &str) -> Option<f64> {
    let value: f64 = num.parse().ok()?;
    let scale = match unit {
        "h" => 3_600_000.0,
        "m" => 60_000.0,
        "s" => 1_000.0,
        "ms" => 1.0,
        _ => return None,
    };
    Some(value * scale)
}

/// Parse a `retry-after` header value: integer (or fractional) seconds, or an
/// HTTP-date. Missing or malformed input falls back to 60 s.
pub fn parse_retry_after(value: Option<&str>, now: DateTime<Utc>) -> Duration {
    let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Duration::milliseconds(DEFAULT_RETRY_AFTER_MS);
    };

    if let Ok(secs) = raw.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Duration::milliseconds((secs * 1000.0).round() as i64);
        }
        return Duration::milliseconds(DEFAULT_RETRY_AFTER_MS);
    }

    if let Ok(at) = DateTime::parse_from_rfc2822(raw) {
        let delta = at.with_timezone(&Utc) - now;
        if delta > Duration::zero() {
            return delta;
        }
    }

    Duration::milliseconds(DEFAULT_RETRY_AFTER_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn duration_segments_accumulate() {
        assert_eq!(parse_reset_duration_ms("1h2m3s"), Some(3_723_000));
        assert_eq!(parse_reset_duration_ms("6m0s"), Some(360_000));
        assert_eq!(parse_reset_duration_ms("20ms"), Some(20));
        assert_eq!(parse_reset_duration_ms("1.5s"), Some(1_500));
    }

    #[test]
    fn duration_rejects_garbage() {
        assert_eq!(parse_reset_duration_ms(""), None);
        assert_eq!(parse_reset_duration_ms("h"), None);
        assert_eq!(parse_reset_duration_ms("3x"), None);
        assert_eq!(parse_reset_duration_ms("1h 2m"), None);
    }

    #[test]
    fn openai_headers_extract_to_absolute_times() {
        let mut headers = HashMap::new();
        headers.insert("x-ratelimit-remaining-requests".to_string(), "99".to_string());
        headers.insert("x-ratelimit-remaining-tokens".to_string(), "14500".to_string());
        headers.insert("x-ratelimit-reset-requests".to_string(), "1m30s".to_string());

        let snap = extract(Vendor::OpenAi, &headers, now());
        assert_eq!(snap.remaining_requests, Some(99));
        assert_eq!(snap.remaining_tokens, Some(14500));
        assert_eq!(snap.reset_requests_at, Some(now() + Duration::seconds(90)));
        assert_eq!(snap.reset_tokens_at, None);
    }

    #[test]
    fn anthropic_headers_carry_absolute_timestamps() {
        let mut headers = HashMap::new();
        headers.insert(
            "anthropic-ratelimit-requests-remaining".to_string(),
            "42".to_string(),
        );
        headers.insert(
            "anthropic-ratelimit-requests-reset".to_string(),
            "2025-03-01T12:01:00Z".to_string(),
        );

        let snap = extract(Vendor::Anthropic, &headers, now());
        assert_eq!(snap.remaining_requests, Some(42));
        assert_eq!(snap.reset_requests_at, Some(now() + Duration::seconds(60)));
    }

    #[test]
    fn google_has_no_proactive_headers() {
        let mut headers = HashMap::new();
        headers.insert("x-ratelimit-remaining-requests".to_string(), "5".to_string());
        assert_eq!(extract(Vendor::Google, &headers, now()), RateLimitSnapshot::default());
    }

    #[test]
    fn retry_after_seconds_and_dates() {
        assert_eq!(parse_retry_after(Some("30"), now()), Duration::seconds(30));
        assert_eq!(parse_retry_after(Some("2.5"), now()), Duration::milliseconds(2_500));
        assert_eq!(
            parse_retry_after(Some("Sat, 01 Mar 2025 12:00:45 GMT"), now()),
            Duration::seconds(45)
        );
    }

    #[test]
    fn retry_after_defaults_to_sixty_seconds() {
        assert_eq!(parse_retry_after(None, now()), Duration::seconds(60));
        assert_eq!(parse_retry_after(Some(""), now()), Duration::seconds(60));
        assert_eq!(parse_retry_after(Some("soon"), now()), Duration::seconds(60));
        // An HTTP-date in the past is as good as missing.
        assert_eq!(
            parse_retry_after(Some("Sat, 01 Mar 2025 11:00:00 GMT"), now()),
            Duration::seconds(60)
        );
    }
}
