//! Account status changes derived from upstream responses.

use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use serde::Deserialize;

use crate::storage::{HealthUpdate, Platform};

/// Unix-seconds timestamp at which a native rate limit lifts.
pub const RATE_LIMIT_RESET_HEADER: &str = "anthropic-ratelimit-unified-reset";

/// Error text some gateways return with a non-429 status when throttling.
pub const RATE_LIMIT_KEYWORD: &str = "exceed your account's rate limit";

/// Fallback window for native accounts without a reset header.
const NATIVE_RATE_LIMIT_HOURS: i64 = 5;

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

/// Whether an error body reports a rate limit.
///
/// Looks at `error.message` when the body is a JSON error envelope, and at
/// the raw text otherwise.
pub fn body_signals_rate_limit(body: &[u8]) -> bool {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody {
            error: Some(ErrorDetail {
                message: Some(message),
            }),
        }) => message.to_lowercase().contains(RATE_LIMIT_KEYWORD),
        _ => String::from_utf8_lossy(body)
            .to_lowercase()
            .contains(RATE_LIMIT_KEYWORD),
    }
}

/// Map an upstream response to a status change, if any.
///
/// `body` is only inspected for non-2xx responses. A plain 400 is the
/// client's fault and changes nothing.
pub fn classify(
    status: u16,
    headers: &HeaderMap,
    body: Option<&[u8]>,
    platform: Platform,
    now: DateTime<Utc>,
) -> Option<HealthUpdate> {
    if status == 200 || status == 201 {
        return Some(HealthUpdate::MarkHealthy);
    }

    let keyword_hit = status >= 400 && body.map(body_signals_rate_limit).unwrap_or(false);
    if status == 429 || keyword_hit {
        return Some(HealthUpdate::MarkRateLimited {
            until: rate_limit_until(headers, platform, now),
        });
    }

    if status > 400 {
        return Some(HealthUpdate::MarkUpstreamError);
    }

    None
}

/// When a rate limit observed at `now` ends.
///
/// Prefers the reset header, then `retry-after` seconds, then the platform
/// default: five hours for native accounts, next local midnight otherwise.
pub fn rate_limit_until(headers: &HeaderMap, platform: Platform, now: DateTime<Utc>) -> DateTime<Utc> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };

    if let Some(reset) = header(RATE_LIMIT_RESET_HEADER).and_then(|ts| Utc.timestamp_opt(ts, 0).single())
    {
        return reset;
    }
    if let Some(seconds) = header("retry-after").filter(|s| *s >= 0) {
        return now + Duration::seconds(seconds);
    }

    match platform {
        Platform::Native => now + Duration::hours(NATIVE_RATE_LIMIT_HOURS),
        Platform::Console | Platform::Foreign => next_local_midnight(now),
    }
}

/// Start of the next local calendar day after `now`.
pub fn next_local_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    next_local_time(now, 0)
}

/// The next instant after `now` at which local wall-clock time is `hour`:00.
pub fn next_local_time(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let local_now = now.with_timezone(&Local);
    let mut day = local_now.date_naive();
    loop {
        if let Some(candidate) = day
            .and_hms_opt(hour, 0, 0)
            .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        {
            let candidate = candidate.with_timezone(&Utc);
            if candidate > now {
                return candidate;
            }
        }
        day = match day.succ_opt() {
            Some(next) => next,
            None => return now + Duration::days(1),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_success_marks_healthy() {
        let now = Utc::now();
        for status in [200, 201] {
            assert_eq!(
                classify(status, &HeaderMap::new(), None, Platform::Native, now),
                Some(HealthUpdate::MarkHealthy)
            );
        }
    }

    #[test]
    fn test_client_error_has_no_effect() {
        let now = Utc::now();
        assert_eq!(
            classify(400, &HeaderMap::new(), Some(&b"{}"[..]), Platform::Native, now),
            None
        );
        assert_eq!(
            classify(204, &HeaderMap::new(), None, Platform::Native, now),
            None
        );
    }

    #[test]
    fn test_server_errors_mark_upstream_error() {
        let now = Utc::now();
        for status in [401, 403, 500, 529] {
            assert_eq!(
                classify(status, &HeaderMap::new(), Some(&b"oops"[..]), Platform::Console, now),
                Some(HealthUpdate::MarkUpstreamError),
                "status {}",
                status
            );
        }
    }

    #[test]
    fn test_429_uses_reset_header() {
        let now = Utc::now();
        let reset = now.timestamp() + 600;
        let update = classify(
            429,
            &headers(&[(RATE_LIMIT_RESET_HEADER, &reset.to_string())]),
            None,
            Platform::Native,
            now,
        );
        assert_eq!(
            update,
            Some(HealthUpdate::MarkRateLimited {
                until: Utc.timestamp_opt(reset, 0).unwrap()
            })
        );
    }

    #[test]
    fn test_429_retry_after_then_platform_default() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        let until = rate_limit_until(&headers(&[("retry-after", "30")]), Platform::Console, now);
        assert_eq!(until, now + Duration::seconds(30));

        let until = rate_limit_until(&HeaderMap::new(), Platform::Native, now);
        assert_eq!(until, now + Duration::hours(5));

        let until = rate_limit_until(&HeaderMap::new(), Platform::Foreign, now);
        assert_eq!(until, next_local_midnight(now));
    }

    #[test]
    fn test_keyword_body_is_rate_limit() {
        let now = Utc::now();
        let body = br#"{"type":"error","error":{"type":"api_error","message":"You EXCEED YOUR ACCOUNT'S RATE LIMIT today"}}"#;
        assert!(matches!(
            classify(403, &HeaderMap::new(), Some(&body[..]), Platform::Console, now),
            Some(HealthUpdate::MarkRateLimited { .. })
        ));

        let raw = b"upstream says: exceed your account's rate limit";
        assert!(body_signals_rate_limit(raw));

        let other = br#"{"error":{"message":"overloaded"}}"#;
        assert!(!body_signals_rate_limit(other));
    }

    #[test]
    fn test_next_local_midnight_is_future_local_midnight() {
        let now = Utc::now();
        let midnight = next_local_midnight(now);
        assert!(midnight > now);
        assert!(midnight - now <= Duration::hours(25));

        let local = midnight.with_timezone(&Local);
        assert_eq!(local.format("%H:%M:%S").to_string(), "00:00:00");
    }

    #[test]
    fn test_next_local_time_one_am() {
        let now = Utc::now();
        let next = next_local_time(now, 1);
        assert!(next > now);
        assert_eq!(next.with_timezone(&Local).format("%H:%M").to_string(), "01:00");
    }
}
