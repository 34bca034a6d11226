//! Rate-limit parsing.
//!
//! A 429 from the upstream carries its reset hint in one of several places:
//! a `retry-after` header (seconds or HTTP-date), a `google.rpc.RetryInfo`
//! detail with a `retryDelay` like `"3.5s"`, or an RFC3339 `quotaResetTime`
//! in the error body. The parser also classifies which quota tripped:
//! account quotas cool the account down, endpoint congestion is worth a hop
//! to the next upstream host with the same account.

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::time::Duration;

/// Which bucket the 429 charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    /// Per-account (or per-project) quota: rotate accounts.
    Account,
    /// Per-endpoint congestion: retry the same account elsewhere.
    Endpoint,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    pub scope: QuotaScope,
    pub retry_after: Option<Duration>,
}

/// Extract scope and reset time from a 429 response.
pub fn parse_rate_limit(headers: Option<&HeaderMap>, body: &str) -> RateLimitInfo {
    let parsed_body: Option<Value> = serde_json::from_str(body).ok();

    let retry_after = headers
        .and_then(parse_retry_after_header)
        .or_else(|| parsed_body.as_ref().and_then(retry_delay_from_details))
        .or_else(|| parsed_body.as_ref().and_then(delay_until_reset_time));

    RateLimitInfo {
        scope: classify_scope(parsed_body.as_ref(), body),
        retry_after,
    }
}

fn parse_retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date form.
    let when = DateTime::parse_from_rfc2822(raw).ok()?;
    duration_until(when.with_timezone(&Utc))
}

/// `error.details[]` entries of type `google.rpc.RetryInfo` carry
/// `retryDelay` as a decimal-seconds string (`"3.5s"`).
fn retry_delay_from_details(body: &Value) -> Option<Duration> {
    let details = body.get("error")?.get("details")?.as_array()?;
    for detail in details {
        let is_retry_info = detail
            .get("@type")
            .and_then(Value::as_str)
            .map(|t| t.ends_with("RetryInfo"))
            .unwrap_or(false);
        if !is_retry_info {
            continue;
        }
        if let Some(delay) = detail.get("retryDelay").and_then(Value::as_str) {
            return parse_seconds_string(delay);
        }
    }
    None
}

fn parse_seconds_string(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.trim().trim_end_matches('s').parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

/// RFC3339 reset instants appear as `quotaResetTime` / `resetTime` either
/// on the error object or inside quota-failure details.
fn delay_until_reset_time(body: &Value) -> Option<Duration> {
    let error = body.get("error")?;
    let raw = ["quotaResetTime", "resetTime", "resetAt"]
        .iter()
        .find_map(|key| find_string_field(error, key))?;
    let when = DateTime::parse_from_rfc3339(&raw).ok()?;
    duration_until(when.with_timezone(&Utc))
}

fn find_string_field(value: &Value, key: &str) -> Option<String> {
    match value {
        Value::Object(obj) => {
            if let Some(found) = obj.get(key).and_then(Value::as_str) {
                return Some(found.to_string());
            }
            obj.values().find_map(|v| find_string_field(v, key))
        }
        Value::Array(arr) => arr.iter().find_map(|v| find_string_field(v, key)),
        _ => None,
    }
}

fn duration_until(when: DateTime<Utc>) -> Option<Duration> {
    let delta = when - Utc::now();
    delta.to_std().ok()
}

fn classify_scope(parsed: Option<&Value>, raw: &str) -> QuotaScope {
    let message = parsed
        .and_then(|v| v.get("error"))
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or(raw);
    let lower = message.to_ascii_lowercase();

    // Quota language means the account's bucket is empty; congestion
    // language means this host is busy and another may not be.
    if lower.contains("overloaded")
        || lower.contains("capacity")
        || lower.contains("server is busy")
    {
        QuotaScope::Endpoint
    } else {
        QuotaScope::Account
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn integer_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("42"));
        let info = parse_rate_limit(Some(&headers), "");
        assert_eq!(info.retry_after, Some(Duration::from_secs(42)));
        assert_eq!(info.scope, QuotaScope::Account);
    }

    #[test]
    fn retry_info_detail_wins_without_header() {
        let body = r#"{
            "error": {
                "code": 429,
                "status": "RESOURCE_EXHAUSTED",
                "message": "Quota exceeded for model",
                "details": [
                    {"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "3.5s"}
                ]
            }
        }"#;
        let info = parse_rate_limit(None, body);
        assert_eq!(info.retry_after, Some(Duration::from_secs_f64(3.5)));
        assert_eq!(info.scope, QuotaScope::Account);
    }

    #[test]
    fn reset_time_in_future_yields_delay() {
        let reset = (Utc::now() + chrono::Duration::seconds(90)).to_rfc3339();
        let body = format!(
            r#"{{"error": {{"code": 429, "message": "quota", "quotaResetTime": "{}"}}}}"#,
            reset
        );
        let info = parse_rate_limit(None, &body);
        let secs = info.retry_after.unwrap().as_secs();
        assert!((85..=90).contains(&secs), "unexpected delay {}", secs);
    }

    #[test]
    fn reset_time_in_past_is_ignored() {
        let reset = (Utc::now() - chrono::Duration::seconds(90)).to_rfc3339();
        let body = format!(
            r#"{{"error": {{"code": 429, "message": "quota", "resetTime": "{}"}}}}"#,
            reset
        );
        let info = parse_rate_limit(None, &body);
        assert_eq!(info.retry_after, None);
    }

    #[test]
    fn overloaded_message_is_endpoint_scope() {
        let body = r#"{"error": {"code": 429, "message": "The model is overloaded."}}"#;
        let info = parse_rate_limit(None, body);
        assert_eq!(info.scope, QuotaScope::Endpoint);
    }

    #[test]
    fn garbage_body_defaults_to_account_scope_no_delay() {
        let info = parse_rate_limit(None, "<html>too many requests</html>");
        assert_eq!(info.scope, QuotaScope::Account);
        assert_eq!(info.retry_after, None);
    }
}
