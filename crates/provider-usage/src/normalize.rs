//! Provider response normalizers
//!
//! Two response families reduce to one `WindowUsage`:
//!
//! - OAuth usage: nested `{"five_hour": {"utilization", "resets_at"},
//!   "seven_day": {...}}` with utilization already 0-100, or the legacy
//!   flat `{"session": 0.72, "weekly": 0.45}` with 0-1 fractions. Missing
//!   numeric sub-fields default to 0; a non-object body is no data.
//! - Quota limits: a `limits[]` array (root or under `data`) holding a
//!   `TOKENS_LIMIT` item (short window) and a `TIME_LIMIT` item (long
//!   window) as 0-1 fractions. The session reset comes from the item's
//!   epoch-ms `nextResetTime` or falls back to now+5h; the weekly reset is
//!   the first instant of the next UTC month. An absent array is no data.
//!
//! "No data" is `None`, never a zero-usage value.

use chrono::{Datelike, TimeZone, Utc};
use serde_json::Value;

use crate::snapshot::{RawUsage, WindowLabels};

/// Session reset fallback when the quota provider omits the timestamp.
const SESSION_RESET_FALLBACK_MS: u64 = 5 * 60 * 60 * 1000;

/// Normalized usage windows, before account identity is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowUsage {
    pub session_percent: u8,
    pub weekly_percent: u8,
    pub session_reset: Option<u64>,
    pub weekly_reset: Option<u64>,
    pub labels: WindowLabels,
    pub raw: Option<RawUsage>,
}

/// Normalize an OAuth-usage response (nested windows or legacy flat shape).
pub fn normalize_oauth_usage(body: &Value) -> Option<WindowUsage> {
    let obj = body.as_object()?;

    if obj.contains_key("five_hour") || obj.contains_key("seven_day") {
        let session = obj.get("five_hour");
        let weekly = obj.get("seven_day");
        return Some(WindowUsage {
            session_percent: clamp_percent(window_field(session, "utilization").unwrap_or(0.0)),
            weekly_percent: clamp_percent(window_field(weekly, "utilization").unwrap_or(0.0)),
            session_reset: epoch_ms(session.and_then(|w| w.get("resets_at"))),
            weekly_reset: epoch_ms(weekly.and_then(|w| w.get("resets_at"))),
            labels: WindowLabels {
                session: "five_hour",
                weekly: "seven_day",
            },
            raw: None,
        });
    }

    // Legacy flat shape: 0-1 fractions
    Some(WindowUsage {
        session_percent: clamp_percent(obj.get("session").and_then(Value::as_f64).unwrap_or(0.0) * 100.0),
        weekly_percent: clamp_percent(obj.get("weekly").and_then(Value::as_f64).unwrap_or(0.0) * 100.0),
        session_reset: epoch_ms(obj.get("session_reset")),
        weekly_reset: epoch_ms(obj.get("weekly_reset")),
        labels: WindowLabels {
            session: "session",
            weekly: "weekly",
        },
        raw: None,
    })
}

/// Normalize a quota-limit response (`limits[]` array of typed items).
pub fn normalize_quota_limits(body: &Value, now_ms: u64) -> Option<WindowUsage> {
    let limits = body
        .get("data")
        .and_then(|d| d.get("limits"))
        .or_else(|| body.get("limits"))
        .and_then(Value::as_array)?;

    let mut session_percent = 0u8;
    let mut weekly_percent = 0u8;
    let mut session_reset: Option<u64> = None;
    let mut raw: Option<RawUsage> = None;

    for item in limits {
        match item.get("type").and_then(Value::as_str) {
            Some("TOKENS_LIMIT") => {
                session_percent = clamp_percent(fraction_field(item) * 100.0);
                session_reset = epoch_ms(
                    item.get("nextResetTime")
                        .or_else(|| item.get("next_reset_time")),
                );
                let used = item.get("currentUsage").and_then(Value::as_f64);
                let limit = item.get("limit").and_then(Value::as_f64);
                if used.is_some() || limit.is_some() {
                    raw = Some(RawUsage { used, limit });
                }
            }
            Some("TIME_LIMIT") => {
                weekly_percent = clamp_percent(fraction_field(item) * 100.0);
            }
            _ => {}
        }
    }

    Some(WindowUsage {
        session_percent,
        weekly_percent,
        session_reset: session_reset.or(Some(now_ms + SESSION_RESET_FALLBACK_MS)),
        weekly_reset: Some(next_utc_month_start_ms(now_ms)),
        labels: WindowLabels {
            session: "tokens",
            weekly: "monthly",
        },
        raw,
    })
}

/// First instant of the next UTC month, in unix ms.
fn next_utc_month_start_ms(now_ms: u64) -> u64 {
    let Some(now) = Utc.timestamp_millis_opt(now_ms as i64).single() else {
        return now_ms;
    };
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp_millis() as u64)
        .unwrap_or(now_ms)
}

fn window_field(window: Option<&Value>, field: &str) -> Option<f64> {
    window?.get(field)?.as_f64()
}

/// Utilization fraction of a limits item (`usage` preferred over
/// `currentValue`); 0 when absent.
fn fraction_field(item: &Value) -> f64 {
    item.get("usage")
        .and_then(Value::as_f64)
        .or_else(|| item.get("currentValue").and_then(Value::as_f64))
        .unwrap_or(0.0)
}

/// Reset timestamps arrive as epoch-ms numbers or RFC 3339 strings.
fn epoch_ms(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|v| v as u64)),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis() as u64),
        _ => None,
    }
}

fn clamp_percent(value: f64) -> u8 {
    value.round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: u64 = 1_754_400_000_000; // 2025-08-05T13:20:00Z

    #[test]
    fn legacy_flat_fractions_scale_to_percent() {
        let body = json!({"session": 0.72, "weekly": 0.45});
        let usage = normalize_oauth_usage(&body).unwrap();
        assert_eq!(usage.session_percent, 72);
        assert_eq!(usage.weekly_percent, 45);
        assert_eq!(usage.labels.session, "session");
    }

    #[test]
    fn empty_object_defaults_to_zero_without_panicking() {
        let usage = normalize_oauth_usage(&json!({})).unwrap();
        assert_eq!(usage.session_percent, 0);
        assert_eq!(usage.weekly_percent, 0);
        assert!(usage.session_reset.is_none());
    }

    #[test]
    fn non_object_bodies_are_no_data() {
        assert!(normalize_oauth_usage(&json!(null)).is_none());
        assert!(normalize_oauth_usage(&json!([1, 2])).is_none());
        assert!(normalize_oauth_usage(&json!("error")).is_none());
    }

    #[test]
    fn nested_windows_are_already_percentages() {
        let body = json!({
            "five_hour": {"utilization": 72.4, "resets_at": "2025-08-05T18:00:00Z"},
            "seven_day": {"utilization": 45.0, "resets_at": "2025-08-11T00:00:00Z"}
        });
        let usage = normalize_oauth_usage(&body).unwrap();
        assert_eq!(usage.session_percent, 72);
        assert_eq!(usage.weekly_percent, 45);
        assert_eq!(usage.session_reset, Some(1_754_416_800_000));
        assert_eq!(usage.labels.session, "five_hour");
    }

    #[test]
    fn nested_window_missing_utilization_defaults_to_zero() {
        let body = json!({"five_hour": {"resets_at": "2025-08-05T18:00:00Z"}});
        let usage = normalize_oauth_usage(&body).unwrap();
        assert_eq!(usage.session_percent, 0);
        assert_eq!(usage.weekly_percent, 0);
    }

    #[test]
    fn legacy_fractions_round_and_clamp() {
        let body = json!({"session": 0.666, "weekly": 1.5});
        let usage = normalize_oauth_usage(&body).unwrap();
        assert_eq!(usage.session_percent, 67);
        assert_eq!(usage.weekly_percent, 100);
    }

    #[test]
    fn quota_limits_map_token_and_time_items() {
        let body = json!({
            "data": {"limits": [
                {"type": "TOKENS_LIMIT", "currentValue": 0.10, "nextResetTime": 1_754_500_000_000u64},
                {"type": "TIME_LIMIT", "usage": 0.66}
            ]}
        });
        let usage = normalize_quota_limits(&body, NOW).unwrap();
        assert_eq!(usage.session_percent, 10);
        assert_eq!(usage.weekly_percent, 66);
        assert_eq!(usage.session_reset, Some(1_754_500_000_000));
        assert_eq!(usage.labels.weekly, "monthly");
    }

    #[test]
    fn quota_limits_accepts_root_level_array() {
        let body = json!({"limits": [{"type": "TOKENS_LIMIT", "currentValue": 0.5}]});
        let usage = normalize_quota_limits(&body, NOW).unwrap();
        assert_eq!(usage.session_percent, 50);
    }

    #[test]
    fn absent_limits_array_is_no_data() {
        assert!(normalize_quota_limits(&json!({}), NOW).is_none());
        assert!(normalize_quota_limits(&json!({"data": {}}), NOW).is_none());
        assert!(normalize_quota_limits(&json!(null), NOW).is_none());
    }

    #[test]
    fn missing_item_values_default_to_zero() {
        let body = json!({"limits": [
            {"type": "TOKENS_LIMIT"},
            {"type": "TIME_LIMIT"}
        ]});
        let usage = normalize_quota_limits(&body, NOW).unwrap();
        assert_eq!(usage.session_percent, 0);
        assert_eq!(usage.weekly_percent, 0);
    }

    #[test]
    fn session_reset_falls_back_to_five_hours() {
        let body = json!({"limits": [{"type": "TOKENS_LIMIT", "currentValue": 0.2}]});
        let usage = normalize_quota_limits(&body, NOW).unwrap();
        assert_eq!(usage.session_reset, Some(NOW + 5 * 60 * 60 * 1000));
    }

    #[test]
    fn weekly_reset_is_first_instant_of_next_utc_month() {
        // 2025-08-05 → 2025-09-01T00:00:00Z
        let body = json!({"limits": []});
        let usage = normalize_quota_limits(&body, NOW).unwrap();
        let expected = Utc
            .with_ymd_and_hms(2025, 9, 1, 0, 0, 0)
            .single()
            .unwrap()
            .timestamp_millis() as u64;
        assert_eq!(usage.weekly_reset, Some(expected));
    }

    #[test]
    fn weekly_reset_rolls_over_december() {
        let december = Utc
            .with_ymd_and_hms(2025, 12, 15, 10, 0, 0)
            .single()
            .unwrap()
            .timestamp_millis() as u64;
        let expected = Utc
            .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
            .single()
            .unwrap()
            .timestamp_millis() as u64;
        assert_eq!(next_utc_month_start_ms(december), expected);
    }

    #[test]
    fn fraction_values_clamp_to_100() {
        let body = json!({"limits": [{"type": "TOKENS_LIMIT", "currentValue": 1.5}]});
        let usage = normalize_quota_limits(&body, NOW).unwrap();
        assert_eq!(usage.session_percent, 100);
    }

    #[test]
    fn raw_usage_captured_when_present() {
        let body = json!({"limits": [
            {"type": "TOKENS_LIMIT", "currentValue": 0.3, "currentUsage": 300.0, "limit": 1000.0}
        ]});
        let usage = normalize_quota_limits(&body, NOW).unwrap();
        let raw = usage.raw.unwrap();
        assert_eq!(raw.used, Some(300.0));
        assert_eq!(raw.limit, Some(1000.0));
    }
}
