//! Canonical usage snapshot
//!
//! One `UsageSnapshot` is created per successful poll and never mutated;
//! the next poll for the same account supersedes it. `limit_type` is
//! derived at construction — the weekly window wins only when strictly
//! greater than the session window, so a tie reports the session window —
//! and is not independently settable.

use serde::Serialize;

/// Which usage window is the binding constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    Session,
    Weekly,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::Session => "session",
            LimitType::Weekly => "weekly",
        }
    }
}

/// Raw usage/limit values when the provider reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RawUsage {
    pub used: Option<f64>,
    pub limit: Option<f64>,
}

/// Provider-specific names for the two usage windows (e.g. "five_hour" /
/// "seven_day", or "tokens" / "monthly").
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowLabels {
    pub session: &'static str,
    pub weekly: &'static str,
}

/// Canonical per-account usage at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub account_id: String,
    pub account_name: String,
    pub account_email: Option<String>,
    /// Short-window utilization, 0-100
    pub session_percent: u8,
    /// Long-window utilization, 0-100
    pub weekly_percent: u8,
    /// Unix ms when the session window resets
    pub session_reset: Option<u64>,
    /// Unix ms when the weekly window resets
    pub weekly_reset: Option<u64>,
    /// Unix ms when this snapshot was fetched
    pub fetched_at: u64,
    pub window_labels: WindowLabels,
    pub raw: Option<RawUsage>,
    limit_type: LimitType,
}

impl UsageSnapshot {
    pub fn new(
        account_id: impl Into<String>,
        account_name: impl Into<String>,
        account_email: Option<String>,
        window: crate::normalize::WindowUsage,
        fetched_at: u64,
    ) -> Self {
        let limit_type = derive_limit_type(window.session_percent, window.weekly_percent);
        Self {
            account_id: account_id.into(),
            account_name: account_name.into(),
            account_email,
            session_percent: window.session_percent,
            weekly_percent: window.weekly_percent,
            session_reset: window.session_reset,
            weekly_reset: window.weekly_reset,
            fetched_at,
            window_labels: window.labels,
            raw: window.raw,
            limit_type,
        }
    }

    /// The binding window, derived from the two percentages.
    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    /// Utilization of the binding window.
    pub fn binding_percent(&self) -> u8 {
        match self.limit_type {
            LimitType::Session => self.session_percent,
            LimitType::Weekly => self.weekly_percent,
        }
    }
}

/// Weekly wins only if strictly greater than session; ties go to session.
fn derive_limit_type(session_percent: u8, weekly_percent: u8) -> LimitType {
    if weekly_percent > session_percent {
        LimitType::Weekly
    } else {
        LimitType::Session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::WindowUsage;

    fn snapshot(session: u8, weekly: u8) -> UsageSnapshot {
        UsageSnapshot::new(
            "acct-1",
            "Personal Max",
            None,
            WindowUsage {
                session_percent: session,
                weekly_percent: weekly,
                session_reset: None,
                weekly_reset: None,
                labels: WindowLabels {
                    session: "five_hour",
                    weekly: "seven_day",
                },
                raw: None,
            },
            1_700_000_000_000,
        )
    }

    #[test]
    fn session_wins_when_greater() {
        assert_eq!(snapshot(72, 45).limit_type(), LimitType::Session);
        assert_eq!(snapshot(72, 45).binding_percent(), 72);
    }

    #[test]
    fn weekly_wins_only_when_strictly_greater() {
        assert_eq!(snapshot(10, 66).limit_type(), LimitType::Weekly);
        assert_eq!(snapshot(10, 66).binding_percent(), 66);
    }

    #[test]
    fn ties_go_to_session() {
        assert_eq!(snapshot(50, 50).limit_type(), LimitType::Session);
        assert_eq!(snapshot(0, 0).limit_type(), LimitType::Session);
    }

    #[test]
    fn serializes_with_limit_type() {
        let json = serde_json::to_string(&snapshot(10, 66)).unwrap();
        assert!(json.contains(r#""limit_type":"weekly""#));
        assert!(json.contains(r#""session_percent":10"#));
    }
}
