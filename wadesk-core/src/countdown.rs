use chrono::{DateTime, Utc};

pub const WARNING_THRESHOLD_SECS: u64 = 30;
pub const CRITICAL_THRESHOLD_SECS: u64 = 10;

/// Urgency band for a remaining-time display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBand {
    Normal,
    Warning,
    Critical,
}

/// Whole seconds until `expires_at`, floored, never negative.
pub fn remaining_seconds(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = expires_at.signed_duration_since(now).num_milliseconds();
    if millis <= 0 {
        0
    } else {
        (millis / 1000) as u64
    }
}

/// Formats seconds as `MM:SS` together with its urgency band.
pub fn format_time(seconds: u64) -> (String, TimeBand) {
    let minutes = seconds / 60;
    let rest = seconds % 60;
    let band = if seconds <= CRITICAL_THRESHOLD_SECS {
        TimeBand::Critical
    } else if seconds <= WARNING_THRESHOLD_SECS {
        TimeBand::Warning
    } else {
        TimeBand::Normal
    };
    (format!("{minutes:02}:{rest:02}"), band)
}
