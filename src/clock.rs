//! Time helpers shared by the mapper, the checkpoint and the cursor strategies.
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Earliest window start when neither state nor config provide one.
pub fn default_window_origin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Midnight UTC of the day containing `now`. Used as the upper bound of every
/// request so a run never reads events that land while it is running.
pub fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(now)
}

pub fn date_start(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc())
}

/// Parse an event timestamp in any of the shapes the API has used: epoch
/// seconds (integer or fractional, possibly quoted), RFC 3339, or a naive
/// ISO-8601 datetime that is implicitly UTC.
pub fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0);
    }
    if let Ok(secs) = raw.parse::<f64>() {
        if secs.is_finite() {
            let whole = secs.floor();
            let nanos = ((secs - whole) * 1e9) as u32;
            return DateTime::from_timestamp(whole as i64, nanos);
        }
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Render a query-string bound as whole epoch seconds.
pub fn epoch_param(dt: DateTime<Utc>) -> String {
    dt.timestamp().to_string()
}
