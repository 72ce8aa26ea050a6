//! Small presentation helpers shared by message rendering and the listing API.

use chrono::{DateTime, Utc};

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;
const MONTH: i64 = 30 * DAY;
const YEAR: i64 = 365 * DAY;

const UNITS: [(i64, &str, &str); 6] = [
    (YEAR, "year", "years"),
    (MONTH, "month", "months"),
    (WEEK, "week", "weeks"),
    (DAY, "day", "days"),
    (HOUR, "hour", "hours"),
    (MINUTE, "minute", "minutes"),
];

/// Render a watch-time requirement: `90` -> `1h 30m`, `60` -> `1h`, `0` -> `0m`.
/// Negative input has no sensible rendering and yields `N/A`.
pub fn minutes_to_hours(minutes: i64) -> String {
    if minutes < 0 {
        return "N/A".to_string();
    }
    let hours = minutes / 60;
    let rest = minutes % 60;
    match (hours, rest) {
        (0, 0) => "0m".to_string(),
        (0, m) => format!("{}m", m),
        (h, 0) => format!("{}h", h),
        (h, m) => format!("{}h {}m", h, m),
    }
}

fn plural(count: i64, singular: &str, plural: &str) -> String {
    if count == 1 {
        format!("{} {}", count, singular)
    } else {
        format!("{} {}", count, plural)
    }
}

/// Humanize a non-negative span using at most two adjacent units, e.g. `2 days, 3 hours`.
fn humanize_seconds(seconds: i64) -> String {
    if seconds < MINUTE {
        return "0 minutes".to_string();
    }

    for (i, (size, singular, plural_name)) in UNITS.iter().enumerate() {
        let count = seconds / size;
        if count == 0 {
            continue;
        }
        let mut out = plural(count, singular, plural_name);
        if let Some((next_size, next_singular, next_plural)) = UNITS.get(i + 1) {
            let next_count = (seconds - count * size) / next_size;
            if next_count > 0 {
                out.push_str(", ");
                out.push_str(&plural(next_count, next_singular, next_plural));
            }
        }
        return out;
    }

    "0 minutes".to_string()
}

/// Time from `now` until `target`. Past targets collapse to `0 minutes`.
pub fn time_until(target: DateTime<Utc>, now: DateTime<Utc>) -> String {
    humanize_seconds((target - now).num_seconds().max(0))
}

/// Time elapsed from `target` to `now`. Future targets collapse to `0 minutes`.
pub fn time_since(target: DateTime<Utc>, now: DateTime<Utc>) -> String {
    humanize_seconds((now - target).num_seconds().max(0))
}

/// Discord renders `<t:UNIX:R>` as a relative time in the reader's locale.
pub fn discord_timestamp(time: DateTime<Utc>) -> String {
    format!("<t:{}:R>", time.timestamp())
}

/// Hide the token part of a Discord webhook URL.
///
/// `https://discord.com/api/webhooks/123/abcdef` -> `https://discord.com/api/webhooks/123/***`
pub fn mask_webhook_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or("");
            let segments: Vec<&str> = parsed
                .path_segments()
                .map(|s| s.filter(|p| !p.is_empty()).collect())
                .unwrap_or_default();
            // api / webhooks / {id} / {token}
            if segments.len() >= 4 && segments[0] == "api" && segments[1] == "webhooks" {
                format!(
                    "{}://{}/api/webhooks/{}/***",
                    parsed.scheme(),
                    host,
                    segments[2]
                )
            } else {
                format!("{}://{}/***", parsed.scheme(), host)
            }
        }
        Err(_) => "(redacted)".to_string(),
    }
}
