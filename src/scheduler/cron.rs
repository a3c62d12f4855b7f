//! Recurrence evaluation for job schedules.
//!
//! Schedules are five-field cron expressions. Only a fixed catalog of common
//! patterns is understood; any other valid expression degrades to a run one
//! minute later, reported as [`NextRun::Fallback`] so callers can tell the two
//! cases apart. All times are UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};

/// Delay used when an expression is not in the catalog.
pub const FALLBACK_DELAY_SECS: i64 = 60;

const FIELD_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronPattern {
    EveryMinutes(u32),
    EveryHours(u32),
    DailyAt { hour: u32 },
    WeeklyAt { weekday: Weekday, hour: u32 },
    MonthlyAt { day: u32, hour: u32 },
}

const CATALOG: &[(&str, CronPattern, &str)] = &[
    ("* * * * *", CronPattern::EveryMinutes(1), "Every minute"),
    ("*/5 * * * *", CronPattern::EveryMinutes(5), "Every 5 minutes"),
    ("*/10 * * * *", CronPattern::EveryMinutes(10), "Every 10 minutes"),
    ("*/15 * * * *", CronPattern::EveryMinutes(15), "Every 15 minutes"),
    ("*/30 * * * *", CronPattern::EveryMinutes(30), "Every 30 minutes"),
    ("0 * * * *", CronPattern::EveryHours(1), "Every hour"),
    ("0 */2 * * *", CronPattern::EveryHours(2), "Every 2 hours"),
    ("0 */6 * * *", CronPattern::EveryHours(6), "Every 6 hours"),
    ("0 */12 * * *", CronPattern::EveryHours(12), "Every 12 hours"),
    ("0 0 * * *", CronPattern::DailyAt { hour: 0 }, "Daily at midnight"),
    ("0 3 * * *", CronPattern::DailyAt { hour: 3 }, "Daily at 3 AM"),
    ("0 6 * * *", CronPattern::DailyAt { hour: 6 }, "Daily at 6 AM"),
    ("0 9 * * *", CronPattern::DailyAt { hour: 9 }, "Daily at 9 AM"),
    ("0 12 * * *", CronPattern::DailyAt { hour: 12 }, "Daily at 12 PM (noon)"),
    ("0 18 * * *", CronPattern::DailyAt { hour: 18 }, "Daily at 6 PM"),
    (
        "0 9 * * 1",
        CronPattern::WeeklyAt {
            weekday: Weekday::Mon,
            hour: 9,
        },
        "Weekly on Monday at 9 AM",
    ),
    (
        "0 17 * * 5",
        CronPattern::WeeklyAt {
            weekday: Weekday::Fri,
            hour: 17,
        },
        "Weekly on Friday at 5 PM",
    ),
    (
        "0 0 1 * *",
        CronPattern::MonthlyAt { day: 1, hour: 0 },
        "Monthly on 1st at midnight",
    ),
];

/// Result of evaluating a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRun {
    /// The expression matched a catalog pattern.
    Scheduled(DateTime<Utc>),
    /// The expression was not recognized; the time is `now + 1 minute`.
    Fallback(DateTime<Utc>),
}

impl NextRun {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            NextRun::Scheduled(at) | NextRun::Fallback(at) => *at,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, NextRun::Fallback(_))
    }
}

/// Returns true for five whitespace-separated fields made of `* - , /` and digits.
pub fn is_valid(expr: &str) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    fields.len() == FIELD_COUNT
        && fields.iter().all(|field| {
            field
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '*' | '-' | ',' | '/'))
        })
}

/// Look up the catalog pattern for an expression. Whitespace is normalized.
pub fn lookup(expr: &str) -> Option<CronPattern> {
    let normalized = normalize(expr);
    CATALOG
        .iter()
        .find(|(known, _, _)| *known == normalized)
        .map(|(_, pattern, _)| *pattern)
}

/// Human-readable label for an expression.
pub fn describe(expr: &str) -> String {
    let normalized = normalize(expr);
    CATALOG
        .iter()
        .find(|(known, _, _)| *known == normalized)
        .map(|(_, _, label)| label.to_string())
        .unwrap_or_else(|| format!("Custom schedule: {expr}"))
}

/// Next occurrence of `expr` strictly after `now`.
pub fn next_run(expr: &str, now: DateTime<Utc>) -> NextRun {
    match lookup(expr).and_then(|pattern| pattern.next_after(now)) {
        Some(at) => NextRun::Scheduled(at),
        None => {
            tracing::warn!(
                schedule = expr,
                "Cron expression not in predefined patterns, defaulting to 1 minute"
            );
            NextRun::Fallback(now + Duration::seconds(FALLBACK_DELAY_SECS))
        }
    }
}

impl CronPattern {
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            CronPattern::EveryMinutes(n) => Some(now + Duration::minutes(i64::from(n))),
            CronPattern::EveryHours(n) => Some(now + Duration::hours(i64::from(n))),
            CronPattern::DailyAt { hour } => {
                let today = at_hour(now.date_naive(), hour)?;
                if today > now {
                    Some(today)
                } else {
                    Some(today + Duration::days(1))
                }
            }
            CronPattern::WeeklyAt { weekday, hour } => {
                let days_until = (7 + weekday.num_days_from_monday()
                    - now.weekday().num_days_from_monday())
                    % 7;
                let candidate =
                    at_hour(now.date_naive(), hour)? + Duration::days(i64::from(days_until));
                if candidate > now {
                    Some(candidate)
                } else {
                    Some(candidate + Duration::days(7))
                }
            }
            CronPattern::MonthlyAt { day, hour } => {
                let this_month = NaiveDate::from_ymd_opt(now.year(), now.month(), day)
                    .and_then(|date| at_hour(date, hour))?;
                if this_month > now {
                    return Some(this_month);
                }
                let (year, month) = if now.month() == 12 {
                    (now.year() + 1, 1)
                } else {
                    (now.year(), now.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, day).and_then(|date| at_hour(date, hour))
            }
        }
    }
}

fn at_hour(date: NaiveDate, hour: u32) -> Option<DateTime<Utc>> {
    date.and_hms_opt(hour, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn normalize(expr: &str) -> String {
    expr.split_whitespace().collect::<Vec<_>>().join(" ")
}
