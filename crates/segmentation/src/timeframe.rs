//! Timeframe resolution: relative, absolute and all-time windows.

use audience_core::{AudienceError, AudienceResult};
use chrono::{DateTime, Duration, Months, Utc};

use crate::wire::TimeframeSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl TimeUnit {
    pub fn parse(unit: &str) -> Option<Self> {
        let unit = match unit.trim().to_ascii_lowercase().as_str() {
            "minute" | "minutes" => TimeUnit::Minutes,
            "hour" | "hours" => TimeUnit::Hours,
            "day" | "days" => TimeUnit::Days,
            "week" | "weeks" => TimeUnit::Weeks,
            "month" | "months" => TimeUnit::Months,
            "year" | "years" => TimeUnit::Years,
            _ => return None,
        };
        Some(unit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    Relative { value: u32, unit: TimeUnit },
    Absolute {
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    },
    AllTime,
}

/// Half-open scan window `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at < self.to
    }
}

impl Timeframe {
    pub fn compile(spec: &TimeframeSpec) -> AudienceResult<Self> {
        match spec {
            TimeframeSpec::Relative { value, unit } => {
                let parsed = TimeUnit::parse(unit).ok_or_else(|| {
                    AudienceError::config(format!("unknown timeframe unit '{unit}'"))
                })?;
                let value = u32::try_from(*value).map_err(|_| {
                    AudienceError::config(format!("timeframe value {value} must be non-negative"))
                })?;
                Ok(Timeframe::Relative {
                    value,
                    unit: parsed,
                })
            }
            TimeframeSpec::Absolute { from, to } => {
                if let Some(to) = to {
                    if to < from {
                        return Err(AudienceError::config(format!(
                            "timeframe ends ({to}) before it starts ({from})"
                        )));
                    }
                }
                Ok(Timeframe::Absolute {
                    from: *from,
                    to: *to,
                })
            }
            TimeframeSpec::AllTime => Ok(Timeframe::AllTime),
        }
    }

    /// Resolve against `now`. Relative windows end at `now`; an absolute
    /// window without `to` also ends at `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> TimeWindow {
        match *self {
            Timeframe::Relative { value, unit } => TimeWindow {
                from: subtract(now, value, unit),
                to: now,
            },
            Timeframe::Absolute { from, to } => TimeWindow {
                from,
                to: to.unwrap_or(now),
            },
            Timeframe::AllTime => TimeWindow {
                from: DateTime::<Utc>::MIN_UTC,
                to: now,
            },
        }
    }
}

fn subtract(now: DateTime<Utc>, value: u32, unit: TimeUnit) -> DateTime<Utc> {
    let n = i64::from(value);
    let shifted = match unit {
        TimeUnit::Minutes => now.checked_sub_signed(Duration::minutes(n)),
        TimeUnit::Hours => now.checked_sub_signed(Duration::hours(n)),
        TimeUnit::Days => now.checked_sub_signed(Duration::days(n)),
        TimeUnit::Weeks => now.checked_sub_signed(Duration::weeks(n)),
        TimeUnit::Months => now.checked_sub_months(Months::new(value)),
        TimeUnit::Years => value
            .checked_mul(12)
            .and_then(|m| now.checked_sub_months(Months::new(m))),
    };
    shifted.unwrap_or(DateTime::<Utc>::MIN_UTC)
}
