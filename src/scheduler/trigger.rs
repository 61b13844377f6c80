use chrono::NaiveDateTime;
use std::fmt;

/// When a job fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Once { run_at: NaiveDateTime },
    Interval { start_at: NaiveDateTime, period: chrono::Duration },
}

impl Trigger {
    pub fn first_fire_time(&self) -> NaiveDateTime {
        match self {
            Trigger::Once { run_at } => *run_at,
            Trigger::Interval { start_at, .. } => *start_at,
        }
    }

    /// First fire time strictly after `after`, or None once exhausted.
    /// An interval whose next occurrence is past the representable calendar
    /// is exhausted too.
    pub fn fire_time_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Trigger::Once { run_at } => (*run_at > after).then_some(*run_at),
            Trigger::Interval { start_at, period } => {
                if after < *start_at {
                    return Some(*start_at);
                }
                let period_ms = period.num_milliseconds().max(1);
                let elapsed_ms = (after - *start_at).num_milliseconds();
                let periods = elapsed_ms / period_ms + 1;
                let offset = periods
                    .checked_mul(period_ms)
                    .and_then(chrono::Duration::try_milliseconds)?;
                start_at.checked_add_signed(offset)
            }
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Once { run_at } => write!(f, "once at {}", run_at),
            Trigger::Interval { period, .. } => write!(f, "every {}s", period.num_seconds()),
        }
    }
}
