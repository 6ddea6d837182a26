//! Per-run identity.

use chrono::{DateTime, NaiveDate, Utc};

/// Identifies one batch run. Immutable and passed explicitly into every
/// component call; nothing in the engine reads run identity from ambient
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunContext {
    pub process_id: i64,
    pub batch_id: i64,
    pub run_date: NaiveDate,
    pub run_ts: DateTime<Utc>,
}

impl RunContext {
    /// A context stamped with the current time.
    pub fn new(process_id: i64, batch_id: i64) -> Self {
        let now = Utc::now();
        Self {
            process_id,
            batch_id,
            run_date: now.date_naive(),
            run_ts: now,
        }
    }

    /// A context with an explicit timestamp, for replays and tests.
    pub fn at(process_id: i64, batch_id: i64, run_ts: DateTime<Utc>) -> Self {
        Self {
            process_id,
            batch_id,
            run_date: run_ts.date_naive(),
            run_ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn explicit_timestamp_sets_run_date() {
        let ts = Utc.with_ymd_and_hms(2026, 8, 25, 23, 30, 0).unwrap();
        let ctx = RunContext::at(100, 42, ts);
        assert_eq!(ctx.run_date, ts.date_naive());
        assert_eq!(ctx.batch_id, 42);
    }
}
