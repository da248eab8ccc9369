use chrono::{DateTime, Datelike, Days, NaiveTime, Utc};
use serde::Serialize;

/// System-wide figures for the administration dashboard
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SystemStats {
    pub total_wallets: u64,
    pub active_wallets: u64,
    pub frozen_wallets: u64,
    /// Sum of all wallet balances
    pub bubbles_in_circulation: u64,
    /// Debited bubbles since `period_start`
    pub bubbles_spent: u64,
    /// Fiat amount of topups completed since `period_start`
    pub topup_revenue: u64,
    pub period_start: DateTime<Utc>,
}

/// Midnight UTC on the first day of the month of `now`
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let date = now.date_naive();
    date.checked_sub_days(Days::new(date.day0().into()))
        .unwrap_or(date)
        .and_time(NaiveTime::MIN)
        .and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::*;
    use speculoos::prelude::*;

    #[rstest]
    #[case(Utc.with_ymd_and_hms(2024, 3, 17, 14, 5, 9).unwrap())]
    #[case(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())]
    #[case(Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 59).unwrap())]
    fn test_month_start(#[case] now: DateTime<Utc>) {
        assert_that!(month_start(now))
            .is_equal_to(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    }
}
