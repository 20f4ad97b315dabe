use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};

/// Number of hour buckets in one calendar day.
pub const HOURS_PER_DAY: u32 = 24;

/// Start of the one-hour bucket `[H:00, H+1:00)` containing `t`.
pub fn hour_bucket_start(t: DateTime<Utc>) -> DateTime<Utc> {
    let seconds_into_hour = t.timestamp().rem_euclid(3600);
    t - TimeDelta::seconds(seconds_into_hour)
        - TimeDelta::nanoseconds(i64::from(t.timestamp_subsec_nanos()))
}

/// Bucket immediately before the one starting at `bucket_start`.
pub fn previous_hour_bucket(bucket_start: DateTime<Utc>) -> DateTime<Utc> {
    bucket_start - TimeDelta::hours(1)
}

/// The 24 bucket starts of a UTC calendar day, ascending.
pub fn day_hour_buckets(date: NaiveDate) -> Vec<DateTime<Utc>> {
    let midnight = date.and_time(NaiveTime::MIN).and_utc();
    (0..HOURS_PER_DAY)
        .map(|hour| midnight + TimeDelta::hours(i64::from(hour)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_hour_bucket_start_truncates() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 59, 59).unwrap() + TimeDelta::milliseconds(999);
        assert_eq!(
            hour_bucket_start(t),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_hour_bucket_start_is_identity_on_boundary() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        assert_eq!(hour_bucket_start(t), t);
    }

    #[test]
    fn test_hour_bucket_start_before_epoch() {
        let t = Utc.with_ymd_and_hms(1969, 12, 31, 23, 30, 0).unwrap();
        assert_eq!(
            hour_bucket_start(t),
            Utc.with_ymd_and_hms(1969, 12, 31, 23, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_previous_bucket_crosses_midnight() {
        let t = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        assert_eq!(
            previous_hour_bucket(t),
            Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_day_hour_buckets() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let buckets = day_hour_buckets(date);

        assert_eq!(buckets.len(), 24);
        assert_eq!(buckets[0], Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(buckets[23], Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap());
        assert!(buckets.windows(2).all(|w| w[0] < w[1]));
    }
}
