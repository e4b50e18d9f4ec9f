use crate::backup::archive::parse_archive_timestamp;
use crate::backup::remote::RemoteObject;
use bon::Builder;
use chrono::{DateTime, Datelike, NaiveDateTime, TimeDelta, TimeZone};
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::HashSet;
use std::time::Duration;
use validator::Validate;

fn default_retention() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

/// How long archives stay on the remote.
///
/// Anything older than `default_retention` is expired, unless one of the
/// optional tiers keeps it: within each tier's window the oldest archive of
/// every day, month or year survives.
#[skip_serializing_none]
#[derive(Clone, Validate, Serialize, Deserialize, Debug, Builder, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    #[serde(default = "default_retention", with = "humantime_serde")]
    #[builder(default = default_retention())]
    #[getset(get_copy = "pub")]
    default_retention: Duration,
    #[serde(default, with = "humantime_serde")]
    #[getset(get = "pub")]
    daily_retention: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    #[getset(get = "pub")]
    monthly_retention: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    #[getset(get = "pub")]
    yearly_retention: Option<Duration>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Bucket keys, compared as `(year, sub-period)`.
type BucketFn = fn(&NaiveDateTime) -> (i32, u32);

struct Tier {
    window: TimeDelta,
    bucket: BucketFn,
    kept: HashSet<(i32, u32)>,
}

impl Tier {
    fn new(window: Option<Duration>, bucket: BucketFn) -> Option<Self> {
        window.map(|w| Self {
            window: to_delta(w),
            bucket,
            kept: HashSet::new(),
        })
    }

    /// Claims the bucket of `ts` if nothing older did already.
    fn keeps(&mut self, ts: &NaiveDateTime, age: TimeDelta) -> bool {
        age < self.window && self.kept.insert((self.bucket)(ts))
    }
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

impl RetentionConfig {
    /// Objects to delete, oldest first.
    ///
    /// Names that are not archive timestamps are never expired.
    pub fn expired<Tz: TimeZone>(
        &self,
        objects: &[RemoteObject],
        now: &DateTime<Tz>,
    ) -> Vec<RemoteObject> {
        let now = now.naive_local();
        let threshold = to_delta(self.default_retention);
        let mut tiers = [
            Tier::new(self.yearly_retention, |ts| (ts.year(), 0)),
            Tier::new(self.monthly_retention, |ts| (ts.year(), ts.month())),
            Tier::new(self.daily_retention, |ts| (ts.year(), ts.ordinal())),
        ]
        .into_iter()
        .flatten()
        .collect_vec();

        objects
            .iter()
            .filter_map(|o| match parse_archive_timestamp(&o.name) {
                Some(ts) => Some((ts, o)),
                None => {
                    tracing::warn!("Not applying retention to unrecognised remote object {:?}", o.name);
                    None
                }
            })
            .sorted_by_key(|(ts, _)| *ts)
            .filter(|(ts, _)| {
                let age = now.signed_duration_since(*ts);
                // Every tier sees every archive so buckets are claimed by the oldest.
                let kept = tiers
                    .iter_mut()
                    .fold(false, |kept, tier| tier.keeps(ts, age) || kept);
                age > threshold && !kept
            })
            .map(|(_, o)| o.clone())
            .collect()
    }
}

/// Plain threshold form, no keep tiers.
pub fn expired<Tz: TimeZone>(
    objects: &[RemoteObject],
    threshold: Duration,
    now: &DateTime<Tz>,
) -> Vec<RemoteObject> {
    RetentionConfig::builder()
        .default_retention(threshold)
        .build()
        .expired(objects, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::archive_file_name;
    use chrono::{Local, NaiveDate, TimeDelta};

    fn now() -> DateTime<Local> {
        NaiveDate::from_ymd_opt(2025, 6, 15)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_local_timezone(Local)
            .single()
            .unwrap()
    }

    fn aged(now: &DateTime<Local>, age: TimeDelta) -> RemoteObject {
        RemoteObject::new(archive_file_name(&(now.clone() - age)))
    }

    fn days(d: i64) -> Duration {
        Duration::from_secs(d as u64 * 24 * 3600)
    }

    #[test]
    fn test_ten_and_three_days_with_seven_day_threshold() {
        let now = now();
        let old = aged(&now, TimeDelta::days(10));
        let recent = aged(&now, TimeDelta::days(3));
        let res = expired(&[recent, old.clone()], days(7), &now);
        assert_eq!(res, vec![old]);
    }

    #[test]
    fn test_unparsable_names_never_expire() {
        let now = now();
        let objects = vec![
            RemoteObject::new("README.txt"),
            RemoteObject::new("20000101_000000.zip.tmp"),
            aged(&now, TimeDelta::days(30)),
        ];
        let res = expired(&objects, days(1), &now);
        assert_eq!(res, vec![objects[2].clone()]);
    }

    #[test]
    fn test_exact_threshold_is_kept() {
        let now = now();
        let edge = aged(&now, TimeDelta::days(7));
        assert!(expired(&[edge], days(7), &now).is_empty());
    }

    #[test]
    fn test_sorted_oldest_first() {
        let now = now();
        let a = aged(&now, TimeDelta::days(9));
        let b = aged(&now, TimeDelta::days(20));
        let c = aged(&now, TimeDelta::days(12));
        let res = expired(&[a.clone(), b.clone(), c.clone()], days(7), &now);
        assert_eq!(res, vec![b, c, a]);
    }

    #[test]
    fn test_daily_tier_keeps_oldest_of_each_day() {
        let now = now();
        let config: RetentionConfig =
            serde_yml::from_str("{default_retention: 1d, daily_retention: 5d}").unwrap();

        // Two archives per day, 3 days back, plus one beyond the daily window
        let morning = aged(&now, TimeDelta::days(3) + TimeDelta::hours(2));
        let evening = aged(&now, TimeDelta::days(3) - TimeDelta::hours(8));
        let ancient = aged(&now, TimeDelta::days(10));

        let res = config.expired(&[morning, evening.clone(), ancient.clone()], &now);
        assert_eq!(res, vec![ancient, evening]);
    }

    #[test]
    fn test_monthly_and_yearly_tiers() {
        let now = now();
        let config = RetentionConfig::builder()
            .default_retention(days(7))
            .monthly_retention(days(100))
            .yearly_retention(days(1000))
            .build();
        let objects = [
            "20230301_020000.zip",
            "20230302_020000.zip",
            "20250401_020000.zip",
            "20250402_020000.zip",
        ]
        .map(RemoteObject::new);

        let res = config.expired(&objects, &now);
        assert_eq!(
            res.iter().map(|o| o.name.as_str()).collect_vec(),
            vec!["20230302_020000.zip", "20250402_020000.zip"]
        );
    }

    #[test]
    fn test_config_defaults() {
        let config: RetentionConfig = serde_yml::from_str("{}").unwrap();
        assert_eq!(config.default_retention(), days(7));
        assert!(config.daily_retention().is_none());
    }
}
