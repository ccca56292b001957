//! Turns flat usage records into the two chart series: usage per
//! (time bucket, model) for the stacked bar chart and call counts per model
//! for the pie chart. Both are built in one scan and keep first-seen order.

use std::{collections::HashMap, hash::Hash};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::{fetch::UsageRecord, query::Granularity};

/// Model label of the placeholder record used when a query returns nothing.
pub const NO_DATA_MODEL: &str = "no data";
pub const DEFAULT_QUOTA_PER_UNIT: f64 = 500_000.0;

const USAGE_DIGITS: i32 = 6;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TimeBucketPoint {
    #[serde(rename = "Time")]
    pub time_label: String,
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(rename = "Usage")]
    pub usage: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModelShare {
    #[serde(rename = "type")]
    pub model: String,
    pub value: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Aggregation {
    pub granularity: Granularity,
    pub bar: Vec<TimeBucketPoint>,
    pub pie: Vec<ModelShare>,
    /// Total calls.
    pub times: u64,
    /// Total raw quota.
    pub consume_quota: f64,
    /// `consume_quota` in display units.
    pub usage_total: f64,
    /// True when the series hold only the "no data" placeholder.
    pub placeholder: bool,
}

pub fn floor_to_bucket(created_at: i64, granularity: Granularity) -> i64 {
    let width = granularity.width_seconds();
    created_at.div_euclid(width) * width
}

pub fn bucket_label(bucket: i64, granularity: Granularity, tz: &Tz) -> String {
    let Some(start) = DateTime::<Utc>::from_timestamp(bucket, 0) else {
        return bucket.to_string();
    };
    let local = start.with_timezone(tz);
    match granularity {
        Granularity::Hour => local.format("%m-%d %H:%M").to_string(),
        Granularity::Day => local.format("%m-%d").to_string(),
        Granularity::Week => {
            let last_day = local + ChronoDuration::days(6);
            format!("{} - {}", local.format("%m-%d"), last_day.format("%m-%d"))
        }
    }
}

/// Raw quota in display units, rounded to six digits.
pub fn quota_to_usage(quota: f64, quota_per_unit: f64) -> f64 {
    let scale = 10f64.powi(USAGE_DIGITS);
    (quota / quota_per_unit * scale).round() / scale
}

pub fn placeholder_record(now: DateTime<Utc>) -> UsageRecord {
    UsageRecord {
        model_name: NO_DATA_MODEL.to_string(),
        count: 0,
        quota: 0.0,
        created_at: now.timestamp(),
    }
}

/// Group-by map that remembers the order keys were first seen.
pub(crate) struct FirstSeen<K, V> {
    index: HashMap<K, usize>,
    rows: Vec<V>,
}

impl<K: Hash + Eq, V> FirstSeen<K, V> {
    pub(crate) fn new() -> Self {
        FirstSeen {
            index: HashMap::new(),
            rows: Vec::new(),
        }
    }

    pub(crate) fn entry(&mut self, key: K, make: impl FnOnce() -> V) -> &mut V {
        let rows = &mut self.rows;
        let idx = *self.index.entry(key).or_insert_with(|| {
            rows.push(make());
            rows.len() - 1
        });
        &mut self.rows[idx]
    }

    pub(crate) fn into_rows(self) -> Vec<V> {
        self.rows
    }
}

pub struct Aggregator<'a> {
    granularity: Granularity,
    tz: &'a Tz,
    quota_per_unit: f64,
}

impl<'a> Aggregator<'a> {
    pub fn new(granularity: Granularity, tz: &'a Tz, quota_per_unit: f64) -> Self {
        Aggregator {
            granularity,
            tz,
            quota_per_unit,
        }
    }

    pub fn aggregate(&self, records: &[UsageRecord], now: DateTime<Utc>) -> Aggregation {
        let is_placeholder = records.is_empty();
        let placeholder;
        let records = if is_placeholder {
            placeholder = [placeholder_record(now)];
            &placeholder[..]
        } else {
            records
        };

        let mut labels: HashMap<i64, String> = HashMap::new();
        let mut bar: FirstSeen<(String, String), TimeBucketPoint> = FirstSeen::new();
        let mut pie: FirstSeen<String, ModelShare> = FirstSeen::new();
        let mut times = 0u64;
        let mut consume_quota = 0.0;

        for record in records {
            times += record.count;
            consume_quota += record.quota;

            pie.entry(record.model_name.clone(), || ModelShare {
                model: record.model_name.clone(),
                value: 0,
            })
            .value += record.count;

            let bucket = floor_to_bucket(record.created_at, self.granularity);
            let label = labels
                .entry(bucket)
                .or_insert_with(|| bucket_label(bucket, self.granularity, self.tz))
                .clone();
            bar.entry((label.clone(), record.model_name.clone()), || TimeBucketPoint {
                time_label: label,
                model: record.model_name.clone(),
                usage: 0.0,
            })
            .usage += quota_to_usage(record.quota, self.quota_per_unit);
        }

        Aggregation {
            granularity: self.granularity,
            bar: bar.into_rows(),
            pie: pie.into_rows(),
            times,
            consume_quota,
            usage_total: quota_to_usage(consume_quota, self.quota_per_unit),
            placeholder: is_placeholder,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(model: &str, count: u64, quota: f64, created_at: i64) -> UsageRecord {
        UsageRecord {
            model_name: model.to_string(),
            count,
            quota,
            created_at,
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_733_229_000, 0).unwrap()
    }

    fn mixed() -> Vec<UsageRecord> {
        vec![
            record("gpt-4o", 10, 250_000.0, 1_733_212_800),
            record("claude-3-5-sonnet", 4, 100_000.0, 1_733_214_600),
            record("gpt-4o", 6, 50_000.0, 1_733_216_400),
            record("claude-3-5-sonnet", 20, 500_000.0, 1_733_299_200),
        ]
    }

    #[test]
    fn bucket_width_follows_granularity() {
        assert_eq!(floor_to_bucket(90_000, Granularity::Day), 86_400);
        assert_eq!(floor_to_bucket(90_000, Granularity::Hour), 90_000);
        assert_eq!(floor_to_bucket(91_000, Granularity::Hour), 90_000);
        assert_eq!(floor_to_bucket(1_733_299_200, Granularity::Week), 1_732_752_000);
        assert_eq!(floor_to_bucket(-1, Granularity::Hour), -3_600);
    }

    #[test]
    fn flooring_is_idempotent() {
        for granularity in [Granularity::Hour, Granularity::Day, Granularity::Week] {
            for ts in [0, 1, 59_999, 90_000, 1_733_214_600, -86_401] {
                let once = floor_to_bucket(ts, granularity);
                assert_eq!(floor_to_bucket(once, granularity), once);
            }
        }
    }

    #[test]
    fn same_hour_records_collapse() {
        let records = vec![
            record("gpt-4", 3, 1_500.0, 90_000),
            record("gpt-4", 2, 500.0, 91_000),
        ];
        let agg = Aggregator::new(Granularity::Hour, &Tz::UTC, DEFAULT_QUOTA_PER_UNIT)
            .aggregate(&records, now());
        assert_eq!(agg.bar.len(), 1);
        assert_eq!(agg.bar[0].time_label, "01-02 01:00");
        assert_eq!(agg.bar[0].model, "gpt-4");
        assert!((agg.bar[0].usage - quota_to_usage(2_000.0, DEFAULT_QUOTA_PER_UNIT)).abs() < 1e-12);
        assert_eq!(
            agg.pie,
            vec![ModelShare {
                model: "gpt-4".into(),
                value: 5,
            }]
        );
        assert_eq!(agg.times, 5);
        assert!(!agg.placeholder);
    }

    #[test]
    fn totals_match_inputs() {
        let records = mixed();
        for granularity in [Granularity::Hour, Granularity::Day, Granularity::Week] {
            let agg = Aggregator::new(granularity, &Tz::UTC, DEFAULT_QUOTA_PER_UNIT)
                .aggregate(&records, now());
            let pie_total: u64 = agg.pie.iter().map(|s| s.value).sum();
            let bar_total: f64 = agg.bar.iter().map(|p| p.usage).sum();
            assert_eq!(pie_total, records.iter().map(|r| r.count).sum::<u64>());
            assert_eq!(agg.consume_quota, 900_000.0);
            assert!((bar_total - quota_to_usage(900_000.0, DEFAULT_QUOTA_PER_UNIT)).abs() < 1e-9);
            assert!((agg.usage_total - 1.8).abs() < 1e-9);
        }
    }

    #[test]
    fn groups_keep_first_seen_order() {
        let agg = Aggregator::new(Granularity::Day, &Tz::UTC, DEFAULT_QUOTA_PER_UNIT)
            .aggregate(&mixed(), now());
        let keys: Vec<_> = agg
            .bar
            .iter()
            .map(|p| (p.time_label.as_str(), p.model.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("12-03", "gpt-4o"),
                ("12-03", "claude-3-5-sonnet"),
                ("12-04", "claude-3-5-sonnet"),
            ]
        );
        assert!((agg.bar[0].usage - 0.6).abs() < 1e-9);
        let models: Vec<_> = agg.pie.iter().map(|s| (s.model.as_str(), s.value)).collect();
        assert_eq!(models, vec![("gpt-4o", 16), ("claude-3-5-sonnet", 24)]);
    }

    #[test]
    fn empty_input_yields_placeholder() {
        let agg = Aggregator::new(Granularity::Day, &Tz::UTC, DEFAULT_QUOTA_PER_UNIT)
            .aggregate(&[], now());
        assert!(agg.placeholder);
        assert_eq!(agg.bar.len(), 1);
        assert_eq!(agg.bar[0].model, NO_DATA_MODEL);
        assert_eq!(agg.bar[0].usage, 0.0);
        assert_eq!(agg.bar[0].time_label, "12-03");
        assert_eq!(
            agg.pie,
            vec![ModelShare {
                model: NO_DATA_MODEL.into(),
                value: 0,
            }]
        );
        assert_eq!(agg.times, 0);
    }

    #[test]
    fn labels_use_local_time() {
        let tz: Tz = "Asia/Shanghai".parse().unwrap();
        assert_eq!(bucket_label(90_000, Granularity::Hour, &tz), "01-02 09:00");
        assert_eq!(bucket_label(86_400, Granularity::Day, &Tz::UTC), "01-02");
        assert_eq!(
            bucket_label(1_732_752_000, Granularity::Week, &Tz::UTC),
            "11-28 - 12-04"
        );
    }

    #[test]
    fn hour_labels_keep_half_hour_offsets() {
        let kolkata: Tz = "Asia/Kolkata".parse().unwrap();
        assert_eq!(bucket_label(3_600, Granularity::Hour, &kolkata), "01-01 06:30");
        let kathmandu: Tz = "Asia/Kathmandu".parse().unwrap();
        assert_eq!(bucket_label(1_733_212_800, Granularity::Hour, &kathmandu), "12-03 13:45");
    }

    #[test]
    fn exact_model_names_only() {
        let records = vec![
            record("gpt-4", 1, 0.0, 0),
            record("GPT-4", 1, 0.0, 0),
            record("gpt-4 ", 1, 0.0, 0),
        ];
        let agg = Aggregator::new(Granularity::Hour, &Tz::UTC, DEFAULT_QUOTA_PER_UNIT)
            .aggregate(&records, now());
        assert_eq!(agg.pie.len(), 3);
        assert_eq!(agg.bar.len(), 3);
    }
}
