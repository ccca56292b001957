use anyhow::{Context, Result, anyhow};
use chrono::{
    DateTime, Duration as ChronoDuration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeZone, Utc,
};
use chrono_tz::Tz;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use url::Url;

pub const SELF_USAGE_PATH: &str = "/api/data/self/";
pub const ADMIN_USAGE_PATH: &str = "/api/data/";
pub const USER_DIRECTORY_PATH: &str = "/api/user/dashboard/users";

const HOUR_SECONDS: i64 = 3_600;
const DAY_SECONDS: i64 = 86_400;
const WEEK_SECONDS: i64 = 604_800;

#[derive(Copy, Clone, Debug, ValueEnum, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Hour,
    Day,
    Week,
}

impl Granularity {
    pub fn width_seconds(self) -> i64 {
        match self {
            Granularity::Hour => HOUR_SECONDS,
            Granularity::Day => DAY_SECONDS,
            Granularity::Week => WEEK_SECONDS,
        }
    }

    /// Wire code sent as `default_time`.
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
        }
    }

    /// How far back the initial range starts, given the stored preference.
    pub fn default_lookback(preference: Option<Granularity>) -> ChronoDuration {
        match preference {
            Some(Granularity::Hour) => ChronoDuration::days(1),
            Some(Granularity::Week) => ChronoDuration::days(30),
            _ => ChronoDuration::days(7),
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum, PartialEq, Eq)]
pub enum Preset {
    Today,
    #[value(name = "7days")]
    Last7Days,
    #[value(name = "30days")]
    Last30Days,
}

impl Preset {
    fn days_back(self) -> i64 {
        match self {
            Preset::Today => 0,
            Preset::Last7Days => 6,
            Preset::Last30Days => 29,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryFilter {
    pub username: Option<String>,
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
    pub granularity: Granularity,
}

impl QueryFilter {
    /// Filter state on first mount: granularity and lookback come from the stored preference.
    pub fn initial(now: DateTime<Utc>, tz: &Tz, preference: Option<Granularity>) -> Self {
        let local = now.with_timezone(tz);
        QueryFilter {
            username: None,
            start: local - Granularity::default_lookback(preference),
            end: local + ChronoDuration::hours(1),
            granularity: preference.unwrap_or_default(),
        }
    }

    pub fn apply_preset(&mut self, preset: Preset, now: DateTime<Utc>, tz: &Tz) -> Result<()> {
        let (start, end) = preset_range(preset, now, tz)?;
        self.start = start;
        self.end = end;
        Ok(())
    }
}

/// Local midnight `days_back` days ago through 23:59:59.999 today.
pub fn preset_range(preset: Preset, now: DateTime<Utc>, tz: &Tz) -> Result<(DateTime<Tz>, DateTime<Tz>)> {
    let today = now.with_timezone(tz).date_naive();
    let first_day = today - ChronoDuration::days(preset.days_back());
    let start = localize(tz, first_day.and_time(NaiveTime::MIN))?;
    let last_instant = today
        .and_hms_milli_opt(23, 59, 59, 999)
        .ok_or_else(|| anyhow!("no end-of-day instant for {today}"))?;
    let end = localize(tz, last_instant)?;
    Ok((start, end))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    SelfScope,
    Admin { username: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsageRequest {
    pub endpoint: Endpoint,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub granularity: Granularity,
}

impl UsageRequest {
    pub fn path(&self) -> &'static str {
        match self.endpoint {
            Endpoint::SelfScope => SELF_USAGE_PATH,
            Endpoint::Admin { .. } => ADMIN_USAGE_PATH,
        }
    }

    pub fn scope(&self) -> &'static str {
        match self.endpoint {
            Endpoint::SelfScope => "self",
            Endpoint::Admin { .. } => "admin",
        }
    }

    pub fn username(&self) -> Option<&str> {
        match &self.endpoint {
            Endpoint::SelfScope => None,
            Endpoint::Admin { username } => Some(username),
        }
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(4);
        if let Endpoint::Admin { username } = &self.endpoint {
            pairs.push(("username", username.clone()));
        }
        pairs.push(("start_timestamp", self.start_timestamp.to_string()));
        pairs.push(("end_timestamp", self.end_timestamp.to_string()));
        pairs.push(("default_time", self.granularity.as_str().to_string()));
        pairs
    }

    pub fn url(&self, base_url: &str) -> Result<Url, url::ParseError> {
        let mut url = endpoint_url(base_url, self.path())?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in self.query_pairs() {
                query.append_pair(key, &value);
            }
        }
        Ok(url)
    }
}

/// Joins an absolute API path onto a base URL, keeping any path prefix on the base.
pub fn endpoint_url(base_url: &str, path: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!("{}{}", base_url.trim_end_matches('/'), path))
}

pub fn build_request(filter: &QueryFilter, is_admin: bool) -> UsageRequest {
    let endpoint = if is_admin {
        Endpoint::Admin {
            username: filter.username.clone().unwrap_or_default(),
        }
    } else {
        Endpoint::SelfScope
    };
    let request = UsageRequest {
        endpoint,
        start_timestamp: filter.start.timestamp(),
        end_timestamp: filter.end.timestamp(),
        granularity: filter.granularity,
    };
    if request.start_timestamp > request.end_timestamp {
        tracing::warn!(
            start = request.start_timestamp,
            end = request.end_timestamp,
            "query range ends before it starts; sending as-is"
        );
    }
    request
}

pub fn parse_datetime(raw: &str, tz: &Tz) -> Result<DateTime<Tz>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(tz));
    }
    let naive = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
        .with_context(|| {
            format!("Could not parse date-time '{raw}', expected YYYY-MM-DD HH:MM:SS")
        })?;
    localize(tz, naive)
}

pub fn format_datetime(dt: &DateTime<Tz>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Wall-clock time to an instant. Times skipped by a forward DST jump resolve
/// to the first valid instant after the gap.
fn localize(tz: &Tz, naive: NaiveDateTime) -> Result<DateTime<Tz>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest),
        LocalResult::None => {
            // Read the skipped time with the offset in force a day earlier.
            let before = tz
                .from_local_datetime(&(naive - ChronoDuration::days(1)))
                .earliest()
                .ok_or_else(|| anyhow!("{naive} does not exist in timezone {}", tz.name()))?;
            let utc = naive - before.offset().fix();
            Ok(tz.from_utc_datetime(&utc))
        }
    }
}
