//! Range queries over stored results: parsing, bucketing and the chart
//! payload the dashboard consumes.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tdigests::TDigest;

use crate::check::CheckKind;
use crate::db::CheckResult;

/// Upper bound on buckets per query.
const MAX_BUCKETS: i64 = 10_000;

/// Raw `step`/`start`/`end` query parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RangeParams {
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RangeQuery {
    /// The newest window of raw samples.
    Latest,
    Bucketed {
        step: ChronoDuration,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Parse `30s`, `30m`, `2h` or `1d`.
pub fn parse_duration(s: &str) -> Option<ChronoDuration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = s.split_at(split);
    let n: i64 = num.parse().ok()?;
    if n <= 0 {
        return None;
    }
    // Out-of-range amounts are rejected rather than saturated.
    match unit {
        "s" => ChronoDuration::try_seconds(n),
        "m" => ChronoDuration::try_minutes(n),
        "h" => ChronoDuration::try_hours(n),
        "d" => ChronoDuration::try_days(n),
        _ => None,
    }
}

/// `now`, a relative duration counted back from `now`, or RFC 3339.
pub fn parse_instant(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("now") {
        return Some(now);
    }
    if let Some(d) = parse_duration(s) {
        return now.checked_sub_signed(d);
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl RangeQuery {
    pub fn parse(params: &RangeParams, now: DateTime<Utc>) -> Result<Self, String> {
        let Some(step) = params.step.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(Self::Latest);
        };
        let step = parse_duration(step).ok_or_else(|| format!("invalid step {:?}", step))?;

        let end = match params.end.as_deref() {
            Some(s) => parse_instant(s, now).ok_or_else(|| format!("invalid end {:?}", s))?,
            None => now,
        };
        let start = match params.start.as_deref() {
            Some(s) => parse_instant(s, now).ok_or_else(|| format!("invalid start {:?}", s))?,
            None => end
                .checked_sub_signed(ChronoDuration::hours(1))
                .ok_or_else(|| "end out of range".to_string())?,
        };
        if start >= end {
            return Err("start must be before end".to_string());
        }
        if (end - start).num_seconds() / step.num_seconds().max(1) > MAX_BUCKETS {
            return Err(format!("step too small: more than {} buckets", MAX_BUCKETS));
        }
        Ok(Self::Bucketed { step, start, end })
    }
}

/// Parallel comma-joined series. Every value is followed by a comma, so a
/// consumer strips one trailing empty element.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChartData {
    pub labels: String,
    #[serde(flatten)]
    pub series: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartResponse {
    #[serde(rename = "chartData")]
    pub chart_data: ChartData,
}

fn fmt_value(v: f64) -> String {
    if !v.is_finite() {
        return "0".to_string();
    }
    let rounded = (v * 1000.0).round() / 1000.0;
    format!("{}", rounded)
}

fn label_format(span: ChronoDuration) -> &'static str {
    if span > ChronoDuration::days(1) {
        "%Y-%m-%d %H:%M:%S"
    } else {
        "%H:%M:%S"
    }
}

impl ChartData {
    fn push(&mut self, label: String, values: &[(&str, Option<f64>)]) {
        self.labels.push_str(&label);
        self.labels.push(',');
        for (name, value) in values {
            let series = self.series.entry((*name).to_string()).or_default();
            series.push_str(&fmt_value(value.unwrap_or(0.0)));
            series.push(',');
        }
    }

    /// One point per result, in the given order.
    pub fn raw(kind: CheckKind, results: &[CheckResult]) -> Self {
        let mut chart = Self::default();
        let span = match (results.first(), results.last()) {
            (Some(a), Some(b)) => b.ingested_at - a.ingested_at,
            _ => ChronoDuration::zero(),
        };
        let fmt = label_format(span);
        for r in results {
            let mut values: Vec<(&str, Option<f64>)> = kind
                .metric_names()
                .iter()
                .map(|m| (*m, r.timings.get(m)))
                .collect();
            values.push(("status", Some(r.status.code() as f64)));
            chart.push(r.ingested_at.format(fmt).to_string(), &values);
        }
        chart
    }

    /// Mean per metric per `step` bucket aligned to the Unix epoch, plus a
    /// t-digest p95 of `response_time`. Empty buckets are omitted.
    pub fn bucketed(kind: CheckKind, results: &[CheckResult], step: ChronoDuration) -> Self {
        let step_secs = step.num_seconds().max(1);
        let mut buckets: BTreeMap<i64, Vec<&CheckResult>> = BTreeMap::new();
        for r in results {
            let ts = r.ingested_at.timestamp();
            buckets.entry(ts - ts.rem_euclid(step_secs)).or_default().push(r);
        }

        let mut chart = Self::default();
        let span = match (buckets.keys().next(), buckets.keys().next_back()) {
            (Some(a), Some(b)) => ChronoDuration::seconds(b - a),
            _ => ChronoDuration::zero(),
        };
        let fmt = label_format(span);

        for (bucket, members) in &buckets {
            let Some(label) = DateTime::<Utc>::from_timestamp(*bucket, 0) else {
                continue;
            };
            let mut values: Vec<(&str, Option<f64>)> = kind
                .metric_names()
                .iter()
                .map(|m| (*m, mean(members.iter().filter_map(|r| r.timings.get(m)))))
                .collect();

            let latencies: Vec<f64> = members
                .iter()
                .filter_map(|r| r.timings.response_time)
                .collect();
            values.push(("response_time_p95", p95(latencies)));

            chart.push(label.format(fmt).to_string(), &values);
        }
        chart
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn p95(values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut td = TDigest::from_values(values);
    td.compress(100);
    Some(td.estimate_quantile(0.95))
}
