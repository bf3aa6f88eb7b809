//! Daily-count anomaly verdicts: sustained concave dips and single-day zero drops.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// Marker written over a zero that follows two non-zero days.
pub const ZERO_DROP: i64 = -100;
/// Marker written over a zero inside a concave dip.
pub const CONCAVE_DIP: i64 = -200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AnalyzerConfig {
    /// Days below `concave_ratio * mean` count as depressed.
    pub concave_ratio: f64,
    /// Shortest depressed run reported as a concave dip.
    pub min_concave_run: usize,
    pub suppress_small_series: bool,
    /// A stream below this share of the tenant's total volume is not analyzed when suppressing.
    pub min_volume_share: f64,
    pub min_daily_average: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            concave_ratio: 0.3,
            min_concave_run: 2,
            suppress_small_series: false,
            min_volume_share: 0.01,
            min_daily_average: 50.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub level: Level,
    pub zero_days: usize,
    pub concave_count: usize,
    pub daily_average: f64,
    pub total_volume: i64,
    pub suppressed: bool,
    /// Same length as the input; anomalous zeros replaced by [`ZERO_DROP`] / [`CONCAVE_DIP`].
    pub processed: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DipRange {
    start: usize,
    end: usize,
}

fn mean(series: &[i64]) -> f64 {
    if series.is_empty() {
        return 0.0;
    }
    series.iter().sum::<i64>() as f64 / series.len() as f64
}

fn concave_ranges(series: &[i64], threshold: f64, min_run: usize) -> Vec<DipRange> {
    let low = |i: usize| (series[i] as f64) < threshold;
    let mut ranges = Vec::new();
    let mut i = 2;
    while i < series.len() {
        if !(low(i) && !low(i - 1) && !low(i - 2)) {
            i += 1;
            continue;
        }
        let start = i;
        let mut end = i;
        while end + 1 < series.len() && low(end + 1) {
            end += 1;
        }
        let recovered = end + 2 < series.len() && !low(end + 1) && !low(end + 2);
        if recovered && end - start + 1 >= min_run.max(1) {
            ranges.push(DipRange { start, end });
        }
        i = end + 1;
    }
    ranges
}

pub fn classify(series: &[i64], config: &AnalyzerConfig) -> Verdict {
    let total_volume = series.iter().sum::<i64>();
    let daily_average = mean(series);
    let mut verdict = Verdict {
        level: Level::Normal,
        zero_days: 0,
        concave_count: 0,
        daily_average,
        total_volume,
        suppressed: false,
        processed: series.to_vec(),
    };
    if series.len() < 3 {
        return verdict;
    }

    let threshold = daily_average * config.concave_ratio;
    for range in concave_ranges(series, threshold, config.min_concave_run) {
        for i in range.start..=range.end {
            if series[i] == 0 {
                verdict.processed[i] = CONCAVE_DIP;
                verdict.concave_count += 1;
            }
        }
    }

    for i in 0..series.len() {
        if series[i] != 0 || verdict.processed[i] == CONCAVE_DIP {
            continue;
        }
        if i >= 2 && series[i - 1] > 0 && series[i - 2] > 0 {
            verdict.processed[i] = ZERO_DROP;
        }
        verdict.zero_days += 1;
    }

    verdict.level = if verdict.concave_count > 0 {
        Level::Critical
    } else if verdict.zero_days > 0 {
        Level::Warning
    } else {
        Level::Normal
    };
    verdict
}

/// Like [`classify`], but skips detection for small series when suppression is enabled.
/// `tenant_total` is the tenant's volume across all streams over the same window.
pub fn classify_with_context(series: &[i64], tenant_total: i64, config: &AnalyzerConfig) -> Verdict {
    if config.suppress_small_series {
        let total = series.iter().sum::<i64>();
        let share = if tenant_total > 0 {
            total as f64 / tenant_total as f64
        } else {
            0.0
        };
        if share < config.min_volume_share || mean(series) < config.min_daily_average {
            return Verdict {
                level: Level::Normal,
                zero_days: 0,
                concave_count: 0,
                daily_average: mean(series),
                total_volume: total,
                suppressed: true,
                processed: series.to_vec(),
            };
        }
    }
    classify(series, config)
}

/// Dense daily counts over `[start, end)`; days without a point are zero.
pub fn fill_missing_days(points: &[(NaiveDate, i64)], start: NaiveDate, end: NaiveDate) -> (Vec<NaiveDate>, Vec<i64>) {
    let by_day = points.iter().fold(BTreeMap::new(), |mut acc, (day, count)| {
        *acc.entry(*day).or_insert(0i64) += *count;
        acc
    });
    let mut dates = Vec::new();
    let mut counts = Vec::new();
    let mut day = start;
    while day < end {
        dates.push(day);
        counts.push(by_day.get(&day).copied().unwrap_or(0));
        day += Duration::days(1);
    }
    (dates, counts)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantSeries {
    pub tenant_id: i64,
    pub dates: Vec<NaiveDate>,
    pub counts: Vec<i64>,
    pub verdict: Verdict,
}

fn dashboard_order(a: &TenantSeries, b: &TenantSeries) -> Ordering {
    b.verdict
        .concave_count
        .cmp(&a.verdict.concave_count)
        .then_with(|| b.verdict.zero_days.cmp(&a.verdict.zero_days))
        .then_with(|| b.verdict.total_volume.cmp(&a.verdict.total_volume))
        .then_with(|| a.tenant_id.cmp(&b.tenant_id))
}

/// Worst regressions first: concave count, then zero days, then volume.
pub fn sort_for_dashboard(series: &mut [TenantSeries]) {
    series.sort_by(dashboard_order);
}
