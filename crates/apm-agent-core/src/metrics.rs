// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric statistics and the per-transaction tables they are collected in.

use std::time::Duration;

use hashbrown::HashMap;
use tracing::warn;
use ustr::Ustr;

/// Timing aggregate for one metric name.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MetricStatistic {
    pub call_count: u64,
    pub total: Duration,
    pub exclusive: Duration,
    pub min: Duration,
    pub max: Duration,
    /// Sum of squared inclusive durations, in seconds squared.
    pub sum_of_squares: f64,
}

impl MetricStatistic {
    /// One timed call.
    #[must_use]
    pub fn timing(total: Duration, exclusive: Duration) -> Self {
        let seconds = total.as_secs_f64();
        Self {
            call_count: 1,
            total,
            exclusive,
            min: total,
            max: total,
            sum_of_squares: seconds * seconds,
        }
    }

    /// A bare occurrence counter with no timing component.
    #[must_use]
    pub fn count(call_count: u64) -> Self {
        Self {
            call_count,
            ..Self::default()
        }
    }

    pub fn merge(&mut self, other: &MetricStatistic) {
        if self.call_count == 0 {
            *self = *other;
            return;
        }
        if other.call_count == 0 {
            return;
        }
        self.call_count += other.call_count;
        self.total = self.total.saturating_add(other.total);
        self.exclusive = self.exclusive.saturating_add(other.exclusive);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum_of_squares += other.sum_of_squares;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApdexZone {
    Satisfying,
    Tolerating,
    Frustrating,
}

impl ApdexZone {
    /// Satisfying up to `target`, tolerating up to four times `target`,
    /// frustrating beyond that or whenever the transaction reported an error.
    #[must_use]
    pub fn classify(duration: Duration, target: Duration, has_error: bool) -> Self {
        if has_error {
            Self::Frustrating
        } else if duration <= target {
            Self::Satisfying
        } else if duration <= target.saturating_mul(4) {
            Self::Tolerating
        } else {
            Self::Frustrating
        }
    }

    /// Single-letter form used on transaction events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Satisfying => "S",
            Self::Tolerating => "T",
            Self::Frustrating => "F",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApdexStatistic {
    pub satisfying: u64,
    pub tolerating: u64,
    pub frustrating: u64,
    pub apdex_min: Duration,
    pub apdex_max: Duration,
}

impl ApdexStatistic {
    #[must_use]
    pub fn from_zone(zone: ApdexZone, target: Duration) -> Self {
        let mut stat = Self {
            apdex_min: target,
            apdex_max: target,
            ..Self::default()
        };
        match zone {
            ApdexZone::Satisfying => stat.satisfying = 1,
            ApdexZone::Tolerating => stat.tolerating = 1,
            ApdexZone::Frustrating => stat.frustrating = 1,
        }
        stat
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.satisfying + self.tolerating + self.frustrating
    }

    pub fn merge(&mut self, other: &ApdexStatistic) {
        if self.total() == 0 {
            *self = *other;
            return;
        }
        self.satisfying += other.satisfying;
        self.tolerating += other.tolerating;
        self.frustrating += other.frustrating;
        self.apdex_min = self.apdex_min.min(other.apdex_min);
        self.apdex_max = self.apdex_max.max(other.apdex_max);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricData {
    Timing(MetricStatistic),
    Apdex(ApdexStatistic),
}

impl MetricData {
    #[must_use]
    pub fn call_count(&self) -> u64 {
        match self {
            Self::Timing(stat) => stat.call_count,
            Self::Apdex(stat) => stat.total(),
        }
    }

    #[must_use]
    pub fn as_timing(&self) -> Option<&MetricStatistic> {
        match self {
            Self::Timing(stat) => Some(stat),
            Self::Apdex(_) => None,
        }
    }

    #[must_use]
    pub fn as_apdex(&self) -> Option<&ApdexStatistic> {
        match self {
            Self::Apdex(stat) => Some(stat),
            Self::Timing(_) => None,
        }
    }

    fn merge(&mut self, name: Ustr, other: &MetricData) {
        match (self, other) {
            (Self::Timing(current), Self::Timing(incoming)) => current.merge(incoming),
            (Self::Apdex(current), Self::Apdex(incoming)) => current.merge(incoming),
            (current, incoming) => {
                warn!("Metric {name} recorded as both timing and apdex, keeping {current:?}, dropping {incoming:?}");
            }
        }
    }
}

/// Metric name to statistic map. Names are interned since the same few hundred
/// names repeat across every transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricStatsTable {
    entries: HashMap<Ustr, MetricData>,
}

impl MetricStatsTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, name: impl AsRef<str>, data: MetricData) {
        let name = Ustr::from(name.as_ref());
        match self.entries.get_mut(&name) {
            Some(existing) => existing.merge(name, &data),
            None => {
                self.entries.insert(name, data);
            }
        }
    }

    pub fn merge_timing(&mut self, name: impl AsRef<str>, stat: MetricStatistic) {
        self.merge(name, MetricData::Timing(stat));
    }

    pub fn merge_apdex(&mut self, name: impl AsRef<str>, stat: ApdexStatistic) {
        self.merge(name, MetricData::Apdex(stat));
    }

    pub fn merge_table(&mut self, other: &MetricStatsTable) {
        for (name, data) in &other.entries {
            self.merge(name.as_str(), *data);
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MetricData> {
        self.entries.get(&Ustr::from(name))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricData)> {
        self.entries.iter().map(|(name, data)| (name.as_str(), data))
    }

    /// Names in sorted order, handy for stable output.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(Ustr::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Everything one transaction contributes to the harvest's metric table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionMetricStats {
    /// Prefixed transaction metric name the scoped table is attributed to.
    pub transaction_name: String,
    pub scoped: MetricStatsTable,
    pub unscoped: MetricStatsTable,
}

impl TransactionMetricStats {
    #[must_use]
    pub fn new(transaction_name: impl Into<String>) -> Self {
        Self {
            transaction_name: transaction_name.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_statistic() {
        let stat = MetricStatistic::timing(Duration::from_secs(3), Duration::from_secs(1));
        assert_eq!(stat.call_count, 1);
        assert_eq!(stat.min, Duration::from_secs(3));
        assert_eq!(stat.max, Duration::from_secs(3));
        assert!((stat.sum_of_squares - 9.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge() {
        let mut stat = MetricStatistic::timing(Duration::from_secs(3), Duration::from_secs(1));
        stat.merge(&MetricStatistic::timing(Duration::from_secs(1), Duration::from_secs(1)));
        assert_eq!(stat.call_count, 2);
        assert_eq!(stat.total, Duration::from_secs(4));
        assert_eq!(stat.exclusive, Duration::from_secs(2));
        assert_eq!(stat.min, Duration::from_secs(1));
        assert_eq!(stat.max, Duration::from_secs(3));
        assert!((stat.sum_of_squares - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge_into_empty_copies() {
        let mut stat = MetricStatistic::default();
        let incoming = MetricStatistic::timing(Duration::from_millis(5), Duration::from_millis(5));
        stat.merge(&incoming);
        assert_eq!(stat, incoming);
    }

    #[test]
    fn test_apdex_zones() {
        let t = Duration::from_secs(1);
        assert_eq!(ApdexZone::classify(Duration::from_secs(1), t, false), ApdexZone::Satisfying);
        assert_eq!(ApdexZone::classify(Duration::from_secs(4), t, false), ApdexZone::Tolerating);
        assert_eq!(
            ApdexZone::classify(Duration::from_millis(4001), t, false),
            ApdexZone::Frustrating
        );
        assert_eq!(ApdexZone::classify(Duration::ZERO, t, true), ApdexZone::Frustrating);
    }

    #[test]
    fn test_apdex_merge_tracks_target_range() {
        let mut stat = ApdexStatistic::from_zone(ApdexZone::Satisfying, Duration::from_millis(500));
        stat.merge(&ApdexStatistic::from_zone(ApdexZone::Frustrating, Duration::from_secs(2)));
        assert_eq!(stat.satisfying, 1);
        assert_eq!(stat.frustrating, 1);
        assert_eq!(stat.apdex_min, Duration::from_millis(500));
        assert_eq!(stat.apdex_max, Duration::from_secs(2));
    }

    #[test]
    fn test_table_merges_by_name() {
        let mut table = MetricStatsTable::new();
        table.merge_timing("Rust/a", MetricStatistic::timing(Duration::from_secs(1), Duration::ZERO));
        table.merge_timing("Rust/a", MetricStatistic::timing(Duration::from_secs(2), Duration::ZERO));
        table.merge_timing("Rust/b", MetricStatistic::count(1));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("Rust/a").map(MetricData::call_count), Some(2));
        assert_eq!(table.names(), vec!["Rust/a", "Rust/b"]);
    }

    #[test]
    fn test_mismatched_kinds_keep_existing() {
        let mut table = MetricStatsTable::new();
        table.merge_timing("Apdex", MetricStatistic::count(1));
        table.merge_apdex(
            "Apdex",
            ApdexStatistic::from_zone(ApdexZone::Satisfying, Duration::from_secs(1)),
        );
        assert!(table.get("Apdex").and_then(MetricData::as_timing).is_some());
    }
}
