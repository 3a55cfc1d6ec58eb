// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destinations for transformed telemetry.
//!
//! Records go to [`RecordSink`]s (usually a [`PartitionedBuffer`]); metric tables
//! are merged into the harvester-owned [`MetricAggregator`] one transaction at a
//! time.

use std::sync::Mutex;

use apm_collections::PartitionedBuffer;
use hashbrown::HashMap;
use tracing::debug;
use ustr::Ustr;

use crate::metrics::{MetricData, MetricStatsTable, TransactionMetricStats};

/// Accepts completed records. Returning `false` means the record was dropped.
pub trait RecordSink<T>: Send + Sync {
    fn accept(&self, record: T) -> bool;
}

impl<T: Send> RecordSink<T> for PartitionedBuffer<T> {
    fn accept(&self, record: T) -> bool {
        self.try_add(record).is_ok()
    }
}

/// Metric tables accumulated since the last harvest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSnapshot {
    /// Scoped tables keyed by the transaction metric name they belong to.
    pub scoped: HashMap<Ustr, MetricStatsTable>,
    pub unscoped: MetricStatsTable,
    pub transaction_count: u64,
}

impl MetricSnapshot {
    #[must_use]
    pub fn scoped(&self, scope: &str, name: &str) -> Option<&MetricData> {
        self.scoped.get(&Ustr::from(scope))?.get(name)
    }

    #[must_use]
    pub fn unscoped(&self, name: &str) -> Option<&MetricData> {
        self.unscoped.get(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transaction_count == 0 && self.unscoped.is_empty() && self.scoped.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct MetricAggregator {
    current: Mutex<MetricSnapshot>,
}

impl MetricAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricSnapshot> {
        #[allow(clippy::expect_used)]
        self.current.lock().expect("lock poisoned")
    }

    /// Merges one transaction's metric contribution under a single lock.
    pub fn collect(&self, stats: TransactionMetricStats) {
        let scope = Ustr::from(stats.transaction_name.as_str());
        let mut current = self.lock();
        current
            .scoped
            .entry(scope)
            .or_default()
            .merge_table(&stats.scoped);
        current.unscoped.merge_table(&stats.unscoped);
        current.transaction_count += 1;
    }

    /// Takes everything collected so far, leaving an empty table behind.
    pub fn harvest(&self) -> MetricSnapshot {
        let snapshot = std::mem::take(&mut *self.lock());
        debug!(
            "Harvested metrics for {} transactions, {} unscoped names",
            snapshot.transaction_count,
            snapshot.unscoped.len()
        );
        snapshot
    }

    #[must_use]
    pub fn transaction_count(&self) -> u64 {
        self.lock().transaction_count
    }
}

impl RecordSink<TransactionMetricStats> for MetricAggregator {
    fn accept(&self, record: TransactionMetricStats) -> bool {
        self.collect(record);
        true
    }
}
