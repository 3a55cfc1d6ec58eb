// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Derives the scoped and unscoped metric tables for one finished transaction.
//!
//! Every node of every root contributes a `<runtime prefix>/<span name>` timing.
//! Transaction-level rollups follow: transaction time, total time, queue time,
//! Apdex, errors and the cross-process caller metric, each emitted only when the
//! facts it depends on are present.

use std::time::Duration;

use crate::metrics::{ApdexStatistic, ApdexZone, MetricStatistic, TransactionMetricStats};
use crate::naming::TransactionMetricName;
use crate::tree::Forest;

pub const WEB_TRANSACTION_ALL: &str = "WebTransaction";
pub const OTHER_TRANSACTION_ALL: &str = "OtherTransaction/all";
pub const HTTP_DISPATCHER: &str = "HttpDispatcher";
pub const WEB_TOTAL_TIME: &str = "WebTransactionTotalTime";
pub const OTHER_TOTAL_TIME: &str = "OtherTransactionTotalTime";
pub const QUEUE_TIME: &str = "WebFrontend/QueueTime";
pub const APDEX_ALL: &str = "ApdexAll";
pub const APDEX: &str = "Apdex";
pub const ERRORS_ALL: &str = "Errors/all";
pub const ERRORS_ALL_WEB: &str = "Errors/allWeb";
pub const ERRORS_ALL_OTHER: &str = "Errors/allOther";

/// Transaction facts the rollups are conditioned on.
#[derive(Debug, Clone, Copy)]
pub struct RollupContext<'t> {
    pub metric_name: &'t TransactionMetricName,
    pub duration: Duration,
    pub queue_time: Option<Duration>,
    pub apdex_target: Option<Duration>,
    /// Whether the error collaborator produced a reportable error for this transaction.
    pub error_reported: bool,
    pub referrer_cross_process_id: Option<&'t str>,
}

#[derive(Debug, Clone)]
pub struct MetricRollupEngine {
    runtime_prefix: String,
}

impl MetricRollupEngine {
    #[must_use]
    pub fn new(runtime_prefix: impl Into<String>) -> Self {
        Self {
            runtime_prefix: runtime_prefix.into(),
        }
    }

    #[must_use]
    pub fn runtime_prefix(&self) -> &str {
        &self.runtime_prefix
    }

    /// Builds the metric contribution of one transaction. The forest must not be
    /// empty; callers reject span-less transactions before getting here.
    #[must_use]
    pub fn rollup(&self, forest: &Forest<'_>, context: &RollupContext<'_>) -> TransactionMetricStats {
        let mut stats = TransactionMetricStats::new(context.metric_name.prefixed_name());

        self.node_metrics(forest, &mut stats);
        Self::transaction_metrics(context, &mut stats);
        Self::total_time_metrics(forest, context, &mut stats);
        if let Some(queue_time) = context.queue_time {
            stats
                .unscoped
                .merge_timing(QUEUE_TIME, MetricStatistic::timing(queue_time, queue_time));
        }
        if let Some(target) = context.apdex_target {
            Self::apdex_metrics(context, target, &mut stats);
        }
        if context.error_reported {
            Self::error_metrics(context, &mut stats);
        }
        if let Some(referrer) = context.referrer_cross_process_id {
            stats.unscoped.merge_timing(
                format!("ClientApplication/{referrer}/all"),
                MetricStatistic::timing(context.duration, context.duration),
            );
        }
        stats
    }

    fn node_metrics(&self, forest: &Forest<'_>, stats: &mut TransactionMetricStats) {
        for node in forest.iter() {
            let name = format!("{}/{}", self.runtime_prefix, node.span().name());
            let stat = MetricStatistic::timing(node.inclusive_duration(), node.exclusive_duration());
            stats.scoped.merge_timing(&name, stat);
            stats.unscoped.merge_timing(&name, stat);
        }
    }

    fn transaction_metrics(context: &RollupContext<'_>, stats: &mut TransactionMetricStats) {
        let stat = MetricStatistic::timing(context.duration, context.duration);
        let prefixed = context.metric_name.prefixed_name();
        if context.metric_name.is_web() {
            stats.unscoped.merge_timing(WEB_TRANSACTION_ALL, stat);
            stats.unscoped.merge_timing(HTTP_DISPATCHER, stat);
        } else {
            stats.unscoped.merge_timing(OTHER_TRANSACTION_ALL, stat);
        }
        stats.scoped.merge_timing(&prefixed, stat);
        stats.unscoped.merge_timing(&prefixed, stat);
    }

    fn total_time_metrics(
        forest: &Forest<'_>,
        context: &RollupContext<'_>,
        stats: &mut TransactionMetricStats,
    ) {
        let total = forest.total_exclusive_duration();
        let stat = MetricStatistic::timing(total, total);
        let rollup = if context.metric_name.is_web() {
            WEB_TOTAL_TIME
        } else {
            OTHER_TOTAL_TIME
        };
        stats.unscoped.merge_timing(rollup, stat);
        stats
            .unscoped
            .merge_timing(format!("{rollup}/{}", context.metric_name.unprefixed), stat);
    }

    fn apdex_metrics(context: &RollupContext<'_>, target: Duration, stats: &mut TransactionMetricStats) {
        let zone = ApdexZone::classify(context.duration, target, context.error_reported);
        let stat = ApdexStatistic::from_zone(zone, target);
        stats.unscoped.merge_apdex(APDEX_ALL, stat);
        stats.unscoped.merge_apdex(APDEX, stat);
        stats
            .unscoped
            .merge_apdex(format!("{APDEX}/{}", context.metric_name.unprefixed), stat);
    }

    fn error_metrics(context: &RollupContext<'_>, stats: &mut TransactionMetricStats) {
        let stat = MetricStatistic::count(1);
        let category = if context.metric_name.is_web() {
            ERRORS_ALL_WEB
        } else {
            ERRORS_ALL_OTHER
        };
        stats.unscoped.merge_timing(ERRORS_ALL, stat);
        stats.unscoped.merge_timing(category, stat);
        stats
            .unscoped
            .merge_timing(format!("Errors/{}", context.metric_name.prefixed_name()), stat);
    }
}
