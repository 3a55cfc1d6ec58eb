// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns a completed transaction into metrics and records and hands each one to
//! its sink.

use std::sync::Arc;

use tracing::{debug, debug_span};

use crate::aggregator::RecordSink;
use crate::config::AgentConfig;
use crate::error::TransformError;
use crate::metrics::{ApdexZone, TransactionMetricStats};
use crate::naming::{ConfiguredNameService, MetricNameService};
use crate::records::{
    collect_sql_traces, DefaultErrorTraceMaker, ErrorEvent, ErrorTrace, ErrorTraceMaker, SqlTrace,
    TransactionEvent, TransactionTrace,
};
use crate::rollup::{MetricRollupEngine, RollupContext};
use crate::transaction::ImmutableTransaction;
use crate::tree::build_forest;

/// Where each kind of output goes.
#[derive(Clone)]
pub struct TelemetrySinks {
    pub metrics: Arc<dyn RecordSink<TransactionMetricStats>>,
    pub traces: Arc<dyn RecordSink<TransactionTrace>>,
    pub events: Arc<dyn RecordSink<TransactionEvent>>,
    pub error_traces: Arc<dyn RecordSink<ErrorTrace>>,
    pub error_events: Arc<dyn RecordSink<ErrorEvent>>,
    pub sql_traces: Arc<dyn RecordSink<SqlTrace>>,
}

impl std::fmt::Debug for TelemetrySinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetrySinks").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformOutcome {
    /// Nothing was produced.
    Ignored,
    /// Telemetry was produced. `inconsistencies` counts producer mistakes that were
    /// tolerated, such as a child registered under several parents.
    Transformed { inconsistencies: usize },
}

#[derive(Debug, Clone, Copy)]
struct Features {
    transaction_tracer: bool,
    transaction_events: bool,
    error_collector: bool,
    error_events: bool,
    sql_traces: bool,
}

impl From<&AgentConfig> for Features {
    fn from(config: &AgentConfig) -> Self {
        Self {
            transaction_tracer: config.transaction_tracer_enabled,
            transaction_events: config.transaction_events_enabled
                && config.transaction_events_transactions_enabled,
            error_collector: config.error_collector_enabled,
            error_events: config.error_collector_capture_events,
            sql_traces: config.sql_trace_enabled,
        }
    }
}

pub struct TransactionTransformer {
    features: Features,
    engine: MetricRollupEngine,
    name_service: Arc<dyn MetricNameService>,
    error_maker: Arc<dyn ErrorTraceMaker>,
    sinks: TelemetrySinks,
}

impl TransactionTransformer {
    #[must_use]
    pub fn new(
        config: &AgentConfig,
        name_service: Arc<dyn MetricNameService>,
        error_maker: Arc<dyn ErrorTraceMaker>,
        sinks: TelemetrySinks,
    ) -> Self {
        Self {
            features: Features::from(config),
            engine: MetricRollupEngine::new(config.runtime_prefix.clone()),
            name_service,
            error_maker,
            sinks,
        }
    }

    /// Transformer using the configuration-driven naming and error rules.
    #[must_use]
    pub fn from_config(config: &AgentConfig, sinks: TelemetrySinks) -> Self {
        Self::new(
            config,
            Arc::new(ConfiguredNameService::from_config(config)),
            Arc::new(DefaultErrorTraceMaker::from_config(config)),
            sinks,
        )
    }

    pub fn transform(
        &self,
        transaction: ImmutableTransaction,
    ) -> Result<TransformOutcome, TransformError> {
        let _span = debug_span!("transform", guid = %transaction.guid).entered();

        if transaction.ignored {
            debug!("Transaction was ignored, skipping");
            return Ok(TransformOutcome::Ignored);
        }
        if transaction.spans.is_empty() {
            return Err(TransformError::EmptyTransaction);
        }

        let metric_name = self.name_service.transaction_metric_name(&transaction.name);
        if metric_name.ignored {
            debug!("Transaction {} matches an ignore rule, skipping", metric_name.prefixed_name());
            return Ok(TransformOutcome::Ignored);
        }

        let forest = build_forest(&transaction.spans);
        let duplicates = usize::try_from(transaction.duplicate_registrations).unwrap_or(usize::MAX);
        // Each re-registration leaves one stale child entry, which the forest counts.
        let inconsistencies = forest.inconsistencies;
        if inconsistencies > 0 {
            debug!(
                "Transaction {} had {} inconsistent span registrations ({} re-registered children)",
                metric_name.prefixed_name(),
                inconsistencies,
                duplicates
            );
        }

        let error_trace = if self.features.error_collector {
            self.error_maker.make(&transaction, &metric_name)
        } else {
            None
        };
        let error_reported = error_trace.is_some();

        let apdex_target = self.name_service.apdex_target(&metric_name);
        let context = RollupContext {
            metric_name: &metric_name,
            duration: transaction.duration,
            queue_time: transaction.metadata.queue_time,
            apdex_target,
            error_reported,
            referrer_cross_process_id: transaction.metadata.referrer_cross_process_id.as_deref(),
        };
        let stats = self.engine.rollup(&forest, &context);
        self.sinks.metrics.accept(stats);

        if self.features.transaction_tracer {
            if let Some(trace) = TransactionTrace::build(&transaction, &forest, &metric_name) {
                Self::forward(&*self.sinks.traces, trace, "transaction trace");
            }
        }

        if self.features.transaction_events {
            let apdex_zone = apdex_target
                .map(|target| ApdexZone::classify(transaction.duration, target, error_reported));
            let event = TransactionEvent::build(
                &transaction,
                &metric_name,
                forest.total_exclusive_duration(),
                apdex_zone,
                error_reported,
            );
            Self::forward(&*self.sinks.events, event, "transaction event");
        }

        if let Some(error_trace) = error_trace {
            if self.features.error_events {
                let event = ErrorEvent::build(&transaction, &error_trace);
                Self::forward(&*self.sinks.error_events, event, "error event");
            }
            Self::forward(&*self.sinks.error_traces, error_trace, "error trace");
        }

        if self.features.sql_traces {
            let sql_traces = collect_sql_traces(
                &forest,
                self.engine.runtime_prefix(),
                &metric_name,
                transaction.metadata.uri.as_deref(),
            );
            for sql_trace in sql_traces {
                Self::forward(&*self.sinks.sql_traces, sql_trace, "sql trace");
            }
        }

        Ok(TransformOutcome::Transformed { inconsistencies })
    }

    fn forward<T>(sink: &dyn RecordSink<T>, record: T, kind: &str) {
        if !sink.accept(record) {
            debug!("Dropped {kind}, buffer is full");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregator::MetricAggregator;
    use crate::attributes::{AttributeDestinations, AttributeValue};
    use crate::metrics::MetricData;
    use crate::span::{SpanKind, SQL_ATTRIBUTE};
    use crate::transaction::{ErrorRecord, Transaction, TransactionName};
    use apm_collections::PartitionedBuffer;
    use std::time::Duration;
    use tracing_test::traced_test;

    struct Harness {
        aggregator: Arc<MetricAggregator>,
        traces: Arc<PartitionedBuffer<TransactionTrace>>,
        events: Arc<PartitionedBuffer<TransactionEvent>>,
        error_traces: Arc<PartitionedBuffer<ErrorTrace>>,
        error_events: Arc<PartitionedBuffer<ErrorEvent>>,
        sql_traces: Arc<PartitionedBuffer<SqlTrace>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                aggregator: Arc::new(MetricAggregator::new()),
                traces: Arc::new(PartitionedBuffer::new(10, 2).unwrap()),
                events: Arc::new(PartitionedBuffer::new(10, 2).unwrap()),
                error_traces: Arc::new(PartitionedBuffer::new(10, 2).unwrap()),
                error_events: Arc::new(PartitionedBuffer::new(10, 2).unwrap()),
                sql_traces: Arc::new(PartitionedBuffer::new(10, 2).unwrap()),
            }
        }

        fn transformer(&self, config: &AgentConfig) -> TransactionTransformer {
            let sinks = TelemetrySinks {
                metrics: self.aggregator.clone(),
                traces: self.traces.clone(),
                events: self.events.clone(),
                error_traces: self.error_traces.clone(),
                error_events: self.error_events.clone(),
                sql_traces: self.sql_traces.clone(),
            };
            TransactionTransformer::from_config(config, sinks)
        }
    }

    fn web_transaction() -> Transaction {
        Transaction::with_guid(TransactionName::web("Uri", "checkout"), "guid-1")
    }

    fn with_root(tx: &Transaction, millis: u64) {
        let root = tx.create_span("handler", SpanKind::Method, Duration::ZERO).unwrap();
        tx.end_span(root, Duration::from_millis(millis)).unwrap();
    }

    #[test]
    fn test_ignored_transaction_produces_nothing() {
        let harness = Harness::new();
        let tx = web_transaction();
        with_root(&tx, 10);
        tx.ignore();

        let outcome = harness
            .transformer(&AgentConfig::default())
            .transform(tx.complete(Duration::from_millis(10)).unwrap());
        assert_eq!(outcome, Ok(TransformOutcome::Ignored));
        assert!(harness.aggregator.harvest().is_empty());
        assert!(harness.traces.is_empty());
        assert!(harness.events.is_empty());
    }

    #[test]
    fn test_empty_transaction_is_rejected() {
        let harness = Harness::new();
        let tx = web_transaction();
        let outcome = harness
            .transformer(&AgentConfig::default())
            .transform(tx.complete(Duration::from_millis(10)).unwrap());
        assert_eq!(outcome, Err(TransformError::EmptyTransaction));
        assert!(harness.aggregator.harvest().is_empty());
    }

    #[test]
    fn test_ignored_name_produces_nothing() {
        let harness = Harness::new();
        let config = AgentConfig {
            ignored_transaction_names: vec!["WebTransaction/Uri/checkout".to_string()],
            ..AgentConfig::default()
        };
        let tx = web_transaction();
        with_root(&tx, 10);
        let outcome = harness
            .transformer(&config)
            .transform(tx.complete(Duration::from_millis(10)).unwrap());
        assert_eq!(outcome, Ok(TransformOutcome::Ignored));
        assert_eq!(harness.aggregator.transaction_count(), 0);
    }

    #[test]
    fn test_every_sink_receives_its_record() {
        let harness = Harness::new();
        let tx = web_transaction();
        let root = tx.create_span("handler", SpanKind::Method, Duration::ZERO).unwrap();
        let query = tx
            .create_span("Datastore/select", SpanKind::Datastore, Duration::from_millis(5))
            .unwrap();
        tx.add_span_attribute(
            query,
            SQL_ATTRIBUTE,
            "SELECT 1",
            AttributeDestinations::TRANSACTION_TRACE,
        )
        .unwrap();
        tx.end_span(query, Duration::from_millis(25)).unwrap();
        tx.register_child_finished(root, query).unwrap();
        tx.end_span(root, Duration::from_millis(50)).unwrap();
        tx.set_status_code(500);
        tx.notice_error(ErrorRecord::new("PaymentError", "card declined"));

        let outcome = harness
            .transformer(&AgentConfig::default())
            .transform(tx.complete(Duration::from_millis(50)).unwrap())
            .unwrap();
        assert_eq!(outcome, TransformOutcome::Transformed { inconsistencies: 0 });

        assert_eq!(harness.traces.count(), 1);
        assert_eq!(harness.events.count(), 1);
        assert_eq!(harness.error_traces.count(), 1);
        assert_eq!(harness.error_events.count(), 1);
        assert_eq!(harness.sql_traces.count(), 1);

        let metrics = harness.aggregator.harvest();
        assert_eq!(metrics.transaction_count, 1);
        assert_eq!(metrics.unscoped("Errors/all").map(MetricData::call_count), Some(1));
        let apdex = *metrics.unscoped("ApdexAll").and_then(MetricData::as_apdex).unwrap();
        assert_eq!(apdex.frustrating, 1);
        let scoped = metrics
            .scoped("WebTransaction/Uri/checkout", "Rust/Datastore/select")
            .and_then(MetricData::as_timing)
            .unwrap();
        assert_eq!(scoped.total, Duration::from_millis(20));

        let event = harness.events.try_take().unwrap();
        assert_eq!(event.intrinsics["apdexPerfZone"], AttributeValue::from("F"));
        assert_eq!(event.intrinsics["error"], AttributeValue::Bool(true));
    }

    #[test]
    fn test_disabled_features_skip_records() {
        let harness = Harness::new();
        let config = AgentConfig {
            transaction_tracer_enabled: false,
            transaction_events_transactions_enabled: false,
            error_collector_enabled: false,
            sql_trace_enabled: false,
            ..AgentConfig::default()
        };
        let tx = web_transaction();
        with_root(&tx, 10);
        tx.notice_error(ErrorRecord::new("Boom", "boom"));

        harness
            .transformer(&config)
            .transform(tx.complete(Duration::from_millis(10)).unwrap())
            .unwrap();
        assert!(harness.traces.is_empty());
        assert!(harness.events.is_empty());
        assert!(harness.error_traces.is_empty());
        assert!(harness.error_events.is_empty());
        let metrics = harness.aggregator.harvest();
        assert!(metrics.unscoped("Errors/all").is_none());
        let apdex = *metrics.unscoped("ApdexAll").and_then(MetricData::as_apdex).unwrap();
        assert_eq!(apdex.satisfying, 1);
    }

    #[test]
    fn test_error_events_can_be_disabled_alone() {
        let harness = Harness::new();
        let config = AgentConfig {
            error_collector_capture_events: false,
            ..AgentConfig::default()
        };
        let tx = web_transaction();
        with_root(&tx, 10);
        tx.set_status_code(502);

        harness
            .transformer(&config)
            .transform(tx.complete(Duration::from_millis(10)).unwrap())
            .unwrap();
        assert_eq!(harness.error_traces.count(), 1);
        assert!(harness.error_events.is_empty());
    }

    #[test]
    #[traced_test]
    fn test_inconsistencies_are_counted_and_logged() {
        let harness = Harness::new();
        let tx = web_transaction();
        let first = tx.create_span("first", SpanKind::Method, Duration::ZERO).unwrap();
        let second = tx.create_span("second", SpanKind::Method, Duration::ZERO).unwrap();
        let child = tx.create_span("child", SpanKind::Method, Duration::ZERO).unwrap();
        tx.end_span(child, Duration::from_millis(2)).unwrap();
        tx.register_child_finished(first, child).unwrap();
        tx.register_child_finished(second, child).unwrap();
        tx.end_span(first, Duration::from_millis(5)).unwrap();
        tx.end_span(second, Duration::from_millis(5)).unwrap();

        let outcome = harness
            .transformer(&AgentConfig::default())
            .transform(tx.complete(Duration::from_millis(5)).unwrap())
            .unwrap();
        assert_eq!(outcome, TransformOutcome::Transformed { inconsistencies: 1 });
        assert!(logs_contain("had 1 inconsistent span registrations (1 re-registered children)"));
    }

    #[test]
    #[traced_test]
    fn test_full_buffer_drops_are_logged() {
        let harness = Harness {
            traces: Arc::new(PartitionedBuffer::new(1, 1).unwrap()),
            ..Harness::new()
        };
        let transformer = harness.transformer(&AgentConfig::default());
        for _ in 0..2 {
            let tx = web_transaction();
            with_root(&tx, 10);
            transformer
                .transform(tx.complete(Duration::from_millis(10)).unwrap())
                .unwrap();
        }
        assert_eq!(harness.traces.count(), 1);
        assert_eq!(harness.traces.rejected_count(), 1);
        assert!(logs_contain("Dropped transaction trace"));
    }
}
