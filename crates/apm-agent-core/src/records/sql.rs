// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

use fnv::FnvBuildHasher;
use serde::Serialize;

use crate::naming::TransactionMetricName;
use crate::span::SpanKind;
use crate::tree::Forest;

/// Slow-query record for one distinct statement within a transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlTrace {
    pub sql_id: u64,
    pub transaction_name: String,
    pub uri: Option<String>,
    pub metric_name: String,
    pub statement: String,
    pub call_count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl SqlTrace {
    fn record(&mut self, duration: Duration) {
        self.call_count += 1;
        self.total = self.total.saturating_add(duration);
        self.min = self.min.min(duration);
        self.max = self.max.max(duration);
    }
}

fn sql_id(statement: &str) -> u64 {
    let mut hasher = FnvBuildHasher::default().build_hasher();
    hasher.write(statement.as_bytes());
    hasher.finish()
}

/// Collects datastore spans carrying a statement, one trace per distinct
/// statement, in order of first appearance.
#[must_use]
pub fn collect_sql_traces(
    forest: &Forest<'_>,
    runtime_prefix: &str,
    metric_name: &TransactionMetricName,
    uri: Option<&str>,
) -> Vec<SqlTrace> {
    let mut traces: Vec<SqlTrace> = Vec::new();
    for node in forest.iter() {
        let span = node.span();
        if span.kind() != SpanKind::Datastore {
            continue;
        }
        let Some(statement) = span.sql_statement() else {
            continue;
        };
        let duration = node.inclusive_duration();
        match traces.iter_mut().find(|trace| trace.statement == statement) {
            Some(existing) => existing.record(duration),
            None => traces.push(SqlTrace {
                sql_id: sql_id(statement),
                transaction_name: metric_name.prefixed_name(),
                uri: uri.map(str::to_string),
                metric_name: format!("{runtime_prefix}/{}", span.name()),
                statement: statement.to_string(),
                call_count: 1,
                total: duration,
                min: duration,
                max: duration,
            }),
        }
    }
    traces
}
