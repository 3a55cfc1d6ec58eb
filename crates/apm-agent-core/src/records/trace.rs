// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::attributes::{AttributeDestinations, AttributeSet, AttributeValue};
use crate::naming::TransactionMetricName;
use crate::transaction::ImmutableTransaction;
use crate::tree::{Forest, TimingNode};

pub const ROOT_SEGMENT_NAME: &str = "ROOT";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceSegment {
    pub start: Duration,
    pub end: Duration,
    pub name: String,
    pub parameters: BTreeMap<String, AttributeValue>,
    pub children: Vec<TraceSegment>,
}

impl TraceSegment {
    fn from_node(node: &TimingNode<'_>) -> Self {
        let span = node.span();
        Self {
            start: span.start(),
            end: span.start().saturating_add(node.inclusive_duration()),
            name: span.name().to_string(),
            parameters: span.trace_parameters(),
            children: node.children().iter().map(Self::from_node).collect(),
        }
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        1 + self.children.iter().map(Self::segment_count).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionTrace {
    pub start_time: SystemTime,
    pub duration: Duration,
    pub metric_name: String,
    pub uri: Option<String>,
    pub guid: String,
    /// Synthetic segment spanning the whole transaction. Its first child is the
    /// primary root; any other roots follow as siblings.
    pub root: TraceSegment,
    pub attributes: AttributeSet,
}

impl TransactionTrace {
    #[must_use]
    pub fn build(
        transaction: &ImmutableTransaction,
        forest: &Forest<'_>,
        metric_name: &TransactionMetricName,
    ) -> Option<Self> {
        if forest.is_empty() {
            return None;
        }
        let root = TraceSegment {
            start: Duration::ZERO,
            end: transaction.duration,
            name: ROOT_SEGMENT_NAME.to_string(),
            parameters: BTreeMap::new(),
            children: forest.roots.iter().map(TraceSegment::from_node).collect(),
        };
        Some(Self {
            start_time: transaction.start_time,
            duration: transaction.duration,
            metric_name: metric_name.prefixed_name(),
            uri: transaction.metadata.uri.clone(),
            guid: transaction.guid.clone(),
            root,
            attributes: transaction
                .metadata
                .attributes
                .for_destination(AttributeDestinations::TRANSACTION_TRACE),
        })
    }
}
