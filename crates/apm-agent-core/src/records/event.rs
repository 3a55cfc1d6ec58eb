// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::attributes::{AttributeDestinations, AttributeValue};
use crate::metrics::ApdexZone;
use crate::naming::TransactionMetricName;
use crate::records::ErrorTrace;
use crate::transaction::ImmutableTransaction;

pub(crate) fn unix_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|since| since.as_secs_f64())
        .unwrap_or_default()
}

/// Analytics event describing one transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEvent {
    pub intrinsics: BTreeMap<String, AttributeValue>,
    pub user_attributes: BTreeMap<String, AttributeValue>,
    pub agent_attributes: BTreeMap<String, AttributeValue>,
}

impl TransactionEvent {
    #[must_use]
    pub fn build(
        transaction: &ImmutableTransaction,
        metric_name: &TransactionMetricName,
        total_time: Duration,
        apdex_zone: Option<ApdexZone>,
        error_reported: bool,
    ) -> Self {
        let set = transaction
            .metadata
            .attributes
            .for_destination(AttributeDestinations::TRANSACTION_EVENT);
        let mut intrinsics = set.intrinsics;
        intrinsics.insert("type".to_string(), "Transaction".into());
        intrinsics.insert("name".to_string(), metric_name.prefixed_name().into());
        intrinsics.insert(
            "timestamp".to_string(),
            unix_seconds(transaction.start_time).into(),
        );
        intrinsics.insert(
            "duration".to_string(),
            transaction.duration.as_secs_f64().into(),
        );
        intrinsics.insert("totalTime".to_string(), total_time.as_secs_f64().into());
        intrinsics.insert("guid".to_string(), transaction.guid.clone().into());
        intrinsics.insert("error".to_string(), error_reported.into());
        if let Some(queue_time) = transaction.metadata.queue_time {
            intrinsics.insert("queueDuration".to_string(), queue_time.as_secs_f64().into());
        }
        if let Some(zone) = apdex_zone {
            intrinsics.insert("apdexPerfZone".to_string(), zone.as_str().into());
        }

        Self {
            intrinsics,
            user_attributes: set.user_attributes,
            agent_attributes: set.agent_attributes,
        }
    }
}

/// Analytics event describing one reported error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub intrinsics: BTreeMap<String, AttributeValue>,
    pub user_attributes: BTreeMap<String, AttributeValue>,
    pub agent_attributes: BTreeMap<String, AttributeValue>,
}

impl ErrorEvent {
    #[must_use]
    pub fn build(transaction: &ImmutableTransaction, error: &ErrorTrace) -> Self {
        let set = transaction
            .metadata
            .attributes
            .for_destination(AttributeDestinations::ERROR_EVENT);
        let mut intrinsics = set.intrinsics;
        intrinsics.insert("type".to_string(), "TransactionError".into());
        intrinsics.insert("error.class".to_string(), error.error_class.clone().into());
        intrinsics.insert("error.message".to_string(), error.message.clone().into());
        intrinsics.insert("timestamp".to_string(), unix_seconds(error.timestamp).into());
        intrinsics.insert("transactionName".to_string(), error.path.clone().into());
        intrinsics.insert(
            "duration".to_string(),
            transaction.duration.as_secs_f64().into(),
        );
        intrinsics.insert("transactionGuid".to_string(), transaction.guid.clone().into());
        if let Some(queue_time) = transaction.metadata.queue_time {
            intrinsics.insert("queueDuration".to_string(), queue_time.as_secs_f64().into());
        }

        Self {
            intrinsics,
            user_attributes: set.user_attributes,
            agent_attributes: set.agent_attributes,
        }
    }
}
