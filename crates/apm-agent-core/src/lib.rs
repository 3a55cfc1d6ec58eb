// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns finished transactions into metrics, traces, events and error records.
//!
//! A [`Transaction`] collects spans while work is in flight. Once it completes,
//! [`TransactionTransformer::transform`] assembles the span tree, rolls up
//! metrics into the [`MetricAggregator`] and pushes records into bounded
//! buffers, which a [`Harvester`] drains on an interval.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod attributes;
pub mod config;
pub mod error;
pub mod harvest;
pub mod logger;
pub mod metrics;
pub mod naming;
pub mod records;
pub mod rollup;
pub mod span;
pub mod transaction;
pub mod transformer;
pub mod tree;

pub use aggregator::{MetricAggregator, MetricSnapshot, RecordSink};
pub use config::{AgentConfig, BufferConfig};
pub use error::{ConfigError, SpanError, TransformError};
pub use harvest::{HarvestPayload, HarvestSender, Harvester, TelemetryBuffers};
pub use span::{Span, SpanId, SpanKind};
pub use transaction::{ErrorRecord, ImmutableTransaction, Transaction, TransactionName};
pub use transformer::{TelemetrySinks, TransactionTransformer, TransformOutcome};
