// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic draining of the metric aggregator and record buffers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use apm_collections::{BufferError, PartitionedBuffer};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::aggregator::{MetricAggregator, MetricSnapshot};
use crate::config::BufferConfig;
use crate::records::{ErrorEvent, ErrorTrace, SqlTrace, TransactionEvent, TransactionTrace};
use crate::transformer::TelemetrySinks;

/// Bounded staging areas for every record kind.
#[derive(Debug, Clone)]
pub struct TelemetryBuffers {
    pub traces: Arc<PartitionedBuffer<TransactionTrace>>,
    pub events: Arc<PartitionedBuffer<TransactionEvent>>,
    pub error_traces: Arc<PartitionedBuffer<ErrorTrace>>,
    pub error_events: Arc<PartitionedBuffer<ErrorEvent>>,
    pub sql_traces: Arc<PartitionedBuffer<SqlTrace>>,
}

impl TelemetryBuffers {
    pub fn from_config(config: &BufferConfig) -> Result<Self, BufferError> {
        Ok(Self {
            traces: Arc::new(PartitionedBuffer::new(
                config.transaction_trace_capacity,
                config.partitions,
            )?),
            events: Arc::new(PartitionedBuffer::new(
                config.transaction_event_capacity,
                config.partitions,
            )?),
            error_traces: Arc::new(PartitionedBuffer::new(
                config.error_trace_capacity,
                config.partitions,
            )?),
            error_events: Arc::new(PartitionedBuffer::new(
                config.error_event_capacity,
                config.partitions,
            )?),
            sql_traces: Arc::new(PartitionedBuffer::new(
                config.sql_trace_capacity,
                config.partitions,
            )?),
        })
    }

    /// Sinks feeding these buffers and `aggregator`.
    #[must_use]
    pub fn sinks(&self, aggregator: Arc<MetricAggregator>) -> TelemetrySinks {
        TelemetrySinks {
            metrics: aggregator,
            traces: self.traces.clone(),
            events: self.events.clone(),
            error_traces: self.error_traces.clone(),
            error_events: self.error_events.clone(),
            sql_traces: self.sql_traces.clone(),
        }
    }

    fn rejected(&self) -> DroppedCounts {
        DroppedCounts {
            traces: self.traces.rejected_count(),
            events: self.events.rejected_count(),
            error_traces: self.error_traces.rejected_count(),
            error_events: self.error_events.rejected_count(),
            sql_traces: self.sql_traces.rejected_count(),
        }
    }
}

/// Records rejected by a full buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DroppedCounts {
    pub traces: u64,
    pub events: u64,
    pub error_traces: u64,
    pub error_events: u64,
    pub sql_traces: u64,
}

impl DroppedCounts {
    fn since(self, earlier: DroppedCounts) -> Self {
        Self {
            traces: self.traces.saturating_sub(earlier.traces),
            events: self.events.saturating_sub(earlier.events),
            error_traces: self.error_traces.saturating_sub(earlier.error_traces),
            error_events: self.error_events.saturating_sub(earlier.error_events),
            sql_traces: self.sql_traces.saturating_sub(earlier.sql_traces),
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.traces + self.events + self.error_traces + self.error_events + self.sql_traces
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HarvestPayload {
    pub metrics: MetricSnapshot,
    pub traces: Vec<TransactionTrace>,
    pub events: Vec<TransactionEvent>,
    pub error_traces: Vec<ErrorTrace>,
    pub error_events: Vec<ErrorEvent>,
    pub sql_traces: Vec<SqlTrace>,
    /// Drops since the previous harvest.
    pub dropped: DroppedCounts,
}

impl HarvestPayload {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
            && self.traces.is_empty()
            && self.events.is_empty()
            && self.error_traces.is_empty()
            && self.error_events.is_empty()
            && self.sql_traces.is_empty()
            && self.dropped.total() == 0
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.traces.len()
            + self.events.len()
            + self.error_traces.len()
            + self.error_events.len()
            + self.sql_traces.len()
    }
}

#[async_trait]
pub trait HarvestSender: Send + Sync {
    /// Ships a payload. Returns the payload back if it could not be delivered; it is
    /// retried once on the next harvest and dropped if that fails too.
    async fn send(&self, payload: HarvestPayload) -> Option<HarvestPayload>;
}

pub struct Harvester {
    aggregator: Arc<MetricAggregator>,
    buffers: TelemetryBuffers,
    interval: Duration,
    last_dropped: Mutex<DroppedCounts>,
}

impl Harvester {
    #[must_use]
    pub fn new(aggregator: Arc<MetricAggregator>, buffers: TelemetryBuffers, interval: Duration) -> Self {
        Self {
            aggregator,
            buffers,
            interval,
            last_dropped: Mutex::new(DroppedCounts::default()),
        }
    }

    /// Takes everything collected since the previous harvest.
    pub fn harvest_once(&self) -> HarvestPayload {
        let dropped = {
            #[allow(clippy::expect_used)]
            let mut last = self.last_dropped.lock().expect("lock poisoned");
            let current = self.buffers.rejected();
            let dropped = current.since(*last);
            *last = current;
            dropped
        };
        if dropped.total() > 0 {
            debug!("Buffers dropped {} records since last harvest: {dropped:?}", dropped.total());
        }

        HarvestPayload {
            metrics: self.aggregator.harvest(),
            traces: self.buffers.traces.drain(),
            events: self.buffers.events.drain(),
            error_traces: self.buffers.error_traces.drain(),
            error_events: self.buffers.error_events.drain(),
            sql_traces: self.buffers.sql_traces.drain(),
            dropped,
        }
    }

    async fn flush(
        &self,
        sender: &dyn HarvestSender,
        failed: Option<HarvestPayload>,
    ) -> Option<HarvestPayload> {
        if let Some(payload) = failed {
            debug!("Retrying previously failed harvest of {} records", payload.record_count());
            if let Some(still_failed) = sender.send(payload).await {
                error!(
                    "Retry of failed harvest also failed, dropping {} records",
                    still_failed.record_count()
                );
            }
        }

        let payload = self.harvest_once();
        if payload.is_empty() {
            return None;
        }
        debug!("Sending harvest of {} records", payload.record_count());
        let failed = sender.send(payload).await;
        if failed.is_some() {
            error!("Failed to send harvest, keeping it for the next cycle");
        }
        failed
    }

    /// Harvests every interval until `cancel` fires, then harvests one last time.
    pub async fn run(&self, sender: &dyn HarvestSender, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately.
        ticker.tick().await;
        let mut failed = None;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("Harvester cancelled, running final harvest");
                    if let Some(payload) = self.flush(sender, failed.take()).await {
                        error!(
                            "Dropping {} records that could not be sent before shutdown",
                            payload.record_count()
                        );
                    }
                    break;
                }
                _ = ticker.tick() => {
                    failed = self.flush(sender, failed.take()).await;
                }
            }
        }
    }
}
