// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Live transaction store and the immutable snapshot handed to the transformer.
//!
//! A [`Transaction`] is created when a request enters the application and is shared
//! (usually behind an `Arc`) with every execution context working on it. Spans are
//! only ever appended and metadata is set at most once. When the request finishes,
//! [`Transaction::complete`] freezes everything into an [`ImmutableTransaction`]
//! exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::attributes::{AttributeClassification, AttributeDestinations, AttributeValue, Attributes};
use crate::error::{SpanError, TransformError};
use crate::span::{Span, SpanId, SpanKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionCategory {
    Web,
    Other,
}

/// Name given to a transaction by instrumentation, e.g. `Uri/users/show`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionName {
    pub category: TransactionCategory,
    pub group: String,
    pub name: String,
}

impl TransactionName {
    #[must_use]
    pub fn web(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: TransactionCategory::Web,
            group: group.into(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn other(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: TransactionCategory::Other,
            group: group.into(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn is_web(&self) -> bool {
        self.category == TransactionCategory::Web
    }
}

/// An error noticed while the transaction was running.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub message: String,
    pub error_class: String,
    pub stack_trace: Option<Vec<String>>,
    pub noticed_at: SystemTime,
}

impl ErrorRecord {
    #[must_use]
    pub fn new(error_class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_class: error_class.into(),
            stack_trace: None,
            noticed_at: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn with_stack_trace(mut self, frames: Vec<String>) -> Self {
        self.stack_trace = Some(frames);
        self
    }
}

/// Transaction-level facts collected while the request runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionMetadata {
    pub uri: Option<String>,
    pub status_code: Option<u16>,
    pub queue_time: Option<Duration>,
    pub referrer_cross_process_id: Option<String>,
    pub errors: Vec<ErrorRecord>,
    pub attributes: Attributes,
}

/// Frozen view of a finished transaction. Consumed by the transformer, so it
/// cannot be transformed twice.
#[derive(Debug)]
pub struct ImmutableTransaction {
    pub name: TransactionName,
    pub guid: String,
    pub start_time: SystemTime,
    pub duration: Duration,
    pub spans: Vec<Span>,
    pub metadata: TransactionMetadata,
    pub ignored: bool,
    /// Children that were registered under more than one parent.
    pub duplicate_registrations: u64,
}

impl ImmutableTransaction {
    #[must_use]
    pub fn is_web(&self) -> bool {
        self.name.is_web()
    }
}

#[derive(Debug)]
pub struct Transaction {
    name: TransactionName,
    guid: String,
    start_time: SystemTime,
    spans: Mutex<Vec<Span>>,
    metadata: Mutex<TransactionMetadata>,
    ignored: AtomicBool,
    completed: AtomicBool,
    duplicate_registrations: AtomicU64,
}

fn set_once<T: std::fmt::Debug>(slot: &mut Option<T>, value: T, field: &str) -> bool {
    if slot.is_some() {
        debug!("Ignoring second write to transaction {field}: {value:?}");
        return false;
    }
    *slot = Some(value);
    true
}

impl Transaction {
    #[must_use]
    pub fn new(name: TransactionName) -> Self {
        Self::with_guid(name, format!("{:016x}", rand::random::<u64>()))
    }

    #[must_use]
    pub fn with_guid(name: TransactionName, guid: impl Into<String>) -> Self {
        Self {
            name,
            guid: guid.into(),
            start_time: SystemTime::now(),
            spans: Mutex::new(Vec::new()),
            metadata: Mutex::new(TransactionMetadata::default()),
            ignored: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            duplicate_registrations: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &TransactionName {
        &self.name
    }

    #[must_use]
    pub fn guid(&self) -> &str {
        &self.guid
    }

    #[must_use]
    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    #[must_use]
    pub fn span_count(&self) -> usize {
        self.lock_spans().len()
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    fn lock_spans(&self) -> std::sync::MutexGuard<'_, Vec<Span>> {
        #[allow(clippy::expect_used)]
        self.spans.lock().expect("lock poisoned")
    }

    fn lock_metadata(&self) -> std::sync::MutexGuard<'_, TransactionMetadata> {
        #[allow(clippy::expect_used)]
        self.metadata.lock().expect("lock poisoned")
    }

    /// Starts a new span `start_offset` after the transaction began.
    pub fn create_span(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        start_offset: Duration,
    ) -> Result<SpanId, SpanError> {
        let mut spans = self.lock_spans();
        if self.is_completed() {
            return Err(SpanError::TransactionCompleted);
        }
        let id = SpanId::new(spans.len());
        spans.push(Span::new(id, name, kind, start_offset));
        Ok(id)
    }

    pub fn end_span(&self, span: SpanId, end_offset: Duration) -> Result<(), SpanError> {
        let mut spans = self.lock_spans();
        if self.is_completed() {
            return Err(SpanError::TransactionCompleted);
        }
        let target = spans.get_mut(span.index()).ok_or(SpanError::NotFound(span))?;
        if target.end_at(end_offset) {
            Ok(())
        } else {
            Err(SpanError::AlreadyEnded(span))
        }
    }

    /// Attaches a finished `child` to `parent`.
    ///
    /// This is the only way a parent/child edge is created. Re-registering a child
    /// under a different parent is tolerated: the latest registration wins and the
    /// event is counted as an inconsistency.
    pub fn register_child_finished(&self, parent: SpanId, child: SpanId) -> Result<(), SpanError> {
        let mut spans = self.lock_spans();
        if self.is_completed() {
            return Err(SpanError::TransactionCompleted);
        }
        if spans.get(parent.index()).is_none() {
            return Err(SpanError::NotFound(parent));
        }
        let previous_parent = match spans.get(child.index()) {
            None => return Err(SpanError::NotFound(child)),
            Some(span) if !span.is_ended() => return Err(SpanError::NotEnded(child)),
            Some(span) => span.parent,
        };

        // Walk up from the new parent; meeting the child means the edge closes a loop.
        let mut cursor = Some(parent);
        while let Some(current) = cursor {
            if current == child {
                return Err(SpanError::Cycle { parent, child });
            }
            cursor = spans[current.index()].parent;
        }

        match previous_parent {
            Some(existing) if existing == parent => return Ok(()),
            Some(existing) => {
                self.duplicate_registrations.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Span {child} re-registered under span {parent}, previously under span {existing}"
                );
            }
            None => {}
        }

        spans[child.index()].parent = Some(parent);
        spans[parent.index()].children.push(child);
        Ok(())
    }

    pub fn add_span_attribute(
        &self,
        span: SpanId,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
        destinations: AttributeDestinations,
    ) -> Result<(), SpanError> {
        let mut spans = self.lock_spans();
        if self.is_completed() {
            return Err(SpanError::TransactionCompleted);
        }
        let target = spans.get_mut(span.index()).ok_or(SpanError::NotFound(span))?;
        target.set_attribute(key.into(), value.into(), destinations);
        Ok(())
    }

    /// Applies `write` to the metadata unless the transaction has completed.
    fn update_metadata(
        &self,
        field: &str,
        write: impl FnOnce(&mut TransactionMetadata) -> bool,
    ) -> bool {
        let mut metadata = self.lock_metadata();
        // Checked under the metadata lock; `complete` takes this lock after flipping the flag.
        if self.is_completed() {
            debug!("Rejecting write to transaction {field} after completion");
            return false;
        }
        write(&mut metadata)
    }

    /// Returns `false` when the uri was already set or the transaction has completed.
    pub fn set_uri(&self, uri: impl Into<String>) -> bool {
        self.update_metadata("uri", |metadata| set_once(&mut metadata.uri, uri.into(), "uri"))
    }

    pub fn set_status_code(&self, status_code: u16) -> bool {
        self.update_metadata("status code", |metadata| {
            set_once(&mut metadata.status_code, status_code, "status code")
        })
    }

    pub fn set_queue_time(&self, queue_time: Duration) -> bool {
        self.update_metadata("queue time", |metadata| {
            set_once(&mut metadata.queue_time, queue_time, "queue time")
        })
    }

    pub fn set_referrer_cross_process_id(&self, id: impl Into<String>) -> bool {
        self.update_metadata("referrer cross process id", |metadata| {
            set_once(
                &mut metadata.referrer_cross_process_id,
                id.into(),
                "referrer cross process id",
            )
        })
    }

    pub fn notice_error(&self, error: ErrorRecord) -> bool {
        self.update_metadata("errors", |metadata| {
            metadata.errors.push(error);
            true
        })
    }

    pub fn add_attribute(
        &self,
        classification: AttributeClassification,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
        destinations: AttributeDestinations,
    ) -> bool {
        self.update_metadata("attributes", |metadata| {
            metadata
                .attributes
                .add(classification, key, value, destinations);
            true
        })
    }

    /// Marks the transaction so that transforming it produces no telemetry.
    pub fn ignore(&self) {
        self.ignored.store(true, Ordering::Release);
    }

    /// Freezes the transaction. Only the first call succeeds.
    pub fn complete(&self, duration: Duration) -> Result<ImmutableTransaction, TransformError> {
        let mut spans = self.lock_spans();
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransformError::AlreadyCompleted);
        }
        let spans = std::mem::take(&mut *spans);
        let metadata = std::mem::take(&mut *self.lock_metadata());

        Ok(ImmutableTransaction {
            name: self.name.clone(),
            guid: self.guid.clone(),
            start_time: self.start_time,
            duration,
            spans,
            metadata,
            ignored: self.ignored.load(Ordering::Acquire),
            duplicate_registrations: self.duplicate_registrations.load(Ordering::Relaxed),
        })
    }
}
