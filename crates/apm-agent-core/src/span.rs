// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A single measured unit of work inside a transaction.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::attributes::{AttributeDestinations, AttributeValue};

/// Position of a span within its transaction, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(usize);

impl SpanId {
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpanKind {
    Method,
    Datastore,
    External,
    Custom,
}

/// Attribute key carrying the statement executed by a datastore span.
pub const SQL_ATTRIBUTE: &str = "sql";

#[derive(Debug, Clone, PartialEq)]
pub struct SpanAttribute {
    pub value: AttributeValue,
    pub destinations: AttributeDestinations,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub(crate) id: SpanId,
    pub(crate) name: String,
    pub(crate) kind: SpanKind,
    pub(crate) start: Duration,
    pub(crate) duration: Option<Duration>,
    pub(crate) parent: Option<SpanId>,
    pub(crate) children: Vec<SpanId>,
    pub(crate) attributes: BTreeMap<String, SpanAttribute>,
}

impl Span {
    /// Creates an unfinished span starting `start` after the transaction began.
    #[must_use]
    pub fn new(id: SpanId, name: impl Into<String>, kind: SpanKind, start: Duration) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            start,
            duration: None,
            parent: None,
            children: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> SpanId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> SpanKind {
        self.kind
    }

    /// Offset from the transaction start.
    #[must_use]
    pub fn start(&self) -> Duration {
        self.start
    }

    /// `None` until the span ends.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Inclusive duration, zero for a span that never ended.
    #[must_use]
    pub fn duration_or_zero(&self) -> Duration {
        self.duration.unwrap_or_default()
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.duration.is_some()
    }

    #[must_use]
    pub fn parent(&self) -> Option<SpanId> {
        self.parent
    }

    /// Children in registration order. May still list a child that was later
    /// re-registered under a different parent.
    #[must_use]
    pub fn children(&self) -> &[SpanId] {
        &self.children
    }

    #[must_use]
    pub fn attributes(&self) -> &BTreeMap<String, SpanAttribute> {
        &self.attributes
    }

    /// Attributes tagged for transaction traces.
    #[must_use]
    pub fn trace_parameters(&self) -> BTreeMap<String, AttributeValue> {
        self.attributes
            .iter()
            .filter(|(_, attribute)| {
                attribute
                    .destinations
                    .contains(AttributeDestinations::TRANSACTION_TRACE)
            })
            .map(|(key, attribute)| (key.clone(), attribute.value.clone()))
            .collect()
    }

    /// The statement of a datastore span, whatever destinations it was tagged for.
    #[must_use]
    pub fn sql_statement(&self) -> Option<&str> {
        self.attributes
            .get(SQL_ATTRIBUTE)
            .and_then(|attribute| attribute.value.as_str())
    }

    pub(crate) fn set_attribute(
        &mut self,
        key: String,
        value: AttributeValue,
        destinations: AttributeDestinations,
    ) {
        self.attributes
            .insert(key, SpanAttribute { value, destinations });
    }

    /// Records the end of the span. Has no effect once a duration is set.
    pub(crate) fn end_at(&mut self, end: Duration) -> bool {
        if self.duration.is_some() {
            return false;
        }
        self.duration = Some(end.saturating_sub(self.start));
        true
    }

    /// Builder-style helper for assembling spans directly, mostly from tests and
    /// replay tooling.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    #[must_use]
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
        destinations: AttributeDestinations,
    ) -> Self {
        self.set_attribute(key.into(), value.into(), destinations);
        self
    }

    /// Links `child` under `self` the way a completion notification would.
    pub fn adopt(&mut self, child: &mut Span) {
        child.parent = Some(self.id);
        self.children.push(child.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_sets_duration_once() {
        let mut span = Span::new(SpanId::new(0), "work", SpanKind::Method, Duration::from_secs(2));
        assert!(span.duration().is_none());
        assert_eq!(span.duration_or_zero(), Duration::ZERO);

        assert!(span.end_at(Duration::from_secs(5)));
        assert_eq!(span.duration(), Some(Duration::from_secs(3)));

        assert!(!span.end_at(Duration::from_secs(9)));
        assert_eq!(span.duration(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_end_before_start_is_zero() {
        let mut span = Span::new(SpanId::new(0), "work", SpanKind::Method, Duration::from_secs(2));
        span.end_at(Duration::from_secs(1));
        assert_eq!(span.duration(), Some(Duration::ZERO));
    }

    #[test]
    fn test_sql_statement() {
        let span = Span::new(SpanId::new(3), "Datastore/select", SpanKind::Datastore, Duration::ZERO)
            .with_attribute(SQL_ATTRIBUTE, "SELECT * FROM users", AttributeDestinations::empty());
        assert_eq!(span.sql_statement(), Some("SELECT * FROM users"));
        assert!(span.trace_parameters().is_empty());
    }

    #[test]
    fn test_trace_parameters_follow_destinations() {
        let span = Span::new(SpanId::new(0), "External/api", SpanKind::External, Duration::ZERO)
            .with_attribute("http.url", "https://api/orders", AttributeDestinations::all())
            .with_attribute("secret", "hunter2", AttributeDestinations::ERROR_TRACE);
        let parameters = span.trace_parameters();
        assert_eq!(parameters.len(), 1);
        assert_eq!(parameters["http.url"], AttributeValue::from("https://api/orders"));
    }
}
