// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Attributes arriving from instrumentation, already tagged with the set of
//! destinations they are allowed to reach.
//!
//! Inclusion and exclusion policy lives outside this crate. Here we only route
//! pre-tagged attributes into the record being built.

use std::collections::BTreeMap;
use std::fmt;

use bitflags::bitflags;
use serde::Serialize;

bitflags! {
    /// Records an attribute may be copied into.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttributeDestinations: u8 {
        const TRANSACTION_TRACE = 1 << 0;
        const TRANSACTION_EVENT = 1 << 1;
        const ERROR_TRACE = 1 << 2;
        const JAVASCRIPT_AGENT = 1 << 3;
        const ERROR_EVENT = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeClassification {
    Agent,
    User,
    Intrinsic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl AttributeValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u16> for AttributeValue {
    fn from(value: u16) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub key: String,
    pub value: AttributeValue,
    pub classification: AttributeClassification,
    pub destinations: AttributeDestinations,
}

/// Attributes routed to one destination, grouped the way records carry them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeSet {
    pub agent_attributes: BTreeMap<String, AttributeValue>,
    pub user_attributes: BTreeMap<String, AttributeValue>,
    pub intrinsics: BTreeMap<String, AttributeValue>,
}

impl AttributeSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agent_attributes.is_empty()
            && self.user_attributes.is_empty()
            && self.intrinsics.is_empty()
    }
}

/// Ordered collection of tagged attributes for one transaction.
///
/// Later values win when the same key is added twice within a classification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    entries: Vec<Attribute>,
}

impl Attributes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        classification: AttributeClassification,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
        destinations: AttributeDestinations,
    ) {
        self.entries.push(Attribute {
            key: key.into(),
            value: value.into(),
            classification,
            destinations,
        });
    }

    pub fn extend(&mut self, other: &Attributes) {
        self.entries.extend(other.entries.iter().cloned());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.entries.iter()
    }

    /// Partitions the attributes allowed to reach `destination`.
    #[must_use]
    pub fn for_destination(&self, destination: AttributeDestinations) -> AttributeSet {
        let mut set = AttributeSet::default();
        for attribute in self
            .entries
            .iter()
            .filter(|a| a.destinations.intersects(destination))
        {
            let target = match attribute.classification {
                AttributeClassification::Agent => &mut set.agent_attributes,
                AttributeClassification::User => &mut set.user_attributes,
                AttributeClassification::Intrinsic => &mut set.intrinsics,
            };
            target.insert(attribute.key.clone(), attribute.value.clone());
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Attributes {
        let mut attributes = Attributes::new();
        attributes.add(
            AttributeClassification::Agent,
            "response.status",
            "404",
            AttributeDestinations::all(),
        );
        attributes.add(
            AttributeClassification::User,
            "customer",
            "acme",
            AttributeDestinations::TRANSACTION_EVENT | AttributeDestinations::ERROR_EVENT,
        );
        attributes.add(
            AttributeClassification::Intrinsic,
            "cpu_time",
            0.25,
            AttributeDestinations::TRANSACTION_TRACE,
        );
        attributes
    }

    #[test]
    fn test_for_destination_filters_by_tag() {
        let attributes = sample();

        let trace = attributes.for_destination(AttributeDestinations::TRANSACTION_TRACE);
        assert_eq!(trace.agent_attributes.len(), 1);
        assert!(trace.user_attributes.is_empty());
        assert_eq!(trace.intrinsics.get("cpu_time"), Some(&AttributeValue::Float(0.25)));

        let event = attributes.for_destination(AttributeDestinations::TRANSACTION_EVENT);
        assert_eq!(
            event.user_attributes.get("customer"),
            Some(&AttributeValue::from("acme"))
        );
        assert!(event.intrinsics.is_empty());

        let browser = attributes.for_destination(AttributeDestinations::JAVASCRIPT_AGENT);
        assert_eq!(browser.agent_attributes.len(), 1);
        assert!(browser.user_attributes.is_empty());
    }

    #[test]
    fn test_later_value_wins() {
        let mut attributes = Attributes::new();
        attributes.add(
            AttributeClassification::User,
            "tier",
            "free",
            AttributeDestinations::all(),
        );
        attributes.add(
            AttributeClassification::User,
            "tier",
            "paid",
            AttributeDestinations::all(),
        );
        let set = attributes.for_destination(AttributeDestinations::ERROR_TRACE);
        assert_eq!(set.user_attributes.get("tier"), Some(&AttributeValue::from("paid")));
    }

    #[test]
    fn test_attribute_set_serializes_camel_case() {
        let set = sample().for_destination(AttributeDestinations::ERROR_EVENT);
        let json = serde_json::to_value(&set).expect("serialization failed");
        assert_eq!(json["agentAttributes"]["response.status"], "404");
        assert_eq!(json["userAttributes"]["customer"], "acme");
    }
}
