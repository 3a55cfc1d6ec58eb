// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resolution of the metric name a transaction reports under, and of the Apdex
//! target that applies to it.

use std::time::Duration;

use hashbrown::{HashMap, HashSet};

use crate::config::AgentConfig;
use crate::transaction::{TransactionCategory, TransactionName};

pub const WEB_TRANSACTION_PREFIX: &str = "WebTransaction";
pub const OTHER_TRANSACTION_PREFIX: &str = "OtherTransaction";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionMetricName {
    pub prefix: &'static str,
    pub unprefixed: String,
    /// Set when a naming rule decided this transaction must not be reported.
    pub ignored: bool,
}

impl TransactionMetricName {
    #[must_use]
    pub fn new(prefix: &'static str, unprefixed: impl Into<String>) -> Self {
        Self {
            prefix,
            unprefixed: unprefixed.into(),
            ignored: false,
        }
    }

    /// `WebTransaction/Uri/users/show`
    #[must_use]
    pub fn prefixed_name(&self) -> String {
        format!("{}/{}", self.prefix, self.unprefixed)
    }

    #[must_use]
    pub fn is_web(&self) -> bool {
        self.prefix == WEB_TRANSACTION_PREFIX
    }
}

/// Collaborator owning transaction naming rules.
pub trait MetricNameService: Send + Sync {
    fn transaction_metric_name(&self, name: &TransactionName) -> TransactionMetricName;

    /// `None` when no Apdex target applies to the transaction.
    fn apdex_target(&self, name: &TransactionMetricName) -> Option<Duration>;
}

/// Naming rules driven by [`AgentConfig`]: a global Apdex target for web
/// transactions, per-name target overrides, and a list of names to ignore.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredNameService {
    apdex_t: Option<Duration>,
    apdex_t_overrides: HashMap<String, Duration>,
    ignored_names: HashSet<String>,
}

impl ConfiguredNameService {
    #[must_use]
    pub fn new(apdex_t: Option<Duration>) -> Self {
        Self {
            apdex_t,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            apdex_t: Some(config.apdex_t),
            apdex_t_overrides: config.apdex_t_overrides.clone(),
            ignored_names: config.ignored_transaction_names.iter().cloned().collect(),
        }
    }

    #[must_use]
    pub fn with_override(mut self, prefixed_name: impl Into<String>, target: Duration) -> Self {
        self.apdex_t_overrides.insert(prefixed_name.into(), target);
        self
    }

    #[must_use]
    pub fn with_ignored(mut self, prefixed_name: impl Into<String>) -> Self {
        self.ignored_names.insert(prefixed_name.into());
        self
    }
}

impl MetricNameService for ConfiguredNameService {
    fn transaction_metric_name(&self, name: &TransactionName) -> TransactionMetricName {
        let prefix = match name.category {
            TransactionCategory::Web => WEB_TRANSACTION_PREFIX,
            TransactionCategory::Other => OTHER_TRANSACTION_PREFIX,
        };
        let mut metric_name = TransactionMetricName::new(prefix, format!("{}/{}", name.group, name.name));
        metric_name.ignored = self.ignored_names.contains(&metric_name.prefixed_name());
        metric_name
    }

    fn apdex_target(&self, name: &TransactionMetricName) -> Option<Duration> {
        if !name.is_web() {
            return None;
        }
        self.apdex_t_overrides
            .get(&name.prefixed_name())
            .copied()
            .or(self.apdex_t)
    }
}
