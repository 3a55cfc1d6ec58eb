// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::span::SpanId;

/// Errors returned by the span ingestion surface of a live transaction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpanError {
    #[error("span {0} does not belong to this transaction")]
    NotFound(SpanId),

    #[error("span {0} has already ended")]
    AlreadyEnded(SpanId),

    #[error("span {0} must end before it can be registered as a child")]
    NotEnded(SpanId),

    #[error("registering span {child} under span {parent} would create a cycle")]
    Cycle { parent: SpanId, child: SpanId },

    #[error("transaction has already completed")]
    TransactionCompleted,
}

/// Contract violations detected while completing or transforming a transaction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    #[error("transaction has no spans to transform")]
    EmptyTransaction,

    #[error("transaction has already been completed")]
    AlreadyCompleted,
}

/// Errors raised while loading or validating agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse {name}: {reason}")]
    Parse { name: &'static str, reason: String },

    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}
