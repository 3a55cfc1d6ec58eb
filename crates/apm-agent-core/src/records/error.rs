// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::SystemTime;

use hashbrown::HashSet;
use http::StatusCode;
use serde::Serialize;

use crate::attributes::{AttributeDestinations, AttributeSet};
use crate::config::{AgentConfig, DEFAULT_STACK_TRACE_MAX_FRAMES};
use crate::naming::TransactionMetricName;
use crate::transaction::ImmutableTransaction;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorTrace {
    pub timestamp: SystemTime,
    /// Prefixed transaction metric name the error is reported under.
    pub path: String,
    pub message: String,
    pub error_class: String,
    pub stack_trace: Option<Vec<String>>,
    pub uri: Option<String>,
    pub guid: String,
    pub attributes: AttributeSet,
}

/// Decides whether a finished transaction carries a reportable error.
pub trait ErrorTraceMaker: Send + Sync {
    /// `None` when there is nothing to report.
    fn make(
        &self,
        transaction: &ImmutableTransaction,
        metric_name: &TransactionMetricName,
    ) -> Option<ErrorTrace>;
}

/// Replaces noticed error messages when message stripping is enabled.
pub const STRIPPED_MESSAGE: &str =
    "Message removed by the agent based on your currently enabled security settings.";

/// Reports the first noticed error, falling back to an HTTP error status.
#[derive(Debug, Clone)]
pub struct DefaultErrorTraceMaker {
    ignore_status_codes: HashSet<u16>,
    strip_exception_messages: bool,
    stack_trace_max_frames: usize,
}

impl Default for DefaultErrorTraceMaker {
    fn default() -> Self {
        Self::new([])
    }
}

impl DefaultErrorTraceMaker {
    #[must_use]
    pub fn new(ignore_status_codes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            ignore_status_codes: ignore_status_codes.into_iter().collect(),
            strip_exception_messages: false,
            stack_trace_max_frames: DEFAULT_STACK_TRACE_MAX_FRAMES,
        }
    }

    #[must_use]
    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.error_ignore_status_codes.iter().copied())
            .with_strip_exception_messages(config.strip_exception_messages)
            .with_stack_trace_max_frames(config.stack_trace_max_frames)
    }

    #[must_use]
    pub fn with_strip_exception_messages(mut self, strip: bool) -> Self {
        self.strip_exception_messages = strip;
        self
    }

    /// Frames beyond `max_frames` are cut from the bottom of the stack.
    #[must_use]
    pub fn with_stack_trace_max_frames(mut self, max_frames: usize) -> Self {
        self.stack_trace_max_frames = max_frames;
        self
    }

    fn status_error(&self, status_code: u16) -> Option<(String, String)> {
        if status_code < 400 || self.ignore_status_codes.contains(&status_code) {
            return None;
        }
        let reason = StatusCode::from_u16(status_code)
            .ok()
            .and_then(|status| status.canonical_reason())
            .unwrap_or("Unknown Status Code");
        Some((status_code.to_string(), reason.to_string()))
    }
}

impl ErrorTraceMaker for DefaultErrorTraceMaker {
    fn make(
        &self,
        transaction: &ImmutableTransaction,
        metric_name: &TransactionMetricName,
    ) -> Option<ErrorTrace> {
        let metadata = &transaction.metadata;
        let (timestamp, error_class, message, stack_trace) = match metadata.errors.first() {
            Some(error) => {
                let message = if self.strip_exception_messages {
                    STRIPPED_MESSAGE.to_string()
                } else {
                    error.message.clone()
                };
                let stack_trace = error.stack_trace.as_ref().map(|frames| {
                    frames
                        .iter()
                        .take(self.stack_trace_max_frames)
                        .cloned()
                        .collect()
                });
                (error.noticed_at, error.error_class.clone(), message, stack_trace)
            }
            None => {
                let (class, message) = self.status_error(metadata.status_code?)?;
                let end = transaction
                    .start_time
                    .checked_add(transaction.duration)
                    .unwrap_or(transaction.start_time);
                (end, class, message, None)
            }
        };

        Some(ErrorTrace {
            timestamp,
            path: metric_name.prefixed_name(),
            message,
            error_class,
            stack_trace,
            uri: metadata.uri.clone(),
            guid: transaction.guid.clone(),
            attributes: metadata
                .attributes
                .for_destination(AttributeDestinations::ERROR_TRACE),
        })
    }
}
