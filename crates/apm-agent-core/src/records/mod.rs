// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Records produced from a transformed transaction, each bound for its own sink.

pub mod error;
pub mod event;
pub mod sql;
pub mod trace;

pub use error::{DefaultErrorTraceMaker, ErrorTrace, ErrorTraceMaker};
pub use event::{ErrorEvent, TransactionEvent};
pub use sql::{collect_sql_traces, SqlTrace};
pub use trace::{TraceSegment, TransactionTrace};
