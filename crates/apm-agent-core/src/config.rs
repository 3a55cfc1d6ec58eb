// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

use hashbrown::HashMap;

use crate::error::ConfigError;

const DEFAULT_RUNTIME_PREFIX: &str = "Rust";
const DEFAULT_APDEX_T: Duration = Duration::from_millis(500);
const DEFAULT_HARVEST_INTERVAL: Duration = Duration::from_secs(60);
/// Frames kept on an error trace's stack unless configured otherwise.
pub const DEFAULT_STACK_TRACE_MAX_FRAMES: usize = 80;
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Capacity of each harvest buffer and how many partitions they are split into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    pub transaction_trace_capacity: usize,
    pub transaction_event_capacity: usize,
    pub error_trace_capacity: usize,
    pub error_event_capacity: usize,
    pub sql_trace_capacity: usize,
    pub partitions: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            transaction_trace_capacity: 100,
            transaction_event_capacity: 10_000,
            error_trace_capacity: 20,
            error_event_capacity: 100,
            sql_trace_capacity: 100,
            partitions: 4,
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Prefix of per-span metric names, e.g. `Rust/<span name>`
    pub runtime_prefix: String,
    /// Apdex target for web transactions
    pub apdex_t: Duration,
    /// Apdex targets keyed by prefixed transaction metric name
    pub apdex_t_overrides: HashMap<String, Duration>,
    /// Prefixed transaction metric names that are never reported
    pub ignored_transaction_names: Vec<String>,
    pub transaction_tracer_enabled: bool,
    pub transaction_events_enabled: bool,
    pub transaction_events_transactions_enabled: bool,
    pub error_collector_enabled: bool,
    pub error_collector_capture_events: bool,
    pub sql_trace_enabled: bool,
    /// HTTP statuses that do not count as errors
    pub error_ignore_status_codes: Vec<u16>,
    /// Replace noticed error messages with a fixed notice
    pub strip_exception_messages: bool,
    pub stack_trace_max_frames: usize,
    pub buffers: BufferConfig,
    /// how often the harvester drains buffers and metrics
    pub harvest_interval: Duration,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            runtime_prefix: DEFAULT_RUNTIME_PREFIX.to_string(),
            apdex_t: DEFAULT_APDEX_T,
            apdex_t_overrides: HashMap::new(),
            ignored_transaction_names: Vec::new(),
            transaction_tracer_enabled: true,
            transaction_events_enabled: true,
            transaction_events_transactions_enabled: true,
            error_collector_enabled: true,
            error_collector_capture_events: true,
            sql_trace_enabled: true,
            error_ignore_status_codes: vec![404],
            strip_exception_messages: false,
            stack_trace_max_frames: DEFAULT_STACK_TRACE_MAX_FRAMES,
            buffers: BufferConfig::default(),
            harvest_interval: DEFAULT_HARVEST_INTERVAL,
            log_level: "info".to_string(),
        }
    }
}

fn parse_var<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| ConfigError::Parse {
                name,
                reason: err.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let Ok(raw) = env::var(name) else {
        return Ok(default);
    };
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ConfigError::Parse {
            name,
            reason: format!("expected a boolean, got '{other}'"),
        }),
    }
}

fn seconds(name: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|err| ConfigError::Parse {
        name,
        reason: err.to_string(),
    })
}

fn parse_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty())
}

impl AgentConfig {
    /// Create configuration from `APM_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let runtime_prefix =
            env::var("APM_RUNTIME_PREFIX").unwrap_or_else(|_| defaults.runtime_prefix.clone());
        let apdex_t = match parse_var::<f64>("APM_APDEX_T")? {
            Some(secs) => seconds("APM_APDEX_T", secs)?,
            None => defaults.apdex_t,
        };
        let apdex_t_overrides = match env::var("APM_APDEX_T_OVERRIDES") {
            Ok(raw) => serde_json::from_str::<HashMap<String, f64>>(&raw)
                .map_err(|err| ConfigError::Parse {
                    name: "APM_APDEX_T_OVERRIDES",
                    reason: err.to_string(),
                })?
                .into_iter()
                .map(|(name, secs)| seconds("APM_APDEX_T_OVERRIDES", secs).map(|t| (name, t)))
                .collect::<Result<HashMap<_, _>, ConfigError>>()?,
            Err(_) => HashMap::new(),
        };
        let ignored_transaction_names: Vec<String> = env::var("APM_IGNORED_TRANSACTION_NAMES")
            .map(|raw| parse_list(&raw).map(str::to_string).collect())
            .unwrap_or_default();
        let error_ignore_status_codes = match env::var("APM_ERROR_IGNORE_STATUS_CODES") {
            Ok(raw) => parse_list(&raw)
                .map(|code| {
                    code.parse::<u16>().map_err(|err| ConfigError::Parse {
                        name: "APM_ERROR_IGNORE_STATUS_CODES",
                        reason: format!("'{code}': {err}"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => defaults.error_ignore_status_codes.clone(),
        };

        let buffers = BufferConfig {
            transaction_trace_capacity: parse_var("APM_TRANSACTION_TRACE_CAPACITY")?
                .unwrap_or(defaults.buffers.transaction_trace_capacity),
            transaction_event_capacity: parse_var("APM_TRANSACTION_EVENT_CAPACITY")?
                .unwrap_or(defaults.buffers.transaction_event_capacity),
            error_trace_capacity: parse_var("APM_ERROR_TRACE_CAPACITY")?
                .unwrap_or(defaults.buffers.error_trace_capacity),
            error_event_capacity: parse_var("APM_ERROR_EVENT_CAPACITY")?
                .unwrap_or(defaults.buffers.error_event_capacity),
            sql_trace_capacity: parse_var("APM_SQL_TRACE_CAPACITY")?
                .unwrap_or(defaults.buffers.sql_trace_capacity),
            partitions: parse_var("APM_BUFFER_PARTITIONS")?.unwrap_or(defaults.buffers.partitions),
        };
        let harvest_interval = parse_var::<u64>("APM_HARVEST_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.harvest_interval);
        let log_level = env::var("APM_LOG_LEVEL")
            .map(|val| val.trim().to_lowercase())
            .unwrap_or_else(|_| defaults.log_level.clone());

        let config = Self {
            runtime_prefix,
            apdex_t,
            apdex_t_overrides,
            ignored_transaction_names,
            transaction_tracer_enabled: parse_bool(
                "APM_TRANSACTION_TRACER_ENABLED",
                defaults.transaction_tracer_enabled,
            )?,
            transaction_events_enabled: parse_bool(
                "APM_TRANSACTION_EVENTS_ENABLED",
                defaults.transaction_events_enabled,
            )?,
            transaction_events_transactions_enabled: parse_bool(
                "APM_TRANSACTION_EVENTS_TRANSACTIONS_ENABLED",
                defaults.transaction_events_transactions_enabled,
            )?,
            error_collector_enabled: parse_bool(
                "APM_ERROR_COLLECTOR_ENABLED",
                defaults.error_collector_enabled,
            )?,
            error_collector_capture_events: parse_bool(
                "APM_ERROR_COLLECTOR_CAPTURE_EVENTS",
                defaults.error_collector_capture_events,
            )?,
            sql_trace_enabled: parse_bool("APM_SQL_TRACE_ENABLED", defaults.sql_trace_enabled)?,
            error_ignore_status_codes,
            strip_exception_messages: parse_bool(
                "APM_STRIP_EXCEPTION_MESSAGES",
                defaults.strip_exception_messages,
            )?,
            stack_trace_max_frames: parse_var("APM_STACK_TRACE_MAX_FRAMES")?
                .unwrap_or(defaults.stack_trace_max_frames),
            buffers,
            harvest_interval,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "runtime prefix cannot be empty".to_string(),
            ));
        }

        if self.apdex_t.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "apdex_t must be greater than 0".to_string(),
            ));
        }
        if let Some((name, _)) = self.apdex_t_overrides.iter().find(|(_, t)| t.is_zero()) {
            return Err(ConfigError::InvalidConfig(format!(
                "apdex_t override for '{name}' must be greater than 0"
            )));
        }

        if self.buffers.partitions == 0 {
            return Err(ConfigError::InvalidConfig(
                "buffer partition count must be greater than 0".to_string(),
            ));
        }

        if self.harvest_interval.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "harvest interval must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}
