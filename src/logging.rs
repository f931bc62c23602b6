use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// One line per finished fetch.
#[derive(Debug, Clone)]
pub struct TransferLogEvent {
    pub key: String,
    pub method: String,
    pub priority: String,
    pub directive: String,
    pub outcome: String,
    pub status: Option<u16>,
    pub from_cache: bool,
    pub resumed_from: Option<u64>,
    pub bytes: u64,
    pub attempts: u32,
    pub elapsed_ms: u128,
    pub upstream_addr: Option<String>,
    pub upstream_reused: Option<bool>,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
}

#[derive(Debug)]
pub struct TransferLogBuilder {
    event: TransferLogEvent,
}

impl TransferLogBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            event: TransferLogEvent {
                key: key.into(),
                method: String::new(),
                priority: String::new(),
                directive: String::new(),
                outcome: String::from("unknown"),
                status: None,
                from_cache: false,
                resumed_from: None,
                bytes: 0,
                attempts: 0,
                elapsed_ms: 0,
                upstream_addr: None,
                upstream_reused: None,
                error_kind: None,
                error_detail: None,
            },
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.event.method = method.into();
        self
    }

    pub fn priority(mut self, priority: impl Into<String>) -> Self {
        self.event.priority = priority.into();
        self
    }

    pub fn directive(mut self, directive: impl Into<String>) -> Self {
        self.event.directive = directive.into();
        self
    }

    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.event.outcome = outcome.into();
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.event.status = Some(status.as_u16());
        self
    }

    pub fn from_cache(mut self, from_cache: bool) -> Self {
        self.event.from_cache = from_cache;
        self
    }

    pub fn resumed_from(mut self, offset: u64) -> Self {
        self.event.resumed_from = Some(offset);
        self
    }

    pub fn bytes(mut self, bytes: u64) -> Self {
        self.event.bytes = bytes;
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.event.attempts = attempts;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn upstream_addr(mut self, addr: impl Into<String>) -> Self {
        self.event.upstream_addr = Some(addr.into());
        self
    }

    pub fn upstream_reused(mut self, reused: bool) -> Self {
        self.event.upstream_reused = Some(reused);
        self
    }

    pub fn error_kind(mut self, kind: impl Into<String>) -> Self {
        self.event.error_kind = Some(kind.into());
        self
    }

    pub fn error_detail(mut self, detail: impl Into<String>) -> Self {
        self.event.error_detail = Some(detail.into());
        self
    }

    pub fn build(self) -> TransferLogEvent {
        self.event
    }

    pub fn log(self) {
        log_transfer(self.build());
    }
}

pub fn log_transfer(event: TransferLogEvent) {
    let TransferLogEvent {
        key,
        method,
        priority,
        directive,
        outcome,
        status,
        from_cache,
        resumed_from,
        bytes,
        attempts,
        elapsed_ms,
        upstream_addr,
        upstream_reused,
        error_kind,
        error_detail,
    } = event;

    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    tracing::info!(
        target = "transfer_log",
        ts,
        key,
        method,
        priority,
        directive,
        outcome,
        status,
        from_cache,
        resumed_from,
        bytes,
        attempts,
        elapsed_ms,
        upstream_addr = upstream_addr.as_deref(),
        upstream_reused,
        error_kind = error_kind.as_deref(),
        error_detail = error_detail.as_deref()
    );

    crate::metrics::record_fetch(
        &outcome,
        status,
        bytes,
        Duration::from_millis(elapsed_ms as u64),
    );
}
