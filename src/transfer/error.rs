use std::fmt;

use thiserror::Error;
use tracing::warn;

use crate::decode::DecodeError;
use crate::store::StoreError;

use super::codec::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorKind {
    /// Connect, read or write failure.
    Transport,
    /// Malformed status line, head or body framing.
    Protocol,
    /// Allocation failure while growing the cache.
    Resource,
    /// Content decoder failure.
    Decode,
    /// Scheme or feature this engine does not speak.
    Unsupported,
    Cancelled,
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::Transport => "transport",
            FetchErrorKind::Protocol => "protocol",
            FetchErrorKind::Resource => "resource",
            FetchErrorKind::Decode => "decode",
            FetchErrorKind::Unsupported => "unsupported",
            FetchErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed fetch, as seen by every handle attached to it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct FetchError {
    kind: FetchErrorKind,
    message: String,
    response_started: bool,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            response_started: false,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Transport, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Protocol, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Resource, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Unsupported, message)
    }

    pub fn cancelled() -> Self {
        Self::new(FetchErrorKind::Cancelled, "transfer was cancelled")
    }

    /// Marks the failure as happening after response bytes were consumed.
    pub fn after_response(mut self) -> Self {
        self.response_started = true;
        self
    }

    pub fn kind(&self) -> FetchErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Only transport failures that happened before any response byte
    /// arrived are safe to retry.
    pub fn is_retryable(&self) -> bool {
        self.kind == FetchErrorKind::Transport && !self.response_started
    }

    /// Classifies an error bubbling up from connection plumbing.
    pub fn classify(err: &anyhow::Error, response_started: bool) -> Self {
        let kind = if let Some(store) = err.downcast_ref::<StoreError>() {
            match store {
                StoreError::OutOfMemory | StoreError::RangeOverflow => FetchErrorKind::Resource,
                StoreError::UnknownEntry(_) | StoreError::WriterBusy(_) => {
                    warn!(error = %store, "unexpected store state during transfer");
                    FetchErrorKind::Resource
                }
            }
        } else if err.downcast_ref::<DecodeError>().is_some() {
            FetchErrorKind::Decode
        } else if err.downcast_ref::<ProtocolError>().is_some() {
            FetchErrorKind::Protocol
        } else if let Some(fetch) = err.downcast_ref::<FetchError>() {
            return fetch.clone();
        } else {
            FetchErrorKind::Transport
        };
        Self {
            kind,
            message: format!("{err:#}"),
            response_started,
        }
    }
}

impl From<StoreError> for FetchError {
    fn from(err: StoreError) -> Self {
        FetchError::classify(&anyhow::Error::new(err), true)
    }
}

impl From<DecodeError> for FetchError {
    fn from(err: DecodeError) -> Self {
        FetchError::new(FetchErrorKind::Decode, err.to_string()).after_response()
    }
}

impl From<ProtocolError> for FetchError {
    fn from(err: ProtocolError) -> Self {
        FetchError::protocol(err.to_string()).after_response()
    }
}
