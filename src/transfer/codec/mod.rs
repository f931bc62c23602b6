//! HTTP/1.x response wire parsing.

mod head;
mod headers;

use thiserror::Error;

pub use head::{ResponseHead, find_head_end, looks_like_http};
pub use headers::HeaderLine;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProtocolError {
    message: String,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
