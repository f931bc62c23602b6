//! Transfer progress and the sans-IO response reader.

use bytes::{Bytes, BytesMut};
use http::StatusCode;

use crate::store::Redirect;

use super::body::{BodyDecoder, BodyPlan};
use super::codec::{ProtocolError, ResponseHead, find_head_end, looks_like_http};
use super::error::FetchError;

/// Progress published to every handle attached to a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchState {
    Queued,
    Resolving,
    Connecting,
    RequestSent,
    AwaitingHead,
    Transferring {
        received: u64,
        expected: Option<u64>,
    },
    Finished(Result<FetchOutcome, FetchError>),
}

impl FetchState {
    pub fn is_finished(&self) -> bool {
        matches!(self, FetchState::Finished(_))
    }
}

/// How a fetch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub key: String,
    /// `None` when served from cache without a request.
    pub status: Option<StatusCode>,
    /// Logical length of the entry afterwards.
    pub length: u64,
    pub from_cache: bool,
    pub not_modified: bool,
    pub redirect: Option<Redirect>,
    /// Realm of a 401 challenge; the caller decides whether to ask for
    /// credentials and retry.
    pub auth_challenge: Option<String>,
}

#[derive(Debug)]
pub enum ReaderEvent {
    Head(ResponseHead),
    Payload(Bytes),
    Complete,
}

#[derive(Debug)]
enum Phase {
    Head,
    /// Head delivered, waiting for the caller to choose body framing.
    AwaitingPlan,
    Body(BodyDecoder),
    Finishing,
    Done,
}

/// Turns raw socket bytes into head, payload and completion events.
#[derive(Debug)]
pub struct ResponseReader {
    buf: BytesMut,
    phase: Phase,
    max_head: usize,
    eof: bool,
    received: u64,
}

impl ResponseReader {
    pub fn new(max_head: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            phase: Phase::Head,
            max_head,
            eof: false,
            received: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.received += data.len() as u64;
        self.buf.extend_from_slice(data);
    }

    pub fn on_eof(&mut self) {
        self.eof = true;
    }

    /// Wire bytes received so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Bytes received past the end of the response.
    pub fn leftover(&self) -> usize {
        self.buf.len()
    }

    /// Goes back to reading a head after an interim 1xx response.
    pub fn expect_next_head(&mut self) {
        self.phase = Phase::Head;
    }

    pub fn start_body(&mut self, plan: BodyPlan) {
        let decoder = BodyDecoder::new(plan);
        self.phase = if decoder.is_done() {
            Phase::Finishing
        } else {
            Phase::Body(decoder)
        };
    }

    /// Returns the next event, or `None` when more input is needed.
    pub fn poll(&mut self) -> Result<Option<ReaderEvent>, FetchError> {
        if matches!(self.phase, Phase::Head) {
            return self.poll_head();
        }
        match &mut self.phase {
            Phase::Head | Phase::AwaitingPlan | Phase::Done => Ok(None),
            Phase::Finishing => {
                self.phase = Phase::Done;
                Ok(Some(ReaderEvent::Complete))
            }
            Phase::Body(decoder) => {
                let mut payload = BytesMut::new();
                let mut completed = decoder.decode(&mut self.buf, &mut payload)?;
                if !completed && self.eof && payload.is_empty() {
                    completed = decoder.on_eof()?;
                }
                if completed {
                    self.phase = Phase::Finishing;
                }
                if !payload.is_empty() {
                    return Ok(Some(ReaderEvent::Payload(payload.freeze())));
                }
                if completed {
                    self.phase = Phase::Done;
                    return Ok(Some(ReaderEvent::Complete));
                }
                Ok(None)
            }
        }
    }

    fn poll_head(&mut self) -> Result<Option<ReaderEvent>, FetchError> {
        if self.buf.is_empty() {
            if self.eof {
                let err = FetchError::transport("connection closed before any response");
                return Err(if self.received > 0 {
                    err.after_response()
                } else {
                    err
                });
            }
            return Ok(None);
        }
        match looks_like_http(&self.buf) {
            Some(false) => return Ok(Some(self.headless())),
            None if self.eof => return Ok(Some(self.headless())),
            None => return Ok(None),
            Some(true) => {}
        }
        match find_head_end(&self.buf)? {
            Some(end) => {
                let raw = self.buf.split_to(end).freeze();
                let head = ResponseHead::parse(raw)?;
                self.phase = Phase::AwaitingPlan;
                Ok(Some(ReaderEvent::Head(head)))
            }
            None if self.buf.len() > self.max_head => Err(ProtocolError::new(format!(
                "response head exceeds {} bytes",
                self.max_head
            ))
            .into()),
            None if self.eof => {
                Err(ProtocolError::new("connection closed in the middle of the response head").into())
            }
            None => Ok(None),
        }
    }

    /// An HTTP/0.9 reply: everything received is body, until close.
    fn headless(&mut self) -> ReaderEvent {
        self.phase = Phase::Body(BodyDecoder::new(BodyPlan::UntilClose));
        ReaderEvent::Head(ResponseHead::http09())
    }
}
