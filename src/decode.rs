//! Incremental content decoding between wire bytes and the object store.
//!
//! Body slices are pushed into a bounded channel; [`DecodeBridge::drain`]
//! moves the channel into the codec and hands back whatever output it has
//! produced so far. A short push is backpressure: drain, then push the rest.

use std::fmt;
use std::io::{self, Write};

use bytes::{Bytes, BytesMut};
use bzip2::{Decompress, Status};
use flate2::write::GzDecoder;
use thiserror::Error;
use tracing::trace;

/// One platform write-atomicity unit.
pub const CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentEncoding {
    Gzip,
    Bzip2,
}

impl ContentEncoding {
    /// Maps a `Content-Encoding` token to a supported codec.
    pub fn from_header(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("gzip") || value.eq_ignore_ascii_case("x-gzip") {
            Some(ContentEncoding::Gzip)
        } else if value.eq_ignore_ascii_case("bzip2") || value.eq_ignore_ascii_case("x-bzip2") {
            Some(ContentEncoding::Bzip2)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Bzip2 => "bzip2",
        }
    }
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{encoding} decoder failed: {source}")]
    Codec {
        encoding: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("decoder already finished")]
    Closed,
    #[error("decoder was torn down after an earlier failure")]
    Failed,
}

/// Output space reserved ahead of each bzip2 decompression step.
const BZIP2_OUTPUT_STEP: usize = 2 * CHANNEL_CAPACITY;

/// bzip2 over the raw stream API, so the end-of-stream marker is observed
/// directly and a truncated stream fails instead of waiting for more input.
struct Bzip2Stream {
    inner: Decompress,
    output: Vec<u8>,
    ended: bool,
}

impl Bzip2Stream {
    fn new() -> Self {
        Self {
            inner: Decompress::new(false),
            output: Vec::new(),
            ended: false,
        }
    }

    /// Returns how much of `input` belonged to the stream; 0 once it ended.
    fn write(&mut self, input: &[u8]) -> io::Result<usize> {
        let mut consumed = 0;
        while !self.ended {
            if self.output.capacity() - self.output.len() < BZIP2_OUTPUT_STEP {
                self.output.reserve(BZIP2_OUTPUT_STEP);
            }
            let space = self.output.capacity() - self.output.len();
            let (in_before, out_before) = (self.inner.total_in(), self.inner.total_out());
            let status = self
                .inner
                .decompress_vec(&input[consumed..], &mut self.output)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            let read = (self.inner.total_in() - in_before) as usize;
            let wrote = (self.inner.total_out() - out_before) as usize;
            consumed += read;

            if matches!(status, Status::StreamEnd) {
                self.ended = true;
            } else if read == 0 && wrote == 0 {
                if consumed < input.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "bzip2 decoder stopped making progress",
                    ));
                }
                break;
            } else if consumed == input.len() && wrote < space {
                break;
            }
        }
        Ok(consumed)
    }

    fn finish(&self) -> io::Result<()> {
        if self.ended {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "bzip2 stream ended before its end-of-stream marker",
            ))
        }
    }
}

enum Codec {
    Identity(BytesMut),
    Gzip(GzDecoder<Vec<u8>>),
    Bzip2(Bzip2Stream),
}

impl Codec {
    fn name(&self) -> &'static str {
        match self {
            Codec::Identity(_) => "identity",
            Codec::Gzip(_) => "gzip",
            Codec::Bzip2(_) => "bzip2",
        }
    }

    /// Feeds input, discarding anything after the end of the compressed
    /// stream.
    fn feed(&mut self, mut input: &[u8]) -> io::Result<()> {
        while !input.is_empty() {
            let written = match self {
                Codec::Identity(out) => {
                    out.extend_from_slice(input);
                    input.len()
                }
                Codec::Gzip(decoder) => decoder.write(input)?,
                Codec::Bzip2(stream) => stream.write(input)?,
            };
            if written == 0 {
                trace!(
                    codec = self.name(),
                    discarded = input.len(),
                    "ignoring bytes after end of compressed stream"
                );
                break;
            }
            input = &input[written..];
        }
        Ok(())
    }

    fn take_output(&mut self) -> Bytes {
        match self {
            Codec::Identity(out) => out.split().freeze(),
            Codec::Gzip(decoder) => Bytes::from(std::mem::take(decoder.get_mut())),
            Codec::Bzip2(stream) => Bytes::from(std::mem::take(&mut stream.output)),
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        match self {
            Codec::Identity(_) => Ok(()),
            Codec::Gzip(decoder) => decoder.try_finish(),
            Codec::Bzip2(stream) => stream.finish(),
        }
    }
}

enum BridgeState {
    Open,
    Finished,
    Failed,
}

pub struct DecodeBridge {
    codec: Codec,
    channel: BytesMut,
    state: BridgeState,
    accepted: u64,
    produced: u64,
}

impl DecodeBridge {
    /// `None` builds an identity bridge that passes bytes through unchanged.
    pub fn new(encoding: Option<ContentEncoding>) -> Self {
        let codec = match encoding {
            None => Codec::Identity(BytesMut::new()),
            Some(ContentEncoding::Gzip) => Codec::Gzip(GzDecoder::new(Vec::new())),
            Some(ContentEncoding::Bzip2) => Codec::Bzip2(Bzip2Stream::new()),
        };
        Self {
            codec,
            channel: BytesMut::with_capacity(CHANNEL_CAPACITY),
            state: BridgeState::Open,
            accepted: 0,
            produced: 0,
        }
    }

    /// Total decoded bytes handed out so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Accepts as much of `input` as the channel has room for.
    pub fn push(&mut self, input: &[u8]) -> Result<usize, DecodeError> {
        self.ensure_open()?;
        let room = CHANNEL_CAPACITY - self.channel.len();
        let accepted = room.min(input.len());
        self.channel.extend_from_slice(&input[..accepted]);
        self.accepted += accepted as u64;
        Ok(accepted)
    }

    /// Runs the channel through the codec and returns the output produced.
    pub fn drain(&mut self) -> Result<Bytes, DecodeError> {
        self.ensure_open()?;
        let pending = self.channel.split();
        if let Err(source) = self.codec.feed(&pending) {
            return Err(self.fail(source));
        }
        Ok(self.take())
    }

    /// Signals end of input and flushes everything the codec still holds.
    /// A compressed stream cut short is an error. A bridge that never saw a
    /// byte finishes empty.
    pub fn finish(&mut self) -> Result<Bytes, DecodeError> {
        let mut output = BytesMut::from(&self.drain()?[..]);
        if self.accepted > 0
            && let Err(source) = self.codec.finish()
        {
            return Err(self.fail(source));
        }
        output.extend_from_slice(&self.take());
        self.state = BridgeState::Finished;
        Ok(output.freeze())
    }

    /// Pushes a whole slice, draining whenever the channel fills up.
    pub fn decode_all(&mut self, mut input: &[u8]) -> Result<Bytes, DecodeError> {
        let mut output = BytesMut::new();
        loop {
            let accepted = self.push(input)?;
            input = &input[accepted..];
            output.extend_from_slice(&self.drain()?);
            if input.is_empty() {
                break;
            }
        }
        Ok(output.freeze())
    }

    fn take(&mut self) -> Bytes {
        let output = self.codec.take_output();
        self.produced += output.len() as u64;
        output
    }

    fn ensure_open(&self) -> Result<(), DecodeError> {
        match self.state {
            BridgeState::Open => Ok(()),
            BridgeState::Finished => Err(DecodeError::Closed),
            BridgeState::Failed => Err(DecodeError::Failed),
        }
    }

    fn fail(&mut self, source: io::Error) -> DecodeError {
        let encoding = self.codec.name();
        self.state = BridgeState::Failed;
        self.channel.clear();
        self.codec = Codec::Identity(BytesMut::new());
        DecodeError::Codec { encoding, source }
    }
}
