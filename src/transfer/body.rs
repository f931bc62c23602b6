//! Response body framing: fixed length, chunked and close-delimited.

use bytes::{Buf, BytesMut};

use super::codec::ProtocolError;

const MAX_CHUNK_LINE_LENGTH: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    SizeLine,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Fixed(u64),
    Chunked(ChunkState),
    UntilClose,
    Done,
}

/// Incremental body decoder, fed whatever bytes the socket delivered.
#[derive(Debug)]
pub struct BodyDecoder {
    framing: Framing,
}

impl BodyDecoder {
    pub fn new(plan: BodyPlan) -> Self {
        let framing = match plan {
            BodyPlan::Empty | BodyPlan::Fixed(0) => Framing::Done,
            BodyPlan::Fixed(length) => Framing::Fixed(length),
            BodyPlan::Chunked => Framing::Chunked(ChunkState::SizeLine),
            BodyPlan::UntilClose => Framing::UntilClose,
        };
        Self { framing }
    }

    pub fn is_done(&self) -> bool {
        self.framing == Framing::Done
    }

    /// Bytes still owed by a fixed-length body.
    pub fn remaining(&self) -> Option<u64> {
        match self.framing {
            Framing::Fixed(remaining) => Some(remaining),
            Framing::Done => Some(0),
            _ => None,
        }
    }

    /// Consumes framing from `input` and appends payload to `payload`.
    ///
    /// Returns `true` on the call that completes the body and `false`
    /// otherwise, including every call after completion. Bytes following the
    /// end of the body stay in `input`.
    pub fn decode(
        &mut self,
        input: &mut BytesMut,
        payload: &mut BytesMut,
    ) -> Result<bool, ProtocolError> {
        loop {
            match self.framing {
                Framing::Done => return Ok(false),
                Framing::UntilClose => {
                    payload.extend_from_slice(input);
                    input.clear();
                    return Ok(false);
                }
                Framing::Fixed(remaining) => {
                    let take = clamp_len(remaining, input.len());
                    payload.extend_from_slice(&input.split_to(take));
                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        self.framing = Framing::Done;
                        return Ok(true);
                    }
                    self.framing = Framing::Fixed(remaining);
                    return Ok(false);
                }
                Framing::Chunked(state) => {
                    let Some(next) = step_chunked(state, input, payload)? else {
                        return Ok(false);
                    };
                    self.framing = next;
                    if next == Framing::Done {
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// The peer closed the connection. Only a close-delimited body may end
    /// this way.
    pub fn on_eof(&mut self) -> Result<bool, ProtocolError> {
        match self.framing {
            Framing::Done => Ok(false),
            Framing::UntilClose => {
                self.framing = Framing::Done;
                Ok(true)
            }
            Framing::Fixed(remaining) => Err(ProtocolError::new(format!(
                "connection closed with {remaining} body bytes outstanding"
            ))),
            Framing::Chunked(_) => Err(ProtocolError::new(
                "connection closed in the middle of a chunked body",
            )),
        }
    }
}

/// Advances the chunked sub-state machine by one step. `None` means more
/// input is needed.
fn step_chunked(
    state: ChunkState,
    input: &mut BytesMut,
    payload: &mut BytesMut,
) -> Result<Option<Framing>, ProtocolError> {
    match state {
        ChunkState::SizeLine => {
            let Some(line) = take_line(input, "chunk size")? else {
                return Ok(None);
            };
            let size = parse_chunk_size(&line)?;
            if size == 0 {
                Ok(Some(Framing::Chunked(ChunkState::Trailers)))
            } else {
                Ok(Some(Framing::Chunked(ChunkState::Data(size))))
            }
        }
        ChunkState::Data(remaining) => {
            if input.is_empty() {
                return Ok(None);
            }
            let take = clamp_len(remaining, input.len());
            payload.extend_from_slice(&input.split_to(take));
            let remaining = remaining - take as u64;
            if remaining == 0 {
                Ok(Some(Framing::Chunked(ChunkState::DataEnd)))
            } else {
                Ok(Some(Framing::Chunked(ChunkState::Data(remaining))))
            }
        }
        ChunkState::DataEnd => match input.first() {
            None => Ok(None),
            Some(b'\n') => {
                input.advance(1);
                Ok(Some(Framing::Chunked(ChunkState::SizeLine)))
            }
            Some(b'\r') => match input.get(1) {
                None => Ok(None),
                Some(b'\n') => {
                    input.advance(2);
                    Ok(Some(Framing::Chunked(ChunkState::SizeLine)))
                }
                Some(_) => Err(ProtocolError::new("invalid chunk terminator")),
            },
            Some(_) => Err(ProtocolError::new("invalid chunk terminator")),
        },
        ChunkState::Trailers => {
            let Some(line) = take_line(input, "chunk trailer")? else {
                return Ok(None);
            };
            if line.is_empty() {
                Ok(Some(Framing::Done))
            } else {
                Ok(Some(Framing::Chunked(ChunkState::Trailers)))
            }
        }
    }
}

/// Removes one line from `input`, without its line ending.
fn take_line(input: &mut BytesMut, what: &str) -> Result<Option<Vec<u8>>, ProtocolError> {
    match input.iter().position(|byte| *byte == b'\n') {
        Some(pos) => {
            if pos > MAX_CHUNK_LINE_LENGTH {
                return Err(ProtocolError::new(format!("{what} line too long")));
            }
            let mut line = input.split_to(pos + 1).to_vec();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            Ok(Some(line))
        }
        None if input.len() > MAX_CHUNK_LINE_LENGTH => {
            Err(ProtocolError::new(format!("{what} line too long")))
        }
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ProtocolError> {
    let text = String::from_utf8_lossy(line);
    let size_str = text.split_once(';').map(|(size, _)| size).unwrap_or(&text);
    let size_str = size_str.trim();
    u64::from_str_radix(size_str, 16)
        .map_err(|_| ProtocolError::new(format!("invalid chunk size '{size_str}'")))
}

fn clamp_len(remaining: u64, available: usize) -> usize {
    usize::try_from(remaining).map_or(available, |remaining| remaining.min(available))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIKI: &[u8] = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";

    fn run(plan: BodyPlan, pieces: &[&[u8]]) -> Result<(Vec<u8>, usize), ProtocolError> {
        let mut decoder = BodyDecoder::new(plan);
        let mut input = BytesMut::new();
        let mut payload = BytesMut::new();
        let mut completions = 0;
        for piece in pieces {
            input.extend_from_slice(piece);
            if decoder.decode(&mut input, &mut payload)? {
                completions += 1;
            }
        }
        Ok((payload.to_vec(), completions))
    }

    #[test]
    fn chunked_whole_delivery() -> anyhow::Result<()> {
        let (payload, completions) = run(BodyPlan::Chunked, &[WIKI])?;
        assert_eq!(payload, b"Wikipedia");
        assert_eq!(completions, 1);
        Ok(())
    }

    #[test]
    fn chunked_every_split_point() -> anyhow::Result<()> {
        for split in 0..=WIKI.len() {
            let (head, tail) = WIKI.split_at(split);
            let (payload, completions) = run(BodyPlan::Chunked, &[head, tail])?;
            assert_eq!(payload, b"Wikipedia", "split at {split}");
            assert_eq!(completions, 1, "split at {split}");
        }
        Ok(())
    }

    #[test]
    fn chunked_bytewise_delivery() -> anyhow::Result<()> {
        let pieces: Vec<&[u8]> = WIKI.chunks(1).collect();
        let (payload, completions) = run(BodyPlan::Chunked, &pieces)?;
        assert_eq!(payload, b"Wikipedia");
        assert_eq!(completions, 1);
        Ok(())
    }

    #[test]
    fn chunked_accepts_extensions_trailers_and_bare_lf() -> anyhow::Result<()> {
        let body = b"3;name=v\nabc\n0\nX-Trailer: 1\r\n\r\n";
        let (payload, completions) = run(BodyPlan::Chunked, &[body])?;
        assert_eq!(payload, b"abc");
        assert_eq!(completions, 1);
        Ok(())
    }

    #[test]
    fn chunked_rejects_bad_terminator() {
        let err = run(BodyPlan::Chunked, &[b"3\r\nabcX\r\n0\r\n\r\n"]).unwrap_err();
        assert!(err.to_string().contains("invalid chunk terminator"), "{err}");
    }

    #[test]
    fn chunked_rejects_bad_size() {
        let err = run(BodyPlan::Chunked, &[b"zz\r\n"]).unwrap_err();
        assert!(err.to_string().contains("invalid chunk size"), "{err}");
    }

    #[test]
    fn chunked_leaves_following_bytes() -> anyhow::Result<()> {
        let mut decoder = BodyDecoder::new(BodyPlan::Chunked);
        let mut input = BytesMut::from(&b"1\r\na\r\n0\r\n\r\nHTTP/1.1"[..]);
        let mut payload = BytesMut::new();
        assert!(decoder.decode(&mut input, &mut payload)?);
        assert_eq!(&input[..], b"HTTP/1.1");
        assert!(!decoder.decode(&mut input, &mut payload)?);
        Ok(())
    }

    #[test]
    fn fixed_body_stops_at_length() -> anyhow::Result<()> {
        let mut decoder = BodyDecoder::new(BodyPlan::Fixed(5));
        let mut input = BytesMut::from(&b"hel"[..]);
        let mut payload = BytesMut::new();
        assert!(!decoder.decode(&mut input, &mut payload)?);
        assert_eq!(decoder.remaining(), Some(2));
        input.extend_from_slice(b"lo, extra");
        assert!(decoder.decode(&mut input, &mut payload)?);
        assert_eq!(&payload[..], b"hello");
        assert_eq!(&input[..], b", extra");
        Ok(())
    }

    #[test]
    fn eof_rules() -> anyhow::Result<()> {
        let mut close = BodyDecoder::new(BodyPlan::UntilClose);
        let mut input = BytesMut::from(&b"anything"[..]);
        let mut payload = BytesMut::new();
        assert!(!close.decode(&mut input, &mut payload)?);
        assert!(close.on_eof()?);
        assert!(close.is_done());

        let mut fixed = BodyDecoder::new(BodyPlan::Fixed(10));
        assert!(fixed.on_eof().is_err());
        let mut chunked = BodyDecoder::new(BodyPlan::Chunked);
        assert!(chunked.on_eof().is_err());
        Ok(())
    }

    #[test]
    fn empty_plan_is_done_immediately() {
        assert!(BodyDecoder::new(BodyPlan::Empty).is_done());
        assert!(BodyDecoder::new(BodyPlan::Fixed(0)).is_done());
    }
}
