use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};

use super::ProtocolError;
use super::headers::{HeaderLine, header_lines_to_map};

/// Finds the end of a response head in `buf`.
///
/// Accepts `\n\n`, `\n\r\n` and `\r\n\r\n` terminators. A carriage return
/// that is not followed by a line feed, or a NUL byte, makes the head
/// malformed. Returns the length of the head including the terminator.
pub fn find_head_end(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    for (i, byte) in buf.iter().enumerate() {
        match *byte {
            0 => return Err(ProtocolError::new("NUL byte in response head")),
            b'\r' => match buf.get(i + 1) {
                None => return Ok(None),
                Some(b'\n') => {}
                Some(_) => {
                    return Err(ProtocolError::new(
                        "carriage return without line feed in response head",
                    ));
                }
            },
            b'\n' => match buf.get(i + 1) {
                None => return Ok(None),
                Some(b'\n') => return Ok(Some(i + 2)),
                Some(b'\r') => match buf.get(i + 2) {
                    None => return Ok(None),
                    Some(b'\n') => return Ok(Some(i + 3)),
                    Some(_) => {
                        return Err(ProtocolError::new(
                            "carriage return without line feed in response head",
                        ));
                    }
                },
                Some(_) => {}
            },
            _ => {}
        }
    }
    Ok(None)
}

/// `Some(true)` once `buf` starts with `HTTP/`, `Some(false)` as soon as it
/// cannot, `None` while too short to tell.
pub fn looks_like_http(buf: &[u8]) -> Option<bool> {
    const PREFIX: &[u8] = b"HTTP/";
    let seen = buf.len().min(PREFIX.len());
    if !buf[..seen].eq_ignore_ascii_case(&PREFIX[..seen]) {
        return Some(false);
    }
    (seen == PREFIX.len()).then_some(true)
}

fn parse_status_line(value: &str) -> Result<(Version, StatusCode, String), ProtocolError> {
    let mut parts = value.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| ProtocolError::new("status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| ProtocolError::new("status line missing status code"))?;
    let reason = parts.collect::<Vec<_>>().join(" ");

    let version = match version.to_ascii_uppercase().as_str() {
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/0.9" => Version::HTTP_09,
        other if other.starts_with("HTTP/1.") => Version::HTTP_11,
        other => {
            return Err(ProtocolError::new(format!(
                "unsupported HTTP version '{other}'"
            )));
        }
    };

    let status_code: u16 = status
        .parse()
        .map_err(|_| ProtocolError::new(format!("invalid status code '{status}'")))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| ProtocolError::new(format!("unsupported status code '{status_code}'")))?;

    Ok((version, status, reason))
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: Vec<HeaderLine>,
    /// The head exactly as received, terminator included.
    pub raw: Bytes,
}

impl ResponseHead {
    pub fn parse(raw: Bytes) -> Result<Self, ProtocolError> {
        let text = String::from_utf8_lossy(&raw).into_owned();
        let mut lines = text.split('\n').map(|line| line.trim_end_matches('\r'));
        let status_line = lines
            .next()
            .ok_or_else(|| ProtocolError::new("empty response head"))?;
        let (version, status, reason) = parse_status_line(status_line)?;

        let mut headers: Vec<HeaderLine> = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if line.starts_with([' ', '\t']) {
                if let Some(last) = headers.last_mut() {
                    last.fold(line);
                }
                continue;
            }
            match HeaderLine::parse(line) {
                Some(header) => headers.push(header),
                None => tracing::debug!(line, "skipping malformed response header"),
            }
        }

        Ok(Self {
            version,
            status,
            reason,
            headers,
            raw,
        })
    }

    /// Stand-in head for a response that came without one.
    pub fn http09() -> Self {
        Self {
            version: Version::HTTP_09,
            status: StatusCode::OK,
            reason: String::new(),
            headers: Vec::new(),
            raw: Bytes::new(),
        }
    }

    pub fn is_http09(&self) -> bool {
        self.version == Version::HTTP_09
    }

    /// 1xx responses other than 101 are followed by the real head.
    pub fn is_interim(&self) -> bool {
        self.status.is_informational() && self.status != StatusCode::SWITCHING_PROTOCOLS
    }

    pub fn header(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.lower_name() == lower_name)
            .map(|header| header.value.as_str())
    }

    pub fn headers_named<'a>(&'a self, lower_name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |header| header.lower_name() == lower_name)
            .map(|header| header.value.as_str())
    }

    pub fn header_map(&self) -> HeaderMap {
        header_lines_to_map(self.headers.iter())
    }
}
