use http::{Method, StatusCode, Uri, Version};

use crate::decode::ContentEncoding;
use crate::store::Redirect;

use super::body::BodyPlan;
use super::codec::{ProtocolError, ResponseHead};

/// Start and total length advertised by `Content-Range`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub total: Option<u64>,
}

/// What a response head means for the transfer reading it.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: StatusCode,
    pub body: BodyPlan,
    pub keep_alive: bool,
    /// Encoding to strip while storing.
    pub decode: Option<ContentEncoding>,
    /// Encoding left on the stored bytes.
    pub stored_encoding: Option<ContentEncoding>,
    pub redirect: Option<Redirect>,
    /// Realm of a 401 challenge.
    pub challenge: Option<String>,
    pub content_range: Option<ContentRange>,
    pub last_modified: Option<String>,
    pub set_cookies: Vec<String>,
}

impl ResponseInfo {
    /// Total size of the object once this response completes, if known.
    pub fn expected_length(&self) -> Option<u64> {
        if let Some(range) = self.content_range
            && let Some(total) = range.total
        {
            return Some(total);
        }
        match self.body {
            BodyPlan::Fixed(length) if self.decode.is_none() => Some(length),
            BodyPlan::Empty => Some(0),
            _ => None,
        }
    }
}

pub fn interpret(
    head: &ResponseHead,
    method: &Method,
    base: &Uri,
) -> Result<ResponseInfo, ProtocolError> {
    let status = head.status;
    if head.is_http09() {
        return Ok(ResponseInfo {
            status,
            body: BodyPlan::UntilClose,
            keep_alive: false,
            decode: None,
            stored_encoding: None,
            redirect: None,
            challenge: None,
            content_range: None,
            last_modified: None,
            set_cookies: Vec::new(),
        });
    }

    let body = body_plan(head, method)?;
    let keep_alive = keep_alive(head) && body != BodyPlan::UntilClose;

    let (decode, stored_encoding) = match head
        .header("content-encoding")
        .and_then(ContentEncoding::from_header)
    {
        Some(encoding) if is_textual(head.header("content-type")) => (Some(encoding), None),
        Some(encoding) => (None, Some(encoding)),
        None => (None, None),
    };

    let redirect = match status.as_u16() {
        301 | 302 | 303 | 307 | 308 => head
            .header("location")
            .and_then(|location| resolve_location(base, location))
            .map(|location| Redirect {
                location,
                force_get: status == StatusCode::SEE_OTHER,
            }),
        _ => None,
    };

    let challenge = (status == StatusCode::UNAUTHORIZED).then(|| {
        head.headers_named("www-authenticate")
            .find_map(parse_realm)
            .unwrap_or_default()
    });

    let content_range = if status == StatusCode::PARTIAL_CONTENT {
        head.header("content-range").and_then(parse_content_range)
    } else {
        None
    };

    Ok(ResponseInfo {
        status,
        body,
        keep_alive,
        decode,
        stored_encoding,
        redirect,
        challenge,
        content_range,
        last_modified: head
            .header("last-modified")
            .map(|value| value.trim().to_string()),
        set_cookies: head
            .headers_named("set-cookie")
            .map(str::to_string)
            .collect(),
    })
}

/// `Transfer-Encoding: chunked` wins over `Content-Length`, which wins over
/// reading until close.
fn body_plan(head: &ResponseHead, method: &Method) -> Result<BodyPlan, ProtocolError> {
    let status = head.status;
    if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyPlan::Empty);
    }
    let chunked = head
        .headers_named("transfer-encoding")
        .any(|value| value.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return Ok(BodyPlan::Chunked);
    }
    let mut length = None;
    for value in head.headers_named("content-length") {
        let parsed: u64 = value
            .trim()
            .parse()
            .map_err(|_| ProtocolError::new(format!("invalid Content-Length value '{value}'")))?;
        match length {
            Some(previous) if previous != parsed => {
                return Err(ProtocolError::new(
                    "conflicting Content-Length headers in response",
                ));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length.map_or(BodyPlan::UntilClose, BodyPlan::Fixed))
}

/// HTTP/1.1 is persistent unless told otherwise; HTTP/1.0 only on request.
fn keep_alive(head: &ResponseHead) -> bool {
    let mut keep = head.version == Version::HTTP_11;
    for value in head
        .headers_named("connection")
        .chain(head.headers_named("proxy-connection"))
    {
        for token in value.split(',').map(str::trim) {
            if token.eq_ignore_ascii_case("close") {
                return false;
            }
            if token.eq_ignore_ascii_case("keep-alive") {
                keep = true;
            }
        }
    }
    keep
}

/// Decoding is only applied to content that will be rendered as text. A
/// missing type counts as text.
fn is_textual(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(value) => {
            let value = value.trim().to_ascii_lowercase();
            value.is_empty() || value.starts_with("text/")
        }
    }
}

fn parse_realm(challenge: &str) -> Option<String> {
    let lower = challenge.to_ascii_lowercase();
    let start = lower.find("realm=")? + "realm=".len();
    let rest = &challenge[start..];
    let realm = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next().unwrap_or_default(),
        None => rest.split([',', ' ']).next().unwrap_or_default(),
    };
    Some(realm.to_string())
}

fn parse_content_range(value: &str) -> Option<ContentRange> {
    let value = value.trim();
    let unit = value.get(..5)?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let rest = value[5..].trim_start_matches([' ', '=']);
    let (range, total) = rest.split_once('/').unwrap_or((rest, "*"));
    let start = range.split('-').next()?.trim().parse().ok()?;
    let total = total.trim().parse().ok();
    Some(ContentRange { start, total })
}

/// Resolves a `Location` value against the URL that was requested.
pub fn resolve_location(base: &Uri, location: &str) -> Option<String> {
    let location = location.trim();
    if location.is_empty() {
        return None;
    }
    if let Some((scheme, _)) = location.split_once("://")
        && !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        return Some(location.to_string());
    }
    let scheme = base.scheme_str()?;
    let authority = base.authority()?.as_str();
    if location.starts_with("//") {
        return Some(format!("{scheme}:{location}"));
    }
    if location.starts_with('/') {
        return Some(format!("{scheme}://{authority}{location}"));
    }
    let path = base.path();
    if location.starts_with('?') {
        return Some(format!("{scheme}://{authority}{path}{location}"));
    }
    let dir = path.rfind('/').map_or("/", |idx| &path[..=idx]);
    Some(format!("{scheme}://{authority}{dir}{location}"))
}
