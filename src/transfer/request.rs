use bytes::Bytes;
use http::{Method, Uri};

use crate::settings::RefererPolicy;

/// Request headers that do not change from one fetch to the next.
#[derive(Debug, Clone)]
pub struct RequestProfile {
    pub user_agent: String,
    pub referer: RefererPolicy,
    pub fake_referer: Option<String>,
    pub accept_language: Option<String>,
    pub accept_charset: Option<String>,
    pub allow_compression: bool,
    /// Base64 `user:password` sent as Basic proxy credentials.
    pub proxy_authorization: Option<String>,
}

impl Default for RequestProfile {
    fn default() -> Self {
        Self {
            user_agent: crate::settings::default_user_agent(),
            referer: RefererPolicy::None,
            fake_referer: None,
            accept_language: None,
            accept_charset: None,
            allow_compression: true,
            proxy_authorization: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostBody {
    pub content_type: String,
    pub data: Bytes,
}

impl PostBody {
    pub fn form(data: impl Into<Bytes>) -> Self {
        Self {
            content_type: "application/x-www-form-urlencoded".to_string(),
            data: data.into(),
        }
    }
}

/// Everything that varies per request.
#[derive(Debug)]
pub struct RequestPlan<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    /// The page the request originates from.
    pub referer: Option<&'a str>,
    pub force_reload: bool,
    pub if_modified_since: Option<&'a str>,
    pub range_from: Option<u64>,
    /// Basic token from the credential store.
    pub authorization: Option<&'a str>,
    pub cookie: Option<&'a str>,
    pub body: Option<&'a PostBody>,
}

pub fn build_request(profile: &RequestProfile, plan: &RequestPlan<'_>) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(512);
    let target = plan
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let host = plan
        .uri
        .authority()
        .map(|authority| authority.as_str())
        .unwrap_or_default();

    push_line(
        &mut buffer,
        &format!("{} {} HTTP/1.1", plan.method.as_str(), target),
    );
    push_header(&mut buffer, "Host", host);
    push_header(&mut buffer, "User-Agent", &profile.user_agent);

    let uri_string = plan.uri.to_string();
    let referer = match profile.referer {
        RefererPolicy::None => None,
        RefererPolicy::Same => Some(uri_string.as_str()),
        RefererPolicy::Fake => profile.fake_referer.as_deref(),
        RefererPolicy::Real => plan.referer,
    };
    if let Some(referer) = referer {
        push_header(&mut buffer, "Referer", referer);
    }

    push_header(&mut buffer, "Accept", "*/*");
    // A ranged continuation must arrive in the same encoding as the prefix.
    if profile.allow_compression && plan.range_from.is_none() {
        push_header(&mut buffer, "Accept-Encoding", "gzip, bzip2");
    }
    if let Some(charset) = profile.accept_charset.as_deref() {
        push_header(&mut buffer, "Accept-Charset", charset);
    }
    if let Some(language) = profile.accept_language.as_deref() {
        push_header(&mut buffer, "Accept-Language", language);
    }
    push_header(&mut buffer, "Connection", "keep-alive");

    if plan.force_reload {
        push_header(&mut buffer, "Pragma", "no-cache");
        push_header(&mut buffer, "Cache-Control", "no-cache");
    } else if let Some(since) = plan.if_modified_since {
        push_header(&mut buffer, "If-Modified-Since", since);
    }
    if let Some(from) = plan.range_from {
        push_header(&mut buffer, "Range", &format!("bytes={from}-"));
    }
    if let Some(proxy) = profile.proxy_authorization.as_deref() {
        push_header(&mut buffer, "Proxy-Authorization", &format!("Basic {proxy}"));
    }
    if let Some(token) = plan.authorization {
        push_header(&mut buffer, "Authorization", &format!("Basic {token}"));
    }
    if let Some(cookie) = plan.cookie {
        push_header(&mut buffer, "Cookie", cookie);
    }

    match plan.body {
        Some(body) => {
            push_header(&mut buffer, "Content-Type", &body.content_type);
            push_header(&mut buffer, "Content-Length", &body.data.len().to_string());
            buffer.extend_from_slice(b"\r\n");
            buffer.extend_from_slice(&body.data);
        }
        None => buffer.extend_from_slice(b"\r\n"),
    }
    buffer
}

fn push_line(buffer: &mut Vec<u8>, line: &str) {
    buffer.extend_from_slice(line.as_bytes());
    buffer.extend_from_slice(b"\r\n");
}

fn push_header(buffer: &mut Vec<u8>, name: &str, value: &str) {
    buffer.extend_from_slice(name.as_bytes());
    buffer.extend_from_slice(b": ");
    // Header values must not smuggle line breaks into the request.
    for byte in value.bytes() {
        if byte != b'\r' && byte != b'\n' {
            buffer.push(byte);
        }
    }
    buffer.extend_from_slice(b"\r\n");
}
