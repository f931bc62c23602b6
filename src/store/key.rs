use std::fmt;

use anyhow::{Context, Result, anyhow, bail};
use http::Uri;

/// Normalized identity of a cached object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    key: String,
}

impl CacheKey {
    /// Builds the key for a GET of `url`. The fragment is dropped, scheme and
    /// host are lowercased and the default port is elided.
    pub fn for_url(url: &str) -> Result<Self> {
        let uri = normalize_url(url)?;
        Ok(Self {
            key: uri.to_string(),
        })
    }

    /// POST responses depend on the payload, so the body digest is part of
    /// the key.
    pub fn for_post(url: &str, body: &[u8]) -> Result<Self> {
        let base = Self::for_url(url)?;
        let digest = blake3::hash(body).to_hex();
        Ok(Self {
            key: format!("{}#post-{}", base.key, digest),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn into_string(self) -> String {
        self.key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

pub fn normalize_url(url: &str) -> Result<Uri> {
    let without_fragment = url.trim().split('#').next().unwrap_or_default();
    let uri: Uri = without_fragment
        .parse()
        .with_context(|| format!("invalid URL '{url}'"))?;
    let scheme = uri
        .scheme_str()
        .ok_or_else(|| anyhow!("URL '{url}' has no scheme"))?
        .to_ascii_lowercase();
    let authority = uri
        .authority()
        .ok_or_else(|| anyhow!("URL '{url}' has no host"))?;
    let host = authority.host().to_ascii_lowercase();
    if host.is_empty() {
        bail!("URL '{url}' has an empty host");
    }
    let default_port = match scheme.as_str() {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    };
    let authority = match authority.port_u16() {
        Some(port) if Some(port) != default_port => format!("{host}:{port}"),
        _ => host,
    };
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/");
    let path_and_query = if path_and_query.starts_with('/') {
        path_and_query.to_string()
    } else {
        format!("/{path_and_query}")
    };
    Uri::builder()
        .scheme(scheme.as_str())
        .authority(authority.as_str())
        .path_and_query(path_and_query.as_str())
        .build()
        .with_context(|| format!("failed to normalize URL '{url}'"))
}
