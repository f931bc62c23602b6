use std::time::{Duration, SystemTime};

use http::HeaderMap;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;

/// When a cached representation stops being usable without revalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiry {
    /// No freshness information; usable until evicted.
    #[default]
    Never,
    /// Must be revalidated on every use.
    Always,
    At(SystemTime),
}

impl Expiry {
    pub fn is_stale(&self, now: SystemTime) -> bool {
        match self {
            Expiry::Never => false,
            Expiry::Always => true,
            Expiry::At(at) => *at <= now,
        }
    }
}

/// Cache validators recorded from a response head.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub last_modified: Option<String>,
    pub expiry: Expiry,
}

impl Validators {
    pub fn from_headers(headers: &HeaderMap, now: SystemTime) -> Self {
        let last_modified = headers
            .get(http::header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string());
        Self {
            last_modified,
            expiry: expiry_from_headers(headers, now),
        }
    }

    /// Validators after a `304`: whatever the response carries, falling back
    /// to the recorded values for anything it leaves out.
    pub fn revalidated(&self, headers: &HeaderMap, now: SystemTime) -> Self {
        let fresh = Self::from_headers(headers, now);
        Self {
            last_modified: fresh
                .last_modified
                .or_else(|| self.last_modified.clone()),
            expiry: if carries_freshness(headers) {
                fresh.expiry
            } else {
                self.expiry
            },
        }
    }
}

fn carries_freshness(headers: &HeaderMap) -> bool {
    [
        http::header::CACHE_CONTROL,
        http::header::EXPIRES,
        http::header::PRAGMA,
    ]
    .iter()
    .any(|name| headers.contains_key(name))
}

#[derive(Debug, Clone, Default)]
struct CacheControl {
    no_cache: bool,
    no_store: bool,
    max_age: Option<Duration>,
}

fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let mut cc = CacheControl::default();

    for value in headers.get_all(http::header::CACHE_CONTROL) {
        if let Ok(s) = value.to_str() {
            for part in s.split(',') {
                let part = part.trim();
                if part.eq_ignore_ascii_case("no-cache") {
                    cc.no_cache = true;
                } else if part.eq_ignore_ascii_case("no-store") {
                    cc.no_store = true;
                } else if let Some(stripped) = part.strip_prefix("max-age=")
                    && let Ok(secs) = stripped.trim_matches('"').parse::<u64>()
                {
                    cc.max_age = Some(Duration::from_secs(secs));
                }
            }
        }
    }
    cc
}

fn pragma_no_cache(headers: &HeaderMap) -> bool {
    headers
        .get_all(http::header::PRAGMA)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.to_ascii_lowercase().contains("no-cache"))
}

fn expiry_from_headers(headers: &HeaderMap, now: SystemTime) -> Expiry {
    let cc = parse_cache_control(headers);
    if cc.no_cache || cc.no_store || pragma_no_cache(headers) {
        return Expiry::Always;
    }
    if let Some(max_age) = cc.max_age {
        return Expiry::At(now + max_age);
    }
    match headers
        .get(http::header::EXPIRES)
        .and_then(|value| value.to_str().ok())
    {
        // An unparseable Expires means "already expired".
        Some(value) => parse_http_date(value).map_or(Expiry::Always, Expiry::At),
        None => Expiry::Never,
    }
}

fn parse_http_date(value: &str) -> Option<SystemTime> {
    OffsetDateTime::parse(value.trim(), &Rfc2822)
        .ok()
        .map(SystemTime::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn no_cache_directives_expire_immediately() {
        let now = SystemTime::now();
        let cc = headers(&[("cache-control", "private, no-cache")]);
        assert_eq!(expiry_from_headers(&cc, now), Expiry::Always);
        let pragma = headers(&[("pragma", "no-cache")]);
        assert_eq!(expiry_from_headers(&pragma, now), Expiry::Always);
    }

    #[test]
    fn max_age_wins_over_expires() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let map = headers(&[
            ("cache-control", "max-age=60"),
            ("expires", "Thu, 01 Jan 1970 00:00:00 GMT"),
        ]);
        assert_eq!(
            expiry_from_headers(&map, now),
            Expiry::At(now + Duration::from_secs(60))
        );
    }

    #[test]
    fn invalid_expires_is_stale() {
        let map = headers(&[("expires", "0")]);
        let expiry = expiry_from_headers(&map, SystemTime::now());
        assert!(expiry.is_stale(SystemTime::now()));
    }

    #[test]
    fn validators_capture_last_modified() {
        let map = headers(&[("last-modified", "Tue, 15 Nov 1994 12:45:26 GMT")]);
        let validators = Validators::from_headers(&map, SystemTime::now());
        assert_eq!(
            validators.last_modified.as_deref(),
            Some("Tue, 15 Nov 1994 12:45:26 GMT")
        );
        assert_eq!(validators.expiry, Expiry::Never);
    }

    #[test]
    fn bare_not_modified_keeps_recorded_validators() {
        let recorded = Validators {
            last_modified: Some("Tue, 15 Nov 1994 12:45:26 GMT".to_string()),
            expiry: Expiry::Always,
        };
        let refreshed = recorded.revalidated(&HeaderMap::new(), SystemTime::now());
        assert_eq!(refreshed, recorded);
    }

    #[test]
    fn not_modified_with_max_age_replaces_expiry() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let recorded = Validators {
            last_modified: Some("Tue, 15 Nov 1994 12:45:26 GMT".to_string()),
            expiry: Expiry::Always,
        };
        let refreshed = recorded.revalidated(&headers(&[("cache-control", "max-age=30")]), now);
        assert_eq!(refreshed.expiry, Expiry::At(now + Duration::from_secs(30)));
        assert_eq!(refreshed.last_modified, recorded.last_modified);
    }
}
