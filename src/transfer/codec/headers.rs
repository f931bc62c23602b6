use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderLine {
    pub name: String,
    pub value: String,
    lower_name: String,
}

impl HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let lower_name = name.to_ascii_lowercase();
        Self {
            name,
            value: value.into(),
            lower_name,
        }
    }

    pub fn lower_name(&self) -> &str {
        &self.lower_name
    }

    /// Parses one `Name: value` line. Returns `None` for lines that carry no
    /// usable header.
    pub(super) fn parse(line: &str) -> Option<Self> {
        let (name, value) = line.split_once(':')?;
        let name = name.trim();
        if name.is_empty() || HeaderName::from_bytes(name.as_bytes()).is_err() {
            return None;
        }
        Some(Self::new(name, value.trim()))
    }

    /// Appends an obsolete line-folded continuation.
    pub(super) fn fold(&mut self, continuation: &str) {
        if !self.value.is_empty() {
            self.value.push(' ');
        }
        self.value.push_str(continuation.trim());
    }
}

pub(super) fn header_lines_to_map<'a, I>(headers: I) -> HeaderMap
where
    I: Iterator<Item = &'a HeaderLine>,
{
    let mut map = HeaderMap::new();
    for header in headers {
        if let Ok(name) = HeaderName::from_bytes(header.name.as_bytes())
            && let Ok(value) = HeaderValue::from_bytes(header.value.as_bytes())
        {
            map.append(name, value);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trims_and_lowercases() {
        let line = HeaderLine::parse("Content-Type :  text/html ").expect("header");
        assert_eq!(line.name, "Content-Type");
        assert_eq!(line.value, "text/html");
        assert_eq!(line.lower_name(), "content-type");
    }

    #[test]
    fn parse_skips_invalid_names() {
        assert!(HeaderLine::parse("Bad Name: value").is_none());
        assert!(HeaderLine::parse("no separator").is_none());
        assert!(HeaderLine::parse(": empty").is_none());
    }

    #[test]
    fn map_keeps_repeated_headers() {
        let lines = [
            HeaderLine::new("Set-Cookie", "a=1"),
            HeaderLine::new("Set-Cookie", "b=2"),
        ];
        let map = header_lines_to_map(lines.iter());
        assert_eq!(map.get_all(http::header::SET_COOKIE).iter().count(), 2);
    }
}
