//! Core HTTP protocol types and utilities

use crate::errors::ErrorKind;

#[inline(always)]
pub(crate) fn slice_to_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: usize = 0;

    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as usize)?;
    }

    Some(result)
}

/// Lookup key of a header name: ASCII lowercase with `-` replaced by `_`.
///
/// `Content-Length`, `content-length` and `CONTENT_LENGTH` share one key.
#[inline]
pub fn normalize_header_name(name: &str) -> String {
    name.trim()
        .bytes()
        .map(|byte| match byte {
            b'-' => '_',
            byte => byte.to_ascii_lowercase() as char,
        })
        .collect()
}

#[inline]
pub(crate) fn is_token(value: &str) -> bool {
    !value.is_empty()
        && value.bytes().all(|byte| {
            byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
        })
}

// METHOD

/// HTTP request methods
///
/// # References
///
/// - [RFC 7231, Section 4](https://datatracker.ietf.org/doc/html/rfc7231#section-4)
/// - [RFC 5789](https://datatracker.ietf.org/doc/html/rfc5789) (PATCH method)
///
/// # Disabled methods
///
/// * `TRACE` - disabled for security reasons
/// * `CONNECT` - this server is not a proxy
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET method - transfer a current representation of the target resource
    Get,
    /// PUT method - replace all current representations of the target resource with the request payload
    Put,
    /// POST method - perform resource-specific processing on the request payload
    Post,
    /// HEAD method - same as GET but without response body
    Head,
    /// PATCH method - apply partial modifications to a resource
    Patch,
    /// DELETE method - remove all current representations of the target resource
    Delete,
    /// OPTIONS method - describe the communication options for the target resource
    Options,
}

impl Method {
    #[inline(always)]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"GET" => Ok(Method::Get),
            b"PUT" => Ok(Method::Put),
            b"POST" => Ok(Method::Post),
            b"HEAD" => Ok(Method::Head),
            b"PATCH" => Ok(Method::Patch),
            b"DELETE" => Ok(Method::Delete),
            b"OPTIONS" => Ok(Method::Options),
            _ => Err(ErrorKind::InvalidMethod),
        }
    }

    /// Method name as sent on the wire.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }
}

// VERSION

/// HTTP protocol version
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    /// HTTP/1.0, connections close after each response unless the client
    /// asks for `keep-alive`
    Http10,
    /// HTTP/1.1, connections persist unless either side sends `close`
    Http11,
}

impl Version {
    #[inline]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"HTTP/1.0" => Ok(Version::Http10),
            b"HTTP/1.1" => Ok(Version::Http11),
            [b'H', b'T', b'T', b'P', b'/', b'2'..=b'9', ..] => Err(ErrorKind::UnsupportedVersion),
            _ => Err(ErrorKind::InvalidVersion),
        }
    }

    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

// HEADERS

/// Request headers in arrival order, looked up by normalized name.
///
/// Repeated header lines are joined into one value with `, `, the same way
/// obsolete line folding is.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
    last: Option<usize>,
}

impl Headers {
    #[inline]
    pub(crate) fn append(&mut self, name: &str, value: &str) {
        let key = normalize_header_name(name);

        match self.entries.iter().position(|(k, _)| *k == key) {
            Some(index) => {
                let current = &mut self.entries[index].1;
                if current.is_empty() {
                    current.push_str(value);
                } else if !value.is_empty() {
                    current.push_str(", ");
                    current.push_str(value);
                }
                self.last = Some(index);
            }
            None => {
                self.entries.push((key, value.to_string()));
                self.last = Some(self.entries.len() - 1);
            }
        }
    }

    /// Appends a continuation line to the previous header.
    ///
    /// Returns `false` if there is no previous header.
    #[inline]
    pub(crate) fn fold(&mut self, value: &str) -> bool {
        let Some(index) = self.last else {
            return false;
        };

        let current = &mut self.entries[index].1;
        if !value.is_empty() {
            current.push_str(", ");
            current.push_str(value);
        }
        true
    }

    /// Returns the value of a header; `name` is normalized before lookup.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&str> {
        let key = normalize_header_name(name);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterates over `(normalized name, value)` pairs in arrival order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Returns `true` if a comma separated header value lists `token`,
/// ignoring ASCII case.
#[inline]
pub(crate) fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_method() {
        #[rustfmt::skip]
        let cases = [
            ("GET",     Some(Method::Get)),
            ("PUT",     Some(Method::Put)),
            ("POST",    Some(Method::Post)),
            ("HEAD",    Some(Method::Head)),
            ("PATCH",   Some(Method::Patch)),
            ("DELETE",  Some(Method::Delete)),
            ("OPTIONS", Some(Method::Options)),
            ("get",     None),
            ("TRACE",   None),
            ("CONNECT", None),
            ("G E T",   None),
            ("",        None),
        ];

        for (src, expected) in cases {
            assert_eq!(Method::from_bytes(src.as_bytes()).ok(), expected, "{src}");
        }
        assert_eq!(Method::Options.as_str(), "OPTIONS");
    }

    #[test]
    fn parse_version() {
        #[rustfmt::skip]
        let cases = [
            ("HTTP/1.0", "ok"),
            ("HTTP/1.1", "ok"),
            ("HTTP/2.0", "unsupported"),
            ("HTTP/3",   "unsupported"),
            ("HTTP/0.9", "invalid"),
            ("HTTP/1.2", "invalid"),
            ("SPDY/1.1", "invalid"),
            ("http/1.1", "invalid"),
        ];

        for (src, expected) in cases {
            let got = match Version::from_bytes(src.as_bytes()) {
                Ok(_) => "ok",
                Err(ErrorKind::UnsupportedVersion) => "unsupported",
                Err(ErrorKind::InvalidVersion) => "invalid",
                Err(other) => panic!("{other:?}"),
            };
            assert_eq!(got, expected, "{src}");
        }
    }

    #[test]
    fn header_names() {
        #[rustfmt::skip]
        let cases = [
            ("Content-Length",  "content_length"),
            ("USER-AGENT",      "user_agent"),
            (" Host ",          "host"),
            ("x_custom",        "x_custom"),
        ];

        for (src, expected) in cases {
            assert_eq!(normalize_header_name(src), expected);
        }
    }

    #[test]
    fn header_lookup_and_join() {
        let mut headers = Headers::default();
        headers.append("Accept", "text/html");
        headers.append("Host", "example.com");
        headers.append("accept", "text/plain");

        assert_eq!(headers.get("ACCEPT"), Some("text/html, text/plain"));
        assert_eq!(headers.get("host"), Some("example.com"));
        assert_eq!(headers.len(), 2);

        assert!(headers.fold("image/png"));
        assert_eq!(headers.get("accept"), Some("text/html, text/plain, image/png"));
        assert!(!Headers::default().fold("lost"));
    }

    #[test]
    fn connection_tokens() {
        assert!(has_token("Keep-Alive", "keep-alive"));
        assert!(has_token("upgrade, close", "close"));
        assert!(!has_token("closed", "close"));
    }

    #[test]
    fn digits() {
        assert_eq!(slice_to_usize(b"1024"), Some(1024));
        assert_eq!(slice_to_usize(b""), None);
        assert_eq!(slice_to_usize(b"12a"), None);
        assert_eq!(slice_to_usize(b"99999999999999999999999"), None);
    }
}
