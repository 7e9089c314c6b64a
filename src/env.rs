// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Request attributes derived from the CGI environment.
//!
//! CGI reads the process environment; FastCGI receives an equivalent
//! set over `PARAMS` records.  Both are collected into the same
//! key/value representation so one set of parsers serves both, with
//! keys filtered to the printable-ASCII shape RFC 3875 section 4.1
//! requires.

/// HTTP and WebDAV request methods (RFC 3875 section 4.1.12 leaves the
/// set open; these are the ones a webserver will actually forward).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Method {
    Acl = 0,
    Connect,
    Copy,
    Delete,
    Get,
    Head,
    Lock,
    MkCalendar,
    MkCol,
    Move,
    Options,
    Post,
    Propfind,
    Proppatch,
    Put,
    Report,
    Trace,
    Unlock,
    /// `REQUEST_METHOD` was present but matched nothing above.
    Unknown,
}

/// Method names, ordered to match the discriminants.
const METHODS: [&str; 18] = [
    "ACL",
    "CONNECT",
    "COPY",
    "DELETE",
    "GET",
    "HEAD",
    "LOCK",
    "MKCALENDAR",
    "MKCOL",
    "MOVE",
    "OPTIONS",
    "POST",
    "PROPFIND",
    "PROPPATCH",
    "PUT",
    "REPORT",
    "TRACE",
    "UNLOCK",
];

/// Method variants, ordered to match [`METHODS`].
const METHOD_VARIANTS: [Method; 18] = [
    Method::Acl,
    Method::Connect,
    Method::Copy,
    Method::Delete,
    Method::Get,
    Method::Head,
    Method::Lock,
    Method::MkCalendar,
    Method::MkCol,
    Method::Move,
    Method::Options,
    Method::Post,
    Method::Propfind,
    Method::Proppatch,
    Method::Put,
    Method::Report,
    Method::Trace,
    Method::Unlock,
];

impl Method {
    /// Parse a `REQUEST_METHOD` value.
    pub fn parse(s: &str) -> Self {
        METHODS
            .iter()
            .position(|m| *m == s)
            .map_or(Method::Unknown, |i| METHOD_VARIANTS[i])
    }

    pub(crate) fn from_u32(v: u32) -> Self {
        METHOD_VARIANTS
            .get(v as usize)
            .copied()
            .unwrap_or(Method::Unknown)
    }

    /// The wire name of the method, or `None` for the unknown sentinel.
    pub fn name(self) -> Option<&'static str> {
        METHODS.get(self as usize).copied()
    }
}

/// The URL scheme of the request, inferred from the `HTTPS` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum Scheme {
    #[default]
    Http = 0,
    Https = 1,
}

impl Scheme {
    pub(crate) fn from_u32(v: u32) -> Self {
        if v == 1 { Scheme::Https } else { Scheme::Http }
    }

    /// The scheme name as it appears in a URL.
    pub fn name(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Request headers recognized well enough to be indexed.
///
/// All other `HTTP_*` headers are still delivered, in order, through
/// the request's linear header list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestHeader {
    Accept = 0,
    AcceptCharset,
    AcceptEncoding,
    AcceptLanguage,
    Authorization,
    Depth,
    From,
    Host,
    If,
    IfModifiedSince,
    IfMatch,
    IfNoneMatch,
    IfRange,
    IfUnmodifiedSince,
    MaxForwards,
    ProxyAuthorization,
    Range,
    Referer,
    UserAgent,
}

/// CGI environment names of the recognized headers, ordered to match
/// the discriminants.
const REQUEST_HEADERS: [&str; RequestHeader::COUNT] = [
    "HTTP_ACCEPT",
    "HTTP_ACCEPT_CHARSET",
    "HTTP_ACCEPT_ENCODING",
    "HTTP_ACCEPT_LANGUAGE",
    "HTTP_AUTHORIZATION",
    "HTTP_DEPTH",
    "HTTP_FROM",
    "HTTP_HOST",
    "HTTP_IF",
    "HTTP_IF_MODIFIED_SINCE",
    "HTTP_IF_MATCH",
    "HTTP_IF_NONE_MATCH",
    "HTTP_IF_RANGE",
    "HTTP_IF_UNMODIFIED_SINCE",
    "HTTP_MAX_FORWARDS",
    "HTTP_PROXY_AUTHORIZATION",
    "HTTP_RANGE",
    "HTTP_REFERER",
    "HTTP_USER_AGENT",
];

/// Header variants, ordered to match [`REQUEST_HEADERS`].
const HEADER_VARIANTS: [RequestHeader; RequestHeader::COUNT] = [
    RequestHeader::Accept,
    RequestHeader::AcceptCharset,
    RequestHeader::AcceptEncoding,
    RequestHeader::AcceptLanguage,
    RequestHeader::Authorization,
    RequestHeader::Depth,
    RequestHeader::From,
    RequestHeader::Host,
    RequestHeader::If,
    RequestHeader::IfModifiedSince,
    RequestHeader::IfMatch,
    RequestHeader::IfNoneMatch,
    RequestHeader::IfRange,
    RequestHeader::IfUnmodifiedSince,
    RequestHeader::MaxForwards,
    RequestHeader::ProxyAuthorization,
    RequestHeader::Range,
    RequestHeader::Referer,
    RequestHeader::UserAgent,
];

impl RequestHeader {
    /// Number of recognized request headers.
    pub const COUNT: usize = 19;

    /// Match a CGI environment name (`HTTP_*`) to a recognized header.
    pub fn from_cgi(key: &str) -> Option<Self> {
        REQUEST_HEADERS
            .iter()
            .position(|h| *h == key)
            .map(|i| HEADER_VARIANTS[i])
    }

    pub(crate) fn from_u32(v: u32) -> Option<Self> {
        HEADER_VARIANTS.get(v as usize).copied()
    }
}

/// Reconstruct an HTTP header name from its CGI environment form.
///
/// RFC 3875 section 4.1.18 rewrites header names by uppercasing and
/// turning dashes into underscores; this reverses that as well as it
/// can be reversed: `HTTP_FOO_BAR` becomes `Foo-Bar`.  The `HTTP_`
/// prefix must already be stripped.
pub fn http_header_name(cgi: &str) -> String {
    let mut out = String::with_capacity(cgi.len());
    let mut first = true;
    for c in cgi.chars() {
        if c == '_' {
            out.push('-');
            first = true;
        } else if first {
            out.push(c.to_ascii_uppercase());
            first = false;
        } else {
            out.push(c.to_ascii_lowercase());
        }
    }
    out
}

/// One key/value pair of the abstract request environment.
#[derive(Debug)]
pub(crate) struct EnvPair {
    pub(crate) key: String,
    pub(crate) val: String,
}

/// Whether an environment key meets RFC 3875 section 4.1: non-empty,
/// ASCII, printable, no whitespace.
pub(crate) fn key_ok(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_graphic())
}

/// Collect the process environment, dropping entries whose keys do not
/// satisfy [`key_ok`].
pub(crate) fn collect() -> Vec<EnvPair> {
    let mut envs = Vec::new();
    for (key, val) in std::env::vars_os() {
        let (Ok(key), val) = (key.into_string(), val.to_string_lossy().into_owned()) else {
            tracing::warn!("RFC warning: bad character in environment pair");
            continue;
        };
        if !key_ok(&key) {
            tracing::warn!("RFC warning: bad character in environment pair");
            continue;
        }
        envs.push(EnvPair { key, val });
    }
    envs
}

/// Look a key up in the abstract environment.
pub(crate) fn get<'a>(envs: &'a [EnvPair], key: &str) -> Option<&'a str> {
    envs.iter()
        .find(|pair| pair.key == key)
        .map(|pair| pair.val.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_round_trip() {
        assert_eq!(Method::parse("POST"), Method::Post);
        assert_eq!(Method::parse("post"), Method::Unknown);
        assert_eq!(Method::Post.name(), Some("POST"));
        assert_eq!(Method::Unknown.name(), None);
        for (i, name) in METHODS.iter().enumerate() {
            assert_eq!(Method::parse(name) as usize, i);
        }
    }

    #[test]
    fn header_name_mangling() {
        assert_eq!(http_header_name("FOO_BAR"), "Foo-Bar");
        assert_eq!(http_header_name("ACCEPT"), "Accept");
        assert_eq!(http_header_name("IF_MODIFIED_SINCE"), "If-Modified-Since");
    }

    #[test]
    fn header_name_idempotent_on_legal_names() {
        // A second trip through the CGI mangling and back is a fixed
        // point for every name the mapping can produce.
        for cgi in ["FOO_BAR", "X_LONG_HEADER_NAME", "HOST"] {
            let once = http_header_name(cgi);
            let back = once.to_ascii_uppercase().replace('-', "_");
            assert_eq!(http_header_name(&back), once);
        }
    }

    #[test]
    fn recognized_headers() {
        assert_eq!(
            RequestHeader::from_cgi("HTTP_ACCEPT_ENCODING"),
            Some(RequestHeader::AcceptEncoding)
        );
        assert_eq!(RequestHeader::from_cgi("HTTP_X_CUSTOM"), None);
        assert_eq!(REQUEST_HEADERS.len(), RequestHeader::COUNT);
    }

    #[test]
    fn key_filtering() {
        assert!(key_ok("CONTENT_TYPE"));
        assert!(!key_ok(""));
        assert!(!key_ok("HAS SPACE"));
        assert!(!key_ok("nötascii"));
    }
}
