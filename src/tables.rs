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

//! Built-in tables: MIME types, suffix mapping, HTTP status lines and
//! response header names.  Callers with richer needs supply their own
//! tables through [`crate::Config`]; indices into these are what the
//! request's `mime` and field `ctypepos` values mean.

/// Recognized MIME types.  Field content types and path suffixes
/// resolve to indices into this table.
pub const MIME_TYPES: [&str; 16] = [
    "application/x-javascript",
    "application/json",
    "application/octet-stream",
    "application/pdf",
    "application/xml",
    "application/zip",
    "image/gif",
    "image/jpeg",
    "image/png",
    "image/svg+xml",
    "text/calendar",
    "text/css",
    "text/csv",
    "text/html",
    "text/plain",
    "text/xml",
];

/// Index of `text/html` in [`MIME_TYPES`]: the default response type.
pub const MIME_TEXT_HTML: usize = 13;
/// Index of `application/octet-stream` in [`MIME_TYPES`].
pub const MIME_APP_OCTET_STREAM: usize = 2;

/// Path-suffix to [`MIME_TYPES`] index mapping.
pub const SUFFIX_MAP: [(&str, usize); 21] = [
    ("css", 11),
    ("csv", 12),
    ("gif", 6),
    ("htm", 13),
    ("html", 13),
    ("ical", 10),
    ("icalendar", 10),
    ("ics", 10),
    ("ifb", 10),
    ("jpg", 7),
    ("jpeg", 7),
    ("js", 0),
    ("json", 1),
    ("pdf", 3),
    ("png", 8),
    ("shtml", 13),
    ("svg", 9),
    ("svgz", 9),
    ("txt", 14),
    ("xml", 15),
    ("zip", 5),
];

/// Default suffix per MIME type, for URL construction; `None` where
/// no canonical suffix exists.
pub const DEFAULT_SUFFIXES: [Option<&str>; 16] = [
    Some("js"),
    Some("json"),
    None,
    Some("pdf"),
    Some("xml"),
    Some("zip"),
    Some("gif"),
    Some("jpg"),
    Some("png"),
    Some("svg"),
    Some("ics"),
    Some("css"),
    Some("csv"),
    Some("html"),
    Some("txt"),
    Some("xml"),
];

/// HTTP status lines for the `Status` response header.
pub const STATUS_LINES: [&str; 49] = [
    "100 Continue",
    "101 Switching Protocols",
    "103 Checkpoint",
    "200 OK",
    "201 Created",
    "202 Accepted",
    "203 Non-Authoritative Information",
    "204 No Content",
    "205 Reset Content",
    "206 Partial Content",
    "207 Multi-Status",
    "300 Multiple Choices",
    "301 Moved Permanently",
    "302 Found",
    "303 See Other",
    "304 Not Modified",
    "306 Switch Proxy",
    "307 Temporary Redirect",
    "308 Resume Incomplete",
    "400 Bad Request",
    "401 Unauthorized",
    "402 Payment Required",
    "403 Forbidden",
    "404 Not Found",
    "405 Method Not Allowed",
    "406 Not Acceptable",
    "407 Proxy Authentication Required",
    "408 Request Timeout",
    "409 Conflict",
    "410 Gone",
    "411 Length Required",
    "412 Precondition Failed",
    "413 Request Entity Too Large",
    "414 Request-URI Too Long",
    "415 Unsupported Media Type",
    "416 Requested Range Not Satisfiable",
    "417 Expectation Failed",
    "424 Failed Dependency",
    "428 Precondition Required",
    "429 Too Many Requests",
    "431 Request Header Fields Too Large",
    "500 Internal Server Error",
    "501 Not Implemented",
    "502 Bad Gateway",
    "503 Service Unavailable",
    "504 Gateway Timeout",
    "505 HTTP Version Not Supported",
    "507 Insufficient Storage",
    "511 Network Authentication Required",
];

/// Index of `200 OK` in [`STATUS_LINES`].
pub const STATUS_OK: usize = 3;

/// Well-known response header names.
pub mod resp {
    pub const ALLOW: &str = "Allow";
    pub const CACHE_CONTROL: &str = "Cache-Control";
    pub const CONNECTION: &str = "Connection";
    pub const CONTENT_ENCODING: &str = "Content-Encoding";
    pub const CONTENT_DISPOSITION: &str = "Content-Disposition";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const DATE: &str = "Date";
    pub const ETAG: &str = "ETag";
    pub const EXPIRES: &str = "Expires";
    pub const LAST_MODIFIED: &str = "Last-Modified";
    pub const LOCATION: &str = "Location";
    pub const PRAGMA: &str = "Pragma";
    pub const SERVER: &str = "Server";
    pub const SET_COOKIE: &str = "Set-Cookie";
    pub const STATUS: &str = "Status";
    pub const VARY: &str = "Vary";
    pub const WWW_AUTHENTICATE: &str = "WWW-Authenticate";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_map_points_into_mime_table() {
        for (suffix, idx) in SUFFIX_MAP {
            assert!(idx < MIME_TYPES.len(), "suffix {suffix} out of range");
        }
        assert_eq!(MIME_TYPES[MIME_TEXT_HTML], "text/html");
        assert_eq!(MIME_TYPES[MIME_APP_OCTET_STREAM], "application/octet-stream");
        assert_eq!(STATUS_LINES[STATUS_OK], "200 OK");
    }
}
