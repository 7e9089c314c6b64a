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

//! Key/value pair scanners for URL-encoded, cookie and plain-text
//! input.
//!
//! A malformed pair is logged and skipped at field granularity; the
//! scanners never fail the whole input.  Parsed pairs are handed to a
//! [`FieldSink`], which the worker implements by validating and
//! serializing to the responder, and tests implement by collecting.

use crate::{multipart::Mime, url::urldecode};
use tracing::warn;

/// Consumer of parsed fields.
///
/// The scanners and the multipart parser are generic over the sink so
/// the field pipeline can be exercised without a socket behind it.
pub(crate) trait FieldSink {
    /// One parsed field, with multipart metadata when present.
    fn field(&mut self, key: &str, val: Vec<u8>, mime: Option<&Mime>);
}

/// Parse URL-encoded pairs from a query string or request body.
///
/// A key without `=` is a standalone key with an empty value.  Both
/// sides are percent-decoded; a pair whose key or value fails to
/// decode is dropped.
pub(crate) fn parse_pairs_urlenc(sink: &mut dyn FieldSink, input: &str) {
    let bytes = input.as_bytes();
    let mut p = 0;

    while p < bytes.len() {
        while p < bytes.len() && bytes[p] == b' ' {
            p += 1;
        }
        if p == bytes.len() {
            break;
        }

        let key_start = p;
        while p < bytes.len() && !matches!(bytes[p], b'=' | b';' | b'&') {
            p += 1;
        }
        let key = &input[key_start..p];

        let val = if p < bytes.len() && bytes[p] == b'=' {
            p += 1;
            let val_start = p;
            while p < bytes.len() && !matches!(bytes[p], b';' | b'&') {
                p += 1;
            }
            &input[val_start..p]
        } else {
            ""
        };
        if p < bytes.len() {
            p += 1;
        }

        if key.is_empty() {
            warn!("RFC warning: zero-length URL-encoded key");
            continue;
        }
        let Ok(dkey) = urldecode(key) else {
            warn!("RFC warning: malformed key URL-encoding");
            continue;
        };
        let Ok(dkey) = String::from_utf8(dkey) else {
            warn!("RFC warning: URL-encoded key is not UTF-8");
            continue;
        };
        let Ok(dval) = urldecode(val) else {
            warn!("RFC warning: malformed value URL-encoding");
            continue;
        };

        sink.field(&dkey, dval, None);
    }
}

/// Parse cookie crumbs (RFC 6265 subset).
///
/// The only delimiter is `;`, values are opaque (no percent-decoding,
/// no quoted strings), and a crumb without `=` is rejected.
pub(crate) fn parse_pairs_cookie(sink: &mut dyn FieldSink, input: &str) {
    let bytes = input.as_bytes();
    let mut p = 0;

    while p < bytes.len() {
        while p < bytes.len() && bytes[p] == b' ' {
            p += 1;
        }
        if p == bytes.len() {
            break;
        }

        let key_start = p;
        while p < bytes.len() && !matches!(bytes[p], b'=' | b';') {
            p += 1;
        }
        if p == bytes.len() || bytes[p] == b';' {
            if p < bytes.len() {
                p += 1;
            }
            warn!("RFC error: cookie key pair without value");
            continue;
        }
        let key = &input[key_start..p];
        p += 1;

        let val_start = p;
        while p < bytes.len() && bytes[p] != b';' {
            p += 1;
        }
        let val = &input[val_start..p];
        if p < bytes.len() {
            p += 1;
        }

        if key.is_empty() {
            warn!("RFC warning: cookie zero-length key");
            continue;
        }
        sink.field(key, val.as_bytes().to_vec(), None);
    }
}

/// Parse newline-separated pairs from a `text/plain` body.
///
/// No standard defines this; the W3 guidelines for HTML give a rough
/// idea.  No percent-decoding is applied.
pub(crate) fn parse_pairs_text(sink: &mut dyn FieldSink, input: &str) {
    warn!("RFC warning: text/plain encoding is deprecated");

    let mut rest = input;
    loop {
        rest = rest.trim_start_matches(' ');
        if rest.is_empty() {
            break;
        }

        let Some(eq) = rest.find('=') else {
            warn!("RFC warning: key with no value");
            break;
        };
        let key = &rest[..eq];
        let after = &rest[eq + 1..];
        let (val, next) = match after.find("\r\n") {
            Some(nl) => (&after[..nl], &after[nl + 2..]),
            None => (after, ""),
        };
        rest = next;

        if key.is_empty() {
            warn!("RFC warning: zero-length key");
            continue;
        }
        sink.field(key, val.as_bytes().to_vec(), None);
    }
}
