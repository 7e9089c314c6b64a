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

//! Multipart form bodies.
//!
//! Implements the `multipart-body` grammar of RFC 2046 section 5.1.1
//! with RFC 2388 naming and nested `multipart/mixed` per section 5.1.7.
//! Nested parts inherit the parent part's name; their own MIME name is
//! ignored.  MIME headers follow RFC 2045, with RFC 822 obsolete-syntax
//! tolerance for whitespace around the colon.

use crate::form::FieldSink;
use tracing::warn;

/// MIME metadata of a single multipart entry.
#[derive(Debug, Default)]
pub(crate) struct Mime {
    /// Content disposition.
    pub(crate) disp: Option<String>,
    /// Name of the form entry.
    pub(crate) name: Option<String>,
    /// Source filename, when one was uploaded.
    pub(crate) file: Option<String>,
    /// Content type.
    pub(crate) ctype: Option<String>,
    /// Position of the content type in the caller's MIME table.
    pub(crate) ctypepos: usize,
    /// Content transfer encoding.
    pub(crate) xcode: Option<String>,
    /// Sub-part boundary.
    pub(crate) bound: Option<String>,
}

/// Find `needle` in `hay` (no `memmem` in the standard library).
fn find(hay: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || hay.len() < needle.len() {
        return None;
    }
    hay.windows(needle.len()).position(|w| w == needle)
}

/// Resolve a content type against the MIME table: the base value runs
/// up to the `;` parameter separator (RFC 822 and friends), compared
/// case-insensitively.  Unknown types yield the table length.
pub(crate) fn str2ctype(ctype: Option<&str>, mimes: &[&str]) -> usize {
    let Some(ctype) = ctype else {
        return mimes.len();
    };
    let base = ctype.split(';').next().unwrap_or("");
    mimes
        .iter()
        .position(|m| m.eq_ignore_ascii_case(base))
        .unwrap_or(mimes.len())
}

/// Parse MIME headers at `pos`, leaving `pos` just past the blank line.
///
/// Recognizes exactly `Content-Transfer-Encoding`, `Content-Disposition`
/// and `Content-Type` (case-insensitive) and the `filename`, `name` and
/// `boundary` subparameters; everything else is silently skipped.
/// Returns `false` on a structural error, upon which the whole
/// multipart parse must stop.
fn mime_parse(mime: &mut Mime, buf: &[u8], len: usize, pos: &mut usize, mimes: &[&str]) -> bool {
    #[derive(PartialEq)]
    enum HeaderKind {
        Unknown,
        TransferEncoding,
        Disposition,
        Type,
    }

    *mime = Mime::default();
    let mut done = false;

    while *pos < len {
        // Each MIME line ends with a CRLF.
        let Some(nl) = find(&buf[*pos..len], b"\r\n") else {
            warn!("RFC error: MIME header line without CRLF");
            return false;
        };
        let line = String::from_utf8_lossy(&buf[*pos..*pos + nl]).into_owned();
        *pos += nl + 2;

        // Empty CRLF line: we're done here.
        if line.is_empty() {
            done = true;
            break;
        }

        let Some(colon) = line.find(':') else {
            warn!("RFC error: MIME header without colon separator");
            return false;
        };
        let key = line[..colon].trim_end_matches(' ');
        let mut rest = line[colon + 1..].trim_start_matches(' ');

        if key.is_empty() {
            warn!("RFC warning: empty MIME header name");
        }

        // The value proper runs to the first ';'; subparameters follow.
        let val;
        match rest.find(';') {
            Some(semi) => {
                val = &rest[..semi];
                rest = &rest[semi + 1..];
            }
            None => {
                val = rest;
                rest = "";
            }
        }

        let kind = if key.eq_ignore_ascii_case("content-transfer-encoding") {
            mime.xcode = Some(val.to_string());
            HeaderKind::TransferEncoding
        } else if key.eq_ignore_ascii_case("content-disposition") {
            mime.disp = Some(val.to_string());
            HeaderKind::Disposition
        } else if key.eq_ignore_ascii_case("content-type") {
            mime.ctype = Some(val.to_string());
            HeaderKind::Type
        } else {
            HeaderKind::Unknown
        };

        if kind != HeaderKind::Disposition && kind != HeaderKind::Type {
            continue;
        }

        // Subparameters: key=value separated by ';', values possibly
        // quoted.  Duplicates are last-writer-wins.
        loop {
            let sub = rest.trim_start_matches(' ');
            if sub.is_empty() {
                break;
            }
            let Some(eq) = sub.find('=') else {
                warn!("RFC error: MIME header without sub-part separator");
                return false;
            };
            let sub_key = sub[..eq].trim_end_matches(' ');
            if sub_key.is_empty() {
                warn!("RFC warning: empty MIME sub-part name");
            }
            // OWS around '=' is dubious but tolerated, as around ':'.
            let after = sub[eq + 1..].trim_start_matches(' ');

            let sub_val;
            if let Some(quoted) = after.strip_prefix('"') {
                let Some(close) = quoted.find('"') else {
                    warn!("RFC error: quoted MIME header sub-part not terminated");
                    return false;
                };
                sub_val = &quoted[..close];
                let mut tail = quoted[close + 1..].trim_start_matches(' ');
                if let Some(t) = tail.strip_prefix(';') {
                    tail = t;
                }
                rest = tail;
            } else {
                match after.find(';') {
                    Some(semi) => {
                        sub_val = &after[..semi];
                        rest = &after[semi + 1..];
                    }
                    None => {
                        sub_val = after;
                        rest = "";
                    }
                }
            }

            match kind {
                HeaderKind::Disposition if sub_key.eq_ignore_ascii_case("filename") => {
                    mime.file = Some(sub_val.to_string());
                }
                HeaderKind::Disposition if sub_key.eq_ignore_ascii_case("name") => {
                    mime.name = Some(sub_val.to_string());
                }
                HeaderKind::Type if sub_key.eq_ignore_ascii_case("boundary") => {
                    mime.bound = Some(sub_val.to_string());
                }
                _ => {}
            }
        }
    }

    mime.ctypepos = str2ctype(mime.ctype.as_deref(), mimes);

    if !done {
        warn!("RFC error: unexpected end of file while parsing MIME headers");
    }
    done
}

/// The multipart-body part loop of RFC 2046 section 5.1.1.
///
/// `name` is the inherited parent name for `multipart/mixed` nesting.
/// Returns `false` on structural errors, upon which all calling
/// parsers bail too.
fn parse_multiform(
    sink: &mut dyn FieldSink,
    name: Option<&str>,
    bound: &str,
    buf: &[u8],
    len: usize,
    pos: &mut usize,
    mimes: &[&str],
) -> bool {
    // The full boundary; the opening one lacks the leading CRLF.
    let bb = format!("\r\n--{bound}");
    let bb = bb.as_bytes();
    let mut mime = Mime::default();
    let mut first = true;

    while *pos < len {
        let skip = if first { 2 } else { 0 };
        let Some(hit) = find(&buf[*pos..len], &bb[skip..]) else {
            warn!("RFC error: EOF when scanning for boundary");
            return false;
        };
        let part_end = *pos + hit;

        // End of the boundary string: the start of whatever follows.
        let mut endpos = part_end + bb.len() - skip;

        if endpos + 2 > len {
            warn!("RFC error: multipart section writes into trailing CRLF");
            return false;
        }

        // A terminating boundary carries a trailing "--", and the rest
        // of the message is epilogue.  Otherwise LWS then CRLF follow.
        if &buf[endpos..endpos + 2] == b"--" {
            endpos = len;
        } else {
            while endpos < len && buf[endpos] == b' ' {
                endpos += 1;
            }
            if endpos + 2 > len || &buf[endpos..endpos + 2] != b"\r\n" {
                warn!("RFC error: multipart boundary without CRLF");
                return false;
            }
            endpos += 2;
        }

        // First hit is the opening boundary: nothing precedes it.
        if first {
            first = false;
            *pos = endpos;
            continue;
        }

        // A zero-length part would desynchronize MIME header parsing.
        if part_end == *pos {
            warn!("RFC error: zero-length multipart section");
            *pos = endpos;
            continue;
        }

        if !mime_parse(&mut mime, buf, part_end, pos, mimes) {
            warn!("RFC error: nested error parsing MIME headers");
            return false;
        }

        // As per RFC 2388 we need a name and a disposition; mixed
        // sub-parts inherit the parent name instead.
        if mime.name.is_none() && name.is_none() {
            warn!("RFC error: no MIME name");
            *pos = endpos;
            continue;
        }
        if mime.disp.is_none() {
            warn!("RFC error: no MIME disposition");
            *pos = endpos;
            continue;
        }

        // As per RFC 2045 the content type defaults to text/plain.
        if mime.ctype.is_none() {
            mime.ctype = Some("text/plain".to_string());
            mime.ctypepos = str2ctype(mime.ctype.as_deref(), mimes);
        }

        if mime
            .ctype
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case("multipart/mixed"))
        {
            let Some(inner_bound) = mime.bound.clone() else {
                warn!("RFC error: no mixed multipart boundary");
                return false;
            };
            let inherited = name.or(mime.name.as_deref());
            if !parse_multiform(sink, inherited, &inner_bound, buf, part_end, pos, mimes) {
                warn!("RFC error: nested error parsing mixed multipart section");
                return false;
            }
            *pos = endpos;
            continue;
        }

        let key = name.or(mime.name.as_deref()).unwrap_or("");
        sink.field(key, buf[*pos..part_end].to_vec(), Some(&mime));
        *pos = endpos;
    }

    // Transport padding, a CRLF, then the epilogue may follow the last
    // boundary; none of it matters here.
    true
}

/// Extract the boundary from a `multipart/form-data` content type and
/// run the part loop over the body.
///
/// `params` is the remainder of the header value after the subtype.
pub(crate) fn parse_multi(sink: &mut dyn FieldSink, params: &str, body: &[u8], mimes: &[&str]) {
    let mut line = params.trim_start_matches(' ');

    let Some(rest) = line.strip_prefix(';') else {
        warn!("RFC error: expected semicolon following multipart declaration");
        return;
    };
    line = rest.trim_start_matches(' ');

    // The boundary marker is not optional.
    let Some(rest) = line.strip_prefix("boundary") else {
        warn!("RFC error: expected boundary following multipart declaration");
        return;
    };
    line = rest.trim_start_matches(' ');

    let Some(rest) = line.strip_prefix('=') else {
        warn!("RFC error: expected key-value for multipart boundary");
        return;
    };
    line = rest.trim_start_matches(' ');

    let bound = if let Some(quoted) = line.strip_prefix('"') {
        let Some(close) = quoted.find('"') else {
            warn!("RFC error: unterminated boundary quoted string");
            return;
        };
        &quoted[..close]
    } else {
        // RFC 2046 section 5.1.1 lays out the permitted boundary
        // characters; we simply stop at the first whitespace.
        line.split(' ').next().unwrap_or("")
    };

    let mut pos = 0;
    parse_multiform(sink, None, bound, body, body.len(), &mut pos, mimes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::tests::Collect;

    #[test]
    fn single_binary_part() {
        let body = b"--BB\r\nContent-Disposition: form-data; name=\"pic\"; filename=\"a.bin\"\r\n\
            Content-Type: application/octet-stream\r\n\r\n\x00\x01\x02\x03\r\n--BB--\r\n";
        let mut c = Collect::default();
        parse_multi(&mut c, "; boundary=BB", body, &["application/octet-stream"]);
        assert_eq!(c.fields.len(), 1);
        let (key, val, file, ctype) = &c.fields[0];
        assert_eq!(key, "pic");
        assert_eq!(val, &[0u8, 1, 2, 3]);
        assert_eq!(file.as_deref(), Some("a.bin"));
        assert_eq!(ctype.as_deref(), Some("application/octet-stream"));
    }

    #[test]
    fn mixed_subparts_inherit_name() {
        let body = b"--AB\r\n\
            Content-Disposition: form-data; name=\"imgs\"\r\n\
            Content-Type: multipart/mixed; boundary=CC\r\n\r\n\
            --CC\r\nContent-Disposition: attachment; name=\"ignored\"\r\n\
            Content-Type: image/png\r\n\r\nONE\r\n\
            --CC\r\nContent-Disposition: attachment\r\n\
            Content-Type: image/png\r\n\r\nTWO\r\n--CC--\r\n\
            --AB--\r\n";
        let mut c = Collect::default();
        parse_multi(&mut c, "; boundary=AB", body, &["image/png"]);
        assert_eq!(c.fields.len(), 2);
        assert_eq!(c.fields[0].0, "imgs");
        assert_eq!(c.fields[0].1, b"ONE");
        assert_eq!(c.fields[1].0, "imgs");
        assert_eq!(c.fields[1].1, b"TWO");
    }

    #[test]
    fn missing_name_skips_part() {
        let body = b"--BB\r\nContent-Disposition: form-data\r\n\r\nv\r\n--BB--\r\n";
        let mut c = Collect::default();
        parse_multi(&mut c, "; boundary=BB", body, &[]);
        assert!(c.fields.is_empty());
    }

    #[test]
    fn missing_disposition_skips_part() {
        let body =
            b"--BB\r\nContent-Type: text/plain; name=\"k\"\r\n\r\nv\r\n--BB--\r\n";
        let mut c = Collect::default();
        parse_multi(&mut c, "; boundary=BB", body, &[]);
        assert!(c.fields.is_empty());
    }

    #[test]
    fn default_content_type_is_text_plain() {
        let body = b"--BB\r\nContent-Disposition: form-data; name=\"k\"\r\n\r\nhello\r\n--BB--\r\n";
        let mut c = Collect::default();
        parse_multi(&mut c, "; boundary=BB", body, &["text/plain"]);
        assert_eq!(c.fields.len(), 1);
        assert_eq!(c.fields[0].3.as_deref(), Some("text/plain"));
    }

    #[test]
    fn quoted_boundary_and_ows() {
        let body = b"--X Y\r\nContent-Disposition: form-data ; name = \"k\"\r\n\r\nv\r\n--X Y--\r\n";
        let mut c = Collect::default();
        parse_multi(&mut c, " ; boundary = \"X Y\"", body, &[]);
        assert_eq!(c.fields.len(), 1);
        assert_eq!(c.fields[0].0, "k");
        assert_eq!(c.fields[0].1, b"v");
    }

    #[test]
    fn missing_final_boundary_aborts() {
        let body = b"--BB\r\nContent-Disposition: form-data; name=\"k\"\r\n\r\nv";
        let mut c = Collect::default();
        parse_multi(&mut c, "; boundary=BB", body, &[]);
        assert!(c.fields.is_empty());
    }

    #[test]
    fn ctype_resolution() {
        assert_eq!(str2ctype(Some("TEXT/Plain"), &["text/plain"]), 0);
        assert_eq!(str2ctype(Some("text/plain; charset=utf-8"), &["text/plain"]), 0);
        assert_eq!(str2ctype(Some("image/png"), &["text/plain"]), 1);
        assert_eq!(str2ctype(None, &["text/plain"]), 1);
    }
}
