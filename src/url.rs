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

//! URL percent-coding.
//!
//! The decoder is strict where it matters for safety: `%` must be
//! followed by exactly two hex digits, and `%00` is refused outright so
//! that a decoded value can never smuggle a NUL into a consumer that
//! treats the bytes as a C string.

use crate::{Error, Result};

/// Decode a percent-encoded string into raw bytes.
///
/// `+` becomes a space and `%HH` the corresponding byte; everything
/// else passes through.  Errors are reported for a truncated or
/// non-hex escape and for an embedded NUL.
pub fn urldecode(s: &str) -> Result<Vec<u8>> {
    let b = s.as_bytes();
    let mut out = Vec::with_capacity(b.len());
    let mut i = 0;

    while i < b.len() {
        match b[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = b
                    .get(i + 1..i + 3)
                    .ok_or(Error::Malformed("short percent escape"))?;
                let hi = (hex[0] as char)
                    .to_digit(16)
                    .ok_or(Error::Malformed("bad percent escape"))?;
                let lo = (hex[1] as char)
                    .to_digit(16)
                    .ok_or(Error::Malformed("bad percent escape"))?;
                let byte = (hi * 16 + lo) as u8;
                if byte == 0 {
                    return Err(Error::Malformed("NUL byte in percent escape"));
                }
                out.push(byte);
                i += 3;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Percent-encode a string.
///
/// Unreserved characters (`A-Z a-z 0-9 - _ . ~`) pass through, a space
/// becomes `+`, everything else is escaped byte-wise.
pub fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{b:02x}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plus_and_hex() {
        assert_eq!(urldecode("%4e+foo").unwrap(), b"N foo");
        assert_eq!(urldecode("a%2Bb").unwrap(), b"a+b");
        assert_eq!(urldecode("").unwrap(), b"");
    }

    #[test]
    fn refuses_embedded_nul() {
        assert!(urldecode("abc%00def").is_err());
    }

    #[test]
    fn refuses_short_and_bad_hex() {
        assert!(urldecode("abc%1").is_err());
        assert!(urldecode("abc%").is_err());
        assert!(urldecode("abc%zz").is_err());
    }

    #[test]
    fn encode_decode_round_trip() {
        // For input free of '%' and '+', decode(encode(x)) == x.
        for s in ["hello world", "a&b=c;d", "ünïcode", "tilde~dot."] {
            assert_eq!(urldecode(&urlencode(s)).unwrap(), s.as_bytes());
        }
    }
}
