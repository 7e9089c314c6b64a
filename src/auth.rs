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

//! HTTP authorization.
//!
//! The `Authorization` header is parsed inside the sandboxed worker
//! ([`parse_authorization`]); the responder only ever sees the
//! already-structured record and validates it against its secret
//! (RFC 2617 Basic and Digest, including `MD5-sess` and the `auth` /
//! `auth-int` quality-of-protection modes).

use crate::{Request, env::Method};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use md5::{Digest as _, Md5};

/// Digest hash algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum HttpAlg {
    /// Plain MD5 (the default when unspecified or unrecognized).
    #[default]
    Md5 = 0,
    /// `MD5-sess`: the session variant of RFC 2617 section 3.2.2.2.
    Md5Sess = 1,
}

impl HttpAlg {
    pub(crate) fn from_u32(v: u32) -> Self {
        if v == 1 { HttpAlg::Md5Sess } else { HttpAlg::Md5 }
    }
}

/// Digest quality of protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum HttpQop {
    /// No qop directive (RFC 2069 compatibility mode).
    #[default]
    None = 0,
    /// `auth`: authentication only.
    Auth = 1,
    /// `auth-int`: authentication with body integrity.
    AuthInt = 2,
}

impl HttpQop {
    pub(crate) fn from_u32(v: u32) -> Self {
        match v {
            1 => HttpQop::Auth,
            2 => HttpQop::AuthInt,
            _ => HttpQop::None,
        }
    }
}

/// Parsed components of a Digest authorization header.
#[derive(Debug, Default)]
pub struct DigestAuth {
    pub alg: HttpAlg,
    pub qop: HttpQop,
    pub user: String,
    pub uri: String,
    pub realm: String,
    pub nonce: String,
    pub cnonce: String,
    pub response: String,
    /// The `nc` nonce count; zero when absent or malformed.
    pub count: u32,
    pub opaque: String,
}

/// The authorization scheme and its payload.
#[derive(Debug, Default)]
pub enum AuthData {
    /// No `Authorization` header was present.
    #[default]
    None,
    /// HTTP Basic: the base64 credential blob, forwarded verbatim.
    Basic { response: String },
    /// HTTP Digest.
    Digest(DigestAuth),
    /// A scheme this runtime does not recognize.
    Unknown,
}

/// The parsed authorization record of a request.
#[derive(Debug, Default)]
pub struct HttpAuth {
    /// Whether the header carried the minimum required components.
    pub authorised: bool,
    /// Scheme-specific payload.
    pub data: AuthData,
    /// MD5 of the request body, computed by the worker only when an
    /// `auth-int` digest may need it.
    pub body_digest: Option<[u8; 16]>,
}

impl HttpAuth {
    /// Whether digest validation will require the body hash.
    pub(crate) fn wants_body_digest(&self) -> bool {
        self.authorised
            && matches!(
                self.data,
                AuthData::Digest(DigestAuth {
                    qop: HttpQop::AuthInt,
                    ..
                })
            )
    }
}

/// Scanner over the header value.
struct Cursor<'a> {
    s: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Self {
        Self {
            s: s.as_bytes(),
            pos: 0,
        }
    }

    fn done(&self) -> bool {
        self.pos >= self.s.len()
    }

    fn peek(&self) -> u8 {
        self.s.get(self.pos).copied().unwrap_or(0)
    }

    fn skip_ws(&mut self) {
        while !self.done() && self.peek().is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    /// The next token: non-whitespace, non-delimiter characters.  The
    /// delimiter, if present, is consumed; so is surrounding space.
    fn next_tok(&mut self, delim: u8) -> &'a str {
        self.skip_ws();
        let start = self.pos;
        while !self.done() && self.peek() != delim && !self.peek().is_ascii_whitespace() {
            self.pos += 1;
        }
        let tok = std::str::from_utf8(&self.s[start..self.pos]).unwrap_or("");
        if !self.done() && self.peek() == delim {
            self.pos += 1;
        }
        self.skip_ws();
        tok
    }

    /// A quoted-string or bare value, leaving the cursor past the
    /// following comma separator.
    fn next_value(&mut self) -> &'a str {
        if self.done() {
            return "";
        }
        let quoted = self.peek() == b'"';
        if quoted {
            self.pos += 1;
        }
        let start = self.pos;
        while !self.done() {
            let c = self.peek();
            if quoted && c == b'"' && self.s.get(self.pos.wrapping_sub(1)) != Some(&b'\\') {
                break;
            }
            if !quoted && (c.is_ascii_whitespace() || c == b',') {
                break;
            }
            self.pos += 1;
        }
        let val = std::str::from_utf8(&self.s[start..self.pos]).unwrap_or("");
        if quoted && self.peek() == b'"' {
            self.pos += 1;
        }
        self.skip_ws();
        if self.peek() == b',' {
            self.pos += 1;
        }
        self.skip_ws();
        val
    }

    /// The 8-digit hex nonce count of RFC 7616 section 3.4; zero on
    /// any malformation.
    fn next_count(&mut self) -> u32 {
        let v = self.next_value();
        if v.len() != 8 {
            return 0;
        }
        u32::from_str_radix(v, 16).unwrap_or(0)
    }
}

/// Parse a raw `Authorization` header value.
///
/// Never fails: an absent header yields [`AuthData::None`], an
/// unrecognized scheme [`AuthData::Unknown`], and a Digest missing its
/// required components is carried with `authorised` unset.
pub fn parse_authorization(header: Option<&str>) -> HttpAuth {
    let Some(header) = header.filter(|h| !h.is_empty()) else {
        return HttpAuth::default();
    };

    let mut cur = Cursor::new(header);
    let scheme = cur.next_tok(0);

    if scheme.eq_ignore_ascii_case("basic") {
        let response = &header[cur.pos..];
        return HttpAuth {
            authorised: !response.is_empty(),
            data: AuthData::Basic {
                response: response.to_string(),
            },
            body_digest: None,
        };
    }
    if !scheme.eq_ignore_ascii_case("digest") {
        return HttpAuth {
            authorised: false,
            data: AuthData::Unknown,
            body_digest: None,
        };
    }

    let mut d = DigestAuth::default();
    while !cur.done() {
        let key = cur.next_tok(b'=');
        if key.eq_ignore_ascii_case("username") {
            d.user = cur.next_value().to_string();
        } else if key.eq_ignore_ascii_case("realm") {
            d.realm = cur.next_value().to_string();
        } else if key.eq_ignore_ascii_case("nonce") {
            d.nonce = cur.next_value().to_string();
        } else if key.eq_ignore_ascii_case("cnonce") {
            d.cnonce = cur.next_value().to_string();
        } else if key.eq_ignore_ascii_case("response") {
            d.response = cur.next_value().to_string();
        } else if key.eq_ignore_ascii_case("uri") {
            d.uri = cur.next_value().to_string();
        } else if key.eq_ignore_ascii_case("algorithm") {
            let v = cur.next_value();
            d.alg = if v.eq_ignore_ascii_case("MD5-sess") {
                HttpAlg::Md5Sess
            } else {
                HttpAlg::Md5
            };
        } else if key.eq_ignore_ascii_case("qop") {
            let v = cur.next_value();
            d.qop = if v.eq_ignore_ascii_case("auth") {
                HttpQop::Auth
            } else if v.eq_ignore_ascii_case("auth-int") {
                HttpQop::AuthInt
            } else {
                HttpQop::None
            };
        } else if key.eq_ignore_ascii_case("nc") {
            d.count = cur.next_count();
        } else if key.eq_ignore_ascii_case("opaque") {
            d.opaque = cur.next_value().to_string();
        } else {
            cur.next_value();
        }
    }

    // Minimum requirements, then the per-mode extras.
    let mut authorised = !d.user.is_empty()
        && !d.realm.is_empty()
        && !d.nonce.is_empty()
        && !d.response.is_empty()
        && !d.uri.is_empty();
    if authorised && d.alg == HttpAlg::Md5Sess {
        authorised = !d.cnonce.is_empty();
    }
    if authorised && matches!(d.qop, HttpQop::Auth | HttpQop::AuthInt) {
        authorised = d.count != 0 && !d.cnonce.is_empty();
    }

    HttpAuth {
        authorised,
        data: AuthData::Digest(d),
        body_digest: None,
    }
}

/// Outcome of checking credentials against a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCheck {
    /// The request carries no usable record of the required scheme.
    NotApplicable,
    /// The credentials match.
    Match,
    /// The credentials do not match.
    Mismatch,
}

fn md5_hex(parts: &[&[u8]]) -> String {
    let mut h = Md5::new();
    for p in parts {
        h.update(p);
    }
    hex::encode(h.finalize())
}

/// Validate an HTTP Basic authorization against a user and password.
pub fn validate_basic(req: &Request, user: &str, pass: &str) -> AuthCheck {
    let AuthData::Basic { response } = &req.rawauth.data else {
        return AuthCheck::NotApplicable;
    };
    if req.method == Method::Unknown || !req.rawauth.authorised {
        return AuthCheck::NotApplicable;
    }

    let expect = BASE64.encode(format!("{user}:{pass}"));
    if &expect == response {
        AuthCheck::Match
    } else {
        AuthCheck::Mismatch
    }
}

/// Validate an HTTP Digest authorization against a plaintext password.
pub fn validate_digest(req: &Request, pass: &str) -> AuthCheck {
    let AuthData::Digest(d) = &req.rawauth.data else {
        return AuthCheck::NotApplicable;
    };
    if req.method == Method::Unknown || !req.rawauth.authorised {
        return AuthCheck::NotApplicable;
    }
    let ha1 = md5_hex(&[
        d.user.as_bytes(),
        b":",
        d.realm.as_bytes(),
        b":",
        pass.as_bytes(),
    ]);
    validate_digest_hash(req, &ha1)
}

/// Validate an HTTP Digest authorization against a precomputed
/// `H(user:realm:password)` hex string, so the plaintext password need
/// not be kept around.
pub fn validate_digest_hash(req: &Request, ha1_hex: &str) -> AuthCheck {
    let AuthData::Digest(d) = &req.rawauth.data else {
        return AuthCheck::NotApplicable;
    };
    let Some(method) = req.method.name() else {
        return AuthCheck::NotApplicable;
    };
    if !req.rawauth.authorised {
        return AuthCheck::NotApplicable;
    }
    check_digest(method, d, ha1_hex, req.rawauth.body_digest)
}

/// Recompute the RFC 2617 digest over exactly the fields received and
/// compare it to the client's response.
pub(crate) fn check_digest(
    method: &str,
    d: &DigestAuth,
    ha1_hex: &str,
    body_digest: Option<[u8; 16]>,
) -> AuthCheck {
    // MD5-sess folds the nonces into the credential hash.
    let skey1 = if d.alg == HttpAlg::Md5Sess {
        md5_hex(&[
            ha1_hex.as_bytes(),
            b":",
            d.nonce.as_bytes(),
            b":",
            d.cnonce.as_bytes(),
        ])
    } else {
        ha1_hex.to_string()
    };

    // auth-int additionally binds the body hash into HA2.
    let skey2 = if d.qop == HttpQop::AuthInt {
        let Some(body) = body_digest else {
            return AuthCheck::NotApplicable;
        };
        md5_hex(&[
            method.as_bytes(),
            b":",
            d.uri.as_bytes(),
            b":",
            hex::encode(body).as_bytes(),
        ])
    } else {
        md5_hex(&[method.as_bytes(), b":", d.uri.as_bytes()])
    };

    let expect = match d.qop {
        HttpQop::Auth | HttpQop::AuthInt => {
            let count = format!("{:08x}", d.count);
            let qop = if d.qop == HttpQop::AuthInt {
                "auth-int"
            } else {
                "auth"
            };
            md5_hex(&[
                skey1.as_bytes(),
                b":",
                d.nonce.as_bytes(),
                b":",
                count.as_bytes(),
                b":",
                d.cnonce.as_bytes(),
                b":",
                qop.as_bytes(),
                b":",
                skey2.as_bytes(),
            ])
        }
        HttpQop::None => md5_hex(&[
            skey1.as_bytes(),
            b":",
            d.nonce.as_bytes(),
            b":",
            skey2.as_bytes(),
        ]),
    };

    if expect == d.response {
        AuthCheck::Match
    } else {
        AuthCheck::Mismatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_header() {
        let auth = parse_authorization(None);
        assert!(!auth.authorised);
        assert!(matches!(auth.data, AuthData::None));
    }

    #[test]
    fn basic_forwards_blob() {
        let auth = parse_authorization(Some("Basic dXNlcjpwYXNz"));
        assert!(auth.authorised);
        match auth.data {
            AuthData::Basic { response } => assert_eq!(response, "dXNlcjpwYXNz"),
            other => panic!("not basic: {other:?}"),
        }
    }

    #[test]
    fn basic_empty_not_authorised() {
        let auth = parse_authorization(Some("Basic   "));
        assert!(!auth.authorised);
    }

    #[test]
    fn unknown_scheme() {
        let auth = parse_authorization(Some("Bearer tok"));
        assert!(matches!(auth.data, AuthData::Unknown));
        assert!(!auth.authorised);
    }

    #[test]
    fn digest_full() {
        let auth = parse_authorization(Some(
            "Digest username=\"u\", realm=\"r\", nonce=\"n\", uri=\"/x\", \
             response=\"abc\", qop=auth-int, nc=00000001, cnonce=\"c\", \
             algorithm=MD5, opaque=\"o\"",
        ));
        assert!(auth.authorised);
        assert!(auth.wants_body_digest());
        let AuthData::Digest(d) = auth.data else {
            panic!("not digest");
        };
        assert_eq!(d.user, "u");
        assert_eq!(d.realm, "r");
        assert_eq!(d.nonce, "n");
        assert_eq!(d.uri, "/x");
        assert_eq!(d.response, "abc");
        assert_eq!(d.qop, HttpQop::AuthInt);
        assert_eq!(d.count, 1);
        assert_eq!(d.cnonce, "c");
        assert_eq!(d.opaque, "o");
    }

    #[test]
    fn digest_qop_requires_nc_and_cnonce() {
        let auth = parse_authorization(Some(
            "Digest username=\"u\", realm=\"r\", nonce=\"n\", uri=\"/x\", \
             response=\"abc\", qop=auth",
        ));
        assert!(!auth.authorised);
    }

    #[test]
    fn digest_malformed_nc_is_zero() {
        let auth = parse_authorization(Some(
            "Digest username=\"u\", realm=\"r\", nonce=\"n\", uri=\"/x\", \
             response=\"abc\", nc=xyz",
        ));
        let AuthData::Digest(d) = auth.data else {
            panic!("not digest");
        };
        assert_eq!(d.count, 0);
    }

    #[test]
    fn digest_rfc2617_example_matches() {
        // The worked example of RFC 2617 section 3.5.
        let auth = parse_authorization(Some(
            "Digest username=\"Mufasa\", realm=\"testrealm@host.com\", \
             nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", \
             uri=\"/dir/index.html\", qop=auth, nc=00000001, \
             cnonce=\"0a4f113b\", \
             response=\"6629fae49393a05397450978507c4ef1\", \
             opaque=\"5ccc069c403ebaf9f0171e9517f40e41\"",
        ));
        assert!(auth.authorised);
        let AuthData::Digest(d) = &auth.data else {
            panic!("not digest");
        };

        let ha1 = md5_hex(&[b"Mufasa:testrealm@host.com:Circle Of Life"]);
        assert_eq!(check_digest("GET", d, &ha1, None), AuthCheck::Match);

        let wrong = md5_hex(&[b"Mufasa:testrealm@host.com:circle of life"]);
        assert_eq!(check_digest("GET", d, &wrong, None), AuthCheck::Mismatch);
    }

    #[test]
    fn digest_auth_int_binds_body() {
        let ha1 = md5_hex(&[b"u:r:secret"]);
        let body: [u8; 16] = Md5::digest(b"hello").into();

        // Build the expected response by the RFC 2617 formula, written
        // out independently of the checker.
        let ha2 = md5_hex(&[
            b"POST:/x:",
            hex::encode(body).as_bytes(),
        ]);
        let response = md5_hex(&[
            ha1.as_bytes(),
            b":n:00000001:c:auth-int:",
            ha2.as_bytes(),
        ]);

        let d = DigestAuth {
            alg: HttpAlg::Md5,
            qop: HttpQop::AuthInt,
            user: "u".into(),
            uri: "/x".into(),
            realm: "r".into(),
            nonce: "n".into(),
            cnonce: "c".into(),
            response,
            count: 1,
            opaque: String::new(),
        };

        assert_eq!(check_digest("POST", &d, &ha1, Some(body)), AuthCheck::Match);

        // One altered body byte must break the digest.
        let tampered: [u8; 16] = Md5::digest(b"hellO").into();
        assert_eq!(
            check_digest("POST", &d, &ha1, Some(tampered)),
            AuthCheck::Mismatch
        );
        // And a missing body hash cannot validate at all.
        assert_eq!(check_digest("POST", &d, &ha1, None), AuthCheck::NotApplicable);
    }

    #[test]
    fn digest_md5_sess_requires_cnonce_mixing() {
        let ha1 = md5_hex(&[b"u:r:pw"]);
        let skey1 = md5_hex(&[ha1.as_bytes(), b":n:c"]);
        let ha2 = md5_hex(&[b"GET:/y"]);
        let response = md5_hex(&[skey1.as_bytes(), b":n:", ha2.as_bytes()]);

        let d = DigestAuth {
            alg: HttpAlg::Md5Sess,
            qop: HttpQop::None,
            user: "u".into(),
            uri: "/y".into(),
            realm: "r".into(),
            nonce: "n".into(),
            cnonce: "c".into(),
            response,
            count: 0,
            opaque: String::new(),
        };
        assert_eq!(check_digest("GET", &d, &ha1, None), AuthCheck::Match);
    }

    #[test]
    fn digest_unquoted_values() {
        let auth = parse_authorization(Some(
            "Digest username=u,realm=r,nonce=n,uri=/x,response=abc",
        ));
        assert!(auth.authorised);
        let AuthData::Digest(d) = auth.data else {
            panic!("not digest");
        };
        assert_eq!(d.user, "u");
        assert_eq!(d.uri, "/x");
    }
}
