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

//! The sandboxed parser worker.
//!
//! The worker is the only process that ever runs a parser over
//! untrusted bytes.  It reads the raw request (CGI: inherited
//! environment and stdin; FastCGI: reframed record stream from the
//! control process), validates fields, and emits the typed record
//! stream the responder reads back in the same order.

use crate::{
    Error, Result,
    auth::{self, AuthData, DigestAuth, HttpAuth},
    env::{self, EnvPair, Method, RequestHeader, Scheme},
    field::{Field, FieldKey, FieldState, InputKind, Parsed, parsed_tag},
    form::{self, FieldSink},
    ipc::Stream,
    multipart::{self, Mime},
    record::{self, BeginRequestBody, Header, RecordType},
};
use bytes::BytesMut;
use md5::{Digest as _, Md5};
use tracing::warn;

/// Validates parsed fields against the key table and serializes them
/// onto the responder stream.  The first transport error sticks; the
/// parsers keep running but nothing further is written.
struct Emitter<'a> {
    out: &'a mut Stream,
    keys: &'a [FieldKey],
    mimes: &'a [&'a str],
    kind: InputKind,
    err: Option<Error>,
}

impl<'a> Emitter<'a> {
    fn new(out: &'a mut Stream, keys: &'a [FieldKey], mimes: &'a [&'a str]) -> Self {
        Self {
            out,
            keys,
            mimes,
            kind: InputKind::Form,
            err: None,
        }
    }

    fn take_err(&mut self) -> Result<()> {
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn emit(&mut self, key: &str, val: Vec<u8>, mime: Option<&Mime>) -> Result<()> {
        let mut field = Field {
            key: key.to_string(),
            keypos: self.keys.len(),
            val,
            file: mime.and_then(|m| m.file.clone()),
            ctype: mime.and_then(|m| m.ctype.clone()),
            ctypepos: mime.map_or(self.mimes.len(), |m| m.ctypepos),
            xcode: mime.and_then(|m| m.xcode.clone()),
            state: FieldState::Unchecked,
            parsed: Parsed::None,
        };

        // Look the key up; when it carries a validator, run it and
        // record the outcome.  Either way keypos identifies the key,
        // or holds the table length if nothing matched.
        for (i, keydef) in self.keys.iter().enumerate() {
            if keydef.name != field.key {
                continue;
            }
            field.keypos = i;
            if let Some(validate) = keydef.validate {
                if validate(&mut field) {
                    field.state = FieldState::Valid;
                } else {
                    field.state = FieldState::Invalid;
                    field.parsed = Parsed::None;
                }
            }
            break;
        }

        self.out.write_u32(self.kind as u32)?;
        self.out.write_word(Some(&field.key))?;
        self.out.write_word_bytes(&field.val)?;
        self.out.write_u32(field.state as u32)?;

        let tag = match (field.state, field.parsed) {
            (FieldState::Valid, Parsed::Int(_)) => parsed_tag::INT,
            (FieldState::Valid, Parsed::Str(_)) => parsed_tag::STR,
            (FieldState::Valid, Parsed::Double(_)) => parsed_tag::DOUBLE,
            _ => parsed_tag::NONE,
        };
        self.out.write_u32(tag)?;
        self.out.write_usize(field.keypos)?;

        if field.state == FieldState::Valid {
            match field.parsed {
                Parsed::Int(i) => self.out.write_i64(i)?,
                Parsed::Double(d) => self.out.write_f64(d)?,
                Parsed::Str(off) => {
                    debug_assert!(off <= field.val.len());
                    self.out.write_usize(off)?;
                }
                Parsed::None => {}
            }
        }

        self.out.write_word(field.file.as_deref())?;
        self.out.write_word(field.ctype.as_deref())?;
        self.out.write_usize(field.ctypepos)?;
        self.out.write_word(field.xcode.as_deref())?;
        Ok(())
    }
}

impl FieldSink for Emitter<'_> {
    fn field(&mut self, key: &str, val: Vec<u8>, mime: Option<&Mime>) {
        if self.err.is_some() {
            return;
        }
        if let Err(e) = self.emit(key, val, mime) {
            self.err = Some(e);
        }
    }
}

/// Emit every `HTTP_*` variable: count first, then per header the
/// recognized-header tag, the reconstructed HTTP name, and the value.
/// Zero-length names are disallowed per RFC 3875 section 4.1.18.
fn emit_env(out: &mut Stream, envs: &[EnvPair]) -> Result<()> {
    let heads: Vec<&EnvPair> = envs
        .iter()
        .filter(|e| e.key.len() > 5 && e.key.starts_with("HTTP_"))
        .collect();

    out.write_usize(heads.len())?;
    for pair in heads {
        let requ = RequestHeader::from_cgi(&pair.key)
            .map_or(RequestHeader::COUNT as u32, |h| h as u32);
        out.write_u32(requ)?;
        out.write_word(Some(&env::http_header_name(&pair.key[5..])))?;
        out.write_word(Some(&pair.val))?;
    }
    Ok(())
}

/// Emit the request method (RFC 3875 section 4.1.12; GET if missing,
/// the unknown sentinel preserved otherwise).
fn emit_method(out: &mut Stream, envs: &[EnvPair]) -> Result<Method> {
    let method = env::get(envs, "REQUEST_METHOD").map_or(Method::Get, Method::parse);
    out.write_u32(method as u32)?;
    Ok(method)
}

/// Emit the webserver's authentication type (RFC 3875 section 4.1.1).
fn emit_auth_type(out: &mut Stream, envs: &[EnvPair]) -> Result<()> {
    let tag = match env::get(envs, "AUTH_TYPE") {
        None => 0,
        Some("basic") => 1,
        Some("digest") => 2,
        Some(_) => 3,
    };
    out.write_u32(tag)
}

/// Emit the parsed raw authorization record.
fn emit_rawauth(out: &mut Stream, auth: &HttpAuth) -> Result<()> {
    match &auth.data {
        AuthData::None => out.write_u32(0),
        AuthData::Basic { response } => {
            out.write_u32(1)?;
            out.write_u32(auth.authorised as u32)?;
            if auth.authorised {
                out.write_word(Some(response))?;
            }
            Ok(())
        }
        AuthData::Digest(d) => {
            out.write_u32(2)?;
            out.write_u32(auth.authorised as u32)?;
            if auth.authorised {
                emit_digest(out, d)?;
            }
            Ok(())
        }
        AuthData::Unknown => out.write_u32(3),
    }
}

fn emit_digest(out: &mut Stream, d: &DigestAuth) -> Result<()> {
    out.write_u32(d.alg as u32)?;
    out.write_u32(d.qop as u32)?;
    out.write_word(Some(&d.user))?;
    out.write_word(Some(&d.uri))?;
    out.write_word(Some(&d.realm))?;
    out.write_word(Some(&d.nonce))?;
    out.write_word(Some(&d.cnonce))?;
    out.write_word(Some(&d.response))?;
    out.write_u32(d.count)?;
    out.write_word(Some(&d.opaque))
}

/// Emit the scheme.  `HTTPS=on` is the only somewhat reliable signal;
/// `SERVER_PROTOCOL` does not carry it.
fn emit_scheme(out: &mut Stream, envs: &[EnvPair]) -> Result<()> {
    let https = env::get(envs, "HTTPS").is_some_and(|v| v.eq_ignore_ascii_case("on"));
    out.write_u32(if https { Scheme::Https } else { Scheme::Http } as u32)
}

/// Emit the remote address (RFC 3875 section 4.1.8), falling back to
/// the loopback on protocol violation.
fn emit_remote(out: &mut Stream, envs: &[EnvPair]) -> Result<()> {
    let remote = env::get(envs, "REMOTE_ADDR").unwrap_or_else(|| {
        warn!("RFC warning: remote address not set");
        "127.0.0.1"
    });
    out.write_word(Some(remote))
}

/// Emit the full `PATH_INFO` then its derived parts: the suffix after
/// the final dot, the first path component, and the remainder.
fn emit_path(out: &mut Stream, envs: &[EnvPair]) -> Result<()> {
    let full = env::get(envs, "PATH_INFO").unwrap_or("");
    out.write_word(Some(full))?;

    let cp = full.strip_prefix('/').unwrap_or(full);
    if cp.is_empty() {
        // Suffix, base path, and path part.
        out.write_word(None)?;
        out.write_word(None)?;
        return out.write_word(None);
    }

    // Scan backwards to the nearest '.' or '/': a dot marks a suffix
    // belonging to the last component.
    let bytes = cp.as_bytes();
    let mut ep = bytes.len() - 1;
    while ep > 0 && bytes[ep] != b'/' && bytes[ep] != b'.' {
        ep -= 1;
    }

    let (stem, suffix) = if bytes[ep] == b'.' {
        (&cp[..ep], Some(&cp[ep + 1..]))
    } else {
        (cp, None)
    };
    out.write_word(suffix)?;

    match stem.split_once('/') {
        Some((page, path)) => {
            out.write_word(Some(page))?;
            out.write_word(Some(path))
        }
        None => {
            out.write_word(Some(stem))?;
            out.write_word(None)
        }
    }
}

/// Emit the script name (RFC 3875 section 4.1.13), empty on error.
fn emit_scriptname(out: &mut Stream, envs: &[EnvPair]) -> Result<()> {
    let name = env::get(envs, "SCRIPT_NAME").unwrap_or_else(|| {
        warn!("RFC warning: script name not set");
        ""
    });
    out.write_word(Some(name))
}

/// Emit the requested host (RFC 7230 section 5.4), `localhost` if the
/// webserver forwarded none.
fn emit_host(out: &mut Stream, envs: &[EnvPair]) -> Result<()> {
    let host = env::get(envs, "HTTP_HOST").unwrap_or_else(|| {
        warn!("RFC warning: host not set");
        "localhost"
    });
    out.write_word(Some(host))
}

/// Emit the server port (RFC 3875 section 4.1.15), 80 when missing or
/// malformed.
fn emit_port(out: &mut Stream, envs: &[EnvPair]) -> Result<()> {
    let port = match env::get(envs, "SERVER_PORT") {
        Some(v) => v.parse::<u16>().unwrap_or_else(|_| {
            warn!("RFC warning: invalid server port value");
            80
        }),
        None => {
            warn!("RFC warning: server port not set");
            80
        }
    };
    out.write_u16(port)
}

/// Emit the body MD5 used by `auth-int` digest validation, or a
/// zero-length marker when no digest will be needed.
fn emit_body_md5(out: &mut Stream, body: &[u8], wanted: bool) -> Result<()> {
    if !wanted {
        return out.write_usize(0);
    }
    let digest: [u8; 16] = Md5::digest(body).into();
    out.write_usize(digest.len())?;
    out.write_full(&digest)
}

/// The request body, however the transport delivered it.
pub(crate) enum Body<'a> {
    /// CGI: not yet read; drained from this stream up to the reported
    /// content length.
    Cgi(&'a mut Stream),
    /// FastCGI: already accumulated from `STDIN` records.
    Fcgi(Vec<u8>),
}

/// Emit one raw body as a single field with an empty key, carrying the
/// unrecognized content type verbatim.
fn parse_raw_body(emitter: &mut Emitter<'_>, ctype: &str, body: Vec<u8>) {
    let mime = Mime {
        ctype: Some(ctype.to_string()),
        ctypepos: multipart::str2ctype(Some(ctype), emitter.mimes),
        ..Mime::default()
    };
    emitter.field("", body, Some(&mime));
}

/// Parse and emit the message body, most complex part first: the MD5
/// marker, then the fields the content type dictates.
fn emit_body(
    emitter: &mut Emitter<'_>,
    envs: &[EnvPair],
    method: Method,
    body: Body<'_>,
    md5_wanted: bool,
) -> Result<()> {
    // CONTENT_LENGTH must be a valid integer; zero on error
    // (RFC 3875 section 4.1.2).
    let len = env::get(envs, "CONTENT_LENGTH")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if len == 0 {
        emit_body_md5(emitter.out, b"", md5_wanted)?;
        return Ok(());
    }

    let body = match body {
        Body::Cgi(input) => {
            let b = input.read_at_most(len)?;
            if b.len() < len {
                warn!(
                    have = b.len(),
                    specified = len,
                    "RFC warning: content size mismatch"
                );
            }
            b
        }
        Body::Fcgi(b) => {
            if b.len() != len {
                warn!(
                    have = b.len(),
                    specified = len,
                    "RFC warning: real and reported content lengths differ"
                );
            }
            b
        }
    };

    emit_body_md5(emitter.out, &body, md5_wanted)?;

    // Only the three main content types are parsed into pairs
    // (RFC 3875 section 4.1.3; HTML5 section 4.10); anything else is
    // forwarded as one opaque field.
    emitter.kind = InputKind::Form;
    match env::get(envs, "CONTENT_TYPE") {
        Some(ct) if ct.eq_ignore_ascii_case("application/x-www-form-urlencoded") => {
            form::parse_pairs_urlenc(emitter, &String::from_utf8_lossy(&body));
        }
        Some(ct)
            if ct
                .get(..19)
                .is_some_and(|p| p.eq_ignore_ascii_case("multipart/form-data")) =>
        {
            let params = ct[19..].to_string();
            let mimes = emitter.mimes;
            multipart::parse_multi(emitter, &params, &body, mimes);
        }
        Some(ct) if method == Method::Post && ct.eq_ignore_ascii_case("text/plain") => {
            form::parse_pairs_text(emitter, &String::from_utf8_lossy(&body));
        }
        Some(ct) => {
            let ct = ct.to_string();
            parse_raw_body(emitter, &ct, body);
        }
        None => parse_raw_body(emitter, "application/octet-stream", body),
    }
    emitter.take_err()
}

/// Even POST requests may carry `QUERY_STRING` elements; they share
/// the body field space.
fn emit_query(emitter: &mut Emitter<'_>, envs: &[EnvPair]) -> Result<()> {
    emitter.kind = InputKind::Query;
    if let Some(qs) = env::get(envs, "QUERY_STRING") {
        let qs = qs.to_string();
        form::parse_pairs_urlenc(emitter, &qs);
    }
    emitter.take_err()
}

/// Cookies come last; same syntax family, separate namespace.
fn emit_cookies(emitter: &mut Emitter<'_>, envs: &[EnvPair]) -> Result<()> {
    emitter.kind = InputKind::Cookie;
    if let Some(ck) = env::get(envs, "HTTP_COOKIE") {
        let ck = ck.to_string();
        form::parse_pairs_cookie(emitter, &ck);
    }
    emitter.take_err()
}

/// Emit the whole responder stream for one request, in the fixed
/// order the responder reads it back.
pub(crate) fn emit_request(
    out: &mut Stream,
    envs: &[EnvPair],
    body: Body<'_>,
    keys: &[FieldKey],
    mimes: &[&str],
) -> Result<()> {
    emit_env(out, envs)?;
    let method = emit_method(out, envs)?;
    emit_auth_type(out, envs)?;

    let rawauth = auth::parse_authorization(env::get(envs, "HTTP_AUTHORIZATION"));
    emit_rawauth(out, &rawauth)?;
    let md5_wanted = rawauth.wants_body_digest();

    emit_scheme(out, envs)?;
    emit_remote(out, envs)?;
    emit_path(out, envs)?;
    emit_scriptname(out, envs)?;
    emit_host(out, envs)?;
    emit_port(out, envs)?;

    let mut emitter = Emitter::new(out, keys, mimes);
    emit_body(&mut emitter, envs, method, body, md5_wanted)?;
    emit_query(&mut emitter, envs)?;
    emit_cookies(&mut emitter, envs)?;

    out.write_u32(InputKind::END)
}

/// CGI worker: parse the inherited environment and stdin, emit one
/// responder stream, and return.
pub(crate) fn run_cgi(
    input: &mut Stream,
    out: &mut Stream,
    keys: &[FieldKey],
    mimes: &[&str],
) -> Result<()> {
    let envs = env::collect();
    emit_request(out, &envs, Body::Cgi(input), keys, mimes)
}

/// Buffered reads from the control process.
///
/// Control reframes whatever it pulls off the webserver socket as
/// `{length; bytes}`; a zero length means the peer connection closed
/// and the request must be abandoned.
struct FcgiBuf<'a> {
    ctl: &'a mut Stream,
    buf: BytesMut,
    pos: usize,
}

impl<'a> FcgiBuf<'a> {
    fn new(ctl: &'a mut Stream) -> Self {
        Self {
            ctl,
            buf: BytesMut::new(),
            pos: 0,
        }
    }

    /// Read ahead until `n` bytes are available, then hand them out.
    fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        while self.pos + n > self.buf.len() {
            let sz = self.ctl.read_usize()?;
            if sz == 0 {
                warn!("FastCGI: connection closed while reading frame");
                return Err(Error::Hup);
            }
            if sz > record::MAX_CONTENT + record::HEADER_LEN + 255 {
                return Err(Error::OutOfMemory);
            }
            let mut chunk = vec![0u8; sz];
            self.ctl.read_full(&mut chunk, false)?;
            self.buf.extend_from_slice(&chunk);
        }
        let out = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(out)
    }

    /// Read one record header.
    fn header(&mut self) -> Result<Header> {
        let raw = self.read(record::HEADER_LEN)?;
        Header::parse(raw[..].try_into().expect("header length"))
    }

    /// Read a record's content, discarding padding.
    fn content(&mut self, hdr: &Header) -> Result<Vec<u8>> {
        let mut data = self.read(hdr.content_length as usize + hdr.padding_length as usize)?;
        data.truncate(hdr.content_length as usize);
        Ok(data)
    }
}

/// Read the `BEGIN_REQUEST` record (FastCGI v1.0 section 5.1),
/// returning the request id.
fn fcgi_begin(fbuf: &mut FcgiBuf<'_>) -> Result<u16> {
    let hdr = fbuf.header()?;
    let rid = hdr.request_id;
    if hdr.rtype != RecordType::BeginRequest {
        warn!(rtype = ?hdr.rtype, "FastCGI: bad type (want BEGIN_REQUEST)");
        return Err(Error::Malformed("expected FastCGI begin-request"));
    }
    let body = BeginRequestBody::parse(&fbuf.content(&hdr)?)?;
    if body.role != record::ROLE_RESPONDER {
        warn!(role = body.role, "FastCGI: bad role (want responder)");
        return Err(Error::Malformed("unsupported FastCGI role"));
    }
    if body.flags != 0 {
        warn!(flags = body.flags, "FastCGI: bad flags (want 0)");
        return Err(Error::Malformed("unsupported FastCGI flags"));
    }
    Ok(rid)
}

/// Parse one `PARAMS` record's name-value pairs into the environment
/// (FastCGI v1.0 section 5.2), replacing duplicates.
fn fcgi_params(content: &[u8], envs: &mut Vec<EnvPair>) -> Result<()> {
    let mut pos = 0;
    while pos < content.len() {
        let keysz = record::nv_length(content, &mut pos)?;
        if pos >= content.len() {
            return Err(Error::Malformed("bad FastCGI parameter data"));
        }
        let valsz = record::nv_length(content, &mut pos)?;
        if pos + keysz + valsz > content.len() {
            return Err(Error::Malformed("bad FastCGI parameter data"));
        }

        let key = &content[pos..pos + keysz];
        let val = &content[pos + keysz..pos + keysz + valsz];
        pos += keysz + valsz;

        // No documented precedent for key validity; follow the CGI
        // constraints of RFC 3875 section 4.1 and skip offenders.
        if keysz == 0 {
            warn!("FastCGI warning: empty environment parameter");
            continue;
        }
        let Ok(key) = std::str::from_utf8(key) else {
            warn!("RFC warning: bad character in environment parameters");
            continue;
        };
        if !env::key_ok(key) {
            warn!("RFC warning: bad character in environment parameters");
            continue;
        }

        let val = String::from_utf8_lossy(val).into_owned();
        match envs.iter_mut().find(|e| e.key == key) {
            Some(pair) => pair.val = val,
            None => envs.push(EnvPair {
                key: key.to_string(),
                val,
            }),
        }
    }
    Ok(())
}

/// FastCGI worker: a perpetual loop over the shared control socket.
///
/// Returns `Ok` on clean worker termination (control closed the
/// channel) and an error on protocol violations, which exit the
/// worker so the supervisor may restart it.
pub(crate) fn run_fcgi(
    dat: &mut Stream,
    ctl: &mut Stream,
    keys: &[FieldKey],
    mimes: &[&str],
) -> Result<()> {
    loop {
        // The per-request cookie opens each sequence; EOF here is the
        // clean way out.
        let Some(cookie) = ctl.read_u32_eof()? else {
            warn!("FastCGI: worker process termination");
            return Ok(());
        };

        let mut envs: Vec<EnvPair> = Vec::new();
        let mut stdin_buf: Vec<u8> = Vec::new();

        let outcome = (|| -> Result<u16> {
            let mut fbuf = FcgiBuf::new(ctl);
            let rid = fcgi_begin(&mut fbuf)?;

            // One or more PARAMS records, read before parsing.
            let mut hdr;
            loop {
                hdr = fbuf.header()?;
                if hdr.request_id != rid {
                    warn!("FastCGI: wrong request ID");
                    return Err(Error::Malformed("FastCGI request id mismatch"));
                }
                if hdr.rtype != RecordType::Params {
                    break;
                }
                let content = fbuf.content(&hdr)?;
                fcgi_params(&content, &mut envs)?;
            }

            if hdr.rtype != RecordType::Stdin {
                warn!("FastCGI: bad header type");
                return Err(Error::Malformed("expected FastCGI stdin"));
            }

            // STDIN records accumulate until a zero-length one. Always
            // read the content even when empty to drain the padding.
            loop {
                let content = fbuf.content(&hdr)?;
                if content.is_empty() {
                    break;
                }
                stdin_buf.extend_from_slice(&content);

                hdr = fbuf.header()?;
                if hdr.request_id != rid {
                    warn!("FastCGI: wrong request ID");
                    return Err(Error::Malformed("FastCGI request id mismatch"));
                }
                if hdr.rtype != RecordType::Stdin {
                    warn!("FastCGI: bad header type");
                    return Err(Error::Malformed("expected FastCGI stdin"));
                }
            }
            Ok(rid)
        })();

        let rid = match outcome {
            Ok(rid) => rid,
            Err(Error::Hup) => {
                // Connection severed: tell control and await the next
                // request.
                warn!("FastCGI: connection severed while parsing");
                ctl.write_u32(0)?;
                continue;
            }
            Err(e) => {
                warn!("FastCGI: unrecoverable error parsing records");
                return Err(e);
            }
        };

        // Hand the cookie and request id back, then consume the
        // zero-length trailer frame control always ends with.
        ctl.write_u32(1)?;
        ctl.write_u32(cookie)?;
        ctl.write_u16(rid)?;

        let trailer = ctl.read_usize()?;
        if trailer != 0 {
            warn!("FastCGI: trailer not zero-length");
            return Err(Error::Malformed("bad control trailer"));
        }

        emit_request(dat, &envs, Body::Fcgi(stdin_buf), keys, mimes)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc;
    use std::os::fd::OwnedFd;

    fn pair() -> (Stream, Stream) {
        let (a, b): (OwnedFd, OwnedFd) = ipc::stream_pair().unwrap();
        (Stream::new(a).unwrap(), Stream::new(b).unwrap())
    }

    #[test]
    fn emitter_serializes_validated_field() {
        let (mut w, mut r) = pair();
        static KEYS: [FieldKey; 1] = [FieldKey::new("n", crate::validate::valid_int)];
        let mimes = ["text/plain"];

        let mut em = Emitter::new(&mut w, &KEYS, &mimes);
        em.field("n", b"42".to_vec(), None);
        em.take_err().unwrap();

        assert_eq!(r.read_u32().unwrap(), InputKind::Form as u32);
        assert_eq!(r.read_word().unwrap(), "n");
        assert_eq!(r.read_word_bytes().unwrap(), b"42");
        assert_eq!(r.read_u32().unwrap(), FieldState::Valid as u32);
        assert_eq!(r.read_u32().unwrap(), parsed_tag::INT);
        assert_eq!(r.read_usize().unwrap(), 0);
        assert_eq!(r.read_i64().unwrap(), 42);
        assert_eq!(r.read_word().unwrap(), "");
        assert_eq!(r.read_word().unwrap(), "");
        assert_eq!(r.read_usize().unwrap(), 1);
        assert_eq!(r.read_word().unwrap(), "");
    }

    #[test]
    fn emitter_marks_invalid_without_payload() {
        let (mut w, mut r) = pair();
        static KEYS: [FieldKey; 1] = [FieldKey::new("n", crate::validate::valid_int)];
        let mimes: [&str; 0] = [];

        let mut em = Emitter::new(&mut w, &KEYS, &mimes);
        em.field("n", b"not a number".to_vec(), None);
        em.take_err().unwrap();

        assert_eq!(r.read_u32().unwrap(), InputKind::Form as u32);
        assert_eq!(r.read_word().unwrap(), "n");
        assert_eq!(r.read_word_bytes().unwrap(), b"not a number");
        assert_eq!(r.read_u32().unwrap(), FieldState::Invalid as u32);
        assert_eq!(r.read_u32().unwrap(), parsed_tag::NONE);
        assert_eq!(r.read_usize().unwrap(), 0);
        // No payload follows for invalid fields.
        assert_eq!(r.read_word().unwrap(), "");
    }

    #[test]
    fn params_decode_and_dedup() {
        let mut content = Vec::new();
        for (k, v) in [("A", "1"), ("B", "2"), ("A", "3")] {
            content.push(k.len() as u8);
            content.push(v.len() as u8);
            content.extend_from_slice(k.as_bytes());
            content.extend_from_slice(v.as_bytes());
        }
        let mut envs = Vec::new();
        fcgi_params(&content, &mut envs).unwrap();
        assert_eq!(envs.len(), 2);
        assert_eq!(env::get(&envs, "A"), Some("3"));
        assert_eq!(env::get(&envs, "B"), Some("2"));
    }

    #[test]
    fn params_skip_bad_keys() {
        let mut content = Vec::new();
        // Empty key.
        content.extend_from_slice(&[0, 1, b'x']);
        // Key with a space.
        content.extend_from_slice(&[3, 1]);
        content.extend_from_slice(b"A B");
        content.push(b'y');
        // Good key.
        content.extend_from_slice(&[1, 1, b'K', b'z']);
        let mut envs = Vec::new();
        fcgi_params(&content, &mut envs).unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(env::get(&envs, "K"), Some("z"));
    }

    #[test]
    fn params_truncated_counted_length() {
        // High bit set on the key length with too few bytes behind it.
        let content = [0x80u8, 0x00, 0x01];
        let mut envs = Vec::new();
        assert!(fcgi_params(&content, &mut envs).is_err());
    }

    /// Build one FastCGI record, padding included.
    fn rec(rtype: RecordType, rid: u16, content: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        record::write_stream(&mut v, rtype, rid, content).unwrap();
        v
    }

    fn nv(k: &str, v: &str) -> Vec<u8> {
        let mut out = vec![k.len() as u8, v.len() as u8];
        out.extend_from_slice(k.as_bytes());
        out.extend_from_slice(v.as_bytes());
        out
    }

    /// Drive the perpetual worker over two back-to-back requests, then
    /// a client hangup, then a clean shutdown, playing the control
    /// side of the protocol by hand.
    #[test]
    fn fcgi_worker_sequences() {
        let (ctl_ours, ctl_theirs) = pair();
        let (dat_ours, dat_theirs) = pair();
        let mut ctl = ctl_ours;
        let mut dat = dat_ours;

        let handle = std::thread::spawn(move || {
            let (mut dat, mut ctl) = (dat_theirs, ctl_theirs);
            static KEYS: [FieldKey; 1] = [FieldKey::new("a", crate::validate::valid_int)];
            run_fcgi(&mut dat, &mut ctl, &KEYS, &["text/plain"])
        });

        for rid in [1u16, 2] {
            let cookie = 0xc00c1e00 + rid as u32;
            ctl.write_u32(cookie).unwrap();

            let mut raw = Vec::new();
            let mut begin = vec![0u8; 8];
            begin[..2].copy_from_slice(&record::ROLE_RESPONDER.to_be_bytes());
            raw.extend(rec(RecordType::BeginRequest, rid, &begin));
            let mut params = nv("REQUEST_METHOD", "GET");
            params.extend(nv("QUERY_STRING", &format!("a={rid}")));
            raw.extend(rec(RecordType::Params, rid, &params));
            raw.extend(rec(RecordType::Params, rid, b""));
            raw.extend(rec(RecordType::Stdin, rid, b""));

            // One reframed chunk carrying the whole record sequence.
            ctl.write_usize(raw.len()).unwrap();
            ctl.write_full(&raw).unwrap();

            assert_eq!(ctl.read_u32().unwrap(), 1, "success flag");
            assert_eq!(ctl.read_u32().unwrap(), cookie, "cookie echo");
            assert_eq!(ctl.read_u16().unwrap(), rid, "request id echo");
            ctl.write_usize(0).unwrap();

            let req = crate::request::read_request(&mut dat, 1, 1).unwrap();
            assert_eq!(req.method, crate::env::Method::Get);
            assert_eq!(req.field(0).unwrap().parsed_int(), Some(rid as i64));
        }

        // Hangup mid-request: zero-length frame after the cookie.
        ctl.write_u32(0xdeadbeef).unwrap();
        ctl.write_usize(0).unwrap();
        assert_eq!(ctl.read_u32().unwrap(), 0, "hup reported");

        // Closing the control channel terminates the worker cleanly.
        drop(ctl);
        handle.join().unwrap().unwrap();
    }

    /// An oversized counted-length parameter is a protocol violation:
    /// the worker exits with an error for the supervisor to restart.
    #[test]
    fn fcgi_worker_dies_on_malformed_params() {
        let (ctl_ours, ctl_theirs) = pair();
        let (_dat_ours, dat_theirs) = pair();
        let mut ctl = ctl_ours;

        let handle = std::thread::spawn(move || {
            let (mut dat, mut ctl) = (dat_theirs, ctl_theirs);
            run_fcgi(&mut dat, &mut ctl, &[], &[])
        });

        ctl.write_u32(7).unwrap();
        let mut raw = Vec::new();
        let mut begin = vec![0u8; 8];
        begin[..2].copy_from_slice(&record::ROLE_RESPONDER.to_be_bytes());
        raw.extend(rec(RecordType::BeginRequest, 3, &begin));
        // Key length with the high bit set and only two bytes behind.
        raw.extend(rec(RecordType::Params, 3, &[0x81, 0x00, 0x01]));
        ctl.write_usize(raw.len()).unwrap();
        ctl.write_full(&raw).unwrap();

        assert!(matches!(handle.join().unwrap(), Err(Error::Malformed(_))));
    }
}
