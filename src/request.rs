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

//! The parsed request as the responder sees it.
//!
//! The responder never parses untrusted bytes: it reads the typed
//! record stream the worker emitted, in the same fixed order, with
//! every transmitted index bounds-checked.  Fields live in flat
//! vectors; the per-key buckets are insertion-ordered index lists into
//! them.

use crate::{
    Error, Result, Writer,
    auth::{AuthData, DigestAuth, HttpAlg, HttpAuth, HttpQop},
    env::{Method, RequestHeader, Scheme},
    field::{Field, FieldState, InputKind, Parsed, parsed_tag},
    ipc::Stream,
    output::OutputData,
};
use std::{cell::RefCell, rc::Rc};

/// The webserver-reported authentication type (`AUTH_TYPE`), distinct
/// from the raw `Authorization` header record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum AuthKind {
    #[default]
    None = 0,
    Basic = 1,
    Digest = 2,
    Unknown = 3,
}

impl AuthKind {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => AuthKind::None,
            1 => AuthKind::Basic,
            2 => AuthKind::Digest,
            _ => AuthKind::Unknown,
        }
    }
}

/// One HTTP request header, name already reconstructed from its CGI
/// form.
#[derive(Debug)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

/// One parsed HTTP transaction.
pub struct Request {
    /// Request method; the unknown sentinel survives parsing.
    pub method: Method,
    /// Webserver authentication type.
    pub auth: AuthKind,
    /// Parsed `Authorization` record.
    pub rawauth: HttpAuth,
    /// http or https, from the `HTTPS` variable.
    pub scheme: Scheme,
    /// Every `HTTP_*` header, in transmission order.
    pub headers: Vec<HttpHeader>,
    /// Remote address, `127.0.0.1` if the webserver misbehaved.
    pub remote: String,
    /// Full `PATH_INFO`.
    pub fullpath: String,
    /// Suffix after the final dot of the last path component.
    pub suffix: String,
    /// First path component.
    pub pagename: String,
    /// Path remainder after the first component.
    pub path: String,
    /// Script name (`SCRIPT_NAME`).
    pub pname: String,
    /// Requested host, `localhost` by default.
    pub host: String,
    /// Server port, 80 by default.
    pub port: u16,
    /// Query-string and body fields, in emission order: body fields in
    /// document order, then query fields in URL order.
    pub fields: Vec<Field>,
    /// Cookie fields, in header order.
    pub cookies: Vec<Field>,
    /// Resolved page index, or the page table length.
    pub page: usize,
    /// Resolved MIME index, or the MIME table length.
    pub mime: usize,

    header_map: [Option<usize>; RequestHeader::COUNT],
    fieldmap: Vec<Vec<usize>>,
    fieldnmap: Vec<Vec<usize>>,
    cookiemap: Vec<Vec<usize>>,
    cookienmap: Vec<Vec<usize>>,
    keysz: usize,

    pub(crate) output: Option<Rc<RefCell<OutputData>>>,
    finished: bool,
}

fn none_if_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

/// Read the authorization record, mirroring the worker's emission.
fn read_auth(st: &mut Stream) -> Result<HttpAuth> {
    let tag = st.read_u32()?;
    let mut auth = HttpAuth::default();
    match tag {
        0 => {}
        1 => {
            auth.authorised = st.read_u32()? != 0;
            let response = if auth.authorised {
                st.read_word()?
            } else {
                String::new()
            };
            auth.data = AuthData::Basic { response };
        }
        2 => {
            auth.authorised = st.read_u32()? != 0;
            let mut d = DigestAuth::default();
            if auth.authorised {
                d.alg = HttpAlg::from_u32(st.read_u32()?);
                d.qop = HttpQop::from_u32(st.read_u32()?);
                d.user = st.read_word()?;
                d.uri = st.read_word()?;
                d.realm = st.read_word()?;
                d.nonce = st.read_word()?;
                d.cnonce = st.read_word()?;
                d.response = st.read_word()?;
                d.count = st.read_u32()?;
                d.opaque = st.read_word()?;
            }
            auth.data = AuthData::Digest(d);
        }
        3 => auth.data = AuthData::Unknown,
        _ => return Err(Error::Malformed("invalid authorization tag")),
    }
    Ok(auth)
}

/// Read one field record; mirrors the worker emitter byte for byte.
fn read_field(st: &mut Stream, keysz: usize, mimesz: usize) -> Result<Field> {
    let key = st.read_word()?;
    let val = st.read_word_bytes()?;

    let state =
        FieldState::from_u32(st.read_u32()?).ok_or(Error::Malformed("invalid field state"))?;
    let tag = st.read_u32()?;
    if tag > parsed_tag::NONE {
        return Err(Error::Malformed("invalid field parse type"));
    }
    let keypos = st.read_usize()?;
    if keypos > keysz {
        return Err(Error::Malformed("field key position out of range"));
    }

    let parsed = if state == FieldState::Valid {
        match tag {
            parsed_tag::INT => Parsed::Int(st.read_i64()?),
            parsed_tag::DOUBLE => Parsed::Double(st.read_f64()?),
            parsed_tag::STR => {
                let off = st.read_usize()?;
                if off > val.len() {
                    return Err(Error::Malformed("field string offset out of range"));
                }
                Parsed::Str(off)
            }
            _ => Parsed::None,
        }
    } else {
        Parsed::None
    };

    let file = none_if_empty(st.read_word()?);
    let ctype = none_if_empty(st.read_word()?);
    let ctypepos = st.read_usize()?;
    if ctypepos > mimesz {
        return Err(Error::Malformed("field MIME position out of range"));
    }
    let xcode = none_if_empty(st.read_word()?);

    Ok(Field {
        key,
        keypos,
        val,
        file,
        ctype,
        ctypepos,
        xcode,
        state,
        parsed,
    })
}

/// Read one full request off the worker stream (attributes in fixed
/// order, then the field records up to the end sentinel) and bucket
/// the fields.
pub(crate) fn read_request(st: &mut Stream, keysz: usize, mimesz: usize) -> Result<Request> {
    let reqsz = st.read_usize()?;
    if reqsz > 4096 {
        return Err(Error::OutOfMemory);
    }
    let mut headers = Vec::with_capacity(reqsz);
    let mut header_map = [None; RequestHeader::COUNT];
    for i in 0..reqsz {
        let requ = st.read_u32()?;
        let name = st.read_word()?;
        let value = st.read_word()?;
        if let Some(h) = RequestHeader::from_u32(requ) {
            header_map[h as usize] = Some(i);
        }
        headers.push(HttpHeader { name, value });
    }

    let method = Method::from_u32(st.read_u32()?);
    let auth = AuthKind::from_u32(st.read_u32()?);
    let mut rawauth = read_auth(st)?;
    let scheme = Scheme::from_u32(st.read_u32()?);
    let remote = st.read_word()?;
    let fullpath = st.read_word()?;
    let suffix = st.read_word()?;
    let pagename = st.read_word()?;
    let path = st.read_word()?;
    let pname = st.read_word()?;
    let host = st.read_word()?;
    let port = st.read_u16()?;

    let dgsz = st.read_usize()?;
    if dgsz == 16 {
        let mut digest = [0u8; 16];
        st.read_full(&mut digest, false)?;
        rawauth.body_digest = Some(digest);
    } else if dgsz != 0 {
        return Err(Error::Malformed("invalid body digest length"));
    }

    let mut fields = Vec::new();
    let mut cookies = Vec::new();
    loop {
        let kind = st.read_u32()?;
        if kind == InputKind::END {
            break;
        }
        let kind = InputKind::from_u32(kind).ok_or(Error::Malformed("invalid field kind"))?;
        let field = read_field(st, keysz, mimesz)?;
        match kind {
            InputKind::Cookie => cookies.push(field),
            InputKind::Query | InputKind::Form => fields.push(field),
        }
    }

    // With the vectors fixed, assign named fields into buckets;
    // unvalidated fields count as usable.
    let mut fieldmap = vec![Vec::new(); keysz];
    let mut fieldnmap = vec![Vec::new(); keysz];
    for (i, f) in fields.iter().enumerate() {
        if f.keypos == keysz {
            continue;
        }
        if f.state == FieldState::Invalid {
            fieldnmap[f.keypos].push(i);
        } else {
            fieldmap[f.keypos].push(i);
        }
    }
    let mut cookiemap = vec![Vec::new(); keysz];
    let mut cookienmap = vec![Vec::new(); keysz];
    for (i, f) in cookies.iter().enumerate() {
        if f.keypos == keysz {
            continue;
        }
        if f.state == FieldState::Invalid {
            cookienmap[f.keypos].push(i);
        } else {
            cookiemap[f.keypos].push(i);
        }
    }

    Ok(Request {
        method,
        auth,
        rawauth,
        scheme,
        headers,
        remote,
        fullpath,
        suffix,
        pagename,
        path,
        pname,
        host,
        port,
        fields,
        cookies,
        page: 0,
        mime: 0,
        header_map,
        fieldmap,
        fieldnmap,
        cookiemap,
        cookienmap,
        keysz,
        output: None,
        finished: false,
    })
}

impl Request {
    /// Resolve the page and MIME indices against the caller's tables.
    pub(crate) fn resolve(
        &mut self,
        pages: &[&str],
        default_page: usize,
        suffixes: &[(&str, usize)],
        default_mime: usize,
        mimesz: usize,
    ) {
        self.page = default_page;
        if !self.pagename.is_empty() {
            self.page = pages
                .iter()
                .position(|p| p.eq_ignore_ascii_case(&self.pagename))
                .unwrap_or(pages.len());
        }
        self.mime = default_mime;
        if !self.suffix.is_empty() {
            self.mime = suffixes
                .iter()
                .find(|(s, _)| s.eq_ignore_ascii_case(&self.suffix))
                .map(|(_, m)| *m)
                .unwrap_or(mimesz);
        }
    }

    /// The value of a recognized request header, if present.
    pub fn header(&self, h: RequestHeader) -> Option<&str> {
        self.header_map[h as usize].map(|i| self.headers[i].value.as_str())
    }

    /// The first usable field for a key index.
    pub fn field(&self, key: usize) -> Option<&Field> {
        self.fields_for(key).next()
    }

    /// All usable (valid or unchecked) fields for a key, in insertion
    /// order.
    pub fn fields_for(&self, key: usize) -> impl Iterator<Item = &Field> {
        self.fieldmap
            .get(key)
            .into_iter()
            .flatten()
            .map(|&i| &self.fields[i])
    }

    /// All fields for a key whose validator rejected them.
    pub fn invalid_fields_for(&self, key: usize) -> impl Iterator<Item = &Field> {
        self.fieldnmap
            .get(key)
            .into_iter()
            .flatten()
            .map(|&i| &self.fields[i])
    }

    /// The first usable cookie for a key index.
    pub fn cookie(&self, key: usize) -> Option<&Field> {
        self.cookies_for(key).next()
    }

    /// All usable cookies for a key, in insertion order.
    pub fn cookies_for(&self, key: usize) -> impl Iterator<Item = &Field> {
        self.cookiemap
            .get(key)
            .into_iter()
            .flatten()
            .map(|&i| &self.cookies[i])
    }

    /// All cookies for a key whose validator rejected them.
    pub fn invalid_cookies_for(&self, key: usize) -> impl Iterator<Item = &Field> {
        self.cookienmap
            .get(key)
            .into_iter()
            .flatten()
            .map(|&i| &self.cookies[i])
    }

    /// Demote a body/query field to the invalid bucket of its key,
    /// clearing its typed form.  For application checks that go beyond
    /// what the validator could see.
    pub fn invalidate(&mut self, index: usize) {
        let Some(f) = self.fields.get_mut(index) else {
            return;
        };
        f.state = FieldState::Invalid;
        f.parsed = Parsed::None;
        if f.keypos < self.keysz {
            self.fieldmap[f.keypos].retain(|&i| i != index);
            if !self.fieldnmap[f.keypos].contains(&index) {
                self.fieldnmap[f.keypos].push(index);
            }
        }
    }

    /// Cookie counterpart of [`Request::invalidate`].
    pub fn invalidate_cookie(&mut self, index: usize) {
        let Some(f) = self.cookies.get_mut(index) else {
            return;
        };
        f.state = FieldState::Invalid;
        f.parsed = Parsed::None;
        if f.keypos < self.keysz {
            self.cookiemap[f.keypos].retain(|&i| i != index);
            if !self.cookienmap[f.keypos].contains(&index) {
                self.cookienmap[f.keypos].push(index);
            }
        }
    }

    fn out(&self) -> &Rc<RefCell<OutputData>> {
        self.output.as_ref().expect("request has no output channel")
    }

    /// Emit one response header.  Only legal before the body begins.
    pub fn head(&self, key: &str, value: &str) -> Result<()> {
        self.out().borrow_mut().head(key, value)
    }

    /// Begin the response body, compressing it when the client asked
    /// for gzip with a non-zero quality (RFC 2616 section 14.3).
    pub fn body(&self) -> Result<()> {
        let mut wanted = false;
        if let Some(enc) = self.header(RequestHeader::AcceptEncoding) {
            if let Some(pos) = enc.find("gzip") {
                wanted = true;
                if let Some(q) = enc[pos + 4..].strip_prefix(";q=0") {
                    wanted = q.starts_with('.');
                }
            }
        }

        let mut out = self.out().borrow_mut();
        if wanted && out.enable_compression()? {
            out.head("Content-Encoding", "gzip")?;
        }
        out.begin_body()
    }

    /// Begin the response body with explicit control over compression.
    ///
    /// Without `force` this is a plain transition.  With it the caller
    /// asserts it has already emitted the `Content-Encoding: gzip`
    /// header; the call fails over FastCGI, whose record framing the
    /// encoder cannot compress through.
    pub fn body_compress(&self, force: bool) -> Result<()> {
        let mut out = self.out().borrow_mut();
        if force && !out.enable_compression()? {
            return Err(Error::WriterMisuse);
        }
        out.begin_body()
    }

    /// Append raw bytes to the response body.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.out().borrow_mut().body_write(data)
    }

    /// Append a string to the response body.
    pub fn puts(&self, s: &str) -> Result<()> {
        self.write(s.as_bytes())
    }

    /// Append a single byte to the response body.
    pub fn putc(&self, c: u8) -> Result<()> {
        self.write(&[c])
    }

    /// Obtain a writer handle for an emission front-end.
    ///
    /// # Panics
    ///
    /// Panics if writers have been disabled: requesting one after
    /// [`Request::writer_disable`] is a programming error.
    pub fn writer(&self) -> Writer {
        let out = self.out();
        assert!(
            !out.borrow().disabled,
            "writer requested after writer_disable"
        );
        Writer::new(Rc::clone(out))
    }

    /// Disallow further [`Request::writer`] calls.  Idempotent, and
    /// does not invalidate writers already handed out.
    pub fn writer_disable(&self) {
        self.out().borrow_mut().disabled = true;
    }

    /// Finish the response: drain buffered output and, over FastCGI,
    /// emit the end-of-request records and acknowledge control.
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        let res = self.out().borrow_mut().free(true);
        res
    }
}

impl Drop for Request {
    /// An unfinished request tears down without flushing: buffered
    /// bytes are discarded and the transport is not guaranteed to have
    /// seen anything.
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(out) = &self.output {
            let _ = out.borrow_mut().free(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        env::EnvPair,
        field::FieldKey,
        ipc,
        validate::{valid_int, valid_stringne},
        worker::{Body, emit_request},
    };

    static KEYS: [FieldKey; 3] = [
        FieldKey::new("foo", valid_stringne),
        FieldKey::new("baz", valid_stringne),
        FieldKey::new("n", valid_int),
    ];
    const MIMES: [&str; 2] = ["application/octet-stream", "text/plain"];

    fn env(pairs: &[(&str, &str)]) -> Vec<EnvPair> {
        pairs
            .iter()
            .map(|(k, v)| EnvPair {
                key: k.to_string(),
                val: v.to_string(),
            })
            .collect()
    }

    /// Emit a request from worker code on one end of a socket pair and
    /// read it back on the other, the way the responder does.
    fn round_trip(envs: &[EnvPair], body: &[u8]) -> Request {
        let (a, b) = ipc::stream_pair().unwrap();
        let mut w = ipc::Stream::new(a).unwrap();
        let mut r = ipc::Stream::new(b).unwrap();
        emit_request(&mut w, envs, Body::Fcgi(body.to_vec()), &KEYS, &MIMES).unwrap();
        read_request(&mut r, KEYS.len(), MIMES.len()).unwrap()
    }

    #[test]
    fn urlencoded_post_round_trip() {
        let envs = env(&[
            ("REQUEST_METHOD", "POST"),
            ("CONTENT_TYPE", "application/x-www-form-urlencoded"),
            ("CONTENT_LENGTH", "15"),
            ("HTTP_HOST", "example.org"),
            ("HTTP_ACCEPT_ENCODING", "gzip"),
            ("SERVER_PORT", "8080"),
            ("PATH_INFO", "/sub/index.html"),
            ("SCRIPT_NAME", "/app"),
            ("QUERY_STRING", "n=42"),
            ("HTTP_COOKIE", "sid=abc"),
            ("HTTPS", "on"),
        ]);
        let req = round_trip(&envs, b"foo=bar&baz=qux");

        assert_eq!(req.method, Method::Post);
        assert_eq!(req.scheme, Scheme::Https);
        assert_eq!(req.host, "example.org");
        assert_eq!(req.port, 8080);
        assert_eq!(req.pname, "/app");
        assert_eq!(req.remote, "127.0.0.1");
        assert_eq!(req.fullpath, "/sub/index.html");
        assert_eq!(req.pagename, "sub");
        assert_eq!(req.path, "index");
        assert_eq!(req.suffix, "html");
        assert_eq!(req.header(RequestHeader::AcceptEncoding), Some("gzip"));
        assert_eq!(req.header(RequestHeader::Host), Some("example.org"));

        // Body fields precede query fields; cookies are separate.
        assert_eq!(req.fields.len(), 3);
        assert_eq!(req.fields[0].key, "foo");
        assert_eq!(req.fields[0].parsed_str(), Some("bar"));
        assert_eq!(req.fields[0].state, FieldState::Valid);
        assert_eq!(req.fields[1].key, "baz");
        assert_eq!(req.fields[1].parsed_str(), Some("qux"));
        assert_eq!(req.fields[2].key, "n");
        assert_eq!(req.fields[2].parsed_int(), Some(42));
        assert_eq!(req.cookies.len(), 1);
        assert_eq!(req.cookies[0].key, "sid");
        assert_eq!(req.cookies[0].val, b"abc");

        assert_eq!(req.field(0).unwrap().parsed_str(), Some("bar"));
        assert_eq!(req.field(2).unwrap().parsed_int(), Some(42));
    }

    #[test]
    fn multipart_upload_round_trip() {
        let body = b"--BB\r\nContent-Disposition: form-data; name=\"pic\"; \
            filename=\"a.bin\"\r\nContent-Type: application/octet-stream\r\n\r\n\
            \x00\x01\x02\x03\r\n--BB--\r\n";
        let envs = env(&[
            ("REQUEST_METHOD", "POST"),
            ("CONTENT_TYPE", "multipart/form-data; boundary=BB"),
            ("CONTENT_LENGTH", &body.len().to_string()),
        ]);
        let req = round_trip(&envs, body);

        assert_eq!(req.fields.len(), 1);
        let f = &req.fields[0];
        assert_eq!(f.key, "pic");
        assert_eq!(f.val, [0u8, 1, 2, 3]);
        assert_eq!(f.file.as_deref(), Some("a.bin"));
        assert_eq!(f.ctype.as_deref(), Some("application/octet-stream"));
        assert_eq!(f.ctypepos, 0);
        // Unregistered key: linear collection only, no bucket.
        assert_eq!(f.keypos, KEYS.len());
    }

    #[test]
    fn unrecognized_body_becomes_single_field() {
        let envs = env(&[
            ("REQUEST_METHOD", "PUT"),
            ("CONTENT_TYPE", "application/vnd.custom+json; charset=utf-8"),
            ("CONTENT_LENGTH", "9"),
        ]);
        let req = round_trip(&envs, b"{\"a\": 1}x");

        assert_eq!(req.fields.len(), 1);
        let f = &req.fields[0];
        assert_eq!(f.key, "");
        assert_eq!(f.val, b"{\"a\": 1}x");
        assert_eq!(
            f.ctype.as_deref(),
            Some("application/vnd.custom+json; charset=utf-8")
        );
        assert_eq!(f.ctypepos, MIMES.len());
    }

    #[test]
    fn buckets_split_valid_and_invalid() {
        let envs = env(&[
            ("REQUEST_METHOD", "GET"),
            ("QUERY_STRING", "n=1&n=x&n=2"),
        ]);
        let req = round_trip(&envs, b"");

        let valid: Vec<i64> = req.fields_for(2).map(|f| f.parsed_int().unwrap()).collect();
        assert_eq!(valid, [1, 2]);
        let invalid: Vec<&[u8]> = req.invalid_fields_for(2).map(|f| &f.val[..]).collect();
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0], b"x");
        // Disjointness: nothing is in both buckets.
        for f in req.fields_for(2) {
            assert_ne!(f.state, FieldState::Invalid);
        }
    }

    #[test]
    fn invalidate_moves_between_buckets() {
        let envs = env(&[("REQUEST_METHOD", "GET"), ("QUERY_STRING", "n=7")]);
        let mut req = round_trip(&envs, b"");

        assert!(req.field(2).is_some());
        req.invalidate(0);
        assert!(req.field(2).is_none());
        assert_eq!(req.invalid_fields_for(2).count(), 1);
        assert_eq!(req.fields[0].parsed, Parsed::None);
    }

    /// Shared memory sink for response-side tests.
    #[derive(Clone, Default)]
    struct Shared(Rc<RefCell<Vec<u8>>>);

    impl std::io::Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn with_output(req: &mut Request, sink: &Shared) {
        req.output = Some(Rc::new(RefCell::new(OutputData::cgi(
            Box::new(sink.clone()),
            8192,
        ))));
    }

    #[test]
    fn body_honors_accept_encoding() {
        let envs = env(&[
            ("REQUEST_METHOD", "GET"),
            ("HTTP_ACCEPT_ENCODING", "gzip"),
        ]);
        let mut req = round_trip(&envs, b"");
        let sink = Shared::default();
        with_output(&mut req, &sink);

        req.head("Status", "200 OK").unwrap();
        req.body().unwrap();
        req.puts("hello").unwrap();
        req.finish().unwrap();

        let raw = sink.0.borrow();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.contains("Content-Encoding: gzip\r\n"));
        // The body is a gzip stream, not the plain text.
        assert!(!text.ends_with("hello"));
    }

    #[test]
    fn zero_quality_disables_gzip() {
        let envs = env(&[
            ("REQUEST_METHOD", "GET"),
            ("HTTP_ACCEPT_ENCODING", "gzip;q=0"),
        ]);
        let mut req = round_trip(&envs, b"");
        let sink = Shared::default();
        with_output(&mut req, &sink);

        req.head("Status", "200 OK").unwrap();
        req.body().unwrap();
        req.puts("hello").unwrap();
        req.finish().unwrap();

        let raw = sink.0.borrow();
        let text = String::from_utf8_lossy(&raw);
        assert!(!text.contains("Content-Encoding"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn drop_without_finish_emits_nothing() {
        let envs = env(&[("REQUEST_METHOD", "GET")]);
        let mut req = round_trip(&envs, b"");
        let sink = Shared::default();
        with_output(&mut req, &sink);

        req.head("Status", "200 OK").unwrap();
        drop(req);
        assert!(sink.0.borrow().is_empty());
    }

    #[test]
    #[should_panic(expected = "writer requested after writer_disable")]
    fn writer_after_disable_aborts() {
        let envs = env(&[("REQUEST_METHOD", "GET")]);
        let mut req = round_trip(&envs, b"");
        let sink = Shared::default();
        with_output(&mut req, &sink);

        let w = req.writer();
        req.writer_disable();
        drop(w);
        let _ = req.writer();
    }

    #[test]
    fn outstanding_writer_survives_disable() {
        let envs = env(&[("REQUEST_METHOD", "GET")]);
        let mut req = round_trip(&envs, b"");
        let sink = Shared::default();
        with_output(&mut req, &sink);

        req.body().unwrap();
        let w = req.writer();
        req.writer_disable();
        w.puts("still here").unwrap();
        req.finish().unwrap();
        assert!(sink.0.borrow().ends_with(b"still here"));
    }

    #[test]
    fn resolve_page_and_mime() {
        let envs = env(&[("REQUEST_METHOD", "GET"), ("PATH_INFO", "/about.json")]);
        let mut req = round_trip(&envs, b"");

        req.resolve(&["index", "about"], 0, &[("json", 4)], 1, 9);
        assert_eq!(req.page, 1);
        assert_eq!(req.mime, 4);

        // Unknown page and suffix fall off the ends of the tables.
        req.pagename = "nowhere".into();
        req.suffix = "weird".into();
        req.resolve(&["index", "about"], 0, &[("json", 4)], 1, 9);
        assert_eq!(req.page, 2);
        assert_eq!(req.mime, 9);
    }
}
